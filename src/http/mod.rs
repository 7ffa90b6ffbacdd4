//! HTTP route handlers (spec.md §6): thin `actix-web` wrappers that pull
//! `Claims`/path/query/body out of the request and call straight into
//! `core::universe`/`core::game`/`core::chat`, translating their `Result`
//! into `HttpResponse` the way the teacher's `game/lobby.rs`/`player.rs`
//! handlers do.

pub mod game;
pub mod oauth;
pub mod user;
pub mod world;

use actix_web::{get, web, HttpResponse};

#[get("/liveness")]
pub async fn liveness() -> HttpResponse {
    HttpResponse::Ok().finish()
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(liveness)
        .service(oauth::login)
        .service(oauth::login_callback)
        .service(oauth::logout)
        .service(oauth::test_login)
        .service(
            web::scope("/world")
                .service(world::create_world)
                .service(world::get_worlds)
                .service(world::get_world)
                .service(world::update_world)
                .service(world::delete_world)
                .service(world::copy_world),
        )
        .service(
            web::scope("/game")
                .service(game::create_game)
                .service(game::get_games)
                .service(game::get_game_by_code)
                .service(game::join_game_by_code)
                .service(game::get_game)
                .service(game::update_game)
                .service(game::set_ready)
                .service(game::join_game)
                .service(game::leave_game)
                .service(game::kick_player)
                .service(game::promote_player)
                .service(game::start_game)
                .service(game::restart_game)
                .service(game::get_state)
                .service(game::get_chat_segment)
                .service(game::send_chat_message)
                .service(web::resource("/{id}/ws").to(crate::ws::session::entrypoint)),
        )
        .service(
            web::scope("/user")
                .service(user::get_me)
                .service(user::get_user),
        );
}
