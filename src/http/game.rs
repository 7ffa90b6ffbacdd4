use crate::core::chat::MessageOutWithNeighbors;
use crate::core::game::GameStateOut;
use crate::core::models::{ChatId, GameId, UserId, WorldId};
use crate::core::state::state;
use crate::lib::auth::Claims;
use crate::lib::error::ServerError;
use crate::lib::pagination::{new_paginated_response, Paginator, SortDirection};
use crate::lib::Result;
use actix_web::{get, post, put, web, HttpResponse};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(flatten)]
    pub paginator: Paginator,
    #[serde(default)]
    pub sort: SortDirection,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Deserialize)]
pub struct CreateGame {
    pub world_id: WorldId,
    pub name: String,
    #[serde(default)]
    pub public: bool,
    pub max_players: i32,
}

#[derive(Deserialize)]
pub struct UpdateGame {
    pub name: Option<String>,
    pub public: Option<bool>,
    pub max_players: Option<i32>,
    pub new_host_id: Option<UserId>,
}

#[derive(Deserialize)]
pub struct ReadyBody {
    #[serde(default = "default_true")]
    pub ready: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Deserialize)]
pub struct ChatSegmentQuery {
    #[serde(default = "default_chat_limit")]
    pub limit: i64,
    pub before: Option<i64>,
    pub after: Option<i64>,
}

fn default_chat_limit() -> i64 {
    50
}

#[derive(Deserialize)]
pub struct SendMessage {
    pub text: String,
    pub special: Option<Value>,
    pub metadata: Option<Value>,
}

#[post("/")]
pub async fn create_game(claims: Claims, body: web::Json<CreateGame>) -> Result<HttpResponse> {
    let state = state();
    let body = body.into_inner();
    let game = state
        .universe
        .create_game(claims.user_id, body.world_id, body.name, body.public, body.max_players)
        .await?;
    let out = state.universe.get_game(game.id, Some(claims.user_id)).await?;
    Ok(HttpResponse::Created().json(out))
}

#[get("/")]
pub async fn get_games(claims: Option<Claims>, query: web::Query<ListQuery>) -> Result<HttpResponse> {
    let state = state();
    let requester_id = claims.map(|c| c.user_id);
    let page = state
        .universe
        .get_games(requester_id, query.archived, query.paginator, query.sort)
        .await?;
    Ok(new_paginated_response(query.paginator.limit, query.paginator.page, page.total, page.items))
}

#[get("/{id}")]
pub async fn get_game(claims: Option<Claims>, path: web::Path<(GameId,)>) -> Result<HttpResponse> {
    let state = state();
    let game = state.universe.get_game(path.0, claims.map(|c| c.user_id)).await?;
    Ok(HttpResponse::Ok().json(game))
}

#[get("/code/{code}")]
pub async fn get_game_by_code(claims: Option<Claims>, path: web::Path<(String,)>) -> Result<HttpResponse> {
    let state = state();
    let game = state.universe.get_game_by_code(&path.0, claims.map(|c| c.user_id)).await?;
    Ok(HttpResponse::Ok().json(game))
}

#[post("/code/{code}/join")]
pub async fn join_game_by_code(claims: Claims, path: web::Path<(String,)>) -> Result<HttpResponse> {
    let state = state();
    let game = state.universe.get_game_by_code(&path.0, Some(claims.user_id)).await?;
    let system = state.universe.get_or_load_game(game.id).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    system.connect_player(&mut conn, claims.user_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[put("/{id}")]
pub async fn update_game(claims: Claims, path: web::Path<(GameId,)>, body: web::Json<UpdateGame>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    let body = body.into_inner();
    system.update_settings(&mut conn, body.public, body.name, body.max_players, Some(claims.user_id)).await?;
    if let Some(new_host_id) = body.new_host_id {
        system.make_host(&mut conn, new_host_id, Some(claims.user_id)).await?;
    }
    let game = state.universe.get_game(path.0, Some(claims.user_id)).await?;
    Ok(HttpResponse::Ok().json(game))
}

#[post("/{id}/ready")]
pub async fn set_ready(claims: Claims, path: web::Path<(GameId,)>, body: web::Json<ReadyBody>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    system.set_ready(&mut conn, claims.user_id, body.ready).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/{id}/join")]
pub async fn join_game(claims: Claims, path: web::Path<(GameId,)>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    system.connect_player(&mut conn, claims.user_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/{id}/leave")]
pub async fn leave_game(claims: Claims, path: web::Path<(GameId,)>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    system.disconnect_player(&mut conn, claims.user_id, false, Some(claims.user_id)).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Deserialize)]
pub struct PlayerTarget {
    pub player_id: UserId,
}

#[post("/{id}/kick")]
pub async fn kick_player(claims: Claims, path: web::Path<(GameId,)>, body: web::Json<PlayerTarget>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    system.disconnect_player(&mut conn, body.player_id, true, Some(claims.user_id)).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/{id}/promote")]
pub async fn promote_player(claims: Claims, path: web::Path<(GameId,)>, body: web::Json<PlayerTarget>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    system.make_host(&mut conn, body.player_id, Some(claims.user_id)).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/{id}/start")]
pub async fn start_game(claims: Claims, path: web::Path<(GameId,)>, query: web::Query<StartQuery>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    system.start_game(&mut conn, query.force, Some(claims.user_id)).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/{id}/restart")]
pub async fn restart_game(claims: Claims, path: web::Path<(GameId,)>) -> Result<HttpResponse> {
    let state = state();
    let new_game = state.universe.restart_game(claims.user_id, path.0).await?;
    let out = state.universe.get_game(new_game.id, Some(claims.user_id)).await?;
    Ok(HttpResponse::Created().json(out))
}

#[get("/{id}/state")]
pub async fn get_state(claims: Claims, path: web::Path<(GameId,)>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let out: GameStateOut = system.get_state(claims.user_id).await?;
    Ok(HttpResponse::Ok().json(out))
}

#[get("/{id}/chat/{chat_id}")]
pub async fn get_chat_segment(claims: Claims, path: web::Path<(GameId, ChatId)>, query: web::Query<ChatSegmentQuery>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let segment = system
        .get_chat_segment(claims.user_id, path.1, query.limit, query.before, query.after)
        .await?;
    Ok(HttpResponse::Ok().json(segment))
}

#[post("/{id}/chat/{chat_id}/send")]
pub async fn send_chat_message(claims: Claims, path: web::Path<(GameId, ChatId)>, body: web::Json<SendMessage>) -> Result<HttpResponse> {
    let state = state();
    let system = state.universe.get_or_load_game(path.0).await?;
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    let body = body.into_inner();
    let out: MessageOutWithNeighbors = system
        .send_message(&mut conn, claims.user_id, path.1, body.text, body.special, body.metadata)
        .await?;
    Ok(HttpResponse::Created().json(out))
}
