//! Thin OAuth surface (spec.md §1: "external collaborators, not redesigned
//! here" — this crate owns session JWTs, not the OAuth dance itself).
//! Grounded on the teacher's `game/player.rs` `login()`, which mints a JWT
//! directly rather than verifying a real credential; `test_login` keeps
//! that shape for local/dev use, while `login`/`login_callback` stand in
//! for a real provider redirect/exchange.

use crate::core::models::User;
use crate::core::state::state;
use crate::lib::auth::{create_jwt, Claims};
use crate::lib::error::ServerError;
use crate::lib::time::Time;
use crate::lib::Result;
use actix_web::{get, http::header, web, HttpResponse};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct LoginQuery {
    pub provider: Option<String>,
}

#[derive(Serialize)]
struct TokenResponse {
    token: String,
}

fn issue_token(user_id: crate::core::models::UserId) -> Result<HttpResponse> {
    let config = &state().config;
    let claims = Claims { user_id, exp: (Time::now().0 + chrono::Duration::days(30)).timestamp() as usize };
    let token = create_jwt(claims, &config.jwt_secret).map_err(ServerError::from)?;
    Ok(HttpResponse::Ok().json(TokenResponse { token }))
}

/// Redirects to the configured OAuth provider's authorize endpoint. No
/// provider is wired up here; `oauth_client_id` is passed through as-is.
#[get("/login")]
pub async fn login(query: web::Query<LoginQuery>) -> HttpResponse {
    let config = &state().config;
    let provider = query.provider.clone().unwrap_or_else(|| "default".to_owned());
    HttpResponse::Found()
        .header(
            header::LOCATION,
            format!("{}/oauth/{}/authorize?client_id={}", config.self_url, provider, config.oauth_client_id),
        )
        .finish()
}

#[get("/login/callback/{provider}")]
pub async fn login_callback(path: web::Path<(String,)>) -> HttpResponse {
    let config = &state().config;
    let _provider = &path.0;
    HttpResponse::Found().header(header::LOCATION, config.frontend_url.clone()).finish()
}

#[get("/logout")]
pub async fn logout() -> HttpResponse {
    HttpResponse::Ok()
        .del_cookie(&actix_web::cookie::Cookie::named("session"))
        .finish()
}

/// Mints a session JWT for a fresh user without going through any
/// provider; exists purely for local development and integration tests.
#[get("/test-login")]
pub async fn test_login() -> Result<HttpResponse> {
    let state = state();
    let mut conn = state.db_pool.acquire().await.map_err(ServerError::from)?;
    let user = User {
        id: crate::core::models::UserId::new(),
        name: "test-user".to_owned(),
        email: None,
        created_at: Time::now(),
        deleted: false,
    };
    user.insert(&mut conn).await?;
    issue_token(user.id)
}
