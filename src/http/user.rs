use crate::core::state::state;
use crate::lib::auth::Claims;
use crate::lib::error::{Code, ServerError};
use crate::lib::Result;
use actix_web::{get, web, HttpResponse};

#[get("/me")]
pub async fn get_me(claims: Claims) -> Result<HttpResponse> {
    let user = state().universe.get_user(claims.user_id, false).await?;
    Ok(HttpResponse::Ok().json(user))
}

/// `id=0` is an alias for the caller's own id (spec.md §6), so this
/// extractor takes the raw path segment and only parses it as a UUID
/// once it isn't that sentinel.
#[get("/{id}")]
pub async fn get_user(claims: Claims, path: web::Path<(String,)>) -> Result<HttpResponse> {
    let user_id = if path.0 == "0" {
        claims.user_id
    } else {
        serde_json::from_value(serde_json::Value::String(path.0.clone()))
            .map_err(|_| ServerError::domain(Code::UserNotFound, "invalid user id"))?
    };
    let user = state().universe.get_user(user_id, false).await?;
    Ok(HttpResponse::Ok().json(user))
}
