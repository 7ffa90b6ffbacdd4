use crate::core::models::{UserId, World, WorldId};
use crate::core::state::state;
use crate::lib::auth::Claims;
use crate::lib::pagination::{new_paginated_response, Paginator, SortDirection};
use crate::lib::Result;
use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(flatten)]
    pub paginator: Paginator,
    #[serde(default)]
    pub sort: SortDirection,
}

#[derive(Deserialize)]
pub struct CreateWorld {
    pub name: String,
    #[serde(default)]
    pub public: bool,
    pub description: Option<String>,
    pub data: Option<Value>,
}

#[derive(Deserialize)]
pub struct UpdateWorld {
    pub name: String,
    pub public: bool,
    pub description: Option<String>,
    pub data: Value,
}

#[post("/")]
pub async fn create_world(claims: Claims, body: web::Json<CreateWorld>) -> Result<HttpResponse> {
    let state = state();
    let mut conn = state.db_pool.acquire().await.map_err(crate::lib::error::ServerError::from)?;
    let body = body.into_inner();
    let world = state
        .universe
        .create_world(&mut conn, body.name, claims.user_id, body.public, body.description, body.data)
        .await?;
    Ok(HttpResponse::Created().json(world))
}

#[get("/")]
pub async fn get_worlds(claims: Option<Claims>, query: web::Query<ListQuery>) -> Result<HttpResponse> {
    let state = state();
    let requester_id: Option<UserId> = claims.map(|c| c.user_id);
    let page = state.universe.get_worlds(requester_id, query.paginator, query.sort).await?;
    Ok(new_paginated_response(query.paginator.limit, query.paginator.page, page.total, page.items))
}

#[get("/{id}")]
pub async fn get_world(claims: Option<Claims>, path: web::Path<(WorldId,)>) -> Result<HttpResponse> {
    let state = state();
    let world = state.universe.get_world(path.0, claims.map(|c| c.user_id)).await?;
    Ok(HttpResponse::Ok().json(world))
}

#[put("/{id}")]
pub async fn update_world(claims: Claims, path: web::Path<(WorldId,)>, body: web::Json<UpdateWorld>) -> Result<HttpResponse> {
    let state = state();
    let existing = state.universe.get_world(path.0, Some(claims.user_id)).await?;
    if existing.owner_id != claims.user_id {
        return Err(crate::lib::error::ServerError::domain(crate::lib::error::Code::Unauthorized, "only the owner may update this world"));
    }
    let body = body.into_inner();
    let world = World {
        last_updated_at: crate::lib::time::Time::now(),
        name: body.name,
        public: body.public,
        description: body.description,
        data: body.data,
        ..existing
    };
    let mut conn = state.db_pool.acquire().await.map_err(crate::lib::error::ServerError::from)?;
    let world = state.universe.update_world(&mut conn, world).await?;
    Ok(HttpResponse::Ok().json(world))
}

#[delete("/{id}")]
pub async fn delete_world(claims: Claims, path: web::Path<(WorldId,)>) -> Result<HttpResponse> {
    let state = state();
    let mut conn = state.db_pool.acquire().await.map_err(crate::lib::error::ServerError::from)?;
    state.universe.delete_world(&mut conn, path.0, claims.user_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/{id}/copy")]
pub async fn copy_world(claims: Claims, path: web::Path<(WorldId,)>) -> Result<HttpResponse> {
    let state = state();
    let mut conn = state.db_pool.acquire().await.map_err(crate::lib::error::ServerError::from)?;
    let world = state.universe.copy_world(&mut conn, path.0, claims.user_id).await?;
    Ok(HttpResponse::Created().json(world))
}
