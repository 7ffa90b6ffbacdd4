//! `AppState`/Lifespan wiring (spec.md §2.6): owns the database pool, the
//! Universe and the WebSocketController for the process lifetime.
//! Grounded on the teacher's `game/global.rs` process-global `AppState`
//! (`SyncOnceCell`-backed `state()` accessor, `FromRequest` impl for
//! `&'static AppState`), generalized from per-resource `RwLock<HashMap>`
//! fields to the two System-level aggregates this core defines.

use crate::core::universe::Universe;
use crate::lib::config::Config;
use crate::lib::sync::SyncOnceCell;
use crate::ws::controller::WebSocketController;
use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use sqlx::PgPool;
use std::sync::Arc;

pub struct AppState {
    pub db_pool: PgPool,
    pub config: Config,
    pub universe: Arc<Universe>,
    pub ws_controller: Arc<WebSocketController>,
}

impl AppState {
    pub fn new(db_pool: PgPool, config: Config) -> Self {
        let universe = Universe::new(db_pool.clone(), config.kick_grace);
        let ws_controller = WebSocketController::new(Arc::clone(&universe), config.disconnect_timeout);
        Self { db_pool, config, universe, ws_controller }
    }

    /// Stops the Universe (which stops every live GameSystem) and its
    /// WebSocketController, in that order, matching `Universe::stop`'s
    /// contract that owned resources are torn down before their observers.
    pub async fn shutdown(&self) {
        self.ws_controller.stop().await;
        self.universe.stop().await;
    }
}

static STATE: SyncOnceCell<AppState> = SyncOnceCell::new();

pub fn init(state: AppState) {
    STATE.set(state)
}

pub fn state() -> &'static AppState {
    STATE.get().expect("AppState was not initialized")
}

impl FromRequest for &'static AppState {
    type Error = ();
    type Future = Ready<std::result::Result<&'static AppState, ()>>;
    type Config = ();

    fn from_request(_req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Ok(state()))
    }
}
