//! `Universe`: process-scoped registry of live `GameSystem`s plus world
//! and game creation/read queries (spec.md §4.4). Grounded on the
//! teacher's `game/global.rs` (the single process-wide game registry) and
//! `lobby.rs` (code generation, world/game listing). The Universe↔GameSystem
//! cycle spec.md §9 calls out is broken the way it suggests: GameSystem
//! never holds a handle back to Universe, it only emits events upward
//! through a pipe Universe itself installs.

use crate::core::game::{GameEvent, GameSystem};
use crate::core::models::{Game, GameId, GamePlayer, GameStatus, User, UserId, World, WorldId};
use crate::core::system::{spawn_pipe, PipeFailure, SystemCore};
use crate::lib::error::{Code, ServerError};
use crate::lib::pagination::{Paginator, SortDirection};
use crate::lib::time::Time;
use crate::lib::Result;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum UniverseEvent {
    UniverseNewWorldEvent { world: World },
    UniverseWorldUpdateEvent { world: World },
    UniverseGameEvent { inner: GameEvent },
    PipeFailure { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

pub struct Universe {
    core: SystemCore<UniverseEvent>,
    db_pool: PgPool,
    kick_grace: Duration,
    games: Mutex<HashMap<GameId, Arc<GameSystem>>>,
}

impl Universe {
    pub fn new(db_pool: PgPool, kick_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            core: SystemCore::new("universe", uuid::Uuid::new_v4()),
            db_pool,
            kick_grace,
            games: Mutex::new(HashMap::new()),
        })
    }

    pub fn listen(&self) -> std::result::Result<tokio::sync::mpsc::UnboundedReceiver<UniverseEvent>, &'static str> {
        self.core.listen()
    }

    fn pipe_game_events(self: &Arc<Self>, game: &Arc<GameSystem>) {
        let me = Arc::clone(self);
        let me_fail = Arc::clone(self);
        let mut rx = match game.listen() {
            Ok(rx) => rx,
            Err(_) => return,
        };
        let fut = async move {
            while let Some(inner) = rx.recv().await {
                me.core.emit(UniverseEvent::UniverseGameEvent { inner });
            }
            Ok(())
        };
        spawn_pipe(&self.core, fut, move |PipeFailure(message)| {
            me_fail.core.emit(UniverseEvent::PipeFailure { message })
        });
    }

    /// Loads a game's row and roster and builds/registers a `GameSystem`
    /// for it, wiring its event pipe. Does not check whether one is
    /// already registered; callers go through `get_or_load_game`.
    async fn load_game(self: &Arc<Self>, game: &Game) -> Result<Arc<GameSystem>> {
        let mut conn = self.db_pool.acquire().await.map_err(ServerError::from)?;
        let players = GamePlayer::find_by_game(game.id, &mut *conn).await?;
        let system = GameSystem::create_new(&mut conn, game, players, self.db_pool.clone(), self.kick_grace).await?;
        self.pipe_game_events(&system);

        let mut games = self.games.lock().await;
        games.insert(game.id, Arc::clone(&system));
        Ok(system)
    }

    /// Returns the live `GameSystem` for `game_id`, loading it from the
    /// database on first access (spec.md §3: "Universe ... creates them on
    /// first access after load from the database").
    pub async fn get_or_load_game(self: &Arc<Self>, game_id: GameId) -> Result<Arc<GameSystem>> {
        if let Some(system) = self.games.lock().await.get(&game_id) {
            return Ok(Arc::clone(system));
        }
        let game = Game::find(game_id, &self.db_pool).await?;
        self.load_game(&game).await
    }

    pub async fn create_world(
        &self,
        conn: &mut sqlx::PgConnection,
        name: String,
        owner_id: UserId,
        public: bool,
        description: Option<String>,
        data: Option<Value>,
    ) -> Result<World> {
        let now = Time::now();
        let world = World {
            id: WorldId::new(),
            name,
            owner_id,
            public,
            description,
            data: data.unwrap_or_else(|| json!({ "initialState": {} })),
            created_at: now,
            last_updated_at: now,
            deleted: false,
        };
        world.insert(conn).await?;
        self.core.emit(UniverseEvent::UniverseNewWorldEvent { world: world.clone() });
        Ok(world)
    }

    pub async fn update_world(&self, conn: &mut sqlx::PgConnection, world: World) -> Result<World> {
        let affected = world.update(conn).await?;
        ServerError::expect_one_row(affected, "world update")?;
        self.core.emit(UniverseEvent::UniverseWorldUpdateEvent { world: world.clone() });
        Ok(world)
    }

    pub async fn delete_world(&self, conn: &mut sqlx::PgConnection, world_id: WorldId, requester_id: UserId) -> Result<()> {
        let mut world = World::find(world_id, false, &self.db_pool).await?;
        if world.owner_id != requester_id {
            return Err(ServerError::domain(Code::Unauthorized, "only the owner may delete this world"));
        }
        world.deleted = true;
        self.update_world(conn, world).await?;
        Ok(())
    }

    /// Copies a world's contents into a new world owned by `requester_id`
    /// (spec.md §6: `POST /world/{id}/copy`).
    pub async fn copy_world(&self, conn: &mut sqlx::PgConnection, world_id: WorldId, requester_id: UserId) -> Result<World> {
        let source = self.get_world(world_id, Some(requester_id)).await?;
        let now = Time::now();
        let world = World {
            id: WorldId::new(),
            name: format!("{} (copy)", source.name),
            owner_id: requester_id,
            public: false,
            description: source.description.clone(),
            data: source.data.clone(),
            created_at: now,
            last_updated_at: now,
            deleted: false,
        };
        world.insert(conn).await?;
        self.core.emit(UniverseEvent::UniverseNewWorldEvent { world: world.clone() });
        Ok(world)
    }

    /// Generates a random 4-char uppercase alphanumeric code and creates a
    /// game in a serializable transaction, retrying on collision (and
    /// failing `ServerError` on `DeadlockDetected`, per spec.md §4.4).
    pub async fn create_game(
        self: &Arc<Self>,
        host_id: UserId,
        world_id: WorldId,
        name: String,
        public: bool,
        max_players: i32,
    ) -> Result<Arc<GameSystem>> {
        let world = World::find(world_id, false, &self.db_pool).await?;

        const MAX_ATTEMPTS: u32 = 20;
        let mut tx = self.db_pool.begin().await.map_err(ServerError::from)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut tx)
            .await
            .map_err(ServerError::from)?;

        let mut code = crate::core::models::generate_game_code();
        let mut attempts = 0;
        loop {
            if Game::code_is_free(&code, &mut tx).await? {
                break;
            }
            attempts += 1;
            if attempts >= MAX_ATTEMPTS {
                return Err(ServerError::Internal("exhausted attempts generating a unique game code".into()));
            }
            code = crate::core::models::generate_game_code();
        }

        let game = Game {
            id: GameId::new(),
            code,
            world_id,
            host_id,
            name,
            public,
            max_players,
            status: GameStatus::Waiting,
            created_at: Time::now(),
            state: world.initial_state(),
        };
        game.insert(&mut tx).await?;

        let host_row = GamePlayer { game_id: game.id, user_id: host_id, is_ready: false, is_spectator: false, is_joined: true, joined_at: Time::now() };
        host_row.insert(&mut tx).await?;

        tx.commit().await.map_err(ServerError::from)?;

        self.load_game(&game).await
    }

    /// Stops every registered `GameSystem` (in-memory teardown only, per
    /// `GameSystem::stop`'s contract) before stopping its own core.
    pub async fn stop(&self) {
        let games: Vec<Arc<GameSystem>> = self.games.lock().await.values().cloned().collect();
        for game in games {
            game.stop().await;
        }
        self.core.stop().await;
    }

    pub async fn get_worlds(&self, requester_id: Option<UserId>, paginator: Paginator, sort: SortDirection) -> Result<Page<World>> {
        let direction = sort.as_sql();
        let query = format!(
            "SELECT * FROM worlds WHERE deleted = false AND (public = true OR owner_id = $1) \
             ORDER BY created_at {} LIMIT $2 OFFSET $3",
            direction
        );
        let items: Vec<World> = sqlx::query_as(&query)
            .bind(requester_id.map(uuid::Uuid::from))
            .bind(paginator.limit)
            .bind(paginator.offset())
            .fetch_all(&self.db_pool)
            .await
            .map_err(ServerError::from)?;

        let count_row = sqlx::query("SELECT count(*) AS n FROM worlds WHERE deleted = false AND (public = true OR owner_id = $1)")
            .bind(requester_id.map(uuid::Uuid::from))
            .fetch_one(&self.db_pool)
            .await
            .map_err(ServerError::from)?;
        let total: i64 = count_row.try_get("n").map_err(ServerError::from)?;

        Ok(Page { items, total })
    }

    pub async fn get_world(&self, id: WorldId, requester_id: Option<UserId>) -> Result<World> {
        let world = World::find(id, false, &self.db_pool).await?;
        if !world.public && Some(world.owner_id) != requester_id {
            return Err(ServerError::domain(Code::WorldNotFound, "world is not visible to this requester"));
        }
        Ok(world)
    }

    pub async fn get_games(
        &self,
        requester_id: Option<UserId>,
        include_archived: bool,
        paginator: Paginator,
        sort: SortDirection,
    ) -> Result<Page<Game>> {
        let direction = sort.as_sql();
        let status_clause = if include_archived { "true" } else { "g.status != 'archived'" };
        let query = format!(
            "SELECT g.* FROM games g WHERE {} AND (g.public = true OR g.host_id = $1 \
             OR EXISTS (SELECT 1 FROM game_players p WHERE p.game_id = g.id AND p.user_id = $1)) \
             ORDER BY g.created_at {} LIMIT $2 OFFSET $3",
            status_clause, direction
        );
        let items: Vec<Game> = sqlx::query_as(&query)
            .bind(requester_id.map(uuid::Uuid::from))
            .bind(paginator.limit)
            .bind(paginator.offset())
            .fetch_all(&self.db_pool)
            .await
            .map_err(ServerError::from)?;

        let count_query = format!(
            "SELECT count(*) AS n FROM games g WHERE {} AND (g.public = true OR g.host_id = $1 \
             OR EXISTS (SELECT 1 FROM game_players p WHERE p.game_id = g.id AND p.user_id = $1))",
            status_clause
        );
        let count_row = sqlx::query(&count_query)
            .bind(requester_id.map(uuid::Uuid::from))
            .fetch_one(&self.db_pool)
            .await
            .map_err(ServerError::from)?;
        let total: i64 = count_row.try_get("n").map_err(ServerError::from)?;

        Ok(Page { items, total })
    }

    pub async fn get_game(&self, id: GameId, requester_id: Option<UserId>) -> Result<Game> {
        let game = Game::find(id, &self.db_pool).await?;
        self.check_game_visible(&game, requester_id).await?;
        Ok(game)
    }

    pub async fn get_game_by_code(&self, code: &str, requester_id: Option<UserId>) -> Result<Game> {
        let game = Game::find_by_code(code, &self.db_pool).await?;
        self.check_game_visible(&game, requester_id).await?;
        Ok(game)
    }

    async fn check_game_visible(&self, game: &Game, requester_id: Option<UserId>) -> Result<()> {
        if game.public || Some(game.host_id) == requester_id {
            return Ok(());
        }
        if let Some(requester_id) = requester_id {
            if GamePlayer::find(game.id, requester_id, &self.db_pool).await.is_ok() {
                return Ok(());
            }
        }
        Err(ServerError::domain(Code::GameNotFound, "game is not visible to this requester"))
    }

    pub async fn get_user(&self, id: UserId, deleted_ok: bool) -> Result<User> {
        User::find(id, deleted_ok, &self.db_pool).await
    }

    pub fn db_pool(&self) -> &PgPool {
        &self.db_pool
    }

    /// Creates a new game seeded from the same world as a finished one,
    /// auto-joining its prior non-host players (spec.md §6: `POST
    /// /game/{id}/restart`).
    pub async fn restart_game(self: &Arc<Self>, requester_id: UserId, game_id: GameId) -> Result<Arc<GameSystem>> {
        let old_game = Game::find(game_id, &self.db_pool).await?;
        if old_game.host_id != requester_id {
            return Err(ServerError::domain(Code::NotHost, "requester is not the host"));
        }
        if old_game.status != GameStatus::Finished {
            return Err(ServerError::domain(Code::GameNotFinished, "game is not finished"));
        }
        let prior_players = GamePlayer::find_by_game(game_id, &mut *self.db_pool.acquire().await.map_err(ServerError::from)?).await?;

        let new_game = self
            .create_game(requester_id, old_game.world_id, old_game.name.clone(), old_game.public, old_game.max_players)
            .await?;

        let mut conn = self.db_pool.acquire().await.map_err(ServerError::from)?;
        for player in prior_players {
            if player.user_id == requester_id {
                continue;
            }
            new_game.connect_player(&mut conn, player.user_id).await?;
        }
        Ok(new_game)
    }
}
