//! Row-mapped entities for the data model in spec.md §3: `User`, `World`,
//! `Game`, `GamePlayer`, `Chat`, `Message`. Every CRUD helper here follows
//! the teacher's convention (`FromRow` impls in `game/game.rs`/`lobby.rs`,
//! `Executor<Database = Postgres>`-generic `insert`/`update`/`remove`, a
//! `find` that turns `RowNotFound` into a typed not-found error via
//! `ServerError::not_found_or_server_error`).

use crate::lib::error::{Code, Entity, ServerError};
use crate::lib::time::Time;
use crate::lib::uuid::Uuid as Id;
use crate::lib::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgQueryAs, PgRow};
use sqlx::{Executor, FromRow, PgPool, Postgres, Row};

pub type UserId = Id<User>;
pub type WorldId = Id<World>;
pub type GameId = Id<Game>;
pub type ChatId = Id<Chat>;

// ---------------------------------------------------------------- User ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub created_at: Time,
    pub deleted: bool,
}

impl Entity for User {
    const ETYPE: &'static str = "user";
    const NOT_FOUND: Code = Code::UserNotFound;
}

impl<'a> FromRow<'a, PgRow<'a>> for User {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(User {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            created_at: row.try_get("created_at")?,
            deleted: row.try_get("deleted")?,
        })
    }
}

impl User {
    pub async fn find(id: UserId, deleted_ok: bool, db_pool: &PgPool) -> Result<Self> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(uuid::Uuid::from(id))
            .fetch_one(db_pool)
            .await
            .map_err(ServerError::not_found_or_server_error(Code::UserNotFound))?;
        if user.deleted && !deleted_ok {
            return Err(ServerError::domain(Code::UserNotFound, "user was deleted"));
        }
        Ok(user)
    }
}

// --------------------------------------------------------------- World ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct World {
    pub id: WorldId,
    pub name: String,
    pub owner_id: UserId,
    pub public: bool,
    pub description: Option<String>,
    pub data: Value,
    pub created_at: Time,
    pub last_updated_at: Time,
    pub deleted: bool,
}

impl Entity for World {
    const ETYPE: &'static str = "world";
    const NOT_FOUND: Code = Code::WorldNotFound;
}

impl<'a> FromRow<'a, PgRow<'a>> for World {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(World {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner_id: row.try_get("owner_id")?,
            public: row.try_get("public")?,
            description: row.try_get("description")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
            deleted: row.try_get("deleted")?,
        })
    }
}

impl World {
    /// The seed for a game created from this world: `data.initialState`,
    /// defaulting to an empty object when the world carries none.
    pub fn initial_state(&self) -> Value {
        self.data
            .get("initialState")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }

    pub async fn find(id: WorldId, deleted_ok: bool, db_pool: &PgPool) -> Result<Self> {
        let world: World = sqlx::query_as("SELECT * FROM worlds WHERE id = $1")
            .bind(uuid::Uuid::from(id))
            .fetch_one(db_pool)
            .await
            .map_err(ServerError::not_found_or_server_error(Code::WorldNotFound))?;
        if world.deleted && !deleted_ok {
            return Err(ServerError::domain(Code::WorldNotFound, "world was deleted"));
        }
        Ok(world)
    }

    pub async fn insert<E>(&self, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query(
            "INSERT INTO worlds(id, name, owner_id, public, description, data, created_at, last_updated_at, deleted) \
             VALUES($1, $2, $3, $4, $5, $6, $7, $8, false)",
        )
        .bind(uuid::Uuid::from(self.id))
        .bind(&self.name)
        .bind(uuid::Uuid::from(self.owner_id))
        .bind(self.public)
        .bind(&self.description)
        .bind(&self.data)
        .bind(self.created_at)
        .bind(self.last_updated_at)
        .execute(&mut *exec)
        .await
        .map_err(ServerError::from)
    }

    pub async fn update<E>(&self, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query(
            "UPDATE worlds SET name = $2, public = $3, description = $4, data = $5, \
             last_updated_at = $6, deleted = $7 WHERE id = $1",
        )
        .bind(uuid::Uuid::from(self.id))
        .bind(&self.name)
        .bind(self.public)
        .bind(&self.description)
        .bind(&self.data)
        .bind(self.last_updated_at)
        .bind(self.deleted)
        .execute(&mut *exec)
        .await
        .map_err(ServerError::from)
    }
}

// ---------------------------------------------------------------- Game ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename = "VARCHAR")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Waiting,
    Playing,
    Finished,
    Archived,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Game {
    pub id: GameId,
    pub code: String,
    pub world_id: WorldId,
    pub host_id: UserId,
    pub name: String,
    pub public: bool,
    pub max_players: i32,
    pub status: GameStatus,
    pub created_at: Time,
    pub state: Value,
}

impl Entity for Game {
    const ETYPE: &'static str = "game";
    const NOT_FOUND: Code = Code::GameNotFound;
}

impl<'a> FromRow<'a, PgRow<'a>> for Game {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Game {
            id: row.try_get("id")?,
            code: row.try_get("code")?,
            world_id: row.try_get("world_id")?,
            host_id: row.try_get("host_id")?,
            name: row.try_get("name")?,
            public: row.try_get("public")?,
            max_players: row.try_get("max_players")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            state: row.try_get("state")?,
        })
    }
}

/// A random 4-character uppercase alphanumeric code, as spec.md §4.4
/// requires for `create_game`. Regenerated by the caller on collision.
pub fn generate_game_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..4).map(|_| ALPHABET[rng.gen_range(0, ALPHABET.len())] as char).collect()
}

impl Game {
    pub async fn find(id: GameId, db_pool: &PgPool) -> Result<Self> {
        sqlx::query_as("SELECT * FROM games WHERE id = $1")
            .bind(uuid::Uuid::from(id))
            .fetch_one(db_pool)
            .await
            .map_err(ServerError::not_found_or_server_error(Code::GameNotFound))
    }

    pub async fn find_by_code(code: &str, db_pool: &PgPool) -> Result<Self> {
        sqlx::query_as("SELECT * FROM games WHERE code = $1 AND status != 'archived'")
            .bind(code)
            .fetch_one(db_pool)
            .await
            .map_err(ServerError::not_found_or_server_error(Code::GameNotFound))
    }

    /// True when `code` is free among every non-archived game, the
    /// uniqueness rule spec.md §3/§4.4 requires.
    pub async fn code_is_free<E>(code: &str, exec: &mut E) -> Result<bool>
    where
        E: Executor<Database = Postgres>,
    {
        let row = sqlx::query("SELECT count(*) AS n FROM games WHERE code = $1 AND status != 'archived'")
            .bind(code)
            .fetch_one(&mut *exec)
            .await
            .map_err(ServerError::from)?;
        let n: i64 = row.try_get("n").map_err(ServerError::from)?;
        Ok(n == 0)
    }

    pub async fn insert<E>(&self, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query(
            "INSERT INTO games(id, code, world_id, host_id, name, public, max_players, status, created_at, state) \
             VALUES($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(uuid::Uuid::from(self.id))
        .bind(&self.code)
        .bind(uuid::Uuid::from(self.world_id))
        .bind(uuid::Uuid::from(self.host_id))
        .bind(&self.name)
        .bind(self.public)
        .bind(self.max_players)
        .bind(self.status)
        .bind(self.created_at)
        .bind(&self.state)
        .execute(&mut *exec)
        .await
        .map_err(ServerError::from)
    }

    pub async fn update<E>(&self, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query(
            "UPDATE games SET host_id = $2, name = $3, public = $4, max_players = $5, \
             status = $6, state = $7 WHERE id = $1",
        )
        .bind(uuid::Uuid::from(self.id))
        .bind(uuid::Uuid::from(self.host_id))
        .bind(&self.name)
        .bind(self.public)
        .bind(self.max_players)
        .bind(self.status)
        .bind(&self.state)
        .execute(&mut *exec)
        .await
        .map_err(ServerError::from)
    }
}

// ----------------------------------------------------------- GamePlayer ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GamePlayer {
    pub game_id: GameId,
    pub user_id: UserId,
    pub is_ready: bool,
    pub is_spectator: bool,
    pub is_joined: bool,
    pub joined_at: Time,
}

impl<'a> FromRow<'a, PgRow<'a>> for GamePlayer {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(GamePlayer {
            game_id: row.try_get("game_id")?,
            user_id: row.try_get("user_id")?,
            is_ready: row.try_get("is_ready")?,
            is_spectator: row.try_get("is_spectator")?,
            is_joined: row.try_get("is_joined")?,
            joined_at: row.try_get("joined_at")?,
        })
    }
}

impl GamePlayer {
    pub async fn find(game_id: GameId, user_id: UserId, db_pool: &PgPool) -> Result<Self> {
        sqlx::query_as("SELECT * FROM game_players WHERE game_id = $1 AND user_id = $2")
            .bind(uuid::Uuid::from(game_id))
            .bind(uuid::Uuid::from(user_id))
            .fetch_one(db_pool)
            .await
            .map_err(ServerError::not_found_or_server_error(Code::PlayerNotFound))
    }

    pub async fn find_by_game<E>(game_id: GameId, exec: &mut E) -> Result<Vec<Self>>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query_as("SELECT * FROM game_players WHERE game_id = $1 ORDER BY joined_at ASC")
            .bind(uuid::Uuid::from(game_id))
            .fetch_all(&mut *exec)
            .await
            .map_err(ServerError::from)
    }

    pub async fn insert<E>(&self, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query(
            "INSERT INTO game_players(game_id, user_id, is_ready, is_spectator, is_joined, joined_at) \
             VALUES($1, $2, $3, $4, $5, $6)",
        )
        .bind(uuid::Uuid::from(self.game_id))
        .bind(uuid::Uuid::from(self.user_id))
        .bind(self.is_ready)
        .bind(self.is_spectator)
        .bind(self.is_joined)
        .bind(self.joined_at)
        .execute(&mut *exec)
        .await
        .map_err(ServerError::from)
    }

    pub async fn update<E>(&self, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query(
            "UPDATE game_players SET is_ready = $3, is_spectator = $4, is_joined = $5 \
             WHERE game_id = $1 AND user_id = $2",
        )
        .bind(uuid::Uuid::from(self.game_id))
        .bind(uuid::Uuid::from(self.user_id))
        .bind(self.is_ready)
        .bind(self.is_spectator)
        .bind(self.is_joined)
        .execute(&mut *exec)
        .await
        .map_err(ServerError::from)
    }

    pub async fn remove<E>(game_id: GameId, user_id: UserId, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query("DELETE FROM game_players WHERE game_id = $1 AND user_id = $2")
            .bind(uuid::Uuid::from(game_id))
            .bind(uuid::Uuid::from(user_id))
            .execute(&mut *exec)
            .await
            .map_err(ServerError::from)
    }
}

// --------------------------------------------------------------- Chat ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename = "VARCHAR")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Room,
    CharacterCreation,
    Game,
    Advice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename = "VARCHAR")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    Readonly,
    Foreign,
    Full,
    Timed,
    ForeignTimed,
}

impl InterfaceType {
    /// Whether a joined, non-restricted sender may post. `Readonly` and
    /// `Foreign` never accept sender-authored posts (foreign channels are
    /// written to by the system on the sender's behalf elsewhere).
    pub const fn is_writable(self) -> bool {
        matches!(self, InterfaceType::Full | InterfaceType::Timed)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Chat {
    pub id: ChatId,
    pub game_id: GameId,
    pub chat_type: ChatType,
    pub owner_id: Option<UserId>,
    pub interface_type: InterfaceType,
    pub deadline: Option<Time>,
}

impl Entity for Chat {
    const ETYPE: &'static str = "chat";
    const NOT_FOUND: Code = Code::ChatNotFound;
}

impl<'a> FromRow<'a, PgRow<'a>> for Chat {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Chat {
            id: row.try_get("id")?,
            game_id: row.try_get("game_id")?,
            chat_type: row.try_get("chat_type")?,
            owner_id: row.try_get("owner_id")?,
            interface_type: row.try_get("interface_type")?,
            deadline: row.try_get("deadline")?,
        })
    }
}

impl Chat {
    pub async fn find_by_triple<E>(
        game_id: GameId,
        chat_type: ChatType,
        owner_id: Option<UserId>,
        exec: &mut E,
    ) -> Result<Option<Self>>
    where
        E: Executor<Database = Postgres>,
    {
        let chat: Option<Chat> = sqlx::query_as(
            "SELECT * FROM chats WHERE game_id = $1 AND chat_type = $2 \
             AND owner_id IS NOT DISTINCT FROM $3",
        )
        .bind(uuid::Uuid::from(game_id))
        .bind(chat_type)
        .bind(owner_id.map(uuid::Uuid::from))
        .fetch_optional(&mut *exec)
        .await
        .map_err(ServerError::from)?;
        Ok(chat)
    }

    pub async fn find<E>(id: ChatId, exec: &mut E) -> Result<Self>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query_as("SELECT * FROM chats WHERE id = $1")
            .bind(uuid::Uuid::from(id))
            .fetch_one(&mut *exec)
            .await
            .map_err(ServerError::not_found_or_server_error(Code::ChatNotFound))
    }

    pub async fn insert<E>(&self, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query(
            "INSERT INTO chats(id, game_id, chat_type, owner_id, interface_type, deadline) \
             VALUES($1, $2, $3, $4, $5, $6)",
        )
        .bind(uuid::Uuid::from(self.id))
        .bind(uuid::Uuid::from(self.game_id))
        .bind(self.chat_type)
        .bind(self.owner_id.map(uuid::Uuid::from))
        .bind(self.interface_type)
        .bind(self.deadline)
        .execute(&mut *exec)
        .await
        .map_err(ServerError::from)
    }
}

// ------------------------------------------------------------ Message ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename = "VARCHAR")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Player,
    System,
    CharacterCreation,
    GeneralInfo,
    PublicInfo,
    PrivateInfo,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Message {
    pub id: i64,
    pub chat_id: ChatId,
    pub sender_id: Option<UserId>,
    pub kind: MessageKind,
    pub text: String,
    pub special: Option<Value>,
    pub metadata: Option<Value>,
    pub sent_at: Time,
}

impl<'a> FromRow<'a, PgRow<'a>> for Message {
    fn from_row(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Message {
            id: row.try_get("id")?,
            chat_id: row.try_get("chat_id")?,
            sender_id: row.try_get("sender_id")?,
            kind: row.try_get("kind")?,
            text: row.try_get("text")?,
            special: row.try_get("special")?,
            metadata: row.try_get("metadata")?,
            sent_at: row.try_get("sent_at")?,
        })
    }
}

impl Entity for Message {
    const ETYPE: &'static str = "message";
    const NOT_FOUND: Code = Code::MessageNotFound;
}

impl Message {
    pub async fn find_by_chat<E>(chat_id: ChatId, exec: &mut E) -> Result<Vec<Self>>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query_as("SELECT * FROM messages WHERE chat_id = $1 ORDER BY id ASC")
            .bind(uuid::Uuid::from(chat_id))
            .fetch_all(&mut *exec)
            .await
            .map_err(ServerError::from)
    }

    /// Inserts the row and returns the generated monotonic id, mirroring
    /// the teacher's `RETURNING`-based inserts.
    pub async fn insert<E>(&self, exec: &mut E) -> Result<i64>
    where
        E: Executor<Database = Postgres>,
    {
        let row = sqlx::query(
            "INSERT INTO messages(chat_id, sender_id, kind, text, special, metadata, sent_at) \
             VALUES($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(uuid::Uuid::from(self.chat_id))
        .bind(self.sender_id.map(uuid::Uuid::from))
        .bind(self.kind)
        .bind(&self.text)
        .bind(&self.special)
        .bind(&self.metadata)
        .bind(self.sent_at)
        .fetch_one(&mut *exec)
        .await
        .map_err(ServerError::from)?;
        row.try_get("id").map_err(ServerError::from)
    }

    pub async fn update<E>(&self, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query("UPDATE messages SET text = $2, special = $3, metadata = $4 WHERE id = $1")
            .bind(self.id)
            .bind(&self.text)
            .bind(&self.special)
            .bind(&self.metadata)
            .execute(&mut *exec)
            .await
            .map_err(ServerError::from)
    }

    pub async fn remove<E>(id: i64, exec: &mut E) -> Result<u64>
    where
        E: Executor<Database = Postgres>,
    {
        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(&mut *exec)
            .await
            .map_err(ServerError::from)
    }
}
