//! `GameSystem`: the state machine of one game session (spec.md §4.3).
//! Grounded on the teacher's `game/game/server.rs` (`GameServer` owning a
//! player map, a named-task table, and per-entity chat wiring), with the
//! reentrant-locking requirement resolved the way spec.md §9 suggests:
//! public methods acquire `state` once and release it before awaiting any
//! nested command, instead of a task-id-tracking reentrant mutex. No
//! method holds the lock across a call into another public/private
//! command method of the same GameSystem.

use crate::core::chat::{ChatEvent, ChatSegmentOut, ChatSystem, MessageOutWithNeighbors};
use crate::core::models::{
    ChatId, ChatType, Game, GameId, GamePlayer, GameStatus, InterfaceType, MessageKind, UserId, WorldId,
};
use crate::core::system::{spawn_pipe, PipeFailure, SystemCore};
use crate::lib::error::{Code, ServerError};
use crate::lib::time::Time;
use crate::lib::Result;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum GameEvent {
    GameStatusEvent { game_id: GameId, status: GameStatus },
    GameSettingsUpdateEvent { game_id: GameId, name: String, public: bool, max_players: i32 },
    GameChatEvent { game_id: GameId, chat_id: ChatId, owner_id: Option<UserId>, inner: ChatEvent },
    PlayerJoinedEvent { game_id: GameId, player_id: UserId, is_spectator: bool },
    PlayerLeftEvent { game_id: GameId, player_id: UserId },
    PlayerKickedEvent { game_id: GameId, player_id: UserId, by: UserId },
    PlayerPromotedEvent { game_id: GameId, old_host_id: UserId, new_host_id: UserId },
    PlayerReadyEvent { game_id: GameId, player_id: UserId, ready: bool },
    PlayerSpectatorEvent { game_id: GameId, player_id: UserId, is_spectator: bool },
    PipeFailure { message: String },
}

#[derive(Clone)]
struct PlayerChats {
    character_creation: Arc<ChatSystem>,
    game: Arc<ChatSystem>,
    advice: Arc<ChatSystem>,
}

struct PlayerEntry {
    is_ready: bool,
    is_spectator: bool,
    is_joined: bool,
    joined_at: Time,
    chats: Option<PlayerChats>,
}

struct GameState {
    code: String,
    world_id: WorldId,
    host_id: UserId,
    name: String,
    public: bool,
    max_players: i32,
    status: GameStatus,
    created_at: Time,
    game_state: Value,
    players: HashMap<UserId, PlayerEntry>,
    room_chat: Arc<ChatSystem>,
    kick_tasks: HashMap<UserId, JoinHandle<()>>,
    game_loop: Option<JoinHandle<()>>,
    terminating: bool,
}

impl GameState {
    fn num_non_spectators(&self) -> i32 {
        self.players.values().filter(|p| p.is_joined && !p.is_spectator).count() as i32
    }

    fn to_row(&self, id: GameId) -> Game {
        Game {
            id,
            code: self.code.clone(),
            world_id: self.world_id,
            host_id: self.host_id,
            name: self.name.clone(),
            public: self.public,
            max_players: self.max_players,
            status: self.status,
            created_at: self.created_at,
            state: self.game_state.clone(),
        }
    }
}

impl GameEvent {
    /// Every variant but `PipeFailure` carries the owning game's id; the
    /// WebSocketController uses this to route the event to the right
    /// connection bucket (spec.md §4.5).
    pub fn game_id(&self) -> Option<GameId> {
        use GameEvent::*;
        match self {
            GameStatusEvent { game_id, .. }
            | GameSettingsUpdateEvent { game_id, .. }
            | GameChatEvent { game_id, .. }
            | PlayerJoinedEvent { game_id, .. }
            | PlayerLeftEvent { game_id, .. }
            | PlayerKickedEvent { game_id, .. }
            | PlayerPromotedEvent { game_id, .. }
            | PlayerReadyEvent { game_id, .. }
            | PlayerSpectatorEvent { game_id, .. } => Some(*game_id),
            PipeFailure { .. } => None,
        }
    }
}

/// Whether `game_state.characters[user_id]` is present, the narrow typed
/// slice of the free-form `state` blob this core needs (spec.md §9).
fn character_exists(game_state: &Value, user_id: UserId) -> bool {
    let key = uuid::Uuid::from(user_id).to_string();
    game_state.get("characters").and_then(|c| c.get(&key)).is_some()
}

#[derive(Debug, Clone, Serialize)]
pub struct GameStateOut {
    pub game_id: GameId,
    pub status: GameStatus,
    pub host_id: UserId,
    pub players: Vec<GamePlayer>,
    pub room: ChatSegmentOut,
    pub character_creation: Option<ChatSegmentOut>,
    pub player_chats: Vec<PlayerChatOut>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerChatOut {
    pub user_id: UserId,
    pub game: ChatSegmentOut,
    pub advice: ChatSegmentOut,
}

const STATE_MESSAGE_WINDOW: i64 = 50;

pub struct GameSystem {
    pub id: GameId,
    core: SystemCore<GameEvent>,
    state: Mutex<GameState>,
    db_pool: PgPool,
    kick_grace: Duration,
}

impl GameSystem {
    pub async fn create_new(
        conn: &mut PgConnection,
        game: &Game,
        players: Vec<GamePlayer>,
        db_pool: PgPool,
        kick_grace: Duration,
    ) -> Result<Arc<Self>> {
        let room_chat = Arc::new(ChatSystem::create_or_load(conn, game.id, ChatType::Room, None, InterfaceType::Full).await?);

        let mut player_map = HashMap::new();
        for p in players {
            player_map.insert(
                p.user_id,
                PlayerEntry {
                    is_ready: p.is_ready,
                    is_spectator: p.is_spectator,
                    is_joined: p.is_joined,
                    joined_at: p.joined_at,
                    chats: None,
                },
            );
        }

        let state = GameState {
            code: game.code.clone(),
            world_id: game.world_id,
            host_id: game.host_id,
            name: game.name.clone(),
            public: game.public,
            max_players: game.max_players,
            status: game.status,
            created_at: game.created_at,
            game_state: game.state.clone(),
            players: player_map,
            room_chat: Arc::clone(&room_chat),
            kick_tasks: HashMap::new(),
            game_loop: None,
            terminating: false,
        };

        let system = Arc::new(Self {
            id: game.id,
            core: SystemCore::new("game", game.id.into()),
            state: Mutex::new(state),
            db_pool,
            kick_grace,
        });

        system.pipe_chat_events(room_chat, None);

        let non_spectators: Vec<UserId> = {
            let guard = system.state.lock().await;
            guard.players.iter().filter(|(_, p)| p.is_joined && !p.is_spectator).map(|(id, _)| *id).collect()
        };
        for user_id in non_spectators {
            system.update_chats_for_player(conn, user_id, false).await?;
        }

        system.core.emit(GameEvent::GameStatusEvent { game_id: system.id, status: game.status });

        Ok(system)
    }

    fn pipe_chat_events(self: &Arc<Self>, chat: Arc<ChatSystem>, owner_id: Option<UserId>) {
        let me = Arc::clone(self);
        let me_fail = Arc::clone(self);
        let game_id = self.id;
        let chat_id = chat.id;
        let mut rx = match chat.listen() {
            Ok(rx) => rx,
            Err(_) => return,
        };
        let fut = async move {
            while let Some(inner) = rx.recv().await {
                me.core.emit(GameEvent::GameChatEvent { game_id, chat_id, owner_id, inner });
            }
            Ok(())
        };
        spawn_pipe(&self.core, fut, move |PipeFailure(message)| {
            me_fail.core.emit(GameEvent::PipeFailure { message })
        });
    }

    async fn update_chats_for_player(self: &Arc<Self>, conn: &mut PgConnection, user_id: UserId, is_spectator: bool) -> Result<()> {
        if is_spectator {
            let chats = {
                let mut guard = self.state.lock().await;
                guard.players.get_mut(&user_id).and_then(|p| p.chats.take())
            };
            if let Some(chats) = chats {
                chats.character_creation.stop().await;
                chats.game.stop().await;
                chats.advice.stop().await;
            }
            return Ok(());
        }

        let already = {
            let guard = self.state.lock().await;
            guard.players.get(&user_id).map(|p| p.chats.is_some()).unwrap_or(false)
        };
        if already {
            return Ok(());
        }

        let character_creation =
            Arc::new(ChatSystem::create_or_load(conn, self.id, ChatType::CharacterCreation, Some(user_id), InterfaceType::Full).await?);
        let game = Arc::new(ChatSystem::create_or_load(conn, self.id, ChatType::Game, Some(user_id), InterfaceType::Full).await?);
        let advice = Arc::new(ChatSystem::create_or_load(conn, self.id, ChatType::Advice, Some(user_id), InterfaceType::Readonly).await?);

        self.pipe_chat_events(Arc::clone(&character_creation), Some(user_id));
        self.pipe_chat_events(Arc::clone(&game), Some(user_id));
        self.pipe_chat_events(Arc::clone(&advice), Some(user_id));

        let mut guard = self.state.lock().await;
        if let Some(entry) = guard.players.get_mut(&user_id) {
            entry.chats = Some(PlayerChats { character_creation, game, advice });
        }
        Ok(())
    }

    async fn find_chat(&self, chat_id: ChatId) -> Option<Arc<ChatSystem>> {
        let guard = self.state.lock().await;
        if guard.room_chat.id == chat_id {
            return Some(Arc::clone(&guard.room_chat));
        }
        for entry in guard.players.values() {
            if let Some(chats) = &entry.chats {
                for chat in [&chats.character_creation, &chats.game, &chats.advice] {
                    if chat.id == chat_id {
                        return Some(Arc::clone(chat));
                    }
                }
            }
        }
        None
    }

    pub async fn connect_player(self: &Arc<Self>, conn: &mut PgConnection, player_id: UserId) -> Result<()> {
        let mut guard = self.state.lock().await;

        if let Some(entry) = guard.players.get(&player_id) {
            if entry.is_joined {
                return Ok(());
            }
        }

        if let Some(task) = guard.kick_tasks.remove(&player_id) {
            task.abort();
        }

        let existed = guard.players.contains_key(&player_id);
        let is_spectator = if existed {
            guard.players[&player_id].is_spectator
        } else {
            guard.status != GameStatus::Waiting || guard.num_non_spectators() >= guard.max_players
        };

        if existed {
            let entry = guard.players.get_mut(&player_id).expect("checked above");
            entry.is_joined = true;
            let affected = GamePlayer {
                game_id: self.id,
                user_id: player_id,
                is_ready: entry.is_ready,
                is_spectator: entry.is_spectator,
                is_joined: true,
                joined_at: entry.joined_at,
            }
            .update(conn)
            .await?;
            ServerError::expect_one_row(affected, "game player reconnect update")?;
        } else {
            let joined_at = Time::now();
            GamePlayer { game_id: self.id, user_id: player_id, is_ready: false, is_spectator, is_joined: true, joined_at }
                .insert(conn)
                .await?;
            guard
                .players
                .insert(player_id, PlayerEntry { is_ready: false, is_spectator, is_joined: true, joined_at, chats: None });
        }

        drop(guard);
        self.update_chats_for_player(conn, player_id, is_spectator).await?;
        self.core.emit(GameEvent::PlayerJoinedEvent { game_id: self.id, player_id, is_spectator });
        Ok(())
    }

    async fn update_player_joined_flag(&self, conn: &mut PgConnection, player_id: UserId, is_joined: bool) -> Result<()> {
        let guard = self.state.lock().await;
        let entry = guard
            .players
            .get(&player_id)
            .ok_or_else(|| ServerError::domain(Code::PlayerNotInGame, "player not in game"))?;
        let row = GamePlayer {
            game_id: self.id,
            user_id: player_id,
            is_ready: entry.is_ready,
            is_spectator: entry.is_spectator,
            is_joined,
            joined_at: entry.joined_at,
        };
        drop(guard);
        let affected = row.update(conn).await?;
        ServerError::expect_one_row(affected, "game player joined-flag update")?;
        Ok(())
    }

    async fn remove_player(self: &Arc<Self>, conn: &mut PgConnection, player_id: UserId) -> Result<()> {
        let affected = GamePlayer::remove(self.id, player_id, conn).await?;
        ServerError::expect_one_row(affected, "game player delete")?;
        self.update_chats_for_player(conn, player_id, true).await?;
        let mut guard = self.state.lock().await;
        guard.players.remove(&player_id);
        guard.kick_tasks.remove(&player_id);
        Ok(())
    }

    /// Runs the grace-period kick: removes the player row, then promotes a
    /// new host or terminates the game if that leaves the roster empty or
    /// hostless. Invoked either immediately (`kick_immediately`) or from a
    /// spawned task after `kick_grace` has elapsed uncancelled.
    async fn kick_player(self: &Arc<Self>, player_id: UserId) -> Result<()> {
        let mut conn = self.db_pool.acquire().await.map_err(ServerError::from)?;

        {
            let mut guard = self.state.lock().await;
            guard.kick_tasks.remove(&player_id);
            if !guard.players.contains_key(&player_id) {
                return Ok(());
            }
        }

        self.remove_player(&mut conn, player_id).await?;

        let (roster_empty, host_id) = {
            let guard = self.state.lock().await;
            (guard.players.is_empty(), guard.host_id)
        };

        if roster_empty {
            self.terminate(&mut conn).await?;
            return Ok(());
        }

        if host_id == player_id {
            let next_host = {
                let guard = self.state.lock().await;
                guard.players.iter().filter(|(_, p)| p.is_joined).map(|(id, _)| *id).next()
            };
            match next_host {
                Some(new_host) => self.promote_host(&mut conn, host_id, new_host).await?,
                None => self.terminate(&mut conn).await?,
            }
        }

        Ok(())
    }

    async fn promote_host(&self, conn: &mut PgConnection, old_host_id: UserId, new_host_id: UserId) -> Result<()> {
        let mut guard = self.state.lock().await;
        guard.host_id = new_host_id;
        let row = guard.to_row(self.id);
        drop(guard);

        let affected = row.update(conn).await?;
        ServerError::expect_one_row(affected, "game host promotion")?;
        self.core.emit(GameEvent::PlayerPromotedEvent { game_id: self.id, old_host_id, new_host_id });
        Ok(())
    }

    /// Only the host or the player themself may disconnect a player.
    /// Spectators are removed immediately; joined players are marked not
    /// joined and a grace-period kick is scheduled unless
    /// `kick_immediately` is set.
    pub async fn disconnect_player(
        self: &Arc<Self>,
        conn: &mut PgConnection,
        player_id: UserId,
        kick_immediately: bool,
        requester_id: Option<UserId>,
    ) -> Result<()> {
        // A host disconnecting someone other than themself is a kick
        // (spec.md §9's documented host-initiated flavor); everything
        // else — self-leave, or an internal/trusted call with no
        // requester, such as the grace-period timer — is a plain leave.
        let by_host = matches!(requester_id, Some(requester) if requester != player_id);

        let is_spectator = {
            let guard = self.state.lock().await;
            if let Some(requester) = requester_id {
                if requester != player_id && requester != guard.host_id {
                    return Err(ServerError::domain(Code::Unauthorized, "only the host or the player may disconnect this player"));
                }
            }
            match guard.players.get(&player_id) {
                Some(entry) => entry.is_spectator,
                None => return Ok(()),
            }
        };

        let emit_departure = |by: Option<UserId>| {
            if by_host {
                self.core.emit(GameEvent::PlayerKickedEvent { game_id: self.id, player_id, by: by.expect("by_host implies Some") });
            } else {
                self.core.emit(GameEvent::PlayerLeftEvent { game_id: self.id, player_id });
            }
        };

        if is_spectator {
            self.remove_player(conn, player_id).await?;
            emit_departure(requester_id);
            return Ok(());
        }

        {
            let mut guard = self.state.lock().await;
            if let Some(entry) = guard.players.get_mut(&player_id) {
                entry.is_joined = false;
            }
            if let Some(task) = guard.kick_tasks.remove(&player_id) {
                task.abort();
            }
        }
        self.update_player_joined_flag(conn, player_id, false).await?;
        emit_departure(requester_id);

        if kick_immediately {
            self.kick_player(player_id).await?;
        } else {
            let me = Arc::clone(self);
            let grace = self.kick_grace;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                let _ = me.kick_player(player_id).await;
            });
            let mut guard = self.state.lock().await;
            guard.kick_tasks.insert(player_id, handle);
        }

        Ok(())
    }

    pub async fn make_spectator(
        self: &Arc<Self>,
        conn: &mut PgConnection,
        player_id: UserId,
        spectate: bool,
        requester_id: Option<UserId>,
    ) -> Result<()> {
        {
            let guard = self.state.lock().await;
            if let Some(requester) = requester_id {
                if requester != player_id && requester != guard.host_id {
                    return Err(ServerError::domain(Code::Unauthorized, "only the host or the player may change spectator status"));
                }
            }
            if !spectate {
                let entry = guard
                    .players
                    .get(&player_id)
                    .ok_or_else(|| ServerError::domain(Code::PlayerNotInGame, "player not in game"))?;
                if entry.is_spectator && guard.num_non_spectators() >= guard.max_players {
                    return Err(ServerError::domain(Code::GameFull, "game is full"));
                }
            }
        }

        {
            let mut guard = self.state.lock().await;
            let entry = guard
                .players
                .get_mut(&player_id)
                .ok_or_else(|| ServerError::domain(Code::PlayerNotInGame, "player not in game"))?;
            entry.is_spectator = spectate;
            let row = GamePlayer {
                game_id: self.id,
                user_id: player_id,
                is_ready: entry.is_ready,
                is_spectator: spectate,
                is_joined: entry.is_joined,
                joined_at: entry.joined_at,
            };
            drop(guard);
            let affected = row.update(conn).await?;
            ServerError::expect_one_row(affected, "game player spectator update")?;
        }

        self.update_chats_for_player(conn, player_id, spectate).await?;
        self.core.emit(GameEvent::PlayerSpectatorEvent { game_id: self.id, player_id, is_spectator: spectate });
        Ok(())
    }

    pub async fn make_host(self: &Arc<Self>, conn: &mut PgConnection, new_host_id: UserId, requester_id: Option<UserId>) -> Result<()> {
        let old_host_id = {
            let guard = self.state.lock().await;
            if let Some(requester) = requester_id {
                if requester != guard.host_id {
                    return Err(ServerError::domain(Code::NotHost, "requester is not the host"));
                }
            }
            if !guard.players.contains_key(&new_host_id) {
                return Err(ServerError::domain(Code::GameNewHostNotFound, "new host is not in the roster"));
            }
            guard.host_id
        };

        self.promote_host(conn, old_host_id, new_host_id).await
    }

    pub async fn update_settings(
        self: &Arc<Self>,
        conn: &mut PgConnection,
        public: Option<bool>,
        name: Option<String>,
        max_players: Option<i32>,
        requester_id: Option<UserId>,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        if let Some(requester) = requester_id {
            if requester != guard.host_id {
                return Err(ServerError::domain(Code::NotHost, "requester is not the host"));
            }
        }
        if guard.status != GameStatus::Waiting {
            return Err(ServerError::domain(Code::GameAlreadyStarted, "settings can only change while waiting"));
        }
        if let Some(max_players) = max_players {
            if max_players < guard.num_non_spectators() {
                return Err(ServerError::domain(Code::GameMaxPlayersTooSmall, "max_players is below the current non-spectator count"));
            }
            guard.max_players = max_players;
        }
        if let Some(public) = public {
            guard.public = public;
        }
        if let Some(name) = name {
            guard.name = name;
        }
        let row = guard.to_row(self.id);
        let (name, public, max_players) = (guard.name.clone(), guard.public, guard.max_players);
        drop(guard);

        let affected = row.update(conn).await?;
        ServerError::expect_one_row(affected, "game settings update")?;
        self.core.emit(GameEvent::GameSettingsUpdateEvent { game_id: self.id, name, public, max_players });
        Ok(())
    }

    pub async fn set_ready(self: &Arc<Self>, conn: &mut PgConnection, user_id: UserId, ready: bool) -> Result<()> {
        let (needs_notice, notice_chat) = {
            let guard = self.state.lock().await;
            let entry = guard
                .players
                .get(&user_id)
                .ok_or_else(|| ServerError::domain(Code::PlayerNotInGame, "player not in game"))?;
            if entry.is_spectator || !entry.is_joined {
                return Err(ServerError::domain(Code::PlayerNotInGame, "spectators cannot ready up"));
            }
            if ready && !character_exists(&guard.game_state, user_id) {
                let chat_id = entry.chats.as_ref().map(|c| c.character_creation.id);
                (true, chat_id)
            } else {
                (false, None)
            }
        };

        if needs_notice {
            if let Some(chat_id) = notice_chat {
                if let Some(chat) = self.find_chat(chat_id).await {
                    let _ = chat
                        .send_message(
                            conn,
                            MessageKind::System,
                            "a character must be created before you can ready up".into(),
                            None,
                            None,
                            None,
                            None,
                        )
                        .await;
                }
            }
            return Err(ServerError::domain(Code::CharacterNotReady, "character has not been created yet"));
        }

        let mut guard = self.state.lock().await;
        let entry = guard.players.get_mut(&user_id).expect("checked above");
        entry.is_ready = ready;
        let row = GamePlayer {
            game_id: self.id,
            user_id,
            is_ready: ready,
            is_spectator: entry.is_spectator,
            is_joined: entry.is_joined,
            joined_at: entry.joined_at,
        };
        drop(guard);

        let affected = row.update(conn).await?;
        ServerError::expect_one_row(affected, "game player ready update")?;
        self.core.emit(GameEvent::PlayerReadyEvent { game_id: self.id, player_id: user_id, ready });
        Ok(())
    }

    pub async fn start_game(self: &Arc<Self>, conn: &mut PgConnection, force: bool, requester_id: Option<UserId>) -> Result<()> {
        let not_ready: Vec<UserId> = {
            let guard = self.state.lock().await;
            if let Some(requester) = requester_id {
                if requester != guard.host_id {
                    return Err(ServerError::domain(Code::NotHost, "requester is not the host"));
                }
            }
            if guard.status != GameStatus::Waiting {
                return Err(ServerError::domain(Code::GameAlreadyStarted, "game already started"));
            }
            guard
                .players
                .iter()
                .filter(|(_, p)| p.is_joined && !p.is_spectator && !p.is_ready)
                .map(|(id, _)| *id)
                .collect()
        };

        if !not_ready.is_empty() {
            if !force {
                return Err(ServerError::with_details(
                    Code::PlayerNotReady,
                    "not every player is ready",
                    json!({ "playerIds": not_ready }),
                ));
            }
            for player_id in &not_ready {
                self.make_spectator(conn, *player_id, true, None).await?;
            }
        }

        let mut guard = self.state.lock().await;
        guard.status = GameStatus::Playing;
        let row = guard.to_row(self.id);
        drop(guard);

        let affected = row.update(conn).await?;
        ServerError::expect_one_row(affected, "game status update to playing")?;
        self.core.emit(GameEvent::GameStatusEvent { game_id: self.id, status: GameStatus::Playing });
        Ok(())
    }

    /// The playing → finished transition is driven by game-loop logic this
    /// core does not implement (spec.md §9's open question); this is the
    /// narrow seam an external driver calls once it decides the game is
    /// over.
    pub async fn finish_game(self: &Arc<Self>, conn: &mut PgConnection) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.status != GameStatus::Playing {
            return Err(ServerError::domain(Code::GameAlreadyStarted, "game is not playing"));
        }
        guard.status = GameStatus::Finished;
        let row = guard.to_row(self.id);
        drop(guard);

        let affected = row.update(conn).await?;
        ServerError::expect_one_row(affected, "game status update to finished")?;
        self.core.emit(GameEvent::GameStatusEvent { game_id: self.id, status: GameStatus::Finished });
        Ok(())
    }

    /// Idempotent. Disconnects every joined player (cascading through the
    /// normal kick path) before marking the game archived.
    pub async fn terminate(self: &Arc<Self>, conn: &mut PgConnection) -> Result<()> {
        {
            let mut guard = self.state.lock().await;
            if guard.status == GameStatus::Archived || guard.terminating {
                return Ok(());
            }
            guard.terminating = true;
        }

        let game_loop = {
            let mut guard = self.state.lock().await;
            guard.game_loop.take()
        };
        if let Some(handle) = game_loop {
            handle.abort();
        }

        let joined: Vec<UserId> = {
            let guard = self.state.lock().await;
            guard.players.iter().filter(|(_, p)| p.is_joined).map(|(id, _)| *id).collect()
        };
        for player_id in joined {
            self.disconnect_player(conn, player_id, true, None).await?;
        }

        let mut guard = self.state.lock().await;
        guard.status = GameStatus::Archived;
        let row = guard.to_row(self.id);
        drop(guard);

        let affected = row.update(conn).await?;
        ServerError::expect_one_row(affected, "game status update to archived")?;
        self.core.emit(GameEvent::GameStatusEvent { game_id: self.id, status: GameStatus::Archived });
        self.stop().await;
        Ok(())
    }

    /// Tears down in-memory resources (game loop, chats, the event core)
    /// without touching the database. Used both by `terminate` and by
    /// `Universe::stop` on process shutdown, where archiving every live
    /// game would be wrong.
    pub async fn stop(&self) {
        let mut guard = self.state.lock().await;
        if let Some(handle) = guard.game_loop.take() {
            handle.abort();
        }
        let room_chat = Arc::clone(&guard.room_chat);
        let player_chats: Vec<PlayerChats> = guard.players.values().filter_map(|p| p.chats.clone()).collect();
        drop(guard);

        room_chat.stop().await;
        for chats in player_chats {
            chats.character_creation.stop().await;
            chats.game.stop().await;
            chats.advice.stop().await;
        }
        self.core.stop().await;
    }

    pub fn listen(&self) -> std::result::Result<tokio::sync::mpsc::UnboundedReceiver<GameEvent>, &'static str> {
        self.core.listen()
    }

    pub async fn get_state(&self, requester_id: UserId) -> Result<GameStateOut> {
        let (status, host_id, room_chat, requester_chats, non_spectator_chats) = {
            let guard = self.state.lock().await;
            if !guard.players.get(&requester_id).map(|p| p.is_joined).unwrap_or(false) {
                return Err(ServerError::domain(Code::PlayerNotInGame, "requester is not in this game"));
            }
            let requester_chats = guard.players.get(&requester_id).and_then(|p| p.chats.clone());
            let non_spectator_chats: Vec<(UserId, PlayerChats)> = if guard.status != GameStatus::Waiting {
                guard
                    .players
                    .iter()
                    .filter(|(_, p)| !p.is_spectator)
                    .filter_map(|(id, p)| p.chats.clone().map(|c| (*id, c)))
                    .collect()
            } else {
                Vec::new()
            };
            (guard.status, guard.host_id, Arc::clone(&guard.room_chat), requester_chats, non_spectator_chats)
        };

        let room = room_chat.get_messages(STATE_MESSAGE_WINDOW, None, None).await?;

        let character_creation = match requester_chats {
            Some(chats) => Some(chats.character_creation.get_messages(STATE_MESSAGE_WINDOW, None, None).await?),
            None => None,
        };

        let mut player_chats = Vec::new();
        for (user_id, chats) in non_spectator_chats {
            let game = chats.game.get_messages(STATE_MESSAGE_WINDOW, None, None).await?;
            let advice = chats.advice.get_messages(STATE_MESSAGE_WINDOW, None, None).await?;
            player_chats.push(PlayerChatOut { user_id, game, advice });
        }

        let players = {
            let guard = self.state.lock().await;
            guard
                .players
                .iter()
                .map(|(id, p)| GamePlayer {
                    game_id: self.id,
                    user_id: *id,
                    is_ready: p.is_ready,
                    is_spectator: p.is_spectator,
                    is_joined: p.is_joined,
                    joined_at: p.joined_at,
                })
                .collect()
        };

        Ok(GameStateOut { game_id: self.id, status, host_id, players, room, character_creation, player_chats })
    }

    pub async fn send_message(
        self: &Arc<Self>,
        conn: &mut PgConnection,
        sender_id: UserId,
        chat_id: ChatId,
        text: String,
        special: Option<Value>,
        metadata: Option<Value>,
    ) -> Result<MessageOutWithNeighbors> {
        let (chat, owner_id, host_id) = {
            let guard = self.state.lock().await;

            if !guard.players.get(&sender_id).map(|p| p.is_joined).unwrap_or(false) {
                return Err(ServerError::domain(Code::PlayerNotInGame, "sender is not a joined player"));
            }

            if guard.room_chat.id == chat_id {
                (Arc::clone(&guard.room_chat), None, guard.host_id)
            } else {
                let found = guard.players.iter().find_map(|(uid, p)| {
                    p.chats.as_ref().and_then(|c| {
                        [&c.character_creation, &c.game, &c.advice]
                            .into_iter()
                            .find(|chat| chat.id == chat_id)
                            .map(|chat| (*uid, Arc::clone(chat)))
                    })
                });
                match found {
                    Some((owner_id, chat)) => (chat, Some(owner_id), guard.host_id),
                    None => return Err(ServerError::domain(Code::ChatNotFound, "chat does not belong to this game")),
                }
            }
        };

        if let Some(owner_id) = owner_id {
            if owner_id != sender_id && host_id != sender_id {
                return Err(ServerError::domain(Code::CannotAccessChat, "chat is restricted to its owner or the host"));
            }
        }
        if !chat.interface_type.is_writable() {
            return Err(ServerError::domain(Code::CannotAccessChat, "chat is not writable"));
        }

        chat.send_message(conn, MessageKind::Player, text, Some(sender_id), special, metadata, None).await
    }

    pub async fn get_chat_segment(
        &self,
        requester_id: UserId,
        chat_id: ChatId,
        limit: i64,
        before: Option<i64>,
        after: Option<i64>,
    ) -> Result<ChatSegmentOut> {
        let (chat, owner_id, host_id) = {
            let guard = self.state.lock().await;
            if !guard.players.contains_key(&requester_id) {
                return Err(ServerError::domain(Code::PlayerNotInGame, "requester is not in this game"));
            }
            if guard.room_chat.id == chat_id {
                (Arc::clone(&guard.room_chat), None, guard.host_id)
            } else {
                let found = guard.players.iter().find_map(|(uid, p)| {
                    p.chats.as_ref().and_then(|c| {
                        [&c.character_creation, &c.game, &c.advice]
                            .into_iter()
                            .find(|chat| chat.id == chat_id)
                            .map(|chat| (*uid, Arc::clone(chat)))
                    })
                });
                match found {
                    Some((owner_id, chat)) => (chat, Some(owner_id), guard.host_id),
                    None => return Err(ServerError::domain(Code::ChatNotFound, "chat does not belong to this game")),
                }
            }
        };

        if let Some(owner_id) = owner_id {
            if owner_id != requester_id && host_id != requester_id {
                return Err(ServerError::domain(Code::CannotAccessChat, "chat is restricted to its owner or the host"));
            }
        }

        chat.get_messages(limit, before, after).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_exists_checks_characters_map_by_user_id() {
        let user_id = UserId::new();
        let key = uuid::Uuid::from(user_id).to_string();
        let state = json!({ "characters": { key: { "name": "Astrid" } } });
        assert!(character_exists(&state, user_id));
        assert!(!character_exists(&json!({}), user_id));
        assert!(!character_exists(&json!({ "characters": {} }), user_id));
    }

    #[test]
    fn every_routable_event_carries_its_game_id() {
        let game_id = GameId::new();
        let player_id = UserId::new();
        let events = vec![
            GameEvent::GameStatusEvent { game_id, status: GameStatus::Waiting },
            GameEvent::PlayerJoinedEvent { game_id, player_id, is_spectator: false },
            GameEvent::PlayerLeftEvent { game_id, player_id },
            GameEvent::PlayerKickedEvent { game_id, player_id, by: UserId::new() },
        ];
        for event in events {
            assert_eq!(event.game_id(), Some(game_id));
        }
    }

    #[test]
    fn pipe_failure_has_no_routable_game_id() {
        assert_eq!(GameEvent::PipeFailure { message: "boom".into() }.game_id(), None);
    }
}
