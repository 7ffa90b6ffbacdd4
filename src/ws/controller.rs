//! `WebSocketController`: fan-out from `Universe`'s event stream to live
//! `GameSession` connections, and presence/grace-period bookkeeping for
//! connects and disconnects (spec.md §4.5). Grounded on the teacher's
//! `ws/server.rs` (`GameServer`'s `sessions`/`rooms` maps and
//! connect/disconnect handling), adapted from actix messages into direct
//! async methods since this core has no mailbox of its own — it only
//! listens to `Universe` and pushes into `GameSession` addresses.
//!
//! Unlike `ChatSystem`/`GameSystem`/`Universe`, this is not itself a
//! `System`: it has no consumers of its own event stream, so it does not
//! embed a `SystemCore`. Its background pipe handle lives in a plain
//! `std::sync::Mutex` because the constructor is synchronous.

use crate::core::game::GameEvent;
use crate::core::models::{GameId, UserId};
use crate::core::universe::{Universe, UniverseEvent};
use crate::ws::protocol::to_frame;
use crate::ws::session::{CloseConnection, GameSession, SendFrame};
use actix::Addr;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct WebSocketController {
    universe: Arc<Universe>,
    disconnect_timeout: Duration,
    connections: Mutex<HashMap<GameId, HashMap<UserId, Addr<GameSession>>>>,
    pending_disconnect: Mutex<HashMap<(GameId, UserId), JoinHandle<()>>>,
    pipe: StdMutex<Option<JoinHandle<()>>>,
}

impl WebSocketController {
    pub fn new(universe: Arc<Universe>, disconnect_timeout: Duration) -> Arc<Self> {
        let controller = Arc::new(Self {
            universe,
            disconnect_timeout,
            connections: Mutex::new(HashMap::new()),
            pending_disconnect: Mutex::new(HashMap::new()),
            pipe: StdMutex::new(None),
        });

        let me = Arc::clone(&controller);
        let mut rx = match me.universe.listen() {
            Ok(rx) => rx,
            // `listen()` only fails if called twice on the same Universe;
            // AppState::new holds the only handle, so this never happens.
            Err(_) => return controller,
        };
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                me.handle_universe_event(event).await;
            }
        });
        *controller.pipe.lock().expect("controller pipe mutex poisoned") = Some(handle);

        controller
    }

    pub async fn stop(&self) {
        let handle = self.pipe.lock().expect("controller pipe mutex poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let pending: Vec<JoinHandle<()>> = self.pending_disconnect.lock().await.drain().map(|(_, h)| h).collect();
        for handle in pending {
            handle.abort();
        }
    }

    async fn handle_universe_event(&self, event: UniverseEvent) {
        if let UniverseEvent::UniverseGameEvent { inner } = event {
            self.fan_out_game_event(inner).await;
        }
        // UniverseNewWorldEvent/UniverseWorldUpdateEvent/PipeFailure have no
        // per-game connection bucket to fan out to (spec.md §6 scopes the
        // WS surface to a single game's connections).
    }

    async fn fan_out_game_event(&self, event: GameEvent) {
        let game_id = match event.game_id() {
            Some(id) => id,
            None => return,
        };

        // Departures purge the departing user's own connection before the
        // broadcast reaches everyone else (spec.md §4.5 fan-out rule).
        match &event {
            GameEvent::PlayerLeftEvent { player_id, .. } | GameEvent::PlayerKickedEvent { player_id, .. } => {
                self.close_connection(game_id, *player_id, 1000).await;
            }
            _ => {}
        }

        let frame = to_frame(&event);
        let recipients: Vec<Addr<GameSession>> = {
            let connections = self.connections.lock().await;
            match connections.get(&game_id) {
                Some(players) => players.values().cloned().collect(),
                None => Vec::new(),
            }
        };
        for addr in recipients {
            addr.do_send(SendFrame(frame.clone()));
        }

        if matches!(&event, GameEvent::GameStatusEvent { status, .. } if *status == crate::core::models::GameStatus::Archived) {
            self.connections.lock().await.remove(&game_id);
        }
    }

    async fn close_connection(&self, game_id: GameId, user_id: UserId, code: u16) {
        let addr = {
            let mut connections = self.connections.lock().await;
            connections.get_mut(&game_id).and_then(|players| players.remove(&user_id))
        };
        if let Some(addr) = addr {
            addr.do_send(CloseConnection(code));
        }
    }

    /// Registers a newly opened `GameSession`, cancelling any disconnect
    /// grace timer left over from the same user's previous connection to
    /// this game (spec.md §4.5 point 2: "a reconnect within the grace
    /// period resumes presence without a left/rejoin event pair").
    pub async fn on_open(&self, game_id: GameId, user_id: UserId, addr: Addr<GameSession>) {
        if let Some(previous) = {
            let mut connections = self.connections.lock().await;
            connections.entry(game_id).or_default().insert(user_id, addr)
        } {
            previous.do_send(CloseConnection(1000));
        }

        if let Some(handle) = self.pending_disconnect.lock().await.remove(&(game_id, user_id)) {
            handle.abort();
        }
    }

    /// Called when a `GameSession` actor stops. If the connection is still
    /// the one on record (not superseded by a reconnect), schedules the
    /// grace-period `GameSystem::disconnect_player` call rather than
    /// running it immediately, so a quick reconnect is cheap.
    pub async fn on_exit(&self, game_id: GameId, user_id: UserId, addr: Addr<GameSession>) {
        {
            let mut connections = self.connections.lock().await;
            let still_current = connections.get(&game_id).and_then(|players| players.get(&user_id)) == Some(&addr);
            if !still_current {
                return;
            }
            if let Some(players) = connections.get_mut(&game_id) {
                players.remove(&user_id);
                if players.is_empty() {
                    connections.remove(&game_id);
                }
            }
        }

        let universe = Arc::clone(&self.universe);
        let grace = self.disconnect_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Ok(game) = universe.get_or_load_game(game_id).await {
                if let Ok(mut conn) = universe.db_pool().acquire().await {
                    let _ = game.disconnect_player(&mut conn, user_id, true, None).await;
                }
            }
        });
        self.pending_disconnect.lock().await.insert((game_id, user_id), handle);
    }
}
