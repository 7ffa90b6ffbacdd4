//! Per-connection actor behind `GET /game/{id}/ws` (spec.md §4.5, points
//! 2-3). Grounded on the teacher's `ws/client.rs` (`ClientSession`, the
//! `hb`/`ctx.run_interval` heartbeat loop), adapted to spec.md's
//! application-level JSON ping/pong and 30-second inactivity timeout
//! (close code 1001) in place of the teacher's raw WS ping opcode and
//! 10-second timeout.

use crate::core::models::GameId;
use crate::core::state::AppState;
use crate::lib::auth::Claims;
use crate::lib::error::ServerError;
use crate::lib::Result;
use crate::ws::controller::WebSocketController;
use crate::ws::protocol;
use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Message)]
#[rtype(result = "()")]
pub struct SendFrame(pub Value);

#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseConnection(pub u16);

fn close_reason(code: u16) -> ws::CloseReason {
    let code = match code {
        1000 => ws::CloseCode::Normal,
        1001 => ws::CloseCode::Away,
        1011 => ws::CloseCode::Error,
        other => ws::CloseCode::Other(other),
    };
    ws::CloseReason { code, description: None }
}

pub struct GameSession {
    game_id: GameId,
    user_id: crate::core::models::UserId,
    last_seen: Instant,
    controller: Arc<WebSocketController>,
    heartbeat_timeout: Duration,
}

pub async fn entrypoint(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<GameId>,
    claims: Claims,
) -> Result<HttpResponse> {
    let state: &'static AppState = crate::core::state::state();
    let game_id = path.into_inner();

    state.universe.get_or_load_game(game_id).await?;

    let session = GameSession {
        game_id,
        user_id: claims.user_id,
        last_seen: Instant::now(),
        controller: Arc::clone(&state.ws_controller),
        heartbeat_timeout: state.config.heartbeat_timeout,
    };
    let (_addr, resp) =
        ws::start_with_addr(session, &req, stream).map_err(|e| ServerError::Internal(e.to_string()))?;
    Ok(resp)
}

impl Actor for GameSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let addr = ctx.address();
        let controller = Arc::clone(&self.controller);
        let (game_id, user_id) = (self.game_id, self.user_id);
        actix::spawn(async move {
            controller.on_open(game_id, user_id, addr).await;
        });
        self.schedule_idle_check(ctx);
    }

    fn stopping(&mut self, ctx: &mut Self::Context) -> Running {
        let addr = ctx.address();
        let controller = Arc::clone(&self.controller);
        let (game_id, user_id) = (self.game_id, self.user_id);
        actix::spawn(async move {
            controller.on_exit(game_id, user_id, addr).await;
        });
        Running::Stop
    }
}

impl GameSession {
    fn schedule_idle_check(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(IDLE_POLL_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_seen) > act.heartbeat_timeout {
                ctx.close(Some(close_reason(1001)));
                ctx.stop();
            }
        });
    }
}

impl Handler<SendFrame> for GameSession {
    type Result = ();

    fn handle(&mut self, msg: SendFrame, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg.0) {
            Ok(text) => ctx.text(text),
            Err(_) => {
                ctx.close(Some(close_reason(1011)));
                ctx.stop();
            }
        }
    }
}

impl Handler<CloseConnection> for GameSession {
    type Result = ();

    fn handle(&mut self, msg: CloseConnection, ctx: &mut Self::Context) {
        ctx.close(Some(close_reason(msg.0)));
        ctx.stop();
    }
}

impl StreamHandler<std::result::Result<ws::Message, ws::ProtocolError>> for GameSession {
    fn handle(&mut self, msg: std::result::Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => {
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Text(text) => {
                self.last_seen = Instant::now();
                if let Ok(frame) = serde_json::from_str::<protocol::ClientFrame>(&text) {
                    if frame.kind == "ping" {
                        ctx.text(serde_json::to_string(&protocol::pong_frame()).expect("pong frame is valid JSON"));
                    }
                }
            }
            ws::Message::Ping(bytes) => {
                self.last_seen = Instant::now();
                ctx.pong(&bytes);
            }
            ws::Message::Pong(_) => self.last_seen = Instant::now(),
            ws::Message::Close(_) => ctx.stop(),
            ws::Message::Continuation(_) | ws::Message::Binary(_) | ws::Message::Nop => {}
        }
    }
}
