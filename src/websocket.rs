//! # WebSocket Interview Endpoint
//!
//! Bridges one websocket connection to one `SessionRelay`.
//! Clients connect to `/ws/interview` (optionally `?user_id=...`), stream raw audio
//! as binary frames and receive JSON events as text frames.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the upgrade is refused with 503 when the relay is at capacity
//! 2. **Control**: `{"type":"start"}` and `{"type":"stop"}` text frames
//! 3. **Audio Streaming**: binary frames, sequenced by arrival
//! 4. **Events**: `transcript`, `suggestion`, `error` and `status` JSON messages
//! 5. **Close**: normal close after `status:"closed"`, "away" if the relay was force-closed
//!
//! ## Actor Model:
//! The `RelaySocket` actor never does session work itself. Its read side pushes
//! frames into the relay inbox with `try_send`, so a slow pipeline can never stall
//! the socket; frames that do not fit are only counted, and the relay reports
//! them. Its write side is a stream of the relay's outbound events and nothing
//! else.

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::relay::{
    ClientMessage, DroppedFrames, OutboundEvent, RelayCommand, RelayConnection, Session, SessionId,
    SessionRelay, WireState,
};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub user_id: Option<String>,
}

/// WebSocket actor for one interview session.
pub struct RelaySocket {
    session_id: SessionId,

    /// Relay inbox; dropping it tells the relay the client is gone
    commands: mpsc::Sender<RelayCommand>,

    /// Relay outbound events, moved into the actor context on start
    events: Option<mpsc::Receiver<OutboundEvent>>,

    /// Audio frames that did not fit into the relay inbox
    dropped: Arc<DroppedFrames>,

    /// Last time the client showed signs of life
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,

    /// The relay announced `closed` before its event stream ended
    relay_closed: bool,
}

impl RelaySocket {
    pub fn new(connection: RelayConnection, server: &ServerConfig) -> Self {
        Self {
            session_id: connection.session_id,
            commands: connection.commands,
            events: Some(connection.events),
            dropped: connection.dropped,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(server.client_timeout_secs),
            relay_closed: false,
        }
    }

    /// Hand a control command to the relay without blocking the read loop.
    fn forward_control(&self, command: RelayCommand) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(command)) => {
                let commands = self.commands.clone();
                actix::spawn(async move {
                    let _ = commands.send(command).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "Relay already finished, dropping control message");
            }
        }
    }

    fn forward_audio(&self, data: bytes::Bytes) {
        match self.commands.try_send(RelayCommand::Audio(data)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %self.session_id, "Relay inbox full, audio frame dropped");
                self.dropped.record();
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %self.session_id, "Relay already finished, dropping audio frame");
            }
        }
    }

    fn send_event(&self, event: &OutboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match event.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(session_id = %self.session_id, error = %err, "Failed to encode event"),
        }
    }

    fn handle_text(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Start) => self.forward_control(RelayCommand::Start),
            Ok(ClientMessage::Stop) => self.forward_control(RelayCommand::Stop),
            Err(err) => self.forward_control(RelayCommand::Malformed(err.to_string())),
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        if let Some(events) = self.events.take() {
            ctx.add_stream(ReceiverStream::new(events));
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");
        self.forward_control(RelayCommand::Disconnected);
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
                return;
            }
        };

        match msg {
            ws::Message::Binary(data) => {
                self.last_heartbeat = Instant::now();
                self.forward_audio(data);
            }
            ws::Message::Text(text) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text);
            }
            ws::Message::Ping(payload) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            ws::Message::Pong(_) => {
                self.last_heartbeat = Instant::now();
            }
            ws::Message::Close(reason) => {
                debug!(session_id = %self.session_id, ?reason, "Client closed the connection");
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                self.forward_control(RelayCommand::Malformed(
                    "fragmented frames are not supported".to_string(),
                ));
            }
            ws::Message::Nop => {}
        }
    }
}

/// Events from the relay.
impl StreamHandler<OutboundEvent> for RelaySocket {
    fn handle(&mut self, event: OutboundEvent, ctx: &mut Self::Context) {
        if let OutboundEvent::Status { state: WireState::Closed } = event {
            self.relay_closed = true;
        }
        self.send_event(&event, ctx);
    }

    /// The relay task has ended and dropped its sender.
    fn finished(&mut self, ctx: &mut Self::Context) {
        let code = if self.relay_closed {
            ws::CloseCode::Normal
        } else {
            warn!(session_id = %self.session_id, "Relay ended without closing, closing connection as away");
            ws::CloseCode::Away
        };
        ctx.close(Some(code.into()));
        ctx.stop();
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// The handshake is validated first so a bad upgrade request never takes a
/// session slot. The relay is then registered (503 when full) and only then is
/// the connection upgraded and handed to a `RelaySocket` actor.
pub async fn interview_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<ConnectQuery>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "New WebSocket connection request");

    ws::handshake(&req)?;

    let session = Session::new(query.into_inner().user_id);
    let connection = SessionRelay::start(session, state.relay_settings(), state.relay_deps())
        .await
        .map_err(AppError::from)?;

    ws::start(RelaySocket::new(connection, &state.config.server), &req, stream)
}
