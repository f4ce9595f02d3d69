//! Connection handlers for Parley server.
//!
//! This module handles the connection lifecycle and request processing. Each
//! socket gets a bounded outbound queue that the core routes events into;
//! the socket task drains it alongside inbound frames and the heartbeat.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    outbound_channel, ActionReport, ChatStore, ConnectionId, MemoryStore, SessionConfig,
    SessionCoordinator, SessionError,
};
use parley_protocol::codec::{self, Encoded};
use parley_protocol::{codes, Encoding, Frame, IdError, UserId, Version, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Header a client may use to announce its protocol version.
pub const VERSION_HEADER: &str = "x-parley-version";

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The session coordinator.
    pub coordinator: SessionCoordinator,
    /// Server configuration.
    pub config: Config,
    active_connections: AtomicUsize,
}

impl AppState {
    /// Create app state backed by the in-memory store.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create app state over a given store.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn ChatStore>) -> Self {
        let session_config = SessionConfig {
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            refresh_on_connect: true,
        };

        Self {
            coordinator: SessionCoordinator::new(store, session_config),
            config,
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Number of open or upgrading sockets.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Claim one of the `max_connections` slots, or `None` when all are taken.
    #[must_use]
    pub fn try_reserve(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }
}

/// A reserved connection slot. Released on drop.
pub struct ConnectionSlot {
    state: Arc<AppState>,
}

impl std::fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("active", &self.state.active_connections())
            .finish()
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reasons a WebSocket upgrade is refused.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The identity header is absent or not valid text.
    #[error("Missing identity header {0}")]
    MissingIdentity(String),

    /// The identity header holds an unusable user id.
    #[error("Invalid user id: {0}")]
    InvalidIdentity(#[from] IdError),

    /// The client speaks an unsupported protocol version.
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(String),

    /// The server is at its connection limit.
    #[error("Connection limit reached")]
    AtCapacity,
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let status = match &self {
            HandshakeError::MissingIdentity(_) | HandshakeError::InvalidIdentity(_) => {
                StatusCode::UNAUTHORIZED
            }
            HandshakeError::UnsupportedVersion(_) => StatusCode::BAD_REQUEST,
            HandshakeError::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));
    let app = build_app(state);

    // Bind and serve
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.coordinator.registry().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": registry.connection_count,
        "users": registry.user_count,
    }))
}

/// Check capacity, identity and protocol version before upgrading.
///
/// The returned slot is held for the socket's lifetime; a refused handshake
/// drops it again.
fn authorize(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<(UserId, Version, ConnectionSlot), HandshakeError> {
    let slot = state.try_reserve().ok_or(HandshakeError::AtCapacity)?;

    let header = state.config.identity.header.as_str();
    let raw = headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HandshakeError::MissingIdentity(header.to_string()))?;
    let user_id = UserId::new(raw)?;

    let version = match headers.get(VERSION_HEADER).and_then(|v| v.to_str().ok()) {
        Some(raw) => raw
            .parse::<Version>()
            .ok()
            .and_then(|client| PROTOCOL_VERSION.negotiate(&client))
            .ok_or_else(|| HandshakeError::UnsupportedVersion(raw.to_string()))?,
        None => PROTOCOL_VERSION,
    };

    Ok((user_id, version, slot))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    match authorize(&state, &headers) {
        Ok((user_id, version, slot)) => ws
            .max_message_size(state.config.limits.max_message_size)
            .on_upgrade(move |socket| handle_websocket(socket, state, user_id, version, slot))
            .into_response(),
        Err(e) => {
            warn!(error = %e, "WebSocket upgrade refused");
            metrics::record_error("handshake");
            e.into_response()
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: UserId,
    version: Version,
    _slot: ConnectionSlot,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (outbound, mut events) = outbound_channel(state.config.limits.outbound_queue_capacity);
    let connection_id = match state.coordinator.connect(user_id.clone(), outbound).await {
        Ok(id) => id,
        Err(e) => {
            error!(user = %user_id, error = %e, "Failed to register connection");
            metrics::record_error("connect");
            return;
        }
    };
    metrics::set_online_users(state.coordinator.online_users().len());

    debug!(connection = %connection_id, user = %user_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();
    let encoding = state.config.transport.encoding;

    // Send Connected frame
    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(connection_id.as_str(), user_id.clone(), version, heartbeat);
    if send_frame(&mut sender, &connected, encoding).await.is_ok() {
        run_connection(&mut sender, &mut receiver, &mut events, &state, &connection_id, &user_id)
            .await;
    } else {
        error!(connection = %connection_id, "Failed to send Connected frame");
    }

    // Cleanup: always leave the core, whatever ended the loop
    state.coordinator.disconnect(&connection_id).await;
    metrics::set_online_users(state.coordinator.online_users().len());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Message processing loop. Returns when the socket closes, errors or
/// misses its heartbeat.
async fn run_connection(
    sender: &mut WsSender,
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    events: &mut parley_core::OutboundReceiver,
    state: &Arc<AppState>,
    connection_id: &ConnectionId,
    user_id: &UserId,
) {
    let encoding = state.config.transport.encoding;
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat.interval_ms.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Events routed to this connection by the core
            Some(frame) = events.recv() => {
                if send_frame(sender, &frame, encoding).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        // Try to decode frames
                        let mut open = true;
                        loop {
                            let reply = match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => handle_frame(frame, connection_id, user_id, state).await,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Undecodable binary frame");
                                    metrics::record_error("decode");
                                    read_buffer.clear();
                                    Some(Frame::error(0, codes::INVALID_FRAME, e.to_string()))
                                }
                            };
                            if let Some(reply) = reply {
                                if send_frame(sender, &reply, encoding).await.is_err() {
                                    open = false;
                                    break;
                                }
                            }
                        }
                        if !open {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        metrics::record_frame(text.len(), "inbound");
                        let reply = match codec::from_json(&text) {
                            Ok(frame) => handle_frame(frame, connection_id, user_id, state).await,
                            Err(e) => {
                                warn!(connection = %connection_id, error = %e, "Undecodable text frame");
                                metrics::record_error("decode");
                                Some(Frame::error(0, codes::INVALID_FRAME, e.to_string()))
                            }
                        };
                        if let Some(reply) = reply {
                            if send_frame(sender, &reply, encoding).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            // Heartbeat: probe the client, give up once it has been silent too long
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > timeout {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Handle a decoded frame and produce the reply, if any.
async fn handle_frame(
    frame: Frame,
    connection_id: &ConnectionId,
    user_id: &UserId,
    state: &AppState,
) -> Option<Frame> {
    let coordinator = &state.coordinator;
    let start = std::time::Instant::now();
    debug!(connection = %connection_id, frame_type = ?frame.frame_type(), "Request");

    let reply = match frame {
        Frame::SubscribeGroup { id, group_id } => {
            match coordinator.subscribe_to_group_room(connection_id, group_id).await {
                Ok(_) => Frame::ack(id),
                Err(e) => error_frame(id, &e),
            }
        }

        Frame::UnsubscribeGroup { id, group_id } => {
            coordinator.unsubscribe_from_group_room(connection_id, group_id);
            Frame::ack(id)
        }

        Frame::SendDirect {
            id,
            receiver_id,
            payload,
        } => action_reply(
            id,
            coordinator
                .send_direct_message(user_id, receiver_id, payload)
                .await,
        ),

        Frame::SendGroup {
            id,
            group_id,
            payload,
        } => action_reply(
            id,
            coordinator.send_group_message(user_id, group_id, payload).await,
        ),

        Frame::MarkRead { id, chat } => {
            action_reply(id, coordinator.mark_chat_read(user_id, chat).await)
        }

        Frame::UpdateProfile { id, fields } => {
            action_reply(id, coordinator.update_profile(user_id, fields).await)
        }

        Frame::UpdateGroup {
            id,
            group_id,
            fields,
        } => action_reply(id, coordinator.update_group(user_id, group_id, fields).await),

        Frame::CreateGroup { id, name, members } => {
            action_reply(id, coordinator.create_group(user_id, &name, members).await)
        }

        Frame::AddMember {
            id,
            group_id,
            user_id: member,
        } => action_reply(id, coordinator.add_member(user_id, group_id, member).await),

        Frame::RemoveMember {
            id,
            group_id,
            user_id: member,
        } => action_reply(id, coordinator.remove_member(user_id, group_id, member).await),

        Frame::Typing {
            receiver_id,
            typing,
        } => {
            let report = coordinator.typing(user_id, receiver_id, typing).await;
            metrics::record_delivery(&report);
            return None;
        }

        Frame::SyncChatList { id } => match coordinator.refresh_chat_list(user_id).await {
            Ok(snapshot) => Frame::ChatList { id, snapshot },
            Err(e) => error_frame(id, &e),
        },

        Frame::History { id, chat, limit } => {
            let limit = limit.map(|l| l as usize);
            match coordinator.history(user_id, &chat, limit).await {
                Ok(messages) => Frame::HistoryPage { id, chat, messages },
                Err(e) => error_frame(id, &e),
            }
        }

        Frame::OnlineUsers { id } => Frame::OnlineUsersList {
            id,
            users: coordinator.online_users(),
        },

        Frame::Ping { timestamp } => Frame::pong(timestamp),

        Frame::Pong { .. } => return None,

        other => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            metrics::record_error("unexpected_frame");
            Frame::error(
                other.request_id().unwrap_or(0),
                codes::INVALID_FRAME,
                "Not a client request",
            )
        }
    };

    metrics::record_latency(start.elapsed().as_secs_f64());
    Some(reply)
}

/// Reply for a mutating action.
fn action_reply(id: u64, result: Result<ActionReport, SessionError>) -> Frame {
    match result {
        Ok(report) => {
            metrics::record_delivery(&report.deliveries);
            match report.created_id {
                Some(created) => Frame::ack_created(id, created),
                None => Frame::ack(id),
            }
        }
        Err(e) => error_frame(id, &e),
    }
}

fn error_frame(id: u64, error: &SessionError) -> Frame {
    debug!(request = id, code = error.code(), error = %error, "Request failed");
    metrics::record_error("request");
    Frame::error(id, error.code(), error.to_string())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame, encoding: Encoding) -> Result<()> {
    let encoded = encoding.encode(frame)?;
    metrics::record_frame(encoded.len(), "outbound");
    let message = match encoded {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}
