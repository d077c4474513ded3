//! Exchange WebSocket connection manager.
//!
//! Owns exactly one socket. A single loop (`run`) drives dialing, the
//! session read loop, heartbeat compliance and reconnection; it is the only
//! writer of connection state. External callers talk to it through a bounded
//! command channel and observe it through a typed event stream — no
//! callbacks, no shared mutable collections.

use crate::error::{WsError, WsResult};
use crate::heartbeat::{HeartbeatConfig, HeartbeatController};
use crate::reconnect::{DisconnectKind, ReconnectConfig, ReconnectStrategy};
use crate::stream_name::{
    build_combined_stream_url, is_valid_stream_name, CombinedUrlOptions, UrlEncoding,
    MAX_STREAMS_PER_CONNECTION,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use marketflow_telemetry::metrics;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::CloseFrame, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the session loop checks for heartbeat silence.
const SILENCE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// All state names, for the exclusive state gauge.
const STATE_NAMES: [&str; 7] = [
    "idle",
    "connecting",
    "connected",
    "active",
    "reconnecting",
    "error",
    "closed",
];

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Stable identifier, used in logs and metric labels.
    pub id: String,
    /// Base WebSocket URL (e.g. `wss://stream.binance.com:9443`).
    pub base_url: String,
    /// Initial combined stream set.
    pub initial_streams: Vec<String>,
    /// Per-connection stream limit.
    pub max_streams: usize,
    /// Combined-URL encoding.
    pub encoding: UrlEncoding,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    /// Event channel capacity.
    pub event_buffer: usize,
    /// Command channel capacity.
    pub command_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            base_url: "wss://stream.binance.com:9443".to_string(),
            initial_streams: Vec::new(),
            max_streams: MAX_STREAMS_PER_CONNECTION,
            encoding: UrlEncoding::None,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            event_buffer: 1024,
            command_buffer: 64,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Active,
    Reconnecting,
    /// Terminal: escalated, requires external reset.
    Error,
    /// Terminal: manually closed.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events emitted by the connection loop, in enqueue order.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    /// A raw text frame from the exchange.
    Framed(String),
    Closed { code: u16, reason: String },
    Error(String),
    PingReceived,
    PongSent,
    StateChanged(ConnectionState),
}

/// Commands accepted by the connection loop.
#[derive(Debug)]
pub enum ConnectionCommand {
    AddStreams(Vec<String>),
    RemoveStreams(Vec<String>),
    Close { reason: String },
}

/// Observable connection state snapshot.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub url: String,
    pub state: ConnectionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub msgs_in: u64,
    pub bytes_in: u64,
    pub heartbeat_score: f64,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_pong_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub streams: Vec<String>,
}

/// Cloneable handle for interacting with a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::Sender<ConnectionCommand>,
    info: Arc<RwLock<ConnectionInfo>>,
}

impl ConnectionHandle {
    /// Request additional streams. Names are validated here; dedup and the
    /// authoritative limit check happen in the connection loop.
    pub async fn add_streams(&self, streams: Vec<String>) -> WsResult<()> {
        for name in &streams {
            if !is_valid_stream_name(name) {
                return Err(WsError::InvalidStreamName(name.clone()));
            }
        }
        self.command_tx
            .send(ConnectionCommand::AddStreams(streams))
            .await
            .map_err(|_| WsError::ConnectionFailed("connection loop stopped".to_string()))
    }

    /// Request stream removal.
    pub async fn remove_streams(&self, streams: Vec<String>) -> WsResult<()> {
        self.command_tx
            .send(ConnectionCommand::RemoveStreams(streams))
            .await
            .map_err(|_| WsError::ConnectionFailed("connection loop stopped".to_string()))
    }

    /// Graceful close; cancels any scheduled reconnect.
    pub async fn close(&self, reason: impl Into<String>) -> WsResult<()> {
        self.command_tx
            .send(ConnectionCommand::Close {
                reason: reason.into(),
            })
            .await
            .map_err(|_| WsError::ConnectionFailed("connection loop stopped".to_string()))
    }

    /// Snapshot of the connection state.
    pub fn info(&self) -> ConnectionInfo {
        self.info.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.info.read().state
    }
}

/// How a session ended, from the loop's perspective.
enum SessionEnd {
    /// Terminal: manual close or cancellation; state already set.
    Shutdown,
    /// Stream set changed; redial immediately without backoff.
    Resubscribe,
    /// Transport-level end; consult the reconnect strategy.
    Disconnect(DisconnectKind),
}

/// Exchange WebSocket connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    streams: Vec<String>,
    heartbeat: HeartbeatController,
    strategy: ReconnectStrategy,
    info: Arc<RwLock<ConnectionInfo>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    command_rx: mpsc::Receiver<ConnectionCommand>,
    /// Set while the connection is in `active`.
    active_since: Option<Instant>,
    /// Set once the event receiver is dropped, to log only once.
    observer_gone: bool,
}

impl ConnectionManager {
    /// Create a manager plus its control handle and event stream.
    pub fn new(
        config: ConnectionConfig,
    ) -> (Self, ConnectionHandle, mpsc::Receiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);

        let mut streams = Vec::new();
        for name in &config.initial_streams {
            if !streams.contains(name) {
                streams.push(name.clone());
            }
        }
        streams.truncate(config.max_streams);

        let info = Arc::new(RwLock::new(ConnectionInfo {
            id: config.id.clone(),
            url: config.base_url.clone(),
            state: ConnectionState::Idle,
            connected_at: None,
            last_activity: None,
            msgs_in: 0,
            bytes_in: 0,
            heartbeat_score: 1.0,
            last_ping_at: None,
            last_pong_at: None,
            attempt_count: 0,
            streams: streams.clone(),
        }));

        let heartbeat = HeartbeatController::new(config.heartbeat.clone());
        let strategy = ReconnectStrategy::new(config.reconnect.clone());

        let manager = Self {
            config,
            streams,
            heartbeat,
            strategy,
            info: Arc::clone(&info),
            event_tx,
            command_rx,
            active_since: None,
            observer_gone: false,
        };
        let handle = ConnectionHandle {
            command_tx,
            info,
        };
        (manager, handle, event_rx)
    }

    /// Drive the connection until cancellation, manual close or escalation.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            if self.streams.is_empty() {
                // Nothing to subscribe; park in idle until told otherwise.
                self.set_state(ConnectionState::Idle).await;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.set_state(ConnectionState::Closed).await;
                        return;
                    }
                    cmd = self.command_rx.recv() => {
                        match cmd {
                            None | Some(ConnectionCommand::Close { .. }) => {
                                self.set_state(ConnectionState::Closed).await;
                                return;
                            }
                            Some(cmd) => {
                                self.apply_stream_command(cmd).await;
                            }
                        }
                    }
                }
                continue;
            }

            self.set_state(ConnectionState::Connecting).await;
            let url = match build_combined_stream_url(
                &self.streams,
                &self.config.base_url,
                &CombinedUrlOptions {
                    max_streams: self.config.max_streams,
                    encoding: self.config.encoding,
                },
            ) {
                Ok(url) => url,
                Err(e) => {
                    error!(id = %self.config.id, ?e, "Cannot build combined stream URL");
                    self.emit(ConnectionEvent::Error(e.to_string())).await;
                    self.set_state(ConnectionState::Error).await;
                    return;
                }
            };
            self.info.write().url = url.clone();
            info!(id = %self.config.id, url = %url, "Connecting to exchange");

            let dial = tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(ConnectionState::Closed).await;
                    return;
                }
                dial = connect_async(&url) => dial,
            };

            let end = match dial {
                Ok((ws, _response)) => self.session(ws, &cancel).await,
                Err(e) => {
                    error!(id = %self.config.id, ?e, "Dial failed");
                    self.emit(ConnectionEvent::Error(format!("dial failed: {e}")))
                        .await;
                    SessionEnd::Disconnect(DisconnectKind::Connection)
                }
            };

            match end {
                SessionEnd::Shutdown => return,
                SessionEnd::Resubscribe => {
                    // Redial immediately: the new connection must carry the
                    // full updated stream set or the reconnect is a failure.
                    info!(
                        id = %self.config.id,
                        streams = self.streams.len(),
                        "Stream set changed, re-establishing connection"
                    );
                    continue;
                }
                SessionEnd::Disconnect(kind) => {
                    if !self.handle_disconnect(kind, &cancel).await {
                        return;
                    }
                }
            }
        }
    }

    /// One connected session: read frames, answer pings, watch for silence
    /// and apply commands until something ends it.
    async fn session(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        self.heartbeat.reset();
        self.active_since = None;
        {
            let mut info = self.info.write();
            info.connected_at = Some(Utc::now());
        }
        self.set_state(ConnectionState::Connected).await;
        self.emit(ConnectionEvent::Open).await;

        let mut silence_check = tokio::time::interval(SILENCE_CHECK_INTERVAL);
        silence_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    self.set_state(ConnectionState::Closed).await;
                    self.emit(ConnectionEvent::Closed {
                        code: 1000,
                        reason: "shutdown".to_string(),
                    })
                    .await;
                    return SessionEnd::Shutdown;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            self.set_state(ConnectionState::Closed).await;
                            return SessionEnd::Shutdown;
                        }
                        Some(ConnectionCommand::Close { reason }) => {
                            info!(id = %self.config.id, %reason, "Closing connection");
                            let _ = write.send(Message::Close(Some(CloseFrame {
                                code: 1000.into(),
                                reason: reason.clone().into(),
                            })))
                            .await;
                            self.set_state(ConnectionState::Closed).await;
                            self.emit(ConnectionEvent::Closed { code: 1000, reason }).await;
                            return SessionEnd::Shutdown;
                        }
                        Some(cmd) => {
                            if self.apply_stream_command(cmd).await {
                                return SessionEnd::Resubscribe;
                            }
                        }
                    }
                }

                _ = silence_check.tick() => {
                    if self.heartbeat.is_silent() {
                        warn!(id = %self.config.id, "No server ping within threshold");
                        self.emit(ConnectionEvent::Error("heartbeat lost".to_string())).await;
                        return SessionEnd::Disconnect(DisconnectKind::HeartbeatLost);
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.on_frame(text.len()).await;
                            self.emit(ConnectionEvent::Framed(text)).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.on_frame(data.len()).await;
                            self.emit(ConnectionEvent::Framed(
                                String::from_utf8_lossy(&data).into_owned(),
                            ))
                            .await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            debug!(id = %self.config.id, "Ping received, echoing pong");
                            self.heartbeat.record_ping_received();
                            self.info.write().last_ping_at = Some(Utc::now());
                            self.emit(ConnectionEvent::PingReceived).await;
                            // The pong must carry a byte-identical payload.
                            if let Err(e) = write.send(Message::Pong(payload)).await {
                                error!(id = %self.config.id, ?e, "Pong send failed");
                                return SessionEnd::Disconnect(DisconnectKind::Connection);
                            }
                            self.heartbeat.record_pong_sent();
                            {
                                let mut info = self.info.write();
                                info.last_pong_at = Some(Utc::now());
                                info.heartbeat_score = self.heartbeat.score();
                            }
                            metrics::WS_HEARTBEAT_SCORE
                                .with_label_values(&[&self.config.id])
                                .set(self.heartbeat.score());
                            self.emit(ConnectionEvent::PongSent).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "closed".to_string()));
                            warn!(id = %self.config.id, code, %reason, "Closed by server");
                            self.emit(ConnectionEvent::Closed { code, reason }).await;
                            return SessionEnd::Disconnect(DisconnectKind::from_close_code(code));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(id = %self.config.id, ?e, "Read error");
                            self.emit(ConnectionEvent::Error(e.to_string())).await;
                            let kind = match &e {
                                tokio_tungstenite::tungstenite::Error::Protocol(_) => {
                                    DisconnectKind::Protocol
                                }
                                _ => DisconnectKind::Connection,
                            };
                            return SessionEnd::Disconnect(kind);
                        }
                        None => {
                            warn!(id = %self.config.id, "Stream ended");
                            self.emit(ConnectionEvent::Closed {
                                code: 1006,
                                reason: "stream ended".to_string(),
                            })
                            .await;
                            return SessionEnd::Disconnect(DisconnectKind::Connection);
                        }
                    }
                }
            }
        }
    }

    /// Consult the reconnect strategy and sleep out the backoff.
    /// Returns false when the loop should stop (escalation or shutdown).
    async fn handle_disconnect(&mut self, kind: DisconnectKind, cancel: &CancellationToken) -> bool {
        let uptime = self
            .active_since
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.strategy.record_uptime(uptime);

        let decision = self.strategy.decide(kind);
        metrics::WS_RECONNECT_TOTAL
            .with_label_values(&[&self.config.id, kind.as_str()])
            .inc();
        self.info.write().attempt_count = self.strategy.attempts();

        if !decision.should_reconnect {
            error!(
                id = %self.config.id,
                kind = kind.as_str(),
                attempts = self.strategy.attempts(),
                "Escalating: no further reconnects"
            );
            self.emit(ConnectionEvent::Error(format!(
                "escalated after {} ({} attempts)",
                kind.as_str(),
                self.strategy.attempts()
            )))
            .await;
            self.set_state(ConnectionState::Error).await;
            return false;
        }

        self.set_state(ConnectionState::Reconnecting).await;
        warn!(
            id = %self.config.id,
            kind = kind.as_str(),
            attempt = self.strategy.attempts(),
            delay_ms = decision.delay.as_millis(),
            "Reconnecting"
        );

        // Sleep out the delay while still honoring close/cancel and
        // absorbing stream-set changes for the upcoming dial.
        let deadline = tokio::time::Instant::now() + decision.delay;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(ConnectionState::Closed).await;
                    return false;
                }
                _ = tokio::time::sleep_until(deadline) => return true,
                cmd = self.command_rx.recv() => {
                    match cmd {
                        None | Some(ConnectionCommand::Close { .. }) => {
                            self.set_state(ConnectionState::Closed).await;
                            return false;
                        }
                        Some(cmd) => {
                            self.apply_stream_command(cmd).await;
                        }
                    }
                }
            }
        }
    }

    /// Apply an add/remove command to the stream set.
    /// Returns true when the set changed (the caller must redial).
    async fn apply_stream_command(&mut self, cmd: ConnectionCommand) -> bool {
        match cmd {
            ConnectionCommand::AddStreams(new_streams) => {
                let mut added = Vec::new();
                for name in new_streams {
                    if !is_valid_stream_name(&name) {
                        self.emit(ConnectionEvent::Error(format!("invalid stream name: {name}")))
                            .await;
                        return false;
                    }
                    if !self.streams.contains(&name) && !added.contains(&name) {
                        added.push(name);
                    }
                }
                if added.is_empty() {
                    return false;
                }
                if self.streams.len() + added.len() > self.config.max_streams {
                    warn!(
                        id = %self.config.id,
                        current = self.streams.len(),
                        adding = added.len(),
                        max = self.config.max_streams,
                        "Stream limit exceeded, command rejected"
                    );
                    self.emit(ConnectionEvent::Error(format!(
                        "too many streams: {} exceeds limit {}",
                        self.streams.len() + added.len(),
                        self.config.max_streams
                    )))
                    .await;
                    return false;
                }
                self.streams.extend(added);
                self.info.write().streams = self.streams.clone();
                true
            }
            ConnectionCommand::RemoveStreams(gone) => {
                let before = self.streams.len();
                self.streams.retain(|s| !gone.contains(s));
                let changed = self.streams.len() != before;
                if changed {
                    self.info.write().streams = self.streams.clone();
                }
                changed
            }
            ConnectionCommand::Close { .. } => false,
        }
    }

    /// Count an inbound data frame; the first one activates the connection.
    async fn on_frame(&mut self, bytes: usize) {
        let activate = {
            let mut info = self.info.write();
            info.msgs_in += 1;
            info.bytes_in += bytes as u64;
            info.last_activity = Some(Utc::now());
            info.state == ConnectionState::Connected
        };
        metrics::WS_MESSAGES_TOTAL
            .with_label_values(&[&self.config.id])
            .inc();
        if activate {
            self.active_since = Some(Instant::now());
            self.set_state(ConnectionState::Active).await;
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        let changed = {
            let mut info = self.info.write();
            if info.state == state {
                false
            } else {
                info.state = state;
                true
            }
        };
        if changed {
            debug!(id = %self.config.id, state = %state, "State changed");
            metrics::set_ws_state(&self.config.id, &STATE_NAMES, state.as_str());
            self.emit(ConnectionEvent::StateChanged(state)).await;
        }
    }

    async fn emit(&mut self, event: ConnectionEvent) {
        if self.event_tx.send(event).await.is_err() && !self.observer_gone {
            warn!(id = %self.config.id, "Event observer dropped");
            self.observer_gone = true;
        }
    }
}
