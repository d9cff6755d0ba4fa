//! WebSocket front end
//!
//! Each connection gets a [`ClientId`], an outbound frame channel drained by a
//! writer task, and at most one session. Session events are routed back to the
//! owning client by a single dispatcher task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use speakd_audio::AudioFormat;
use speakd_broadcaster::{
    Broadcaster, ClientId, ClientInfo, ClientMessage, ControlAction, ErrorCode, ProtocolError,
    ServerEvent, StatusSnapshot,
};
use speakd_metrics::{DaemonMetrics, MetricsCollector, SessionState};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::session::{SessionController, SessionError, SessionEvent};

/// State shared by every connection and background task
pub struct DaemonState {
    config: Arc<DaemonConfig>,
    broadcaster: Broadcaster,
    metrics: MetricsCollector,
    sessions: Mutex<HashMap<ClientId, Arc<SessionController>>>,
    /// Sessions whose client disconnected; they play out and are reaped by the sweep
    detached: Mutex<Vec<Arc<SessionController>>>,
    /// session id → client that receives its events
    owners: Mutex<HashMap<String, ClientId>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
}

#[derive(Serialize)]
struct SessionCounts {
    active: usize,
    total: usize,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    version: &'static str,
    uptime_secs: f64,
    clients: usize,
    sessions: SessionCounts,
    metrics: DaemonMetrics,
    memory_mb: f64,
}

#[derive(Serialize)]
struct SessionEntry {
    client: Option<String>,
    #[serde(flatten)]
    status: StatusSnapshot,
}

#[derive(Serialize)]
struct StatusReport {
    clients: Vec<ClientInfo>,
    sessions: Vec<SessionEntry>,
}

impl DaemonState {
    fn new(config: DaemonConfig, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let heartbeat_log = Duration::from_secs(config.server.heartbeat_log_interval_secs);
        Self {
            config: Arc::new(config),
            broadcaster: Broadcaster::new(heartbeat_log),
            metrics: MetricsCollector::new(),
            sessions: Mutex::new(HashMap::new()),
            detached: Mutex::new(Vec::new()),
            owners: Mutex::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn metrics(&self) -> DaemonMetrics {
        self.metrics.snapshot()
    }

    async fn reply(&self, client: ClientId, event: ServerEvent) {
        self.broadcaster.send(client, &event).await;
    }

    async fn reply_error(&self, client: ClientId, error: &SessionError, session_id: Option<String>) {
        self.reply(
            client,
            ServerEvent::Error {
                code: error.code(),
                message: error.to_string(),
                session_id,
            },
        )
        .await;
    }

    fn session_for(&self, client: ClientId) -> Option<Arc<SessionController>> {
        self.sessions.lock().get(&client).cloned()
    }

    async fn handle_message(&self, client: ClientId, message: ClientMessage) {
        debug!("Client {} → {}", client, message.kind());

        match message {
            ClientMessage::StartSession { format } => {
                let spec = format.unwrap_or(self.config.default_format);
                match AudioFormat::try_from(spec) {
                    Ok(format) => {
                        self.start_session(client, format).await;
                    }
                    Err(e) => self.reply_error(client, &SessionError::from(e), None).await,
                }
            }
            ClientMessage::AudioChunk(bytes) => self.on_audio(client, bytes).await,
            ClientMessage::EndStream => {
                let Some(session) = self.session_for(client) else {
                    return self.reply_error(client, &SessionError::NoSession, None).await;
                };
                if let Err(e) = session.on_end_stream() {
                    self.reply_error(client, &e, Some(session.id().to_string()))
                        .await;
                }
            }
            ClientMessage::Control(action) => self.on_control(client, action).await,
            ClientMessage::Heartbeat => {
                self.broadcaster.heartbeat(client).await;
                self.reply(
                    client,
                    ServerEvent::Heartbeat {
                        uptime_secs: self.metrics.uptime_secs(),
                    },
                )
                .await;
            }
            ClientMessage::Status => {
                let status = self
                    .session_for(client)
                    .map(|session| session.status())
                    .unwrap_or_else(StatusSnapshot::idle);
                self.reply(client, ServerEvent::Status(status)).await;
            }
            ClientMessage::TimingAnalysis => {
                let session = self.session_for(client);
                self.reply(
                    client,
                    ServerEvent::TimingAnalysis {
                        session_id: session.as_ref().map(|s| s.id().to_string()),
                        timing: session.map(|s| s.timing_report()),
                    },
                )
                .await;
            }
        }
    }

    async fn handle_protocol_error(&self, client: ClientId, error: ProtocolError) {
        match error {
            ProtocolError::MalformedChunk(reason) => {
                warn!("Client {} sent a malformed chunk: {}", client, reason);
                self.metrics.record_malformed();
                if let Some(session) = self.session_for(client) {
                    session.record_malformed();
                }
            }
            other => {
                warn!("Client {} protocol error: {}", client, other);
                self.reply(
                    client,
                    ServerEvent::error(ErrorCode::ProtocolError, other.to_string()),
                )
                .await;
            }
        }
    }

    /// Replace the client's session with a new one for `format`
    async fn start_session(
        &self,
        client: ClientId,
        format: AudioFormat,
    ) -> Option<Arc<SessionController>> {
        let previous = self.sessions.lock().remove(&client);
        if let Some(previous) = previous {
            if !previous.is_terminal() {
                info!("Client {} replaced session {}", client, previous.id());
                previous.stop().ok();
            }
        }

        let session = Arc::new(SessionController::new(
            format,
            self.config.clone(),
            self.events.clone(),
        ));
        // Registered before the first state change is published
        self.owners.lock().insert(session.id().to_string(), client);
        self.sessions.lock().insert(client, session.clone());

        match session.begin() {
            Ok(()) => {
                let player = session.player_name().unwrap_or_default();
                self.metrics.session_started();

                self.reply(
                    client,
                    ServerEvent::SessionStarted {
                        session_id: session.id().to_string(),
                        format,
                        player,
                    },
                )
                .await;
                Some(session)
            }
            Err(e) => {
                self.owners.lock().remove(session.id());
                self.sessions.lock().remove(&client);
                error!("Client {} session start failed: {}", client, e);
                self.reply_error(client, &e, None).await;
                None
            }
        }
    }

    async fn on_audio(&self, client: ClientId, bytes: Vec<u8>) {
        if bytes.is_empty() {
            debug!("Client {} sent an empty chunk", client);
            return;
        }
        self.metrics.record_chunk(bytes.len());

        let session = match self.session_for(client).filter(|s| !s.is_terminal()) {
            Some(session) => session,
            None => {
                let format = match AudioFormat::try_from(self.config.default_format) {
                    Ok(format) => format,
                    Err(e) => return self.reply_error(client, &SessionError::from(e), None).await,
                };
                debug!("Client {} sent audio without a session; starting one", client);
                match self.start_session(client, format).await {
                    Some(session) => session,
                    None => return,
                }
            }
        };

        if let Err(e) = session.on_chunk_received(&bytes) {
            self.reply_error(client, &e, Some(session.id().to_string()))
                .await;
        }
    }

    async fn on_control(&self, client: ClientId, action: ControlAction) {
        let Some(session) = self.session_for(client) else {
            return self.reply_error(client, &SessionError::NoSession, None).await;
        };

        let result = match action {
            ControlAction::Play | ControlAction::Resume => session.resume(),
            ControlAction::Pause => session.pause(),
            ControlAction::Stop => session.stop().map(|report| {
                debug!(
                    "Session {} stopped after {} chunks",
                    session.id(),
                    report.chunk_count
                );
            }),
        };

        if let Err(e) = result {
            self.reply_error(client, &e, Some(session.id().to_string()))
                .await;
        }
    }

    /// Forget a connection. A live session keeps playing, detached.
    async fn disconnect(&self, client: ClientId) {
        if self.broadcaster.disconnect(client).await {
            self.metrics.client_disconnected();
        }

        let session = self.sessions.lock().remove(&client);
        if let Some(session) = session {
            if !session.is_terminal() {
                info!(
                    "Session {} detached from client {} ({})",
                    session.id(),
                    client,
                    session.state()
                );
                self.detached.lock().push(session);
            }
        }
        self.owners.lock().retain(|_, owner| *owner != client);
    }

    /// Tear down inactive clients and reap finished detached sessions
    pub async fn sweep(&self) {
        let timeout = Duration::from_secs(self.config.server.client_timeout_secs);

        for client in self.broadcaster.stale_clients(timeout).await {
            warn!("Client {} inactive for over {:?}; disconnecting", client, timeout);
            let session = self.sessions.lock().remove(&client);
            if let Some(session) = session {
                session.stop().ok();
            }
            self.disconnect(client).await;
        }

        let mut detached = self.detached.lock();
        let before = detached.len();
        detached.retain(|session| {
            if session.is_terminal() {
                return false;
            }
            if session.idle_for() > timeout {
                warn!("Detached session {} idle; stopping", session.id());
                session.stop().ok();
                return false;
            }
            true
        });

        let reaped = before - detached.len();
        if reaped > 0 {
            info!("🧹 Swept {} detached session(s)", reaped);
        }
    }

    /// Stop every session; used on shutdown
    pub fn stop_all(&self) {
        let live: Vec<_> = self
            .sessions
            .lock()
            .drain()
            .map(|(_, session)| session)
            .chain(self.detached.lock().drain(..))
            .collect();

        for session in live.iter().filter(|s| !s.is_terminal()) {
            session.stop().ok();
        }
        if !live.is_empty() {
            info!("Stopped {} session(s)", live.len());
        }
    }

    fn all_sessions(&self) -> Vec<(Option<ClientId>, Arc<SessionController>)> {
        let mut all: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .map(|(client, session)| (Some(*client), session.clone()))
            .collect();
        all.extend(self.detached.lock().iter().map(|s| (None, s.clone())));
        all
    }

    async fn health(&self) -> HealthReport {
        let sessions = self.all_sessions();
        HealthReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.metrics.uptime_secs(),
            clients: self.broadcaster.client_count().await,
            sessions: SessionCounts {
                active: sessions.iter().filter(|(_, s)| !s.is_terminal()).count(),
                total: sessions.len(),
            },
            metrics: self.metrics.snapshot(),
            memory_mb: self.metrics.memory_usage_mb(),
        }
    }

    async fn status_report(&self) -> StatusReport {
        StatusReport {
            clients: self.broadcaster.client_info().await,
            sessions: self
                .all_sessions()
                .into_iter()
                .map(|(client, session)| SessionEntry {
                    client: client.map(|c| c.to_string()),
                    status: session.status(),
                })
                .collect(),
        }
    }

    fn owner_of(&self, session_id: &str) -> Option<ClientId> {
        self.owners.lock().get(session_id).copied()
    }
}

/// Route session events to the client that owns the session
async fn dispatch_events(state: Arc<DaemonState>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged {
                session_id,
                from,
                to,
            } => {
                if let Some(client) = state.owner_of(&session_id) {
                    let session = state
                        .session_for(client)
                        .filter(|session| session.id() == session_id);
                    state
                        .reply(
                            client,
                            ServerEvent::StateChange {
                                session_id,
                                from,
                                to,
                            },
                        )
                        .await;
                    if let Some(session) = session {
                        state.reply(client, ServerEvent::Status(session.status())).await;
                    }
                }
            }
            SessionEvent::Failed {
                session_id,
                code,
                message,
            } => {
                if let Some(client) = state.owner_of(&session_id) {
                    state
                        .reply(
                            client,
                            ServerEvent::Error {
                                code,
                                message,
                                session_id: Some(session_id),
                            },
                        )
                        .await;
                }
            }
            SessionEvent::Finished {
                session_id,
                state: outcome,
                stats,
                report,
            } => {
                state.metrics.session_finished(outcome, &stats);
                let owner = state.owners.lock().remove(&session_id);
                if let (SessionState::Completed, Some(client)) = (outcome, owner) {
                    state
                        .reply(
                            client,
                            ServerEvent::Completed {
                                session_id,
                                timing: report,
                            },
                        )
                        .await;
                }
            }
        }
    }
    debug!("Session event dispatcher stopped");
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<DaemonState>) {
    let (client, mut outbound) = state.broadcaster.connect().await;
    state.metrics.client_connected();
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        // Registry dropped us (disconnect or sweep)
        let _ = sender.close().await;
    });

    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                state.broadcaster.touch(client).await;
                match ClientMessage::parse(text.as_str()) {
                    Ok(message) => state.handle_message(client, message).await,
                    Err(e) => state.handle_protocol_error(client, e).await,
                }
            }
            Some(Ok(Message::Binary(bytes))) => {
                state.broadcaster.touch(client).await;
                state
                    .handle_message(client, ClientMessage::AudioChunk(bytes.to_vec()))
                    .await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Client {} socket error: {}", client, e);
                break;
            }
        }
    }

    state.disconnect(client).await;
    writer.abort();
}

async fn health_handler(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    Json(state.health().await)
}

async fn status_handler(State(state): State<Arc<DaemonState>>) -> impl IntoResponse {
    Json(state.status_report().await)
}

/// The speakd network service
pub struct DaemonServer {
    state: Arc<DaemonState>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(DaemonState::new(config, tx)),
            events: rx,
        }
    }

    pub fn state(&self) -> Arc<DaemonState> {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/status", get(status_handler))
            .with_state(self.state.clone())
    }

    /// Serve on `listener` until `shutdown` resolves, then stop every session
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let state = self.state;
        let addr = listener.local_addr().context("Listener has no local address")?;

        let dispatcher = tokio::spawn(dispatch_events(state.clone(), self.events));
        let sweeper = tokio::spawn(sweep_loop(state.clone()));
        let telemetry = tokio::spawn(telemetry_loop(state.clone()));

        info!("🌐 Listening on ws://{}/ws (health: http://{}/health)", addr, addr);

        let token = state.shutdown.clone();
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                token.cancel();
            })
            .await
            .context("Server error");

        state.shutdown.cancel();
        state.stop_all();
        sweeper.abort();
        telemetry.abort();
        // Let final session events reach the metrics before exiting
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.abort();

        served
    }
}

async fn sweep_loop(state: Arc<DaemonState>) {
    let period = Duration::from_secs(state.config.server.sweep_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => state.sweep().await,
        }
    }
}

async fn telemetry_loop(state: Arc<DaemonState>) {
    let secs = state.config.server.telemetry_interval_secs;
    if secs == 0 {
        return;
    }

    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let event = ServerEvent::Telemetry(state.metrics.snapshot());
                let delivered = state.broadcaster.broadcast(&event).await;
                debug!("Telemetry sent to {} client(s)", delivered);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerSpec;

    fn quiet_config() -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.player.streaming = vec![PlayerSpec::Command {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
        }];
        config.player.file_fallback = None;
        config
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_control_without_session_is_no_session() {
        let server = DaemonServer::new(quiet_config());
        let state = server.state();
        let (client, mut rx) = state.broadcaster.connect().await;

        state
            .handle_message(client, ClientMessage::Control(ControlAction::Pause))
            .await;
        let event = next_event(&mut rx).await;
        assert_eq!(event["type"], "error");
        assert_eq!(event["data"]["code"], "no_session");
    }

    #[tokio::test]
    async fn test_unsupported_format_rejected() {
        let server = DaemonServer::new(quiet_config());
        let state = server.state();
        let (client, mut rx) = state.broadcaster.connect().await;

        let message =
            ClientMessage::parse(r#"{"type":"start_session","data":{"sampleRate":0}}"#).unwrap();
        state.handle_message(client, message).await;

        let event = next_event(&mut rx).await;
        assert_eq!(event["data"]["code"], "unsupported_format");
        assert!(state.session_for(client).is_none());
    }

    #[tokio::test]
    async fn test_restart_session_stops_previous() {
        let server = DaemonServer::new(quiet_config());
        let state = server.state();
        let (client, mut rx) = state.broadcaster.connect().await;

        state
            .handle_message(client, ClientMessage::StartSession { format: None })
            .await;
        let first = state.session_for(client).unwrap();
        assert_eq!(next_event(&mut rx).await["type"], "session_started");

        state
            .handle_message(client, ClientMessage::StartSession { format: None })
            .await;
        let second = state.session_for(client).unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.state(), SessionState::Stopped);
        assert!(!second.is_terminal());
        state.stop_all();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_transition_reaches_owner() {
        let DaemonServer { state, events } = DaemonServer::new(quiet_config());
        let dispatcher = tokio::spawn(dispatch_events(state.clone(), events));
        let (client, mut rx) = state.broadcaster.connect().await;

        state
            .handle_message(client, ClientMessage::StartSession { format: None })
            .await;
        let session = state.session_for(client).unwrap();

        let mut seen = Vec::new();
        let starting = loop {
            let event = next_event(&mut rx).await;
            if event["type"] == "state_change" && event["data"]["to"] == "starting" {
                break event;
            }
            seen.push(event);
        };
        assert_eq!(starting["data"]["from"], "idle");
        assert_eq!(starting["data"]["session_id"], session.id());
        assert!(seen.iter().all(|e| e["type"] != "error"), "{:?}", seen);

        state.stop_all();
        dispatcher.abort();
    }

    #[tokio::test]
    async fn test_disconnect_detaches_and_sweep_reaps() {
        let mut config = quiet_config();
        config.server.client_timeout_secs = 0;
        let server = DaemonServer::new(config);
        let state = server.state();
        let (client, _rx) = state.broadcaster.connect().await;

        state
            .handle_message(client, ClientMessage::AudioChunk(vec![0u8; 4800]))
            .await;
        let session = state.session_for(client).unwrap();

        state.disconnect(client).await;
        assert!(!session.is_terminal());
        assert_eq!(state.all_sessions().len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.sweep().await;
        assert!(state.all_sessions().is_empty());
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
