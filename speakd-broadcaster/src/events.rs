use serde::Serialize;
use serde_json::Value;
use speakd_audio::AudioFormat;
use speakd_metrics::{BufferSnapshot, DaemonMetrics, SessionState, TimingReport};

/// Stable error codes reported to clients
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnsupportedFormat,
    PlayerUnavailable,
    PlayerCrashed,
    Stalled,
    ProtocolError,
    NoSession,
    InvalidTransition,
}

/// Point-in-time view of one session, answered to `status` requests
#[derive(Serialize, Debug, Clone)]
pub struct StatusSnapshot {
    pub session_id: Option<String>,
    pub state: SessionState,
    pub format: Option<AudioFormat>,
    pub player: Option<String>,
    pub buffer: BufferSnapshot,
    pub timing: Option<TimingReport>,
}

impl StatusSnapshot {
    /// Snapshot for a client with no session
    pub fn idle() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            format: None,
            player: None,
            buffer: BufferSnapshot::default(),
            timing: None,
        }
    }
}

/// Events sent from the daemon to clients.
///
/// On the wire each event is `{"type": .., "timestamp": .., "data": {..}}`.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionStarted {
        session_id: String,
        format: AudioFormat,
        player: String,
    },

    Status(StatusSnapshot),

    TimingAnalysis {
        session_id: Option<String>,
        timing: Option<TimingReport>,
    },

    StateChange {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },

    /// Session drained after `end_stream`
    Completed {
        session_id: String,
        timing: TimingReport,
    },

    Error {
        code: ErrorCode,
        message: String,
        session_id: Option<String>,
    },

    Heartbeat {
        uptime_secs: f64,
    },

    Telemetry(DaemonMetrics),
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            session_id: None,
        }
    }

    /// Wire type name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::Status(_) => "status",
            Self::TimingAnalysis { .. } => "timing_analysis",
            Self::StateChange { .. } => "state_change",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Telemetry(_) => "telemetry",
        }
    }

    /// Serialize to a text frame stamped with the current time (ms since epoch)
    pub fn to_message(&self) -> Result<String, serde_json::Error> {
        self.to_message_at(chrono::Utc::now().timestamp_millis())
    }

    pub fn to_message_at(&self, timestamp_ms: i64) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut value {
            fields.insert("timestamp".to_string(), Value::from(timestamp_ms));
        }
        serde_json::to_string(&value)
    }
}
