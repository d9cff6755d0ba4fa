//! Data models for session state and playback timing

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cap on the processing-overhead allowance added to expected duration
pub const MAX_OVERHEAD_ALLOWANCE: Duration = Duration::from_millis(50);

/// Fraction of raw audio time allowed as processing overhead
pub const OVERHEAD_ALLOWANCE_RATIO: f64 = 0.01;

/// Playback session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Playing,
    Paused,
    Ending,
    Completed,
    Stopped,
    Error,
}

impl SessionState {
    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Error)
    }

    /// A player process may be attached in this state
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Playing | Self::Paused | Self::Ending
        )
    }

    /// Legal edges of the session state machine
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        // Stop and unrecoverable failure are reachable from any live state
        if matches!(next, Stopped | Error) {
            return true;
        }

        matches!(
            (self, next),
            (Idle, Starting)
                | (Idle, Playing)
                | (Starting, Playing)
                | (Starting, Paused)
                | (Starting, Ending)
                | (Playing, Paused)
                | (Playing, Ending)
                | (Paused, Starting)
                | (Paused, Playing)
                | (Paused, Ending)
                | (Ending, Paused)
                | (Ending, Completed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Playing => "playing",
            SessionState::Paused => "paused",
            SessionState::Ending => "ending",
            SessionState::Completed => "completed",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Expected playback time for `bytes` at `bytes_per_second`, including a small
/// processing-overhead allowance (1%, capped at 50ms).
pub fn expected_duration(bytes: u64, bytes_per_second: u32) -> Duration {
    if bytes_per_second == 0 {
        return Duration::ZERO;
    }
    let raw = Duration::from_secs_f64(bytes as f64 / f64::from(bytes_per_second));
    let allowance = raw.mul_f64(OVERHEAD_ALLOWANCE_RATIO).min(MAX_OVERHEAD_ALLOWANCE);
    raw + allowance
}

/// Per-session counters and timing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub malformed_chunks: u64,
    pub bytes_dropped: u64,
    pub first_chunk_at: Option<DateTime<Utc>>,
    pub last_chunk_at: Option<DateTime<Utc>>,
    pub expected_duration_ms: f64,
    pub actual_duration_ms: Option<f64>,
    pub time_to_first_audio_ms: Option<f64>,
    pub paused_ms: f64,
    pub underruns: u32,
    pub restarts: u32,
}

impl SessionStats {
    /// Account for one received chunk and refresh the expected duration
    pub fn record_chunk(&mut self, len: usize, bytes_per_second: u32, at: DateTime<Utc>) {
        self.bytes_received += len as u64;
        self.chunks_received += 1;
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(at);
        }
        self.last_chunk_at = Some(at);
        self.expected_duration_ms =
            expected_duration(self.bytes_received, bytes_per_second).as_secs_f64() * 1000.0;
    }

    pub fn average_chunk_size(&self) -> f64 {
        if self.chunks_received == 0 {
            0.0
        } else {
            self.bytes_received as f64 / self.chunks_received as f64
        }
    }
}

/// Expected-vs-actual playback analysis sent with `completed` and
/// `timing_analysis`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingReport {
    pub expected_duration_ms: f64,
    pub actual_duration_ms: Option<f64>,
    pub accuracy_percent: Option<f64>,
    pub processing_overhead_ms: Option<f64>,
    pub chunk_count: u64,
    pub average_chunk_size: f64,
    pub bytes_received: u64,
    pub underruns: u32,
    pub restarts: u32,
    pub time_to_first_audio_ms: Option<f64>,
    pub paused_ms: f64,
    pub malformed_chunks: u64,
}

impl TimingReport {
    pub fn from_stats(stats: &SessionStats) -> Self {
        let expected = stats.expected_duration_ms;
        let accuracy = stats.actual_duration_ms.filter(|_| expected > 0.0).map(|actual| {
            let error = (actual - expected).abs() / expected * 100.0;
            (100.0 - error).clamp(0.0, 100.0)
        });

        Self {
            expected_duration_ms: expected,
            actual_duration_ms: stats.actual_duration_ms,
            accuracy_percent: accuracy,
            processing_overhead_ms: stats.actual_duration_ms.map(|actual| actual - expected),
            chunk_count: stats.chunks_received,
            average_chunk_size: stats.average_chunk_size(),
            bytes_received: stats.bytes_received,
            underruns: stats.underruns,
            restarts: stats.restarts,
            time_to_first_audio_ms: stats.time_to_first_audio_ms,
            paused_ms: stats.paused_ms,
            malformed_chunks: stats.malformed_chunks,
        }
    }
}

/// Ring buffer fill snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub size: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub grow_count: u32,
}

/// Daemon-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonMetrics {
    pub uptime_secs: f64,
    pub clients_connected: u64,
    pub clients_total: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_stopped: u64,
    pub sessions_errored: u64,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub malformed_chunks: u64,
    pub underruns: u64,
    pub restarts: u64,
}
