//! speakd metrics
//!
//! Session state machine, per-session timing statistics and daemon-wide
//! counters.

pub mod collector;
pub mod models;

// Re-export main types
pub use collector::MetricsCollector;
pub use models::{
    expected_duration, BufferSnapshot, DaemonMetrics, SessionState, SessionStats, TimingReport,
};
