//! Daemon-wide metrics collection

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tracing::debug;

use crate::models::{DaemonMetrics, SessionState, SessionStats};

/// Lock-free counters shared between the server, sessions and `/health`
pub struct MetricsCollector {
    started_at: Instant,
    clients_connected: AtomicU64,
    clients_total: AtomicU64,
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_stopped: AtomicU64,
    sessions_errored: AtomicU64,
    bytes_received: AtomicU64,
    chunks_received: AtomicU64,
    malformed_chunks: AtomicU64,
    underruns: AtomicU64,
    restarts: AtomicU64,

    // System monitoring
    system: Mutex<System>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            clients_connected: AtomicU64::new(0),
            clients_total: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_stopped: AtomicU64::new(0),
            sessions_errored: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            chunks_received: AtomicU64::new(0),
            malformed_chunks: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            system: Mutex::new(System::new()),
        }
    }

    pub fn client_connected(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
        self.clients_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        // Saturating: never wrap below zero
        let _ = self
            .clients_connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk(&self, len: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished session's outcome into the daemon totals
    pub fn session_finished(&self, state: SessionState, stats: &SessionStats) {
        let counter = match state {
            SessionState::Completed => &self.sessions_completed,
            SessionState::Stopped => &self.sessions_stopped,
            SessionState::Error => &self.sessions_errored,
            other => {
                debug!("Ignoring non-terminal session outcome: {}", other);
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.underruns
            .fetch_add(u64::from(stats.underruns), Ordering::Relaxed);
        self.restarts
            .fetch_add(u64::from(stats.restarts), Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn snapshot(&self) -> DaemonMetrics {
        DaemonMetrics {
            uptime_secs: self.uptime_secs(),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            clients_total: self.clients_total.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            sessions_errored: self.sessions_errored.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            malformed_chunks: self.malformed_chunks.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }

    /// Resident memory of this process in MB
    pub fn memory_usage_mb(&self) -> f64 {
        let pid = Pid::from_u32(std::process::id());
        let mut system = self.system.lock();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), false);
        system
            .process(pid)
            .map(|p| p.memory() as f64 / 1_048_576.0)
            .unwrap_or(0.0)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
