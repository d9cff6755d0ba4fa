//! Playback session state machine
//!
//! A [`SessionController`] owns everything for one stream: the ring buffer,
//! statistics, the playback clock, the keep-alive timer and the handle used
//! to signal the player. The chunk path (client messages) writes into the
//! buffer; the playback loop task is the only reader.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use speakd_audio::{AudioError, AudioFormat, RingBuffer};
use speakd_broadcaster::{ErrorCode, StatusSnapshot};
use speakd_metrics::{BufferSnapshot, SessionState, SessionStats, TimingReport};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::sink::{AudioSink, PlayerControl, SinkError};
use crate::{keepalive, playback};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Format(#[from] AudioError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Cannot {action} a session that is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },

    #[error("No audio received for {0:.1}s")]
    Stalled(f64),

    #[error("No active session")]
    NoSession,
}

impl SessionError {
    /// Code reported to the client
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::Format(_) => ErrorCode::UnsupportedFormat,
            SessionError::Sink(SinkError::PlayerUnavailable(_)) => ErrorCode::PlayerUnavailable,
            SessionError::Sink(_) => ErrorCode::PlayerCrashed,
            SessionError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            SessionError::Stalled(_) => ErrorCode::Stalled,
            SessionError::NoSession => ErrorCode::NoSession,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Notifications published by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
    /// Unrecoverable failure, published just before the move to `error`
    Failed {
        session_id: String,
        code: ErrorCode,
        message: String,
    },
    /// Terminal state reached
    Finished {
        session_id: String,
        state: SessionState,
        stats: SessionStats,
        report: TimingReport,
    },
}

/// Wall-clock view of what the player has been given versus what it has
/// rendered. Paused time is excluded.
#[derive(Debug, Default)]
pub(crate) struct PlaybackClock {
    started_at: Option<Instant>,
    fed: Duration,
    paused_total: Duration,
    paused_since: Option<Instant>,
}

impl PlaybackClock {
    pub(crate) fn start(&mut self, now: Instant) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub(crate) fn record_fed(&mut self, audio: Duration) {
        self.fed += audio;
    }

    pub(crate) fn pause(&mut self, now: Instant) {
        if self.is_started() && self.paused_since.is_none() {
            self.paused_since = Some(now);
        }
    }

    pub(crate) fn resume(&mut self, now: Instant) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
    }

    pub(crate) fn paused_total(&self, now: Instant) -> Duration {
        let current = self
            .paused_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.paused_total + current
    }

    /// Audio time rendered since playback started
    pub(crate) fn played(&self, now: Instant) -> Duration {
        self.started_at
            .map(|start| {
                now.saturating_duration_since(start)
                    .saturating_sub(self.paused_total(now))
            })
            .unwrap_or_default()
    }

    /// Audio handed to the player that it has not rendered yet
    pub(crate) fn lead(&self, now: Instant) -> Duration {
        self.fed.saturating_sub(self.played(now))
    }
}

pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) stats: SessionStats,
    pub(crate) buffer: RingBuffer,
    pub(crate) clock: PlaybackClock,
    pub(crate) end_requested: bool,
    pub(crate) player: Option<String>,
    pub(crate) last_activity: Instant,
}

pub(crate) struct SessionShared {
    pub(crate) id: String,
    pub(crate) format: AudioFormat,
    pub(crate) config: Arc<DaemonConfig>,
    pub(crate) created_at: Instant,
    pub(crate) inner: Mutex<SessionInner>,
    /// Wakes the playback loop: new audio, end of stream, resume
    pub(crate) wake: Notify,
    pub(crate) loop_active: AtomicBool,
    pub(crate) cancel: CancellationToken,
    pub(crate) control: Arc<PlayerControl>,
    pub(crate) keepalive: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionShared {
    pub(crate) fn new(
        format: AudioFormat,
        config: Arc<DaemonConfig>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let now = Instant::now();
        let buffer = RingBuffer::for_duration(
            &format,
            Duration::try_from_secs_f64(config.playback.initial_buffer_secs.max(0.05))
                .unwrap_or(Duration::from_secs(2)),
            config.playback.max_buffer_bytes,
        );

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            format,
            config,
            created_at: now,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                stats: SessionStats::default(),
                buffer,
                clock: PlaybackClock::default(),
                end_requested: false,
                player: None,
                last_activity: now,
            }),
            wake: Notify::new(),
            loop_active: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            control: Arc::new(PlayerControl::new()),
            keepalive: Mutex::new(None),
            events,
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session {} event dropped: no listener", self.id);
        }
    }

    /// Move to `next`, publishing the change.
    ///
    /// Entering a terminal state finalizes the statistics, cancels the
    /// playback loop and disarms the keep-alive timer.
    pub(crate) fn transition(&self, inner: &mut SessionInner, next: SessionState) -> Result<()> {
        let from = inner.state;
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                action: transition_action(next),
                state: from,
            });
        }

        inner.state = next;
        info!("Session {}: {} → {}", self.id, from, next);
        self.emit(SessionEvent::StateChanged {
            session_id: self.id.clone(),
            from,
            to: next,
        });

        if next.is_terminal() {
            let now = Instant::now();
            if inner.stats.actual_duration_ms.is_none() && inner.clock.is_started() {
                inner.stats.actual_duration_ms = Some(millis(inner.clock.played(now)));
            }
            inner.stats.paused_ms = millis(inner.clock.paused_total(now));

            self.cancel.cancel();
            if let Some(timer) = self.keepalive.lock().take() {
                timer.abort();
            }

            self.emit(SessionEvent::Finished {
                session_id: self.id.clone(),
                state: next,
                stats: inner.stats.clone(),
                report: TimingReport::from_stats(&inner.stats),
            });
        }
        Ok(())
    }

    /// Report an unrecoverable error and move to `error`
    pub(crate) fn fail(&self, inner: &mut SessionInner, error: SessionError) {
        if inner.state.is_terminal() {
            return;
        }
        self.emit(SessionEvent::Failed {
            session_id: self.id.clone(),
            code: error.code(),
            message: error.to_string(),
        });
        if let Err(e) = self.transition(inner, SessionState::Error) {
            warn!("Session {}: {}", self.id, e);
        }
    }
}

fn transition_action(next: SessionState) -> &'static str {
    match next {
        SessionState::Paused => "pause",
        SessionState::Playing | SessionState::Starting => "resume",
        SessionState::Ending => "end",
        SessionState::Stopped => "stop",
        _ => "change",
    }
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Handle to one playback session
pub struct SessionController {
    shared: Arc<SessionShared>,
}

impl SessionController {
    /// Create an idle session for `format`. Nothing is spawned until
    /// [`begin`](Self::begin), so callers can route its events first.
    pub fn new(
        format: AudioFormat,
        config: Arc<DaemonConfig>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared::new(format, config, events)),
        }
    }

    /// Create a session for `format` and spawn its player
    pub fn start(
        format: AudioFormat,
        config: Arc<DaemonConfig>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self> {
        let session = Self::new(format, config, events);
        session.begin()?;
        Ok(session)
    }

    /// Spawn the player and the playback loop.
    ///
    /// The player is running (or the start failed) before this returns, so a
    /// `session_started` reply always means audio can flow.
    pub fn begin(&self) -> Result<()> {
        let shared = &self.shared;
        let format = shared.format;

        let state = shared.inner.lock().state;
        if state != SessionState::Idle {
            return Err(SessionError::InvalidTransition {
                action: "start",
                state,
            });
        }

        let sink = match AudioSink::start(format, &shared.config.player, shared.control.clone()) {
            Ok(sink) => sink,
            Err(e) => {
                // Never announced to the client, so no events
                shared.inner.lock().state = SessionState::Error;
                return Err(e.into());
            }
        };

        {
            let mut inner = shared.inner.lock();
            inner.player = Some(sink.player_name());
            shared.transition(&mut inner, SessionState::Starting)?;
        }

        tokio::spawn(playback::run(shared.clone(), sink));
        keepalive::arm(shared);

        info!("🎧 Session {} started ({})", shared.id, format);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn player_name(&self) -> Option<String> {
        self.shared.inner.lock().player.clone()
    }

    /// Time since the last chunk or control message
    pub fn idle_for(&self) -> Duration {
        self.shared.inner.lock().last_activity.elapsed()
    }

    /// Queue a chunk for playback; returns the bytes accepted
    pub fn on_chunk_received(&self, chunk: &[u8]) -> Result<usize> {
        let written = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                return Err(SessionError::InvalidTransition {
                    action: "queue audio for",
                    state: inner.state,
                });
            }

            inner
                .stats
                .record_chunk(chunk.len(), self.shared.format.bytes_per_second(), Utc::now());
            let written = inner.buffer.write(chunk);
            if written < chunk.len() {
                inner.stats.bytes_dropped += (chunk.len() - written) as u64;
            }
            inner.last_activity = Instant::now();
            written
        };

        self.shared.wake.notify_one();
        keepalive::arm(&self.shared);
        Ok(written)
    }

    /// Count a chunk that could not be decoded
    pub fn record_malformed(&self) {
        let mut inner = self.shared.inner.lock();
        inner.stats.malformed_chunks += 1;
        inner.last_activity = Instant::now();
    }

    /// Producer is done; play out what is buffered, then complete
    pub fn on_end_stream(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                SessionState::Starting | SessionState::Playing => {
                    inner.end_requested = true;
                    self.shared.transition(&mut inner, SessionState::Ending)?;
                }
                // Recorded now, applied on resume
                SessionState::Paused | SessionState::Ending => inner.end_requested = true,
                state => {
                    return Err(SessionError::InvalidTransition {
                        action: "end",
                        state,
                    })
                }
            }
            inner.buffer.mark_finished();
            inner.last_activity = Instant::now();
            debug!(
                "Session {}: end of stream with {} bytes buffered",
                self.shared.id,
                inner.buffer.len()
            );
        }

        self.shared.wake.notify_one();
        keepalive::arm(&self.shared);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            SessionState::Paused => return Ok(()),
            SessionState::Starting | SessionState::Playing | SessionState::Ending => {}
            state => {
                return Err(SessionError::InvalidTransition {
                    action: "pause",
                    state,
                })
            }
        }

        self.shared.transition(&mut inner, SessionState::Paused)?;
        inner.clock.pause(Instant::now());
        inner.last_activity = Instant::now();
        self.shared.control.pause();
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                SessionState::Paused => {}
                SessionState::Starting | SessionState::Playing | SessionState::Ending => {
                    return Ok(())
                }
                state => {
                    return Err(SessionError::InvalidTransition {
                        action: "resume",
                        state,
                    })
                }
            }

            let next = if inner.end_requested {
                SessionState::Ending
            } else if inner.clock.is_started() {
                SessionState::Playing
            } else {
                SessionState::Starting
            };

            self.shared.control.resume();
            inner.clock.resume(Instant::now());
            inner.last_activity = Instant::now();
            self.shared.transition(&mut inner, next)?;
        }

        self.shared.wake.notify_one();
        keepalive::arm(&self.shared);
        Ok(())
    }

    /// Stop immediately. The player is terminated by the playback loop, which
    /// also clears the buffer once it has observed the stop.
    pub fn stop(&self) -> Result<TimingReport> {
        let mut inner = self.shared.inner.lock();
        if inner.state.is_terminal() {
            return Err(SessionError::InvalidTransition {
                action: "stop",
                state: inner.state,
            });
        }

        self.shared.transition(&mut inner, SessionState::Stopped)?;
        if !self
            .shared
            .loop_active
            .load(std::sync::atomic::Ordering::Acquire)
        {
            inner.buffer.clear();
        }
        Ok(TimingReport::from_stats(&inner.stats))
    }

    pub fn timing_report(&self) -> TimingReport {
        TimingReport::from_stats(&self.shared.inner.lock().stats)
    }

    pub fn buffer_snapshot(&self) -> BufferSnapshot {
        let inner = self.shared.inner.lock();
        BufferSnapshot {
            size: inner.buffer.len(),
            capacity: inner.buffer.capacity(),
            utilization: inner.buffer.utilization(),
            grow_count: inner.buffer.grow_count(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.inner.lock().stats.clone()
    }

    pub fn status(&self) -> StatusSnapshot {
        let inner = self.shared.inner.lock();
        StatusSnapshot {
            session_id: Some(self.shared.id.clone()),
            state: inner.state,
            format: Some(self.shared.format),
            player: inner.player.clone(),
            buffer: BufferSnapshot {
                size: inner.buffer.len(),
                capacity: inner.buffer.capacity(),
                utilization: inner.buffer.utilization(),
                grow_count: inner.buffer.grow_count(),
            },
            timing: Some(TimingReport::from_stats(&inner.stats)),
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if !inner.state.is_terminal() {
            warn!("Session {} dropped while {}; stopping", self.shared.id, inner.state);
            if let Err(e) = self.shared.transition(&mut inner, SessionState::Stopped) {
                warn!("Session {}: {}", self.shared.id, e);
            }
        }
    }
}
