//! Session keep-alive timer
//!
//! Re-armed on every chunk and control message. The deadline covers the
//! audio still waiting to be heard plus an idle grace window, so a session
//! only stalls once its producer has gone quiet *and* the player has run dry.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use speakd_metrics::SessionState;
use tracing::{debug, warn};

use crate::session::{SessionError, SessionShared};

/// Time until the session is considered stalled, measured from now
pub(crate) fn deadline(shared: &SessionShared, buffered: usize, lead: Duration) -> Duration {
    let playback = &shared.config.playback;
    let remaining = shared.format.duration_of(buffered as u64) + lead;
    let scaled = remaining.mul_f64(playback.keepalive_multiplier.max(1.0)) + playback.idle_grace();
    scaled.max(playback.stall_timeout())
}

/// Replace the session's keep-alive timer with a fresh one
pub(crate) fn arm(shared: &Arc<SessionShared>) {
    let wait = {
        let inner = shared.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        deadline(shared, inner.buffer.len(), inner.clock.lead(Instant::now()))
    };

    let session = Arc::downgrade(shared);
    let timer = tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        expire(session);
    });

    if let Some(previous) = shared.keepalive.lock().replace(timer) {
        previous.abort();
    }
}

fn expire(session: Weak<SessionShared>) {
    let Some(shared) = session.upgrade() else {
        return;
    };

    let rearm = {
        let mut inner = shared.inner.lock();
        match inner.state {
            state if state.is_terminal() => return,
            // Waiting on the client or on the player to drain
            SessionState::Paused | SessionState::Ending => true,
            _ if !inner.buffer.is_empty() || !inner.clock.lead(Instant::now()).is_zero() => true,
            _ => {
                let idle = inner.last_activity.elapsed().as_secs_f64();
                warn!(
                    "⏱️ Session {} stalled: no audio for {:.1}s and nothing left to play",
                    shared.id, idle
                );
                shared.fail(&mut inner, SessionError::Stalled(idle));
                false
            }
        }
    };

    if rearm {
        debug!("Session {} keep-alive extended", shared.id);
        arm(&shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::session::SessionEvent;
    use speakd_audio::AudioFormat;
    use tokio::sync::mpsc;

    fn shared_for(config: DaemonConfig) -> SessionShared {
        let (tx, _rx) = mpsc::unbounded_channel::<SessionEvent>();
        SessionShared::new(AudioFormat::default(), Arc::new(config), tx)
    }

    #[test]
    fn test_deadline_floor_is_stall_timeout() {
        let shared = shared_for(DaemonConfig::default());
        assert_eq!(
            deadline(&shared, 0, Duration::ZERO),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_deadline_scales_with_pending_audio() {
        let mut config = DaemonConfig::default();
        config.playback.stall_timeout_secs = 1.0;
        config.playback.idle_grace_secs = 2.0;
        config.playback.keepalive_multiplier = 1.5;
        let shared = shared_for(config);

        // 24kHz mono 16-bit: 48000 bytes per second
        let wait = deadline(&shared, 480_000, Duration::from_secs(2));
        assert_eq!(wait, Duration::from_secs(20));
    }
}
