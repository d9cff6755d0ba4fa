//! Playback loop: moves audio from a session's ring buffer into its player
//!
//! One task per session. It waits for enough audio to start, then feeds the
//! player in fixed slices paced against a wall-clock model of what has been
//! rendered. Running dry is an underrun, not an ending: the loop only
//! completes once the client has ended the stream and everything buffered has
//! been played out.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use speakd_metrics::SessionState;
use tracing::{debug, info, warn};

use crate::session::{millis, Result, SessionShared};
use crate::sink::{AudioSink, SinkError};

pub(crate) async fn run(shared: Arc<SessionShared>, mut sink: AudioSink) {
    if shared.loop_active.swap(true, Ordering::AcqRel) {
        warn!("Session {} already has a playback loop", shared.id);
        return;
    }

    let grace = shared.config.player.terminate_grace();
    let outcome = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => None,
        result = drive(&shared, &mut sink) => Some(result),
    };

    match outcome {
        None => {
            debug!("Session {} cancelled; stopping {}", shared.id, sink.player_name());
            sink.terminate(grace).await;
        }
        Some(Ok(())) => {}
        Some(Err(e)) => {
            warn!("❌ Session {} playback failed: {}", shared.id, e);
            sink.terminate(grace).await;
            let mut inner = shared.inner.lock();
            inner.stats.restarts = sink.restarts();
            shared.fail(&mut inner, e);
        }
    }

    shared.inner.lock().buffer.clear();
    shared.loop_active.store(false, Ordering::Release);
}

async fn drive(shared: &SessionShared, sink: &mut AudioSink) -> Result<()> {
    if !wait_for_start(shared).await {
        return Ok(());
    }

    let playback = &shared.config.playback;
    let slice = playback.slice();
    let slice_bytes = shared.format.bytes_for(slice);
    let (poll_min, poll_max) = playback.underrun_poll();
    let mut poll = poll_min;
    let mut in_underrun = false;

    loop {
        let (chunk, state, drained) = {
            let mut inner = shared.inner.lock();
            let chunk = match inner.state {
                SessionState::Paused => Vec::new(),
                _ => inner.buffer.read(slice_bytes),
            };
            (chunk, inner.state, inner.buffer.is_drained())
        };

        if state.is_terminal() {
            return Ok(());
        }
        if state == SessionState::Paused {
            shared.wake.notified().await;
            continue;
        }

        if chunk.is_empty() {
            if state == SessionState::Ending && drained {
                return drain(shared, sink).await;
            }

            // Held-back audio goes out before waiting on the producer
            let flushed = deliver(shared, sink, &[]).await?;
            if flushed > 0 {
                record_delivered(shared, flushed);
                continue;
            }

            {
                let mut inner = shared.inner.lock();
                if !in_underrun && inner.clock.lead(Instant::now()).is_zero() {
                    in_underrun = true;
                    inner.stats.underruns += 1;
                    debug!(
                        "Session {} underrun #{}: waiting for audio",
                        shared.id, inner.stats.underruns
                    );
                }
            }

            tokio::select! {
                _ = shared.wake.notified() => {
                    poll = poll_min;
                }
                _ = tokio::time::sleep(poll) => {
                    poll = (poll * 2).min(poll_max);
                }
            }
            continue;
        }

        in_underrun = false;
        poll = poll_min;

        let delivered = deliver(shared, sink, &chunk).await?;
        let (lead, utilization) = record_delivered(shared, delivered);

        if lead >= playback.target_lead() {
            tokio::time::sleep(pace(slice, utilization)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
}

/// Sleep between slices once the player is far enough ahead. A filling
/// buffer speeds feeding up; a nearly empty one slows it down.
fn pace(slice: Duration, utilization: f64) -> Duration {
    if utilization > 0.8 {
        slice / 2
    } else if utilization < 0.25 {
        slice.mul_f64(1.25)
    } else {
        slice
    }
}

/// Wait until playback may begin. Returns `false` if the session ended first.
async fn wait_for_start(shared: &SessionShared) -> bool {
    let playback = &shared.config.playback;
    let threshold = shared.format.bytes_for(playback.start_threshold());
    let give_up_at = Instant::now() + playback.start_timeout();

    loop {
        {
            let mut inner = shared.inner.lock();
            let buffered = inner.buffer.len();
            let ready = match inner.state {
                SessionState::Starting => {
                    if buffered >= threshold || inner.end_requested {
                        Some(false)
                    } else if buffered > 0 && Instant::now() >= give_up_at {
                        Some(true)
                    } else {
                        None
                    }
                }
                SessionState::Playing | SessionState::Ending => Some(false),
                SessionState::Paused => None,
                _ => return false,
            };

            if let Some(recovery) = ready {
                let now = Instant::now();
                inner.clock.start(now);
                if inner.stats.time_to_first_audio_ms.is_none() {
                    inner.stats.time_to_first_audio_ms =
                        Some(millis(now.saturating_duration_since(shared.created_at)));
                }
                if recovery {
                    info!(
                        "Session {}: start threshold not reached, playing {} buffered bytes",
                        shared.id, buffered
                    );
                }
                if inner.state == SessionState::Starting {
                    shared.transition(&mut inner, SessionState::Playing).ok();
                }
                return true;
            }
        }

        let remaining = give_up_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            shared.wake.notified().await;
        } else {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }
}

/// Feed one slice, or flush held-back audio when `chunk` is empty,
/// restarting a crashed player within its budget
async fn deliver(shared: &SessionShared, sink: &mut AudioSink, chunk: &[u8]) -> Result<usize> {
    loop {
        let outcome = if chunk.is_empty() {
            sink.flush().await
        } else {
            sink.feed(chunk).await
        };
        match outcome {
            Ok(delivered) => return Ok(delivered),
            Err(e @ SinkError::PlayerUnavailable(_)) => return Err(e.into()),
            Err(e) => {
                warn!("Session {}: {}", shared.id, e);
                let restarted = sink.restart().await;
                shared.inner.lock().stats.restarts = sink.restarts();
                restarted?;
            }
        }
    }
}

/// Advance the playback clock by audio that reached the player; returns the
/// resulting lead and buffer utilization
fn record_delivered(shared: &SessionShared, bytes: usize) -> (Duration, f64) {
    let mut inner = shared.inner.lock();
    if bytes > 0 {
        inner
            .clock
            .record_fed(shared.format.duration_of(bytes as u64));
    }
    (inner.clock.lead(Instant::now()), inner.buffer.utilization())
}

/// End of stream with an empty buffer: let the player finish, then complete
async fn drain(shared: &SessionShared, sink: &mut AudioSink) -> Result<()> {
    let timeout = shared.config.playback.drain_timeout();
    debug!("Session {} draining {}", shared.id, sink.player_name());
    sink.finish(timeout).await?;

    // Audio handed over but not yet due on the playback clock
    loop {
        let (lead, state) = {
            let inner = shared.inner.lock();
            (inner.clock.lead(Instant::now()), inner.state)
        };
        if state == SessionState::Paused {
            shared.wake.notified().await;
            continue;
        }
        if lead.is_zero() || state.is_terminal() {
            break;
        }
        tokio::time::sleep(lead).await;
    }

    let mut inner = shared.inner.lock();
    if inner.state.is_terminal() {
        return Ok(());
    }

    let now = Instant::now();
    inner.stats.actual_duration_ms = Some(millis(inner.clock.played(now)));
    inner.stats.restarts = sink.restarts();
    if inner.state != SessionState::Ending {
        shared.transition(&mut inner, SessionState::Ending)?;
    }
    shared.transition(&mut inner, SessionState::Completed)?;

    info!(
        "✅ Session {} completed: {:.0}ms expected, {:.0}ms played, {} underruns",
        shared.id,
        inner.stats.expected_duration_ms,
        inner.stats.actual_duration_ms.unwrap_or_default(),
        inner.stats.underruns
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pace_follows_buffer_pressure() {
        let slice = Duration::from_millis(40);
        assert_eq!(pace(slice, 0.9), Duration::from_millis(20));
        assert_eq!(pace(slice, 0.5), Duration::from_millis(40));
        assert_eq!(pace(slice, 0.1), Duration::from_millis(50));
    }
}
