//! Native player subprocess supervision
//!
//! An [`AudioSink`] owns one player process for a session. Streaming players
//! get raw PCM on stdin; when none of them can be spawned the sink falls back
//! to writing short WAV files and playing them one after another.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use speakd_audio::AudioFormat;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::config::PlayerConfig;
use crate::player::{find_executable, write_wav, FileFallbackSpec, PlayerCommand};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("No audio player available (tried: {0})")]
    PlayerUnavailable(String),

    #[error("Player {player} crashed: {detail}")]
    PlayerCrashed { player: String, detail: String },

    #[error("Player {player} accepted no input for {waited:?}")]
    BackpressureStall { player: String, waited: Duration },

    #[error("Player I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Process handle shared with the session so pause/resume can signal the
/// player without going through the feed loop.
#[derive(Debug, Default)]
pub struct PlayerControl {
    pid: AtomicU32,
    paused: AtomicBool,
}

impl PlayerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Freeze the player so audio already in its pipe is not rendered
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        if let Some(pid) = self.pid() {
            freeze(pid);
        }
    }

    pub fn resume(&self) {
        if let Some(pid) = self.pid() {
            thaw(pid);
        }
        self.paused.store(false, Ordering::Release);
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions
    unsafe { libc::kill(pid, signal) == 0 }
}

#[cfg(unix)]
fn freeze(pid: u32) {
    if !send_signal(pid, libc::SIGSTOP) {
        debug!("SIGSTOP to {} failed", pid);
    }
}

#[cfg(unix)]
fn thaw(pid: u32) {
    send_signal(pid, libc::SIGCONT);
}

/// Ask the player to exit; a stopped process cannot act on SIGTERM until it
/// is continued.
#[cfg(unix)]
fn request_exit(child: &mut Child) {
    if let Some(pid) = child.id() {
        send_signal(pid, libc::SIGTERM);
        send_signal(pid, libc::SIGCONT);
    }
}

// Without job-control signals the feed loop alone stops on pause
#[cfg(not(unix))]
fn freeze(_pid: u32) {}

#[cfg(not(unix))]
fn thaw(_pid: u32) {}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Kill pid {:?}: {}", child.id(), e);
    }
}

fn crashed(child: &mut Child, label: &str, fallback: &str) -> SinkError {
    let detail = match child.try_wait() {
        Ok(Some(status)) => status.to_string(),
        _ => fallback.to_string(),
    };
    SinkError::PlayerCrashed {
        player: label.to_string(),
        detail,
    }
}

struct StreamPlayer {
    command: PlayerCommand,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl StreamPlayer {
    fn spawn(command: PlayerCommand, control: &PlayerControl) -> io::Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        control.set_pid(child.id());
        debug!("Spawned {} (pid {:?})", command.label, child.id());

        Ok(Self {
            command,
            child,
            stdin,
        })
    }

    /// Write all of `chunk`, waiting on the pipe while the player is busy.
    ///
    /// Time spent blocked while the player is paused does not count toward
    /// the stall timeout.
    async fn write(&mut self, chunk: &[u8], stall: Duration, control: &PlayerControl) -> Result<()> {
        let StreamPlayer {
            command,
            child,
            stdin,
        } = self;
        let Some(stdin) = stdin.as_mut() else {
            return Err(crashed(child, &command.label, "input already closed"));
        };

        let mut written = 0;
        while written < chunk.len() {
            match tokio::time::timeout(stall, stdin.write(&chunk[written..])).await {
                Ok(Ok(0)) => return Err(crashed(child, &command.label, "input closed")),
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(crashed(child, &command.label, "broken pipe"))
                }
                Ok(Err(e)) => return Err(SinkError::Io(e)),
                Err(_) if control.is_paused() => continue,
                Err(_) => {
                    return Err(SinkError::BackpressureStall {
                        player: command.label.clone(),
                        waited: stall,
                    })
                }
            }
        }
        Ok(())
    }

    async fn kill(&mut self) {
        self.stdin = None;
        if let Err(e) = self.child.kill().await {
            debug!("Kill {}: {}", self.command.label, e);
        }
    }
}

struct FilePlayer {
    spec: FileFallbackSpec,
    dir: PathBuf,
    pending: Vec<u8>,
    chunk_bytes: usize,
}

impl FilePlayer {
    /// Write `data` to a temp WAV file and play it to completion
    async fn play(&self, data: &[u8], format: &AudioFormat, control: &PlayerControl) -> Result<()> {
        let file = tempfile::Builder::new()
            .prefix("speakd-")
            .suffix(".wav")
            .tempfile_in(&self.dir)?;
        write_wav(file.path(), format, data).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let command = self.spec.command(file.path(), format);
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SinkError::PlayerUnavailable(format!("{}: {}", command.label, e)))?;

        control.set_pid(child.id());
        let status = child.wait().await;
        control.set_pid(None);

        match status? {
            status if status.success() => Ok(()),
            status => Err(SinkError::PlayerCrashed {
                player: command.label,
                detail: status.to_string(),
            }),
        }
    }
}

enum Backend {
    Stream(StreamPlayer),
    File(FilePlayer),
}

/// Supervisor for one session's player process
pub struct AudioSink {
    format: AudioFormat,
    config: PlayerConfig,
    control: Arc<PlayerControl>,
    backend: Backend,
    restarts: u32,
}

impl AudioSink {
    /// Spawn the first available player for `format`.
    ///
    /// Streaming players are tried in configured order; the temp-file player
    /// is used only if none of them can be spawned.
    pub fn start(format: AudioFormat, config: &PlayerConfig, control: Arc<PlayerControl>) -> Result<Self> {
        let mut tried = Vec::new();

        for spec in &config.streaming {
            let command = spec.command(&format);
            let label = command.label.clone();
            match StreamPlayer::spawn(command, &control) {
                Ok(player) => {
                    info!("🔊 Playing {} through {}", format, label);
                    return Ok(Self::with_backend(format, config, control, Backend::Stream(player)));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Player {} not installed, trying next", label);
                    tried.push(label);
                }
                Err(e) => {
                    warn!("Failed to start {}: {}", label, e);
                    tried.push(label);
                }
            }
        }

        if let Some(spec) = &config.file_fallback {
            if find_executable(&spec.program).is_some() {
                let dir = speakd_paths::get_playback_dir()
                    .map_err(|e| SinkError::PlayerUnavailable(format!("{} ({:#})", spec.program, e)))?;
                let chunk_ms = config.fallback_chunk_ms.max(1);
                let player = FilePlayer {
                    spec: spec.clone(),
                    dir,
                    pending: Vec::new(),
                    chunk_bytes: format.bytes_for(Duration::from_millis(chunk_ms)),
                };
                warn!(
                    "No streaming player available (tried: {}); using temp-file playback via {}",
                    tried.join(", "),
                    spec.program
                );
                return Ok(Self::with_backend(format, config, control, Backend::File(player)));
            }
            tried.push(spec.program.clone());
        }

        Err(SinkError::PlayerUnavailable(tried.join(", ")))
    }

    fn with_backend(
        format: AudioFormat,
        config: &PlayerConfig,
        control: Arc<PlayerControl>,
        backend: Backend,
    ) -> Self {
        Self {
            format,
            config: config.clone(),
            control,
            backend,
            restarts: 0,
        }
    }

    pub fn player_name(&self) -> String {
        match &self.backend {
            Backend::Stream(player) => player.command.label.clone(),
            Backend::File(player) => format!("{} (file)", player.spec.program),
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Hand `chunk` to the player, suspending while it applies backpressure.
    ///
    /// Returns the bytes that reached a player. The temp-file player holds
    /// audio back until it has a full file's worth, so this may be 0.
    pub async fn feed(&mut self, chunk: &[u8]) -> Result<usize> {
        match &mut self.backend {
            Backend::Stream(player) => {
                player
                    .write(chunk, self.config.backpressure_timeout(), &self.control)
                    .await?;
                Ok(chunk.len())
            }
            Backend::File(player) => {
                player.pending.extend_from_slice(chunk);
                if player.pending.len() < player.chunk_bytes {
                    return Ok(0);
                }
                let mut data = std::mem::take(&mut player.pending);
                if let Err(e) = player.play(&data, &self.format, &self.control).await {
                    // Keep everything but this chunk; the caller feeds it again
                    data.truncate(data.len().saturating_sub(chunk.len()));
                    player.pending = data;
                    return Err(e);
                }
                Ok(data.len())
            }
        }
    }

    /// Play audio held back by the temp-file player.
    ///
    /// Called when the ring buffer runs dry so a pause in the stream never
    /// strands audio short of a full file. Streaming players hold nothing.
    pub async fn flush(&mut self) -> Result<usize> {
        match &mut self.backend {
            Backend::Stream(_) => Ok(0),
            Backend::File(player) => {
                if player.pending.is_empty() {
                    return Ok(0);
                }
                let data = std::mem::take(&mut player.pending);
                if let Err(e) = player.play(&data, &self.format, &self.control).await {
                    player.pending = data;
                    return Err(e);
                }
                Ok(data.len())
            }
        }
    }

    /// Replace a dead player after an exponential backoff.
    ///
    /// Fails once the restart budget is spent.
    pub async fn restart(&mut self) -> Result<()> {
        if self.restarts >= self.config.max_restarts {
            return Err(SinkError::PlayerCrashed {
                player: self.player_name(),
                detail: format!("gave up after {} restarts", self.restarts),
            });
        }

        let delay = self.config.restart_backoff(self.restarts);
        self.restarts += 1;
        warn!(
            "Restarting {} in {:?} (attempt {}/{})",
            self.player_name(),
            delay,
            self.restarts,
            self.config.max_restarts
        );

        if let Backend::Stream(player) = &mut self.backend {
            player.kill().await;
        }
        self.control.set_pid(None);
        tokio::time::sleep(delay).await;

        if let Backend::Stream(player) = &mut self.backend {
            let command = player.command.clone();
            let label = command.label.clone();
            *player = StreamPlayer::spawn(command, &self.control)
                .map_err(|e| SinkError::PlayerUnavailable(format!("{}: {}", label, e)))?;
        }
        Ok(())
    }

    /// Close the player's input and wait for it to finish rendering.
    ///
    /// Returns the exit status, or `None` when the player had to be killed or
    /// there was no long-lived process.
    pub async fn finish(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        match &mut self.backend {
            Backend::Stream(player) => {
                player.stdin = None;
                loop {
                    match tokio::time::timeout(timeout, player.child.wait()).await {
                        Ok(status) => {
                            self.control.set_pid(None);
                            let status = status?;
                            if !status.success() {
                                warn!("{} exited with {} after draining", player.command.label, status);
                            }
                            return Ok(Some(status));
                        }
                        Err(_) if self.control.is_paused() => continue,
                        Err(_) => {
                            warn!(
                                "{} still running {:?} after end of input; killing",
                                player.command.label, timeout
                            );
                            player.kill().await;
                            self.control.set_pid(None);
                            return Ok(None);
                        }
                    }
                }
            }
            Backend::File(player) => {
                if !player.pending.is_empty() {
                    let data = std::mem::take(&mut player.pending);
                    player.play(&data, &self.format, &self.control).await?;
                }
                Ok(None)
            }
        }
    }

    /// Stop the player: SIGTERM, then SIGKILL after `grace`
    pub async fn terminate(&mut self, grace: Duration) {
        match &mut self.backend {
            Backend::Stream(player) => {
                player.stdin = None;
                request_exit(&mut player.child);

                if tokio::time::timeout(grace, player.child.wait()).await.is_err() {
                    debug!("{} ignored SIGTERM; killing", player.command.label);
                    player.kill().await;
                }
            }
            Backend::File(player) => {
                // The in-flight file player is killed when its feed is dropped
                player.pending.clear();
            }
        }
        self.control.set_pid(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerSpec;
    use std::path::Path;

    fn command_player(script: &str) -> PlayerSpec {
        PlayerSpec::Command {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn config(streaming: Vec<PlayerSpec>) -> PlayerConfig {
        PlayerConfig {
            streaming,
            file_fallback: None,
            max_restarts: 2,
            restart_backoff_base_ms: 5,
            restart_backoff_max_ms: 20,
            backpressure_timeout_secs: 2.0,
            terminate_grace_ms: 200,
            ..PlayerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_falls_through_missing_players() {
        let config = config(vec![
            PlayerSpec::Command {
                program: "speakd-missing-player".to_string(),
                args: vec![],
            },
            command_player("cat > /dev/null"),
        ]);
        let control = Arc::new(PlayerControl::new());
        let mut sink = AudioSink::start(AudioFormat::default(), &config, control.clone()).unwrap();
        assert_eq!(sink.player_name(), "sh");
        assert!(control.pid().is_some());

        sink.feed(&[0u8; 4800]).await.unwrap();
        let status = sink.finish(Duration::from_secs(2)).await.unwrap();
        assert!(status.unwrap().success());
        assert!(control.pid().is_none());
    }

    #[tokio::test]
    async fn test_no_player_available() {
        let config = config(vec![PlayerSpec::Command {
            program: "speakd-missing-player".to_string(),
            args: vec![],
        }]);
        let result = AudioSink::start(AudioFormat::default(), &config, Arc::new(PlayerControl::new()));
        assert!(matches!(result, Err(SinkError::PlayerUnavailable(tried)) if tried.contains("speakd-missing-player")));
    }

    #[tokio::test]
    async fn test_crash_detected_and_restart_budget() {
        let config = config(vec![command_player("exit 1")]);
        let mut sink =
            AudioSink::start(AudioFormat::default(), &config, Arc::new(PlayerControl::new())).unwrap();

        // The pipe may absorb a few writes before the shell is gone
        let mut crashed = false;
        for _ in 0..200 {
            if sink.feed(&[0u8; 2400]).await.is_err() {
                crashed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(crashed, "writing to an exited player must fail");

        sink.restart().await.unwrap();
        sink.restart().await.unwrap();
        assert_eq!(sink.restarts(), 2);
        assert!(matches!(
            sink.restart().await,
            Err(SinkError::PlayerCrashed { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_paused_player() {
        let config = config(vec![command_player("sleep 30")]);
        let control = Arc::new(PlayerControl::new());
        let mut sink = AudioSink::start(AudioFormat::default(), &config, control.clone()).unwrap();

        control.pause();
        assert!(control.is_paused());

        let started = std::time::Instant::now();
        sink.terminate(Duration::from_millis(500)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(control.pid().is_none());
    }

    /// Temp-file fallback whose player appends each file's size to `marker`
    #[cfg(unix)]
    fn file_fallback_config(marker: &Path) -> PlayerConfig {
        let mut config = config(vec![PlayerSpec::Command {
            program: "speakd-missing-player".to_string(),
            args: vec![],
        }]);
        config.file_fallback = Some(FileFallbackSpec {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("wc -c < \"$0\" >> '{}'", marker.display()),
                "{file}".to_string(),
            ],
        });
        config.fallback_chunk_ms = 100;
        config
    }

    #[cfg(unix)]
    fn played_sizes(marker: &Path) -> Vec<usize> {
        std::fs::read_to_string(marker)
            .unwrap_or_default()
            .lines()
            .map(|line| line.trim().parse().unwrap())
            .collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_fallback_batches_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("played");
        let config = file_fallback_config(&marker);
        let control = Arc::new(PlayerControl::new());
        let mut sink = AudioSink::start(AudioFormat::default(), &config, control.clone()).unwrap();
        assert_eq!(sink.player_name(), "sh (file)");

        // Held until a full file's worth has arrived
        assert_eq!(sink.feed(&[0u8; 2400]).await.unwrap(), 0);
        assert!(played_sizes(&marker).is_empty());
        assert_eq!(sink.feed(&[0u8; 2500]).await.unwrap(), 4900);
        assert_eq!(played_sizes(&marker).len(), 1);

        // A short remainder goes out on flush
        assert_eq!(sink.feed(&[0u8; 1000]).await.unwrap(), 0);
        assert_eq!(sink.flush().await.unwrap(), 1000);
        assert_eq!(sink.flush().await.unwrap(), 0);

        // ...and on finish
        assert_eq!(sink.feed(&[0u8; 500]).await.unwrap(), 0);
        assert!(sink.finish(Duration::from_secs(2)).await.unwrap().is_none());

        let sizes = played_sizes(&marker);
        assert_eq!(sizes.len(), 3);
        let header = sizes[0] - 4900;
        assert_eq!(sizes[1], header + 1000);
        assert_eq!(sizes[2], header + 500);

        // Terminating drops audio that never reached a file
        assert_eq!(sink.feed(&[0u8; 700]).await.unwrap(), 0);
        sink.terminate(Duration::from_millis(200)).await;
        assert_eq!(sink.flush().await.unwrap(), 0);
        assert_eq!(played_sizes(&marker).len(), 3);
        assert!(control.pid().is_none());
    }

    #[tokio::test]
    async fn test_player_not_reading_input_stalls() {
        let mut config = config(vec![command_player("sleep 30")]);
        config.backpressure_timeout_secs = 0.3;
        let mut sink =
            AudioSink::start(AudioFormat::default(), &config, Arc::new(PlayerControl::new())).unwrap();

        // Far more than a pipe buffer holds
        let audio = vec![0u8; 1 << 20];
        let result = sink.feed(&audio).await;
        assert!(
            matches!(result, Err(SinkError::BackpressureStall { .. })),
            "{:?}",
            result
        );
        sink.terminate(Duration::from_millis(200)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_paused_player_does_not_stall() {
        let mut config = config(vec![command_player("sleep 30")]);
        config.backpressure_timeout_secs = 0.3;
        let control = Arc::new(PlayerControl::new());
        let mut sink = AudioSink::start(AudioFormat::default(), &config, control.clone()).unwrap();

        control.pause();
        let audio = vec![0u8; 1 << 20];
        let blocked = tokio::time::timeout(Duration::from_secs(1), sink.feed(&audio)).await;
        assert!(blocked.is_err(), "a paused player must keep the feed waiting");

        control.resume();
        sink.terminate(Duration::from_millis(200)).await;
    }
}
