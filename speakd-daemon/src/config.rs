//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use speakd_audio::FormatSpec;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::player::{FileFallbackSpec, PlayerSpec};

/// Network front end and client bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// How often idle clients and finished sessions are swept
    pub sweep_interval_secs: u64,

    /// Inactivity after which a client (and its session) is torn down
    pub client_timeout_secs: u64,

    /// Minimum spacing between heartbeat log lines
    pub heartbeat_log_interval_secs: u64,

    /// Periodic telemetry broadcast; 0 disables it
    pub telemetry_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            sweep_interval_secs: 60,
            client_timeout_secs: 300,
            heartbeat_log_interval_secs: 30,
            telemetry_interval_secs: 0,
        }
    }
}

/// Buffering, pacing and keep-alive tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Initial ring buffer size in seconds of audio
    pub initial_buffer_secs: f64,

    /// Hard ceiling for ring buffer growth
    pub max_buffer_bytes: usize,

    /// Audio fed to the player per loop iteration
    pub slice_ms: u64,

    /// Buffered audio required before playback starts
    pub start_threshold_ms: u64,

    /// Start anyway after this long if the threshold is not met
    pub start_timeout_ms: u64,

    /// How far ahead of the playback clock the player is kept fed
    pub target_lead_ms: u64,

    /// Idle window tolerated after the last chunk before a stall is considered
    pub idle_grace_secs: f64,

    /// Lower bound for the keep-alive deadline
    pub stall_timeout_secs: f64,

    /// Keep-alive deadline scale over the remaining buffered playback time
    pub keepalive_multiplier: f64,

    /// How long the player may take to exit after its input is closed
    pub drain_timeout_secs: f64,

    pub underrun_poll_min_ms: u64,
    pub underrun_poll_max_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            initial_buffer_secs: speakd_audio::DEFAULT_BUFFER_SECONDS,
            max_buffer_bytes: 64 * 1024 * 1024,
            slice_ms: speakd_audio::DEFAULT_SLICE_MS,
            start_threshold_ms: 50,
            start_timeout_ms: 2000,
            target_lead_ms: 250,
            idle_grace_secs: 8.0,
            stall_timeout_secs: 30.0,
            keepalive_multiplier: 1.5,
            drain_timeout_secs: 10.0,
            underrun_poll_min_ms: 10,
            underrun_poll_max_ms: 200,
        }
    }
}

impl PlaybackConfig {
    pub fn slice(&self) -> Duration {
        Duration::from_millis(self.slice_ms.max(1))
    }

    pub fn start_threshold(&self) -> Duration {
        Duration::from_millis(self.start_threshold_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn target_lead(&self) -> Duration {
        Duration::from_millis(self.target_lead_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        secs(self.idle_grace_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        secs(self.stall_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        secs(self.drain_timeout_secs)
    }

    pub fn underrun_poll(&self) -> (Duration, Duration) {
        let min = self.underrun_poll_min_ms.max(1);
        (
            Duration::from_millis(min),
            Duration::from_millis(self.underrun_poll_max_ms.max(min)),
        )
    }
}

/// Native player selection and supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Audio per temp file in fallback mode
    pub fallback_chunk_ms: u64,

    pub max_restarts: u32,
    pub restart_backoff_base_ms: u64,
    pub restart_backoff_max_ms: u64,

    /// A write blocked longer than this counts as a crashed player
    pub backpressure_timeout_secs: f64,

    /// Time between SIGTERM and SIGKILL on stop
    pub terminate_grace_ms: u64,

    /// Streaming players tried in order
    pub streaming: Vec<PlayerSpec>,

    /// Last resort: play temp WAV files one after another
    pub file_fallback: Option<FileFallbackSpec>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            fallback_chunk_ms: 1000,
            max_restarts: 3,
            restart_backoff_base_ms: 500,
            restart_backoff_max_ms: 5000,
            backpressure_timeout_secs: 10.0,
            terminate_grace_ms: 500,
            streaming: vec![
                PlayerSpec::Sox { program: None },
                PlayerSpec::Ffplay { program: None },
            ],
            file_fallback: Some(FileFallbackSpec::platform_default()),
        }
    }
}

impl PlayerConfig {
    /// Delay before restart number `attempt` (0-based): base doubling, capped
    pub fn restart_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self
            .restart_backoff_base_ms
            .saturating_mul(factor)
            .min(self.restart_backoff_max_ms);
        Duration::from_millis(delay)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        secs(self.backpressure_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    pub server: ServerConfig,
    pub playback: PlaybackConfig,
    pub player: PlayerConfig,

    /// Format used when audio arrives before any `start_session`
    pub default_format: FormatSpec,
}

impl DaemonConfig {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let config_path = speakd_paths::default_config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from `path`, or write defaults there
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            // Load existing config
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;

            let mut config: DaemonConfig =
                toml::from_str(&contents).context("Failed to parse config file")?;

            config.config_path = path.to_path_buf();
            Ok(config)
        } else {
            // Create default config
            let config = Self {
                config_path: path.to_path_buf(),
                ..Self::default()
            };
            config.save().context("Failed to save default config")?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        // Ensure config directory exists
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = self.to_toml()?;

        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
