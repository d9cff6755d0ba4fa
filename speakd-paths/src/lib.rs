//! Cross-platform path utilities for speakd.
//!
//! Single source of truth for where the daemon keeps its configuration file
//! and the scratch directory used by the temp-file player fallback.
//!
//! # Platform Behavior
//!
//! | Platform | Config Directory | Playback Scratch Directory |
//! |----------|------------------|----------------------------|
//! | Linux    | `~/.config/speakd` | `$XDG_RUNTIME_DIR/speakd-playback` or `$TMPDIR/speakd-playback` |
//! | macOS    | `~/Library/Application Support/speakd` | `$TMPDIR/speakd-playback` |
//! | Windows  | `%APPDATA%/speakd` | `%TEMP%/speakd-playback` |

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

/// Errors specific to path operations.
#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not determine config directory")]
    NoConfigDirectory,

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Application identifier used in path construction.
const APP_NAME: &str = "speakd";

/// Configuration file name inside the config directory.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Scratch directory name for temp-file playback.
const PLAYBACK_DIR_NAME: &str = "speakd-playback";

/// Create `dir` (and parents) if missing, owner-only on Unix.
///
/// # Errors
/// Returns an error if the path exists but is not a directory, or if it cannot
/// be created.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        if !dir.is_dir() {
            return Err(PathError::NotADirectory(dir.to_path_buf()).into());
        }
        return Ok(());
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        fs::set_permissions(dir, perms)
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
    }

    Ok(())
}

/// Get the configuration directory.
///
/// # Platform Behavior
/// - **Linux**: `~/.config/speakd`
/// - **macOS**: `~/Library/Application Support/speakd`
/// - **Windows**: `%APPDATA%/speakd`
pub fn get_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or(PathError::NoConfigDirectory)?;
    let config_dir = base.join(APP_NAME);
    ensure_private_dir(&config_dir)?;
    Ok(config_dir)
}

/// Default location of the daemon's TOML configuration file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the playback scratch directory under `base` without touching the
/// filesystem.
pub fn playback_dir_in(base: &Path) -> PathBuf {
    base.join(PLAYBACK_DIR_NAME)
}

/// Get the scratch directory for temp-file playback, creating it if needed.
///
/// On Linux the per-user runtime directory is preferred (tmpfs, cleaned on
/// logout); everywhere else the system temp directory is used.
pub fn get_playback_dir() -> Result<PathBuf> {
    let base = dirs::runtime_dir()
        .filter(|dir| dir.exists())
        .unwrap_or_else(std::env::temp_dir);

    let dir = playback_dir_in(&base);
    ensure_private_dir(&dir)?;
    Ok(dir)
}
