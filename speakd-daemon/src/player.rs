//! Native audio player command lines
//!
//! Streaming players read raw PCM on stdin. The file fallback plays one WAV
//! file per invocation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use speakd_audio::AudioFormat;

/// A streaming player that accepts raw PCM on stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PlayerSpec {
    /// SoX `play`
    Sox {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<String>,
    },
    /// FFmpeg `ffplay`
    Ffplay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<String>,
    },
    /// ALSA `aplay`
    Aplay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<String>,
    },
    /// Arbitrary command; args may use `{sample_rate}`, `{channels}`,
    /// `{bit_depth}` and `{encoding}`
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Fully resolved process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCommand {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
}

impl PlayerSpec {
    pub fn label(&self) -> String {
        match self {
            PlayerSpec::Sox { .. } => "sox".to_string(),
            PlayerSpec::Ffplay { .. } => "ffplay".to_string(),
            PlayerSpec::Aplay { .. } => "aplay".to_string(),
            PlayerSpec::Command { program, .. } => program.clone(),
        }
    }

    /// Build the command line for `format`
    pub fn command(&self, format: &AudioFormat) -> PlayerCommand {
        let rate = format.sample_rate().to_string();
        let channels = format.channels().to_string();
        let bits = format.bit_depth().to_string();

        let (program, args) = match self {
            PlayerSpec::Sox { program } => (
                program.clone().unwrap_or_else(|| "play".to_string()),
                vec![
                    "-q".to_string(),
                    "-t".to_string(),
                    "raw".to_string(),
                    "-e".to_string(),
                    sox_encoding(format).to_string(),
                    "-b".to_string(),
                    bits,
                    "-c".to_string(),
                    channels,
                    "-r".to_string(),
                    rate,
                    "-".to_string(),
                ],
            ),
            PlayerSpec::Ffplay { program } => (
                program.clone().unwrap_or_else(|| "ffplay".to_string()),
                vec![
                    "-nodisp".to_string(),
                    "-autoexit".to_string(),
                    "-loglevel".to_string(),
                    "error".to_string(),
                    "-f".to_string(),
                    ffmpeg_sample_format(format).to_string(),
                    "-ar".to_string(),
                    rate,
                    "-ac".to_string(),
                    channels,
                    "-i".to_string(),
                    "-".to_string(),
                ],
            ),
            PlayerSpec::Aplay { program } => (
                program.clone().unwrap_or_else(|| "aplay".to_string()),
                vec![
                    "-q".to_string(),
                    "-t".to_string(),
                    "raw".to_string(),
                    "-f".to_string(),
                    alsa_sample_format(format).to_string(),
                    "-c".to_string(),
                    channels,
                    "-r".to_string(),
                    rate,
                    "-".to_string(),
                ],
            ),
            PlayerSpec::Command { program, args } => (
                program.clone(),
                args.iter().map(|arg| substitute(arg, format, None)).collect(),
            ),
        };

        PlayerCommand {
            label: self.label(),
            program,
            args,
        }
    }
}

/// Player for the temp-file fallback; args may use `{file}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFallbackSpec {
    pub program: String,
    #[serde(default = "default_file_args")]
    pub args: Vec<String>,
}

fn default_file_args() -> Vec<String> {
    vec!["{file}".to_string()]
}

impl FileFallbackSpec {
    /// `afplay` on macOS, `paplay` elsewhere
    pub fn platform_default() -> Self {
        let program = if cfg!(target_os = "macos") {
            "afplay"
        } else {
            "paplay"
        };
        Self {
            program: program.to_string(),
            args: default_file_args(),
        }
    }

    pub fn command(&self, file: &Path, format: &AudioFormat) -> PlayerCommand {
        PlayerCommand {
            label: format!("{} (file)", self.program),
            program: self.program.clone(),
            args: self
                .args
                .iter()
                .map(|arg| substitute(arg, format, Some(file)))
                .collect(),
        }
    }
}

fn sox_encoding(format: &AudioFormat) -> &'static str {
    if format.is_signed() {
        "signed-integer"
    } else {
        "unsigned-integer"
    }
}

fn ffmpeg_sample_format(format: &AudioFormat) -> &'static str {
    match format.bit_depth() {
        8 => "u8",
        24 => "s24le",
        32 => "s32le",
        _ => "s16le",
    }
}

fn alsa_sample_format(format: &AudioFormat) -> &'static str {
    match format.bit_depth() {
        8 => "U8",
        24 => "S24_3LE",
        32 => "S32_LE",
        _ => "S16_LE",
    }
}

fn substitute(arg: &str, format: &AudioFormat, file: Option<&Path>) -> String {
    let mut out = arg
        .replace("{sample_rate}", &format.sample_rate().to_string())
        .replace("{channels}", &format.channels().to_string())
        .replace("{bit_depth}", &format.bit_depth().to_string())
        .replace("{encoding}", sox_encoding(format));
    if let Some(file) = file {
        out = out.replace("{file}", &file.to_string_lossy());
    }
    out
}

/// Resolve `program` against `PATH` (or as a path if it contains a separator)
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

/// Write interleaved little-endian PCM as a WAV file.
///
/// A trailing partial frame is dropped.
pub fn write_wav(path: &Path, format: &AudioFormat, pcm: &[u8]) -> hound::Result<()> {
    let spec = hound::WavSpec {
        channels: format.channels(),
        sample_rate: format.sample_rate(),
        bits_per_sample: format.bit_depth(),
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;

    let usable = pcm.len() - pcm.len() % format.frame_size();
    let width = format.bytes_per_sample();
    for sample in pcm[..usable].chunks_exact(width) {
        match width {
            // hound takes 8-bit samples as signed and stores them unsigned
            1 => writer.write_sample((i16::from(sample[0]) - 128) as i8)?,
            2 => writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?,
            3 => {
                let value = i32::from_le_bytes([0, sample[0], sample[1], sample[2]]) >> 8;
                writer.write_sample(value)?
            }
            _ => writer.write_sample(i32::from_le_bytes([
                sample[0], sample[1], sample[2], sample[3],
            ]))?,
        }
    }

    writer.finalize()
}
