//! PCM stream description

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AudioError, Result};

/// Sample rates every supported player handles without resampling surprises.
pub const COMMON_SAMPLE_RATES: [u32; 7] = [8000, 16000, 22050, 24000, 32000, 44100, 48000];

/// Channel counts accepted by [`AudioFormat::new`].
pub const SUPPORTED_CHANNELS: [u16; 2] = [1, 2];

/// Bit depths accepted by [`AudioFormat::new`].
pub const SUPPORTED_BIT_DEPTHS: [u16; 4] = [8, 16, 24, 32];

/// Upper bound on sample rate; anything above is treated as garbage input.
pub const MAX_SAMPLE_RATE: u32 = 768_000;

/// Immutable description of a raw PCM stream.
///
/// `bytes_per_second` is derived once at construction and cached, so every
/// duration computation for a session uses the same divisor.
///
/// 8-bit audio is unsigned; 16/24/32-bit audio is signed little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FormatSpec", into = "FormatSpec")]
pub struct AudioFormat {
    sample_rate: u32,
    channels: u16,
    bit_depth: u16,
    bytes_per_second: u32,
}

/// Wire/config representation of an [`AudioFormat`].
///
/// Accepts both the camelCase keys producers send (`sampleRate`, `bitDepth`)
/// and snake_case keys used in the TOML config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatSpec {
    #[serde(alias = "sample_rate", default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(alias = "bit_depth", alias = "bitsPerSample", default = "default_bit_depth")]
    pub bit_depth: u16,
}

fn default_sample_rate() -> u32 {
    24_000
}

fn default_channels() -> u16 {
    1
}

fn default_bit_depth() -> u16 {
    16
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bit_depth: default_bit_depth(),
        }
    }
}

impl AudioFormat {
    /// Build and validate a format.
    ///
    /// Fails with [`AudioError::UnsupportedFormat`] for channel counts outside
    /// {1, 2}, bit depths outside {8, 16, 24, 32}, or a zero / absurd sample
    /// rate. Uncommon but plausible sample rates only log a warning.
    pub fn new(sample_rate: u32, channels: u16, bit_depth: u16) -> Result<Self> {
        if !SUPPORTED_CHANNELS.contains(&channels) {
            return Err(AudioError::unsupported(format!(
                "channels must be 1 or 2, got {}",
                channels
            )));
        }

        if !SUPPORTED_BIT_DEPTHS.contains(&bit_depth) {
            return Err(AudioError::unsupported(format!(
                "bit depth must be one of 8/16/24/32, got {}",
                bit_depth
            )));
        }

        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(AudioError::unsupported(format!(
                "sample rate {} Hz is out of range",
                sample_rate
            )));
        }

        if !COMMON_SAMPLE_RATES.contains(&sample_rate) {
            warn!(
                "Unusual sample rate {} Hz; playback may be resampled by the player",
                sample_rate
            );
        }

        let bytes_per_second = sample_rate * u32::from(channels) * u32::from(bit_depth / 8);

        Ok(Self {
            sample_rate,
            channels,
            bit_depth,
            bytes_per_second,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bit_depth / 8)
    }

    /// Bytes in one frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.bytes_per_second
    }

    /// 8-bit PCM is conventionally unsigned; wider depths are signed.
    pub fn is_signed(&self) -> bool {
        self.bit_depth > 8
    }

    /// Playback time represented by `bytes` of audio
    pub fn duration_of(&self, bytes: u64) -> Duration {
        Duration::from_secs_f64(bytes as f64 / f64::from(self.bytes_per_second))
    }

    /// Byte count for `duration`, rounded down to whole frames (never below
    /// one frame).
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let raw = (duration.as_secs_f64() * f64::from(self.bytes_per_second)) as usize;
        let frame = self.frame_size();
        (raw / frame).max(1) * frame
    }
}

impl Default for AudioFormat {
    /// 24 kHz mono 16-bit, the native output of the TTS producer
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            bit_depth: 16,
            bytes_per_second: 48_000,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit",
            self.sample_rate, self.channels, self.bit_depth
        )
    }
}

impl TryFrom<FormatSpec> for AudioFormat {
    type Error = AudioError;

    fn try_from(spec: FormatSpec) -> Result<Self> {
        Self::new(spec.sample_rate, spec.channels, spec.bit_depth)
    }
}

impl From<AudioFormat> for FormatSpec {
    fn from(format: AudioFormat) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            bit_depth: format.bit_depth,
        }
    }
}
