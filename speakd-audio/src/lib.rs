//! speakd audio primitives
//!
//! Format bookkeeping and buffering for raw PCM streamed from a TTS producer
//! to a native player process.
//!
//! ## Architecture
//!
//! ```text
//! audio_chunk (bytes)
//!   │
//!   ├─> RingBuffer (growable, FIFO)
//!   │     │
//!   │     └─> playback loop reads slices of AudioFormat::bytes_for(50ms)
//!   │
//!   └─> AudioFormat::duration_of(bytes) -> expected playback time
//! ```

pub mod buffer;
pub mod error;
pub mod format;

pub use buffer::RingBuffer;
pub use error::{AudioError, Result};
pub use format::{AudioFormat, FormatSpec, COMMON_SAMPLE_RATES};

/// Initial ring buffer size, in seconds of audio
pub const DEFAULT_BUFFER_SECONDS: f64 = 2.0;

/// Playback feed slice, in milliseconds of audio
pub const DEFAULT_SLICE_MS: u64 = 50;
