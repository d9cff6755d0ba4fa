//! Growable circular byte buffer between the chunk receiver and the player feed

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::{debug, warn};

use crate::format::AudioFormat;
use std::time::Duration;

/// Circular byte buffer that grows instead of dropping audio.
///
/// Storage is a `ringbuf` heap ring. When a write does not fit, the ring is
/// reallocated at 1.5x its capacity (repeatedly, until the write fits or
/// `max_capacity` is reached) and the queued bytes are moved across in FIFO
/// order.
///
/// One writer (the message handler) and one reader (the playback loop) share a
/// buffer per session; callers serialise access with a mutex.
pub struct RingBuffer {
    ring: HeapRb<u8>,
    max_capacity: usize,
    finished: bool,
    grow_count: u32,
}

impl RingBuffer {
    /// Create a buffer with an unbounded growth limit
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, usize::MAX)
    }

    /// Create a buffer that never grows beyond `max_capacity` bytes
    ///
    /// # Example
    ///
    /// ```
    /// use speakd_audio::RingBuffer;
    ///
    /// let mut buffer = RingBuffer::with_limit(4, 16);
    /// assert_eq!(buffer.write(&[1, 2, 3, 4, 5, 6]), 6); // grew to fit
    /// assert_eq!(buffer.read(4), vec![1, 2, 3, 4]);
    /// ```
    pub fn with_limit(capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: HeapRb::new(capacity),
            max_capacity: max_capacity.max(capacity),
            finished: false,
            grow_count: 0,
        }
    }

    /// Buffer sized to hold `duration` of audio in `format`
    pub fn for_duration(format: &AudioFormat, duration: Duration, max_capacity: usize) -> Self {
        Self::with_limit(format.bytes_for(duration), max_capacity)
    }

    /// Append bytes, growing the storage if needed.
    ///
    /// Returns the number of bytes stored. This equals `data.len()` unless the
    /// growth limit was hit, in which case the tail that did not fit is
    /// dropped.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        if data.len() > self.ring.vacant_len() {
            self.grow_for(data.len());
        }

        let written = self.ring.push_slice(data);
        if written < data.len() {
            warn!(
                "Ring buffer at limit ({} bytes): dropped {} bytes",
                self.max_capacity,
                data.len() - written
            );
        }
        written
    }

    fn grow_for(&mut self, incoming: usize) {
        let current = self.capacity();
        if current >= self.max_capacity {
            return;
        }

        let needed = self.len().saturating_add(incoming);
        let mut target = current;
        while target < needed && target < self.max_capacity {
            target = (target.saturating_mul(3) / 2).max(target + 1);
        }
        let target = target.min(self.max_capacity);

        let mut staged = vec![0u8; self.len()];
        let moved = self.ring.pop_slice(&mut staged);

        let mut grown = HeapRb::new(target);
        grown.push_slice(&staged[..moved]);
        self.ring = grown;
        self.grow_count += 1;

        debug!("Ring buffer grew {} -> {} bytes", current, target);
    }

    /// Pop up to `max_len` bytes in FIFO order.
    ///
    /// A short (or empty) result means "not enough data yet", never an error.
    pub fn read(&mut self, max_len: usize) -> Vec<u8> {
        let mut out = vec![0u8; max_len.min(self.len())];
        let read = self.ring.pop_slice(&mut out);
        out.truncate(read);
        out
    }

    /// Pop into a caller-provided slice, returning the byte count
    pub fn read_into(&mut self, out: &mut [u8]) -> usize {
        self.ring.pop_slice(out)
    }

    /// Bytes currently queued
    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn free_space(&self) -> usize {
        self.ring.vacant_len()
    }

    /// Fill level in `[0, 1]`
    pub fn utilization(&self) -> f64 {
        (self.len() as f64 / self.capacity() as f64).clamp(0.0, 1.0)
    }

    /// How many times the storage has been reallocated
    pub fn grow_count(&self) -> u32 {
        self.grow_count
    }

    /// Producer signalled that no more data will be written
    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Finished and nothing left to read
    pub fn is_drained(&self) -> bool {
        self.finished && self.is_empty()
    }

    /// Drop all queued data and reset the finished flag
    pub fn clear(&mut self) {
        self.ring.clear();
        self.finished = false;
    }
}
