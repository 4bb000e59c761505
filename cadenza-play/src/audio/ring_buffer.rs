//! Bounded circular buffer between the mix worker and the audio callback
//!
//! The mix worker (producer) pushes interleaved i16 samples with
//! [`RingBuffer::append`], which blocks while the buffer lacks room for the
//! whole batch. The device callback (consumer) drains with
//! [`RingBuffer::extract`], which never waits for data: it copies whatever
//! is available and leaves the rest of the destination untouched.
//!
//! ```text
//! Mix worker ── append() ──▶ RingBuffer (capacity C samples) ── extract() ──▶ device callback
//!               (blocks when full)                               (never waits)
//! ```
//!
//! Storage is a `ringbuf::HeapRb`; a single mutex guards cursors and
//! contents together so an append copy and an extract copy never
//! interleave. The lock is only held for a `memcpy`, which keeps the
//! callback's worst case bounded.
//!
//! Stopping playback calls [`RingBuffer::interrupt`]: a producer blocked in
//! `append` wakes and gets [`RingBufferError::Interrupted`] instead of
//! starving.

use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Errors returned by [`RingBuffer::append`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    /// Playback was stopped while the producer was waiting (or before it started)
    #[error("ring buffer interrupted: playback stopped")]
    Interrupted,

    /// The batch can never fit, even into an empty buffer
    #[error("batch of {requested} samples exceeds ring buffer capacity {capacity}")]
    TooLarge { requested: usize, capacity: usize },
}

struct Inner {
    rb: HeapRb<i16>,
    interrupted: bool,
}

/// Fixed-capacity circular buffer of interleaved 16-bit samples
pub struct RingBuffer {
    inner: Mutex<Inner>,

    /// Signalled by extract/clear/interrupt when an appender may proceed
    space_available: Condvar,

    capacity: usize,

    /// Extract calls that found fewer samples than requested while armed
    underruns: AtomicU64,

    /// Total samples appended since creation
    samples_written: AtomicU64,

    /// Total samples extracted since creation
    samples_read: AtomicU64,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("size", &self.size())
            .field("underruns", &self.underruns.load(Ordering::Relaxed))
            .finish()
    }
}

impl RingBuffer {
    /// Create an empty ring buffer holding `capacity` samples
    ///
    /// A capacity of zero is bumped to one sample; `ringbuf` storage cannot
    /// be empty.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("Creating output ring buffer: capacity={} samples", capacity);

        Self {
            inner: Mutex::new(Inner {
                rb: HeapRb::new(capacity),
                interrupted: false,
            }),
            space_available: Condvar::new(),
            capacity,
            underruns: AtomicU64::new(0),
            samples_written: AtomicU64::new(0),
            samples_read: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a batch of samples, blocking until the whole batch fits
    ///
    /// # Returns
    /// * `Ok(n)` - `n == samples.len()` samples were written
    /// * `Err(Interrupted)` - playback stopped while waiting
    /// * `Err(TooLarge)` - the batch is larger than the buffer
    pub fn append(&self, samples: &[i16]) -> Result<usize, RingBufferError> {
        if samples.len() > self.capacity {
            return Err(RingBufferError::TooLarge {
                requested: samples.len(),
                capacity: self.capacity,
            });
        }

        let mut inner = self.lock();
        while !inner.interrupted && inner.rb.vacant_len() < samples.len() {
            inner = self
                .space_available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if inner.interrupted {
            return Err(RingBufferError::Interrupted);
        }

        let written = inner.rb.push_slice(samples);
        drop(inner);

        self.samples_written.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    /// Copy up to `dest.len()` samples out of the buffer without waiting
    ///
    /// Samples of `dest` past the returned count are left untouched; the
    /// caller decides whether to fill them with silence.
    ///
    /// **Real-time safe:** no allocation, no logging, bounded lock hold.
    pub fn extract(&self, dest: &mut [i16]) -> usize {
        let mut inner = self.lock();
        let read = inner.rb.pop_slice(dest);
        let armed = !inner.interrupted;
        drop(inner);

        if read > 0 {
            // Best effort: one appender is enough to make progress
            self.space_available.notify_one();
            self.samples_read.fetch_add(read as u64, Ordering::Relaxed);
        }
        if armed && read < dest.len() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        read
    }

    /// Drop all buffered samples and wake any waiting appender
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.rb.clear();
        drop(inner);
        self.space_available.notify_all();
    }

    /// Fail current and future appends until [`RingBuffer::reset`]
    pub fn interrupt(&self) {
        let mut inner = self.lock();
        inner.interrupted = true;
        drop(inner);
        self.space_available.notify_all();
    }

    /// Clear the buffer and accept appends again (start of a new session)
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.rb.clear();
        inner.interrupted = false;
        drop(inner);
        self.space_available.notify_all();
    }

    /// Whether appends are currently being refused
    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Occupied samples
    pub fn size(&self) -> usize {
        self.lock().rb.occupied_len()
    }

    /// Capacity in samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get statistics
    pub fn stats(&self) -> RingBufferStats {
        RingBufferStats {
            capacity: self.capacity,
            occupied: self.size(),
            underruns: self.underruns.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            samples_read: self.samples_read.load(Ordering::Relaxed),
        }
    }
}

/// Ring buffer statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferStats {
    /// Buffer capacity in samples
    pub capacity: usize,

    /// Currently occupied samples
    pub occupied: usize,

    /// Short extracts while armed (callback found too little data)
    pub underruns: u64,

    /// Total samples appended
    pub samples_written: u64,

    /// Total samples extracted
    pub samples_read: u64,
}

impl RingBufferStats {
    /// Get buffer fill fraction (0.0 to 1.0)
    pub fn fill_percent(&self) -> f32 {
        self.occupied as f32 / self.capacity as f32
    }
}
