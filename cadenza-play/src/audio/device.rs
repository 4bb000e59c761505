//! Audio output device boundary
//!
//! The engine only needs two capabilities from an output device: a
//! consumer that drains the [`RingBuffer`] on its own (callback) thread, and
//! a clock reporting how many frames the device has consumed. Everything
//! else about the device API stays behind [`OutputDevice`].
//!
//! Implementations:
//! - [`NullDevice`]: real-time paced thread that discards audio (headless runs)
//! - [`ManualDevice`]: test device drained explicitly with [`ManualDevice::pull`]
//! - `CpalOutput` (feature `cpal-output`): hardware output via cpal

use crate::audio::ring_buffer::RingBuffer;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Frames consumed by a device since it was created
///
/// Cloneable handle; the device callback advances it, the position reporter
/// reads it. Counts every frame the callback delivered, silence included,
/// so it keeps moving during underruns and only stalls when the callback
/// itself stops running.
#[derive(Debug, Clone, Default)]
pub struct DeviceClock {
    frames: Arc<AtomicU64>,
}

impl DeviceClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames consumed so far
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Record `frames` more frames delivered to the hardware
    ///
    /// **Real-time safe:** single atomic add.
    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Release);
    }
}

/// Opaque audio output capability
pub trait OutputDevice: Send {
    /// Device sample rate in Hz
    fn sample_rate(&self) -> u32;

    /// Interleaved channel count
    fn channels(&self) -> u16;

    /// Start consuming from `source`
    ///
    /// The device must only call [`RingBuffer::extract`] on its callback
    /// thread, filling any shortfall with silence.
    fn start(&mut self, source: Arc<RingBuffer>) -> Result<()>;

    /// Stop consuming; idempotent
    fn stop(&mut self);

    /// Clock handle advanced by the device callback
    fn clock(&self) -> DeviceClock;
}

/// Drain one device period from `source` into `out`, padding with silence
///
/// Shared by every device implementation so they handle short reads the
/// same way.
pub fn fill_from(source: &RingBuffer, out: &mut [i16]) -> usize {
    let read = source.extract(out);
    out[read..].fill(0);
    read
}

/// Headless device: pulls `period_frames` every period in real time
pub struct NullDevice {
    sample_rate: u32,
    channels: u16,
    period_frames: usize,
    clock: DeviceClock,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NullDevice {
    /// Create a null device with a 256-frame period
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self::with_period(sample_rate, channels, 256)
    }

    pub fn with_period(sample_rate: u32, channels: u16, period_frames: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            period_frames: period_frames.max(1),
            clock: DeviceClock::new(),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl OutputDevice for NullDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn start(&mut self, source: Arc<RingBuffer>) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::AudioOutput("null device already started".to_string()));
        }
        if self.sample_rate == 0 {
            return Err(Error::AudioOutput("sample rate must be non-zero".to_string()));
        }

        let period = Duration::from_nanos(
            self.period_frames as u64 * 1_000_000_000 / self.sample_rate as u64,
        );
        let samples = self.period_frames * self.channels as usize;
        let period_frames = self.period_frames as u64;
        let clock = self.clock.clone();
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::Release);

        let handle = thread::Builder::new()
            .name("cadenza-null-device".to_string())
            .spawn(move || {
                let mut scratch = vec![0i16; samples];
                let mut next_tick = Instant::now();
                while running.load(Ordering::Acquire) {
                    fill_from(&source, &mut scratch);
                    clock.advance(period_frames);

                    next_tick += period;
                    let now = Instant::now();
                    if next_tick > now {
                        thread::sleep(next_tick - now);
                    } else {
                        // Fell behind (e.g. suspended); don't burst to catch up
                        next_tick = now;
                    }
                }
            })?;

        info!(
            "Null output device started: {} Hz, {} ch, period {:?}",
            self.sample_rate, self.channels, period
        );
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            debug!("Null output device stopped");
        }
    }

    fn clock(&self) -> DeviceClock {
        self.clock.clone()
    }
}

impl Drop for NullDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Test device drained explicitly by the caller
///
/// Clones share the same source and clock, so a test can keep one clone
/// and hand the other to the engine.
#[derive(Clone)]
pub struct ManualDevice {
    sample_rate: u32,
    channels: u16,
    clock: DeviceClock,
    source: Arc<Mutex<Option<Arc<RingBuffer>>>>,
}

impl ManualDevice {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            clock: DeviceClock::new(),
            source: Arc::new(Mutex::new(None)),
        }
    }

    /// Consume `frames` frames like a device callback would
    ///
    /// Returns the delivered samples (silence-padded). When the device is
    /// not started nothing is consumed and the clock does not move.
    pub fn pull(&self, frames: usize) -> Vec<i16> {
        let mut out = vec![0i16; frames * self.channels as usize];
        let source = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(source) = source {
            fill_from(&source, &mut out);
            self.clock.advance(frames as u64);
        }
        out
    }

    /// Whether the engine has started this device
    pub fn is_started(&self) -> bool {
        self.source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl OutputDevice for ManualDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn start(&mut self, source: Arc<RingBuffer>) -> Result<()> {
        *self.source.lock().unwrap_or_else(PoisonError::into_inner) = Some(source);
        Ok(())
    }

    fn stop(&mut self) {
        *self.source.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn clock(&self) -> DeviceClock {
        self.clock.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_device_pads_with_silence() {
        let rb = Arc::new(RingBuffer::new(16));
        rb.append(&[1, 2, 3, 4]).unwrap();

        let mut device = ManualDevice::new(44_100, 2);
        assert!(device.pull(2).iter().all(|s| *s == 0));
        assert_eq!(device.clock().frames(), 0);

        device.start(Arc::clone(&rb)).unwrap();
        let handle = device.clone();
        assert_eq!(handle.pull(3), vec![1, 2, 3, 4, 0, 0]);
        assert_eq!(device.clock().frames(), 3);

        device.stop();
        assert!(!handle.is_started());
    }

    #[test]
    fn test_null_device_advances_clock() {
        let rb = Arc::new(RingBuffer::new(1024));
        rb.append(&[7; 512]).unwrap();

        let mut device = NullDevice::with_period(48_000, 2, 64);
        let clock = device.clock();
        device.start(Arc::clone(&rb)).unwrap();
        assert!(device.start(Arc::clone(&rb)).is_err());

        thread::sleep(Duration::from_millis(60));
        device.stop();

        assert!(clock.frames() >= 64);
        assert_eq!(rb.size(), 0);
    }
}
