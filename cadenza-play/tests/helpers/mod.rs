//! Shared fixtures for cadenza-play integration tests
//!
//! - [`RecordingSynth`]: logs every call with the output frame it happened at
//! - [`write_waveform`]: completed cache backing file from a sample vector
//! - [`Puller`]: background "device callback" draining a `ManualDevice`
//! - [`test_config`]: small, fast engine settings

#![allow(dead_code)]

use cadenza_play::audio::{ManualDevice, Synthesizer};
use cadenza_play::cache::{encode_samples, ChunkCache};
use cadenza_play::config::{CacheConfig, EngineConfig};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const SAMPLE_RATE: u32 = 8_000;

/// 120 bpm at 8 kHz
pub const FRAMES_PER_BEAT: u64 = 4_000;

pub const WINDOW: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthCall {
    On { channel: u8, pitch: u8, frame: u64 },
    Off { channel: u8, pitch: u8, frame: u64 },
    AllOff { frame: u64 },
}

#[derive(Debug, Default)]
pub struct SynthLog {
    pub calls: Vec<SynthCall>,
    pub rendered_frames: u64,
}

/// Synth that records calls and renders a constant level
///
/// Calls are stamped with the number of frames rendered before them, which
/// is the session output frame the event took effect at.
pub struct RecordingSynth {
    log: Arc<Mutex<SynthLog>>,
    channels: usize,
    level: i16,
}

impl RecordingSynth {
    pub fn new(channels: u16) -> (Self, Arc<Mutex<SynthLog>>) {
        Self::with_level(channels, 0)
    }

    pub fn with_level(channels: u16, level: i16) -> (Self, Arc<Mutex<SynthLog>>) {
        let log = Arc::new(Mutex::new(SynthLog::default()));
        (
            Self {
                log: Arc::clone(&log),
                channels: channels as usize,
                level,
            },
            log,
        )
    }
}

impl Synthesizer for RecordingSynth {
    fn note_on(&mut self, channel: u8, pitch: u8, _velocity: u8) {
        let mut log = self.log.lock().unwrap();
        let frame = log.rendered_frames;
        log.calls.push(SynthCall::On { channel, pitch, frame });
    }

    fn note_off(&mut self, channel: u8, pitch: u8) {
        let mut log = self.log.lock().unwrap();
        let frame = log.rendered_frames;
        log.calls.push(SynthCall::Off { channel, pitch, frame });
    }

    fn render_frames(&mut self, out: &mut [i16]) {
        out.fill(self.level);
        self.log.lock().unwrap().rendered_frames += (out.len() / self.channels) as u64;
    }

    fn all_notes_off(&mut self) {
        let mut log = self.log.lock().unwrap();
        let frame = log.rendered_frames;
        log.calls.push(SynthCall::AllOff { frame });
    }
}

/// Engine settings scaled for tests: mono, 8 kHz, short batches
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.playback.sample_rate = SAMPLE_RATE;
    config.playback.channels = 1;
    config.playback.window_frames = WINDOW as usize;
    config.playback.prefetch_frames = 256;
    config.playback.position_poll_interval_ms = 10;
    config.playback.stall_timeout_ms = 5_000;
    config.playback.event_capacity = 4_096;
    config.ring_buffer.capacity_samples = 1_024;
    config.cache = small_cache();
    config.metronome.muted = true;
    config
}

pub fn small_cache() -> CacheConfig {
    CacheConfig {
        block_size: 1_024,
        max_chunks: 16,
        retry_delay_ms: 2,
        ..CacheConfig::default()
    }
}

/// Write `samples` as a complete backing file and open a cache on it
pub fn write_waveform(dir: &Path, samples: &[i16], config: CacheConfig) -> Arc<ChunkCache> {
    let path = dir.join("waveform.raw");
    std::fs::write(&path, encode_samples(samples)).unwrap();
    Arc::new(ChunkCache::open(&path, config).unwrap())
}

/// Drains a `ManualDevice` from a background thread, keeping what it got
pub struct Puller {
    running: Arc<AtomicBool>,
    output: Arc<Mutex<Vec<i16>>>,
    thread: Option<JoinHandle<()>>,
}

impl Puller {
    pub fn start(device: ManualDevice, frames: usize, period: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let output = Arc::new(Mutex::new(Vec::new()));
        let thread = {
            let running = Arc::clone(&running);
            let output = Arc::clone(&output);
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    let block = device.pull(frames);
                    output.lock().unwrap().extend_from_slice(&block);
                    thread::sleep(period);
                }
            })
        };
        Self {
            running,
            output,
            thread: Some(thread),
        }
    }

    pub fn output(&self) -> Vec<i16> {
        self.output.lock().unwrap().clone()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for Puller {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
