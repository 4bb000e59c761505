//! Configuration for the playback core
//!
//! Loaded from the bootstrap TOML file resolved by
//! `cadenza_common::config`. Every field has a built-in default, so an
//! empty or missing file yields a working engine:
//!
//! ```toml
//! [ring_buffer]
//! capacity_samples = 16384
//!
//! [cache]
//! block_size = 65536
//! max_chunks = 64
//!
//! [playback]
//! sample_rate = 44100
//! channels = 2
//! prefetch_frames = 4096
//!
//! [metronome]
//! muted = false
//!
//! [logging]
//! level = "info"
//! ```

use crate::cache::SAMPLE_SIZE;
use crate::error::{Error, Result};
use cadenza_common::config::{load_toml_or_default, LoggingConfig};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub ring_buffer: RingBufferConfig,
    pub cache: CacheConfig,
    pub playback: PlaybackConfig,
    pub metronome: MetronomeConfig,
    pub logging: LoggingConfig,
}

/// Output ring buffer sizing
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RingBufferConfig {
    /// Capacity in samples (all channels)
    ///
    /// Default: 16384 (~186ms of stereo audio at 44.1kHz)
    pub capacity_samples: usize,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self {
            capacity_samples: 16_384,
        }
    }
}

/// Chunk cache tuning
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Bytes per chunk; must hold whole frames
    pub block_size: usize,

    /// Maximum resident chunks before LRU eviction
    pub max_chunks: usize,

    /// Bounded fetch-request queue length; requests beyond it are dropped
    pub request_queue: usize,

    /// Delay before re-trying a chunk that is not written yet or failed to read
    pub retry_delay_ms: u64,

    /// Read attempts before a chunk is reported as failed
    pub max_read_attempts: u32,

    /// Default queue length for chunk listeners
    pub listener_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 65_536,
            max_chunks: 64,
            request_queue: 256,
            retry_delay_ms: 10,
            max_read_attempts: 3,
            listener_capacity: 64,
        }
    }
}

impl CacheConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Samples held by one full chunk
    pub fn samples_per_chunk(&self) -> usize {
        self.block_size / SAMPLE_SIZE
    }
}

/// Playback engine tuning
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output sample rate (Hz); the waveform is assumed to match
    pub sample_rate: u32,

    /// Interleaved channels of both the waveform and the output
    pub channels: u16,

    /// Mix window in frames (power of two)
    pub window_frames: usize,

    /// Frames per prefetch batch (multiple of `window_frames`)
    pub prefetch_frames: usize,

    /// Minimum crossfade padding at a range end
    pub min_crossfade_frames: usize,

    /// Prefetch batches buffered between the prefetch and mix workers
    pub handoff_batches: usize,

    /// How long a blocked hand-off send waits before re-checking state
    pub handoff_timeout_ms: u64,

    /// Position reporter poll interval
    pub position_poll_interval_ms: u64,

    /// Device clock stall that counts as a lost callback
    pub stall_timeout_ms: u64,

    /// Initial waveform gain
    pub waveform_gain: f32,

    /// Initial synthesizer gain
    pub synth_gain: f32,

    /// Event bus capacity
    pub event_capacity: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            window_frames: 64,
            prefetch_frames: 4_096,
            min_crossfade_frames: 20,
            handoff_batches: 4,
            handoff_timeout_ms: 50,
            position_poll_interval_ms: 66,
            stall_timeout_ms: 500,
            waveform_gain: 1.0,
            synth_gain: 1.0,
            event_capacity: 256,
        }
    }
}

impl PlaybackConfig {
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn position_poll_interval(&self) -> Duration {
        Duration::from_millis(self.position_poll_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Metronome click
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetronomeConfig {
    /// Start sessions with the metronome muted
    pub muted: bool,

    pub channel: u8,

    /// Click pitch on ordinary beats
    pub pitch: u8,

    /// Click pitch on the first beat of a bar
    pub accent_pitch: u8,

    pub velocity: u8,

    /// Beats per bar, for accenting
    pub beats_per_bar: u32,

    /// Note-off delay after each click
    pub click_duration_ms: u64,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            muted: false,
            channel: crate::audio::synth::PERCUSSION_CHANNEL,
            pitch: 76,
            accent_pitch: 77,
            velocity: 100,
            beats_per_bar: 4,
            click_duration_ms: 50,
        }
    }
}

impl MetronomeConfig {
    pub fn click_duration(&self) -> Duration {
        Duration::from_millis(self.click_duration_ms)
    }
}

impl EngineConfig {
    /// Load and validate configuration; `None` or a missing file gives defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: EngineConfig = load_toml_or_default(path)?;
        config.validate()?;
        debug!("Engine configuration: {:?}", config);
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = cadenza_common::config::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let pb = &self.playback;
        let frame_bytes = SAMPLE_SIZE * pb.channels as usize;

        if pb.sample_rate == 0 {
            return Err(invalid("playback.sample_rate must be non-zero"));
        }
        if pb.channels == 0 {
            return Err(invalid("playback.channels must be non-zero"));
        }
        if !pb.window_frames.is_power_of_two() {
            return Err(invalid(format!(
                "playback.window_frames must be a power of two, got {}",
                pb.window_frames
            )));
        }
        if pb.prefetch_frames == 0 || pb.prefetch_frames % pb.window_frames != 0 {
            return Err(invalid(format!(
                "playback.prefetch_frames ({}) must be a non-zero multiple of window_frames ({})",
                pb.prefetch_frames, pb.window_frames
            )));
        }
        if pb.min_crossfade_frames == 0 {
            return Err(invalid("playback.min_crossfade_frames must be non-zero"));
        }
        if pb.handoff_batches == 0 || pb.event_capacity == 0 {
            return Err(invalid("playback queue capacities must be non-zero"));
        }
        if pb.position_poll_interval_ms == 0 {
            return Err(invalid("playback.position_poll_interval_ms must be non-zero"));
        }
        if pb.stall_timeout_ms <= pb.position_poll_interval_ms {
            return Err(invalid(
                "playback.stall_timeout_ms must exceed position_poll_interval_ms",
            ));
        }
        for (name, gain) in [("waveform_gain", pb.waveform_gain), ("synth_gain", pb.synth_gain)] {
            if !gain.is_finite() || gain < 0.0 {
                return Err(invalid(format!("playback.{} must be finite and >= 0", name)));
            }
        }

        if self.ring_buffer.capacity_samples < pb.window_frames * pb.channels as usize {
            return Err(invalid(format!(
                "ring_buffer.capacity_samples ({}) must hold at least one mix window ({} samples)",
                self.ring_buffer.capacity_samples,
                pb.window_frames * pb.channels as usize
            )));
        }

        let cache = &self.cache;
        if cache.block_size == 0 || cache.block_size % frame_bytes != 0 {
            return Err(invalid(format!(
                "cache.block_size ({}) must be a non-zero multiple of the frame size ({} bytes)",
                cache.block_size, frame_bytes
            )));
        }
        if cache.max_chunks == 0 || cache.request_queue == 0 || cache.listener_capacity == 0 {
            return Err(invalid("cache capacities must be non-zero"));
        }
        if cache.max_read_attempts == 0 {
            return Err(invalid("cache.max_read_attempts must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.playback.window_frames, 64);
        assert_eq!(config.playback.min_crossfade_frames, 20);
        assert_eq!(config.playback.position_poll_interval(), Duration::from_millis(66));
        assert_eq!(config.playback.stall_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [cache]
            block_size = 1024
            max_chunks = 4

            [metronome]
            muted = true
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.block_size, 1024);
        assert_eq!(config.cache.samples_per_chunk(), 512);
        assert_eq!(config.cache.max_chunks, 4);
        assert_eq!(config.cache.request_queue, 256);
        assert!(config.metronome.muted);
        assert_eq!(config.playback, PlaybackConfig::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_prefetch_not_multiple_of_window() {
        let mut config = EngineConfig::default();
        config.playback.prefetch_frames = 100;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_window_not_power_of_two() {
        let mut config = EngineConfig::default();
        config.playback.window_frames = 48;
        config.playback.prefetch_frames = 480;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_block_splitting_frames() {
        let mut config = EngineConfig::default();
        config.cache.block_size = 1022;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_ring_smaller_than_window() {
        let mut config = EngineConfig::default();
        config.ring_buffer.capacity_samples = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_file_gives_defaults() {
        let config = EngineConfig::load(Some(Path::new("/nonexistent/cadenza.toml"))).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
