//! # Cadenza Playback Core (cadenza-play)
//!
//! Real-time playback of a cached waveform mixed with a synthesized score.
//!
//! **Purpose:** Stream decoded samples from a disk-backed chunk cache, mix
//! them with synthesizer output driven by score events and a metronome,
//! and feed an output device through a bounded ring buffer without
//! glitching under cache misses, loop wraps or slow producers.
//!
//! **Architecture:** prefetch and mix worker threads joined by a bounded
//! hand-off, a tokio position reporter and a tokio event scheduler for
//! delayed note-offs. See [`playback`] for the data flow.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod playback;
pub mod scheduler;
pub mod score;
pub mod state;

pub use audio::{ManualDevice, NullDevice, OutputDevice, RingBuffer, SineSynth, Synthesizer};
pub use cache::{ChunkCache, SampleProducer};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use playback::{PlayRange, PlaybackEngine, Waveform, WaveformOverview};
pub use scheduler::EventScheduler;
pub use score::{BeatMap, Note, NoteSource, Score, TempoMap};
pub use state::SharedState;
