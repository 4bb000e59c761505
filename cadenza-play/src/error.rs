//! Error types for cadenza-play
//!
//! Component errors (`RingBufferError`, `CacheError`, `SchedulerError`)
//! live next to their components and convert into the crate-level `Error`.

use thiserror::Error;

pub use crate::audio::ring_buffer::RingBufferError;
pub use crate::cache::CacheError;
pub use crate::scheduler::SchedulerError;

/// Main error type for cadenza-play
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from the shared crate (config file loading)
    #[error(transparent)]
    Common(#[from] cadenza_common::Error),

    /// Output ring buffer errors
    #[error("Ring buffer error: {0}")]
    RingBuffer(#[from] RingBufferError),

    /// Chunk cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Event scheduler errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Play range with `start >= end`
    #[error("Invalid play range {start}..{end}")]
    InvalidRange { start: u64, end: u64 },

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using cadenza-play Error
pub type Result<T> = std::result::Result<T, Error>;
