//! Playback engine
//!
//! ```text
//! ChunkCache ─▶ prefetch worker ──(PrefetchBatch)──▶ mix worker ──▶ RingBuffer ──▶ device callback
//!                                                     │    ▲
//!                                   timeline events ──┘    └── synth render
//!
//! position reporter (tokio): device clock + clock markers ─▶ position() / Position events
//! event scheduler   (tokio): delayed note-offs
//! ```

pub mod crossfade;
pub mod engine;
pub mod events;
pub mod mixer;
pub mod overview;
pub mod position;
pub mod prefetch;
pub mod state;
pub mod waveform;

mod mix_worker;

pub use engine::PlaybackEngine;
pub use mixer::{Mixer, PeakLevels, PeakMeter};
pub use overview::{ChunkPeaks, WaveformOverview};
pub use state::StateCell;
pub use waveform::Waveform;

use serde::{Deserialize, Serialize};

/// Active play range, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRange {
    pub start_frame: u64,
    pub end_frame: u64,
    pub looping: bool,
}

impl PlayRange {
    pub fn new(start_frame: u64, end_frame: u64, looping: bool) -> Self {
        Self {
            start_frame,
            end_frame,
            looping,
        }
    }

    pub fn len(&self) -> u64 {
        self.end_frame.saturating_sub(self.start_frame)
    }

    pub fn is_empty(&self) -> bool {
        self.end_frame <= self.start_frame
    }

    pub fn contains(&self, frame: u64) -> bool {
        frame >= self.start_frame && frame < self.end_frame
    }
}

/// Waveform frames handed from the prefetch worker to the mix worker
///
/// `samples` is interleaved and always a whole number of mix windows. The
/// final batch of a pass carries crossfade padding after the source frames.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchBatch {
    pub start_frame: u64,
    pub samples: Vec<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Handoff {
    Batch(PrefetchBatch),
    /// Non-looping pass finished; no more batches follow
    EndOfRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_range() {
        let range = PlayRange::new(10, 20, false);
        assert_eq!(range.len(), 10);
        assert!(range.contains(10));
        assert!(!range.contains(20));
        assert!(PlayRange::new(5, 5, true).is_empty());
        assert_eq!(PlayRange::new(9, 3, true).len(), 0);
    }
}
