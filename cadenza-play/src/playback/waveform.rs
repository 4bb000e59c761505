//! Frame-addressed view of a cached waveform

use crate::cache::{CacheError, ChunkCache};
use cadenza_common::timing::{frame_to_sample, sample_to_frame};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Interleaved waveform stored in a [`ChunkCache`]
#[derive(Debug, Clone)]
pub struct Waveform {
    cache: Arc<ChunkCache>,
    channels: u16,
}

impl Waveform {
    pub fn new(cache: Arc<ChunkCache>, channels: u16) -> Self {
        Self {
            cache,
            channels: channels.max(1),
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// Length in frames, once the backing write is complete
    pub fn total_frames(&self) -> Option<u64> {
        self.cache
            .total_samples()
            .map(|samples| sample_to_frame(samples, self.channels))
    }

    /// Read `frames` frames starting at `start_frame` into `out`
    ///
    /// `out` is cleared first and always ends up holding exactly
    /// `frames * channels` samples: frames past the end of the audio are
    /// silence. Each chunk wait is bounded by `chunk_timeout` so a caller
    /// can re-check whether it still wants the data; a timeout returns
    /// `CacheError::Timeout` and the read can simply be retried. The chunk
    /// after the last one read is requested as read-ahead.
    pub fn read_frames(
        &self,
        start_frame: u64,
        frames: usize,
        chunk_timeout: Duration,
        out: &mut Vec<i16>,
    ) -> Result<(), CacheError> {
        let first = frame_to_sample(start_frame, self.channels);
        let end = first + frame_to_sample(frames as u64, self.channels);
        let per_chunk = self.cache.samples_per_chunk() as u64;

        out.clear();
        out.reserve(frames * self.channels as usize);

        let mut next = first;
        let mut last_id = None;
        while next < end {
            let id = next / per_chunk;
            let Some(chunk) = self.cache.wait_timeout(id, chunk_timeout)? else {
                // Past end of stream
                break;
            };
            last_id = Some(id);

            let from = (next - chunk.first_sample()) as usize;
            let to = ((end.min(chunk.end_sample())) - chunk.first_sample()) as usize;
            if from >= to {
                // Short final chunk ends before `next`
                break;
            }
            out.extend_from_slice(&chunk.samples()[from..to]);
            next += (to - from) as u64;
        }

        out.resize(frames * self.channels as usize, 0);

        if let Some(id) = last_id {
            if self.cache.get(id + 1).is_none() {
                trace!("Read-ahead requested chunk {}", id + 1);
            }
        }
        Ok(())
    }
}
