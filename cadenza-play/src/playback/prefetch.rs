//! Prefetch worker
//!
//! Reads waveform frames ahead of the mix worker and hands them over in
//! window-aligned batches. The play range is re-read every iteration, so
//! loop boundary edits apply to the next batch without restarting.

use super::crossfade::{blend_frames, padding_frames};
use super::engine::EngineCore;
use super::{Handoff, PlayRange, PrefetchBatch};
use crate::cache::CacheError;
use cadenza_common::events::{DesyncReason, PlaybackEvent, StopReason};
use crossbeam_channel::{SendTimeoutError, Sender};
use std::sync::Arc;
use tracing::{debug, error, trace};

pub(crate) struct Prefetcher {
    core: Arc<EngineCore>,
    tx: Sender<Handoff>,
    next_frame: u64,
}

/// Why a read did not produce frames
enum ReadOutcome {
    /// Playback is no longer `Playing`
    Stopped,
    /// Data is unavailable for good; the session was stopped
    Failed,
}

impl Prefetcher {
    pub(crate) fn new(core: Arc<EngineCore>, tx: Sender<Handoff>, start_frame: u64) -> Self {
        Self {
            core,
            tx,
            next_frame: start_frame,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("Prefetch worker started at frame {}", self.next_frame);
        self.fill();
        debug!("Prefetch worker exiting");
        self.core.worker_exited("prefetch");
    }

    fn fill(&mut self) {
        let prefetch = self.core.config.playback.prefetch_frames as u64;

        while self.core.is_playing() {
            let range = self.core.shared.range();
            if range.is_empty() {
                debug!("Play range is empty, ending pass");
                self.send(Handoff::EndOfRange);
                return;
            }

            // Range edited under us
            if self.next_frame < range.start_frame
                || (self.next_frame >= range.end_frame && range.looping)
            {
                trace!(
                    "Frame {} outside range {}..{}, restarting at range start",
                    self.next_frame,
                    range.start_frame,
                    range.end_frame
                );
                self.next_frame = range.start_frame;
            } else if self.next_frame >= range.end_frame {
                self.send(Handoff::EndOfRange);
                return;
            }

            let remaining = range.end_frame - self.next_frame;
            let read = if remaining > prefetch {
                self.read_batch(prefetch as usize)
            } else {
                self.read_final_batch(&range, remaining as usize)
            };
            let batch = match read {
                Ok(batch) => batch,
                Err(ReadOutcome::Stopped) => return,
                Err(ReadOutcome::Failed) => {
                    debug!("Prefetch abandoned at frame {}", self.next_frame);
                    return;
                }
            };

            let source_frames = remaining.min(prefetch);
            if !self.send(Handoff::Batch(batch)) {
                return;
            }

            if remaining > prefetch {
                self.next_frame += source_frames;
            } else if range.looping {
                self.next_frame = range.start_frame;
            } else {
                self.send(Handoff::EndOfRange);
                return;
            }
        }
    }

    fn read_batch(&self, frames: usize) -> Result<PrefetchBatch, ReadOutcome> {
        let start_frame = self.next_frame;
        let mut samples = Vec::new();
        self.read_into(start_frame, frames, &mut samples)?;
        Ok(PrefetchBatch {
            start_frame,
            samples,
        })
    }

    /// Remaining frames plus padding blended toward the loop start or silence
    fn read_final_batch(&self, range: &PlayRange, remaining: usize) -> Result<PrefetchBatch, ReadOutcome> {
        let playback = &self.core.config.playback;
        let channels = self.core.waveform.channels() as usize;
        let padding = padding_frames(remaining, playback.window_frames, playback.min_crossfade_frames);

        let mut batch = self.read_batch(remaining)?;

        let target = if range.looping {
            let mut first = Vec::with_capacity(channels);
            self.read_into(range.start_frame, 1, &mut first)?;
            first
        } else {
            vec![0; channels]
        };

        let last = match batch.samples.len().checked_sub(channels) {
            Some(offset) => batch.samples[offset..].to_vec(),
            None => vec![0; channels],
        };
        blend_frames(&last, &target, padding, &mut batch.samples);

        trace!(
            "Final batch at frame {}: {} frames + {} padding",
            batch.start_frame,
            remaining,
            padding
        );
        Ok(batch)
    }

    /// Read with retries on timeout for as long as playback continues
    fn read_into(&self, start_frame: u64, frames: usize, out: &mut Vec<i16>) -> Result<(), ReadOutcome> {
        let timeout = self.core.config.playback.handoff_timeout();
        loop {
            if !self.core.is_playing() {
                return Err(ReadOutcome::Stopped);
            }
            match self.core.waveform.read_frames(start_frame, frames, timeout, out) {
                Ok(()) => return Ok(()),
                Err(CacheError::Timeout { id }) => {
                    trace!("Waiting for chunk {} at frame {}", id, start_frame);
                }
                Err(e) => {
                    error!("Waveform read failed at frame {}: {}", start_frame, e);
                    if let CacheError::ReadFailed { id, .. } = &e {
                        self.core.shared.broadcast_event(PlaybackEvent::ChunkReadFailed {
                            chunk_id: *id,
                            error: e.to_string(),
                        });
                    }
                    self.core
                        .request_stop(StopReason::Desync(DesyncReason::WaveformUnavailable));
                    return Err(ReadOutcome::Failed);
                }
            }
        }
    }

    /// Blocking hand-off that gives up once playback stops
    fn send(&self, mut message: Handoff) -> bool {
        let timeout = self.core.config.playback.handoff_timeout();
        loop {
            match self.tx.send_timeout(message, timeout) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if !self.core.is_playing() {
                        return false;
                    }
                    message = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }
}
