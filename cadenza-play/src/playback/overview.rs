//! Waveform overview peaks
//!
//! Subscribes to the chunk cache and reduces every chunk it reads to a
//! per-channel min/max pair, so a waveform display can be drawn from data
//! that playback or prefetching already pulled in.

use crate::cache::{Chunk, ChunkCache, ChunkId, ChunkListener};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Min/max of one chunk, per channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkPeaks {
    pub chunk_id: ChunkId,
    pub first_frame: u64,
    pub frames: usize,
    pub min: Vec<i16>,
    pub max: Vec<i16>,
}

impl ChunkPeaks {
    pub fn from_chunk(chunk: &Chunk, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let mut min = vec![i16::MAX; channels];
        let mut max = vec![i16::MIN; channels];
        for frame in chunk.samples().chunks_exact(channels) {
            for (c, sample) in frame.iter().enumerate() {
                min[c] = min[c].min(*sample);
                max[c] = max[c].max(*sample);
            }
        }
        let frames = chunk.len() / channels;
        if frames == 0 {
            min.fill(0);
            max.fill(0);
        }
        Self {
            chunk_id: chunk.id(),
            first_frame: chunk.first_sample() / channels as u64,
            frames,
            min,
            max,
        }
    }
}

type PeakMap = Arc<Mutex<BTreeMap<ChunkId, ChunkPeaks>>>;

/// Background listener collecting [`ChunkPeaks`]
pub struct WaveformOverview {
    peaks: PeakMap,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    listener_id: u64,
}

impl WaveformOverview {
    /// Start collecting peaks for chunks read from now on
    pub fn spawn(cache: &ChunkCache, channels: u16, capacity: usize) -> std::io::Result<Self> {
        let listener = cache.subscribe(capacity);
        let listener_id = listener.id();
        let peaks: PeakMap = Arc::new(Mutex::new(BTreeMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let peaks = Arc::clone(&peaks);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("cadenza-overview".to_string())
                .spawn(move || collect(listener, channels, peaks, running))?
        };

        debug!("Waveform overview listening (listener {})", listener_id);
        Ok(Self {
            peaks,
            running,
            thread: Some(thread),
            listener_id,
        })
    }

    /// Peaks collected so far, in chunk order
    pub fn peaks(&self) -> Vec<ChunkPeaks> {
        self.peaks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: ChunkId) -> Option<ChunkPeaks> {
        self.peaks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peaks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    /// Stop listening; collected peaks stay available
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Waveform overview thread panicked");
            }
        }
    }
}

impl Drop for WaveformOverview {
    fn drop(&mut self) {
        self.stop();
    }
}

fn collect(listener: ChunkListener, channels: u16, peaks: PeakMap, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        let Some(chunk) = listener.recv_timeout(POLL_INTERVAL) else {
            continue;
        };
        let entry = ChunkPeaks::from_chunk(&chunk, channels);
        peaks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.chunk_id, entry);
    }
    if listener.dropped() > 0 {
        debug!("Waveform overview missed {} chunks", listener.dropped());
    }
}
