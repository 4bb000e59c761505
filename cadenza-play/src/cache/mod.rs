//! Chunked, disk-backed sample cache
//!
//! A waveform is decoded once into a backing file of raw little-endian i16
//! samples and read back in fixed-size blocks ("chunks"). Writing and
//! reading run concurrently: the writer streams decoded batches to the file
//! while readers request chunks, and requests for bytes that have not been
//! written yet are parked until the writer catches up.
//!
//! ```text
//! SampleProducer ── write() ──▶ backing file ◀── fetch worker ──▶ resident chunks (LRU)
//!                                                   │                    │
//!                               get()/wait() ── request queue      wait() ◀─ condvar
//!                                                   │
//!                                             ChunkListener(s)
//! ```
//!
//! # Threads
//!
//! - **Writer**: the caller of [`ChunkCache::write`]; only one at a time.
//! - **Fetch worker**: owns file reads and is the only mutator of the
//!   resident map. Started by [`ChunkCache::create`] / [`ChunkCache::open`],
//!   stopped by [`ChunkCache::shutdown`] or drop.
//! - **Readers**: any thread calling [`ChunkCache::get`] (never blocks) or
//!   [`ChunkCache::wait`] (blocks until resident, absent or failed).

mod chunk;
mod listeners;
mod lru;
mod worker;

pub use chunk::{decode_samples, encode_samples, Chunk, ChunkId, SAMPLE_SIZE};
pub use listeners::{ChunkListener, ListenerId};
pub use lru::LruArena;

use crate::config::CacheConfig;
use cadenza_common::timing::bytes_to_samples;
use crossbeam_channel::{bounded, Sender, TrySendError};
use listeners::SharedRegistry;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use worker::{FetchRequest, FetchWorker};

/// Cache errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The chunk could not be read after every retry
    #[error("chunk {id} could not be read: {reason}")]
    ReadFailed { id: ChunkId, reason: String },

    /// `wait_timeout` elapsed before the chunk resolved
    #[error("timed out waiting for chunk {id}")]
    Timeout { id: ChunkId },

    /// The cache was shut down
    #[error("chunk cache is shut down")]
    Closed,

    /// Another thread is already writing
    #[error("a writer is already active")]
    WriterActive,

    /// The backing file is complete; nothing more can be written
    #[error("backing file is already complete")]
    AlreadyComplete,

    /// The sample producer failed; the stream was ended at the last good batch
    #[error("sample producer failed: {0}")]
    Producer(String),

    /// Backing file I/O failed
    #[error("backing file error: {0}")]
    Io(String),

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Error type returned by sample producers
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

/// Source of decoded sample batches for [`ChunkCache::write`]
pub trait SampleProducer {
    /// Next interleaved batch, or `None` at end of stream
    fn next_batch(&mut self) -> std::result::Result<Option<Vec<i16>>, ProducerError>;
}

impl<I> SampleProducer for I
where
    I: Iterator<Item = Vec<i16>>,
{
    fn next_batch(&mut self) -> std::result::Result<Option<Vec<i16>>, ProducerError> {
        Ok(self.next())
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Chunks holding data
    pub resident_chunks: usize,
    /// Requested ids found to lie past the end of the stream
    pub absent_markers: usize,
    /// Bytes written so far, -1 once complete
    pub bytes_written: i64,
    /// `get` calls that found the chunk resident
    pub hits: u64,
    /// `get` calls that did not
    pub misses: u64,
    /// Chunks read from the backing file
    pub loads: u64,
    pub evictions: u64,
    /// Read attempts that failed and were retried
    pub retries: u64,
    /// Chunks given up on
    pub failures: u64,
    pub listeners: usize,
}

pub(crate) struct CacheState {
    lru: LruArena<Arc<Chunk>>,
    /// Ids known to be past end of stream; kept out of the LRU so they
    /// never evict real chunks
    absent: HashSet<ChunkId>,
    failed: HashMap<ChunkId, String>,
    /// Final stream length, once the writer finished
    total_bytes: Option<u64>,
    closed: bool,
}

/// State shared between the cache handle and its fetch worker
pub(crate) struct Shared {
    config: CacheConfig,
    path: PathBuf,
    state: Mutex<CacheState>,
    /// Signalled (notify_all) when a chunk resolves or the cache closes
    arrived: Condvar,
    bytes_written: AtomicI64,
    listeners: SharedRegistry,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl Shared {
    fn new(path: PathBuf, config: CacheConfig, total_bytes: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CacheState {
                lru: LruArena::new(config.max_chunks),
                absent: HashSet::new(),
                failed: HashMap::new(),
                total_bytes,
                closed: false,
            }),
            arrived: Condvar::new(),
            bytes_written: AtomicI64::new(if total_bytes.is_some() { -1 } else { 0 }),
            listeners: Arc::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            config,
            path,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn broadcast(&self, chunk: &Arc<Chunk>) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .broadcast(chunk)
    }
}

/// Fixed-block cache over a growing backing file
pub struct ChunkCache {
    shared: Arc<Shared>,
    requests: Sender<FetchRequest>,
    worker: Mutex<Option<JoinHandle<()>>>,
    writer_active: AtomicBool,
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("path", &self.shared.path)
            .field("block_size", &self.shared.config.block_size)
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

impl ChunkCache {
    /// Create an empty backing file (truncating any existing one) for a
    /// streaming write
    pub fn create(path: impl AsRef<Path>, config: CacheConfig) -> Result<Self, CacheError> {
        let path = path.as_ref();
        File::create(path).map_err(|e| CacheError::Io(format!("{}: {}", path.display(), e)))?;
        Self::start(path.to_path_buf(), config, None)
    }

    /// Open a backing file that was completely written earlier
    pub fn open(path: impl AsRef<Path>, config: CacheConfig) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let len = std::fs::metadata(path)
            .map_err(|e| CacheError::Io(format!("{}: {}", path.display(), e)))?
            .len();
        Self::start(path.to_path_buf(), config, Some(len))
    }

    fn start(path: PathBuf, config: CacheConfig, total_bytes: Option<u64>) -> Result<Self, CacheError> {
        if config.block_size == 0 || config.block_size % SAMPLE_SIZE != 0 {
            return Err(CacheError::InvalidConfig(format!(
                "block_size {} is not a non-zero multiple of {}",
                config.block_size, SAMPLE_SIZE
            )));
        }
        if config.max_chunks == 0 || config.request_queue == 0 {
            return Err(CacheError::InvalidConfig(
                "max_chunks and request_queue must be non-zero".to_string(),
            ));
        }

        let (requests, request_rx) = bounded(config.request_queue);
        let shared = Shared::new(path, config, total_bytes);

        let fetch = FetchWorker::new(Arc::clone(&shared), request_rx);
        let handle = thread::Builder::new()
            .name("cadenza-chunk-fetch".to_string())
            .spawn(move || fetch.run())
            .map_err(|e| CacheError::Io(format!("failed to spawn fetch worker: {}", e)))?;

        info!(
            "Chunk cache ready: {} (block {} bytes, {} chunks max{})",
            shared.path.display(),
            shared.config.block_size,
            shared.config.max_chunks,
            if total_bytes.is_some() { ", complete" } else { "" }
        );

        Ok(Self {
            shared,
            requests,
            worker: Mutex::new(Some(handle)),
            writer_active: AtomicBool::new(false),
        })
    }

    /// Stream every batch from `producer` into the backing file
    ///
    /// Each batch is flushed before `bytes_written` advances, so the fetch
    /// worker never reads a block that is not on disk. At end of stream the
    /// final length is recorded and `bytes_written` becomes -1. If the
    /// producer or the file fails, the stream is ended at the last batch
    /// that was written so no reader waits forever.
    ///
    /// Returns the total number of samples written.
    pub fn write<P>(&self, producer: &mut P) -> Result<u64, CacheError>
    where
        P: SampleProducer + ?Sized,
    {
        if self.is_complete() {
            return Err(CacheError::AlreadyComplete);
        }
        if self.writer_active.swap(true, Ordering::AcqRel) {
            return Err(CacheError::WriterActive);
        }

        let result = self.write_batches(producer);
        self.writer_active.store(false, Ordering::Release);
        result
    }

    fn write_batches<P>(&self, producer: &mut P) -> Result<u64, CacheError>
    where
        P: SampleProducer + ?Sized,
    {
        let path = &self.shared.path;
        let mut file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| CacheError::Io(format!("{}: {}", path.display(), e)))?;
        let mut written = self.shared.bytes_written.load(Ordering::Acquire).max(0) as u64;

        loop {
            let batch = match producer.next_batch() {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    warn!("Sample producer failed after {} bytes: {}", written, e);
                    self.finish(written);
                    return Err(CacheError::Producer(e.to_string()));
                }
            };
            if batch.is_empty() {
                continue;
            }

            let bytes = encode_samples(&batch);
            if let Err(e) = file.write_all(&bytes).and_then(|_| file.flush()) {
                warn!("Backing file write failed after {} bytes: {}", written, e);
                self.finish(written);
                return Err(CacheError::Io(e.to_string()));
            }
            written += bytes.len() as u64;

            let mut state = self.shared.lock_state();
            self.shared.bytes_written.store(written as i64, Ordering::Release);
            if !state.failed.is_empty() {
                debug!("Write progress: clearing {} failed chunk(s)", state.failed.len());
                state.failed.clear();
            }
            drop(state);
            trace!("Backing file now {} bytes", written);
        }

        self.finish(written);
        Ok(written / SAMPLE_SIZE as u64)
    }

    fn finish(&self, total_bytes: u64) {
        let mut state = self.shared.lock_state();
        state.total_bytes = Some(total_bytes);
        self.shared.bytes_written.store(-1, Ordering::Release);
        drop(state);
        self.shared.arrived.notify_all();
        info!(
            "Backing file complete: {} bytes, {} chunks",
            total_bytes,
            total_bytes.div_ceil(self.shared.config.block_size as u64)
        );
    }

    fn request(&self, id: ChunkId) {
        match self.requests.try_send(FetchRequest::Fetch(id)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Fetch queue full, dropping request for chunk {}", id),
            Err(TrySendError::Disconnected(_)) => trace!("Fetch worker gone, dropping request for chunk {}", id),
        }
    }

    /// Request `id` and return it if already resident (never blocks)
    pub fn get(&self, id: ChunkId) -> Option<Arc<Chunk>> {
        self.request(id);
        let state = self.shared.lock_state();
        match state.lru.peek(id) {
            Some(chunk) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(chunk))
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Block until `id` is resident (`Some`), known absent (`None`), or failed
    pub fn wait(&self, id: ChunkId) -> Result<Option<Arc<Chunk>>, CacheError> {
        self.wait_until(id, None)
    }

    /// [`ChunkCache::wait`] bounded by `timeout`
    pub fn wait_timeout(
        &self,
        id: ChunkId,
        timeout: Duration,
    ) -> Result<Option<Arc<Chunk>>, CacheError> {
        self.wait_until(id, Some(Instant::now() + timeout))
    }

    fn wait_until(
        &self,
        id: ChunkId,
        deadline: Option<Instant>,
    ) -> Result<Option<Arc<Chunk>>, CacheError> {
        let block = self.shared.config.block_size as u64;
        let interval = worker::rerequest_interval(self.shared.config.retry_delay());
        let mut last_request: Option<Instant> = None;
        let mut state = self.shared.lock_state();

        loop {
            if state.closed {
                return Err(CacheError::Closed);
            }
            if let Some(chunk) = state.lru.peek(id) {
                return Ok(Some(Arc::clone(chunk)));
            }
            if state.absent.contains(&id) {
                return Ok(None);
            }
            if let Some(reason) = state.failed.get(&id) {
                return Err(CacheError::ReadFailed {
                    id,
                    reason: reason.clone(),
                });
            }
            if matches!(state.total_bytes, Some(total) if id * block >= total) {
                return Ok(None);
            }

            // Re-request every interval in case the queue dropped it; other
            // chunks arriving must not postpone this
            let now = Instant::now();
            let mut wake_at = match last_request {
                Some(at) if now < at + interval => at + interval,
                _ => {
                    self.request(id);
                    last_request = Some(now);
                    now + interval
                }
            };
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Err(CacheError::Timeout { id });
                }
                wake_at = wake_at.min(deadline);
            }

            let (guard, _) = self
                .shared
                .arrived
                .wait_timeout(state, wake_at.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Register a listener receiving every newly read chunk
    pub fn subscribe(&self, capacity: usize) -> ChunkListener {
        ChunkListener::subscribe(&self.shared.listeners, capacity)
    }

    /// Remove a listener by id; returns false if it was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(id)
    }

    /// Clear a permanent read failure so the chunk can be fetched again
    pub fn forget_failure(&self, id: ChunkId) -> bool {
        let removed = self.shared.lock_state().failed.remove(&id).is_some();
        if removed {
            debug!("Forgot read failure for chunk {}", id);
        }
        removed
    }

    /// Stop the fetch worker and fail every waiter with [`CacheError::Closed`]
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock_state();
            state.closed = true;
        }
        self.shared.arrived.notify_all();
        let _ = self.requests.try_send(FetchRequest::Shutdown);

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
            debug!("Chunk cache shut down: {}", self.shared.path.display());
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.lock_state();
        let resident_chunks = state.lru.len();
        let absent_markers = state.absent.len();
        drop(state);

        CacheStats {
            resident_chunks,
            absent_markers,
            bytes_written: self.bytes_written(),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            loads: self.shared.loads.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
            listeners: self
                .shared
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Resident chunk ids, most recently used first
    pub fn resident_ids(&self) -> Vec<ChunkId> {
        self.shared.lock_state().lru.keys()
    }

    /// Bytes durably written, or -1 once the write completed
    pub fn bytes_written(&self) -> i64 {
        self.shared.bytes_written.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.shared.lock_state().total_bytes.is_some()
    }

    /// Id and byte length of the final chunk, once the stream is complete
    ///
    /// A length of zero means the stream ends exactly on a block boundary
    /// and the id itself is already past the end.
    pub fn end_of_stream(&self) -> Option<(ChunkId, usize)> {
        let block = self.shared.config.block_size as u64;
        self.shared
            .lock_state()
            .total_bytes
            .map(|total| (total / block, (total % block) as usize))
    }

    /// Stream length in samples, once complete
    pub fn total_samples(&self) -> Option<u64> {
        self.shared
            .lock_state()
            .total_bytes
            .map(|total| bytes_to_samples(total, SAMPLE_SIZE))
    }

    /// Chunk holding the sample at `index`
    pub fn chunk_for_sample(&self, index: u64) -> ChunkId {
        index / self.samples_per_chunk() as u64
    }

    pub fn samples_per_chunk(&self) -> usize {
        self.shared.config.samples_per_chunk()
    }

    pub fn block_size(&self) -> usize {
        self.shared.config.block_size
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

impl Drop for ChunkCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(block_size: usize, max_chunks: usize) -> CacheConfig {
        CacheConfig {
            block_size,
            max_chunks,
            retry_delay_ms: 2,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_write_then_wait_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = ChunkCache::create(dir.path().join("wave.raw"), config(8, 16)).unwrap();

        let samples: Vec<i16> = (0..10).map(|i| i * 100 - 300).collect();
        let written = cache.write(&mut vec![samples[..7].to_vec(), samples[7..].to_vec()].into_iter());
        assert_eq!(written, Ok(10));
        assert_eq!(cache.bytes_written(), -1);
        assert_eq!(cache.end_of_stream(), Some((2, 4)));

        let c0 = cache.wait(0).unwrap().unwrap();
        let c1 = cache.wait(1).unwrap().unwrap();
        let c2 = cache.wait(2).unwrap().unwrap();
        assert_eq!(c0.samples(), &samples[0..4]);
        assert_eq!(c1.samples(), &samples[4..8]);
        assert_eq!(c2.samples(), &samples[8..10]);
        assert_eq!(c2.first_sample(), 8);

        assert_eq!(cache.wait(3), Ok(None));
    }

    #[test]
    fn test_second_write_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = ChunkCache::create(dir.path().join("wave.raw"), config(8, 4)).unwrap();
        cache.write(&mut std::iter::empty::<Vec<i16>>()).unwrap();
        assert_eq!(
            cache.write(&mut std::iter::once(vec![1i16])),
            Err(CacheError::AlreadyComplete)
        );
    }

    #[test]
    fn test_producer_failure_ends_stream() {
        struct Failing(u32);
        impl SampleProducer for Failing {
            fn next_batch(&mut self) -> std::result::Result<Option<Vec<i16>>, ProducerError> {
                self.0 += 1;
                if self.0 == 1 {
                    Ok(Some(vec![5; 4]))
                } else {
                    Err("decoder exploded".into())
                }
            }
        }

        let dir = TempDir::new().unwrap();
        let cache = ChunkCache::create(dir.path().join("wave.raw"), config(8, 4)).unwrap();
        assert!(matches!(cache.write(&mut Failing(0)), Err(CacheError::Producer(_))));
        assert_eq!(cache.total_samples(), Some(4));
        assert_eq!(cache.wait(0).unwrap().unwrap().samples(), &[5; 4]);
        assert_eq!(cache.wait(1), Ok(None));
    }

    #[test]
    fn test_rejects_odd_block_size() {
        let dir = TempDir::new().unwrap();
        let result = ChunkCache::create(dir.path().join("wave.raw"), config(7, 4));
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_shutdown_fails_waiters() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ChunkCache::create(dir.path().join("wave.raw"), config(8, 4)).unwrap());

        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.wait(0))
        };
        thread::sleep(Duration::from_millis(20));
        cache.shutdown();
        assert_eq!(waiter.join().unwrap(), Err(CacheError::Closed));
    }

    #[test]
    fn test_dropped_request_is_resent_while_other_chunks_arrive() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            request_queue: 1,
            ..config(8, 4)
        };
        let shared = Shared::new(dir.path().join("wave.raw"), config, Some(64));
        let (requests, request_rx) = bounded(1);
        // Queue already full: the waiter's first request is dropped
        requests.try_send(FetchRequest::Fetch(7)).unwrap();
        let cache = Arc::new(ChunkCache {
            shared: Arc::clone(&shared),
            requests,
            worker: Mutex::new(None),
            writer_active: AtomicBool::new(false),
        });

        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.wait_timeout(0, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(5));
        assert_eq!(request_rx.try_recv(), Ok(FetchRequest::Fetch(7)));

        // Wake the waiter far more often than the re-request interval
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut resent = false;
        while !resent && Instant::now() < deadline {
            shared.arrived.notify_all();
            resent = request_rx.try_recv() == Ok(FetchRequest::Fetch(0));
            thread::sleep(Duration::from_millis(1));
        }
        assert!(resent);

        let chunk = Arc::new(Chunk::new(0, 0, vec![3; 4]));
        shared.lock_state().lru.insert(0, Arc::clone(&chunk));
        shared.arrived.notify_all();
        assert_eq!(waiter.join().unwrap(), Ok(Some(chunk)));
    }

    #[test]
    fn test_wait_timeout_on_unwritten_chunk() {
        let dir = TempDir::new().unwrap();
        let cache = ChunkCache::create(dir.path().join("wave.raw"), config(8, 4)).unwrap();
        assert_eq!(
            cache.wait_timeout(5, Duration::from_millis(30)),
            Err(CacheError::Timeout { id: 5 })
        );
    }
}
