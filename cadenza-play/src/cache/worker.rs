//! Background fetch worker
//!
//! Single consumer of the fetch-request queue and the only thread that
//! mutates the resident map. Requests that cannot be served yet (bytes not
//! written, transient read error) are parked in a local deferred list and
//! retried after `retry_delay`.

use super::chunk::{decode_samples, Chunk, ChunkId, SAMPLE_SIZE};
use super::Shared;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Message on the fetch-request queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchRequest {
    Fetch(ChunkId),
    Shutdown,
}

#[derive(Debug)]
struct Deferred {
    id: ChunkId,
    due: Instant,
    /// Failed read attempts so far (0 while waiting for the writer)
    attempts: u32,
}

/// What the worker decided for one request
#[derive(Debug, PartialEq, Eq)]
enum Plan {
    /// Already resident, failed or closed: nothing to read
    Done,
    /// Bytes not written yet
    Wait,
    /// Beyond the end of the stream
    Absent,
    /// Read `len` bytes at `offset`
    Read { offset: u64, len: usize },
}

pub(crate) struct FetchWorker {
    shared: Arc<Shared>,
    requests: Receiver<FetchRequest>,
    deferred: Vec<Deferred>,
    file: Option<File>,
}

impl FetchWorker {
    pub(crate) fn new(shared: Arc<Shared>, requests: Receiver<FetchRequest>) -> Self {
        Self {
            shared,
            requests,
            deferred: Vec::new(),
            file: None,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("Chunk fetch worker started: {}", self.shared.path.display());

        loop {
            let message = match self.next_due() {
                None => self.requests.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(due) => self
                    .requests
                    .recv_timeout(due.saturating_duration_since(Instant::now())),
            };

            match message {
                Ok(FetchRequest::Fetch(id)) => self.handle(id, 0),
                Ok(FetchRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if self.shared.is_closed() {
                break;
            }
            self.retry_due();
        }

        debug!("Chunk fetch worker exiting");
    }

    fn next_due(&self) -> Option<Instant> {
        self.deferred.iter().map(|d| d.due).min()
    }

    fn retry_due(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        self.deferred.retain(|d| {
            if d.due <= now {
                due.push((d.id, d.attempts));
                false
            } else {
                true
            }
        });
        for (id, attempts) in due {
            self.handle(id, attempts);
        }
    }

    fn defer(&mut self, id: ChunkId, attempts: u32) {
        if self.deferred.iter().any(|d| d.id == id) {
            return;
        }
        self.deferred.push(Deferred {
            id,
            due: Instant::now() + self.shared.config.retry_delay(),
            attempts,
        });
    }

    fn plan(&self, id: ChunkId) -> Plan {
        let mut state = self.shared.lock_state();
        if state.closed || state.failed.contains_key(&id) || state.absent.contains(&id) {
            return Plan::Done;
        }
        if state.lru.touch(id) {
            trace!("Chunk {} already resident, promoted", id);
            return Plan::Done;
        }

        let block = self.shared.config.block_size as u64;
        let offset = id * block;
        match state.total_bytes {
            Some(total) if offset >= total => Plan::Absent,
            Some(total) => Plan::Read {
                offset,
                len: (total - offset).min(block) as usize,
            },
            None => {
                let written = self.shared.bytes_written.load(Ordering::Acquire).max(0) as u64;
                if written < offset + block {
                    Plan::Wait
                } else {
                    Plan::Read {
                        offset,
                        len: block as usize,
                    }
                }
            }
        }
    }

    fn handle(&mut self, id: ChunkId, attempts: u32) {
        match self.plan(id) {
            Plan::Done => {}
            Plan::Wait => {
                trace!("Chunk {} not written yet, deferring", id);
                self.defer(id, attempts);
            }
            Plan::Absent => {
                trace!("Chunk {} is past end of stream", id);
                self.shared.lock_state().absent.insert(id);
                self.shared.arrived.notify_all();
            }
            Plan::Read { offset, len } => match self.read_block(offset, len) {
                Ok(bytes) => {
                    let chunk = Arc::new(Chunk::new(
                        id,
                        offset / SAMPLE_SIZE as u64,
                        decode_samples(&bytes),
                    ));
                    self.shared.loads.fetch_add(1, Ordering::Relaxed);
                    self.store(id, Arc::clone(&chunk));
                    let delivered = self.shared.broadcast(&chunk);
                    trace!("Chunk {} loaded ({} bytes, {} listeners)", id, len, delivered);
                }
                Err(e) => self.read_failed(id, attempts + 1, e),
            },
        }
    }

    fn read_failed(&mut self, id: ChunkId, attempts: u32, e: std::io::Error) {
        // Reopen on the next attempt in case the handle went bad
        self.file = None;

        if attempts < self.shared.config.max_read_attempts {
            warn!(
                "Reading chunk {} failed (attempt {}/{}): {}",
                id, attempts, self.shared.config.max_read_attempts, e
            );
            self.shared.retries.fetch_add(1, Ordering::Relaxed);
            self.defer(id, attempts);
            return;
        }

        error!("Giving up on chunk {} after {} attempts: {}", id, attempts, e);
        self.shared.failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.lock_state();
        state.failed.insert(id, e.to_string());
        drop(state);
        self.shared.arrived.notify_all();
    }

    fn store(&self, id: ChunkId, chunk: Arc<Chunk>) {
        let mut state = self.shared.lock_state();
        if let Some((evicted, _)) = state.lru.insert(id, chunk) {
            self.shared.evictions.fetch_add(1, Ordering::Relaxed);
            trace!("Evicted chunk {}", evicted);
        }
        drop(state);
        self.shared.arrived.notify_all();
    }

    fn read_block(&mut self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.shared.path)?);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(std::io::ErrorKind::NotFound.into());
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = vec![0u8; len];
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

/// Upper bound on how long `wait` sleeps between re-requests
pub(crate) fn rerequest_interval(retry_delay: Duration) -> Duration {
    retry_delay.max(Duration::from_millis(1)) * 4
}
