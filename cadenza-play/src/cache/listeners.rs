//! Registry of chunk-arrival listeners
//!
//! Every chunk the fetch worker reads is offered to each registered
//! listener with a non-blocking `try_send`. When a listener's queue is full
//! the new chunk is dropped for that listener only (drop-newest) and the
//! drop is counted. Listeners whose receiver is gone are pruned on the next
//! broadcast.

use super::chunk::Chunk;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Listener identity, unique per cache
pub type ListenerId = u64;

struct Entry {
    id: ListenerId,
    tx: Sender<Arc<Chunk>>,
    dropped: u64,
}

/// Registered listeners of one cache
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: ListenerId,
    entries: Vec<Entry>,
}

pub(crate) type SharedRegistry = Arc<Mutex<ListenerRegistry>>;

impl ListenerRegistry {
    pub(crate) fn register(&mut self, tx: Sender<Arc<Chunk>>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry { id, tx, dropped: 0 });
        debug!("Chunk listener {} registered ({} total)", id, self.entries.len());
        id
    }

    pub(crate) fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            debug!("Chunk listener {} unregistered", id);
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn dropped(&self, id: ListenerId) -> Option<u64> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.dropped)
    }

    /// Offer `chunk` to every listener; returns how many accepted it
    pub(crate) fn broadcast(&mut self, chunk: &Arc<Chunk>) -> usize {
        let mut delivered = 0;
        self.entries.retain_mut(|entry| match entry.tx.try_send(Arc::clone(chunk)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                entry.dropped += 1;
                if entry.dropped.is_power_of_two() {
                    warn!(
                        "Chunk listener {} is not keeping up: {} chunks dropped",
                        entry.id, entry.dropped
                    );
                } else {
                    trace!("Chunk {} dropped for listener {}", chunk.id(), entry.id);
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Pruning disconnected chunk listener {}", entry.id);
                false
            }
        });
        delivered
    }
}

/// Subscription handle returned by `ChunkCache::subscribe`
///
/// Dropping the handle unsubscribes it.
pub struct ChunkListener {
    id: ListenerId,
    rx: Receiver<Arc<Chunk>>,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl ChunkListener {
    pub(crate) fn subscribe(registry: &SharedRegistry, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        let id = registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(tx);
        Self {
            id,
            rx,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Underlying receiver, for use in `select!`
    pub fn receiver(&self) -> &Receiver<Arc<Chunk>> {
        &self.rx
    }

    pub fn try_recv(&self) -> Option<Arc<Chunk>> {
        match self.rx.try_recv() {
            Ok(chunk) => Some(chunk),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next chunk
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<Chunk>> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Some(chunk),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Chunks dropped for this listener because its queue was full
    pub fn dropped(&self) -> u64 {
        self.registry
            .upgrade()
            .and_then(|registry| {
                registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .dropped(self.id)
            })
            .unwrap_or(0)
    }
}

impl Drop for ChunkListener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u64) -> Arc<Chunk> {
        Arc::new(Chunk::new(id, id * 4, vec![id as i16; 4]))
    }

    #[test]
    fn test_full_listener_drops_newest() {
        let registry: SharedRegistry = Arc::default();
        let listener = ChunkListener::subscribe(&registry, 2);

        for id in 0..5 {
            registry.lock().unwrap().broadcast(&chunk(id));
        }

        assert_eq!(listener.dropped(), 3);
        assert_eq!(listener.try_recv().map(|c| c.id()), Some(0));
        assert_eq!(listener.try_recv().map(|c| c.id()), Some(1));
        assert!(listener.try_recv().is_none());
    }

    #[test]
    fn test_slow_listener_does_not_block_others() {
        let registry: SharedRegistry = Arc::default();
        let slow = ChunkListener::subscribe(&registry, 1);
        let fast = ChunkListener::subscribe(&registry, 8);

        let mut received = Vec::new();
        for id in 0..4 {
            registry.lock().unwrap().broadcast(&chunk(id));
            received.push(fast.try_recv().map(|c| c.id()));
        }

        assert_eq!(received, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert_eq!(slow.dropped(), 3);
        assert_eq!(fast.dropped(), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry: SharedRegistry = Arc::default();
        let a = ChunkListener::subscribe(&registry, 1);
        let b = ChunkListener::subscribe(&registry, 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.lock().unwrap().len(), 2);

        drop(a);
        assert_eq!(registry.lock().unwrap().len(), 1);
        assert!(registry.lock().unwrap().unregister(b.id()));
        assert!(!registry.lock().unwrap().unregister(b.id()));
    }

    #[test]
    fn test_disconnected_sender_is_pruned() {
        let registry: SharedRegistry = Arc::default();
        let (tx, rx) = bounded(1);
        registry.lock().unwrap().register(tx);
        drop(rx);

        assert_eq!(registry.lock().unwrap().broadcast(&chunk(0)), 0);
        assert_eq!(registry.lock().unwrap().len(), 0);
    }
}
