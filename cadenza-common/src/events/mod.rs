//! Event types for the Cadenza event system
//!
//! Provides the shared `PlaybackEvent` definition and an `EventBus` used by
//! the playback core to notify front ends (cursor, transport controls,
//! level meters) without coupling them to worker threads.

mod playback_types;

pub use playback_types::{DesyncReason, PlaybackState, StopReason};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Playback event types
///
/// Events are broadcast via `EventBus` and can be serialized for
/// out-of-process consumers (one JSON object per event, tagged by `type`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlaybackEvent {
    /// Playback state machine transition
    StateChanged {
        /// State before the transition
        old_state: PlaybackState,
        /// State after the transition
        new_state: PlaybackState,
        /// Play session this transition belongs to
        session_id: Uuid,
        /// When the transition happened
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Current playback frame, published for cursor placement
    ///
    /// Emitted by the position reporter roughly every 66ms while playing.
    Position {
        /// Source frame currently audible
        frame: u64,
        /// Play session
        session_id: Uuid,
    },

    /// Engine lost synchronization and is stopping
    Desync {
        reason: DesyncReason,
        session_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback session finished (all workers exited)
    Stopped {
        reason: StopReason,
        session_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A cache chunk could not be read after all retry attempts
    ChunkReadFailed {
        chunk_id: u64,
        error: String,
    },

    /// Automatic gain correction reduced the mix gains
    GainReduced {
        waveform_gain: f32,
        synth_gain: f32,
    },
}

impl PlaybackEvent {
    /// Session the event belongs to, when it is session-scoped
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            PlaybackEvent::StateChanged { session_id, .. }
            | PlaybackEvent::Position { session_id, .. }
            | PlaybackEvent::Desync { session_id, .. }
            | PlaybackEvent::Stopped { session_id, .. } => Some(*session_id),
            PlaybackEvent::ChunkReadFailed { .. } | PlaybackEvent::GainReduced { .. } => None,
        }
    }
}

/// Central event distribution bus
///
/// Thin wrapper around a tokio broadcast channel. Slow subscribers lag and
/// lose the oldest events; emitters never block, so the bus is safe to use
/// from worker threads.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlaybackEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before lagging receivers
    ///   start losing the oldest ones
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PlaybackEvent,
    ) -> Result<usize, broadcast::error::SendError<PlaybackEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PlaybackEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_fails() {
        let bus = EventBus::new(8);
        let result = bus.emit(PlaybackEvent::GainReduced {
            waveform_gain: 0.5,
            synth_gain: 0.5,
        });
        assert!(result.is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let session_id = Uuid::new_v4();

        bus.emit_lossy(PlaybackEvent::Position { frame: 64, session_id });
        bus.emit_lossy(PlaybackEvent::Position { frame: 128, session_id });

        match rx.try_recv().unwrap() {
            PlaybackEvent::Position { frame, .. } => assert_eq!(frame, 64),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            PlaybackEvent::Position { frame, .. } => assert_eq!(frame, 128),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_json_is_tagged() {
        let session_id = Uuid::nil();
        let event = PlaybackEvent::Position { frame: 42, session_id };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Position");
        assert_eq!(json["frame"], 42);
        assert_eq!(event.session_id(), Some(session_id));

        let event = PlaybackEvent::ChunkReadFailed {
            chunk_id: 3,
            error: "boom".to_string(),
        };
        assert_eq!(event.session_id(), None);
    }
}
