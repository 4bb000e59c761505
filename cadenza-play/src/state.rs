//! Shared playback state
//!
//! Thread-safe state shared between the control surface, the worker
//! threads and the position reporter. Settings the workers poll (range
//! and gains) carry version counters so a worker only takes the lock
//! when something actually changed.

use crate::playback::mixer::PeakMeter;
use crate::playback::position::PositionTracker;
use crate::playback::{PlayRange, StateCell};
use crate::score::StaffId;
use cadenza_common::events::{EventBus, PlaybackEvent, PlaybackState, StopReason};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

/// User-set mix gains
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub waveform: f32,
    pub synth: f32,
}

/// Shared state accessible by all components
pub struct SharedState {
    /// Authoritative playback state
    pub playback: StateCell,

    /// Event broadcaster for front ends
    pub events: EventBus,

    /// Cursor position tracking
    pub tracker: PositionTracker,

    /// Per-source peak levels since the last poll
    pub peaks: PeakMeter,

    session_id: RwLock<Uuid>,
    range: RwLock<PlayRange>,
    gains: RwLock<Gains>,
    gains_version: AtomicU64,
    muted_staves: RwLock<HashSet<StaffId>>,
    metronome_muted: AtomicBool,

    /// Bumped on range and score edits
    timeline_version: AtomicU64,

    stop_reason: Mutex<Option<StopReason>>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("playback", &self.playback.get())
            .field("session_id", &self.session_id())
            .field("range", &self.range())
            .finish_non_exhaustive()
    }
}

impl SharedState {
    pub fn new(event_capacity: usize, range: PlayRange, gains: Gains, metronome_muted: bool) -> Self {
        Self {
            playback: StateCell::new(),
            events: EventBus::new(event_capacity),
            tracker: PositionTracker::new(),
            peaks: PeakMeter::new(),
            session_id: RwLock::new(Uuid::nil()),
            range: RwLock::new(range),
            gains: RwLock::new(gains),
            gains_version: AtomicU64::new(0),
            muted_staves: RwLock::new(HashSet::new()),
            metronome_muted: AtomicBool::new(metronome_muted),
            timeline_version: AtomicU64::new(0),
            stop_reason: Mutex::new(None),
        }
    }

    /// Broadcast an event to all subscribers (no receivers is fine)
    pub fn broadcast_event(&self, event: PlaybackEvent) {
        self.events.emit_lossy(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Emit `StateChanged` for a transition that already happened
    pub fn broadcast_transition(&self, old_state: PlaybackState, new_state: PlaybackState) {
        self.broadcast_event(PlaybackEvent::StateChanged {
            old_state,
            new_state,
            session_id: self.session_id(),
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn session_id(&self) -> Uuid {
        *self.session_id.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new session id and forget the previous stop reason
    pub fn begin_session(&self) -> Uuid {
        let id = Uuid::new_v4();
        *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = id;
        *self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner) = None;
        id
    }

    pub fn range(&self) -> PlayRange {
        *self.range.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_range(&self, range: PlayRange) {
        *self.range.write().unwrap_or_else(PoisonError::into_inner) = range;
        self.bump_timeline();
    }

    pub fn gains(&self) -> Gains {
        *self.gains.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// User gain change; the mix worker picks it up and drops any reduction
    pub fn set_gains(&self, gains: Gains) {
        let mut slot = self.gains.write().unwrap_or_else(PoisonError::into_inner);
        *slot = gains;
        self.gains_version.fetch_add(1, Ordering::AcqRel);
    }

    /// Publish gains reduced by the mixer without counting as a user change
    ///
    /// Only stored while `expected_version` is still current, so a user
    /// change made during the mix window is never overwritten. Returns
    /// whether the gains were stored.
    pub fn record_reduced_gains(&self, expected_version: u64, gains: Gains) -> bool {
        let mut slot = self.gains.write().unwrap_or_else(PoisonError::into_inner);
        if self.gains_version.load(Ordering::Acquire) != expected_version {
            return false;
        }
        *slot = gains;
        true
    }

    pub fn gains_version(&self) -> u64 {
        self.gains_version.load(Ordering::Acquire)
    }

    pub fn is_staff_muted(&self, staff: StaffId) -> bool {
        self.muted_staves
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&staff)
    }

    /// Returns false when the staff already had that mute state
    pub fn set_staff_muted(&self, staff: StaffId, muted: bool) -> bool {
        let mut staves = self.muted_staves.write().unwrap_or_else(PoisonError::into_inner);
        if muted {
            staves.insert(staff)
        } else {
            staves.remove(&staff)
        }
    }

    pub fn is_metronome_muted(&self) -> bool {
        self.metronome_muted.load(Ordering::Acquire)
    }

    pub fn set_metronome_muted(&self, muted: bool) {
        self.metronome_muted.store(muted, Ordering::Release);
    }

    pub fn timeline_version(&self) -> u64 {
        self.timeline_version.load(Ordering::Acquire)
    }

    /// Mark derived events stale
    pub fn bump_timeline(&self) {
        self.timeline_version.fetch_add(1, Ordering::AcqRel);
    }

    /// Record why the session is stopping; the first reason wins
    pub fn set_stop_reason(&self, reason: StopReason) {
        let mut slot = self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
