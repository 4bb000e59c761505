//! Playback state cell
//!
//! The single authoritative `PlaybackState`, shared by handle between the
//! control surface and every worker. Only [`StateCell::transition`] changes
//! it (compare-and-swap), so two threads racing to stop see exactly one
//! winner and workers learn about stop requests by loading the state.

use cadenza_common::events::PlaybackState;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct StateCell {
    value: AtomicU8,
    /// Pairs with `changed` so waiters never miss a transition
    lock: Mutex<()>,
    changed: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    /// New cell in `Stopped`
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(PlaybackState::Stopped.as_u8()),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> PlaybackState {
        PlaybackState::from_u8(self.value.load(Ordering::Acquire))
    }

    pub fn is_playing(&self) -> bool {
        self.get() == PlaybackState::Playing
    }

    /// Atomically move `from -> to`; false if the state was not `from`
    pub fn transition(&self, from: PlaybackState, to: PlaybackState) -> bool {
        let swapped = self
            .value
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.changed.notify_all();
        }
        swapped
    }

    /// Block until the state equals `target` or `timeout` elapses
    pub fn wait_for(&self, target: PlaybackState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.get() == target {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .changed
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_only_valid_transitions_apply() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), PlaybackState::Stopped);
        assert!(!cell.transition(PlaybackState::Playing, PlaybackState::Stopping));
        assert!(cell.transition(PlaybackState::Stopped, PlaybackState::Playing));
        assert!(cell.is_playing());
        assert!(cell.transition(PlaybackState::Playing, PlaybackState::Stopping));
        assert!(!cell.transition(PlaybackState::Playing, PlaybackState::Stopping));
        assert!(cell.transition(PlaybackState::Stopping, PlaybackState::Stopped));
    }

    #[test]
    fn test_racing_stops_have_one_winner() {
        let cell = Arc::new(StateCell::new());
        cell.transition(PlaybackState::Stopped, PlaybackState::Playing);

        let winners: usize = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || cell.transition(PlaybackState::Playing, PlaybackState::Stopping))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(cell.get(), PlaybackState::Stopping);
    }

    #[test]
    fn test_wait_for_wakes_on_transition() {
        let cell = Arc::new(StateCell::new());
        cell.transition(PlaybackState::Stopped, PlaybackState::Playing);

        let waiter = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.wait_for(PlaybackState::Stopped, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        cell.transition(PlaybackState::Playing, PlaybackState::Stopping);
        cell.transition(PlaybackState::Stopping, PlaybackState::Stopped);
        assert!(waiter.join().unwrap());

        assert!(!cell.wait_for(PlaybackState::Playing, Duration::from_millis(10)));
    }
}
