//! Beat and note event derivation
//!
//! For a play range and a current position the mix worker needs two
//! chronological lists: metronome ticks and note on/off events. Both are
//! clipped to the range and carry a cursor at the first event at or after
//! the current position, so after a score edit the lists can be rebuilt
//! and resumed without replaying anything already heard.

use crate::score::{BeatMap, NoteSource, StaffId};
use std::ops::Range;

use super::PlayRange;

/// Anything positioned on the frame timeline
pub trait Timed {
    fn frame(&self) -> u64;
}

/// Metronome tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatTick {
    pub frame: u64,
    pub beat: i64,
    /// First beat of a bar
    pub accent: bool,
}

impl Timed for BeatTick {
    fn frame(&self) -> u64 {
        self.frame
    }
}

/// Offs sort before ons at the same frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NoteAction {
    Off,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    pub frame: u64,
    pub action: NoteAction,
    pub note_id: u64,
    pub staff: StaffId,
    pub channel: u8,
    pub pitch: u8,
    pub velocity: u8,
}

impl Timed for NoteEvent {
    fn frame(&self) -> u64 {
        self.frame
    }
}

/// Chronological events with a "current" cursor and per-event fired flags
#[derive(Debug, Clone)]
pub struct EventList<T> {
    events: Vec<T>,
    fired: Vec<bool>,
    cursor: usize,
}

impl<T: Timed> EventList<T> {
    /// Wrap events already sorted by frame; the cursor starts at `current`
    pub fn new(events: Vec<T>, current: u64) -> Self {
        debug_assert!(events.windows(2).all(|w| w[0].frame() <= w[1].frame()));
        let mut list = Self {
            fired: vec![false; events.len()],
            events,
            cursor: 0,
        };
        list.resync(current);
        list
    }

    /// Move the cursor to the first event at or after `current`
    ///
    /// Everything before it counts as fired, everything after as pending.
    pub fn resync(&mut self, current: u64) {
        self.cursor = self.events.partition_point(|e| e.frame() < current);
        for (i, fired) in self.fired.iter_mut().enumerate() {
            *fired = i < self.cursor;
        }
    }

    /// Index range of events from the cursor up to (excluding) `window_end`
    pub fn due(&self, window_end: u64) -> Range<usize> {
        let end = self.cursor
            + self.events[self.cursor..].partition_point(|e| e.frame() < window_end);
        self.cursor..end
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.events.get(index)
    }

    pub fn is_fired(&self, index: usize) -> bool {
        self.fired.get(index).copied().unwrap_or(true)
    }

    pub fn mark_fired(&mut self, index: usize) {
        if let Some(fired) = self.fired.get_mut(index) {
            *fired = true;
        }
    }

    /// Advance the cursor past leading fired events
    pub fn advance(&mut self) {
        while self.cursor < self.events.len() && self.fired[self.cursor] {
            self.cursor += 1;
        }
    }

    /// First pending event
    pub fn current(&self) -> Option<&T> {
        self.events.get(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn events(&self) -> &[T] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Both event lists for one pass through a range
#[derive(Debug, Clone)]
pub struct Timeline {
    pub beats: EventList<BeatTick>,
    pub notes: EventList<NoteEvent>,
}

impl Timeline {
    pub fn derive(
        range: &PlayRange,
        current: u64,
        beat_map: &dyn BeatMap,
        notes: &dyn NoteSource,
        beats_per_bar: u32,
    ) -> Self {
        Self {
            beats: EventList::new(derive_beats(range, beat_map, beats_per_bar), current),
            notes: EventList::new(derive_notes(range, notes), current),
        }
    }

    /// Reposition both cursors (e.g. after the range start moved)
    pub fn resync(&mut self, current: u64) {
        self.beats.resync(current);
        self.notes.resync(current);
    }
}

/// Integer beats whose frame lies inside the range
///
/// Out-of-map range edges are clamped by the beat map, so a range extending
/// past the mapped span simply has no ticks there.
pub fn derive_beats(range: &PlayRange, beat_map: &dyn BeatMap, beats_per_bar: u32) -> Vec<BeatTick> {
    let (first_beat, _) = beat_map.to_beat(range.start_frame);
    let (last_beat, _) = beat_map.to_beat(range.end_frame);
    let beats_per_bar = beats_per_bar.max(1) as i64;

    let mut ticks = Vec::new();
    let mut beat = first_beat.ceil() as i64;
    while (beat as f64) <= last_beat {
        let (frame, _) = beat_map.to_frame(beat as f64);
        if frame >= range.end_frame {
            break;
        }
        if frame >= range.start_frame && ticks.last().map_or(true, |t: &BeatTick| t.frame < frame) {
            ticks.push(BeatTick {
                frame,
                beat,
                accent: beat.rem_euclid(beats_per_bar) == 0,
            });
        }
        beat += 1;
    }
    ticks
}

/// Note on/off events clipped to the range, offs before ons at equal frames
///
/// A note that started before the range turns on at the range start; a
/// note that outlasts the range turns off at the range end.
pub fn derive_notes(range: &PlayRange, source: &dyn NoteSource) -> Vec<NoteEvent> {
    let mut events = Vec::new();
    for note in source.notes_in(range.start_frame..range.end_frame) {
        let on = note.start_frame.max(range.start_frame);
        let off = note.end_frame.min(range.end_frame);
        if off <= on {
            continue;
        }
        let event = |frame, action| NoteEvent {
            frame,
            action,
            note_id: note.id,
            staff: note.staff,
            channel: note.channel,
            pitch: note.pitch,
            velocity: note.velocity,
        };
        events.push(event(on, NoteAction::On));
        events.push(event(off, NoteAction::Off));
    }
    events.sort_by_key(|e| (e.frame, e.action));
    events
}
