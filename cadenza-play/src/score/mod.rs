//! Score timeline collaborators
//!
//! The engine sees the score only through two capabilities:
//! - [`BeatMap`]: fractional beat <-> frame mapping (monotonic)
//! - [`NoteSource`]: chronological notes overlapping a frame range
//!
//! [`TempoMap`] and [`Score`] are the in-process implementations used by
//! the demo binary and the tests.

mod tempo;

pub use tempo::TempoMap;

use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock};

/// Index of a staff within a score
pub type StaffId = usize;

/// Beat <-> frame mapping
///
/// Both directions report whether the input fell inside the mapped span.
/// Out-of-span inputs return the value clamped to the nearest edge with
/// `false`, and callers must cope with that.
pub trait BeatMap: Send + Sync {
    fn to_frame(&self, beat: f64) -> (u64, bool);
    fn to_beat(&self, frame: u64) -> (f64, bool);
}

/// A note mapped onto the frame timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedNote {
    /// Stable identity of the note within its source
    pub id: u64,
    pub staff: StaffId,
    pub channel: u8,
    pub pitch: u8,
    pub velocity: u8,
    pub start_frame: u64,
    /// Exclusive
    pub end_frame: u64,
}

/// Chronological note iterator over a frame range
pub trait NoteSource: Send + Sync {
    /// Notes overlapping `frames`, ordered by start frame
    fn notes_in(&self, frames: Range<u64>) -> Vec<TimedNote>;
}

/// A note in musical time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    pub pitch: u8,
    pub velocity: u8,
    pub start_beat: f64,
    pub duration_beats: f64,
}

impl Note {
    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.duration_beats
    }
}

#[derive(Debug, Clone)]
struct Staff {
    name: String,
    channel: u8,
    /// (id, note), sorted by start beat
    notes: Vec<(u64, Note)>,
}

#[derive(Debug, Default)]
struct ScoreData {
    staves: Vec<Staff>,
    next_note_id: u64,
}

/// In-memory score: staves of notes in beats, mapped through a [`BeatMap`]
///
/// Editable while playing; call `PlaybackEngine::notify_score_changed`
/// after an edit so the mix worker resynchronizes its event lists.
pub struct Score {
    beat_map: Arc<dyn BeatMap>,
    data: RwLock<ScoreData>,
}

impl std::fmt::Debug for Score {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Score")
            .field("staves", &data.staves.len())
            .field("notes", &data.staves.iter().map(|s| s.notes.len()).sum::<usize>())
            .finish()
    }
}

impl Score {
    pub fn new(beat_map: Arc<dyn BeatMap>) -> Self {
        Self {
            beat_map,
            data: RwLock::new(ScoreData::default()),
        }
    }

    /// Add a staff playing on `channel`
    pub fn add_staff(&self, name: impl Into<String>, channel: u8) -> StaffId {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        data.staves.push(Staff {
            name: name.into(),
            channel,
            notes: Vec::new(),
        });
        data.staves.len() - 1
    }

    /// Add a note; returns its id, or `None` for an unknown staff or an
    /// empty/negative duration
    pub fn add_note(&self, staff: StaffId, note: Note) -> Option<u64> {
        if !(note.duration_beats > 0.0) || !note.start_beat.is_finite() {
            return None;
        }
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let id = data.next_note_id;
        let notes = &mut data.staves.get_mut(staff)?.notes;
        let pos = notes.partition_point(|(_, n)| n.start_beat <= note.start_beat);
        notes.insert(pos, (id, note));
        data.next_note_id += 1;
        Some(id)
    }

    /// Remove a note by id
    pub fn remove_note(&self, id: u64) -> bool {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        for staff in data.staves.iter_mut() {
            if let Some(pos) = staff.notes.iter().position(|(nid, _)| *nid == id) {
                staff.notes.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn staff_count(&self) -> usize {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .staves
            .len()
    }

    pub fn staff_name(&self, staff: StaffId) -> Option<String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .staves
            .get(staff)
            .map(|s| s.name.clone())
    }

    pub fn beat_map(&self) -> Arc<dyn BeatMap> {
        Arc::clone(&self.beat_map)
    }
}

impl NoteSource for Score {
    fn notes_in(&self, frames: Range<u64>) -> Vec<TimedNote> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();

        for (staff_id, staff) in data.staves.iter().enumerate() {
            for (id, note) in &staff.notes {
                let (start_frame, _) = self.beat_map.to_frame(note.start_beat);
                if start_frame >= frames.end {
                    // Sorted by start: nothing later can overlap
                    break;
                }
                let (end_frame, _) = self.beat_map.to_frame(note.end_beat());
                if end_frame <= frames.start || end_frame <= start_frame {
                    continue;
                }
                out.push(TimedNote {
                    id: *id,
                    staff: staff_id,
                    channel: staff.channel,
                    pitch: note.pitch,
                    velocity: note.velocity,
                    start_frame,
                    end_frame,
                });
            }
        }

        out.sort_by_key(|n| (n.start_frame, n.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score() -> Score {
        // 120 bpm at 48kHz: 24_000 frames per beat
        Score::new(Arc::new(TempoMap::new(120.0, 48_000, 0, 48_000 * 60)))
    }

    fn note(pitch: u8, start_beat: f64, duration_beats: f64) -> Note {
        Note {
            pitch,
            velocity: 100,
            start_beat,
            duration_beats,
        }
    }

    #[test]
    fn test_notes_in_maps_to_frames_in_order() {
        let score = score();
        let melody = score.add_staff("melody", 0);
        let bass = score.add_staff("bass", 1);
        score.add_note(melody, note(64, 2.0, 1.0)).unwrap();
        score.add_note(bass, note(40, 0.0, 4.0)).unwrap();
        score.add_note(melody, note(62, 1.0, 1.0)).unwrap();

        let notes = score.notes_in(0..48_000 * 10);
        let pitches: Vec<u8> = notes.iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, vec![40, 62, 64]);
        assert_eq!(notes[1].start_frame, 24_000);
        assert_eq!(notes[1].end_frame, 48_000);
        assert_eq!(notes[0].channel, 1);
        assert_eq!(notes[0].staff, bass);
    }

    #[test]
    fn test_notes_in_returns_overlapping_only() {
        let score = score();
        let staff = score.add_staff("s", 0);
        score.add_note(staff, note(60, 0.0, 1.0)).unwrap(); // 0..24000
        score.add_note(staff, note(61, 1.0, 2.0)).unwrap(); // 24000..72000
        score.add_note(staff, note(62, 4.0, 1.0)).unwrap(); // 96000..120000

        let pitches: Vec<u8> = score
            .notes_in(30_000..90_000)
            .iter()
            .map(|n| n.pitch)
            .collect();
        assert_eq!(pitches, vec![61]);

        // End is exclusive, start of range touches the end of note 60
        let pitches: Vec<u8> = score.notes_in(24_000..24_001).iter().map(|n| n.pitch).collect();
        assert_eq!(pitches, vec![61]);
    }

    #[test]
    fn test_rejects_bad_notes_and_removes() {
        let score = score();
        let staff = score.add_staff("s", 0);
        assert_eq!(score.add_note(staff, note(60, 0.0, 0.0)), None);
        assert_eq!(score.add_note(7, note(60, 0.0, 1.0)), None);

        let id = score.add_note(staff, note(60, 0.0, 1.0)).unwrap();
        assert!(score.remove_note(id));
        assert!(!score.remove_note(id));
        assert!(score.notes_in(0..u64::MAX).is_empty());
        assert_eq!(score.staff_name(staff).as_deref(), Some("s"));
    }
}
