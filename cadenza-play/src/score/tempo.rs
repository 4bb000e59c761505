use super::BeatMap;

/// Constant-tempo beat map over a finite frame span
///
/// Beat 0 sits at `origin_frame`; the map covers
/// `origin_frame..=origin_frame + span_frames`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoMap {
    bpm: f64,
    sample_rate: u32,
    origin_frame: u64,
    span_frames: u64,
}

impl TempoMap {
    pub fn new(bpm: f64, sample_rate: u32, origin_frame: u64, span_frames: u64) -> Self {
        Self {
            bpm: if bpm.is_finite() && bpm > 0.0 { bpm } else { 120.0 },
            sample_rate: sample_rate.max(1),
            origin_frame,
            span_frames,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn frames_per_beat(&self) -> f64 {
        self.sample_rate as f64 * 60.0 / self.bpm
    }

    fn last_frame(&self) -> u64 {
        self.origin_frame.saturating_add(self.span_frames)
    }

    fn last_beat(&self) -> f64 {
        self.span_frames as f64 / self.frames_per_beat()
    }
}

impl BeatMap for TempoMap {
    fn to_frame(&self, beat: f64) -> (u64, bool) {
        if beat.is_nan() || beat < 0.0 {
            return (self.origin_frame, false);
        }
        let offset = (beat * self.frames_per_beat()).round();
        if offset > self.span_frames as f64 {
            return (self.last_frame(), false);
        }
        (self.origin_frame + offset as u64, true)
    }

    fn to_beat(&self, frame: u64) -> (f64, bool) {
        if frame < self.origin_frame {
            return (0.0, false);
        }
        if frame > self.last_frame() {
            return (self.last_beat(), false);
        }
        ((frame - self.origin_frame) as f64 / self.frames_per_beat(), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_inside_span() {
        let map = TempoMap::new(90.0, 44_100, 1_000, 44_100 * 10);
        let (frame, ok) = map.to_frame(3.0);
        assert!(ok);
        assert_eq!(frame, 1_000 + 3 * 29_400);
        let (beat, ok) = map.to_beat(frame);
        assert!(ok);
        assert!((beat - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_span_clamps() {
        let map = TempoMap::new(120.0, 48_000, 500, 48_000);
        assert_eq!(map.to_frame(-1.0), (500, false));
        assert_eq!(map.to_frame(100.0), (48_500, false));
        assert_eq!(map.to_beat(0), (0.0, false));
        let (beat, ok) = map.to_beat(1_000_000);
        assert!(!ok);
        assert!((beat - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_tempo_falls_back() {
        assert_eq!(TempoMap::new(0.0, 48_000, 0, 1).bpm(), 120.0);
        assert_eq!(TempoMap::new(f64::NAN, 48_000, 0, 1).bpm(), 120.0);
    }
}
