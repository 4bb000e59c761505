//! Frame, sample and wall-clock conversions
//!
//! The playback core uses three position representations:
//!
//! 1. **Samples**: index into an interleaved stream (one value per channel)
//! 2. **Frames**: one sample per channel; the unit for mixing and score sync
//! 3. **Durations**: wall-clock time at the device sample rate
//!
//! ```text
//! sample index ── / channels ──▶ frame ── / sample_rate ──▶ seconds
//! ```
//!
//! Conversions toward coarser units truncate; conversions toward finer
//! units are exact.

use std::time::Duration;

/// Frame containing the given interleaved sample index
pub fn sample_to_frame(sample: u64, channels: u16) -> u64 {
    sample / channels.max(1) as u64
}

/// Index of the first interleaved sample of a frame
pub fn frame_to_sample(frame: u64, channels: u16) -> u64 {
    frame * channels.max(1) as u64
}

/// Wall-clock duration of `frames` at `sample_rate`
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let secs = frames / sample_rate as u64;
    let rem = frames % sample_rate as u64;
    Duration::from_secs(secs) + Duration::from_nanos(rem * 1_000_000_000 / sample_rate as u64)
}

/// Frames elapsed in `duration` at `sample_rate` (truncating)
pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_nanos() * sample_rate as u128 / 1_000_000_000) as u64
}

/// Milliseconds covered by `frames` (truncating), for log output
pub fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames * 1000 / sample_rate as u64
}

/// Number of samples held by `bytes` of raw storage at `sample_size` bytes each
pub fn bytes_to_samples(bytes: u64, sample_size: usize) -> u64 {
    bytes / sample_size.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_frame_conversions() {
        assert_eq!(sample_to_frame(0, 2), 0);
        assert_eq!(sample_to_frame(7, 2), 3);
        assert_eq!(frame_to_sample(3, 2), 6);
        assert_eq!(sample_to_frame(9, 1), 9);
        // channel count of zero is treated as mono
        assert_eq!(sample_to_frame(9, 0), 9);
    }

    #[test]
    fn test_duration_conversions() {
        assert_eq!(frames_to_duration(44_100, 44_100), Duration::from_secs(1));
        assert_eq!(frames_to_duration(22_050, 44_100), Duration::from_millis(500));
        assert_eq!(duration_to_frames(Duration::from_millis(500), 48_000), 24_000);
        assert_eq!(duration_to_frames(Duration::from_millis(66), 44_100), 2_910);
        assert_eq!(frames_to_ms(44_100 * 3, 44_100), 3_000);
        assert_eq!(frames_to_duration(10, 0), Duration::ZERO);
    }

    #[test]
    fn test_bytes_to_samples() {
        assert_eq!(bytes_to_samples(4096, 2), 2048);
        assert_eq!(bytes_to_samples(4097, 2), 2048);
    }
}
