//! Loop-seam crossfade padding
//!
//! The final batch of a pass through the play range carries the remaining
//! `r` source frames plus `p` synthesized padding frames, where
//! `p >= min_frames` and `(r + p)` is a whole number of mix windows. The
//! padding blends linearly from the last source frame toward the range's
//! first frame (looping) or toward silence (one-shot), so the seam has no
//! step discontinuity.

/// Padding frames to append after `remaining` frames
pub fn padding_frames(remaining: usize, window: usize, min_frames: usize) -> usize {
    let window = window.max(1);
    let total = (remaining + min_frames).div_ceil(window) * window;
    total - remaining
}

/// Append `frames` blended frames from `from` toward `to`
///
/// `from` and `to` are single interleaved frames of equal length. Frame
/// `i` is `from * (1 - t) + to * t` with `t = (i + 1) / (frames + 1)`, so
/// neither endpoint is repeated and every sample lies between them.
pub fn blend_frames(from: &[i16], to: &[i16], frames: usize, out: &mut Vec<i16>) {
    debug_assert_eq!(from.len(), to.len());
    out.reserve(frames * from.len());
    for i in 0..frames {
        let t = (i + 1) as f32 / (frames + 1) as f32;
        for (a, b) in from.iter().zip(to.iter()) {
            let v = *a as f32 * (1.0 - t) + *b as f32 * t;
            out.push(v.round() as i16);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_rounds_to_window() {
        assert_eq!(padding_frames(0, 64, 20), 64);
        assert_eq!(padding_frames(44, 64, 20), 20);
        assert_eq!(padding_frames(45, 64, 20), 83);
        assert_eq!(padding_frames(100, 64, 20), 28);
        for remaining in 0..500 {
            let p = padding_frames(remaining, 64, 20);
            assert!(p >= 20);
            assert!(p < 20 + 64);
            assert_eq!((remaining + p) % 64, 0);
        }
    }

    #[test]
    fn test_blend_is_monotonic_between_endpoints() {
        let mut out = Vec::new();
        blend_frames(&[1000, -1000], &[-3000, 3000], 20, &mut out);
        assert_eq!(out.len(), 40);

        let left: Vec<i16> = out.iter().step_by(2).copied().collect();
        assert!(left.windows(2).all(|w| w[1] <= w[0]));
        assert!(left.iter().all(|v| (-3000..=1000).contains(v)));
        assert!(left[0] < 1000 && left[19] > -3000);
    }

    #[test]
    fn test_first_padding_sample_has_no_spike() {
        let cases: [(i16, i16); 5] = [
            (32767, -32768),
            (-32768, -32768),
            (12, 30000),
            (0, 0),
            (-5, 7),
        ];
        for (last, first) in cases {
            let mut out = Vec::new();
            blend_frames(&[last], &[first], 20, &mut out);
            let bound = (last as i32).abs().max((first as i32).abs());
            assert!((out[0] as i32).abs() <= bound, "{} -> {}", last, first);
        }
    }

    #[test]
    fn test_blend_to_silence_fades_out() {
        let mut out = Vec::new();
        blend_frames(&[20_000], &[0], 19, &mut out);
        assert_eq!(out[0], 19_000);
        assert_eq!(out[18], 1_000);
    }
}
