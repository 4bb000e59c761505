//! Waveform + synthesizer mixing with one-sided gain correction
//!
//! Each mix window is `waveform * waveform_gain + synth * synth_gain`. When
//! a mixed sample would leave the i16 range, both gains are multiplied by
//! `i16::MAX / |v|`, the samples already mixed in the window are scaled by
//! the same factor, and the reduced gains stay in effect for the rest of
//! the session. Gains are never raised automatically; only
//! [`Mixer::set_gains`] (a user action) does that.

use serde::Serialize;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::debug;

const MAX: f32 = i16::MAX as f32;

/// Gain-correcting two-source mixer, owned by the mix worker
#[derive(Debug, Clone)]
pub struct Mixer {
    waveform_gain: f32,
    synth_gain: f32,
    scratch: Vec<f32>,
    reductions: u64,
}

impl Mixer {
    pub fn new(waveform_gain: f32, synth_gain: f32) -> Self {
        Self {
            waveform_gain: sanitize(waveform_gain),
            synth_gain: sanitize(synth_gain),
            scratch: Vec::new(),
            reductions: 0,
        }
    }

    /// Replace both gains (clears any automatic reduction)
    pub fn set_gains(&mut self, waveform_gain: f32, synth_gain: f32) {
        self.waveform_gain = sanitize(waveform_gain);
        self.synth_gain = sanitize(synth_gain);
    }

    /// Current `(waveform, synth)` gains
    pub fn gains(&self) -> (f32, f32) {
        (self.waveform_gain, self.synth_gain)
    }

    /// Windows in which gain was reduced
    pub fn reductions(&self) -> u64 {
        self.reductions
    }

    /// Mix one window into `out`
    ///
    /// All three slices must have the same length. Returns true when the
    /// gains were reduced while mixing this window.
    pub fn mix(&mut self, waveform: &[i16], synth: &[i16], out: &mut [i16]) -> bool {
        debug_assert_eq!(waveform.len(), out.len());
        debug_assert_eq!(synth.len(), out.len());

        self.scratch.clear();
        self.scratch.resize(out.len(), 0.0);
        let mut reduced = false;

        for i in 0..out.len() {
            let mut v = waveform[i] as f32 * self.waveform_gain + synth[i] as f32 * self.synth_gain;
            let magnitude = v.abs();
            if magnitude > MAX {
                let factor = MAX / magnitude;
                self.waveform_gain *= factor;
                self.synth_gain *= factor;
                for earlier in &mut self.scratch[..i] {
                    *earlier *= factor;
                }
                v *= factor;
                reduced = true;
            }
            self.scratch[i] = v;
        }

        for (dst, v) in out.iter_mut().zip(self.scratch.iter()) {
            *dst = v.round().clamp(-MAX, MAX) as i16;
        }

        if reduced {
            self.reductions += 1;
            debug!(
                "Gain reduced to waveform={:.4}, synth={:.4}",
                self.waveform_gain, self.synth_gain
            );
        }
        reduced
    }
}

fn sanitize(gain: f32) -> f32 {
    if gain.is_finite() {
        gain.max(0.0)
    } else {
        1.0
    }
}

/// Peak magnitudes per source since the last poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeakLevels {
    pub waveform: u16,
    pub synth: u16,
}

/// Lock-free peak accumulator written by the mix worker, drained by the UI
#[derive(Debug, Default)]
pub struct PeakMeter {
    waveform: AtomicU16,
    synth: AtomicU16,
}

impl PeakMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the post-gain peaks of one window
    pub fn record(&self, waveform: &[i16], waveform_gain: f32, synth: &[i16], synth_gain: f32) {
        self.waveform
            .fetch_max(peak(waveform, waveform_gain), Ordering::Relaxed);
        self.synth.fetch_max(peak(synth, synth_gain), Ordering::Relaxed);
    }

    /// Return and reset the peaks
    pub fn take(&self) -> PeakLevels {
        PeakLevels {
            waveform: self.waveform.swap(0, Ordering::Relaxed),
            synth: self.synth.swap(0, Ordering::Relaxed),
        }
    }
}

fn peak(samples: &[i16], gain: f32) -> u16 {
    let raw = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
    (raw as f32 * gain).round().clamp(0.0, u16::MAX as f32) as u16
}
