//! Synthesizer boundary and a small built-in sine synthesizer
//!
//! The engine drives any [`Synthesizer`] with note-on/note-off messages and
//! asks it to render one mix window at a time. The synthesizer is shared
//! between the mix worker, the event scheduler (delayed note-offs) and the
//! audition control, hence [`SharedSynth`].

use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};

/// MIDI channel conventionally used for percussion (metronome clicks)
pub const PERCUSSION_CHANNEL: u8 = 9;

/// Opaque sample-producing instrument
pub trait Synthesizer: Send {
    /// Start sounding `pitch` on `channel`
    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8);

    /// Release `pitch` on `channel`; releasing a silent note is a no-op
    fn note_off(&mut self, channel: u8, pitch: u8);

    /// Overwrite `out` (interleaved, whole frames) with the next frames
    fn render_frames(&mut self, out: &mut [i16]);

    /// Release everything that is sounding
    fn all_notes_off(&mut self);
}

/// Synthesizer shared across threads
pub type SharedSynth = Arc<Mutex<dyn Synthesizer>>;

/// Wrap a synthesizer for sharing with the engine
pub fn shared<S: Synthesizer + 'static>(synth: S) -> SharedSynth {
    Arc::new(Mutex::new(synth))
}

const MAX_VOICES: usize = 32;
const ATTACK_FRAMES: u32 = 64;
const VOICE_LEVEL: f32 = 0.2;

#[derive(Debug, Clone)]
struct Voice {
    channel: u8,
    pitch: u8,
    phase: f32,
    phase_inc: f32,
    level: f32,
    age: u32,
    envelope: f32,
    releasing: bool,
    /// Per-frame multiplier while sustaining (percussion decays on its own)
    sustain_decay: f32,
}

/// Polyphonic sine synthesizer with linear attack and exponential release
///
/// Good enough for metronome clicks, auditioning and headless testing;
/// real instruments plug in through [`Synthesizer`].
#[derive(Debug)]
pub struct SineSynth {
    sample_rate: u32,
    channels: u16,
    voices: Vec<Voice>,
    release_coef: f32,
}

impl SineSynth {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let sample_rate = sample_rate.max(1);
        // ~60ms to fall by 60dB
        let release_frames = sample_rate as f32 * 0.06;
        Self {
            sample_rate,
            channels: channels.max(1),
            voices: Vec::with_capacity(MAX_VOICES),
            release_coef: (0.001f32).powf(1.0 / release_frames),
        }
    }

    /// Number of voices still producing sound
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    fn frequency(pitch: u8) -> f32 {
        440.0 * 2f32.powf((pitch as f32 - 69.0) / 12.0)
    }
}

impl Synthesizer for SineSynth {
    fn note_on(&mut self, channel: u8, pitch: u8, velocity: u8) {
        if velocity == 0 {
            self.note_off(channel, pitch);
            return;
        }
        if self.voices.len() >= MAX_VOICES {
            // Steal the oldest voice
            if let Some((idx, _)) = self.voices.iter().enumerate().max_by_key(|(_, v)| v.age) {
                self.voices.swap_remove(idx);
            }
        }

        let sustain_decay = if channel == PERCUSSION_CHANNEL {
            (0.001f32).powf(1.0 / (self.sample_rate as f32 * 0.03))
        } else {
            1.0
        };

        self.voices.push(Voice {
            channel,
            pitch,
            phase: 0.0,
            phase_inc: Self::frequency(pitch) / self.sample_rate as f32,
            level: VOICE_LEVEL * velocity.min(127) as f32 / 127.0,
            age: 0,
            envelope: 0.0,
            releasing: false,
            sustain_decay,
        });
    }

    fn note_off(&mut self, channel: u8, pitch: u8) {
        // Release only the oldest sounding instance so overlapping
        // same-pitch notes end one at a time
        if let Some(voice) = self
            .voices
            .iter_mut()
            .filter(|v| v.channel == channel && v.pitch == pitch && !v.releasing)
            .max_by_key(|v| v.age)
        {
            voice.releasing = true;
        }
    }

    fn render_frames(&mut self, out: &mut [i16]) {
        let channels = self.channels as usize;
        for frame in out.chunks_mut(channels) {
            let mut sum = 0.0f32;
            for voice in self.voices.iter_mut() {
                if voice.age < ATTACK_FRAMES && !voice.releasing {
                    voice.envelope = (voice.age + 1) as f32 / ATTACK_FRAMES as f32;
                } else if voice.releasing {
                    voice.envelope *= self.release_coef;
                } else {
                    voice.envelope *= voice.sustain_decay;
                }
                voice.age = voice.age.saturating_add(1);

                sum += (voice.phase * TAU).sin() * voice.level * voice.envelope;
                voice.phase = (voice.phase + voice.phase_inc).fract();
            }
            let sample = (sum * i16::MAX as f32).clamp(-(i16::MAX as f32), i16::MAX as f32) as i16;
            frame.fill(sample);
        }
        self.voices.retain(|v| v.age < ATTACK_FRAMES || v.envelope > 1e-4);
    }

    fn all_notes_off(&mut self) {
        for voice in self.voices.iter_mut() {
            voice.releasing = true;
        }
    }
}
