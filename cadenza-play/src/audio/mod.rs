//! Audio output side: ring buffer, device boundary, synthesizer

pub mod device;
pub mod ring_buffer;
pub mod synth;

#[cfg(feature = "cpal-output")]
pub mod cpal_output;

pub use device::{DeviceClock, ManualDevice, NullDevice, OutputDevice};
pub use ring_buffer::{RingBuffer, RingBufferError, RingBufferStats};
pub use synth::{SharedSynth, SineSynth, Synthesizer};

#[cfg(feature = "cpal-output")]
pub use cpal_output::CpalOutput;
