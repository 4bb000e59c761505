//! Playback-related type definitions
//!
//! Supporting types for the playback state machine and the reasons a
//! playback session ends.

use serde::{Deserialize, Serialize};

/// Playback state enumeration
///
/// `Stopped -> Playing -> Stopping -> Stopped`. Workers only ever learn
/// about a stop request by observing the transition to `Stopping`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Stopping,
}

impl PlaybackState {
    /// Compact encoding used by the atomic state cell
    pub fn as_u8(self) -> u8 {
        match self {
            PlaybackState::Stopped => 0,
            PlaybackState::Playing => 1,
            PlaybackState::Stopping => 2,
        }
    }

    /// Decode from the atomic state cell (unknown values read as `Stopped`)
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Stopping,
            _ => PlaybackState::Stopped,
        }
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Why the engine lost sync with its producers or the device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DesyncReason {
    /// Prefetch delivered a batch that is empty or not window-aligned
    MisalignedBatch,
    /// Device clock did not advance while playing
    CallbackStalled,
    /// Waveform data could not be read from the cache
    WaveformUnavailable,
}

impl std::fmt::Display for DesyncReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesyncReason::MisalignedBatch => write!(f, "misaligned prefetch batch"),
            DesyncReason::CallbackStalled => write!(f, "audio callback stalled"),
            DesyncReason::WaveformUnavailable => write!(f, "waveform unavailable"),
        }
    }
}

/// Why a playback session ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum StopReason {
    /// Stop requested through the control surface
    Requested,
    /// Non-looping playback reached the end of its range
    EndOfRange,
    /// Engine stopped itself after losing sync
    Desync(DesyncReason),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested => write!(f, "requested"),
            StopReason::EndOfRange => write!(f, "end of range"),
            StopReason::Desync(reason) => write!(f, "desync: {}", reason),
        }
    }
}
