//! # Cadenza Common Library
//!
//! Shared code for the Cadenza playback core and its front ends:
//! - Configuration error type
//! - Event types (`PlaybackEvent`) and the broadcast `EventBus`
//! - Frame/sample/time conversions
//! - Bootstrap configuration file resolution

pub mod config;
pub mod error;
pub mod events;
pub mod timing;

pub use error::{Error, Result};
pub use events::{EventBus, PlaybackEvent, PlaybackState};
