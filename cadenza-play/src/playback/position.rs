//! Output-frame to source-frame mapping and the position reporter
//!
//! The mix worker appends frames to the ring buffer in output order and
//! records a [`ClockMarker`] whenever the source position jumps (session
//! start, loop wrap, range edit). The reporter polls the device clock,
//! converts "frames consumed since the session started" into a source
//! frame through the latest marker at or before it, and publishes the
//! result.

use super::engine::EngineCore;
use cadenza_common::events::{DesyncReason, PlaybackEvent, StopReason};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Output frame `output_frame` of the session plays source frame `source_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockMarker {
    pub output_frame: u64,
    pub source_frame: u64,
}

const MAX_MARKERS: usize = 64;

#[derive(Debug, Default)]
pub struct PositionTracker {
    markers: Mutex<VecDeque<ClockMarker>>,
    /// Device clock reading when the session started
    reference: AtomicU64,
    /// Ring buffer frames-read counter when the session started
    ring_reference: AtomicU64,
    position: AtomicU64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session at `source_frame`
    pub fn reset(&self, device_frames: u64, ring_frames_read: u64, source_frame: u64) {
        self.reference.store(device_frames, Ordering::Release);
        self.ring_reference.store(ring_frames_read, Ordering::Release);
        self.position.store(source_frame, Ordering::Release);
        let mut markers = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        markers.clear();
        markers.push_back(ClockMarker {
            output_frame: 0,
            source_frame,
        });
    }

    /// Record a source discontinuity at `output_frame`
    pub fn push_marker(&self, marker: ClockMarker) {
        let mut markers = self.markers.lock().unwrap_or_else(PoisonError::into_inner);
        if markers.len() >= MAX_MARKERS {
            markers.pop_front();
        }
        markers.push_back(marker);
    }

    /// Session output frames actually played
    ///
    /// The device clock keeps counting while it plays silence during an
    /// underrun; the ring's read counter does not. Taking the smaller of
    /// the two keeps the cursor from running ahead of the audio.
    pub fn output_frames(&self, device_frames: u64, ring_frames_read: u64) -> u64 {
        let by_clock = device_frames.saturating_sub(self.reference.load(Ordering::Acquire));
        let by_ring = ring_frames_read.saturating_sub(self.ring_reference.load(Ordering::Acquire));
        by_clock.min(by_ring)
    }

    /// Map a session output frame to its source frame and publish it
    pub fn update(&self, output_frame: u64) -> u64 {
        let mut markers = self.markers.lock().unwrap_or_else(PoisonError::into_inner);

        // Drop markers superseded by a later one that is already audible
        while markers.len() > 1 && markers[1].output_frame <= output_frame {
            markers.pop_front();
        }

        let frame = match markers.front() {
            Some(m) if m.output_frame <= output_frame => m.source_frame + (output_frame - m.output_frame),
            Some(m) => m.source_frame,
            None => self.position.load(Ordering::Acquire),
        };
        drop(markers);

        self.position.store(frame, Ordering::Release);
        frame
    }

    /// Last published source frame
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }
}

/// Position reporter task for one play session
///
/// Publishes the audible source frame every poll interval and stops the
/// session when the device clock stops moving.
pub(crate) async fn run_reporter(core: Arc<EngineCore>) {
    let playback = &core.config.playback;
    let channels = core.waveform.channels().max(1) as u64;
    let stall_timeout = playback.stall_timeout();
    let session_id = core.shared.session_id();

    let mut ticker = interval(playback.position_poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_clock = core.clock.frames();
    let mut last_progress = Instant::now();
    let mut last_underruns = core.ring.stats().underruns;

    debug!("Position reporter started");
    loop {
        ticker.tick().await;
        if !core.is_playing() {
            break;
        }

        let device_frames = core.clock.frames();
        if device_frames != last_clock {
            last_clock = device_frames;
            last_progress = Instant::now();
        } else if last_progress.elapsed() >= stall_timeout {
            warn!(
                "Device clock stuck at {} frames for {:?}",
                device_frames,
                last_progress.elapsed()
            );
            core.request_stop(StopReason::Desync(DesyncReason::CallbackStalled));
            break;
        }

        let stats = core.ring.stats();
        if stats.underruns > last_underruns {
            debug!(
                "Output underruns: {} total (+{})",
                stats.underruns,
                stats.underruns - last_underruns
            );
            last_underruns = stats.underruns;
        }

        let tracker = &core.shared.tracker;
        let frame = tracker.update(tracker.output_frames(device_frames, stats.samples_read / channels));
        trace!("Position: frame {}", frame);
        core.shared
            .broadcast_event(PlaybackEvent::Position { frame, session_id });
    }
    debug!("Position reporter exiting");
    core.worker_exited("position");
}
