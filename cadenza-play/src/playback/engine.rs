//! Playback engine
//!
//! Owns the output device, the ring buffer feeding it and the per-session
//! workers:
//! - **prefetch** (std thread): waveform frames from the cache, in batches
//! - **mix** (std thread): timeline events, synth render, mixing, ring append
//! - **position reporter** (tokio task): device clock -> source position
//!
//! All of them watch the shared [`StateCell`](super::StateCell). A stop
//! request moves `Playing -> Stopping` and interrupts the ring buffer; the
//! last worker to exit flushes scheduled note-offs, silences the synth and
//! completes `Stopping -> Stopped`.

use super::events::Timeline;
use super::mix_worker::MixWorker;
use super::mixer::PeakLevels;
use super::position;
use super::prefetch::Prefetcher;
use super::{Handoff, PlayRange, Waveform};
use crate::audio::{DeviceClock, OutputDevice, RingBuffer, RingBufferStats, SharedSynth, Synthesizer};
use crate::cache::CacheStats;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::scheduler::EventScheduler;
use crate::score::{BeatMap, NoteSource, StaffId};
use crate::state::{Gains, SharedState};
use cadenza_common::events::{PlaybackEvent, PlaybackState, StopReason};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Workers per session: prefetch, mix, position reporter
const SESSION_WORKERS: usize = 3;

/// How long dropping the engine waits for a session to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the session workers share
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) ring: Arc<RingBuffer>,
    pub(crate) synth: SharedSynth,
    pub(crate) scheduler: EventScheduler,
    pub(crate) waveform: Waveform,
    pub(crate) beat_map: Arc<dyn BeatMap>,
    pub(crate) notes: Arc<dyn NoteSource>,
    pub(crate) clock: DeviceClock,
    workers_alive: AtomicUsize,
}

impl EngineCore {
    pub(crate) fn is_playing(&self) -> bool {
        self.shared.playback.is_playing()
    }

    pub(crate) fn lock_synth(&self) -> MutexGuard<'_, dyn Synthesizer + 'static> {
        self.synth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn derive_timeline(&self, current: u64) -> Timeline {
        Timeline::derive(
            &self.shared.range(),
            current,
            self.beat_map.as_ref(),
            self.notes.as_ref(),
            self.config.metronome.beats_per_bar,
        )
    }

    /// Move `Playing -> Stopping`; false if the session was not playing
    pub(crate) fn request_stop(&self, reason: StopReason) -> bool {
        if !self
            .shared
            .playback
            .transition(PlaybackState::Playing, PlaybackState::Stopping)
        {
            return false;
        }
        self.shared.set_stop_reason(reason);
        info!("Playback stopping: {}", reason);
        self.shared
            .broadcast_transition(PlaybackState::Playing, PlaybackState::Stopping);
        if let StopReason::Desync(desync) = reason {
            warn!("Playback desynchronized: {}", desync);
            self.shared.broadcast_event(PlaybackEvent::Desync {
                reason: desync,
                session_id: self.shared.session_id(),
                timestamp: chrono::Utc::now(),
            });
        }
        self.ring.interrupt();
        true
    }

    /// Called by each worker on exit; the last one finishes the stop
    pub(crate) fn worker_exited(&self, name: &str) {
        let remaining = self.workers_alive.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!("{} worker exited ({} still running)", name, remaining);
        if remaining == 0 {
            self.finish_session();
        }
    }

    fn finish_session(&self) {
        // A worker that exits on its own (channel closed) still stops the session
        self.request_stop(StopReason::Requested);

        if let Err(e) = self.scheduler.flush() {
            debug!("Scheduled events not flushed: {}", e);
        }
        self.lock_synth().all_notes_off();
        self.ring.interrupt();
        self.ring.clear();

        let reason = self.shared.stop_reason().unwrap_or(StopReason::Requested);
        if self
            .shared
            .playback
            .transition(PlaybackState::Stopping, PlaybackState::Stopped)
        {
            info!("Playback stopped: {}", reason);
            self.shared
                .broadcast_transition(PlaybackState::Stopping, PlaybackState::Stopped);
            self.shared.broadcast_event(PlaybackEvent::Stopped {
                reason,
                session_id: self.shared.session_id(),
                timestamp: chrono::Utc::now(),
            });
        }
    }
}

/// Real-time waveform + score playback
pub struct PlaybackEngine {
    core: Arc<EngineCore>,
    device: Mutex<Box<dyn OutputDevice>>,
    runtime: Handle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("state", &self.state())
            .field("range", &self.range())
            .field("ring", &self.core.ring)
            .finish_non_exhaustive()
    }
}

impl PlaybackEngine {
    /// Create the engine and start the output device
    ///
    /// The device runs for the engine's whole lifetime and plays silence
    /// while stopped. The initial range is the whole waveform when its
    /// length is already known, otherwise empty until [`set_range`] is
    /// called.
    ///
    /// [`set_range`]: PlaybackEngine::set_range
    pub fn new(
        config: EngineConfig,
        runtime: Handle,
        mut device: Box<dyn OutputDevice>,
        waveform: Waveform,
        beat_map: Arc<dyn BeatMap>,
        notes: Arc<dyn NoteSource>,
        synth: SharedSynth,
    ) -> Result<Self> {
        config.validate()?;
        let playback = &config.playback;

        if device.channels() != playback.channels || waveform.channels() != playback.channels {
            return Err(Error::Config(format!(
                "channel mismatch: config={}, device={}, waveform={}",
                playback.channels,
                device.channels(),
                waveform.channels()
            )));
        }
        if device.sample_rate() != playback.sample_rate {
            warn!(
                "Device runs at {} Hz, configured rate is {} Hz",
                device.sample_rate(),
                playback.sample_rate
            );
        }

        let range = PlayRange::new(0, waveform.total_frames().unwrap_or(0), false);
        let shared = Arc::new(SharedState::new(
            playback.event_capacity,
            range,
            Gains {
                waveform: playback.waveform_gain,
                synth: playback.synth_gain,
            },
            config.metronome.muted,
        ));

        let ring = Arc::new(RingBuffer::new(config.ring_buffer.capacity_samples));
        ring.interrupt();
        device.start(Arc::clone(&ring))?;
        let clock = device.clock();

        info!(
            "Playback engine ready: {} Hz, {} channels, ring={} samples, window={} frames",
            device.sample_rate(),
            playback.channels,
            ring.capacity(),
            playback.window_frames
        );

        let scheduler = EventScheduler::new(&runtime);
        let core = Arc::new(EngineCore {
            config,
            shared,
            ring,
            synth,
            scheduler,
            waveform,
            beat_map,
            notes,
            clock,
            workers_alive: AtomicUsize::new(0),
        });

        Ok(Self {
            core,
            device: Mutex::new(device),
            runtime,
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Start playing from the range start
    pub fn play(&self) -> Result<Uuid> {
        let start = self.core.shared.range().start_frame;
        self.play_from(start)
    }

    /// Start playing at `frame` (the range start if `frame` is outside the range)
    ///
    /// Returns the new session id.
    pub fn play_from(&self, frame: u64) -> Result<Uuid> {
        let range = self.core.shared.range();
        if range.is_empty() {
            return Err(Error::InvalidRange {
                start: range.start_frame,
                end: range.end_frame,
            });
        }
        let start = if range.contains(frame) {
            frame
        } else {
            range.start_frame
        };

        let core = &self.core;
        if !core
            .shared
            .playback
            .transition(PlaybackState::Stopped, PlaybackState::Playing)
        {
            return Err(Error::InvalidState(format!(
                "cannot play while {}",
                core.shared.playback.get()
            )));
        }

        self.reap_threads();
        let session_id = core.shared.begin_session();
        core.ring.reset();
        let ring_frames_read = core.ring.stats().samples_read / core.waveform.channels() as u64;
        core.shared
            .tracker
            .reset(core.clock.frames(), ring_frames_read, start);
        core.workers_alive.store(SESSION_WORKERS, Ordering::Release);

        info!(
            "Playback started: session={}, frame={}, range={}..{}, looping={}",
            session_id, start, range.start_frame, range.end_frame, range.looping
        );
        core.shared
            .broadcast_transition(PlaybackState::Stopped, PlaybackState::Playing);

        let (tx, rx) = crossbeam_channel::bounded::<Handoff>(core.config.playback.handoff_batches);
        let prefetcher = Prefetcher::new(Arc::clone(core), tx, start);
        let mixer = MixWorker::new(Arc::clone(core), rx, start);

        let mut spawned = 0;
        let result = self.spawn_workers(prefetcher, mixer, &mut spawned);
        if let Err(e) = result {
            warn!("Failed to start playback workers: {}", e);
            core.request_stop(StopReason::Requested);
            for _ in spawned..SESSION_WORKERS {
                core.worker_exited("unspawned");
            }
            return Err(e);
        }

        Ok(session_id)
    }

    fn spawn_workers(&self, prefetcher: Prefetcher, mixer: MixWorker, spawned: &mut usize) -> Result<()> {
        let prefetch = thread::Builder::new()
            .name("cadenza-prefetch".to_string())
            .spawn(move || prefetcher.run())?;
        *spawned += 1;

        let mix = match thread::Builder::new()
            .name("cadenza-mix".to_string())
            .spawn(move || mixer.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                self.lock_threads().push(prefetch);
                return Err(e.into());
            }
        };
        *spawned += 1;

        self.runtime
            .spawn(position::run_reporter(Arc::clone(&self.core)));
        *spawned += 1;

        self.lock_threads().extend([prefetch, mix]);
        Ok(())
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join worker threads of finished sessions
    fn reap_threads(&self) {
        let handles: Vec<_> = self.lock_threads().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Playback worker panicked");
            }
        }
    }

    /// Request a stop; returns false if nothing was playing
    ///
    /// Returns immediately. `Stopped` follows once every worker exited; use
    /// [`wait_for_state`](Self::wait_for_state) to wait for it.
    pub fn stop(&self) -> bool {
        self.core.request_stop(StopReason::Requested)
    }

    /// Play when stopped, stop when playing
    pub fn toggle(&self) -> Result<PlaybackState> {
        match self.state() {
            PlaybackState::Stopped => {
                self.play()?;
                Ok(PlaybackState::Playing)
            }
            PlaybackState::Playing => {
                self.stop();
                Ok(PlaybackState::Stopping)
            }
            PlaybackState::Stopping => Ok(PlaybackState::Stopping),
        }
    }

    /// Replace the play range; a running session picks it up on its next batch
    pub fn set_range(&self, range: PlayRange) -> Result<()> {
        if range.is_empty() {
            return Err(Error::InvalidRange {
                start: range.start_frame,
                end: range.end_frame,
            });
        }
        debug!(
            "Play range set to {}..{} (looping={})",
            range.start_frame, range.end_frame, range.looping
        );
        self.core.shared.set_range(range);
        Ok(())
    }

    pub fn range(&self) -> PlayRange {
        self.core.shared.range()
    }

    /// Set both mix gains, clearing any automatic reduction
    pub fn set_gains(&self, waveform_gain: f32, synth_gain: f32) -> Result<()> {
        for gain in [waveform_gain, synth_gain] {
            if !gain.is_finite() || gain < 0.0 {
                return Err(Error::InvalidState(format!("invalid gain {}", gain)));
            }
        }
        self.core.shared.set_gains(Gains {
            waveform: waveform_gain,
            synth: synth_gain,
        });
        Ok(())
    }

    /// Current gains, including automatic reductions
    pub fn gains(&self) -> Gains {
        self.core.shared.gains()
    }

    pub fn set_staff_muted(&self, staff: StaffId, muted: bool) {
        if self.core.shared.set_staff_muted(staff, muted) {
            debug!("Staff {} {}", staff, if muted { "muted" } else { "unmuted" });
        }
    }

    pub fn set_metronome_muted(&self, muted: bool) {
        self.core.shared.set_metronome_muted(muted);
    }

    /// Rebuild derived events after the score changed
    pub fn notify_score_changed(&self) {
        self.core.shared.bump_timeline();
    }

    /// Source frame currently audible
    pub fn position(&self) -> u64 {
        self.core.shared.tracker.position()
    }

    /// Peak levels since the previous call
    pub fn take_peaks(&self) -> PeakLevels {
        self.core.shared.peaks.take()
    }

    pub fn state(&self) -> PlaybackState {
        self.core.shared.playback.get()
    }

    pub fn wait_for_state(&self, state: PlaybackState, timeout: Duration) -> bool {
        self.core.shared.playback.wait_for(state, timeout)
    }

    pub fn session_id(&self) -> Uuid {
        self.core.shared.session_id()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.core.shared.subscribe_events()
    }

    /// Sound a note now and release it after `duration`
    pub fn audition_note(&self, channel: u8, pitch: u8, velocity: u8, duration: Duration) -> Result<()> {
        self.core.lock_synth().note_on(channel, pitch, velocity);
        let synth = Arc::clone(&self.core.synth);
        let scheduled = self.core.scheduler.schedule_after(duration, move || {
            synth
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .note_off(channel, pitch);
        });
        if let Err(e) = scheduled {
            self.core.lock_synth().note_off(channel, pitch);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn ring_stats(&self) -> RingBufferStats {
        self.core.ring.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.waveform.cache().stats()
    }

    pub fn waveform(&self) -> &Waveform {
        &self.core.waveform
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Scheduled events not fired yet
    pub fn pending_events(&self) -> usize {
        self.core.scheduler.pending()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.core.request_stop(StopReason::Requested);
        if self.wait_for_state(PlaybackState::Stopped, SHUTDOWN_TIMEOUT) {
            self.reap_threads();
        } else {
            warn!("Playback workers did not stop within {:?}", SHUTDOWN_TIMEOUT);
        }
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();
        self.core.scheduler.shutdown();
        debug!("Playback engine dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{synth, ManualDevice, SineSynth};
    use crate::cache::{encode_samples, ChunkCache};
    use crate::config::CacheConfig;
    use crate::playback::PrefetchBatch;
    use crate::score::{Score, TempoMap};
    use tempfile::TempDir;

    fn engine(runtime: &tokio::runtime::Runtime, dir: &TempDir) -> PlaybackEngine {
        let mut config = EngineConfig::default();
        config.playback.sample_rate = 8_000;
        config.playback.channels = 1;
        config.playback.window_frames = 64;
        config.playback.prefetch_frames = 256;
        config.cache = CacheConfig {
            block_size: 1_024,
            ..CacheConfig::default()
        };

        let path = dir.path().join("wave.raw");
        std::fs::write(&path, encode_samples(&[0; 2_000])).unwrap();
        let cache = Arc::new(ChunkCache::open(&path, config.cache.clone()).unwrap());
        let tempo = Arc::new(TempoMap::new(120.0, 8_000, 0, 2_000));
        let score = Arc::new(Score::new(tempo.clone()));

        PlaybackEngine::new(
            config,
            runtime.handle().clone(),
            Box::new(ManualDevice::new(8_000, 1)),
            Waveform::new(cache, 1),
            tempo,
            score,
            synth::shared(SineSynth::new(8_000, 1)),
        )
        .unwrap()
    }

    #[test]
    fn test_initial_range_covers_waveform() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let engine = engine(&runtime, &dir);

        assert_eq!(engine.range(), PlayRange::new(0, 2_000, false));
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!(!engine.stop());
        assert!(engine.set_gains(f32::NAN, 1.0).is_err());
    }

    #[test]
    fn test_misaligned_batch_desyncs_session() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = TempDir::new().unwrap();
        let engine = engine(&runtime, &dir);
        let core = Arc::clone(&engine.core);

        // Session driven by hand: only the mix worker runs
        assert!(core
            .shared
            .playback
            .transition(PlaybackState::Stopped, PlaybackState::Playing));
        core.ring.reset();
        core.workers_alive.store(1, Ordering::Release);

        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(Handoff::Batch(PrefetchBatch {
            start_frame: 0,
            samples: vec![0; 65],
        }))
        .unwrap();
        MixWorker::new(Arc::clone(&core), rx, 0).run();

        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert_eq!(
            core.shared.stop_reason(),
            Some(StopReason::Desync(cadenza_common::events::DesyncReason::MisalignedBatch))
        );
        assert_eq!(core.ring.size(), 0);
    }
}
