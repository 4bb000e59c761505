//! Mix worker
//!
//! Consumes prefetch batches one mix window at a time. For each window it
//! fires the timeline events due before the window end (offs, then
//! metronome clicks, then ons), renders the synthesizer, mixes both
//! sources and appends the result to the output ring buffer.

use super::engine::EngineCore;
use super::events::{NoteAction, Timeline};
use super::mixer::Mixer;
use super::position::ClockMarker;
use super::{Handoff, PrefetchBatch};
use crate::audio::{RingBufferError, Synthesizer};
use crate::state::Gains;
use cadenza_common::events::{DesyncReason, PlaybackEvent, StopReason};
use cadenza_common::timing::frames_to_duration;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

pub(crate) struct MixWorker {
    core: Arc<EngineCore>,
    rx: Receiver<Handoff>,
    mixer: Mixer,
    timeline: Timeline,
    timeline_version: u64,
    gains_version: u64,
    /// Notes turned on and not yet off: id -> (channel, pitch)
    sounding: HashMap<u64, (u8, u8)>,
    /// Source frame the next contiguous batch starts at
    expected_frame: u64,
    /// Session frames appended to the ring buffer
    output_frames: u64,
    synth_buf: Vec<i16>,
    out_buf: Vec<i16>,
}

enum Flow {
    Continue,
    Stop,
}

impl MixWorker {
    pub(crate) fn new(core: Arc<EngineCore>, rx: Receiver<Handoff>, start_frame: u64) -> Self {
        let gains = core.shared.gains();
        let window_samples = core.config.playback.window_frames * core.waveform.channels() as usize;
        let timeline_version = core.shared.timeline_version();
        let gains_version = core.shared.gains_version();
        let timeline = core.derive_timeline(start_frame);
        Self {
            mixer: Mixer::new(gains.waveform, gains.synth),
            core,
            rx,
            timeline,
            timeline_version,
            gains_version,
            sounding: HashMap::new(),
            expected_frame: start_frame,
            output_frames: 0,
            synth_buf: vec![0; window_samples],
            out_buf: vec![0; window_samples],
        }
    }

    pub(crate) fn run(mut self) {
        debug!("Mix worker started at frame {}", self.expected_frame);
        let poll = self.core.config.playback.handoff_timeout();

        loop {
            if !self.core.is_playing() {
                break;
            }
            match self.rx.recv_timeout(poll) {
                Ok(Handoff::Batch(batch)) => {
                    if let Flow::Stop = self.mix_batch(batch) {
                        break;
                    }
                }
                Ok(Handoff::EndOfRange) => {
                    self.finish_range();
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Prefetch hand-off closed");
                    break;
                }
            }
        }

        // Discard whatever the prefetch worker already queued
        let discarded = self.rx.try_iter().count();
        if discarded > 0 {
            trace!("Discarded {} queued prefetch batches", discarded);
        }
        debug!(
            "Mix worker exiting after {} frames ({} gain reductions)",
            self.output_frames,
            self.mixer.reductions()
        );
        self.core.worker_exited("mix");
    }

    fn mix_batch(&mut self, batch: PrefetchBatch) -> Flow {
        let window = self.core.config.playback.window_frames;
        let channels = self.core.waveform.channels() as usize;
        let window_samples = window * channels;

        if batch.samples.is_empty() || batch.samples.len() % window_samples != 0 {
            error!(
                "Prefetch batch at frame {} has {} samples, not a multiple of the {}-sample window",
                batch.start_frame,
                batch.samples.len(),
                window_samples
            );
            self.core
                .request_stop(StopReason::Desync(DesyncReason::MisalignedBatch));
            return Flow::Stop;
        }

        let version = self.core.shared.timeline_version();
        if batch.start_frame != self.expected_frame {
            trace!(
                "Source jumped {} -> {} at output frame {}",
                self.expected_frame,
                batch.start_frame,
                self.output_frames
            );
            self.core.shared.tracker.push_marker(ClockMarker {
                output_frame: self.output_frames,
                source_frame: batch.start_frame,
            });
            self.rederive(batch.start_frame, version);
        } else if version != self.timeline_version {
            self.rederive(batch.start_frame, version);
        }

        for (index, wave) in batch.samples.chunks_exact(window_samples).enumerate() {
            let window_start = batch.start_frame + (index * window) as u64;
            self.apply_user_gains();
            self.render_window(window_start + window as u64);
            let reduced = self.mixer.mix(wave, &self.synth_buf, &mut self.out_buf);

            let (wg, sg) = self.mixer.gains();
            self.core.shared.peaks.record(wave, wg, &self.synth_buf, sg);
            if reduced {
                let stored = self.core.shared.record_reduced_gains(
                    self.gains_version,
                    Gains {
                        waveform: wg,
                        synth: sg,
                    },
                );
                if stored {
                    self.core.shared.broadcast_event(PlaybackEvent::GainReduced {
                        waveform_gain: wg,
                        synth_gain: sg,
                    });
                } else {
                    trace!("Gain reduction superseded by a user gain change");
                }
            }

            match self.core.ring.append(&self.out_buf) {
                Ok(_) => {}
                Err(RingBufferError::Interrupted) => return Flow::Stop,
                Err(e) => {
                    error!("Ring buffer rejected mix window: {}", e);
                    self.core
                        .request_stop(StopReason::Desync(DesyncReason::MisalignedBatch));
                    return Flow::Stop;
                }
            }
            self.output_frames += window as u64;
        }

        self.expected_frame = batch.start_frame + (batch.samples.len() / channels) as u64;
        Flow::Continue
    }

    /// Rebuild the event lists from `current`, releasing orphaned notes
    fn rederive(&mut self, current: u64, version: u64) {
        self.timeline = self.core.derive_timeline(current);
        self.timeline_version = version;

        let pending_offs: HashSet<u64> = self.timeline.notes.events()[self.timeline.notes.cursor()..]
            .iter()
            .filter(|e| e.action == NoteAction::Off)
            .map(|e| e.note_id)
            .collect();
        let orphans: Vec<u64> = self
            .sounding
            .keys()
            .filter(|id| !pending_offs.contains(id))
            .copied()
            .collect();
        if orphans.is_empty() {
            return;
        }

        debug!("Releasing {} notes without a pending note-off", orphans.len());
        let mut synth = self.core.lock_synth();
        for id in orphans {
            if let Some((channel, pitch)) = self.sounding.remove(&id) {
                synth.note_off(channel, pitch);
            }
        }
    }

    fn apply_user_gains(&mut self) {
        let version = self.core.shared.gains_version();
        if version != self.gains_version {
            let gains = self.core.shared.gains();
            self.mixer.set_gains(gains.waveform, gains.synth);
            self.gains_version = version;
            debug!("Mix gains set to waveform={}, synth={}", gains.waveform, gains.synth);
        }
    }

    /// Fire due events and render one window of synthesizer output
    fn render_window(&mut self, window_end: u64) {
        let core = Arc::clone(&self.core);
        let mut synth = core.lock_synth();

        self.fire_note_offs(&mut *synth, window_end);
        self.fire_clicks(&mut *synth, window_end);
        self.fire_note_ons(&mut *synth, window_end);

        synth.render_frames(&mut self.synth_buf);
    }

    fn fire_note_offs(&mut self, synth: &mut dyn Synthesizer, window_end: u64) {
        let notes = &mut self.timeline.notes;
        let due = notes.due(window_end);
        for i in due.clone() {
            let Some(event) = notes.get(i).copied() else {
                continue;
            };
            if event.action != NoteAction::Off || notes.is_fired(i) {
                continue;
            }
            if self.sounding.remove(&event.note_id).is_some() {
                synth.note_off(event.channel, event.pitch);
                notes.mark_fired(i);
                continue;
            }
            // The matching on is due in this same window: fire it first,
            // this off goes out with the next window
            let on_pending = due.clone().any(|j| {
                !notes.is_fired(j)
                    && notes
                        .get(j)
                        .is_some_and(|e| e.action == NoteAction::On && e.note_id == event.note_id)
            });
            if !on_pending {
                // Never turned on (muted staff or skipped)
                notes.mark_fired(i);
            }
        }
    }

    fn fire_clicks(&mut self, synth: &mut dyn Synthesizer, window_end: u64) {
        let metronome = &self.core.config.metronome;
        let muted = self.core.shared.is_metronome_muted();
        let beats = &mut self.timeline.beats;

        for i in beats.due(window_end) {
            let Some(tick) = beats.get(i).copied() else {
                continue;
            };
            beats.mark_fired(i);
            if muted {
                continue;
            }

            let pitch = if tick.accent {
                metronome.accent_pitch
            } else {
                metronome.pitch
            };
            synth.note_on(metronome.channel, pitch, metronome.velocity);
            trace!("Click for beat {} at frame {}", tick.beat, tick.frame);

            let channel = metronome.channel;
            let click_synth = Arc::clone(&self.core.synth);
            let scheduled = self
                .core
                .scheduler
                .schedule_after(metronome.click_duration(), move || {
                    click_synth
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .note_off(channel, pitch);
                });
            if let Err(e) = scheduled {
                warn!("Click note-off not scheduled: {}", e);
                synth.note_off(channel, pitch);
            }
        }
        beats.advance();
    }

    fn fire_note_ons(&mut self, synth: &mut dyn Synthesizer, window_end: u64) {
        let notes = &mut self.timeline.notes;
        for i in notes.due(window_end) {
            let Some(event) = notes.get(i).copied() else {
                continue;
            };
            if event.action != NoteAction::On || notes.is_fired(i) {
                continue;
            }
            notes.mark_fired(i);
            if self.core.shared.is_staff_muted(event.staff) {
                continue;
            }
            synth.note_on(event.channel, event.pitch, event.velocity);
            self.sounding.insert(event.note_id, (event.channel, event.pitch));
        }
        notes.advance();
    }

    /// Let the device play out what was mixed, then end the session
    fn finish_range(&mut self) {
        let playback = &self.core.config.playback;
        let poll = frames_to_duration(playback.window_frames as u64, playback.sample_rate)
            .max(Duration::from_millis(1));

        debug!("End of range, draining {} buffered samples", self.core.ring.size());
        while self.core.is_playing() && self.core.ring.size() > 0 {
            thread::sleep(poll);
        }
        self.core.request_stop(StopReason::EndOfRange);
    }
}
