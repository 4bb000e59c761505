//! Cadenza playback demo (cadenza-play) - Main entry point
//!
//! Headless run of the whole playback core: synthesizes a waveform,
//! streams it through the chunk cache, and plays a range of it against a
//! small score with the metronome, printing playback events as they come.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use cadenza_common::config::{resolve_config_path, CONFIG_ENV_VAR};
use cadenza_common::events::{PlaybackEvent, PlaybackState};
use cadenza_common::timing::{duration_to_frames, frames_to_ms};
use cadenza_play::audio::{synth, OutputDevice, SineSynth};
use cadenza_play::cache::{ProducerError, SampleProducer};
use cadenza_play::{
    ChunkCache, EngineConfig, Note, PlayRange, PlaybackEngine, Score, TempoMap, Waveform, WaveformOverview,
};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for cadenza-play
#[derive(Parser, Debug)]
#[command(name = "cadenza-play")]
#[command(about = "Headless demo of the Cadenza playback core")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Seconds to play before stopping
    #[arg(short, long, default_value = "8")]
    duration: u64,

    /// Loop the play range instead of stopping at its end
    #[arg(short = 'l', long = "loop")]
    looping: bool,

    /// Tempo of the demo score in beats per minute
    #[arg(short, long, default_value = "120")]
    tempo: f64,

    /// Bars in the play range
    #[arg(short, long, default_value = "2")]
    bars: u32,

    /// Start with the metronome muted
    #[arg(long)]
    no_metronome: bool,

    /// Print events and the final report as JSON lines
    #[arg(long)]
    json: bool,

    /// Directory for the cache backing file
    #[arg(long, env = "CADENZA_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Output device name (with the cpal-output feature)
    #[cfg(feature = "cpal-output")]
    #[arg(long)]
    device: Option<String>,
}

/// Decoded-audio stand-in: a slowly beating two-tone pad
struct SyntheticTrack {
    sample_rate: u32,
    channels: u16,
    next_frame: u64,
    total_frames: u64,
    batch_frames: u64,
}

impl SyntheticTrack {
    fn new(sample_rate: u32, channels: u16, total_frames: u64) -> Self {
        Self {
            sample_rate,
            channels,
            next_frame: 0,
            total_frames,
            batch_frames: 4_096,
        }
    }
}

impl SampleProducer for SyntheticTrack {
    fn next_batch(&mut self) -> std::result::Result<Option<Vec<i16>>, ProducerError> {
        if self.next_frame >= self.total_frames {
            return Ok(None);
        }
        let frames = self.batch_frames.min(self.total_frames - self.next_frame);
        let rate = self.sample_rate as f32;
        let mut samples = Vec::with_capacity((frames * self.channels as u64) as usize);
        for frame in self.next_frame..self.next_frame + frames {
            let t = frame as f32 / rate;
            let v = 0.25 * (std::f32::consts::TAU * 220.0 * t).sin()
                + 0.15 * (std::f32::consts::TAU * 221.5 * t).sin();
            let sample = (v * i16::MAX as f32) as i16;
            for _ in 0..self.channels {
                samples.push(sample);
            }
        }
        self.next_frame += frames;
        Ok(Some(samples))
    }
}

/// C major arpeggio, one note per beat
fn demo_score(beat_map: Arc<TempoMap>, beats: u32) -> Result<Score> {
    let score = Score::new(beat_map);
    let melody = score.add_staff("melody", 0);
    let bass = score.add_staff("bass", 1);
    let pitches = [60u8, 64, 67, 72];
    for beat in 0..beats {
        let pitch = pitches[beat as usize % pitches.len()];
        score
            .add_note(
                melody,
                Note {
                    pitch,
                    velocity: 90,
                    start_beat: beat as f64,
                    duration_beats: 0.75,
                },
            )
            .with_context(|| format!("Failed to add melody note {} at beat {}", pitch, beat))?;
        if beat % 4 == 0 {
            score
                .add_note(
                    bass,
                    Note {
                        pitch: 36,
                        velocity: 100,
                        start_beat: beat as f64,
                        duration_beats: 3.5,
                    },
                )
                .with_context(|| format!("Failed to add bass note at beat {}", beat))?;
        }
    }
    debug!("Demo score built over {} beats", beats);
    Ok(score)
}

fn init_tracing(config: &EngineConfig) -> Result<()> {
    let level = &config.logging.level;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("cadenza_play={},cadenza_common={}", level, level).into());

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };
    let stderr_layer = file_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

#[cfg(feature = "cpal-output")]
fn open_device(args: &Args, _config: &EngineConfig) -> Result<Box<dyn OutputDevice>> {
    let device = cadenza_play::audio::CpalOutput::new(args.device.clone())
        .context("Failed to open audio output")?;
    Ok(Box::new(device))
}

#[cfg(not(feature = "cpal-output"))]
fn open_device(_args: &Args, config: &EngineConfig) -> Result<Box<dyn OutputDevice>> {
    Ok(Box::new(cadenza_play::audio::NullDevice::new(
        config.playback.sample_rate,
        config.playback.channels,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_deref(), CONFIG_ENV_VAR);
    let mut config = EngineConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config)?;

    info!(
        "Starting cadenza-play v{} (built {} [{}])",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    if let Some(path) = &config_path {
        info!("Configuration: {}", path.display());
    }

    let device = open_device(&args, &config)?;
    config.playback.sample_rate = device.sample_rate();
    config.playback.channels = device.channels();
    if args.no_metronome {
        config.metronome.muted = true;
    }
    let sample_rate = config.playback.sample_rate;
    let channels = config.playback.channels;

    // Score and waveform sized to the play range plus a bar of tail
    let beats = args.bars.max(1) * config.metronome.beats_per_bar.max(1);
    let frames_per_beat = duration_to_frames(Duration::from_secs_f64(60.0 / args.tempo.max(1.0)), sample_rate);
    let range_frames = frames_per_beat * beats as u64;
    let total_frames = range_frames + frames_per_beat * config.metronome.beats_per_bar as u64;

    let cache_dir = args.cache_dir.clone().unwrap_or_else(std::env::temp_dir);
    let cache_path = cache_dir.join(format!("cadenza-{}.raw", uuid::Uuid::new_v4()));
    let cache = Arc::new(
        ChunkCache::create(&cache_path, config.cache.clone())
            .with_context(|| format!("Failed to create cache file {}", cache_path.display()))?,
    );
    let overview = WaveformOverview::spawn(&cache, channels, config.cache.listener_capacity)
        .context("Failed to start waveform overview")?;

    let writer = {
        let cache = Arc::clone(&cache);
        tokio::task::spawn_blocking(move || {
            cache.write(&mut SyntheticTrack::new(sample_rate, channels, total_frames))
        })
    };

    let tempo = Arc::new(TempoMap::new(args.tempo, sample_rate, 0, total_frames));
    let score = Arc::new(demo_score(Arc::clone(&tempo), beats)?);
    let synth = synth::shared(SineSynth::new(sample_rate, channels));

    let engine = Arc::new(
        PlaybackEngine::new(
            config,
            tokio::runtime::Handle::current(),
            device,
            Waveform::new(Arc::clone(&cache), channels),
            tempo,
            score,
            synth,
        )
        .context("Failed to initialize playback engine")?,
    );
    engine.set_range(PlayRange::new(0, range_frames, args.looping))?;
    info!(
        "Play range: {} frames ({} ms), {} beats at {} bpm, looping={}",
        range_frames,
        frames_to_ms(range_frames, sample_rate),
        beats,
        args.tempo,
        args.looping
    );

    let mut events = engine.subscribe_events();
    let session_id = engine.play().context("Failed to start playback")?;
    debug!("Session {}", session_id);

    let json = args.json;
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration));
    tokio::pin!(deadline);
    let mut stop_requested = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let finished = matches!(event, PlaybackEvent::Stopped { .. });
                    print_event(&event, json);
                    if finished {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Event output lagged, {} events missed", missed),
                Err(RecvError::Closed) => break,
            },
            _ = &mut deadline, if !stop_requested => {
                info!("Duration elapsed, stopping");
                engine.stop();
                stop_requested = true;
            }
            _ = signal::ctrl_c(), if !stop_requested => {
                info!("Received Ctrl+C, stopping");
                engine.stop();
                stop_requested = true;
            }
        }
    }

    let stopped = {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || engine.wait_for_state(PlaybackState::Stopped, Duration::from_secs(2)))
            .await
            .context("Stop wait panicked")?
    };
    if !stopped {
        warn!("Playback did not stop cleanly");
    }

    match writer.await.context("Cache writer panicked")? {
        Ok(samples) => debug!("Cache writer finished: {} samples", samples),
        Err(e) => warn!("Cache writer failed: {}", e),
    }

    let report = serde_json::json!({
        "peaks": engine.take_peaks(),
        "cache": engine.cache_stats(),
        "ring": {
            "underruns": engine.ring_stats().underruns,
            "samples_read": engine.ring_stats().samples_read,
        },
        "overview_chunks": overview.len(),
    });
    if json {
        println!("{}", report);
    } else {
        info!("Report: {}", serde_json::to_string_pretty(&report)?);
    }

    // Engine drop joins worker threads; keep it off the async workers
    tokio::task::spawn_blocking(move || drop(engine))
        .await
        .context("Engine shutdown panicked")?;
    cache.shutdown();
    if let Err(e) = std::fs::remove_file(&cache_path) {
        debug!("Cache file not removed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

fn print_event(event: &PlaybackEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Event not serializable: {}", e),
        }
        return;
    }
    match event {
        PlaybackEvent::Position { frame, .. } => debug!("Position: frame {}", frame),
        other => info!("Event: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_play::NoteSource;

    #[test]
    fn test_demo_score_places_every_note() {
        // 120 bpm at 8 kHz: 4000 frames per beat
        let tempo = Arc::new(TempoMap::new(120.0, 8_000, 0, 4_000 * 8));
        let score = demo_score(tempo, 8).unwrap();

        let notes = score.notes_in(0..4_000 * 8);
        // One melody note per beat plus a bass note every bar
        assert_eq!(notes.len(), 10);
        assert_eq!(score.staff_count(), 2);
        assert_eq!(notes.iter().filter(|n| n.pitch == 36).count(), 2);
    }
}
