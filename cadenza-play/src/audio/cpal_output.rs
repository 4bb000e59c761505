//! Audio output using cpal
//!
//! `cpal::Stream` is not `Send` on every platform, so the stream is built,
//! played and dropped on a dedicated thread; [`CpalOutput`] only keeps a
//! stop channel and the thread handle.

use crate::audio::device::{fill_from, DeviceClock, OutputDevice};
use crate::audio::ring_buffer::RingBuffer;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Hardware output device backed by cpal
pub struct CpalOutput {
    device_name: Option<String>,
    config: StreamConfig,
    sample_format: SampleFormat,
    clock: DeviceClock,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// List available audio output devices
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();
        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open an output device (None = default device)
    ///
    /// Falls back to the default device when the named one is missing.
    pub fn new(device_name: Option<String>) -> Result<Self> {
        let device = find_device(device_name.as_deref())?;
        let supported = device
            .default_output_config()
            .map_err(|e| Error::AudioOutput(format!("Failed to get default config: {}", e)))?;

        let sample_format = supported.sample_format();
        let config = supported.config();
        info!(
            "Audio config: sample_rate={}, channels={}, format={:?}",
            config.sample_rate.0, config.channels, sample_format
        );

        Ok(Self {
            device_name,
            config,
            sample_format,
            clock: DeviceClock::new(),
            stop_tx: None,
            thread: None,
        })
    }
}

fn find_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        let mut devices = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;
        if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            return Ok(device);
        }
        warn!("Requested device '{}' not found, falling back to default device", name);
    }
    host.default_output_device()
        .ok_or_else(|| Error::AudioOutput("No default output device found".to_string()))
}

fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    source: Arc<RingBuffer>,
    clock: DeviceClock,
) -> Result<cpal::Stream> {
    let channels = config.channels.max(1) as usize;
    let err_fn = |e: cpal::StreamError| error!("Audio stream error: {}", e);

    let stream = match sample_format {
        SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                fill_from(&source, data);
                clock.advance((data.len() / channels) as u64);
            },
            err_fn,
            None,
        ),
        SampleFormat::F32 => {
            let mut scratch: Vec<i16> = Vec::new();
            device.build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if scratch.len() < data.len() {
                        scratch.resize(data.len(), 0);
                    }
                    let scratch = &mut scratch[..data.len()];
                    fill_from(&source, scratch);
                    for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = *sample as f32 / 32768.0;
                    }
                    clock.advance((data.len() / channels) as u64);
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(Error::AudioOutput(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))
}

impl OutputDevice for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn start(&mut self, source: Arc<RingBuffer>) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::AudioOutput("stream already started".to_string()));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let device_name = self.device_name.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let clock = self.clock.clone();

        let handle = thread::Builder::new()
            .name("cadenza-cpal-output".to_string())
            .spawn(move || {
                let stream = find_device(device_name.as_deref()).and_then(|device| {
                    build_stream(&device, &config, sample_format, source, clock)
                });
                let stream = match stream.and_then(|s| {
                    s.play()
                        .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {}", e)))
                        .map(|_| s)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until stop() (or the sender is dropped)
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Audio stream dropped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Audio stream started successfully");
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::AudioOutput("audio thread exited during startup".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            info!("Audio stream stopped");
        }
    }

    fn clock(&self) -> DeviceClock {
        self.clock.clone()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
