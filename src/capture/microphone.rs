//! cpal-backed microphone capture
//!
//! The cpal stream is not `Send`, so each open source gets a dedicated OS
//! thread that owns the stream, downmixes to mono and pushes f32 sample
//! buffers into the track channel until the source handle is stopped.
//! Echo cancellation / noise suppression / auto gain are requested from the
//! device layer where the host supports them.

use super::acquirer::{LiveAudioSource, MicrophoneBackend, MicrophoneConfig};
use super::types::{AudioTrack, SourceHandle};
use crate::error::{SessionError, SessionResult};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// Samples per pushed buffer (20 ms at 48 kHz)
const SAMPLES_PER_CHUNK: usize = 960;

pub struct CpalMicrophoneBackend;

#[async_trait]
impl MicrophoneBackend for CpalMicrophoneBackend {
    async fn open(
        &self,
        device_id: Option<&str>,
        config: &MicrophoneConfig,
    ) -> SessionResult<LiveAudioSource> {
        let handle = SourceHandle::new();
        let (track_tx, track_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        // Voice processing is applied by the OS media layer where available;
        // cpal itself has no knobs for it.
        tracing::debug!(
            echo_cancellation = config.echo_cancellation,
            noise_suppression = config.noise_suppression,
            auto_gain = config.auto_gain,
            "voice processing hints requested"
        );

        let device_id = device_id.map(String::from);
        let thread_handle = handle.clone();
        let requested_rate = config.sample_rate;

        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                run_capture_thread(device_id, requested_rate, thread_handle, track_tx, ready_tx);
            })
            .map_err(|e| SessionError::DeviceUnavailable(format!("capture thread: {e}")))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| SessionError::DeviceUnavailable("microphone thread exited".into()))?
            .map_err(|e| SessionError::DeviceUnavailable(format!("{e:#}")))?;

        Ok(LiveAudioSource {
            track: AudioTrack { sample_rate, rx: track_rx },
            handle,
        })
    }
}

fn run_capture_thread(
    device_id: Option<String>,
    requested_rate: u32,
    handle: SourceHandle,
    track_tx: mpsc::Sender<Vec<f32>>,
    ready_tx: oneshot::Sender<anyhow::Result<u32>>,
) {
    let stream = match open_stream(device_id.as_deref(), requested_rate, track_tx) {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Keep the stream alive until the source is superseded or torn down
    while !handle.is_stopped() {
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(stream);
    tracing::debug!("microphone capture thread stopped");
}

fn open_stream(
    device_id: Option<&str>,
    requested_rate: u32,
    track_tx: mpsc::Sender<Vec<f32>>,
) -> anyhow::Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = match device_id {
        None => host
            .default_input_device()
            .ok_or_else(|| anyhow!("no audio input device available"))?,
        Some(wanted) => host
            .input_devices()
            .context("enumerating input devices")?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| anyhow!("input device '{wanted}' not found"))?,
    };

    let device_name = device.name().unwrap_or_else(|_| "unknown".into());
    let device_config = match config_supporting_rate(&device, requested_rate) {
        Some(config) => config,
        None => {
            let fallback = device
                .default_input_config()
                .context("querying device configuration")?;
            tracing::warn!(
                "'{device_name}' does not support {requested_rate}Hz; capturing at {}Hz",
                fallback.sample_rate().0
            );
            fallback
        }
    };
    let device_rate = device_config.sample_rate().0;
    let channels = device_config.channels() as usize;

    tracing::info!("recording from '{device_name}': {device_rate}Hz, {channels} channels");

    let sample_format = device_config.sample_format();
    let stream_config: cpal::StreamConfig = device_config.into();
    let mut pending: Vec<f32> = Vec::with_capacity(SAMPLES_PER_CHUNK);

    let err_fn = |err| tracing::error!("audio stream error: {err}");

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                push_samples(data.iter().copied(), channels, &mut pending, &track_tx);
            },
            err_fn,
            None,
        )?,
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_samples(
                    data.iter().map(|&s| s as f32 / i16::MAX as f32),
                    channels,
                    &mut pending,
                    &track_tx,
                );
            },
            err_fn,
            None,
        )?,
        other => anyhow::bail!("unsupported input sample format: {other:?}"),
    };

    stream.play().context("starting input stream")?;
    Ok((stream, device_rate))
}

/// Find an input configuration that can run at the requested rate.
fn config_supporting_rate(
    device: &cpal::Device,
    rate: u32,
) -> Option<cpal::SupportedStreamConfig> {
    let configs = match device.supported_input_configs() {
        Ok(configs) => configs,
        Err(e) => {
            tracing::warn!("could not enumerate input configurations: {e}");
            return None;
        }
    };
    configs
        .filter(|c| rate_in_range(c.min_sample_rate().0, c.max_sample_rate().0, rate))
        .min_by_key(|c| c.channels())
        .map(|c| c.with_sample_rate(cpal::SampleRate(rate)))
}

fn rate_in_range(min: u32, max: u32, wanted: u32) -> bool {
    min <= wanted && wanted <= max
}

/// Downmix interleaved samples to mono and forward fixed-size buffers.
///
/// The callback runs on the realtime audio thread, so a full channel drops
/// the buffer instead of blocking.
fn push_samples(
    samples: impl Iterator<Item = f32>,
    channels: usize,
    pending: &mut Vec<f32>,
    track_tx: &mpsc::Sender<Vec<f32>>,
) {
    let mut acc = 0.0f32;
    let mut n = 0usize;
    for s in samples {
        acc += s;
        n += 1;
        if n == channels {
            pending.push(acc / channels as f32);
            acc = 0.0;
            n = 0;
            if pending.len() >= SAMPLES_PER_CHUNK {
                let chunk = std::mem::replace(pending, Vec::with_capacity(SAMPLES_PER_CHUNK));
                if track_tx.try_send(chunk).is_err() {
                    tracing::trace!("audio consumer behind; dropping buffer");
                }
            }
        }
    }
}
