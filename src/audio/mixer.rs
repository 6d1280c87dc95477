//! Audio mixing graph
//!
//! Merges zero or more mono f32 sources into one output track with
//! independent per-source gain. Samples are summed and clamped to [-1, 1].
//! All sources must share one sample rate; mismatched inputs are dropped at
//! build time. With zero inputs the graph produces no track at all, which is
//! valid for video-only sessions.

use crate::capture::types::{AudioTrack, CAPTURE_SAMPLE_RATE};
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Microphone gain is reduced from unity so the voice does not clip against
/// system audio.
pub const MICROPHONE_GAIN: f32 = 0.8;

/// System/screen audio passes through at unity.
pub const SYSTEM_AUDIO_GAIN: f32 = 1.0;

/// Samples per mixed output buffer (20 ms at 48 kHz)
const MIX_CHUNK: usize = 960;

const MIX_CHANNEL_CAPACITY: usize = 64;
const TAP_CHANNEL_CAPACITY: usize = 32;

/// One source feeding the graph
pub struct MixerInput {
    pub label: &'static str,
    pub gain: f32,
    pub track: AudioTrack,
}

impl MixerInput {
    pub fn microphone(track: AudioTrack) -> Self {
        Self { label: "microphone", gain: MICROPHONE_GAIN, track }
    }

    pub fn system_audio(track: AudioTrack) -> Self {
        Self { label: "system", gain: SYSTEM_AUDIO_GAIN, track }
    }
}

/// Mixed output plus a best-effort tap for the Peer Mirror
pub struct MixedAudio {
    pub main: AudioTrack,
    pub tap: AudioTrack,
}

/// Build the destination track from the supplied inputs.
///
/// Returns `None` for zero inputs. The mixing task runs until every input
/// track ends, then flushes whatever remains buffered.
pub fn mix(mut inputs: Vec<MixerInput>) -> Option<MixedAudio> {
    // Summing sample-by-sample only makes sense at one clock; inputs that
    // arrive at a different rate are rejected rather than mixed out of time
    let sample_rate = inputs
        .first()
        .map(|i| i.track.sample_rate)
        .unwrap_or(CAPTURE_SAMPLE_RATE);
    inputs.retain(|input| {
        if input.track.sample_rate == sample_rate {
            return true;
        }
        tracing::error!(
            source = input.label,
            rate = input.track.sample_rate,
            expected = sample_rate,
            "audio source rejected; sample rate does not match the graph"
        );
        false
    });

    if inputs.is_empty() {
        tracing::debug!("audio graph built with no sources; session carries no audio track");
        return None;
    }

    let (main_tx, main_rx) = mpsc::channel(MIX_CHANNEL_CAPACITY);
    let (tap_tx, tap_rx) = mpsc::channel(TAP_CHANNEL_CAPACITY);

    // Fan every input into one channel, applying gain at the edge; `None`
    // marks an input as ended so the rest keep mixing without it
    let (fanin_tx, fanin_rx) = mpsc::channel::<(usize, Option<Vec<f32>>)>(MIX_CHANNEL_CAPACITY);
    let input_count = inputs.len();
    for (index, input) in inputs.into_iter().enumerate() {
        let fanin = fanin_tx.clone();
        let gain = input.gain;
        let label = input.label;
        let mut rx = input.track.rx;
        tracing::debug!(source = label, gain, "audio graph input attached");
        tokio::spawn(async move {
            while let Some(mut buf) = rx.recv().await {
                for s in &mut buf {
                    *s *= gain;
                }
                if fanin.send((index, Some(buf))).await.is_err() {
                    return;
                }
            }
            tracing::debug!(source = label, "audio graph input ended");
            let _ = fanin.send((index, None)).await;
        });
    }
    drop(fanin_tx);

    tokio::spawn(mix_loop(fanin_rx, input_count, main_tx, tap_tx));

    Some(MixedAudio {
        main: AudioTrack { sample_rate, rx: main_rx },
        tap: AudioTrack { sample_rate, rx: tap_rx },
    })
}

async fn mix_loop(
    mut fanin_rx: mpsc::Receiver<(usize, Option<Vec<f32>>)>,
    input_count: usize,
    main_tx: mpsc::Sender<Vec<f32>>,
    tap_tx: mpsc::Sender<Vec<f32>>,
) {
    let mut buffers: Vec<VecDeque<f32>> = (0..input_count).map(|_| VecDeque::new()).collect();
    let mut ended = vec![false; input_count];

    while let Some((index, buf)) = fanin_rx.recv().await {
        match buf {
            Some(buf) => buffers[index].extend(buf),
            None => ended[index] = true,
        }

        // Ended inputs no longer gate readiness; their leftover samples keep
        // contributing until drained
        loop {
            let live_ready = buffers
                .iter()
                .zip(&ended)
                .filter(|(_, &e)| !e)
                .map(|(b, _)| b.len() >= MIX_CHUNK);
            let mut any_live = false;
            let mut all_ready = true;
            for ready in live_ready {
                any_live = true;
                all_ready &= ready;
            }
            if !(any_live && all_ready) {
                break;
            }
            let mixed = pop_mixed(&mut buffers, MIX_CHUNK);
            let _ = tap_tx.try_send(mixed.clone());
            if main_tx.send(mixed).await.is_err() {
                return;
            }
        }
    }

    // All inputs ended; flush the longest remainder
    let remaining = buffers.iter().map(|b| b.len()).max().unwrap_or(0);
    if remaining > 0 {
        let mixed = pop_mixed(&mut buffers, remaining);
        let _ = tap_tx.try_send(mixed.clone());
        let _ = main_tx.send(mixed).await;
    }
    tracing::debug!("audio graph drained");
}

/// Pop up to `len` samples from each buffer and sum them with clamping.
fn pop_mixed(buffers: &mut [VecDeque<f32>], len: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; len];
    for buffer in buffers.iter_mut() {
        for slot in out.iter_mut().take(len) {
            match buffer.pop_front() {
                Some(s) => *slot += s,
                None => break,
            }
        }
    }
    for s in &mut out {
        *s = s.clamp(-1.0, 1.0);
    }
    out
}
