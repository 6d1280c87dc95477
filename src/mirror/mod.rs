//! Peer mirror
//!
//! Best-effort live feed to a companion peer: periodic PNG snapshots of the
//! most recent captured frame plus the tapped mixed audio. The mirror never
//! gates recording; a transport failure is logged and the local session
//! continues untouched. Pausing mutes the audio leg without tearing the
//! channel down, so resuming is instant.

use crate::capture::types::{AudioTrack, FrameCell, RgbaFrame};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

/// Wall-clock gap between frame snapshots
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// One established connection to the peer
#[async_trait]
pub trait MirrorChannel: Send {
    async fn send_snapshot(&mut self, png: Vec<u8>) -> SessionResult<()>;
    async fn send_audio(&mut self, samples: Vec<f32>) -> SessionResult<()>;
    async fn close(&mut self) -> SessionResult<()>;
}

/// Connection factory for the peer link
#[async_trait]
pub trait MirrorTransport: Send + Sync {
    async fn connect(&self) -> SessionResult<Box<dyn MirrorChannel>>;
}

/// Encode the frame as a PNG for the snapshot leg.
pub fn encode_snapshot(frame: &RgbaFrame) -> SessionResult<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, frame.width, frame.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| SessionError::Mirror(format!("png header: {e}")))?;
        writer
            .write_image_data(&frame.data)
            .map_err(|e| SessionError::Mirror(format!("png encode: {e}")))?;
    }
    Ok(out)
}

struct MirrorRun {
    muted: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    channel: Arc<AsyncMutex<Box<dyn MirrorChannel>>>,
}

/// Drives the snapshot and audio legs while a recording is live.
pub struct PeerMirror {
    transport: Arc<dyn MirrorTransport>,
    snapshot_interval: Duration,
    run: Option<MirrorRun>,
    paused: bool,
}

impl PeerMirror {
    pub fn new(transport: Arc<dyn MirrorTransport>) -> Self {
        Self::with_interval(transport, SNAPSHOT_INTERVAL)
    }

    pub fn with_interval(transport: Arc<dyn MirrorTransport>, snapshot_interval: Duration) -> Self {
        Self { transport, snapshot_interval, run: None, paused: false }
    }

    pub fn is_active(&self) -> bool {
        self.run.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Connect and begin mirroring. `preview` is refreshed by the recorder;
    /// `audio` is the mixer tap, absent for video-only sessions.
    pub async fn start(
        &mut self,
        preview: FrameCell,
        audio: Option<AudioTrack>,
    ) -> SessionResult<()> {
        if self.run.is_some() {
            return Err(SessionError::Mirror("mirror already running".into()));
        }

        let channel = Arc::new(AsyncMutex::new(self.transport.connect().await?));
        let muted = Arc::new(AtomicBool::new(false));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        {
            let channel = channel.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            let interval = self.snapshot_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    let frame = preview.lock().clone();
                    let Some(frame) = frame else { continue };
                    match encode_snapshot(&frame) {
                        Ok(png) => {
                            if let Err(e) = channel.lock().await.send_snapshot(png).await {
                                tracing::warn!(error = %e, "mirror snapshot send failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "mirror snapshot encode failed"),
                    }
                }
            }));
        }

        if let Some(mut audio) = audio {
            let channel = channel.clone();
            let muted = muted.clone();
            let mut shutdown_rx = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    let samples = tokio::select! {
                        samples = audio.rx.recv() => samples,
                        _ = shutdown_rx.changed() => break,
                    };
                    let Some(samples) = samples else { break };
                    if muted.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = channel.lock().await.send_audio(samples).await {
                        tracing::warn!(error = %e, "mirror audio send failed");
                    }
                }
            }));
        }

        tracing::info!("peer mirror started");
        self.paused = false;
        self.run = Some(MirrorRun { muted, shutdown, tasks, channel });
        Ok(())
    }

    /// Mute or unmute the audio leg. Snapshots keep flowing either way so
    /// the peer still sees the frozen frame while paused.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        if let Some(run) = &self.run {
            run.muted.store(paused, Ordering::SeqCst);
        }
    }

    /// Tear the mirror down. Failures closing the channel are logged only.
    pub async fn stop(&mut self) {
        let Some(run) = self.run.take() else { return };
        self.paused = false;

        let _ = run.shutdown.send(true);
        for task in run.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "mirror task panicked");
            }
        }
        if let Err(e) = run.channel.lock().await.close().await {
            tracing::warn!(error = %e, "mirror channel close failed");
        }
        tracing::info!("peer mirror stopped");
    }
}
