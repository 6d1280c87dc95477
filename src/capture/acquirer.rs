//! Device stream acquisition
//!
//! Owns the live capture sources for one session. Platform media layers sit
//! behind the backend traits; the acquirer adds the replace-on-reopen and
//! stop-on-teardown policies, and the audio-with-video -> video-only attempt
//! ladder for screen capture.

use super::types::{
    AudioTrack, CaptureSourceKind, Region, SourceHandle, VideoTrack, CAPTURE_SAMPLE_RATE,
};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;

/// Microphone open parameters
///
/// The processing flags are hints forwarded to the device layer; capture is
/// always fixed-rate mono.
#[derive(Debug, Clone)]
pub struct MicrophoneConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: 1,
        }
    }
}

/// Screen open parameters for one attempt
#[derive(Debug, Clone)]
pub struct ScreenCaptureConfig {
    pub frame_rate: u32,
    pub with_audio: bool,
}

/// A live microphone or loopback source
pub struct LiveAudioSource {
    pub track: AudioTrack,
    pub handle: SourceHandle,
}

/// A live screen source; `audio` is present only when the platform could
/// capture system audio alongside the video
pub struct LiveScreenSource {
    pub video: VideoTrack,
    pub audio: Option<AudioTrack>,
    pub handle: SourceHandle,
}

#[async_trait]
pub trait MicrophoneBackend: Send + Sync {
    /// Open a microphone; `None` selects the system default device.
    async fn open(
        &self,
        device_id: Option<&str>,
        config: &MicrophoneConfig,
    ) -> SessionResult<LiveAudioSource>;
}

#[async_trait]
pub trait ScreenBackend: Send + Sync {
    /// Open a screen/window source; `None` selects the primary screen.
    async fn open(
        &self,
        source_id: Option<&str>,
        config: &ScreenCaptureConfig,
    ) -> SessionResult<LiveScreenSource>;
}

/// Loopback capture of the system output, used only when the screen source
/// itself yielded no audio track
#[async_trait]
pub trait SystemAudioBackend: Send + Sync {
    async fn open(&self) -> SessionResult<LiveAudioSource>;
}

/// One acquired source with the track not yet consumed by combination
struct Acquired {
    kind: CaptureSourceKind,
    id: Option<String>,
    handle: SourceHandle,
}

/// Owns and supersedes the session's capture sources
pub struct DeviceStreamAcquirer {
    microphone_backend: Box<dyn MicrophoneBackend>,
    screen_backend: Box<dyn ScreenBackend>,
    system_audio_backend: Option<Box<dyn SystemAudioBackend>>,

    microphone: Option<Acquired>,
    microphone_track: Option<AudioTrack>,

    screen: Option<Acquired>,
    screen_video: Option<VideoTrack>,
    screen_audio: Option<AudioTrack>,
    screen_region: Option<Region>,

    system_audio: Option<Acquired>,
    system_audio_track: Option<AudioTrack>,
}

impl DeviceStreamAcquirer {
    pub fn new(
        microphone_backend: Box<dyn MicrophoneBackend>,
        screen_backend: Box<dyn ScreenBackend>,
        system_audio_backend: Option<Box<dyn SystemAudioBackend>>,
    ) -> Self {
        Self {
            microphone_backend,
            screen_backend,
            system_audio_backend,
            microphone: None,
            microphone_track: None,
            screen: None,
            screen_video: None,
            screen_audio: None,
            screen_region: None,
            system_audio: None,
            system_audio_track: None,
        }
    }

    /// Open the microphone, closing any prior microphone source first.
    pub async fn open_microphone(&mut self, device_id: Option<&str>) -> SessionResult<()> {
        self.stop_microphone();

        let config = MicrophoneConfig::default();
        let source = self.microphone_backend.open(device_id, &config).await?;

        tracing::info!(device = ?device_id, "microphone source opened");
        self.microphone = Some(Acquired {
            kind: CaptureSourceKind::Microphone,
            id: device_id.map(String::from),
            handle: source.handle,
        });
        self.microphone_track = Some(source.track);
        Ok(())
    }

    /// Open the screen source, closing any prior one first.
    ///
    /// Tries combined video+system-audio capture, then falls back to
    /// video-only; audio being unavailable never fails the call on its own.
    pub async fn open_screen(
        &mut self,
        source_id: Option<&str>,
        region: Option<Region>,
        frame_rate: u32,
    ) -> SessionResult<()> {
        self.stop_screen();

        let attempts = [
            ScreenCaptureConfig { frame_rate, with_audio: true },
            ScreenCaptureConfig { frame_rate, with_audio: false },
        ];

        let mut last_err = None;
        for config in &attempts {
            match self.screen_backend.open(source_id, config).await {
                Ok(source) => {
                    if config.with_audio && source.audio.is_none() {
                        tracing::warn!("screen source opened without an audio track");
                    } else if !config.with_audio {
                        tracing::warn!("screen capture degraded to video-only");
                    }
                    self.screen = Some(Acquired {
                        kind: CaptureSourceKind::Screen,
                        id: source_id.map(String::from),
                        handle: source.handle,
                    });
                    self.screen_video = Some(source.video);
                    self.screen_audio = source.audio;
                    self.screen_region = region;
                    tracing::info!(source = ?source_id, ?region, "screen source opened");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(with_audio = config.with_audio, error = %e, "screen capture attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            SessionError::DeviceUnavailable("no screen source available".into())
        }))
    }

    /// Open the loopback fallback. Callers gate this on the screen source
    /// having no audio track; the two paths are never mixed together.
    pub async fn open_system_audio_fallback(&mut self) -> SessionResult<bool> {
        self.stop_system_audio();

        let Some(backend) = self.system_audio_backend.as_ref() else {
            return Ok(false);
        };
        match backend.open().await {
            Ok(source) => {
                self.system_audio = Some(Acquired {
                    kind: CaptureSourceKind::SystemAudio,
                    id: None,
                    handle: source.handle,
                });
                self.system_audio_track = Some(source.track);
                tracing::info!("system audio fallback source opened");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "system audio fallback unavailable");
                Ok(false)
            }
        }
    }

    pub fn has_any_source(&self) -> bool {
        self.microphone.is_some() || self.screen.is_some()
    }

    pub fn microphone_is_open(&self) -> bool {
        self.microphone.is_some()
    }

    pub fn screen_is_open(&self) -> bool {
        self.screen.is_some()
    }

    /// False once the track was consumed by stream combination
    pub fn has_microphone_track(&self) -> bool {
        self.microphone_track.is_some()
    }

    pub fn has_screen_video(&self) -> bool {
        self.screen_video.is_some()
    }

    pub fn screen_region(&self) -> Option<Region> {
        self.screen_region
    }

    pub fn screen_has_audio(&self) -> bool {
        self.screen_audio.is_some()
    }

    /// Stop handles of every open source, for stream liveness checks
    pub fn source_handles(&self) -> Vec<SourceHandle> {
        [&self.microphone, &self.screen, &self.system_audio]
            .into_iter()
            .flatten()
            .map(|a| a.handle.clone())
            .collect()
    }

    pub fn take_microphone_track(&mut self) -> Option<AudioTrack> {
        self.microphone_track.take()
    }

    pub fn take_screen_video(&mut self) -> Option<VideoTrack> {
        self.screen_video.take()
    }

    pub fn take_screen_audio(&mut self) -> Option<AudioTrack> {
        self.screen_audio.take()
    }

    pub fn take_system_audio_track(&mut self) -> Option<AudioTrack> {
        self.system_audio_track.take()
    }

    pub fn stop_microphone(&mut self) {
        if let Some(prev) = self.microphone.take() {
            tracing::debug!(kind = ?prev.kind, id = ?prev.id, "stopping capture source");
            prev.handle.stop();
        }
        self.microphone_track = None;
    }

    pub fn stop_screen(&mut self) {
        if let Some(prev) = self.screen.take() {
            tracing::debug!(kind = ?prev.kind, id = ?prev.id, "stopping capture source");
            prev.handle.stop();
        }
        self.screen_video = None;
        self.screen_audio = None;
        self.screen_region = None;
    }

    pub fn stop_system_audio(&mut self) {
        if let Some(prev) = self.system_audio.take() {
            prev.handle.stop();
        }
        self.system_audio_track = None;
    }

    /// Session teardown: stop everything still open.
    pub fn stop_all(&mut self) {
        self.stop_microphone();
        self.stop_screen();
        self.stop_system_audio();
    }
}

impl Drop for DeviceStreamAcquirer {
    fn drop(&mut self) {
        self.stop_all();
    }
}
