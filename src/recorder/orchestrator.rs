//! Session orchestration
//!
//! Single owner of the recording session: acquires sources, combines them
//! into one stream, drives the chunk recorder and hands the finished capture
//! to the conversion pipeline. Commands are serialized through `&mut self`;
//! observers follow along on the broadcast event channel.
//!
//! Stream combination is idempotent until a source or the region changes.
//! Starting a recording consumes the combined stream, so the next session
//! always rebuilds it from live sources.

use super::chunker::ChunkRecorder;
use super::state::{RecordingSession, RecordingStatus, SessionEvent, SessionState};
use crate::audio::mixer::{mix, MixerInput};
use crate::capture::acquirer::DeviceStreamAcquirer;
use crate::capture::crop::spawn_cropper;
use crate::capture::types::{
    CaptureSourceKind, CombinedStream, DisplayDescriptor, FrameCell, Region, VideoTrack,
    new_frame_cell,
};
use crate::error::{SessionError, SessionResult};
use crate::mirror::PeerMirror;
use crate::region::coordinator::RegionSelectionCoordinator;
use crate::settings::{
    default_save_folder, device_key, SettingsStore, KEY_SAVE_FOLDER, KEY_SELECTED_REGION,
};
use crate::transcode::{ConversionJob, ConversionOutcome, TranscodePipeline, DELIVERY_EXTENSION};
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const DEFAULT_FRAME_RATE: u32 = 30;

type ChunkSink = (Arc<Mutex<Vec<Vec<u8>>>>, JoinHandle<()>);

pub struct CaptureOrchestrator {
    acquirer: DeviceStreamAcquirer,
    recorder: Box<dyn ChunkRecorder>,
    selection: RegionSelectionCoordinator,
    transcoder: TranscodePipeline,
    settings: Arc<dyn SettingsStore>,
    mirror: Option<PeerMirror>,
    events: broadcast::Sender<SessionEvent>,

    state: SessionState,
    frame_rate: u32,
    combined: Option<CombinedStream>,
    /// Set whenever sources or region change; cleared by combination
    dirty: bool,
    preview: FrameCell,
    /// Gate of the active crop draw loop; flipped false to release it
    draw_gate: Option<watch::Sender<bool>>,
    /// Encoder geometry pinned at recording start
    canvas: Option<(u32, u32)>,
    microphone_device_id: Option<String>,
    screen_source_id: Option<String>,
    session: Option<RecordingSession>,
    chunk_sink: Option<ChunkSink>,
}

impl CaptureOrchestrator {
    pub fn new(
        acquirer: DeviceStreamAcquirer,
        recorder: Box<dyn ChunkRecorder>,
        selection: RegionSelectionCoordinator,
        transcoder: TranscodePipeline,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            acquirer,
            recorder,
            selection,
            transcoder,
            settings,
            mirror: None,
            events,
            state: SessionState::Idle,
            frame_rate: DEFAULT_FRAME_RATE,
            combined: None,
            dirty: false,
            preview: new_frame_cell(),
            draw_gate: None,
            canvas: None,
            microphone_device_id: None,
            screen_source_id: None,
            session: None,
            chunk_sink: None,
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Attach an optional peer mirror; it starts and stops with recording.
    pub fn attach_mirror(&mut self, mirror: PeerMirror) {
        self.mirror = Some(mirror);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> RecordingStatus {
        RecordingStatus {
            is_recording: self.state.is_capturing(),
            is_paused: self.state == SessionState::Paused,
            is_streaming: self.mirror.as_ref().is_some_and(PeerMirror::is_active),
            streaming_paused: self.mirror.as_ref().is_some_and(PeerMirror::is_paused),
        }
    }

    /// Latest frame captured for the active recording, for preview surfaces.
    pub fn preview_cell(&self) -> FrameCell {
        self.preview.clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::error!(from = ?self.state, to = ?next, "unexpected state transition");
        }
        tracing::debug!(from = ?self.state, to = ?next, "session state changed");
        self.state = next;
        self.emit(SessionEvent::StateChanged { state: next });
    }

    /// Open (or replace) the microphone source and remember the device.
    pub async fn setup_microphone(&mut self, device_id: Option<&str>) -> SessionResult<()> {
        if self.state.is_capturing() || self.state == SessionState::Stopping {
            return Err(SessionError::Recorder(
                "cannot change the microphone while recording".into(),
            ));
        }
        self.set_state(SessionState::Acquiring);

        match self.acquirer.open_microphone(device_id).await {
            Ok(()) => {
                self.microphone_device_id = device_id.map(String::from);
                self.dirty = true;
                if let Some(id) = device_id {
                    if let Err(e) = self
                        .settings
                        .set(&device_key(CaptureSourceKind::Microphone), id)
                    {
                        tracing::warn!(error = %e, "failed to persist microphone choice");
                    }
                }
                Ok(())
            }
            Err(e) => {
                if !self.acquirer.has_any_source() {
                    self.set_state(SessionState::Idle);
                }
                Err(e)
            }
        }
    }

    /// Open (or replace) the screen source.
    ///
    /// While recording this becomes a segment swap: the new source is spliced
    /// into the running encoder, scaled onto the pinned canvas.
    pub async fn setup_screen_capture(
        &mut self,
        source_id: Option<&str>,
        region: Option<Region>,
    ) -> SessionResult<()> {
        if self.state.is_capturing() {
            return self.swap_screen_segment(source_id, region).await;
        }
        if self.state == SessionState::Stopping {
            return Err(SessionError::Recorder(
                "cannot change the screen source while stopping".into(),
            ));
        }
        self.set_state(SessionState::Acquiring);

        match self
            .acquirer
            .open_screen(source_id, region, self.frame_rate)
            .await
        {
            Ok(()) => {
                self.screen_source_id = source_id.map(String::from);
                self.dirty = true;
                if let Some(id) = source_id {
                    if let Err(e) = self.settings.set(&device_key(CaptureSourceKind::Screen), id) {
                        tracing::warn!(error = %e, "failed to persist screen choice");
                    }
                }
                Ok(())
            }
            Err(e) => {
                if !self.acquirer.has_any_source() {
                    self.set_state(SessionState::Idle);
                }
                Err(e)
            }
        }
    }

    /// Run a region selection round trip and apply the result.
    ///
    /// Outside a recording the screen source is reopened with the new
    /// region; during one, the new region is spliced into the encoder.
    pub async fn select_region(&mut self, displays: &[DisplayDescriptor]) -> SessionResult<Region> {
        let region = match self.selection.select_region(displays).await {
            Ok(region) => region,
            Err(e) => {
                if matches!(e, SessionError::RegionSelectionCancelled) {
                    self.emit(SessionEvent::RegionSelectionCancelled);
                }
                return Err(e);
            }
        };

        match serde_json::to_string(&region) {
            Ok(json) => {
                if let Err(e) = self.settings.set(KEY_SELECTED_REGION, &json) {
                    tracing::warn!(error = %e, "failed to persist selected region");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize selected region"),
        }
        self.emit(SessionEvent::RegionSelected { region });

        if self.state.is_capturing() {
            self.swap_screen_segment(None, Some(region)).await?;
        } else if self.acquirer.screen_is_open() {
            let source = self.screen_source_id.clone();
            self.acquirer
                .open_screen(source.as_deref(), Some(region), self.frame_rate)
                .await?;
            self.dirty = true;
        }
        Ok(region)
    }

    /// Region persisted by a previous selection, if any.
    pub fn saved_region(&self) -> Option<Region> {
        let json = self.settings.get(KEY_SELECTED_REGION)?;
        serde_json::from_str(&json).ok()
    }

    /// Build the combined stream from whatever sources are open.
    ///
    /// Idempotent while nothing changed; with zero sources it fails rather
    /// than producing an empty stream. Sources whose tracks were consumed by
    /// an earlier combination are reopened transparently.
    pub async fn combine_streams(&mut self) -> SessionResult<()> {
        if self.state.is_capturing() || self.state == SessionState::Stopping {
            return Err(SessionError::Recorder(
                "cannot rebuild the stream while recording".into(),
            ));
        }

        if !self.dirty {
            if let Some(combined) = &self.combined {
                if !combined.any_source_stopped() {
                    tracing::debug!("combined stream unchanged; reusing it");
                    return Ok(());
                }
                tracing::warn!("a combined source stopped since the last build; rebuilding");
            }
        }

        if !self.acquirer.has_any_source() {
            return Err(SessionError::NoSourcesAvailable);
        }
        self.set_state(SessionState::Acquiring);

        // Drop any stale build and release its draw loop first
        self.combined = None;
        if let Some(gate) = self.draw_gate.take() {
            let _ = gate.send(false);
        }

        if self.acquirer.microphone_is_open() && !self.acquirer.has_microphone_track() {
            let device = self.microphone_device_id.clone();
            self.acquirer.open_microphone(device.as_deref()).await?;
        }
        if self.acquirer.screen_is_open() && !self.acquirer.has_screen_video() {
            let source = self.screen_source_id.clone();
            let region = self.acquirer.screen_region();
            self.acquirer
                .open_screen(source.as_deref(), region, self.frame_rate)
                .await?;
        }

        let video = self
            .acquirer
            .take_screen_video()
            .map(|raw| self.spawn_segment_cropper(raw));

        // System-audio loopback only steps in when the screen itself gave
        // no audio; the two paths are never mixed together
        let mut screen_audio = self.acquirer.take_screen_audio();
        if video.is_some() && screen_audio.is_none() {
            if self.acquirer.open_system_audio_fallback().await? {
                screen_audio = self.acquirer.take_system_audio_track();
            }
        }

        let mut inputs = Vec::new();
        if let Some(track) = self.acquirer.take_microphone_track() {
            inputs.push(MixerInput::microphone(track));
        }
        if let Some(track) = screen_audio {
            inputs.push(MixerInput::system_audio(track));
        }
        let mixed = mix(inputs);
        let (audio, audio_tap) = match mixed {
            Some(m) => (Some(m.main), Some(m.tap)),
            None => (None, None),
        };

        let combined = CombinedStream {
            video,
            audio,
            audio_tap,
            preview: self.preview.clone(),
            handles: self.acquirer.source_handles(),
        };
        if !combined.has_media() {
            return Err(SessionError::NoSourcesAvailable);
        }

        tracing::info!(
            has_video = combined.video.is_some(),
            has_audio = combined.audio.is_some(),
            "combined stream built"
        );
        self.combined = Some(combined);
        self.dirty = false;
        self.set_state(SessionState::Ready);
        Ok(())
    }

    fn spawn_segment_cropper(&mut self, raw: VideoTrack) -> VideoTrack {
        let Some(region) = self.acquirer.screen_region().filter(|r| !r.is_empty()) else {
            return raw;
        };
        let (gate_tx, gate_rx) = watch::channel(true);
        self.draw_gate = Some(gate_tx);
        spawn_cropper(
            raw,
            region.x,
            region.y,
            region.width,
            region.height,
            region.width,
            region.height,
            gate_rx,
        )
    }

    /// Splice a fresh screen source into the running encoder. The new region
    /// is scaled onto the canvas pinned at recording start, so the encoder
    /// geometry never changes mid-recording.
    async fn swap_screen_segment(
        &mut self,
        source_id: Option<&str>,
        region: Option<Region>,
    ) -> SessionResult<()> {
        let (canvas_w, canvas_h) = self
            .canvas
            .ok_or_else(|| SessionError::Recorder("recording has no video to swap".into()))?;

        let old_gate = self.draw_gate.take();
        let source = source_id
            .map(String::from)
            .or_else(|| self.screen_source_id.clone());
        self.acquirer
            .open_screen(source.as_deref(), region, self.frame_rate)
            .await?;

        let raw = self
            .acquirer
            .take_screen_video()
            .ok_or_else(|| SessionError::Recorder("replacement screen source has no video".into()))?;
        if self.acquirer.take_screen_audio().is_some() {
            tracing::warn!("replacement screen audio joins only at the next recording");
        }

        let region = region.unwrap_or_else(|| Region::new(0, 0, raw.width, raw.height));
        let (gate_tx, gate_rx) = watch::channel(true);
        let track = spawn_cropper(
            raw,
            region.x,
            region.y,
            region.width,
            region.height,
            canvas_w,
            canvas_h,
            gate_rx,
        );

        let replacement = CombinedStream {
            video: Some(track),
            audio: None,
            audio_tap: None,
            preview: self.preview.clone(),
            handles: self.acquirer.source_handles(),
        };
        self.recorder.swap_stream(replacement).await?;

        if let Some(gate) = old_gate {
            let _ = gate.send(false);
        }
        self.draw_gate = Some(gate_tx);
        self.screen_source_id = source;
        tracing::info!(?region, "screen segment swapped mid-recording");
        Ok(())
    }

    /// Start recording the combined stream.
    ///
    /// Requires a fresh combination; fails when any constituent source has
    /// stopped since the stream was built. `Started` is emitted exactly once,
    /// after the recorder confirms it is consuming.
    pub async fn start_recording(&mut self) -> SessionResult<()> {
        if self.state.is_capturing() {
            return Err(SessionError::Recorder("recording already in progress".into()));
        }
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady);
        }
        let mut stream = self.combined.take().ok_or(SessionError::NotReady)?;

        // The stream is consumed either way; the next session rebuilds it
        self.dirty = true;

        if stream.any_source_stopped() {
            return Err(SessionError::Recorder(
                "a capture source stopped since combination; rebuild the stream".into(),
            ));
        }

        let mirror_audio = stream.audio_tap.take();
        self.canvas = stream.video.as_ref().map(|v| (v.width, v.height));

        let chunk_rx = self.recorder.start(stream).await?;

        let chunks: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = chunks.clone();
        let collector = tokio::spawn(async move {
            let mut rx = chunk_rx;
            while let Some(chunk) = rx.recv().await {
                sink.lock().push(chunk);
            }
        });
        self.chunk_sink = Some((chunks, collector));
        self.session = Some(RecordingSession::new());

        if let Some(mirror) = &mut self.mirror {
            if let Err(e) = mirror.start(self.preview.clone(), mirror_audio).await {
                tracing::warn!(error = %e, "peer mirror failed to start; recording continues");
            }
        }

        self.set_state(SessionState::Recording);
        self.emit(SessionEvent::Started);
        tracing::info!("recording started");
        Ok(())
    }

    /// Pause capture. A no-op from any state other than `Recording`.
    pub fn pause_recording(&mut self) -> SessionResult<()> {
        match self.state {
            SessionState::Recording => {
                self.recorder.set_paused(true);
                if let Some(session) = &mut self.session {
                    session.mark_paused();
                }
                if let Some(mirror) = &mut self.mirror {
                    mirror.set_paused(true);
                }
                self.set_state(SessionState::Paused);
                self.emit(SessionEvent::Paused);
                Ok(())
            }
            _ => {
                tracing::debug!(state = ?self.state, "pause ignored; not recording");
                Ok(())
            }
        }
    }

    /// Resume capture. A no-op from any state other than `Paused`.
    pub fn resume_recording(&mut self) -> SessionResult<()> {
        match self.state {
            SessionState::Paused => {
                self.recorder.set_paused(false);
                if let Some(session) = &mut self.session {
                    session.mark_resumed();
                }
                if let Some(mirror) = &mut self.mirror {
                    mirror.set_paused(false);
                }
                self.set_state(SessionState::Recording);
                self.emit(SessionEvent::Resumed);
                Ok(())
            }
            _ => {
                tracing::debug!(state = ?self.state, "resume ignored; not paused");
                Ok(())
            }
        }
    }

    /// Stop the recording, finalize the capture and convert it to the
    /// delivery format.
    ///
    /// Returns `Ok(None)` when nothing was captured; no file is produced in
    /// that case. Conversion runs to completion once started and its failure
    /// leaves the session idle; a recorder that fails to finalize puts the
    /// session in the error state until `teardown` clears it.
    pub async fn stop_recording(
        &mut self,
        output: Option<&Path>,
    ) -> SessionResult<Option<ConversionOutcome>> {
        match self.state {
            SessionState::Recording | SessionState::Paused => {}
            SessionState::Stopping => {
                tracing::debug!("stop already in progress; ignoring");
                return Ok(None);
            }
            _ => {
                tracing::warn!("stop requested with no active recording");
                return Ok(None);
            }
        }
        self.set_state(SessionState::Stopping);

        if let Some(mirror) = &mut self.mirror {
            mirror.stop().await;
        }
        if let Some(gate) = self.draw_gate.take() {
            let _ = gate.send(false);
        }
        self.acquirer.stop_all();
        let recorder_stopped = self.recorder.stop().await;

        let chunks = match self.chunk_sink.take() {
            Some((chunks, collector)) => {
                if let Err(e) = collector.await {
                    tracing::warn!(error = %e, "chunk collector panicked");
                }
                std::mem::take(&mut *chunks.lock())
            }
            None => Vec::new(),
        };

        let mut session = self.session.take().unwrap_or_default();
        session.mark_resumed();
        session.chunks = chunks;
        self.canvas = None;

        if let Err(e) = recorder_stopped {
            // The capture cannot be trusted; teardown() recovers to idle
            self.set_state(SessionState::Error);
            self.emit(SessionEvent::Failed {
                code: e.code().to_string(),
                message: e.to_string(),
            });
            return Err(e);
        }

        let wall = (Utc::now() - session.started_at)
            .to_std()
            .unwrap_or_default();
        tracing::info!(
            chunks = session.chunks.len(),
            bytes = session.total_bytes(),
            wall_secs = wall.as_secs(),
            paused_secs = session.paused_accumulated.as_secs(),
            "recording stopped"
        );

        let result = self.save(session, output).await;
        self.set_state(SessionState::Idle);
        match &result {
            Ok(Some(outcome)) => {
                self.emit(SessionEvent::Saved { path: outcome.output_path.clone() });
            }
            Ok(None) => {}
            Err(e) => self.emit(SessionEvent::Failed {
                code: e.code().to_string(),
                message: e.to_string(),
            }),
        }
        result
    }

    async fn save(
        &self,
        session: RecordingSession,
        output: Option<&Path>,
    ) -> SessionResult<Option<ConversionOutcome>> {
        if session.chunks.is_empty() {
            tracing::warn!("no media captured; nothing to save");
            return Ok(None);
        }

        let temp = std::env::temp_dir().join(format!("capture-{}.mkv", Uuid::new_v4()));
        tokio::fs::write(&temp, session.chunks.concat()).await?;

        let output_path = match output {
            Some(path) => path.to_path_buf(),
            None => self.default_output_path(),
        };
        let outcome = self
            .transcoder
            .convert(ConversionJob::new(temp, &output_path))
            .await?;
        tracing::info!(path = %outcome.output_path.display(), attempt = ?outcome.attempt, "recording saved");
        Ok(Some(outcome))
    }

    fn default_output_path(&self) -> PathBuf {
        let folder = self
            .settings
            .get(KEY_SAVE_FOLDER)
            .map(PathBuf::from)
            .unwrap_or_else(default_save_folder);
        folder.join(format!(
            "recording-{}.{}",
            Utc::now().format("%Y%m%d-%H%M%S"),
            DELIVERY_EXTENSION
        ))
    }

    /// Abort everything without saving: stop sources, the recorder and the
    /// mirror, discard captured chunks and return to idle.
    pub async fn teardown(&mut self) {
        if self.state.is_capturing() {
            self.set_state(SessionState::Stopping);
        }
        if let Some(mirror) = &mut self.mirror {
            mirror.stop().await;
        }
        if let Some(gate) = self.draw_gate.take() {
            let _ = gate.send(false);
        }
        self.acquirer.stop_all();
        if self.recorder.is_active() {
            if let Err(e) = self.recorder.stop().await {
                tracing::warn!(error = %e, "recorder stop failed during teardown");
            }
        }
        if let Some((_, collector)) = self.chunk_sink.take() {
            let _ = collector.await;
        }
        self.session = None;
        self.combined = None;
        self.canvas = None;
        self.dirty = true;
        self.set_state(SessionState::Idle);
        tracing::info!("session torn down");
    }
}
