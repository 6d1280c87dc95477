//! End-to-end session flows against mocked devices, recorder and encoder.

use async_trait::async_trait;
use parking_lot::Mutex;
use snipcast::capture::acquirer::{
    DeviceStreamAcquirer, LiveAudioSource, LiveScreenSource, MicrophoneBackend, MicrophoneConfig,
    ScreenBackend, ScreenCaptureConfig, SystemAudioBackend,
};
use snipcast::capture::types::{
    AudioTrack, CombinedStream, Region, RgbaFrame, SourceHandle, VideoTrack,
};
use snipcast::error::{SessionError, SessionResult};
use snipcast::recorder::chunker::ChunkRecorder;
use snipcast::recorder::{CaptureOrchestrator, SessionEvent, SessionState};
use snipcast::region::coordinator::{OverlayHandle, OverlaySurface, RegionSelectionCoordinator};
use snipcast::region::messages::{OverlayMessage, OverlayReply};
use snipcast::settings::{JsonFileSettings, SettingsStore, KEY_SAVE_FOLDER, KEY_SELECTED_REGION};
use snipcast::transcode::{EncoderOutput, EncoderRunner, TranscodePipeline};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct Counters {
    mic_opens: u32,
    screen_opens: u32,
    system_audio_opens: u32,
}

struct TestMicrophone {
    counters: Arc<Mutex<Counters>>,
}

#[async_trait]
impl MicrophoneBackend for TestMicrophone {
    async fn open(
        &self,
        _device_id: Option<&str>,
        config: &MicrophoneConfig,
    ) -> SessionResult<LiveAudioSource> {
        self.counters.lock().mic_opens += 1;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for _ in 0..3 {
                if tx.send(vec![0.2f32; 960]).await.is_err() {
                    return;
                }
            }
        });
        Ok(LiveAudioSource {
            track: AudioTrack { sample_rate: config.sample_rate, rx },
            handle: SourceHandle::new(),
        })
    }
}

struct TestScreen {
    counters: Arc<Mutex<Counters>>,
    has_audio: bool,
}

#[async_trait]
impl ScreenBackend for TestScreen {
    async fn open(
        &self,
        _source_id: Option<&str>,
        config: &ScreenCaptureConfig,
    ) -> SessionResult<LiveScreenSource> {
        self.counters.lock().screen_opens += 1;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for _ in 0..2 {
                let frame = Arc::new(RgbaFrame::filled(8, 8, [50, 60, 70, 255]));
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        });

        let audio = if self.has_audio && config.with_audio {
            let (audio_tx, audio_rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = audio_tx.send(vec![0.1f32; 960]).await;
            });
            Some(AudioTrack { sample_rate: 48_000, rx: audio_rx })
        } else {
            None
        };

        Ok(LiveScreenSource {
            video: VideoTrack { width: 8, height: 8, frame_rate: config.frame_rate, rx },
            audio,
            handle: SourceHandle::new(),
        })
    }
}

struct TestSystemAudio {
    counters: Arc<Mutex<Counters>>,
}

#[async_trait]
impl SystemAudioBackend for TestSystemAudio {
    async fn open(&self) -> SessionResult<LiveAudioSource> {
        self.counters.lock().system_audio_opens += 1;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let _ = tx.send(vec![0.05f32; 960]).await;
        });
        Ok(LiveAudioSource {
            track: AudioTrack { sample_rate: 48_000, rx },
            handle: SourceHandle::new(),
        })
    }
}

#[derive(Default)]
struct RecorderLog {
    starts: u32,
    stops: u32,
    swaps: u32,
    paused_calls: Vec<bool>,
    last_start_had_video: bool,
    last_start_had_audio: bool,
}

/// Scripted recorder: emits its chunks at start and closes the channel on stop.
struct ScriptedRecorder {
    log: Arc<Mutex<RecorderLog>>,
    chunks: Vec<Vec<u8>>,
    active: Option<mpsc::Sender<Vec<u8>>>,
    fail_stop: bool,
}

impl ScriptedRecorder {
    fn new(chunks: Vec<Vec<u8>>) -> (Self, Arc<Mutex<RecorderLog>>) {
        let log = Arc::new(Mutex::new(RecorderLog::default()));
        (Self { log: log.clone(), chunks, active: None, fail_stop: false }, log)
    }

    /// A recorder whose finalization fails, as when the encoder dies mid-run.
    fn failing_stop(chunks: Vec<Vec<u8>>) -> (Self, Arc<Mutex<RecorderLog>>) {
        let (mut recorder, log) = Self::new(chunks);
        recorder.fail_stop = true;
        (recorder, log)
    }
}

#[async_trait]
impl ChunkRecorder for ScriptedRecorder {
    async fn start(&mut self, stream: CombinedStream) -> SessionResult<mpsc::Receiver<Vec<u8>>> {
        {
            let mut log = self.log.lock();
            log.starts += 1;
            log.last_start_had_video = stream.video.is_some();
            log.last_start_had_audio = stream.audio.is_some();
        }
        let (tx, rx) = mpsc::channel(64);
        for chunk in &self.chunks {
            let _ = tx.send(chunk.clone()).await;
        }
        self.active = Some(tx);
        Ok(rx)
    }

    async fn swap_stream(&mut self, _stream: CombinedStream) -> SessionResult<()> {
        self.log.lock().swaps += 1;
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) {
        self.log.lock().paused_calls.push(paused);
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    async fn stop(&mut self) -> SessionResult<()> {
        self.active = None;
        self.log.lock().stops += 1;
        if self.fail_stop {
            return Err(SessionError::Recorder("encoder exited before finalizing".into()));
        }
        Ok(())
    }
}

/// Scripted encoder: each step picks exit status and whether the output file
/// (last argument) is written.
struct ScriptedEncoder {
    steps: Mutex<Vec<(bool, bool)>>,
    calls: Mutex<u32>,
}

impl ScriptedEncoder {
    fn new(steps: Vec<(bool, bool)>) -> Arc<Self> {
        Arc::new(Self { steps: Mutex::new(steps), calls: Mutex::new(0) })
    }
}

#[async_trait]
impl EncoderRunner for ScriptedEncoder {
    async fn run(&self, args: &[String]) -> std::io::Result<EncoderOutput> {
        *self.calls.lock() += 1;
        let (success, write_output) = {
            let mut steps = self.steps.lock();
            if steps.is_empty() { (false, false) } else { steps.remove(0) }
        };
        if write_output {
            std::fs::write(args.last().unwrap(), b"delivered")?;
        }
        Ok(EncoderOutput {
            success,
            stdout: String::new(),
            stderr: if success { String::new() } else { "scripted failure".into() },
        })
    }
}

struct SharedEncoder(Arc<ScriptedEncoder>);

#[async_trait]
impl EncoderRunner for SharedEncoder {
    async fn run(&self, args: &[String]) -> std::io::Result<EncoderOutput> {
        self.0.run(args).await
    }
}

/// Overlay surface that replies with one scripted message after receiving
/// its display metadata.
struct ScriptedOverlay {
    reply: Mutex<Option<OverlayReply>>,
}

#[async_trait]
impl OverlaySurface for ScriptedOverlay {
    async fn open(&self, _bounds: Region) -> SessionResult<OverlayHandle> {
        let (msg_tx, mut msg_rx) = mpsc::channel::<OverlayMessage>(4);
        let (reply_tx, reply_rx) = mpsc::channel(4);
        let reply = self.reply.lock().take();
        tokio::spawn(async move {
            if msg_rx.recv().await.is_some() {
                if let Some(reply) = reply {
                    let _ = reply_tx.send(reply).await;
                }
            }
        });
        Ok(OverlayHandle { messages: msg_tx, replies: reply_rx })
    }
}

struct Harness {
    orchestrator: CaptureOrchestrator,
    counters: Arc<Mutex<Counters>>,
    recorder_log: Arc<Mutex<RecorderLog>>,
    encoder: Arc<ScriptedEncoder>,
    settings: Arc<JsonFileSettings>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn dir(&self) -> &std::path::Path {
        self._dir.path()
    }
}

fn harness(
    screen_has_audio: bool,
    chunks: Vec<Vec<u8>>,
    encoder_steps: Vec<(bool, bool)>,
    overlay_reply: Option<OverlayReply>,
) -> Harness {
    let (recorder, recorder_log) = ScriptedRecorder::new(chunks);
    harness_with_recorder(screen_has_audio, recorder, recorder_log, encoder_steps, overlay_reply)
}

fn harness_with_recorder(
    screen_has_audio: bool,
    recorder: ScriptedRecorder,
    recorder_log: Arc<Mutex<RecorderLog>>,
    encoder_steps: Vec<(bool, bool)>,
    overlay_reply: Option<OverlayReply>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let counters = Arc::new(Mutex::new(Counters::default()));

    let acquirer = DeviceStreamAcquirer::new(
        Box::new(TestMicrophone { counters: counters.clone() }),
        Box::new(TestScreen { counters: counters.clone(), has_audio: screen_has_audio }),
        Some(Box::new(TestSystemAudio { counters: counters.clone() })),
    );
    let selection = RegionSelectionCoordinator::new(Box::new(ScriptedOverlay {
        reply: Mutex::new(overlay_reply),
    }));
    let encoder = ScriptedEncoder::new(encoder_steps);
    let transcoder = TranscodePipeline::new(Box::new(SharedEncoder(encoder.clone())));
    let settings = Arc::new(JsonFileSettings::open(dir.path().join("settings.json")));
    settings
        .set(KEY_SAVE_FOLDER, dir.path().to_str().unwrap())
        .unwrap();

    let orchestrator = CaptureOrchestrator::new(
        acquirer,
        Box::new(recorder),
        selection,
        transcoder,
        settings.clone(),
    );
    Harness { orchestrator, counters, recorder_log, encoder, settings, _dir: dir }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn display(w: u32, h: u32) -> snipcast::capture::types::DisplayDescriptor {
    snipcast::capture::types::DisplayDescriptor {
        id: 1,
        bounds: Region::new(0, 0, w, h),
        work_area: Region::new(0, 0, w, h),
        scale_factor: 1.0,
        is_primary: true,
    }
}

#[tokio::test]
async fn audio_session_records_and_saves() {
    let mut h = harness(false, vec![vec![1u8; 100], vec![2u8; 50]], vec![(true, true)], None);
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.setup_microphone(Some("usb-mic")).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    assert_eq!(h.orchestrator.state(), SessionState::Ready);

    h.orchestrator.start_recording().await.unwrap();
    assert_eq!(h.orchestrator.state(), SessionState::Recording);
    assert!(h.recorder_log.lock().last_start_had_audio);
    assert!(!h.recorder_log.lock().last_start_had_video);

    let output = h.dir().join("take.mp4");
    let outcome = h.orchestrator.stop_recording(Some(&output)).await.unwrap();
    let outcome = outcome.expect("captured chunks must produce a delivery file");
    assert_eq!(outcome.output_path, output);
    assert!(output.exists());
    assert_eq!(h.orchestrator.state(), SessionState::Idle);

    let events = drain_events(&mut events);
    let started = events.iter().filter(|e| matches!(e, SessionEvent::Started)).count();
    assert_eq!(started, 1);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Saved { .. })));
    assert_eq!(h.settings.get("selectedDevice.microphone").as_deref(), Some("usb-mic"));
}

#[tokio::test]
async fn zero_chunks_save_nothing() {
    let mut h = harness(false, Vec::new(), vec![(true, true)], None);

    h.orchestrator.setup_microphone(None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    h.orchestrator.start_recording().await.unwrap();

    let outcome = h.orchestrator.stop_recording(None).await.unwrap();
    assert!(outcome.is_none());
    // The encoder is never spawned for an empty capture
    assert_eq!(*h.encoder.calls.lock(), 0);
    assert_eq!(h.orchestrator.state(), SessionState::Idle);
}

#[tokio::test]
async fn start_without_combining_is_not_ready() {
    let mut h = harness(false, Vec::new(), Vec::new(), None);
    let err = h.orchestrator.start_recording().await.unwrap_err();
    assert!(matches!(err, SessionError::NotReady));
    assert_eq!(h.orchestrator.state(), SessionState::Idle);
}

#[tokio::test]
async fn combining_with_no_sources_fails() {
    let mut h = harness(false, Vec::new(), Vec::new(), None);
    let err = h.orchestrator.combine_streams().await.unwrap_err();
    assert!(matches!(err, SessionError::NoSourcesAvailable));
}

#[tokio::test]
async fn combination_is_idempotent_until_sources_change() {
    let mut h = harness(true, Vec::new(), Vec::new(), None);

    h.orchestrator.setup_screen_capture(Some("display-1"), None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    assert_eq!(h.counters.lock().screen_opens, 1);

    // Unchanged sources: the second call reuses the stream
    h.orchestrator.combine_streams().await.unwrap();
    assert_eq!(h.counters.lock().screen_opens, 1);

    // A source change marks the stream dirty; the consumed screen track is
    // reopened on rebuild
    h.orchestrator.setup_microphone(None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    assert_eq!(h.counters.lock().screen_opens, 2);
}

#[tokio::test]
async fn pause_and_resume_are_idempotent() {
    let mut h = harness(false, vec![vec![1u8; 10]], vec![(true, true)], None);

    h.orchestrator.setup_microphone(None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    h.orchestrator.start_recording().await.unwrap();

    h.orchestrator.pause_recording().unwrap();
    h.orchestrator.pause_recording().unwrap();
    assert_eq!(h.orchestrator.state(), SessionState::Paused);
    assert!(h.orchestrator.status().is_paused);
    assert_eq!(h.recorder_log.lock().paused_calls, vec![true]);

    h.orchestrator.resume_recording().unwrap();
    h.orchestrator.resume_recording().unwrap();
    assert_eq!(h.orchestrator.state(), SessionState::Recording);
    assert_eq!(h.recorder_log.lock().paused_calls, vec![true, false]);

    h.orchestrator.stop_recording(None).await.unwrap();
}

#[tokio::test]
async fn pause_outside_recording_is_a_noop() {
    let mut h = harness(false, Vec::new(), Vec::new(), None);

    h.orchestrator.pause_recording().unwrap();
    h.orchestrator.resume_recording().unwrap();
    assert_eq!(h.orchestrator.state(), SessionState::Idle);
    assert!(h.recorder_log.lock().paused_calls.is_empty());

    // Same before the recording starts: the commands land quietly
    h.orchestrator.setup_microphone(None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    h.orchestrator.pause_recording().unwrap();
    assert_eq!(h.orchestrator.state(), SessionState::Ready);
    assert!(h.recorder_log.lock().paused_calls.is_empty());
}

#[tokio::test]
async fn system_audio_fallback_is_used_only_without_screen_audio() {
    // Screen delivers its own audio: the loopback stays closed
    let mut with_audio = harness(true, Vec::new(), Vec::new(), None);
    with_audio.orchestrator.setup_screen_capture(None, None).await.unwrap();
    with_audio.orchestrator.combine_streams().await.unwrap();
    assert_eq!(with_audio.counters.lock().system_audio_opens, 0);

    // No screen audio: the loopback fallback steps in
    let mut without_audio = harness(false, Vec::new(), Vec::new(), None);
    without_audio.orchestrator.setup_screen_capture(None, None).await.unwrap();
    without_audio.orchestrator.combine_streams().await.unwrap();
    assert_eq!(without_audio.counters.lock().system_audio_opens, 1);

    without_audio.orchestrator.start_recording().await.unwrap();
    assert!(without_audio.recorder_log.lock().last_start_had_audio);
    without_audio.orchestrator.stop_recording(None).await.unwrap();
}

#[tokio::test]
async fn cancelled_selection_changes_nothing() {
    let mut h = harness(true, Vec::new(), Vec::new(), Some(OverlayReply::Cancelled));

    h.orchestrator.setup_screen_capture(None, None).await.unwrap();
    let opens_before = h.counters.lock().screen_opens;

    let err = h.orchestrator.select_region(&[display(1920, 1080)]).await.unwrap_err();
    assert!(matches!(err, SessionError::RegionSelectionCancelled));
    assert_eq!(h.counters.lock().screen_opens, opens_before);
    assert_eq!(h.settings.get(KEY_SELECTED_REGION), None);
}

#[tokio::test]
async fn cancelled_selection_is_broadcast_once() {
    let mut h = harness(true, Vec::new(), Vec::new(), Some(OverlayReply::Cancelled));
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.setup_screen_capture(None, None).await.unwrap();
    let err = h.orchestrator.select_region(&[display(1920, 1080)]).await.unwrap_err();
    assert!(matches!(err, SessionError::RegionSelectionCancelled));

    let events = drain_events(&mut events);
    let cancelled = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::RegionSelectionCancelled))
        .count();
    assert_eq!(cancelled, 1);
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::RegionSelected { .. })));
}

#[tokio::test]
async fn confirmed_selection_reopens_the_screen_source() {
    let region = Region::new(10, 10, 320, 200);
    let mut h = harness(
        true,
        Vec::new(),
        Vec::new(),
        Some(OverlayReply::RegionSelected { region }),
    );

    h.orchestrator.setup_screen_capture(None, None).await.unwrap();
    let got = h.orchestrator.select_region(&[display(1920, 1080)]).await.unwrap();
    assert_eq!(got, region);
    assert_eq!(h.counters.lock().screen_opens, 2);
    assert_eq!(h.orchestrator.saved_region(), Some(region));
}

#[tokio::test]
async fn mid_recording_selection_swaps_the_segment() {
    let region = Region::new(0, 0, 4, 4);
    let mut h = harness(
        true,
        vec![vec![7u8; 10]],
        vec![(true, true)],
        Some(OverlayReply::RegionSelected { region }),
    );

    h.orchestrator
        .setup_screen_capture(None, Some(Region::new(0, 0, 8, 8)))
        .await
        .unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    h.orchestrator.start_recording().await.unwrap();

    h.orchestrator.select_region(&[display(1920, 1080)]).await.unwrap();
    assert_eq!(h.recorder_log.lock().swaps, 1);
    assert_eq!(h.orchestrator.state(), SessionState::Recording);

    h.orchestrator.stop_recording(None).await.unwrap();
}

#[tokio::test]
async fn failed_conversion_reports_and_returns_to_idle() {
    let mut h = harness(false, vec![vec![1u8; 10]], vec![(false, false), (false, false)], None);
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.setup_microphone(None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    h.orchestrator.start_recording().await.unwrap();

    let output = h.dir().join("x.mp4");
    let err = h.orchestrator.stop_recording(Some(&output)).await.unwrap_err();
    assert!(matches!(err, SessionError::ConversionFailed(_)));
    assert_eq!(*h.encoder.calls.lock(), 2);
    assert_eq!(h.orchestrator.state(), SessionState::Idle);

    let events = drain_events(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Failed { code, .. } if code == "CONVERSION_FAILED")));
}

#[tokio::test]
async fn failed_recorder_stop_enters_the_error_state() {
    let (recorder, log) = ScriptedRecorder::failing_stop(vec![vec![1u8; 10]]);
    let mut h = harness_with_recorder(false, recorder, log, vec![(true, true)], None);
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.setup_microphone(None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    h.orchestrator.start_recording().await.unwrap();

    let err = h.orchestrator.stop_recording(None).await.unwrap_err();
    assert!(matches!(err, SessionError::Recorder(_)));
    assert_eq!(h.orchestrator.state(), SessionState::Error);
    // The capture is never handed to the conversion pipeline
    assert_eq!(*h.encoder.calls.lock(), 0);

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Failed { .. })));

    h.orchestrator.teardown().await;
    assert_eq!(h.orchestrator.state(), SessionState::Idle);
}

#[tokio::test]
async fn repeated_stops_are_noops() {
    let mut h = harness(false, vec![vec![1u8; 10]], vec![(true, true)], None);

    h.orchestrator.setup_microphone(None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    h.orchestrator.start_recording().await.unwrap();

    let output = h.dir().join("take.mp4");
    let first = h.orchestrator.stop_recording(Some(&output)).await.unwrap();
    assert!(first.is_some());

    // Stop is serialized; asking again once nothing records is a quiet no-op
    let second = h.orchestrator.stop_recording(None).await.unwrap();
    assert!(second.is_none());
    assert_eq!(*h.encoder.calls.lock(), 1);
    assert_eq!(h.orchestrator.state(), SessionState::Idle);
}

#[tokio::test]
async fn teardown_discards_the_session() {
    let mut h = harness(false, vec![vec![1u8; 10]], vec![(true, true)], None);

    h.orchestrator.setup_microphone(None).await.unwrap();
    h.orchestrator.combine_streams().await.unwrap();
    h.orchestrator.start_recording().await.unwrap();

    h.orchestrator.teardown().await;
    assert_eq!(h.orchestrator.state(), SessionState::Idle);
    assert_eq!(h.recorder_log.lock().stops, 1);
    // Nothing was converted
    assert_eq!(*h.encoder.calls.lock(), 0);
}
