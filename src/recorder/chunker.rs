//! Chunked capture recording
//!
//! Encodes the combined stream into a chunked intermediate container as it
//! is captured. Raw RGBA video is piped over the encoder's stdin; when mixed
//! audio is present too, it travels through a named pipe so both tracks can
//! be muxed by one process. Encoded chunks stream back over stdout and are
//! handed to the orchestrator in arrival order.
//!
//! The writer tasks accept replacement tracks mid-recording, which is how a
//! region change splices a new screen source into the same encoder without
//! restarting it. Replacement video must match the geometry the encoder was
//! started with.

use crate::capture::types::{AudioTrack, CombinedStream, FrameCell, VideoTrack};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Chunk channel depth; readers that fall this far behind stall the encoder
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// stdout read buffer, also the upper bound on one chunk's size
const CHUNK_READ_SIZE: usize = 64 * 1024;

/// Fixed video geometry for one recorder run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl VideoGeometry {
    fn of(track: &VideoTrack) -> Self {
        Self { width: track.width, height: track.height, frame_rate: track.frame_rate }
    }
}

/// Where the encoder reads its audio samples from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioInput {
    /// Audio-only recording: samples arrive on stdin
    Stdin,
    /// Video occupies stdin; audio goes through a named pipe
    Fifo(PathBuf),
}

/// Argument list for the capture-stage encoder.
///
/// The intermediate container is Matroska on stdout: it tolerates truncation,
/// so a crash mid-recording still leaves usable chunks. Speed is preferred
/// over size here; the delivery pass re-encodes properly.
pub fn capture_args(
    video: Option<VideoGeometry>,
    audio: Option<(u32, &AudioInput)>,
) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(geometry) = video {
        args.extend(
            [
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{}x{}", geometry.width, geometry.height),
                "-r",
                &geometry.frame_rate.to_string(),
                "-i",
                "pipe:0",
            ]
            .map(String::from),
        );
    }

    if let Some((sample_rate, input)) = audio {
        let source = match input {
            AudioInput::Stdin => "pipe:0".to_string(),
            AudioInput::Fifo(path) => path.to_string_lossy().to_string(),
        };
        args.extend(
            ["-f", "f32le", "-ar", &sample_rate.to_string(), "-ac", "1", "-i", &source]
                .map(String::from),
        );
    }

    if video.is_some() && audio.is_some() {
        args.extend(["-map", "0:v", "-map", "1:a"].map(String::from));
    }

    if video.is_some() {
        args.extend(
            ["-c:v", "libx264", "-preset", "ultrafast", "-crf", "23", "-pix_fmt", "yuv420p"]
                .map(String::from),
        );
    }
    if audio.is_some() {
        args.extend(["-c:a", "pcm_s16le"].map(String::from));
    }

    args.extend(["-f", "matroska", "pipe:1"].map(String::from));
    args
}

/// Pack mono f32 samples into the little-endian byte layout the encoder expects.
pub fn f32le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Consumes the combined stream and yields encoded container chunks.
#[async_trait]
pub trait ChunkRecorder: Send {
    /// Begin recording. Resolves once the encoder process is confirmed
    /// running; encoded chunks then flow on the returned channel until stop.
    async fn start(&mut self, stream: CombinedStream) -> SessionResult<mpsc::Receiver<Vec<u8>>>;

    /// Splice a replacement stream into the active recording.
    async fn swap_stream(&mut self, stream: CombinedStream) -> SessionResult<()>;

    /// Pause or resume consumption. While paused, incoming media is read and
    /// discarded so source channels never back up.
    fn set_paused(&mut self, paused: bool);

    fn is_active(&self) -> bool;

    /// Finalize the recording. Resolves once the encoder has flushed and the
    /// chunk channel has closed.
    async fn stop(&mut self) -> SessionResult<()>;
}

type VideoFeed = (VideoTrack, FrameCell);

struct ActiveRecording {
    child: tokio::process::Child,
    video_tx: Option<mpsc::Sender<VideoFeed>>,
    audio_tx: Option<mpsc::Sender<AudioTrack>>,
    /// Writer tasks first, stdout reader last
    tasks: Vec<JoinHandle<()>>,
    geometry: Option<VideoGeometry>,
    /// Keeps the named pipe alive for the duration of the recording
    _capture_dir: Option<tempfile::TempDir>,
}

/// [`ChunkRecorder`] backed by an external ffmpeg process.
pub struct FfmpegChunkRecorder {
    binary: PathBuf,
    paused: Arc<AtomicBool>,
    active: Option<ActiveRecording>,
}

impl FfmpegChunkRecorder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            paused: Arc::new(AtomicBool::new(false)),
            active: None,
        }
    }
}

impl Default for FfmpegChunkRecorder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl ChunkRecorder for FfmpegChunkRecorder {
    async fn start(&mut self, mut stream: CombinedStream) -> SessionResult<mpsc::Receiver<Vec<u8>>> {
        if self.active.is_some() {
            return Err(SessionError::Recorder("recorder already active".into()));
        }
        if stream.any_source_stopped() {
            return Err(SessionError::Recorder("stream has a stopped source".into()));
        }

        let video = stream.video.take();
        #[allow(unused_mut)]
        let mut audio = stream.audio.take();
        if !(video.is_some() || audio.is_some()) {
            return Err(SessionError::Recorder("stream carries no media".into()));
        }

        let mut capture_dir = None;
        let audio_input = match (&video, &audio) {
            (Some(_), Some(_)) => {
                #[cfg(unix)]
                {
                    let dir = tempfile::tempdir()?;
                    let path = dir.path().join("audio.pipe");
                    make_fifo(&path)?;
                    capture_dir = Some(dir);
                    Some(AudioInput::Fifo(path))
                }
                #[cfg(not(unix))]
                {
                    tracing::warn!("audio muxing needs a named pipe; recording video only");
                    audio = None;
                    None
                }
            }
            (None, Some(_)) => Some(AudioInput::Stdin),
            _ => None,
        };

        let geometry = video.as_ref().map(VideoGeometry::of);
        let args = capture_args(
            geometry,
            audio.as_ref().map(|a| (a.sample_rate, audio_input.as_ref().unwrap_or(&AudioInput::Stdin))),
        );

        tracing::info!(
            binary = %self.binary.display(),
            has_video = video.is_some(),
            has_audio = audio.is_some(),
            "starting capture encoder"
        );
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Recorder(format!("failed to spawn capture encoder: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Recorder("capture encoder has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Recorder("capture encoder has no stdout".into()))?;

        self.paused.store(false, Ordering::SeqCst);
        let mut tasks = Vec::new();
        let mut video_tx = None;
        let mut audio_tx = None;

        if let Some(track) = video {
            let (tx, rx) = mpsc::channel::<VideoFeed>(1);
            video_tx = Some(tx);
            let feed = (track, stream.preview.clone());
            let paused = self.paused.clone();
            tasks.push(tokio::spawn(video_writer(feed, rx, stdin, paused)));

            if let Some(track) = audio {
                let (tx, rx) = mpsc::channel::<AudioTrack>(1);
                audio_tx = Some(tx);
                let paused = self.paused.clone();
                let fifo = match &audio_input {
                    Some(AudioInput::Fifo(path)) => path.clone(),
                    _ => unreachable!("video+audio always uses a fifo"),
                };
                tasks.push(tokio::spawn(async move {
                    // Blocks until the encoder opens the read end
                    match tokio::fs::OpenOptions::new().write(true).open(&fifo).await {
                        Ok(file) => audio_writer(track, rx, file, paused).await,
                        Err(e) => tracing::error!(error = %e, "failed to open audio pipe"),
                    }
                }));
            }
        } else if let Some(track) = audio {
            let (tx, rx) = mpsc::channel::<AudioTrack>(1);
            audio_tx = Some(tx);
            let paused = self.paused.clone();
            tasks.push(tokio::spawn(audio_writer(track, rx, stdin, paused)));
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tasks.push(tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = vec![0u8; CHUNK_READ_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        self.active = Some(ActiveRecording {
            child,
            video_tx,
            audio_tx,
            tasks,
            geometry,
            _capture_dir: capture_dir,
        });
        Ok(chunk_rx)
    }

    async fn swap_stream(&mut self, mut stream: CombinedStream) -> SessionResult<()> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| SessionError::Recorder("no active recording to swap into".into()))?;

        if let Some(track) = stream.video.take() {
            if let Some(expected) = active.geometry {
                let got = VideoGeometry::of(&track);
                if got != expected {
                    return Err(SessionError::Recorder(format!(
                        "replacement video is {}x{}@{}, recorder expects {}x{}@{}",
                        got.width, got.height, got.frame_rate,
                        expected.width, expected.height, expected.frame_rate,
                    )));
                }
            }
            let tx = active
                .video_tx
                .as_ref()
                .ok_or_else(|| SessionError::Recorder("recording has no video track".into()))?;
            tx.send((track, stream.preview.clone()))
                .await
                .map_err(|_| SessionError::Recorder("video writer is gone".into()))?;
        }

        if let Some(track) = stream.audio.take() {
            match active.audio_tx.as_ref() {
                Some(tx) => tx
                    .send(track)
                    .await
                    .map_err(|_| SessionError::Recorder("audio writer is gone".into()))?,
                None => tracing::warn!("dropping replacement audio; recording started without audio"),
            }
        }

        tracing::info!("replacement stream spliced into active recording");
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }

    async fn stop(&mut self) -> SessionResult<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };

        // Closing the replacement channels lets the writers drain their
        // current tracks and close the encoder's inputs, which triggers
        // container finalization.
        active.video_tx = None;
        active.audio_tx = None;

        for task in active.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "recorder task panicked");
            }
        }

        let status = active
            .child
            .wait()
            .await
            .map_err(|e| SessionError::Recorder(format!("capture encoder wait failed: {e}")))?;
        if !status.success() {
            tracing::warn!(?status, "capture encoder exited abnormally");
        }
        tracing::info!("capture encoder stopped");
        Ok(())
    }
}

/// Forwards raw frames into the encoder, refreshing the preview cell, and
/// switches to replacement tracks as they arrive.
async fn video_writer<W>(
    first: VideoFeed,
    mut replacements: mpsc::Receiver<VideoFeed>,
    mut sink: W,
    paused: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut current = Some(first);
    let mut accepting = true;
    'feed: while let Some((mut track, cell)) = current.take() {
        loop {
            let frame = if accepting {
                tokio::select! {
                    next = replacements.recv() => match next {
                        Some(next) => {
                            // Flush frames already queued on the old track so
                            // the splice never drops captured media
                            while let Ok(frame) = track.rx.try_recv() {
                                *cell.lock() = Some(frame.clone());
                                if paused.load(Ordering::SeqCst) {
                                    continue;
                                }
                                if let Err(e) = sink.write_all(&frame.data).await {
                                    tracing::error!(error = %e, "video pipe write failed");
                                    break 'feed;
                                }
                            }
                            current = Some(next);
                            continue 'feed;
                        }
                        None => {
                            accepting = false;
                            continue;
                        }
                    },
                    frame = track.rx.recv() => frame,
                }
            } else {
                track.rx.recv().await
            };

            match frame {
                Some(frame) => {
                    *cell.lock() = Some(frame.clone());
                    if paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = sink.write_all(&frame.data).await {
                        tracing::error!(error = %e, "video pipe write failed");
                        break 'feed;
                    }
                }
                None if accepting => {
                    // Track ended before stop; wait for the splice
                    match replacements.recv().await {
                        Some(next) => {
                            current = Some(next);
                            continue 'feed;
                        }
                        None => break 'feed,
                    }
                }
                None => break 'feed,
            }
        }
    }
    let _ = sink.shutdown().await;
}

/// Forwards mixed samples into the encoder as packed little-endian floats.
async fn audio_writer<W>(
    first: AudioTrack,
    mut replacements: mpsc::Receiver<AudioTrack>,
    mut sink: W,
    paused: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut current = Some(first);
    let mut accepting = true;
    'feed: while let Some(mut track) = current.take() {
        loop {
            let samples = if accepting {
                tokio::select! {
                    next = replacements.recv() => match next {
                        Some(next) => {
                            // Flush buffers already queued on the old track
                            while let Ok(samples) = track.rx.try_recv() {
                                if paused.load(Ordering::SeqCst) {
                                    continue;
                                }
                                if let Err(e) = sink.write_all(&f32le_bytes(&samples)).await {
                                    tracing::error!(error = %e, "audio pipe write failed");
                                    break 'feed;
                                }
                            }
                            current = Some(next);
                            continue 'feed;
                        }
                        None => {
                            accepting = false;
                            continue;
                        }
                    },
                    samples = track.rx.recv() => samples,
                }
            } else {
                track.rx.recv().await
            };

            match samples {
                Some(samples) => {
                    if paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(e) = sink.write_all(&f32le_bytes(&samples)).await {
                        tracing::error!(error = %e, "audio pipe write failed");
                        break 'feed;
                    }
                }
                None if accepting => match replacements.recv().await {
                    Some(next) => {
                        current = Some(next);
                        continue 'feed;
                    }
                    None => break 'feed,
                },
                None => break 'feed,
            }
        }
    }
    let _ = sink.shutdown().await;
}
