//! Capture data model
//!
//! Platform-agnostic types shared by the acquirer, the mixing graph and the
//! recorder: regions and display snapshots in virtual-desktop coordinates,
//! raw frame/sample buffers, and the live track handles that flow between
//! components over channels.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Fixed microphone sample rate for every capture session (Hz)
pub const CAPTURE_SAMPLE_RATE: u32 = 48_000;

/// A pixel rectangle in virtual-desktop coordinates
///
/// The origin may be negative when a display sits left of or above the
/// primary display. A region is immutable for a given recording segment;
/// changing it requires re-acquiring the screen source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Rightmost x coordinate (exclusive)
    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    /// Bottommost y coordinate (exclusive)
    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Read-only snapshot of one attached display
///
/// One set of these is passed to the overlay surface per selection request so
/// it can render per-monitor guides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayDescriptor {
    /// Unique display ID
    pub id: u32,

    /// Full display bounds in virtual-desktop coordinates
    pub bounds: Region,

    /// Usable area excluding taskbars/docks
    pub work_area: Region,

    /// Scale factor (e.g., 2.0 for Retina)
    pub scale_factor: f64,

    /// Whether this is the primary display
    pub is_primary: bool,
}

/// One raw RGBA frame
#[derive(Debug, Clone)]
pub struct RgbaFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA, `width * height * 4` bytes
    pub data: Vec<u8>,
}

impl RgbaFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), (width * height * 4) as usize);
        Self { width, height, data }
    }

    /// Solid-color frame, used by synthetic backends and tests
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&rgba);
        }
        Self { width, height, data }
    }
}

/// Live video track: fixed geometry plus a stream of frames
#[derive(Debug)]
pub struct VideoTrack {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub rx: mpsc::Receiver<Arc<RgbaFrame>>,
}

/// Live audio track: fixed-rate mono f32 sample buffers
#[derive(Debug)]
pub struct AudioTrack {
    pub sample_rate: u32,
    pub rx: mpsc::Receiver<Vec<f32>>,
}

/// Shared cell holding the most recent video frame
///
/// The recorder's writer refreshes it; the Peer Mirror snapshots from it
/// without joining the frame channel.
pub type FrameCell = Arc<Mutex<Option<Arc<RgbaFrame>>>>;

pub fn new_frame_cell() -> FrameCell {
    Arc::new(Mutex::new(None))
}

/// Which kind of input a capture source wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSourceKind {
    Microphone,
    Screen,
    SystemAudio,
}

/// Stop flag shared with the device thread that feeds a track
///
/// Dropping the receiving end of a track also winds the producer down, but
/// the handle lets the acquirer stop a source eagerly and lets the
/// orchestrator verify liveness before recording starts.
#[derive(Debug, Clone, Default)]
pub struct SourceHandle {
    stopped: Arc<AtomicBool>,
}

impl SourceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The single multiplexed stream submitted to the recorder
///
/// Rebuilt whenever sources or region change while not actively recording;
/// a mid-recording region change swaps in a replacement via the recorder.
#[derive(Debug)]
pub struct CombinedStream {
    /// Screen video track, cropped if a region was requested
    pub video: Option<VideoTrack>,

    /// Mixed audio output of the mixing graph
    pub audio: Option<AudioTrack>,

    /// Best-effort copy of the mixed audio for the Peer Mirror transport
    pub audio_tap: Option<AudioTrack>,

    /// Latest-frame cell refreshed while the recorder consumes video
    pub preview: FrameCell,

    /// Stop handles of every constituent source
    pub handles: Vec<SourceHandle>,
}

impl CombinedStream {
    /// True when any constituent source has been stopped
    ///
    /// The recorder must never be handed a stream in this state.
    pub fn any_source_stopped(&self) -> bool {
        self.handles.iter().any(|h| h.is_stopped())
    }

    pub fn has_media(&self) -> bool {
        self.video.is_some() || self.audio.is_some()
    }
}
