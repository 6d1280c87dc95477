//! Recording session state
//!
//! One linear lifecycle per session: idle -> acquiring -> ready ->
//! recording <-> paused -> stopping -> idle, with a terminal error state
//! reachable from anywhere. Transitions are validated here so the
//! orchestrator can reject out-of-order commands instead of racing them.

use crate::capture::types::Region;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle phase of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No sources held, no recording
    Idle,
    /// Sources being opened or rebuilt
    Acquiring,
    /// Combined stream built, recording may start
    Ready,
    Recording,
    Paused,
    /// Stop requested; chunks draining and conversion pending
    Stopping,
    /// Unrecoverable failure; the session must be torn down
    Error,
}

impl SessionState {
    /// True while the recorder is consuming the stream
    pub fn is_capturing(self) -> bool {
        matches!(self, SessionState::Recording | SessionState::Paused)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            // Error is reachable from any state
            (_, Error) => true,
            (Idle, Acquiring) => true,
            (Acquiring, Ready) | (Acquiring, Idle) => true,
            // Sources may be swapped or rebuilt before recording starts
            (Ready, Acquiring) | (Ready, Recording) | (Ready, Idle) => true,
            (Recording, Paused) | (Recording, Stopping) => true,
            (Paused, Recording) | (Paused, Stopping) => true,
            (Stopping, Idle) => true,
            (Error, Idle) => true,
            _ => false,
        }
    }
}

/// Bookkeeping for one active recording
#[derive(Debug)]
pub struct RecordingSession {
    pub started_at: DateTime<Utc>,
    /// Total time spent paused, excluded from the effective duration
    pub paused_accumulated: Duration,
    pub paused_since: Option<DateTime<Utc>>,
    /// Encoded container chunks in arrival order
    pub chunks: Vec<Vec<u8>>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            paused_accumulated: Duration::ZERO,
            paused_since: None,
            chunks: Vec::new(),
        }
    }

    pub fn mark_paused(&mut self) {
        if self.paused_since.is_none() {
            self.paused_since = Some(Utc::now());
        }
    }

    pub fn mark_resumed(&mut self) {
        if let Some(since) = self.paused_since.take() {
            let paused = (Utc::now() - since).to_std().unwrap_or(Duration::ZERO);
            self.paused_accumulated += paused;
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time status snapshot reported to callers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub is_recording: bool,
    pub is_paused: bool,
    /// Whether a Peer Mirror is attached
    pub is_streaming: bool,
    pub streaming_paused: bool,
}

/// Session lifecycle notifications broadcast to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged { state: SessionState },
    /// Recording is confirmed active; emitted exactly once per recording
    Started,
    Paused,
    Resumed,
    /// Delivery file written; the session is back to idle
    Saved { path: PathBuf },
    RegionSelected { region: Region },
    /// The overlay closed without a confirmation; emitted once per attempt
    RegionSelectionCancelled,
    Failed { code: String, message: String },
}
