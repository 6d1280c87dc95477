//! Recording session
//!
//! The state machine, the chunked capture recorder and the orchestrator
//! that ties sources, recorder and conversion together.

pub mod chunker;
pub mod orchestrator;
pub mod state;

pub use chunker::{ChunkRecorder, FfmpegChunkRecorder};
pub use orchestrator::CaptureOrchestrator;
pub use state::{RecordingSession, RecordingStatus, SessionEvent, SessionState};
