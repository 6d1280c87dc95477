//! Snipcast - screen-region recording sessions, made simple.
//!
//! Capture pipeline for region-scoped screen recordings with mixed
//! microphone and system audio: source acquisition, cross-window region
//! selection, chunked capture encoding, delivery-format conversion and an
//! optional best-effort peer mirror.

pub mod audio;
pub mod capture;
pub mod error;
pub mod mirror;
pub mod recorder;
pub mod region;
pub mod settings;
pub mod transcode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use error::{ErrorResponse, SessionError, SessionResult};
pub use recorder::{CaptureOrchestrator, SessionEvent, SessionState};

/// Initialize tracing/logging for embedding binaries.
///
/// Respects `RUST_LOG`; defaults to debug-level output for this crate.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snipcast=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("snipcast v{} logging initialized", env!("CARGO_PKG_VERSION"));
}
