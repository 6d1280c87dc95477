//! Region selection
//!
//! The cross-window protocol that obtains a capture rectangle from the
//! overlay surface.

pub mod coordinator;
pub mod messages;

pub use coordinator::{OverlayHandle, OverlaySurface, RegionSelectionCoordinator};
pub use messages::{OverlayMessage, OverlayReply};
