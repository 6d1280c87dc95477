//! Cross-surface messages
//!
//! The overlay surface and the session communicate only through these typed
//! variants, never through shared state or string-keyed events.

use crate::capture::types::{DisplayDescriptor, Region};
use serde::{Deserialize, Serialize};

/// Sent from the coordinator to the overlay surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OverlayMessage {
    /// Display metadata for per-monitor guides, sent once the surface has
    /// finished loading
    DisplayInfo { displays: Vec<DisplayDescriptor> },
}

/// Sent from the overlay surface back to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OverlayReply {
    /// The user confirmed a rectangle
    RegionSelected { region: Region },

    /// The surface closed without a confirmation (escape, window close)
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_round_trip_as_tagged_json() {
        let reply = OverlayReply::RegionSelected {
            region: Region::new(-10, 5, 100, 50),
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"type\":\"regionSelected\""));
        let back: OverlayReply = serde_json::from_str(&json).unwrap();
        match back {
            OverlayReply::RegionSelected { region } => assert_eq!(region.x, -10),
            _ => panic!("wrong variant"),
        }
    }
}
