//! Region selection coordination
//!
//! Obtains one region spanning an arbitrary set of attached displays by
//! driving a borderless, always-on-top overlay surface sized to the bounding
//! box of every display. Only one selection may be in flight at a time; the
//! guard is an explicit none/pending state, cleared on every exit path.

use super::messages::{OverlayMessage, OverlayReply};
use crate::capture::types::{DisplayDescriptor, Region};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel pair connecting the coordinator to one open overlay surface.
///
/// Dropping the handle closes the surface.
pub struct OverlayHandle {
    pub messages: mpsc::Sender<OverlayMessage>,
    pub replies: mpsc::Receiver<OverlayReply>,
}

/// The secondary UI surface used to draw a region.
#[async_trait]
pub trait OverlaySurface: Send + Sync {
    /// Open the surface covering `bounds`. Resolves once the surface has
    /// finished loading and is ready for messages.
    async fn open(&self, bounds: Region) -> SessionResult<OverlayHandle>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionFlight {
    None,
    Pending(Uuid),
}

/// Drives the overlay surface and relays the selected region back.
pub struct RegionSelectionCoordinator {
    surface: Box<dyn OverlaySurface>,
    flight: Mutex<SelectionFlight>,
    last_region: Mutex<Option<Region>>,
}

/// Clears the pending flight when a selection attempt ends, however it ends.
struct FlightGuard<'a> {
    flight: &'a Mutex<SelectionFlight>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.flight.lock() = SelectionFlight::None;
    }
}

impl RegionSelectionCoordinator {
    pub fn new(surface: Box<dyn OverlaySurface>) -> Self {
        Self {
            surface,
            flight: Mutex::new(SelectionFlight::None),
            last_region: Mutex::new(None),
        }
    }

    /// Bounding box of all attached displays in virtual-desktop coordinates.
    ///
    /// Leftmost/topmost edges may be negative; the box is the union of every
    /// display's extent.
    pub fn bounding_box(displays: &[DisplayDescriptor]) -> Option<Region> {
        let first = displays.first()?;
        let mut min_x = first.bounds.x;
        let mut min_y = first.bounds.y;
        let mut max_x = first.bounds.right();
        let mut max_y = first.bounds.bottom();

        for d in &displays[1..] {
            min_x = min_x.min(d.bounds.x);
            min_y = min_y.min(d.bounds.y);
            max_x = max_x.max(d.bounds.right());
            max_y = max_y.max(d.bounds.bottom());
        }

        Some(Region::new(
            min_x,
            min_y,
            (max_x - min_x) as u32,
            (max_y - min_y) as u32,
        ))
    }

    /// Run one selection round trip.
    ///
    /// Fails with [`SessionError::RegionSelectionInProgress`] while another
    /// request is pending and with [`SessionError::RegionSelectionCancelled`]
    /// when the surface closes without a confirmation, so the caller can
    /// abort setup instead of proceeding with a stale region.
    pub async fn select_region(
        &self,
        displays: &[DisplayDescriptor],
    ) -> SessionResult<Region> {
        let request_id = {
            let mut flight = self.flight.lock();
            if matches!(*flight, SelectionFlight::Pending(_)) {
                return Err(SessionError::RegionSelectionInProgress);
            }
            let id = Uuid::new_v4();
            *flight = SelectionFlight::Pending(id);
            id
        };
        let _guard = FlightGuard { flight: &self.flight };

        let bounds = Self::bounding_box(displays)
            .ok_or_else(|| SessionError::Overlay("no displays attached".into()))?;

        tracing::info!(%request_id, ?bounds, "opening region selection overlay");
        let mut handle = self.surface.open(bounds).await?;

        handle
            .messages
            .send(OverlayMessage::DisplayInfo { displays: displays.to_vec() })
            .await
            .map_err(|_| SessionError::Overlay("overlay closed before display info".into()))?;

        match handle.replies.recv().await {
            Some(OverlayReply::RegionSelected { region }) => {
                tracing::info!(%request_id, ?region, "region selected");
                *self.last_region.lock() = Some(region);
                Ok(region)
            }
            Some(OverlayReply::Cancelled) | None => {
                tracing::info!(%request_id, "region selection cancelled");
                Err(SessionError::RegionSelectionCancelled)
            }
        }
    }

    /// Last confirmed region, if any selection has completed.
    pub fn last_region(&self) -> Option<Region> {
        *self.last_region.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    fn display(id: u32, x: i32, y: i32, w: u32, h: u32, primary: bool) -> DisplayDescriptor {
        DisplayDescriptor {
            id,
            bounds: Region::new(x, y, w, h),
            work_area: Region::new(x, y, w, h),
            scale_factor: 1.0,
            is_primary: primary,
        }
    }

    /// Overlay stub that hands scripted replies back and records the bounds
    /// it was opened with.
    struct ScriptedOverlay {
        reply: AsyncMutex<Option<OverlayReply>>,
        opened_bounds: Arc<Mutex<Vec<Region>>>,
    }

    impl ScriptedOverlay {
        fn new(reply: Option<OverlayReply>) -> Self {
            Self {
                reply: AsyncMutex::new(reply),
                opened_bounds: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl OverlaySurface for ScriptedOverlay {
        async fn open(&self, bounds: Region) -> SessionResult<OverlayHandle> {
            self.opened_bounds.lock().push(bounds);
            let (msg_tx, mut msg_rx) = mpsc::channel(4);
            let (reply_tx, reply_rx) = mpsc::channel(4);
            let reply = self.reply.lock().await.take();
            tokio::spawn(async move {
                // The surface only replies after it has received its
                // display metadata, mirroring the load/inform ordering.
                if msg_rx.recv().await.is_some() {
                    if let Some(reply) = reply {
                        let _ = reply_tx.send(reply).await;
                    }
                }
            });
            Ok(OverlayHandle { messages: msg_tx, replies: reply_rx })
        }
    }

    #[test]
    fn bounding_box_spans_negative_origin_displays() {
        let displays = vec![
            display(1, -1920, 0, 1920, 1080, false),
            display(2, 0, 0, 2560, 1440, true),
        ];
        let bounds = RegionSelectionCoordinator::bounding_box(&displays).unwrap();
        assert_eq!(bounds, Region::new(-1920, 0, 4480, 1440));
    }

    #[test]
    fn bounding_box_of_nothing_is_none() {
        assert!(RegionSelectionCoordinator::bounding_box(&[]).is_none());
    }

    #[tokio::test]
    async fn confirmation_stores_and_returns_region() {
        let wanted = Region::new(10, 20, 300, 200);
        let overlay = ScriptedOverlay::new(Some(OverlayReply::RegionSelected { region: wanted }));
        let opened = overlay.opened_bounds.clone();
        let coordinator = RegionSelectionCoordinator::new(Box::new(overlay));

        let displays = vec![display(1, 0, 0, 1920, 1080, true)];
        let got = coordinator.select_region(&displays).await.unwrap();
        assert_eq!(got, wanted);
        assert_eq!(coordinator.last_region(), Some(wanted));
        assert_eq!(opened.lock()[0], Region::new(0, 0, 1920, 1080));
    }

    #[tokio::test]
    async fn cancellation_is_surfaced_and_leaves_no_region() {
        let overlay = ScriptedOverlay::new(Some(OverlayReply::Cancelled));
        let coordinator = RegionSelectionCoordinator::new(Box::new(overlay));

        let displays = vec![display(1, 0, 0, 1920, 1080, true)];
        let err = coordinator.select_region(&displays).await.unwrap_err();
        assert!(matches!(err, SessionError::RegionSelectionCancelled));
        assert_eq!(coordinator.last_region(), None);
    }

    #[tokio::test]
    async fn overlay_closing_without_reply_counts_as_cancellation() {
        // No scripted reply: the reply channel just closes
        let overlay = ScriptedOverlay::new(None);
        let coordinator = RegionSelectionCoordinator::new(Box::new(overlay));

        let displays = vec![display(1, 0, 0, 800, 600, true)];
        let err = coordinator.select_region(&displays).await.unwrap_err();
        assert!(matches!(err, SessionError::RegionSelectionCancelled));
    }

    #[tokio::test]
    async fn selection_is_single_flight() {
        /// Overlay that never replies until released
        struct HangingOverlay {
            release: AsyncMutex<Option<tokio::sync::oneshot::Receiver<()>>>,
        }

        #[async_trait]
        impl OverlaySurface for HangingOverlay {
            async fn open(&self, _bounds: Region) -> SessionResult<OverlayHandle> {
                let (msg_tx, msg_rx) = mpsc::channel(4);
                let (reply_tx, reply_rx) = mpsc::channel(4);
                let release = self.release.lock().await.take();
                tokio::spawn(async move {
                    // Keep the message channel open while the user "draws"
                    let _msg_rx = msg_rx;
                    if let Some(release) = release {
                        let _ = release.await;
                    }
                    let _ = reply_tx.send(OverlayReply::Cancelled).await;
                });
                Ok(OverlayHandle { messages: msg_tx, replies: reply_rx })
            }
        }

        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let coordinator = Arc::new(RegionSelectionCoordinator::new(Box::new(HangingOverlay {
            release: AsyncMutex::new(Some(release_rx)),
        })));

        let displays = vec![display(1, 0, 0, 800, 600, true)];
        let first = {
            let coordinator = coordinator.clone();
            let displays = displays.clone();
            tokio::spawn(async move { coordinator.select_region(&displays).await })
        };
        tokio::task::yield_now().await;

        let second = coordinator.select_region(&displays).await.unwrap_err();
        assert!(matches!(second, SessionError::RegionSelectionInProgress));

        release_tx.send(()).unwrap();
        let first = first.await.unwrap();
        assert!(matches!(first, Err(SessionError::RegionSelectionCancelled)));

        // Guard cleared: a new request may start
        let err = coordinator.select_region(&[]).await.unwrap_err();
        assert!(matches!(err, SessionError::Overlay(_)));
    }
}
