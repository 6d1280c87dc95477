//! Region cropping
//!
//! Re-renders the selected sub-rectangle of a raw screen track onto a
//! fixed-size output surface and exposes that surface as a new track. The
//! session canvas size is pinned when the first segment starts, so a
//! mid-recording region change scales the new rectangle onto the same
//! canvas and the encoder keeps a single geometry. The draw loop exits the
//! instant the session leaves Recording/Paused.

use super::types::{RgbaFrame, VideoTrack};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const FRAME_CHANNEL_CAPACITY: usize = 8;

/// Crop `region` (coordinates relative to the incoming frame) out of `frame`
/// and resample it to `out_w` x `out_h` with nearest-neighbor sampling.
///
/// The rectangle is clamped to the frame bounds; areas outside the frame
/// come out black.
pub fn crop_to_canvas(
    frame: &RgbaFrame,
    rx: i32,
    ry: i32,
    rw: u32,
    rh: u32,
    out_w: u32,
    out_h: u32,
) -> RgbaFrame {
    let mut out = vec![0u8; (out_w * out_h * 4) as usize];

    if rw > 0 && rh > 0 {
        for oy in 0..out_h {
            // Source row for this output row
            let sy = ry + (oy as u64 * rh as u64 / out_h as u64) as i32;
            if sy < 0 || sy >= frame.height as i32 {
                continue;
            }
            for ox in 0..out_w {
                let sx = rx + (ox as u64 * rw as u64 / out_w as u64) as i32;
                if sx < 0 || sx >= frame.width as i32 {
                    continue;
                }
                let src = ((sy as u32 * frame.width + sx as u32) * 4) as usize;
                let dst = ((oy * out_w + ox) * 4) as usize;
                out[dst..dst + 4].copy_from_slice(&frame.data[src..src + 4]);
            }
        }
    }

    RgbaFrame::new(out_w, out_h, out)
}

/// Spawn the draw loop for a cropped track.
///
/// `draw_gate` starts true and is flipped to false by the orchestrator when
/// the session leaves Recording/Paused; the loop exits on that transition or
/// when the source track ends.
pub fn spawn_cropper(
    mut source: VideoTrack,
    region_x: i32,
    region_y: i32,
    region_w: u32,
    region_h: u32,
    canvas_w: u32,
    canvas_h: u32,
    mut draw_gate: watch::Receiver<bool>,
) -> VideoTrack {
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let frame_rate = source.frame_rate;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = draw_gate.changed() => {
                    if changed.is_err() || !*draw_gate.borrow() {
                        tracing::debug!("crop draw loop released");
                        break;
                    }
                }
                frame = source.rx.recv() => {
                    let Some(frame) = frame else { break };
                    let cropped = crop_to_canvas(
                        &frame, region_x, region_y, region_w, region_h, canvas_w, canvas_h,
                    );
                    if tx.send(Arc::new(cropped)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    VideoTrack {
        width: canvas_w,
        height: canvas_h,
        frame_rate,
        rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(w: u32, h: u32) -> RgbaFrame {
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[x as u8, y as u8, 0, 255]);
            }
        }
        RgbaFrame::new(w, h, data)
    }

    #[test]
    fn identity_crop_copies_pixels() {
        let frame = gradient_frame(8, 8);
        let out = crop_to_canvas(&frame, 2, 3, 4, 4, 4, 4);
        // (0,0) of the output is (2,3) of the source
        assert_eq!(&out.data[0..2], &[2, 3]);
        // (3,3) of the output is (5,6) of the source
        let last = ((3 * 4 + 3) * 4) as usize;
        assert_eq!(&out.data[last..last + 2], &[5, 6]);
    }

    #[test]
    fn out_of_bounds_rect_yields_black() {
        let frame = gradient_frame(4, 4);
        let out = crop_to_canvas(&frame, -10, -10, 4, 4, 4, 4);
        assert!(out.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn scales_region_onto_fixed_canvas() {
        let frame = gradient_frame(16, 16);
        // 8x8 region rendered onto a 4x4 canvas: every other source pixel
        let out = crop_to_canvas(&frame, 0, 0, 8, 8, 4, 4);
        assert_eq!(out.width, 4);
        assert_eq!(&out.data[0..2], &[0, 0]);
        let second = 4usize;
        assert_eq!(&out.data[second..second + 2], &[2, 0]);
    }

    #[tokio::test]
    async fn draw_loop_exits_when_gate_closes() {
        let (frame_tx, frame_rx) = mpsc::channel(4);
        let (gate_tx, gate_rx) = watch::channel(true);
        let source = VideoTrack {
            width: 8,
            height: 8,
            frame_rate: 30,
            rx: frame_rx,
        };
        let mut cropped = spawn_cropper(source, 0, 0, 4, 4, 4, 4, gate_rx);

        frame_tx.send(Arc::new(gradient_frame(8, 8))).await.unwrap();
        assert!(cropped.rx.recv().await.is_some());

        gate_tx.send(false).unwrap();
        // Loop exits; the track ends even though the source stays open
        assert!(cropped.rx.recv().await.is_none());
    }
}
