//! Encode attempt ladder
//!
//! Conversion settings are an explicit ordered list of attempt specs tried
//! in sequence under one success predicate. The primary attempt targets
//! quality and player compatibility; the fallback trades quality for the
//! best odds of producing some valid output at all.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Delivery container extension
pub const DELIVERY_EXTENSION: &str = "mp4";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptKind {
    Primary,
    Fallback,
}

/// One conversion attempt's encoder settings
#[derive(Debug, Clone)]
pub struct EncodeAttempt {
    pub kind: AttemptKind,
    pub preset: &'static str,
    pub crf: u8,
    /// Pixel format forced for player compatibility
    pub pix_fmt: Option<&'static str>,
    /// Move the moov atom up front so playback can start immediately
    pub faststart: bool,
    /// Normalize negative/missing timestamps from the raw capture container
    pub normalize_timestamps: bool,
    /// Cap the output frame rate
    pub frame_rate: Option<u32>,
    /// Force the output resolution
    pub size: Option<(u32, u32)>,
}

impl EncodeAttempt {
    /// Full ffmpeg argument list for this attempt.
    pub fn args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-preset".to_string(),
            self.preset.to_string(),
            "-crf".to_string(),
            self.crf.to_string(),
        ];

        if let Some(pix_fmt) = self.pix_fmt {
            args.extend(["-pix_fmt".to_string(), pix_fmt.to_string()]);
        }
        if self.faststart {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }
        if self.normalize_timestamps {
            args.extend([
                "-avoid_negative_ts".to_string(),
                "make_zero".to_string(),
                "-fflags".to_string(),
                "+genpts".to_string(),
            ]);
        }
        if let Some(fps) = self.frame_rate {
            args.extend(["-r".to_string(), fps.to_string()]);
        }
        if let Some((w, h)) = self.size {
            args.extend(["-s".to_string(), format!("{}x{}", w, h)]);
        }

        args.push("-y".to_string());
        args.push(output.to_string_lossy().to_string());
        args
    }
}

/// The ordered ladder: primary first, then the cheaper fallback.
pub fn attempt_ladder() -> Vec<EncodeAttempt> {
    vec![
        EncodeAttempt {
            kind: AttemptKind::Primary,
            preset: "fast",
            crf: 23,
            pix_fmt: Some("yuv420p"),
            faststart: true,
            normalize_timestamps: true,
            frame_rate: None,
            size: None,
        },
        EncodeAttempt {
            kind: AttemptKind::Fallback,
            preset: "ultrafast",
            crf: 28,
            pix_fmt: None,
            faststart: false,
            normalize_timestamps: false,
            frame_rate: Some(15),
            size: Some((1280, 720)),
        },
    ]
}

/// Append the delivery extension when the caller-supplied path omits it.
pub fn ensure_delivery_extension(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext.eq_ignore_ascii_case(DELIVERY_EXTENSION) => path.to_path_buf(),
        _ => {
            let mut s = path.as_os_str().to_os_string();
            s.push(".");
            s.push(DELIVERY_EXTENSION);
            PathBuf::from(s)
        }
    }
}
