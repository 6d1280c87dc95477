//! Conversion pipeline
//!
//! Turns the raw capture container into the delivery file via an external
//! encoder process. The exit code is the sole success signal; stdout/stderr
//! are captured as diagnostics only. A job never reports success unless the
//! output file exists with non-zero size, and the temp input is always
//! deleted before the job completes.

use super::attempt::{attempt_ladder, ensure_delivery_extension, AttemptKind};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Captured result of one encoder invocation
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Out-of-process encoder seam; production runs ffmpeg, tests script exits.
#[async_trait]
pub trait EncoderRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> std::io::Result<EncoderOutput>;
}

/// Runs the system ffmpeg binary to completion.
pub struct FfmpegRunner {
    binary: PathBuf,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self { binary: PathBuf::from("ffmpeg") }
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EncoderRunner for FfmpegRunner {
    async fn run(&self, args: &[String]) -> std::io::Result<EncoderOutput> {
        let output = tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(EncoderOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// One invocation of the conversion step, created per stop-and-save
#[derive(Debug)]
pub struct ConversionJob {
    pub input_temp_path: PathBuf,
    pub output_path: PathBuf,
    pub attempt: AttemptKind,
}

impl ConversionJob {
    pub fn new(input_temp_path: PathBuf, output_path: &Path) -> Self {
        Self {
            input_temp_path,
            output_path: ensure_delivery_extension(output_path),
            attempt: AttemptKind::Primary,
        }
    }
}

/// Result of a completed conversion
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub output_path: PathBuf,
    pub attempt: AttemptKind,
}

pub struct TranscodePipeline {
    runner: Box<dyn EncoderRunner>,
}

impl TranscodePipeline {
    pub fn new(runner: Box<dyn EncoderRunner>) -> Self {
        Self { runner }
    }

    pub fn with_ffmpeg() -> Self {
        Self::new(Box::new(FfmpegRunner::new()))
    }

    /// Convert the raw capture to the delivery format.
    ///
    /// Runs to completion once started; callers must not cancel a job in
    /// flight, to avoid undefined partial files.
    pub async fn convert(&self, mut job: ConversionJob) -> SessionResult<ConversionOutcome> {
        let result = self.convert_inner(&mut job).await;

        // The temp input is exclusive to this job and is removed on every
        // path before the job is considered complete.
        if job.input_temp_path.exists() {
            if let Err(e) = std::fs::remove_file(&job.input_temp_path) {
                tracing::warn!(path = %job.input_temp_path.display(), "failed to delete temp input: {e}");
            }
        }

        result
    }

    async fn convert_inner(&self, job: &mut ConversionJob) -> SessionResult<ConversionOutcome> {
        let input_len = std::fs::metadata(&job.input_temp_path).map(|m| m.len()).unwrap_or(0);
        if input_len == 0 {
            return Err(SessionError::EmptyOrMissingInput(
                job.input_temp_path.display().to_string(),
            ));
        }

        tracing::info!(
            input = %job.input_temp_path.display(),
            output = %job.output_path.display(),
            input_bytes = input_len,
            "starting conversion"
        );

        let mut diagnostics = String::new();
        for attempt in attempt_ladder() {
            job.attempt = attempt.kind;
            let args = attempt.args(&job.input_temp_path, &job.output_path);
            tracing::info!(attempt = ?attempt.kind, "running encoder: {}", args.join(" "));

            let output = match self.runner.run(&args).await {
                Ok(output) => output,
                Err(e) => {
                    diagnostics.push_str(&format!("[{:?}] failed to launch encoder: {e}\n", attempt.kind));
                    continue;
                }
            };

            if output.success && output_is_valid(&job.output_path) {
                tracing::info!(attempt = ?attempt.kind, output = %job.output_path.display(), "conversion succeeded");
                return Ok(ConversionOutcome {
                    output_path: job.output_path.clone(),
                    attempt: attempt.kind,
                });
            }

            if output.success {
                tracing::warn!(attempt = ?attempt.kind, "encoder exited cleanly but produced no usable output");
                diagnostics.push_str(&format!("[{:?}] output missing or empty\n", attempt.kind));
            } else {
                tracing::warn!(attempt = ?attempt.kind, "encoder exited with an error");
            }
            diagnostics.push_str(&format!(
                "[{:?}] stderr: {}\n[{:?}] stdout: {}\n",
                attempt.kind,
                tail(&output.stderr),
                attempt.kind,
                tail(&output.stdout),
            ));
        }

        Err(SessionError::ConversionFailed(diagnostics.trim_end().to_string()))
    }
}

fn output_is_valid(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Last part of a diagnostic stream, enough to log without flooding
fn tail(s: &str) -> &str {
    const MAX: usize = 2000;
    if s.len() <= MAX {
        s.trim_end()
    } else {
        let start = s.len() - MAX;
        // Stay on a char boundary
        let start = (start..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(start);
        s[start..].trim_end()
    }
}
