//! Raw-capture to delivery-format conversion

pub mod attempt;
pub mod pipeline;

pub use attempt::{attempt_ladder, ensure_delivery_extension, AttemptKind, EncodeAttempt, DELIVERY_EXTENSION};
pub use pipeline::{
    ConversionJob, ConversionOutcome, EncoderOutput, EncoderRunner, FfmpegRunner,
    TranscodePipeline,
};
