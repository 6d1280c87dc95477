//! Capture sources and acquisition
//!
//! Platform-agnostic capture types, the device stream acquirer with its
//! backend trait seams, the cpal microphone backend, and region cropping.

pub mod acquirer;
pub mod crop;
pub mod microphone;
pub mod types;

pub use acquirer::{
    DeviceStreamAcquirer, LiveAudioSource, LiveScreenSource, MicrophoneBackend, MicrophoneConfig,
    ScreenBackend, ScreenCaptureConfig, SystemAudioBackend,
};
pub use microphone::CpalMicrophoneBackend;
pub use types::{
    AudioTrack, CaptureSourceKind, CombinedStream, DisplayDescriptor, FrameCell, Region,
    RgbaFrame, SourceHandle, VideoTrack, CAPTURE_SAMPLE_RATE,
};
