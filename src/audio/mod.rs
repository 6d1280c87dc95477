//! Audio combination

pub mod mixer;

pub use mixer::{mix, MixedAudio, MixerInput, MICROPHONE_GAIN, SYSTEM_AUDIO_GAIN};
