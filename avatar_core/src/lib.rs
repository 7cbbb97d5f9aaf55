//! Audio-driven lip-sync frame synthesis.
//!
//! A [`FrameSynthesizer`] binds one lip-sync model to a compute device and one
//! avatar image, then turns each inbound audio chunk into a 256×256 RGB frame
//! whose mouth region follows the audio.

pub mod audio;
pub mod avatar;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod frame;
pub mod mel;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod synthesizer;

pub use audio::AudioChunk;
pub use avatar::{load_avatar, AvatarImage, FaceRegion, CANONICAL_SIZE};
pub use config::SynthesizerConfig;
pub use device::{Device, DevicePreference, DeviceProbe};
pub use error::{AvatarError, InitError};
pub use frame::SynthesizedFrame;
pub use model::{LipSyncModel, ModelLoader, OnnxModelLoader};
pub use synthesizer::{FrameSynthesizer, PipelineState};
