use std::path::PathBuf;

use thiserror::Error;

use crate::device::Device;

/// Failures while bringing a pipeline up. Fatal to the pipeline instance.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(PathBuf),

    #[error("Checkpoint {path} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Device {0} is not available")]
    DeviceUnavailable(Device),

    #[error("ONNX Runtime setup failed: {0}")]
    Runtime(String),

    #[error("Avatar image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("Failed to decode avatar image {path}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Unsupported color format {format} in {path}")]
    UnsupportedColorFormat { path: PathBuf, format: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors surfaced by the frame synthesizer.
#[derive(Debug, Error)]
pub enum AvatarError {
    #[error("Initialization failed: {0}")]
    Initialization(#[from] InitError),

    #[error("Pipeline is not initialized")]
    NotInitialized,

    #[error("Pipeline is busy with another frame")]
    Busy,

    #[error("Invalid audio chunk: {0}")]
    InvalidAudioChunk(String),

    #[error("Shape mismatch in {stage}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        stage: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Device error on {device}: {message}")]
    Device {
        device: Device,
        message: String,
        out_of_memory: bool,
    },
}

impl AvatarError {
    /// The pipeline cannot serve frames anymore; build a new one.
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            AvatarError::Initialization(_) | AvatarError::NotInitialized
        )
    }

    /// The caller should drop this chunk and continue with the next one.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, AvatarError::InvalidAudioChunk(_))
    }

    /// Broken contract between pipeline stages. Retrying will not help.
    pub fn is_defect(&self) -> bool {
        matches!(self, AvatarError::ShapeMismatch { .. })
    }

    pub(crate) fn shape_mismatch(stage: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        AvatarError::ShapeMismatch {
            stage,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T, E = AvatarError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_classification() {
        let init = AvatarError::from(InitError::CheckpointNotFound(PathBuf::from("x.onnx")));
        assert!(init.requires_restart());
        assert!(AvatarError::NotInitialized.requires_restart());
        assert!(!AvatarError::Busy.requires_restart());
        assert!(!AvatarError::InvalidAudioChunk("empty".into()).requires_restart());

        let oom = AvatarError::Device {
            device: Device::Gpu,
            message: "out of memory".into(),
            out_of_memory: true,
        };
        assert!(!oom.requires_restart());
    }

    #[test]
    fn test_defect_and_input_flags() {
        let mismatch = AvatarError::shape_mismatch("inference", &[1, 3, 96, 96], &[1, 3, 48, 48]);
        assert!(mismatch.is_defect());
        assert!(!mismatch.is_invalid_input());
        assert!(mismatch.to_string().contains("[1, 3, 96, 96]"));

        let bad = AvatarError::InvalidAudioChunk("odd byte count".into());
        assert!(bad.is_invalid_input());
        assert!(!bad.is_defect());
    }
}
