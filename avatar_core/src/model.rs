//! Model loading and the ONNX Runtime backend.
//!
//! The synthesizer only talks to [`LipSyncModel`] and [`ModelLoader`], so a
//! different backend (or an instrumented stub in tests) can be swapped in
//! without touching the orchestration.

use std::path::{Path, PathBuf};

use ndarray::{Array4, ArrayView4, Ix4};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::ValueType,
};
use tracing::{debug, info};

use crate::{
    device::{self, Device},
    error::{AvatarError, InitError, Result},
    preprocess::{FACE_CROP_SHAPE, FEATURE_SHAPE},
};

/// `[batch, channel, height, width]`, BGR in `[0, 1]`.
pub const PREDICTION_SHAPE: [usize; 4] = [1, 3, 96, 96];

/// A loaded lip-sync network: face crop + mel window in, mouth region out.
///
/// Implementations must be deterministic and must never update weights.
pub trait LipSyncModel: Send + Sync {
    fn device(&self) -> Device;

    fn infer(&self, face: ArrayView4<'_, f32>, mel: ArrayView4<'_, f32>) -> Result<Array4<f32>>;
}

/// Turns a checkpoint on disk into a model bound to a device.
pub trait ModelLoader: Send + Sync {
    fn load(&self, checkpoint: &Path, device: Device) -> Result<Box<dyn LipSyncModel>, InitError>;
}

/// Loads ONNX exports of the lip-sync network with ONNX Runtime.
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    intra_threads: usize,
    allow_cpu_fallback: bool,
}

impl OnnxModelLoader {
    pub fn new(intra_threads: usize, allow_cpu_fallback: bool) -> Self {
        Self {
            intra_threads: intra_threads.max(1),
            allow_cpu_fallback,
        }
    }

    fn session_builder(&self) -> Result<SessionBuilder, InitError> {
        Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(self.intra_threads))
            .map_err(|e| InitError::Runtime(e.to_string()))
    }

    /// Register the providers for `device`. A CUDA registration failure is
    /// surfaced instead of silently running on the CPU provider.
    fn bind_providers(&self, builder: SessionBuilder, device: Device) -> Result<(SessionBuilder, Device), InitError> {
        let cpu = |b: SessionBuilder| {
            b.with_execution_providers([CPUExecutionProvider::default().build()])
                .map_err(|e| InitError::Runtime(e.to_string()))
        };
        match device {
            Device::Cpu => Ok((cpu(builder)?, Device::Cpu)),
            Device::Gpu => {
                match builder
                    .clone()
                    .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])
                {
                    Ok(builder) => Ok((builder, Device::Gpu)),
                    Err(e) => {
                        let device = device::gpu_binding_failed(self.allow_cpu_fallback, &e.to_string())?;
                        Ok((cpu(builder)?, device))
                    }
                }
            }
        }
    }

    fn build_session(&self, checkpoint: &Path, device: Device) -> Result<(Session, Device), InitError> {
        let (builder, device) = self.bind_providers(self.session_builder()?, device)?;
        let session = builder
            .commit_from_file(checkpoint)
            .map_err(|e| InitError::CheckpointCorrupt {
                path: checkpoint.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok((session, device))
    }
}

impl Default for OnnxModelLoader {
    fn default() -> Self {
        Self::new(2, true)
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, checkpoint: &Path, device: Device) -> Result<Box<dyn LipSyncModel>, InitError> {
        if !checkpoint.is_file() {
            return Err(InitError::CheckpointNotFound(checkpoint.to_path_buf()));
        }
        info!("Loading lip-sync model from {} on {device}", checkpoint.display());
        let (session, device) = self.build_session(checkpoint, device)?;
        let signature = Signature::inspect(&session, checkpoint)?;
        debug!(
            "Model signature: mel='{}' face='{}' output='{}'",
            signature.mel_input, signature.face_input, signature.output
        );
        info!("Lip-sync model loaded on {device}");

        Ok(Box::new(OnnxLipSyncModel {
            session,
            device,
            signature,
            checkpoint: checkpoint.to_path_buf(),
        }))
    }
}

/// Input and output names resolved from the exported graph.
#[derive(Debug, Clone)]
struct Signature {
    mel_input: String,
    face_input: String,
    output: String,
}

impl Signature {
    fn inspect(session: &Session, checkpoint: &Path) -> Result<Self, InitError> {
        let corrupt = |reason: String| InitError::CheckpointCorrupt {
            path: checkpoint.to_path_buf(),
            reason,
        };

        if session.inputs.len() != 2 {
            return Err(corrupt(format!(
                "expected 2 inputs (mel, face), found {}",
                session.inputs.len()
            )));
        }
        let output = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| corrupt("graph has no outputs".to_string()))?;

        let channels: Vec<Option<i64>> = session
            .inputs
            .iter()
            .map(|input| match &input.input_type {
                ValueType::Tensor { dimensions, .. } if dimensions.len() == 4 => Some(dimensions[1]),
                _ => None,
            })
            .collect();
        if channels.iter().any(Option::is_none) {
            return Err(corrupt("inputs must be rank-4 tensors".to_string()));
        }

        // Prefer the channel dimension, then the conventional names, then the
        // export order of the reference network (audio first).
        let mel_index = channels
            .iter()
            .position(|&c| c == Some(FEATURE_SHAPE[1] as i64))
            .filter(|_| channels.iter().any(|&c| c == Some(FACE_CROP_SHAPE[1] as i64)))
            .or_else(|| {
                session.inputs.iter().position(|i| {
                    let name = i.name.to_ascii_lowercase();
                    name.contains("mel") || name.contains("audio")
                })
            })
            .unwrap_or(0);
        let face_index = 1 - mel_index;

        for (index, expected) in [(mel_index, FEATURE_SHAPE[1]), (face_index, FACE_CROP_SHAPE[1])] {
            if let Some(c) = channels[index] {
                if c >= 0 && c as usize != expected {
                    return Err(corrupt(format!(
                        "input '{}' has {c} channels, expected {expected}",
                        session.inputs[index].name
                    )));
                }
            }
        }

        Ok(Self {
            mel_input: session.inputs[mel_index].name.clone(),
            face_input: session.inputs[face_index].name.clone(),
            output,
        })
    }
}

struct OnnxLipSyncModel {
    session: Session,
    device: Device,
    signature: Signature,
    checkpoint: PathBuf,
}

impl OnnxLipSyncModel {
    fn device_error(&self, e: ort::Error) -> AvatarError {
        let message = e.to_string();
        AvatarError::Device {
            device: self.device,
            out_of_memory: is_out_of_memory(&message),
            message,
        }
    }
}

impl LipSyncModel for OnnxLipSyncModel {
    fn device(&self) -> Device {
        self.device
    }

    fn infer(&self, face: ArrayView4<'_, f32>, mel: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        if face.shape() != FACE_CROP_SHAPE {
            return Err(AvatarError::shape_mismatch("model face input", &FACE_CROP_SHAPE, face.shape()));
        }
        if mel.shape() != FEATURE_SHAPE {
            return Err(AvatarError::shape_mismatch("model mel input", &FEATURE_SHAPE, mel.shape()));
        }

        let inputs = ort::inputs![
            self.signature.mel_input.as_str() => mel,
            self.signature.face_input.as_str() => face,
        ]
        .map_err(|e| self.device_error(e))?;
        let outputs = self.session.run(inputs).map_err(|e| self.device_error(e))?;

        let prediction = outputs
            .get(self.signature.output.as_str())
            .ok_or_else(|| AvatarError::Device {
                device: self.device,
                message: format!(
                    "output '{}' missing from {}",
                    self.signature.output,
                    self.checkpoint.display()
                ),
                out_of_memory: false,
            })?
            .try_extract_tensor::<f32>()
            .map_err(|e| self.device_error(e))?;

        let actual = prediction.shape().to_vec();
        prediction
            .into_dimensionality::<Ix4>()
            .map(|view| view.to_owned())
            .map_err(|_| AvatarError::shape_mismatch("model output", &PREDICTION_SHAPE, &actual))
    }
}

/// Runtime messages that indicate device memory exhaustion.
pub(crate) fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["out of memory", "failed to allocate", "bad_alloc", "cudaerrormemoryallocation"]
        .iter()
        .any(|needle| lower.contains(needle))
}
