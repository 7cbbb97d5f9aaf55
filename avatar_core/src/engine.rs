//! Inference engine: one forward pass per frame on the bound device.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use ndarray::{Array4, ArrayView4};
use tracing::{error, info, warn};

use crate::{
    device::Device,
    error::{AvatarError, Result},
    model::{LipSyncModel, ModelLoader, PREDICTION_SHAPE},
    preprocess::{ConditioningFeature, FaceCrop, FACE_CROP_SHAPE, FEATURE_SHAPE},
};

/// Predicted mouth region, BGR in `[0, 1]`, shape [`PREDICTION_SHAPE`].
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedRegion(Array4<f32>);

impl PredictedRegion {
    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    #[cfg(test)]
    pub(crate) fn from_array(array: Array4<f32>) -> Self {
        Self(array)
    }
}

pub struct InferenceEngine {
    model: Box<dyn LipSyncModel>,
    loader: Arc<dyn ModelLoader>,
    checkpoint: PathBuf,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("device", &self.model.device())
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}

impl InferenceEngine {
    pub fn new(model: Box<dyn LipSyncModel>, loader: Arc<dyn ModelLoader>, checkpoint: &Path) -> Self {
        Self {
            model,
            loader,
            checkpoint: checkpoint.to_path_buf(),
        }
    }

    pub fn device(&self) -> Device {
        self.model.device()
    }

    /// Run the network on one face crop and conditioning feature.
    ///
    /// A GPU out-of-memory failure is returned to the caller, and the model is
    /// rebound to CPU so the following frames can still be served.
    pub fn infer(&mut self, face: &FaceCrop, feature: &ConditioningFeature) -> Result<PredictedRegion> {
        check_shape("face crop", &FACE_CROP_SHAPE, face.shape())?;
        check_shape("conditioning feature", &FEATURE_SHAPE, feature.shape())?;

        match self.model.infer(face.view(), feature.view()) {
            Ok(output) => {
                check_shape("inference output", &PREDICTION_SHAPE, output.shape())?;
                Ok(PredictedRegion(output))
            }
            Err(e) => {
                if let AvatarError::Device {
                    device: Device::Gpu,
                    out_of_memory: true,
                    ..
                } = &e
                {
                    self.fall_back_to_cpu();
                }
                if e.is_defect() {
                    error!("{e}");
                }
                Err(e)
            }
        }
    }

    fn fall_back_to_cpu(&mut self) {
        warn!("GPU ran out of memory, reloading model on CPU");
        match self.loader.load(&self.checkpoint, Device::Cpu) {
            Ok(model) => {
                self.model = model;
                info!("Model rebound to CPU");
            }
            Err(e) => error!("CPU reload after GPU out-of-memory failed: {e}"),
        }
    }
}

/// Shape invariant between pipeline stages. Violations are defects and are
/// logged at error level.
pub(crate) fn check_shape(stage: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        return Ok(());
    }
    let err = AvatarError::shape_mismatch(stage, expected, actual);
    error!("{err}");
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::AudioChunk, avatar::{AvatarImage, FaceRegion}, error::InitError, preprocess::Preprocessor};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedModel {
        device: Device,
        output: Vec<usize>,
        oom: bool,
    }

    impl LipSyncModel for FixedModel {
        fn device(&self) -> Device {
            self.device
        }

        fn infer(&self, _face: ArrayView4<'_, f32>, _mel: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
            if self.oom {
                return Err(AvatarError::Device {
                    device: self.device,
                    message: "CUDA out of memory".into(),
                    out_of_memory: true,
                });
            }
            let shape = [self.output[0], self.output[1], self.output[2], self.output[3]];
            Ok(Array4::from_elem(shape, 0.5))
        }
    }

    #[derive(Default)]
    struct CpuLoader {
        loads: AtomicUsize,
    }

    impl ModelLoader for CpuLoader {
        fn load(&self, _checkpoint: &Path, device: Device) -> Result<Box<dyn LipSyncModel>, InitError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FixedModel {
                device,
                output: PREDICTION_SHAPE.to_vec(),
                oom: false,
            }))
        }
    }

    fn inputs() -> (FaceCrop, ConditioningFeature) {
        let pre = Preprocessor::new(16_000, FaceRegion::full_frame());
        let avatar = AvatarImage::from_rgb(RgbImage::from_pixel(256, 256, Rgb([90, 90, 90])));
        let chunk = AudioChunk::from_f32(vec![0.0; 320], 16_000).unwrap();
        (pre.to_face_crop(&avatar), pre.to_conditioning_feature(&chunk).unwrap())
    }

    fn engine(model: FixedModel, loader: Arc<CpuLoader>) -> InferenceEngine {
        InferenceEngine::new(Box::new(model), loader, Path::new("wav2lip.onnx"))
    }

    #[test]
    fn test_infer_returns_prediction() {
        let model = FixedModel { device: Device::Cpu, output: PREDICTION_SHAPE.to_vec(), oom: false };
        let mut engine = engine(model, Arc::new(CpuLoader::default()));
        let (face, feature) = inputs();
        let prediction = engine.infer(&face, &feature).unwrap();
        assert_eq!(prediction.shape(), &PREDICTION_SHAPE);
    }

    #[test]
    fn test_wrong_output_shape_is_defect() {
        let model = FixedModel { device: Device::Cpu, output: vec![1, 3, 48, 48], oom: false };
        let mut engine = engine(model, Arc::new(CpuLoader::default()));
        let (face, feature) = inputs();
        let err = engine.infer(&face, &feature).unwrap_err();
        assert!(err.is_defect());
    }

    #[test]
    fn test_gpu_oom_rebinds_to_cpu() {
        let loader = Arc::new(CpuLoader::default());
        let model = FixedModel { device: Device::Gpu, output: PREDICTION_SHAPE.to_vec(), oom: true };
        let mut engine = engine(model, loader.clone());
        let (face, feature) = inputs();

        let err = engine.infer(&face, &feature).unwrap_err();
        assert!(matches!(err, AvatarError::Device { out_of_memory: true, .. }));
        assert_eq!(engine.device(), Device::Cpu);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        assert!(engine.infer(&face, &feature).is_ok());
    }

    #[test]
    fn test_cpu_oom_does_not_reload() {
        let loader = Arc::new(CpuLoader::default());
        let model = FixedModel { device: Device::Cpu, output: PREDICTION_SHAPE.to_vec(), oom: true };
        let mut engine = engine(model, loader.clone());
        let (face, feature) = inputs();

        assert!(engine.infer(&face, &feature).is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }
}
