//! Frame synthesizer: owns one model/device binding and one avatar, and turns
//! audio chunks into frames one at a time.
//!
//! ```text
//! Uninitialized --initialize ok--> Ready --generate_frame--> Busy --done--> Ready
//!       \                           |
//!        `--initialize err--> Failed (terminal)
//! ```
//!
//! Calls on one instance are serialized through an inference gate. A blocking
//! [`FrameSynthesizer::generate_frame`] queues behind the running call, while
//! [`FrameSynthesizer::try_generate_frame`] rejects with [`AvatarError::Busy`].

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError,
    },
    time::Instant,
};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::{
    audio::AudioChunk,
    avatar::{load_avatar, AvatarImage},
    config::SynthesizerConfig,
    device::{self, Device, DeviceProbe, DevicePreference},
    engine::InferenceEngine,
    error::{AvatarError, InitError, Result},
    frame::SynthesizedFrame,
    model::{ModelLoader, OnnxModelLoader},
    postprocess::Postprocessor,
    preprocess::Preprocessor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Uninitialized,
    Ready,
    Busy,
    Failed,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Ready => "ready",
            PipelineState::Busy => "busy",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything bound by a successful `initialize`.
struct Pipeline {
    engine: InferenceEngine,
    avatar: AvatarImage,
    checkpoint: PathBuf,
    avatar_path: PathBuf,
}

pub struct FrameSynthesizer {
    config: SynthesizerConfig,
    loader: Arc<dyn ModelLoader>,
    probe: Option<DeviceProbe>,
    preprocessor: Preprocessor,
    postprocessor: Postprocessor,
    state: RwLock<PipelineState>,
    /// Inference gate. Holding it is the only way to touch the model.
    pipeline: Mutex<Option<Pipeline>>,
    device: RwLock<Option<Device>>,
    avatar: RwLock<Option<AvatarImage>>,
    frames_generated: AtomicU64,
}

impl std::fmt::Debug for FrameSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSynthesizer")
            .field("state", &self.state())
            .field("device", &self.device())
            .field("frames_generated", &self.frames_generated())
            .finish()
    }
}

impl FrameSynthesizer {
    pub fn new(loader: Arc<dyn ModelLoader>, config: SynthesizerConfig) -> Result<Self, InitError> {
        config.validate()?;
        Ok(Self {
            preprocessor: Preprocessor::new(config.input_sample_rate, config.face_region),
            postprocessor: Postprocessor::new(config.face_region),
            config,
            loader,
            probe: None,
            state: RwLock::new(PipelineState::Uninitialized),
            pipeline: Mutex::new(None),
            device: RwLock::new(None),
            avatar: RwLock::new(None),
            frames_generated: AtomicU64::new(0),
        })
    }

    /// Synthesizer backed by ONNX Runtime.
    pub fn with_onnx(config: SynthesizerConfig) -> Result<Self, InitError> {
        let loader = OnnxModelLoader::new(config.intra_threads, config.allow_cpu_fallback);
        Self::new(Arc::new(loader), config)
    }

    /// Use a fixed capability probe instead of asking the runtime.
    pub fn with_probe(mut self, probe: DeviceProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Device the model is currently bound to, once initialized.
    pub fn device(&self) -> Option<Device> {
        *self.device.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn avatar(&self) -> Option<AvatarImage> {
        self.avatar.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn frames_generated(&self) -> u64 {
        self.frames_generated.load(Ordering::Relaxed)
    }

    /// Initialize with the paths from the configuration.
    pub fn initialize_from_config(&self) -> Result<()> {
        let checkpoint = self.config.checkpoint_path.clone();
        let avatar = self.config.avatar_path.clone();
        self.initialize(&checkpoint, &avatar)
    }

    /// Load the model and then the avatar.
    ///
    /// Calling again with the same paths on a ready pipeline is a no-op. Other
    /// paths drop the current binding before loading the new one. Any failure
    /// moves the pipeline to `Failed`, which is terminal.
    pub fn initialize(&self, checkpoint: &Path, avatar_path: &Path) -> Result<()> {
        let mut slot = self.lock_gate();

        if self.state() == PipelineState::Failed {
            return Err(AvatarError::NotInitialized);
        }
        if let Some(current) = slot.as_ref() {
            if current.checkpoint == checkpoint && current.avatar_path == avatar_path {
                debug!("Pipeline already initialized with {}", checkpoint.display());
                return Ok(());
            }
            info!("Re-initializing pipeline, releasing current model");
        }
        *slot = None;
        self.set_state(PipelineState::Uninitialized);

        match self.bind(checkpoint, avatar_path) {
            Ok(pipeline) => {
                let device = pipeline.engine.device();
                *self.device.write().unwrap_or_else(PoisonError::into_inner) = Some(device);
                *self.avatar.write().unwrap_or_else(PoisonError::into_inner) = Some(pipeline.avatar.clone());
                *slot = Some(pipeline);
                self.set_state(PipelineState::Ready);
                info!("Frame synthesizer ready on {device}");
                Ok(())
            }
            Err(e) => {
                *self.device.write().unwrap_or_else(PoisonError::into_inner) = None;
                *self.avatar.write().unwrap_or_else(PoisonError::into_inner) = None;
                self.set_state(PipelineState::Failed);
                error!("Frame synthesizer initialization failed: {e}");
                Err(AvatarError::Initialization(e))
            }
        }
    }

    fn bind(&self, checkpoint: &Path, avatar_path: &Path) -> Result<Pipeline, InitError> {
        let device = self.select_device()?;
        let model = self.loader.load(checkpoint, device)?;
        let avatar = load_avatar(avatar_path)?;
        Ok(Pipeline {
            engine: InferenceEngine::new(model, Arc::clone(&self.loader), checkpoint),
            avatar,
            checkpoint: checkpoint.to_path_buf(),
            avatar_path: avatar_path.to_path_buf(),
        })
    }

    fn select_device(&self) -> Result<Device, InitError> {
        if self.config.device == DevicePreference::Cpu {
            return Ok(Device::Cpu);
        }
        let probe = self.probe.unwrap_or_else(device::probe);
        device::select_device(self.config.device, self.config.allow_cpu_fallback, probe)
    }

    /// Produce one frame, waiting for any call already in flight.
    pub fn generate_frame(&self, chunk: AudioChunk) -> Result<SynthesizedFrame> {
        self.ensure_initialized()?;
        let mut slot = self.lock_gate();
        self.run(&mut slot, chunk)
    }

    /// Produce one frame, or fail with `Busy` if a call is already in flight.
    pub fn try_generate_frame(&self, chunk: AudioChunk) -> Result<SynthesizedFrame> {
        self.ensure_initialized()?;
        let mut slot = match self.pipeline.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(AvatarError::Busy),
        };
        self.run(&mut slot, chunk)
    }

    fn ensure_initialized(&self) -> Result<()> {
        match self.state() {
            PipelineState::Uninitialized | PipelineState::Failed => Err(AvatarError::NotInitialized),
            PipelineState::Ready | PipelineState::Busy => Ok(()),
        }
    }

    fn run(&self, slot: &mut Option<Pipeline>, chunk: AudioChunk) -> Result<SynthesizedFrame> {
        let pipeline = slot.as_mut().ok_or(AvatarError::NotInitialized)?;
        let _busy = BusyGuard::enter(&self.state);
        let started = Instant::now();

        let feature = self.preprocessor.to_conditioning_feature(&chunk)?;
        let face = self.preprocessor.to_face_crop(&pipeline.avatar);
        let result = pipeline.engine.infer(&face, &feature);

        let device = pipeline.engine.device();
        *self.device.write().unwrap_or_else(PoisonError::into_inner) = Some(device);

        let frame = self.postprocessor.to_frame(&result?, &pipeline.avatar)?;
        let count = self.frames_generated.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Frame {count} from {} samples on {device} in {:?}",
            chunk.len(),
            started.elapsed()
        );
        Ok(frame)
    }

    fn lock_gate(&self) -> MutexGuard<'_, Option<Pipeline>> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Marks the pipeline `Busy` for the lifetime of one call.
struct BusyGuard<'a> {
    state: &'a RwLock<PipelineState>,
}

impl<'a> BusyGuard<'a> {
    fn enter(state: &'a RwLock<PipelineState>) -> Self {
        *state.write().unwrap_or_else(PoisonError::into_inner) = PipelineState::Busy;
        Self { state }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == PipelineState::Busy {
            *state = PipelineState::Ready;
        }
    }
}
