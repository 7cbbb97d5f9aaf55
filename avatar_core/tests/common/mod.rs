//! Common utilities for integration tests

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use avatar_core::{
    AvatarError, Device, InitError, LipSyncModel, ModelLoader,
};
use image::{Rgb, RgbImage};
use ndarray::{s, Array4, ArrayView4};
use tempfile::TempDir;

/// Counters shared between a stub loader and every model it hands out.
#[derive(Debug, Default)]
pub struct StubStats {
    pub loads: AtomicUsize,
    pub infers: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl StubStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn infers(&self) -> usize {
        self.infers.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

/// Echoes the reference face back and darkens the mouth area in proportion
/// to the audio energy, so silence reproduces the avatar.
pub struct StubModel {
    device: Device,
    stats: Arc<StubStats>,
    delay: Duration,
    oom: bool,
}

impl LipSyncModel for StubModel {
    fn device(&self) -> Device {
        self.device
    }

    fn infer(&self, face: ArrayView4<'_, f32>, mel: ArrayView4<'_, f32>) -> Result<Array4<f32>, AvatarError> {
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);
        self.stats.infers.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let result = if self.oom {
            Err(AvatarError::Device {
                device: self.device,
                message: "CUDA error: out of memory".into(),
                out_of_memory: true,
            })
        } else {
            let energy = mel.iter().map(|&v| (v + 4.0) / 8.0).sum::<f32>() / mel.len() as f32;
            let mut out = face.slice(s![.., 3..6, .., ..]).to_owned();
            out.slice_mut(s![.., .., 60..80, 30..66]).mapv_inplace(|v| v * (1.0 - energy));
            Ok(out)
        };

        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub struct StubLoader {
    pub stats: Arc<StubStats>,
    delay: Duration,
    gpu_oom: bool,
}

impl StubLoader {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(StubStats::default()),
            delay: Duration::ZERO,
            gpu_oom: false,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Models bound to the GPU fail every call with out-of-memory.
    pub fn with_gpu_oom(mut self) -> Self {
        self.gpu_oom = true;
        self
    }
}

impl ModelLoader for StubLoader {
    fn load(&self, checkpoint: &Path, device: Device) -> Result<Box<dyn LipSyncModel>, InitError> {
        if !checkpoint.is_file() {
            return Err(InitError::CheckpointNotFound(checkpoint.to_path_buf()));
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubModel {
            device,
            stats: Arc::clone(&self.stats),
            delay: self.delay,
            oom: self.gpu_oom && device == Device::Gpu,
        }))
    }
}

/// Temporary checkpoint and avatar files.
pub struct Fixture {
    pub dir: TempDir,
    pub checkpoint: PathBuf,
    pub avatar: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_avatar(gradient_avatar(256, 256))
    }

    pub fn with_avatar(image: RgbImage) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("wav2lip.onnx");
        std::fs::write(&checkpoint, b"stub weights").unwrap();
        let avatar = dir.path().join("avatar.png");
        image.save(&avatar).unwrap();
        Self { dir, checkpoint, avatar }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Smooth diagonal gradient, close to unchanged by down/up-scaling.
pub fn gradient_avatar(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let r = (60 + x * 120 / width.max(1)) as u8;
        let g = (80 + y * 100 / height.max(1)) as u8;
        Rgb([r, g, 140])
    })
}

/// `ms` milliseconds of silence as 16-bit PCM bytes.
pub fn silence_pcm16(ms: u32, sample_rate: u32) -> Vec<u8> {
    vec![0u8; (sample_rate * ms / 1000) as usize * 2]
}

/// `ms` milliseconds of a loud 300 Hz tone as 16-bit PCM bytes.
pub fn tone_pcm16(ms: u32, sample_rate: u32) -> Vec<u8> {
    let n = (sample_rate * ms / 1000) as usize;
    (0..n)
        .flat_map(|i| {
            let t = i as f32 / sample_rate as f32;
            let s = (2.0 * std::f32::consts::PI * 300.0 * t).sin() * 0.8;
            ((s * i16::MAX as f32) as i16).to_le_bytes()
        })
        .collect()
}
