//! Common utilities for integration tests

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use avatar_core::{
    AvatarError, Device, DevicePreference, FrameSynthesizer, InitError, LipSyncModel, ModelLoader,
    SynthesizerConfig,
};
use axum::Router;
use base64::Engine;
use image::{Rgb, RgbImage};
use ndarray::{s, Array4, ArrayView4};
use server::{build_router, config::ServerConfig, AppState};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Returns the reference face unchanged and counts calls in flight.
pub struct EchoModel {
    active: Arc<AtomicUsize>,
    delay: Duration,
}

impl LipSyncModel for EchoModel {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn infer(&self, face: ArrayView4<'_, f32>, _mel: ArrayView4<'_, f32>) -> Result<Array4<f32>, AvatarError> {
        self.active.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let out = face.slice(s![.., 3..6, .., ..]).to_owned();
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(out)
    }
}

pub struct EchoLoader {
    pub active: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl ModelLoader for EchoLoader {
    fn load(&self, checkpoint: &Path, _device: Device) -> Result<Box<dyn LipSyncModel>, InitError> {
        if !checkpoint.is_file() {
            return Err(InitError::CheckpointNotFound(checkpoint.to_path_buf()));
        }
        Ok(Box::new(EchoModel {
            active: Arc::clone(&self.active),
            delay: self.delay,
        }))
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub active: Arc<AtomicUsize>,
    _dir: TempDir,
}

/// Create a test app instance with an initialized synthesizer
pub fn create_test_app() -> TestApp {
    create_app_with(Duration::ZERO, true)
}

/// Create a test app whose synthesizer was never initialized
pub fn create_uninitialized_app() -> TestApp {
    create_app_with(Duration::ZERO, false)
}

pub fn create_app_with(delay: Duration, initialize: bool) -> TestApp {
    let server_config = ServerConfig {
        rate_limit_per_minute: 6000,
        ..ServerConfig::default()
    };
    create_app_with_config(delay, initialize, server_config)
}

/// Create an initialized test app limited to `rate_limit_per_minute`
pub fn create_rate_limited_app(rate_limit_per_minute: u32) -> TestApp {
    let server_config = ServerConfig {
        rate_limit_per_minute,
        ..ServerConfig::default()
    };
    create_app_with_config(Duration::ZERO, true, server_config)
}

pub fn create_app_with_config(delay: Duration, initialize: bool, server_config: ServerConfig) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("wav2lip.onnx");
    std::fs::write(&checkpoint, b"stub").unwrap();
    let avatar = dir.path().join("avatar.png");
    RgbImage::from_pixel(256, 256, Rgb([120, 90, 60])).save(&avatar).unwrap();

    let active = Arc::new(AtomicUsize::new(0));
    let loader = EchoLoader {
        active: Arc::clone(&active),
        delay,
    };
    let config = SynthesizerConfig {
        checkpoint_path: checkpoint,
        avatar_path: avatar,
        device: DevicePreference::Cpu,
        ..SynthesizerConfig::default()
    };
    let synthesizer = FrameSynthesizer::new(Arc::new(loader), config).unwrap();
    if initialize {
        synthesizer.initialize_from_config().unwrap();
    }

    let state = AppState::new(Arc::new(synthesizer), server_config);
    let router = build_router(state.clone()).unwrap();

    TestApp {
        router,
        state,
        active,
        _dir: dir,
    }
}

/// Serve the app on an ephemeral local port
pub async fn spawn_server(app: &TestApp) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// `ms` milliseconds of silence at 16 kHz, base64-encoded 16-bit PCM
pub fn silence_base64(ms: u32) -> String {
    base64::engine::general_purpose::STANDARD.encode(silence_pcm(ms))
}

pub fn silence_pcm(ms: u32) -> Vec<u8> {
    vec![0u8; (16 * ms) as usize * 2]
}
