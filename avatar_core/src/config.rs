// Configuration for a frame synthesizer instance

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    avatar::FaceRegion,
    device::DevicePreference,
    error::InitError,
    mel::MODEL_SAMPLE_RATE,
};

const MIN_INPUT_SAMPLE_RATE: u32 = 8_000;
const MAX_INPUT_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    pub checkpoint_path: PathBuf,
    pub avatar_path: PathBuf,
    pub device: DevicePreference,
    pub allow_cpu_fallback: bool,
    /// Rate every inbound chunk is expected to carry.
    pub input_sample_rate: u32,
    pub face_region: FaceRegion,
    pub intra_threads: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("models/wav2lip.onnx"),
            avatar_path: PathBuf::from("avatar.jpg"),
            device: DevicePreference::Auto,
            allow_cpu_fallback: true,
            input_sample_rate: MODEL_SAMPLE_RATE,
            face_region: FaceRegion::full_frame(),
            intra_threads: 2,
        }
    }
}

impl SynthesizerConfig {
    /// Read `AVATAR_*` environment variables. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, InitError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, InitError> {
        let defaults = Self::default();

        let checkpoint_path = lookup("AVATAR_CHECKPOINT")
            .map(PathBuf::from)
            .unwrap_or(defaults.checkpoint_path);

        let avatar_path = lookup("AVATAR_IMAGE")
            .map(PathBuf::from)
            .unwrap_or(defaults.avatar_path);

        let device = match lookup("AVATAR_DEVICE") {
            Some(v) => v.parse()?,
            None => defaults.device,
        };

        let allow_cpu_fallback = match lookup("AVATAR_ALLOW_CPU_FALLBACK") {
            Some(v) => parse_bool("AVATAR_ALLOW_CPU_FALLBACK", &v)?,
            None => defaults.allow_cpu_fallback,
        };

        let input_sample_rate = match lookup("AVATAR_INPUT_SAMPLE_RATE") {
            Some(v) => parse_number("AVATAR_INPUT_SAMPLE_RATE", &v)?,
            None => defaults.input_sample_rate,
        };

        let face_region = match lookup("AVATAR_FACE_REGION") {
            Some(v) => v.parse()?,
            None => defaults.face_region,
        };

        let intra_threads = match lookup("AVATAR_INTRA_THREADS") {
            Some(v) => parse_number("AVATAR_INTRA_THREADS", &v)?,
            None => defaults.intra_threads,
        };

        let config = Self {
            checkpoint_path,
            avatar_path,
            device,
            allow_cpu_fallback,
            input_sample_rate,
            face_region,
            intra_threads,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| "Synthesizer config is not valid JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), InitError> {
        if !(MIN_INPUT_SAMPLE_RATE..=MAX_INPUT_SAMPLE_RATE).contains(&self.input_sample_rate) {
            return Err(InitError::InvalidConfig(format!(
                "input sample rate {} Hz outside {MIN_INPUT_SAMPLE_RATE}..={MAX_INPUT_SAMPLE_RATE} Hz",
                self.input_sample_rate
            )));
        }
        if self.intra_threads == 0 {
            return Err(InitError::InvalidConfig("intra_threads must be at least 1".into()));
        }
        self.face_region.validate()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, InitError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(InitError::InvalidConfig(format!("{key}: expected a boolean, got '{other}'"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, InitError> {
    value
        .trim()
        .parse()
        .map_err(|_| InitError::InvalidConfig(format!("{key}: expected a number, got '{value}'")))
}
