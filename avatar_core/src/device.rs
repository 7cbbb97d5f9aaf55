//! Compute device selection.
//!
//! The GPU probe runs once per process and its answer is cached. Every
//! decision about which device a pipeline binds to goes through
//! [`select_device`]. A GPU session that still fails to build afterwards is
//! handled by [`gpu_binding_failed`] under the same fallback flag.

use std::{fmt, str::FromStr, sync::OnceLock};

use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::Session,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::InitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Gpu,
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Gpu => f.write_str("gpu"),
            Device::Cpu => f.write_str("cpu"),
        }
    }
}

/// Device requested by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// GPU when the probe finds one, CPU otherwise.
    #[default]
    Auto,
    Gpu,
    Cpu,
}

impl FromStr for DevicePreference {
    type Err = InitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(DevicePreference::Auto),
            "gpu" | "cuda" => Ok(DevicePreference::Gpu),
            "cpu" => Ok(DevicePreference::Cpu),
            other => Err(InitError::InvalidConfig(format!(
                "unknown device '{other}' (expected auto, gpu or cpu)"
            ))),
        }
    }
}

/// Result of the one-time capability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProbe {
    pub gpu_available: bool,
}

static PROBE: OnceLock<DeviceProbe> = OnceLock::new();

/// Probe the runtime for a usable GPU. Cached for the process lifetime.
///
/// A CUDA build of ONNX Runtime is not enough: the provider has to register
/// on a session, which fails when no device or driver is present.
pub fn probe() -> DeviceProbe {
    *PROBE.get_or_init(|| {
        let gpu_available = match cuda_registers() {
            Ok(available) => available,
            Err(e) => {
                warn!("CUDA execution provider unusable, assuming no GPU: {e}");
                false
            }
        };
        info!("Device probe: gpu_available={gpu_available}");
        DeviceProbe { gpu_available }
    })
}

fn cuda_registers() -> ort::Result<bool> {
    let cuda = CUDAExecutionProvider::default();
    if !cuda.is_available()? {
        return Ok(false);
    }
    let mut builder = Session::builder()?;
    cuda.register(&mut builder)?;
    Ok(true)
}

/// Pick the device a pipeline binds to.
///
/// A GPU request on a machine without one falls back to CPU with a warning
/// unless `allow_cpu_fallback` is off, in which case it fails with
/// [`InitError::DeviceUnavailable`].
pub fn select_device(
    preference: DevicePreference,
    allow_cpu_fallback: bool,
    probe: DeviceProbe,
) -> Result<Device, InitError> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Auto => {
            if probe.gpu_available {
                Ok(Device::Gpu)
            } else {
                info!("No GPU detected, running on CPU");
                Ok(Device::Cpu)
            }
        }
        DevicePreference::Gpu => resolve_device(Device::Gpu, allow_cpu_fallback, probe),
    }
}

/// Check a concrete device against the probe, applying the fallback policy.
fn resolve_device(
    requested: Device,
    allow_cpu_fallback: bool,
    probe: DeviceProbe,
) -> Result<Device, InitError> {
    match requested {
        Device::Cpu => Ok(Device::Cpu),
        Device::Gpu if probe.gpu_available => Ok(Device::Gpu),
        Device::Gpu if allow_cpu_fallback => {
            warn!("GPU requested but not available, falling back to CPU");
            Ok(Device::Cpu)
        }
        Device::Gpu => Err(InitError::DeviceUnavailable(Device::Gpu)),
    }
}

/// Policy for a GPU session that could not be created after selection.
pub fn gpu_binding_failed(allow_cpu_fallback: bool, reason: &str) -> Result<Device, InitError> {
    if allow_cpu_fallback {
        warn!("GPU session could not be created, falling back to CPU: {reason}");
        Ok(Device::Cpu)
    } else {
        error!("GPU session could not be created and CPU fallback is disabled: {reason}");
        Err(InitError::DeviceUnavailable(Device::Gpu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WITH_GPU: DeviceProbe = DeviceProbe { gpu_available: true };
    const NO_GPU: DeviceProbe = DeviceProbe { gpu_available: false };

    #[test]
    fn test_auto_prefers_gpu() {
        assert_eq!(select_device(DevicePreference::Auto, true, WITH_GPU).unwrap(), Device::Gpu);
        assert_eq!(select_device(DevicePreference::Auto, false, NO_GPU).unwrap(), Device::Cpu);
    }

    #[test]
    fn test_gpu_falls_back_to_cpu() {
        assert_eq!(select_device(DevicePreference::Gpu, true, NO_GPU).unwrap(), Device::Cpu);
        assert_eq!(select_device(DevicePreference::Gpu, true, WITH_GPU).unwrap(), Device::Gpu);
    }

    #[test]
    fn test_gpu_without_fallback_is_unavailable() {
        let result = select_device(DevicePreference::Gpu, false, NO_GPU);
        assert!(matches!(result, Err(InitError::DeviceUnavailable(Device::Gpu))));
    }

    #[test]
    fn test_cpu_is_always_honored() {
        assert_eq!(select_device(DevicePreference::Cpu, false, WITH_GPU).unwrap(), Device::Cpu);
    }

    #[test]
    fn test_parse_preference() {
        assert_eq!("GPU".parse::<DevicePreference>().unwrap(), DevicePreference::Gpu);
        assert_eq!("cuda".parse::<DevicePreference>().unwrap(), DevicePreference::Gpu);
        assert_eq!(" cpu ".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn test_gpu_binding_failure_policy() {
        assert_eq!(gpu_binding_failed(true, "no CUDA device").unwrap(), Device::Cpu);
        assert!(matches!(
            gpu_binding_failed(false, "no CUDA device"),
            Err(InitError::DeviceUnavailable(Device::Gpu))
        ));
    }

    #[test]
    fn test_probe_is_cached() {
        assert_eq!(probe(), probe());
    }
}
