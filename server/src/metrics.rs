// Metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use avatar_core::{Device, PipelineState};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Latency samples kept for percentile calculation
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Per-endpoint metrics
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    pub request_count: Arc<AtomicU64>,
    pub error_count: Arc<AtomicU64>,
    pub total_latency_ms: Arc<AtomicU64>,
    pub min_latency_ms: Arc<AtomicU64>,
    pub max_latency_ms: Arc<AtomicU64>,
    pub latency_samples: Arc<std::sync::Mutex<Vec<u64>>>,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self {
            request_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            total_latency_ms: Arc::new(AtomicU64::new(0)),
            min_latency_ms: Arc::new(AtomicU64::new(u64::MAX)),
            max_latency_ms: Arc::new(AtomicU64::new(0)),
            latency_samples: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn record_request(&self, latency_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_latency_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.latency_samples.lock() {
            samples.push(latency_ms);
            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.request_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_latency_ms.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    pub fn percentile(&self, p: u8) -> u64 {
        if let Ok(samples) = self.latency_samples.lock() {
            if samples.is_empty() {
                return 0;
            }
            let mut sorted = samples.clone();
            sorted.sort_unstable();
            let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
            sorted[index]
        } else {
            0
        }
    }

    pub fn stats(&self) -> EndpointStats {
        let min = self.min_latency_ms.load(Ordering::Relaxed);
        EndpointStats {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: self.percentile(50),
            p95_latency_ms: self.percentile(95),
            p99_latency_ms: self.percentile(99),
        }
    }
}

impl Default for EndpointMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame-synthesis specific counters
#[derive(Debug, Clone)]
pub struct FrameMetrics {
    pub frames_served: Arc<AtomicU64>,
    pub total_audio_ms: Arc<AtomicU64>,
    pub invalid_chunks: Arc<AtomicU64>,
    pub busy_rejections: Arc<AtomicU64>,
    pub device_errors: Arc<AtomicU64>,
}

impl FrameMetrics {
    pub fn new() -> Self {
        Self {
            frames_served: Arc::new(AtomicU64::new(0)),
            total_audio_ms: Arc::new(AtomicU64::new(0)),
            invalid_chunks: Arc::new(AtomicU64::new(0)),
            busy_rejections: Arc::new(AtomicU64::new(0)),
            device_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_frame(&self, audio_ms: u64) {
        self.frames_served.fetch_add(1, Ordering::Relaxed);
        self.total_audio_ms.fetch_add(audio_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: &crate::error::ApiError) {
        use crate::error::ApiError;
        let counter = match error {
            ApiError::InvalidInput(_) => &self.invalid_chunks,
            ApiError::Busy => &self.busy_rejections,
            ApiError::Device(_) => &self.device_errors,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FrameMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct AppMetrics {
    pub frame: EndpointMetrics,
    pub stream: EndpointMetrics,
    pub synthesis: FrameMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self {
            frame: EndpointMetrics::new(),
            stream: EndpointMetrics::new(),
            synthesis: FrameMetrics::new(),
        }
    }

    pub fn synthesis_stats(&self) -> FrameMetricsResponse {
        let s = &self.synthesis;
        FrameMetricsResponse {
            frames_served: s.frames_served.load(Ordering::Relaxed),
            total_audio_ms: s.total_audio_ms.load(Ordering::Relaxed),
            invalid_chunks: s.invalid_chunks.load(Ordering::Relaxed),
            busy_rejections: s.busy_rejections.load(Ordering::Relaxed),
            device_errors: s.device_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub pipeline: PipelineMetrics,
    pub endpoints: EndpointMetricsResponse,
    pub synthesis: FrameMetricsResponse,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Serialize)]
pub struct PipelineMetrics {
    pub state: PipelineState,
    pub device: Option<Device>,
    pub frames_generated: u64,
}

#[derive(Serialize)]
pub struct EndpointMetricsResponse {
    pub frame: EndpointStats,
    pub stream: EndpointStats,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

#[derive(Serialize)]
pub struct FrameMetricsResponse {
    pub frames_served: u64,
    pub total_audio_ms: u64,
    pub invalid_chunks: u64,
    pub busy_rejections: u64,
    pub device_errors: u64,
}
