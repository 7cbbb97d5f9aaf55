use std::{
    sync::{atomic::Ordering, Arc, OnceLock},
    time::Instant,
};

use avatar_core::{AudioChunk, AvatarError, Device, PipelineState, SynthesizedFrame, CANONICAL_SIZE};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    Json,
};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ApiError, ErrorResponse};
use crate::metrics::{DetailedMetricsResponse, EndpointMetricsResponse, PipelineMetrics, SystemMetrics};
use crate::validation::{validate_frame_request, validate_pcm_chunk, validate_sample_rate};
use crate::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub(crate) fn mark_start() {
    START_TIME.get_or_init(Instant::now);
}

#[derive(Deserialize)]
pub struct FrameRequest {
    /// Base64 of little-endian 16-bit mono PCM
    pub audio_base64: String,
    /// Defaults to the synthesizer's input rate
    pub sample_rate: Option<u32>,
    /// When false, a call already in flight rejects this one with 429
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Serialize, Deserialize)]
pub struct FrameResponse {
    pub frame_png_base64: String,
    pub width: u32,
    pub height: u32,
    pub latency_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: String,
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub input_sample_rate: u32,
    pub frames_generated: u64,
}

#[derive(Deserialize)]
pub struct StreamParams {
    pub sample_rate: Option<u32>,
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn status_endpoint(State(state): State<AppState>) -> Json<StatusResponse> {
    let synth = &state.synthesizer;
    Json(StatusResponse {
        state: synth.state().to_string(),
        device: synth.device().map(|d: Device| d.to_string()),
        width: CANONICAL_SIZE,
        height: CANONICAL_SIZE,
        input_sample_rate: synth.config().input_sample_rate,
        frames_generated: synth.frames_generated(),
    })
}

pub async fn frame_endpoint(
    State(state): State<AppState>,
    Json(req): Json<FrameRequest>,
) -> Result<Json<FrameResponse>, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let result = render_png(&state, req).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok((frame_png_base64, width, height, audio_ms)) => {
            state.metrics.frame.record_request(latency_ms);
            state.metrics.synthesis.record_frame(audio_ms);
            Ok(Json(FrameResponse {
                frame_png_base64,
                width,
                height,
                latency_ms,
            }))
        }
        Err(e) => {
            state.metrics.frame.record_error();
            state.metrics.synthesis.record_failure(&e);
            Err(e)
        }
    }
}

async fn render_png(state: &AppState, req: FrameRequest) -> Result<(String, u32, u32, u64), ApiError> {
    let sample_rate = req
        .sample_rate
        .unwrap_or(state.synthesizer.config().input_sample_rate);
    let pcm = validate_frame_request(&req.audio_base64, sample_rate, state.config.max_chunk_ms)?;

    let synth = Arc::clone(&state.synthesizer);
    let wait = req.wait;
    tokio::task::spawn_blocking(move || -> Result<(String, u32, u32, u64), ApiError> {
        let chunk = AudioChunk::from_pcm16_le(&pcm, sample_rate)?;
        let audio_ms = chunk.duration_ms();
        let frame = if wait {
            synth.generate_frame(chunk)?
        } else {
            synth.try_generate_frame(chunk)?
        };
        let png = frame
            .to_png_base64()
            .map_err(|e| ApiError::InternalError(format!("PNG encoding error: {e}")))?;
        Ok((png, frame.width(), frame.height(), audio_ms))
    })
    .await
    .map_err(|e| ApiError::InternalError(format!("Task join error: {e}")))?
}

/// Turn one binary stream message into a raw RGB24 frame.
pub async fn handle_stream_chunk(
    state: &AppState,
    pcm: Vec<u8>,
    sample_rate: u32,
) -> Result<Vec<u8>, ApiError> {
    validate_pcm_chunk(&pcm, sample_rate, state.config.max_chunk_ms)?;

    let synth = Arc::clone(&state.synthesizer);
    let frame = tokio::task::spawn_blocking(move || -> Result<SynthesizedFrame, AvatarError> {
        let chunk = AudioChunk::from_pcm16_le(&pcm, sample_rate)?;
        synth.generate_frame(chunk)
    })
    .await
    .map_err(|e| ApiError::InternalError(format!("Task join error: {e}")))??;

    Ok(frame.into_image().into_raw())
}

pub async fn stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    let sample_rate = params
        .sample_rate
        .unwrap_or(state.synthesizer.config().input_sample_rate);

    if let Err(e) = validate_sample_rate(sample_rate) {
        return ws.on_upgrade(move |mut socket| async move {
            let _ = socket.send(error_message(&e)).await;
            let _ = socket.close().await;
        });
    }

    ws.on_upgrade(move |socket| stream_frames(socket, state, sample_rate))
}

async fn stream_frames(mut socket: WebSocket, state: AppState, sample_rate: u32) {
    info!("Frame stream opened at {sample_rate} Hz");
    let mut frames = 0u64;

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        match msg {
            Message::Binary(bytes) => {
                state.request_count.fetch_add(1, Ordering::Relaxed);
                let started = Instant::now();
                match handle_stream_chunk(&state, bytes.to_vec(), sample_rate).await {
                    Ok(raw) => {
                        state.metrics.stream.record_request(started.elapsed().as_millis() as u64);
                        state
                            .metrics
                            .synthesis
                            .record_frame((bytes.len() / 2) as u64 * 1000 / sample_rate as u64);
                        frames += 1;
                        if socket.send(Message::Binary(raw.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        state.metrics.stream.record_error();
                        state.metrics.synthesis.record_failure(&e);
                        if socket.send(error_message(&e)).await.is_err() {
                            break;
                        }
                        if matches!(e, ApiError::Unavailable(_)) {
                            let _ = socket.close().await;
                            break;
                        }
                    }
                }
            }
            Message::Text(_) => {
                let e = ApiError::InvalidInput("Expected binary 16-bit PCM messages".to_string());
                if socket.send(error_message(&e)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    debug!("Frame stream closed after {frames} frame(s)");
}

fn error_message(e: &ApiError) -> Message {
    let body = ErrorResponse::from(e);
    Message::Text(
        serde_json::json!({ "type": "error", "error": body.error, "code": body.code })
            .to_string()
            .into(),
    )
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let cpu_usage = system.global_cpu_info().cpu_usage();
    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    // Unix-like systems only
    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|loadavg| loadavg.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    let synth = &state.synthesizer;
    let pipeline_state: PipelineState = synth.state();

    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: cpu_usage,
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count: state.request_count.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            system_load,
        },
        pipeline: PipelineMetrics {
            state: pipeline_state,
            device: synth.device(),
            frames_generated: synth.frames_generated(),
        },
        endpoints: EndpointMetricsResponse {
            frame: state.metrics.frame.stats(),
            stream: state.metrics.stream.stats(),
        },
        synthesis: state.metrics.synthesis_stats(),
    })
}
