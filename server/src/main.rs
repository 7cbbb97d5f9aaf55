use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use avatar_core::{FrameSynthesizer, SynthesizerConfig};
use tokio::net::TcpListener;
use tracing::info;

use server::{build_router, config::ServerConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main().await
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting avatar frame server...");

    let synth_config = match std::env::var("AVATAR_CONFIG") {
        Ok(path) if !path.trim().is_empty() => {
            info!("Loading synthesizer configuration from {}", path);
            SynthesizerConfig::from_json_file(&path)?
        }
        _ => SynthesizerConfig::from_env()?,
    };
    info!(
        "Synthesizer configuration: checkpoint={}, avatar={}, device={:?}, input_rate={} Hz",
        synth_config.checkpoint_path.display(),
        synth_config.avatar_path.display(),
        synth_config.device,
        synth_config.input_sample_rate
    );

    // The pipeline must be ready before the listener accepts traffic.
    let synthesizer = FrameSynthesizer::with_onnx(synth_config)?;
    let synthesizer = tokio::task::spawn_blocking(move || {
        synthesizer.initialize_from_config().map(|_| synthesizer)
    })
    .await
    .context("Synthesizer initialization task failed")?
    .context("Failed to initialize frame synthesizer")?;

    let config = ServerConfig::from_env();
    info!(
        "Server configuration loaded: port={}, rate_limit={}/min, max_chunk={}ms",
        config.port, config.rate_limit_per_minute, config.max_chunk_ms
    );

    let state = AppState::new(Arc::new(synthesizer), config.clone());
    let app = build_router(state)?;

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!("Failed to bind {addr}: {e}. Try a different PORT.")
    })?;

    info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
