pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod validation;

use std::sync::{atomic::AtomicU64, Arc};

use avatar_core::FrameSynthesizer;
use axum::{
    extract::Request,
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::metrics::AppMetrics;

#[derive(Clone)]
pub struct AppState {
    pub synthesizer: Arc<FrameSynthesizer>,
    pub metrics: AppMetrics,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(synthesizer: Arc<FrameSynthesizer>, config: ServerConfig) -> Self {
        Self {
            synthesizer,
            metrics: AppMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }
}

/// Build the full application router with middleware.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let config = state.config.clone();
    routes::mark_start();

    // Rate limiting applies globally; per-IP extraction is unreliable behind proxies.
    // The governor period is the interval between replenished requests.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(replenish_interval_ms(config.rate_limit_per_minute))
            .burst_size(config.rate_limit_per_minute.max(1))
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", config.rate_limit_per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(&config))
        .into_inner();

    let public_api = Router::new()
        .route("/health", get(routes::health_check))
        .route("/healthz", get(routes::health_check))
        .route("/status", get(routes::status_endpoint))
        .route("/frame", post(routes::frame_endpoint))
        .route("/stream", get(routes::stream_ws));

    // Metrics endpoint - consider adding authentication in production
    let metrics_api = Router::new().route("/metrics", get(routes::metrics_endpoint));

    let api = Router::new().merge(public_api).merge(metrics_api);

    Ok(Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}

fn replenish_interval_ms(rate_limit_per_minute: u32) -> u64 {
    (60_000 / rate_limit_per_minute.max(1) as u64).max(1)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false);

    match &config.cors_allowed_origins {
        Some(allowed_origins) => {
            let origins: Vec<HeaderValue> = allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect();
            if origins.is_empty() {
                warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
                base.allow_origin(tower_http::cors::Any)
            } else {
                info!("CORS configured for {} origin(s)", origins.len());
                base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
            }
        }
        None => {
            warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
            base.allow_origin(tower_http::cors::Any)
        }
    }
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = header.clone() {
        request.headers_mut().insert("x-request-id", value);
    }
    let mut response = next.run(request).await;
    if let Some(value) = header {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
