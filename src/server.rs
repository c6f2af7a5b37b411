//! HTTP surface
//!
//! Per media kind, `GET <path>` answers liveness and `POST <path>` runs the
//! intake pipeline. `GET /metrics` returns the counter snapshot.

use crate::audio::CanonicalAudio;
use crate::capture::CaptureHub;
use crate::config::IntakeConfig;
use crate::image::CanonicalImage;
use crate::inference::{Inference, ShapeProbe, WaveformProbe};
use crate::intake::{Intake, Outcome, Sonic, Vision};
use crate::metrics::{Metrics, MetricsSnapshot};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state of the router.
#[derive(Clone)]
pub struct AppState {
    pub vision: Intake<Vision>,
    pub sonic: Intake<Sonic>,
    pub metrics: Arc<Metrics>,
    pub max_body_bytes: usize,
    pub cors: bool,
}

impl AppState {
    /// State backed by the built-in probe collaborators.
    pub fn new(config: &IntakeConfig, hub: CaptureHub) -> Self {
        Self::with_models(config, hub, Arc::new(ShapeProbe), Arc::new(WaveformProbe))
    }

    pub fn with_models(
        config: &IntakeConfig,
        hub: CaptureHub,
        vision_model: Arc<dyn Inference<CanonicalImage>>,
        sonic_model: Arc<dyn Inference<CanonicalAudio>>,
    ) -> Self {
        let metrics = Metrics::new();
        let vision = Intake::new(
            Vision {
                config: config.vision.clone(),
            },
            vision_model,
            hub.clone(),
            Arc::clone(&metrics),
        );
        let sonic = Intake::new(
            Sonic {
                config: config.sonic.clone(),
            },
            sonic_model,
            hub,
            Arc::clone(&metrics),
        );

        Self {
            vision,
            sonic,
            metrics,
            max_body_bytes: config.max_body_bytes,
            cors: config.cors,
        }
    }
}

/// Build the router for both endpoints plus `/metrics`.
pub fn build_router(state: AppState) -> Router {
    let vision_path = state.vision.kind().config.path.clone();
    let sonic_path = state.sonic.kind().config.path.clone();
    let body_limit = state.max_body_bytes;

    let mut router = Router::new()
        .route(&vision_path, get(vision_alive).post(vision_intake))
        .route(&sonic_path, get(sonic_alive).post(sonic_intake))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(body_limit));

    if state.cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn vision_alive(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.vision.alive())
}

async fn vision_intake(State(state): State<Arc<AppState>>, request: Request) -> Outcome {
    state.vision.handle(request).await
}

async fn sonic_alive(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.sonic.alive())
}

async fn sonic_intake(State(state): State<Arc<AppState>>, request: Request) -> Outcome {
    state.sonic.handle(request).await
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Bind `addr` and serve until Ctrl+C or SIGTERM.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    tracing::info!(
        "Vision endpoint: {} | Sonic endpoint: {} | Max body: {} bytes",
        state.vision.kind().config.path,
        state.sonic.kind().config.path,
        state.max_body_bytes
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
