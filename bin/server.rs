// Warehouse Pipeline - Web Server
// Stage triggers over HTTP; each response body is the stage's {"statusCode", "body"}

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use warehouse_pipeline::{Config, LoadRequest, Pipeline, StageResponse, TransformRequest, VERSION};

const DEFAULT_ADDR: &str = "0.0.0.0:3000";

/// Shared application state
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    /// One stage at a time; overlapping runs would race on the watermark document
    single_flight: Arc<Mutex<()>>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// Run a blocking stage off the async runtime and map its status code
async fn trigger<F>(state: AppState, stage: F) -> (StatusCode, Json<StageResponse>)
where
    F: FnOnce(&Pipeline) -> StageResponse + Send + 'static,
{
    let _permit = state.single_flight.clone().lock_owned().await;
    let pipeline = state.pipeline.clone();

    let response = match tokio::task::spawn_blocking(move || stage(&pipeline)).await {
        Ok(response) => response,
        Err(e) => StageResponse::failure(format!("stage task aborted: {}", e)),
    };
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response))
}

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": VERSION }))
}

/// POST /api/extract
async fn extract(State(state): State<AppState>) -> impl IntoResponse {
    trigger(state, |pipeline| pipeline.run_extract()).await
}

/// POST /api/transform - {"updates": [...]}
async fn transform(State(state): State<AppState>, Json(request): Json<TransformRequest>) -> impl IntoResponse {
    trigger(state, move |pipeline| pipeline.run_transform(&request)).await
}

/// POST /api/load - {"Records": [...]}, body optional
async fn load(State(state): State<AppState>, body: Option<Json<LoadRequest>>) -> impl IntoResponse {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    trigger(state, move |pipeline| pipeline.run_load(&request)).await
}

/// POST /api/run - chained extract, transform, load
async fn run(State(state): State<AppState>) -> impl IntoResponse {
    trigger(state, |pipeline| pipeline.run_chain()).await
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::resolve(None).context("Failed to load configuration")?;
    config.logging.init();

    let pipeline = Pipeline::open(config).context("Failed to open storage areas")?;
    let state = AppState {
        pipeline: Arc::new(pipeline),
        single_flight: Arc::new(Mutex::new(())),
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/extract", post(extract))
        .route("/transform", post(transform))
        .route("/load", post(load))
        .route("/run", post(run))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = std::env::var("PIPELINE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(%addr, "Pipeline server listening");
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
