mod catalog;
mod config;
mod http;
mod jobs;
mod metrics;
mod models;
mod pipeline;
mod relevance;
mod retry;
mod scheduler;
#[cfg(test)]
mod testing;
mod vision;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use eyre::WrapErr;
use jobs::{JobProgress, JobRegistry};
use models::{ApiError, ResultSet, SearchRequest};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "discovery.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let state = AppState {
        pipeline: Pipeline::from_env(JobRegistry::new()),
    };
    let app = router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "discovery.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .await
        .wrap_err("serving http")?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/search", post(search))
        .nest(
            "/jobs",
            Router::new()
                .route("/cancel", post(cancel_all_jobs))
                .route("/{id}", get(job_progress))
                .route("/{id}/cancel", post(cancel_job)),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Health and readiness check.
///
/// Returns `status`, `service`, and the number of jobs currently running.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "product-discovery",
        "live_jobs": state.pipeline.registry().live().await,
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

/// Run one discovery job and wait for its result.
///
/// - Method: `POST`
/// - Path: `/search`
/// - Body: `SearchRequest`
/// - Response: `ResultSet` (filtered items, per-stage counts, stage transcript)
async fn search(
    State(state): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<ResultSet>, AppError> {
    crate::metrics::inc_requests("/search");
    let Json(request) =
        payload.map_err(|err| PipelineError::invalid_input("request", err.body_text()))?;
    info!(
        target = "discovery.api",
        keyword = %request.keyword,
        job_id = ?request.job_id,
        "search invoked"
    );
    let result = state.pipeline.run(request).await?;
    Ok(Json(result))
}

async fn job_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobProgress>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}");
    let id = parse_job_id(&id)?;
    state
        .pipeline
        .registry()
        .progress(id)
        .await
        .map(Json)
        .ok_or(AppError::NotFound(id))
}

/// Ask one job to stop at its next checkpoint. Unknown or finished ids are
/// answered with `cancelled: false`, not an error.
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}/cancel");
    let id = parse_job_id(&id)?;
    let cancelled = state.pipeline.registry().cancel(id).await;
    Ok(Json(json!({ "job_id": id, "cancelled": cancelled })))
}

async fn cancel_all_jobs(State(state): State<AppState>) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/jobs/cancel");
    let count = state.pipeline.registry().cancel_all().await;
    Json(json!({ "cancelled": count }))
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw)
        .map_err(|_| AppError::Pipeline(PipelineError::invalid_input("jobs", "invalid_job_id")))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    NotFound(Uuid),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::NotFound(id) => {
                let payload = ApiError {
                    error: "jobs".to_string(),
                    detail: Some(format!("no running job {id}")),
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
