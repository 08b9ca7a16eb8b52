//! Admin HTTP surface.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::jobs::{JobExecutor, JobId, JobType, NewJob};
use crate::provider::WeatherProvider;
use crate::registry::{JobDetails, JobRegistry};
use crate::scheduler::Scheduler;
use crate::websocket::{ws_handler, Broadcaster};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<JobRegistry>,
    pub executor: Arc<JobExecutor>,
    pub provider: Arc<WeatherProvider>,
    pub broadcaster: Arc<Broadcaster>,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", get(list_jobs).post(create_job))
        .route("/api/v1/jobs/:id", axum::routing::delete(delete_job))
        .route("/api/v1/weather/locations", get(search_locations))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_jobs: usize,
    ws_connections: usize,
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let jobs = state.registry.load_all().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        active_jobs: jobs.len(),
        ws_connections: state.broadcaster.connection_count(),
    }))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobDetails>>> {
    Ok(Json(state.registry.job_details().await?))
}

/// Create-job request body. The type comes in as its raw integer tag
/// so unknown tags surface as a typed error rather than a decode
/// failure.
#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    #[serde(rename = "type")]
    type_tag: i64,
    schedule: String,
    details: serde_json::Value,
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse> {
    let job_type = JobType::try_from(request.type_tag)?;

    let job = state
        .scheduler
        .add_job(NewJob {
            job_type,
            schedule: request.schedule,
            details: request.details,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(job)))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    state.scheduler.remove_job(JobId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct LocationQuery {
    q: String,
}

async fn search_locations(
    State(state): State<AppState>,
    Query(query): Query<LocationQuery>,
) -> Result<impl IntoResponse> {
    let locations = state.provider.fetch_locations(&query.q).await?;
    Ok(Json(locations))
}
