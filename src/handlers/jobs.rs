//! # Jobs API Handlers
//!
//! This module contains handlers for starting, querying, listing and
//! stopping scrape jobs.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{
    ApiError, conflict, is_unique_violation, not_found, spawn_error, validation_error,
};
use crate::models::{job, job_log};
use crate::repositories::{JobRepository, TransitionOutcome};
use crate::server::AppState;
use crate::supervisor::SpawnError;

const DEFAULT_MAX_PRODUCTS: i32 = 5;
const DEFAULT_MAX_PAGES: i32 = 1;

/// Request body for starting a scrape job
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartJobRequest {
    /// Product to search for (required, non-empty)
    #[schema(example = "Wireless Mouse")]
    pub product_name: Option<String>,
    /// Upper bound on collected products (default: 5)
    #[schema(example = 5)]
    pub max_products: Option<i32>,
    /// Upper bound on visited result pages (default: 1)
    #[schema(example = 1)]
    pub max_pages: Option<i32>,
}

/// Response for a successfully started job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartJobResponse {
    /// Unique identifier of the new job
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub job_id: String,
    /// Status the job was created in
    #[schema(example = "pending")]
    pub status: String,
}

/// Response for the operator stop action
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StopJobResponse {
    pub success: bool,
    /// Status after the stop was applied
    #[schema(example = "stopped")]
    pub status: String,
}

/// Full job record as stored, including accumulated log lines
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub job_id: String,
    #[schema(example = "Wireless Mouse")]
    pub product_name: String,
    pub max_products: i32,
    pub max_pages: i32,
    #[schema(example = "running")]
    pub status: String,
    /// Last reported progress snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    /// Result summary, present once the job completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    /// Failure description, present when the job failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Log lines in arrival order across all channels
    pub logs: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl JobRecord {
    fn from_parts(model: job::Model, logs: Vec<job_log::Model>) -> Self {
        Self {
            job_id: model.id.to_string(),
            product_name: model.product_name,
            max_products: model.max_products,
            max_pages: model.max_pages,
            status: model.status,
            progress: model.progress,
            results: model.results,
            error: model.error,
            logs: logs.into_iter().map(|l| l.line).collect(),
            created_at: model.created_at.to_rfc3339(),
            updated_at: model.updated_at.to_rfc3339(),
            completed_at: model.completed_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// Parses a path-supplied job id, rejecting non-UUID values before any
/// store access.
pub(crate) fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| validation_error("Invalid job id", json!({"jobId": "Must be a valid UUID"})))
}

/// Start a scrape job: persist it as pending, then launch its worker
#[utoipa::path(
    post,
    path = "/api/jobs",
    request_body = StartJobRequest,
    responses(
        (status = 201, description = "Job created and worker launched", body = StartJobResponse),
        (status = 400, description = "Invalid request payload", body = ApiError),
        (status = 409, description = "Job id already in use", body = ApiError),
        (status = 500, description = "Worker could not be launched", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn start_job(
    State(state): State<AppState>,
    payload: Result<Json<StartJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartJobResponse>), ApiError> {
    let Json(payload) = payload?;

    let product_name = match payload.product_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            return Err(validation_error(
                "Invalid productName",
                json!({"productName": "productName is required and must be a non-empty string"}),
            ));
        }
    };

    let max_products = payload.max_products.unwrap_or(DEFAULT_MAX_PRODUCTS);
    if max_products <= 0 {
        return Err(validation_error(
            "Invalid maxProducts",
            json!({"maxProducts": "maxProducts must be a positive integer"}),
        ));
    }

    let max_pages = payload.max_pages.unwrap_or(DEFAULT_MAX_PAGES);
    if max_pages <= 0 {
        return Err(validation_error(
            "Invalid maxPages",
            json!({"maxPages": "maxPages must be a positive integer"}),
        ));
    }

    let repo = JobRepository::new(state.db.clone(), state.config.max_log_lines);
    let record = repo
        .create(&product_name, max_products, max_pages)
        .await
        .map_err(|err| {
            if let Some(db_err) = err.downcast_ref::<sea_orm::DbErr>()
                && is_unique_violation(db_err)
            {
                return conflict("Job id collided with an existing job, retry the request");
            }
            ApiError::from(err)
        })?;

    let response = StartJobResponse {
        job_id: record.id.to_string(),
        status: record.status.clone(),
    };

    match state.supervisor.spawn(&record).await {
        Ok(()) => Ok((StatusCode::CREATED, Json(response))),
        Err(SpawnError::AlreadyRegistered(id)) => Err(conflict(&format!(
            "A worker is already registered for job {}",
            id
        ))),
        Err(SpawnError::Launch(err)) => Err(spawn_error(&format!(
            "Failed to launch worker: {}",
            err
        ))
        .with_details(json!({"jobId": record.id.to_string()}))),
        Err(SpawnError::Storage(err)) => Err(ApiError::from(err)),
    }
}

/// List all jobs, most recently created first
#[utoipa::path(
    get,
    path = "/api/jobs",
    responses(
        (status = 200, description = "All job records with their logs", body = Vec<JobRecord>),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobRecord>>, ApiError> {
    let repo = JobRepository::new(state.db.clone(), state.config.max_log_lines);
    let jobs = repo.list_with_logs().await?;

    Ok(Json(
        jobs.into_iter()
            .map(|(model, logs)| JobRecord::from_parts(model, logs))
            .collect(),
    ))
}

/// Fetch one job with its accumulated logs
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    params(("id" = String, Path, description = "Job id (UUID)")),
    responses(
        (status = 200, description = "The job record", body = JobRecord),
        (status = 400, description = "Malformed job id", body = ApiError),
        (status = 404, description = "No job with this id", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job_id = parse_job_id(&id)?;

    let repo = JobRepository::new(state.db.clone(), state.config.max_log_lines);
    let model = repo
        .find(job_id)
        .await?
        .ok_or_else(|| not_found(&format!("Job {} not found", job_id)))?;
    let logs = repo.logs_for(job_id).await?;

    Ok(Json(JobRecord::from_parts(model, logs)))
}

/// Stop a running job and kill its worker process
#[utoipa::path(
    post,
    path = "/api/jobs/{id}/stop",
    params(("id" = String, Path, description = "Job id (UUID)")),
    responses(
        (status = 200, description = "Job stopped", body = StopJobResponse),
        (status = 400, description = "Malformed job id", body = ApiError),
        (status = 404, description = "No job with this id", body = ApiError),
        (status = 409, description = "Job is not in a stoppable state", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn stop_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StopJobResponse>, ApiError> {
    let job_id = parse_job_id(&id)?;

    match state.supervisor.stop(job_id).await? {
        TransitionOutcome::Applied(model) => Ok(Json(StopJobResponse {
            success: true,
            status: model.status,
        })),
        TransitionOutcome::Rejected { current } => Err(conflict(&format!(
            "Job cannot be stopped from status '{}'",
            current
        ))),
        TransitionOutcome::NotFound => Err(not_found(&format!("Job {} not found", job_id))),
    }
}
