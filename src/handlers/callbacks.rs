//! # Worker Callback Handlers
//!
//! This module contains the HTTP side-channel the worker reports through
//! while its stdout and stderr are captured by the supervisor. Callbacks
//! are authenticated with the shared `X-Scraper-Secret` header when a
//! secret is configured; without one they are open, which is the local
//! development mode.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::HeaderMap,
    response::Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::error::{ApiError, conflict, not_found, unauthorized, validation_error};
use crate::handlers::jobs::parse_job_id;
use crate::models::job::{JobStatus, ProgressSnapshot};
use crate::models::job_log::LogSource;
use crate::repositories::{JobRepository, TransitionOutcome};
use crate::server::AppState;

/// Status report pushed by the worker
#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusCallback {
    /// Lifecycle status the worker wants the job moved to
    #[schema(example = "running")]
    pub status: String,
    /// Human-readable detail, appended to the job's logs
    #[serde(default)]
    pub message: Option<String>,
    /// Failure description, stored on the job when status is `failed`
    #[serde(default)]
    pub error: Option<String>,
}

/// Progress report pushed by the worker, last write wins
#[derive(Debug, Deserialize, ToSchema)]
pub struct ProgressCallback {
    pub progress: ProgressSnapshot,
}

/// One log line pushed by the worker
#[derive(Debug, Deserialize, ToSchema)]
pub struct LogCallback {
    #[schema(example = "Scraping page 1 of 3")]
    pub log: String,
}

/// Acknowledgement returned for accepted callbacks
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CallbackAck {
    pub success: bool,
}

/// Checks the shared callback secret in constant time.
///
/// No configured secret means callbacks are unauthenticated.
pub(crate) fn verify_callback_secret(
    config: &AppConfig,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected) = config.scraper_secret.as_deref() else {
        return Ok(());
    };

    let Some(presented) = headers
        .get("x-scraper-secret")
        .and_then(|value| value.to_str().ok())
    else {
        counter!("callback_auth_rejections_total").increment(1);
        return Err(unauthorized(Some("Missing X-Scraper-Secret header")));
    };

    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        counter!("callback_auth_rejections_total").increment(1);
        return Err(unauthorized(Some("Invalid callback secret")));
    }

    Ok(())
}

/// Apply a worker-reported status transition
#[utoipa::path(
    post,
    path = "/api/jobs/{id}/status",
    params(("id" = String, Path, description = "Job id (UUID)")),
    request_body = StatusCallback,
    responses(
        (status = 200, description = "Transition applied", body = CallbackAck),
        (status = 400, description = "Malformed id, body or status", body = ApiError),
        (status = 401, description = "Missing or invalid callback secret", body = ApiError),
        (status = 404, description = "No job with this id", body = ApiError),
        (status = 409, description = "Transition not permitted", body = ApiError)
    ),
    tag = "callbacks"
)]
pub async fn status_callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<StatusCallback>, JsonRejection>,
) -> Result<Json<CallbackAck>, ApiError> {
    verify_callback_secret(&state.config, &headers)?;
    let job_id = parse_job_id(&id)?;
    let Json(payload) = payload?;

    let next = payload.status.parse::<JobStatus>().map_err(|_| {
        validation_error(
            "Invalid status",
            json!({"status": "Must be one of: pending, running, completed, failed, stopped"}),
        )
    })?;

    let repo = JobRepository::new(state.db.clone(), state.config.max_log_lines);
    match repo
        .apply_status(
            job_id,
            next,
            payload.message.as_deref(),
            payload.error.as_deref(),
        )
        .await?
    {
        TransitionOutcome::Applied(_) => Ok(Json(CallbackAck { success: true })),
        TransitionOutcome::Rejected { current } => Err(conflict(&format!(
            "Cannot transition job from '{}' to '{}'",
            current, next
        ))),
        TransitionOutcome::NotFound => Err(not_found(&format!("Job {} not found", job_id))),
    }
}

/// Replace a job's progress snapshot
#[utoipa::path(
    post,
    path = "/api/jobs/{id}/progress",
    params(("id" = String, Path, description = "Job id (UUID)")),
    request_body = ProgressCallback,
    responses(
        (status = 200, description = "Snapshot recorded", body = CallbackAck),
        (status = 400, description = "Malformed id or body", body = ApiError),
        (status = 401, description = "Missing or invalid callback secret", body = ApiError),
        (status = 404, description = "No job with this id", body = ApiError),
        (status = 409, description = "Job already finished", body = ApiError)
    ),
    tag = "callbacks"
)]
pub async fn progress_callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<ProgressCallback>, JsonRejection>,
) -> Result<Json<CallbackAck>, ApiError> {
    verify_callback_secret(&state.config, &headers)?;
    let job_id = parse_job_id(&id)?;
    let Json(payload) = payload?;

    let repo = JobRepository::new(state.db.clone(), state.config.max_log_lines);
    match repo.apply_progress(job_id, &payload.progress).await? {
        TransitionOutcome::Applied(_) => Ok(Json(CallbackAck { success: true })),
        TransitionOutcome::Rejected { current } => Err(conflict(&format!(
            "Cannot record progress for job in status '{}'",
            current
        ))),
        TransitionOutcome::NotFound => Err(not_found(&format!("Job {} not found", job_id))),
    }
}

/// Append one worker-pushed log line
#[utoipa::path(
    post,
    path = "/api/jobs/{id}/logs",
    params(("id" = String, Path, description = "Job id (UUID)")),
    request_body = LogCallback,
    responses(
        (status = 200, description = "Line appended", body = CallbackAck),
        (status = 400, description = "Malformed id or body", body = ApiError),
        (status = 401, description = "Missing or invalid callback secret", body = ApiError),
        (status = 404, description = "No job with this id", body = ApiError)
    ),
    tag = "callbacks"
)]
pub async fn log_callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<LogCallback>, JsonRejection>,
) -> Result<Json<CallbackAck>, ApiError> {
    verify_callback_secret(&state.config, &headers)?;
    let job_id = parse_job_id(&id)?;
    let Json(payload) = payload?;

    // Log lines are accepted in any lifecycle state, including after the
    // job finished; late worker output is still worth keeping.
    let repo = JobRepository::new(state.db.clone(), state.config.max_log_lines);
    if repo.find(job_id).await?.is_none() {
        return Err(not_found(&format!("Job {} not found", job_id)));
    }
    repo.append_log(job_id, LogSource::Callback, &payload.log)
        .await?;

    Ok(Json(CallbackAck { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{post_json, read_json, setup_test_app, setup_test_app_with_secret};
    use crate::server::{AppState, create_app};
    use axum::{
        body::Body,
        http::{Request, StatusCode, header},
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    fn post_json_with_secret(
        uri: &str,
        body: serde_json::Value,
        secret: Option<&str>,
    ) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(secret) = secret {
            builder = builder.header("X-Scraper-Secret", secret);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn seed_job(state: &AppState) -> (JobRepository, Uuid) {
        let repo = JobRepository::new(state.db.clone(), 0);
        let job = repo.create("laptop", 5, 1).await.unwrap();
        (repo, job.id)
    }

    #[tokio::test]
    async fn status_callbacks_walk_the_lifecycle() {
        let (state, _dir) = setup_test_app().await;
        let app = create_app(state.clone());
        let (repo, job_id) = seed_job(&state).await;

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/jobs/{}/status", job_id),
                serde_json::json!({"status": "running", "message": "worker ready"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack: CallbackAck = read_json(response).await;
        assert!(ack.success);

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/jobs/{}/status", job_id),
                serde_json::json!({"status": "completed", "message": "scrape finished"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let record = repo.find(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, "completed");
        assert!(record.completed_at.is_some());

        let lines = repo.logs_for(job_id).await.unwrap();
        assert_eq!(lines[0].line, "Status changed to running: worker ready");
        assert_eq!(lines[1].line, "Status changed to completed: scrape finished");
    }

    #[tokio::test]
    async fn failure_callback_stores_the_error() {
        let (state, _dir) = setup_test_app().await;
        let app = create_app(state.clone());
        let (repo, job_id) = seed_job(&state).await;

        let response = app
            .oneshot(post_json(
                &format!("/api/jobs/{}/status", job_id),
                serde_json::json!({"status": "failed", "error": "captcha wall"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let record = repo.find(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, "failed");
        assert_eq!(record.error.as_deref(), Some("captcha wall"));
    }

    #[tokio::test]
    async fn terminal_jobs_reject_status_callbacks() {
        let (state, _dir) = setup_test_app().await;
        let app = create_app(state.clone());
        let (repo, job_id) = seed_job(&state).await;
        repo.apply_status(job_id, JobStatus::Failed, None, Some("boom"))
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(
                &format!("/api/jobs/{}/status", job_id),
                serde_json::json!({"status": "running"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let record = repo.find(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, "failed");
    }

    #[tokio::test]
    async fn unknown_status_values_are_rejected() {
        let (state, _dir) = setup_test_app().await;
        let app = create_app(state.clone());
        let (_repo, job_id) = seed_job(&state).await;

        let response = app
            .oneshot(post_json(
                &format!("/api/jobs/{}/status", job_id),
                serde_json::json!({"status": "paused"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let error: serde_json::Value = read_json(response).await;
        assert_eq!(error["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn callbacks_for_unknown_jobs_return_404() {
        let (state, _dir) = setup_test_app().await;
        let app = create_app(state);
        let missing = Uuid::new_v4();

        for (path, body) in [
            ("status", serde_json::json!({"status": "running"})),
            ("progress", serde_json::json!({"progress": {"percentage": 10.0}})),
            ("logs", serde_json::json!({"log": "hello"})),
        ] {
            let response = app
                .clone()
                .oneshot(post_json(&format!("/api/jobs/{}/{}", missing, path), body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "path: {}", path);
        }
    }

    #[tokio::test]
    async fn progress_reports_are_last_write_wins() {
        let (state, _dir) = setup_test_app().await;
        let app = create_app(state.clone());
        let (repo, job_id) = seed_job(&state).await;
        repo.apply_status(job_id, JobStatus::Running, None, None)
            .await
            .unwrap();

        for (product, percentage) in [(2, 20.0), (7, 70.0)] {
            let response = app
                .clone()
                .oneshot(post_json(
                    &format!("/api/jobs/{}/progress", job_id),
                    serde_json::json!({"progress": {
                        "currentPage": 1,
                        "currentProduct": product,
                        "totalProducts": 10,
                        "percentage": percentage,
                    }}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let record = repo.find(job_id).await.unwrap().unwrap();
        let stored: ProgressSnapshot =
            serde_json::from_value(record.progress.unwrap()).unwrap();
        assert_eq!(stored.current_product, 7);
        assert_eq!(stored.percentage, 70.0);

        let lines = repo.logs_for(job_id).await.unwrap();
        let progress_lines: Vec<_> = lines
            .iter()
            .filter(|l| l.line.starts_with("Progress:"))
            .collect();
        assert_eq!(progress_lines.len(), 2);
    }

    #[tokio::test]
    async fn log_callbacks_append_with_callback_source() {
        let (state, _dir) = setup_test_app().await;
        let app = create_app(state.clone());
        let (repo, job_id) = seed_job(&state).await;

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/jobs/{}/logs", job_id),
                serde_json::json!({"log": "Scraping page 1 of 3"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Late lines after the job finished are still kept.
        repo.apply_status(job_id, JobStatus::Failed, None, Some("boom"))
            .await
            .unwrap();
        let response = app
            .oneshot(post_json(
                &format!("/api/jobs/{}/logs", job_id),
                serde_json::json!({"log": "flushing buffers"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let lines = repo.logs_for(job_id).await.unwrap();
        let callback_lines: Vec<_> = lines
            .iter()
            .filter(|l| l.source == "callback")
            .map(|l| l.line.as_str())
            .collect();
        assert_eq!(callback_lines, vec!["Scraping page 1 of 3", "flushing buffers"]);
    }

    #[tokio::test]
    async fn configured_secret_gates_every_callback() {
        let (state, _dir) = setup_test_app_with_secret(Some("cb-secret")).await;
        let app = create_app(state.clone());
        let (repo, job_id) = seed_job(&state).await;
        let uri = format!("/api/jobs/{}/status", job_id);
        let body = serde_json::json!({"status": "running"});

        let response = app
            .clone()
            .oneshot(post_json_with_secret(&uri, body.clone(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(post_json_with_secret(&uri, body.clone(), Some("wrong")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let error: serde_json::Value = read_json(response).await;
        assert_eq!(error["code"], "UNAUTHORIZED");

        // Rejected callbacks must not have touched the record.
        let record = repo.find(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, "pending");

        let response = app
            .oneshot(post_json_with_secret(&uri, body, Some("cb-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
