use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::job::{Job, JobStatus};
use crate::models::request::{ErrorResponse, GenerateRequest, GenerateResponse};
use crate::services::coordinator::{SubmitError, SubmitRequest};
use crate::services::identity::{self, IdentityError, AUTHORIZER_HEADER};
use crate::services::storage::ObjectRef;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get(AUTHORIZER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(IdentityError::Missing);

    raw.and_then(identity::extract_owner_id).map_err(|e| {
        tracing::warn!(error = %e, "Caller identity not resolved");
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new("Unauthorized: User ID not found")),
        )
    })
}

fn bad_request(error: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(error)))
}

fn submit_error_response(e: SubmitError) -> ApiError {
    let status = e.status_code();
    let body = match &e {
        SubmitError::QuotaExceeded { .. } => ErrorResponse {
            remaining_quota: Some(0),
            message: Some(
                "You have reached your daily limit. Please try again tomorrow.".to_string(),
            ),
            ..ErrorResponse::new("Daily quota exceeded")
        },
        SubmitError::Publish { job_id, .. } => ErrorResponse {
            job_id: Some(job_id.clone()),
            ..ErrorResponse::new(e.to_string())
        },
        SubmitError::Store(_) | SubmitError::Storage(_) => {
            tracing::error!(error = %e, "Submission failed");
            ErrorResponse::new("Internal server error")
        }
        SubmitError::Validation(_) | SubmitError::InputNotFound(_) => {
            ErrorResponse::new(e.to_string())
        }
    };
    (status, Json(body))
}

/// POST /api/v1/generate: Submit an uploaded image for generation.
pub async fn submit_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let owner_id = caller(&headers)?;

    let Json(request) = body.map_err(|rejection| {
        tracing::warn!(owner_id = %owner_id, error = %rejection, "Invalid request body");
        bad_request("Invalid request body")
    })?;

    if let Err(report) = request.validate() {
        tracing::warn!(owner_id = %owner_id, file_key = %request.file_key, error = %report, "Validation failed");
        return Err(bad_request(report.to_string()));
    }

    let input = ObjectRef::new(&state.upload_bucket, &request.file_key);
    let submission = state
        .coordinator
        .submit(SubmitRequest {
            owner_id,
            input_ref: input.to_string(),
            prompt: request.prompt,
            style: request.style,
            connection_id: request.connection_id,
        })
        .await
        .map_err(submit_error_response)?;

    Ok(Json(GenerateResponse {
        job_id: submission.job_id,
        status: JobStatus::Queued,
        remaining_quota: submission.remaining_quota,
        message: "Image generation request has been queued successfully".to_string(),
    }))
}

/// GET /api/v1/jobs/{job_id}: Current state of one of the caller's jobs.
pub async fn get_job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let owner_id = caller(&headers)?;

    let job = state.jobs.get(&job_id).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Job lookup failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("Internal server error")),
        )
    })?;

    let Some(job) = job else {
        return Err((StatusCode::NOT_FOUND, Json(ErrorResponse::new("Job not found"))));
    };

    if job.owner_id != owner_id {
        tracing::warn!(job_id = %job_id, owner_id = %owner_id, job_owner = %job.owner_id, "Job access denied");
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("Forbidden: Access denied")),
        ));
    }

    Ok(Json(job))
}
