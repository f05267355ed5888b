// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::{Job, JobFilter, JobStatus, JobSummary, JobType, NewJob};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct EnqueueJobRequest {
    pub job_type: JobType,
    /// Required for withdrawals, optional otherwise. Absent means a global
    /// job over every eligible wallet.
    pub wallet_address: Option<String>,
    pub user_id: Option<String>,
    /// Type-specific parameters.
    #[schema(value_type = Object)]
    pub payload: Option<serde_json::Value>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub wallet_address: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryQuery {
    /// Also zero the retry counter, reviving an exhausted job.
    pub reset: Option<bool>,
}

#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = EnqueueJobRequest,
    tag = "Jobs",
    responses(
        (status = 201, body = Job),
        (status = 200, body = Job, description = "Equivalent global job already active"),
        (status = 409, description = "Wallet already has a job in flight")
    )
)]
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let (job, created) = state.ledger.enqueue(NewJob {
        job_type: request.job_type,
        wallet_address: request.wallet_address,
        user_id: request.user_id,
        payload: request.payload.unwrap_or_else(|| serde_json::json!({})),
        max_retries: request.max_retries,
    })?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(job)))
}

#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(
        ("status" = Option<JobStatus>, Query, description = "Filter by status"),
        ("job_type" = Option<JobType>, Query, description = "Filter by type"),
        ("wallet_address" = Option<String>, Query, description = "Filter by wallet"),
        ("limit" = Option<usize>, Query, description = "Page size, default 50"),
        ("offset" = Option<usize>, Query, description = "Page offset")
    ),
    tag = "Jobs",
    responses((status = 200, body = [Job]))
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state.ledger.list_jobs(&JobFilter {
        status: query.status,
        job_type: query.job_type,
        wallet_address: query.wallet_address,
        limit: query.limit,
        offset: query.offset,
    })?;
    Ok(Json(jobs))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/summary",
    tag = "Jobs",
    responses((status = 200, body = JobSummary))
)]
pub async fn job_summary(State(state): State<AppState>) -> Result<Json<JobSummary>, ApiError> {
    Ok(Json(state.ledger.job_summary()?))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job id")),
    tag = "Jobs",
    responses((status = 200, body = Job), (status = 404))
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.ledger.require_job(&job_id)?))
}

#[utoipa::path(
    post,
    path = "/v1/jobs/{job_id}/cancel",
    params(("job_id" = String, Path, description = "Job id")),
    tag = "Jobs",
    responses((status = 200, body = Job), (status = 404), (status = 409))
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.ledger.cancel(&job_id)?))
}

#[utoipa::path(
    post,
    path = "/v1/jobs/{job_id}/retry",
    params(
        ("job_id" = String, Path, description = "Job id"),
        ("reset" = Option<bool>, Query, description = "Also zero the retry counter")
    ),
    tag = "Jobs",
    responses((status = 200, body = Job), (status = 404), (status = 409))
)]
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<RetryQuery>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(
        state.ledger.retry(&job_id, query.reset.unwrap_or(false))?,
    ))
}
