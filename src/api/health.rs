// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::storage::JobSummary;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    jobs: JobSummary,
}

#[utoipa::path(get, path = "/health", tag = "Health", responses((status = 200)))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Ready when the ledger answers queries.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Health",
    responses((status = 200), (status = 503))
)]
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    match state.ledger.job_summary() {
        Ok(jobs) => Ok(Json(ReadyResponse {
            status: "ready",
            jobs,
        })),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testsupport::state_from;
    use super::*;
    use crate::workers::testutil::harness;

    #[tokio::test]
    async fn health_is_always_ok() {
        let Json(response) = health().await;
        assert_eq!(response.status, "ok");
    }

    #[tokio::test]
    async fn ready_reports_job_counts() {
        let h = harness();
        let Json(response) = ready(State(state_from(&h))).await.unwrap();
        assert_eq!(response.status, "ready");
        assert_eq!(response.jobs.total, 0);
    }
}
