// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HTTP surface: wallet provisioning, withdrawal submission, job dispatch
//! and inspection, admin recovery, health probes.
//!
//! Handlers are thin: validate, call the ledger, map [`LedgerError`] onto
//! HTTP statuses through [`ApiError`]. No handler talks to the chain; that
//! is worker territory.
//!
//! [`LedgerError`]: crate::storage::LedgerError
//! [`ApiError`]: crate::error::ApiError

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::AppState;
use crate::storage::{Job, JobStatus, JobSummary, JobType, WithdrawalRecord, WithdrawalStatus};

pub mod admin;
pub mod health;
pub mod jobs;
pub mod wallets;
pub mod withdrawals;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route(
            "/wallets",
            get(wallets::list_wallets).post(wallets::create_wallet),
        )
        .route("/wallets/{address}", get(wallets::get_wallet))
        .route("/users/{user_id}/wallet", get(wallets::get_user_wallet))
        .route(
            "/withdrawals",
            get(withdrawals::list_withdrawals).post(withdrawals::submit_withdrawal),
        )
        .route("/withdrawals/{withdrawal_id}", get(withdrawals::get_withdrawal))
        .route("/jobs", get(jobs::list_jobs).post(jobs::enqueue_job))
        .route("/jobs/summary", get(jobs::job_summary))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route("/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{job_id}/retry", post(jobs::retry_job))
        .route("/admin/reset-processing", post(admin::reset_processing))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .with_state(state)
        .nest("/v1", v1_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        wallets::create_wallet,
        wallets::list_wallets,
        wallets::get_wallet,
        wallets::get_user_wallet,
        withdrawals::submit_withdrawal,
        withdrawals::list_withdrawals,
        withdrawals::get_withdrawal,
        jobs::enqueue_job,
        jobs::list_jobs,
        jobs::job_summary,
        jobs::get_job,
        jobs::cancel_job,
        jobs::retry_job,
        admin::reset_processing,
        health::health,
        health::ready
    ),
    components(
        schemas(
            wallets::CreateWalletRequest,
            wallets::WalletResponse,
            withdrawals::SubmitWithdrawalRequest,
            withdrawals::SubmitWithdrawalResponse,
            jobs::EnqueueJobRequest,
            admin::ResetProcessingResponse,
            Job,
            JobStatus,
            JobType,
            JobSummary,
            WithdrawalRecord,
            WithdrawalStatus
        )
    ),
    tags(
        (name = "Wallets", description = "Custodied wallet provisioning and inspection"),
        (name = "Withdrawals", description = "User withdrawal requests"),
        (name = "Jobs", description = "Job dispatch and lifecycle"),
        (name = "Admin", description = "Operator recovery actions"),
        (name = "Health", description = "Liveness and readiness probes")
    )
)]
struct ApiDoc;

#[cfg(test)]
pub(super) mod testsupport {
    use super::*;
    use crate::workers::testutil::TestHarness;
    use std::sync::Arc;

    pub fn state_from(h: &TestHarness) -> AppState {
        AppState {
            ledger: Arc::clone(&h.ctx.ledger),
            chain: Arc::clone(&h.ctx.chain),
            deriver: Arc::clone(&h.ctx.deriver),
            vault: Arc::clone(&h.ctx.vault),
            config: Arc::clone(&h.ctx.config),
        }
    }
}
