// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{extract::State, Json};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetProcessingResponse {
    /// Wallets whose `is_processing` flag was cleared.
    pub cleared: usize,
}

/// Clear every wallet lock. Operator recovery after a bad crash; running
/// this while workers are live can let jobs interleave on a wallet.
#[utoipa::path(
    post,
    path = "/v1/admin/reset-processing",
    tag = "Admin",
    responses((status = 200, body = ResetProcessingResponse))
)]
pub async fn reset_processing(
    State(state): State<AppState>,
) -> Result<Json<ResetProcessingResponse>, ApiError> {
    let cleared = state.ledger.reset_processing_flags()?;
    if cleared > 0 {
        warn!(cleared, "operator cleared wallet processing flags");
    }
    Ok(Json(ResetProcessingResponse { cleared }))
}
