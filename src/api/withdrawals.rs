// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use alloy::primitives::U256;

use crate::chain::parse_amount;
use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::WithdrawalRecord;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SubmitWithdrawalRequest {
    pub user_id: String,
    pub to_address: String,
    /// Human-readable token amount, e.g. `"12.5"`.
    pub amount: String,
    /// Platform fee in the same units as `amount`. Defaults to zero.
    pub fee: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitWithdrawalResponse {
    pub withdrawal: WithdrawalRecord,
    /// Job executing this withdrawal.
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalListQuery {
    pub user_id: Option<String>,
}

#[utoipa::path(
    post,
    path = "/v1/withdrawals",
    request_body = SubmitWithdrawalRequest,
    tag = "Withdrawals",
    responses(
        (status = 202, body = SubmitWithdrawalResponse),
        (status = 400),
        (status = 409, description = "Wallet already has a job in flight")
    )
)]
pub async fn submit_withdrawal(
    State(state): State<AppState>,
    Json(request): Json<SubmitWithdrawalRequest>,
) -> Result<(StatusCode, Json<SubmitWithdrawalResponse>), ApiError> {
    let amount = parse_amount(request.amount.trim(), state.config.token_decimals)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let fee = match request.fee.as_deref() {
        Some(raw) => parse_amount(raw.trim(), state.config.token_decimals)
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
        None => U256::ZERO,
    };

    let (withdrawal, job) = state.ledger.submit_withdrawal(
        request.user_id.trim(),
        &request.to_address,
        amount,
        fee,
    )?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitWithdrawalResponse {
            withdrawal,
            job_id: job.id,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/withdrawals",
    params(("user_id" = Option<String>, Query, description = "Restrict to one user")),
    tag = "Withdrawals",
    responses((status = 200, body = [WithdrawalRecord]))
)]
pub async fn list_withdrawals(
    State(state): State<AppState>,
    Query(query): Query<WithdrawalListQuery>,
) -> Result<Json<Vec<WithdrawalRecord>>, ApiError> {
    let records = state.ledger.list_withdrawals(query.user_id.as_deref())?;
    Ok(Json(records))
}

#[utoipa::path(
    get,
    path = "/v1/withdrawals/{withdrawal_id}",
    params(("withdrawal_id" = String, Path, description = "Withdrawal id")),
    tag = "Withdrawals",
    responses((status = 200, body = WithdrawalRecord), (status = 404))
)]
pub async fn get_withdrawal(
    State(state): State<AppState>,
    Path(withdrawal_id): Path<String>,
) -> Result<Json<WithdrawalRecord>, ApiError> {
    let record = state
        .ledger
        .withdrawal(&withdrawal_id)?
        .ok_or_else(|| ApiError::not_found(format!("withdrawal {withdrawal_id}")))?;
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use super::super::testsupport::state_from;
    use super::*;
    use crate::storage::WithdrawalStatus;
    use crate::workers::testutil::{create_user_wallet, harness};

    const DEST: &str = "0x2222222222222222222222222222222222222222";

    fn request(amount: &str) -> SubmitWithdrawalRequest {
        SubmitWithdrawalRequest {
            user_id: "alice".into(),
            to_address: DEST.into(),
            amount: amount.into(),
            fee: None,
        }
    }

    #[tokio::test]
    async fn submit_parses_human_amounts_into_base_units() {
        let h = harness();
        create_user_wallet(&h.ctx, "alice");
        let state = state_from(&h);

        let (status, Json(response)) =
            submit_withdrawal(State(state.clone()), Json(request("12.5")))
                .await
                .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(response.withdrawal.status, WithdrawalStatus::Pending);
        // 12.5 tokens at 6 decimals, no fee requested
        assert_eq!(response.withdrawal.amount, "12500000");
        assert_eq!(response.withdrawal.fee, "0");
        assert!(!response.job_id.is_empty());

        let Json(fetched) = get_withdrawal(
            State(state),
            Path(response.withdrawal.id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(fetched.id, response.withdrawal.id);
    }

    #[tokio::test]
    async fn submit_rejects_malformed_amounts() {
        let h = harness();
        create_user_wallet(&h.ctx, "alice");
        let state = state_from(&h);

        for bad in ["", "abc", "1.2.3", "1.1234567"] {
            let result = submit_withdrawal(State(state.clone()), Json(request(bad))).await;
            assert_eq!(
                result.unwrap_err().status,
                StatusCode::BAD_REQUEST,
                "amount `{bad}` should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn busy_wallet_surfaces_as_conflict() {
        let h = harness();
        create_user_wallet(&h.ctx, "alice");
        let state = state_from(&h);

        submit_withdrawal(State(state.clone()), Json(request("1")))
            .await
            .unwrap();
        let second = submit_withdrawal(State(state), Json(request("2"))).await;
        assert_eq!(second.unwrap_err().status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn listing_filters_by_user() {
        let h = harness();
        create_user_wallet(&h.ctx, "alice");
        create_user_wallet(&h.ctx, "bob");
        let state = state_from(&h);

        submit_withdrawal(State(state.clone()), Json(request("1")))
            .await
            .unwrap();
        submit_withdrawal(
            State(state.clone()),
            Json(SubmitWithdrawalRequest {
                user_id: "bob".into(),
                to_address: DEST.into(),
                amount: "2".into(),
                fee: Some("0.1".into()),
            }),
        )
        .await
        .unwrap();

        let Json(all) = list_withdrawals(
            State(state.clone()),
            Query(WithdrawalListQuery { user_id: None }),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 2);

        let Json(bobs) = list_withdrawals(
            State(state),
            Query(WithdrawalListQuery {
                user_id: Some("bob".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].user_id, "bob");
        assert_eq!(bobs[0].fee, "100000");
    }
}
