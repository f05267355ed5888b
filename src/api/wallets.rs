// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::WalletRecord;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateWalletRequest {
    pub user_id: String,
}

/// Wallet row without the encrypted entropy blob.
#[derive(Debug, Serialize, ToSchema)]
pub struct WalletResponse {
    pub address: String,
    pub user_id: String,
    pub derivation_index: u32,
    pub derivation_path: String,
    pub token_balance: String,
    pub native_balance: String,
    pub needs_consolidation: bool,
    pub needs_gas: bool,
    pub is_processing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WalletRecord> for WalletResponse {
    fn from(w: WalletRecord) -> Self {
        Self {
            address: w.address,
            user_id: w.user_id,
            derivation_index: w.derivation_index,
            derivation_path: w.derivation_path,
            token_balance: w.token_balance,
            native_balance: w.native_balance,
            needs_consolidation: w.needs_consolidation,
            needs_gas: w.needs_gas,
            is_processing: w.is_processing,
            created_at: w.created_at,
            updated_at: w.updated_at,
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/wallets",
    request_body = CreateWalletRequest,
    tag = "Wallets",
    responses(
        (status = 201, body = WalletResponse),
        (status = 200, body = WalletResponse, description = "Wallet already existed")
    )
)]
pub async fn create_wallet(
    State(state): State<AppState>,
    Json(request): Json<CreateWalletRequest>,
) -> Result<(StatusCode, Json<WalletResponse>), ApiError> {
    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::bad_request("user_id must not be empty"));
    }

    let (wallet, created) = state.create_wallet(user_id)?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(wallet.into())))
}

#[utoipa::path(
    get,
    path = "/v1/wallets",
    tag = "Wallets",
    responses((status = 200, body = [WalletResponse]))
)]
pub async fn list_wallets(
    State(state): State<AppState>,
) -> Result<Json<Vec<WalletResponse>>, ApiError> {
    let wallets = state.ledger.list_wallets()?;
    Ok(Json(wallets.into_iter().map(Into::into).collect()))
}

#[utoipa::path(
    get,
    path = "/v1/wallets/{address}",
    params(("address" = String, Path, description = "On-chain address")),
    tag = "Wallets",
    responses((status = 200, body = WalletResponse), (status = 404))
)]
pub async fn get_wallet(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<WalletResponse>, ApiError> {
    let wallet = state.ledger.require_wallet(&address)?;
    Ok(Json(wallet.into()))
}

#[utoipa::path(
    get,
    path = "/v1/users/{user_id}/wallet",
    params(("user_id" = String, Path, description = "Owning user")),
    tag = "Wallets",
    responses((status = 200, body = WalletResponse), (status = 404))
)]
pub async fn get_user_wallet(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<WalletResponse>, ApiError> {
    let wallet = state
        .ledger
        .wallet_for_user(&user_id)?
        .ok_or_else(|| ApiError::not_found(format!("no wallet for user {user_id}")))?;
    Ok(Json(wallet.into()))
}
