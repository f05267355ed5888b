// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Withdrawal execution: send custodied tokens from a user wallet to an
//! external address.
//!
//! Order of operations around the broadcast is load-bearing: the transaction
//! id is written to the job row before the withdrawal record or job is
//! touched again, so a crash after broadcast leaves a reconcilable trail
//! instead of a double-send risk.

use alloy::primitives::U256;
use tracing::warn;

use crate::storage::{Job, LedgerError, WalletRecord};

use super::{payload_amount, payload_str, WorkerContext, WorkerError};

pub(super) async fn execute(
    ctx: &WorkerContext,
    job: &Job,
) -> Result<serde_json::Value, WorkerError> {
    let withdrawal_id = payload_str(job, "withdrawal_id")?;
    let to_address = payload_str(job, "to_address")?;
    let amount = payload_amount(job, "amount")?;
    let wallet_address = job
        .wallet_address
        .as_deref()
        .ok_or_else(|| WorkerError::MalformedPayload("missing wallet address".to_string()))?;
    let wallet = ctx.ledger.require_wallet(wallet_address)?;

    // A previous attempt may have broadcast before crashing; resolve that
    // transaction instead of sending again.
    if let Some(tx_id) = &job.tx_id {
        return resolve_existing_broadcast(ctx, withdrawal_id, tx_id, amount, &wallet).await;
    }

    let balance = ctx.chain.token_balance(&wallet.address).await?;
    if balance < amount {
        return Err(WorkerError::InsufficientFunds {
            needed: amount,
            available: balance,
        });
    }

    let gas = ctx.chain.native_balance(&wallet.address).await?;
    if gas < ctx.config.min_gas_balance {
        // Flag for the top-up worker, then retry behind backoff.
        ctx.ledger
            .with_wallet_mut(&wallet.address, |w| w.needs_gas = true)?;
        return Err(WorkerError::InsufficientGas(wallet.address.clone()));
    }

    let signer = ctx.wallet_signer(&wallet)?;
    let tx_id = ctx.chain.send_token(signer, to_address, amount).await?;
    ctx.ledger.record_broadcast(&job.id, &tx_id)?;

    finish(ctx, withdrawal_id, &tx_id, amount, &wallet)
}

/// Check the chain for a transaction recorded by an earlier attempt.
async fn resolve_existing_broadcast(
    ctx: &WorkerContext,
    withdrawal_id: &str,
    tx_id: &str,
    amount: U256,
    wallet: &WalletRecord,
) -> Result<serde_json::Value, WorkerError> {
    match ctx.chain.transaction_status(tx_id).await? {
        Some(receipt) if receipt.success => finish(ctx, withdrawal_id, tx_id, amount, wallet),
        Some(_) => Err(WorkerError::TransactionReverted(tx_id.to_string())),
        None => Err(WorkerError::Unconfirmed(tx_id.to_string())),
    }
}

fn finish(
    ctx: &WorkerContext,
    withdrawal_id: &str,
    tx_id: &str,
    amount: U256,
    wallet: &WalletRecord,
) -> Result<serde_json::Value, WorkerError> {
    match ctx.ledger.complete_withdrawal(withdrawal_id, tx_id) {
        Ok(_) => {}
        // Already terminal: a reconciler pass beat this attempt to it.
        Err(LedgerError::InvalidTransition(_)) => {}
        Err(e) => return Err(e.into()),
    }

    ctx.ledger.with_wallet_mut(&wallet.address, |w| {
        let remaining = w.token_balance().saturating_sub(amount);
        w.set_token_balance(remaining);
    })?;

    Ok(serde_json::json!({
        "withdrawal_id": withdrawal_id,
        "tx_id": tx_id,
        "amount": amount.to_string(),
    }))
}

/// Mirror a terminal job failure onto the user-facing withdrawal record.
pub(super) fn mark_withdrawal_failed(ctx: &WorkerContext, job: &Job) {
    let Some(withdrawal_id) = job.payload.get("withdrawal_id").and_then(|v| v.as_str()) else {
        return;
    };
    let reason = job
        .error_message
        .as_deref()
        .unwrap_or("withdrawal job failed");
    if let Err(e) = ctx.ledger.fail_withdrawal(withdrawal_id, reason) {
        warn!(withdrawal_id, error = %e, "could not mark withdrawal failed");
    }
}
