// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Gas top-up: send native currency from the funding wallet to custodied
//! wallets that cannot pay for their own transfers.
//!
//! Top-ups do not take the target's wallet lock. The transfer only moves
//! funds into the wallet and touches no key material, and the wallets that
//! need gas most are exactly the ones wedged mid-job waiting for it.

use tracing::{info, warn};

use crate::storage::{Job, WalletRecord};

use super::{WorkerContext, WorkerError};

pub(super) async fn execute(
    ctx: &WorkerContext,
    job: &Job,
) -> Result<serde_json::Value, WorkerError> {
    let funding = ctx.funding_wallet()?;
    let mut funding_balance = ctx.chain.native_balance(&funding.address).await?;

    let targets: Vec<WalletRecord> = match &job.wallet_address {
        Some(address) => vec![ctx.ledger.require_wallet(address)?],
        None => ctx.ledger.wallets_needing_gas()?,
    };

    let topup = ctx.config.gas_topup_amount;
    let mut topped_up = 0u32;
    let mut skipped = 0u32;
    let mut errors: Vec<String> = Vec::new();
    let mut last_transient: Option<WorkerError> = None;

    for wallet in &targets {
        let current = ctx.chain.native_balance(&wallet.address).await?;
        if current >= ctx.config.min_gas_balance {
            // Flag is stale; the wallet can already pay its way.
            ctx.ledger
                .with_wallet_mut(&wallet.address, |w| {
                    w.needs_gas = false;
                    w.set_native_balance(current);
                })?;
            skipped += 1;
            continue;
        }

        // An empty funding wallet is an operator problem, not a retry.
        if funding_balance < topup {
            return Err(WorkerError::InsufficientFunds {
                needed: topup,
                available: funding_balance,
            });
        }

        match ctx
            .chain
            .send_native(funding.signer.clone(), &wallet.address, topup)
            .await
        {
            Ok(tx_id) => {
                ctx.ledger.record_broadcast(&job.id, &tx_id)?;
                funding_balance -= topup;
                ctx.ledger.with_wallet_mut(&wallet.address, |w| {
                    w.needs_gas = false;
                    w.set_native_balance(current + topup);
                })?;
                topped_up += 1;
                info!(wallet = %wallet.address, amount = %topup, "topped up gas");
            }
            Err(e) => {
                warn!(wallet = %wallet.address, error = %e, "gas top-up failed");
                errors.push(format!("{}: {e}", wallet.address));
                if e.is_transient() {
                    last_transient = Some(e.into());
                }
            }
        }
    }

    if topped_up == 0 && skipped == 0 {
        if let Some(e) = last_transient {
            return Err(e);
        }
    }

    Ok(serde_json::json!({
        "topped_up": topped_up,
        "skipped": skipped,
        "funding_balance": funding_balance.to_string(),
        "errors": errors,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::run_job;
    use crate::storage::{JobStatus, JobType, NewJob};
    use alloy::primitives::U256;

    const FUNDING: u64 = 1_000_000_000_000_000_000; // 1 native
    const TOPUP: u64 = 50_000_000_000_000_000; // 0.05 native, the default

    fn global_topup() -> NewJob {
        NewJob {
            job_type: JobType::GasTopup,
            wallet_address: None,
            user_id: None,
            payload: serde_json::json!({}),
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn tops_up_every_flagged_wallet() {
        let h = harness();
        let funding = h.ctx.funding_wallet().unwrap();
        h.chain.set_native_balance(&funding.address, U256::from(FUNDING));

        let a = create_user_wallet(&h.ctx, "alice");
        let b = create_user_wallet(&h.ctx, "bob");
        for wallet in [&a, &b] {
            h.ctx
                .ledger
                .with_wallet_mut(&wallet.address, |w| w.needs_gas = true)
                .unwrap();
        }

        h.ctx.ledger.enqueue(global_topup()).unwrap();
        let job = h.ctx.ledger.claim_next(JobType::GasTopup).unwrap().unwrap();
        run_job(&h.ctx, job.clone()).await;

        let done = h.ctx.ledger.require_job(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap()["topped_up"], 2);

        for wallet in [&a, &b] {
            assert!(!h.ctx.ledger.require_wallet(&wallet.address).unwrap().needs_gas);
            assert_eq!(
                h.ctx.chain.native_balance(&wallet.address).await.unwrap(),
                U256::from(TOPUP)
            );
        }
        assert_eq!(
            h.ctx.chain.native_balance(&funding.address).await.unwrap(),
            U256::from(FUNDING - 2 * TOPUP)
        );
    }

    #[tokio::test]
    async fn busy_wallets_still_receive_gas() {
        let h = harness();
        let funding = h.ctx.funding_wallet().unwrap();
        h.chain.set_native_balance(&funding.address, U256::from(FUNDING));

        // Wedged mid-withdrawal, waiting for gas.
        let wallet = create_user_wallet(&h.ctx, "alice");
        h.ctx
            .ledger
            .with_wallet_mut(&wallet.address, |w| {
                w.needs_gas = true;
                w.is_processing = true;
            })
            .unwrap();

        h.ctx.ledger.enqueue(global_topup()).unwrap();
        let job = h.ctx.ledger.claim_next(JobType::GasTopup).unwrap().unwrap();
        run_job(&h.ctx, job).await;

        let reloaded = h.ctx.ledger.require_wallet(&wallet.address).unwrap();
        assert!(!reloaded.needs_gas);
        assert_eq!(
            h.ctx.chain.native_balance(&wallet.address).await.unwrap(),
            U256::from(TOPUP)
        );
    }

    #[tokio::test]
    async fn stale_flag_is_cleared_without_sending() {
        let h = harness();
        let funding = h.ctx.funding_wallet().unwrap();
        h.chain.set_native_balance(&funding.address, U256::from(FUNDING));

        let wallet = create_user_wallet(&h.ctx, "alice");
        // Already above the minimum.
        h.chain
            .set_native_balance(&wallet.address, U256::from(FUNDING));
        h.ctx
            .ledger
            .with_wallet_mut(&wallet.address, |w| w.needs_gas = true)
            .unwrap();

        h.ctx.ledger.enqueue(global_topup()).unwrap();
        let job = h.ctx.ledger.claim_next(JobType::GasTopup).unwrap().unwrap();
        run_job(&h.ctx, job.clone()).await;

        let done = h.ctx.ledger.require_job(&job.id).unwrap();
        assert_eq!(done.result.unwrap()["skipped"], 1);
        assert!(!h.ctx.ledger.require_wallet(&wallet.address).unwrap().needs_gas);
        assert!(h.chain.sent().is_empty());
    }

    #[tokio::test]
    async fn dry_funding_wallet_is_fatal() {
        let h = harness();
        // Funding wallet never seeded.
        let wallet = create_user_wallet(&h.ctx, "alice");
        h.ctx
            .ledger
            .with_wallet_mut(&wallet.address, |w| w.needs_gas = true)
            .unwrap();

        h.ctx.ledger.enqueue(global_topup()).unwrap();
        let job = h.ctx.ledger.claim_next(JobType::GasTopup).unwrap().unwrap();
        run_job(&h.ctx, job.clone()).await;

        let failed = h.ctx.ledger.require_job(&job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(failed.error_message.unwrap().contains("insufficient funds"));
        // The flag survives for the next run after refunding.
        assert!(h.ctx.ledger.require_wallet(&wallet.address).unwrap().needs_gas);
    }
}
