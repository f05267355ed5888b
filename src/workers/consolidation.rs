// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Consolidation: sweep custodied-token balances into the treasury.
//!
//! A scoped job sweeps one wallet; a global job walks every wallet flagged
//! `needs_consolidation`, taking the wallet lock around each sweep and
//! skipping wallets some other job currently holds. The batch is best-effort
//! per wallet: one wallet short on gas or hitting an RPC error does not
//! abort the others, it is recorded in the result.

use alloy::primitives::U256;
use tracing::{info, warn};

use crate::storage::{Job, LedgerError, WalletRecord};

use super::{WorkerContext, WorkerError};

enum SweepOutcome {
    Swept(U256),
    BelowThreshold,
}

pub(super) async fn execute(
    ctx: &WorkerContext,
    job: &Job,
) -> Result<serde_json::Value, WorkerError> {
    // A scoped job already holds its wallet lock from enqueue. The global
    // batch takes the lock per wallet for the duration of its sweep, so a
    // withdrawal landing mid-batch can never sign from the same wallet.
    let scoped = job.wallet_address.is_some();
    let targets: Vec<WalletRecord> = match &job.wallet_address {
        Some(address) => vec![ctx.ledger.require_wallet(address)?],
        None => ctx.ledger.wallets_needing_consolidation()?,
    };

    let mut swept = 0u32;
    let mut busy = 0u32;
    let mut skipped = 0u32;
    let mut short_on_gas = 0u32;
    let mut total = U256::ZERO;
    let mut errors: Vec<String> = Vec::new();
    let mut last_transient: Option<WorkerError> = None;

    for wallet in &targets {
        if !scoped {
            match ctx.ledger.try_lock_wallet(&wallet.address) {
                Ok(_) => {}
                Err(LedgerError::WalletBusy(_)) => {
                    busy += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        let outcome = sweep_wallet(ctx, job, wallet).await;
        if !scoped {
            ctx.ledger.release_wallet(&wallet.address)?;
        }
        match outcome {
            Ok(SweepOutcome::Swept(amount)) => {
                swept += 1;
                total += amount;
                info!(wallet = %wallet.address, amount = %amount, "swept wallet");
            }
            Ok(SweepOutcome::BelowThreshold) => skipped += 1,
            Err(WorkerError::InsufficientGas(_)) => {
                short_on_gas += 1;
                info!(wallet = %wallet.address, "sweep deferred, wallet needs gas");
            }
            Err(e) => {
                warn!(wallet = %wallet.address, error = %e, "sweep failed");
                errors.push(format!("{}: {e}", wallet.address));
                if e.is_transient() {
                    last_transient = Some(e);
                }
            }
        }
    }

    // Nothing moved and nothing was even classified: retry the whole batch.
    if swept == 0 && skipped == 0 && short_on_gas == 0 {
        if let Some(e) = last_transient {
            return Err(e);
        }
    }

    Ok(serde_json::json!({
        "swept": swept,
        "busy": busy,
        "skipped": skipped,
        "insufficient_gas": short_on_gas,
        "total_swept": total.to_string(),
        "errors": errors,
    }))
}

async fn sweep_wallet(
    ctx: &WorkerContext,
    job: &Job,
    wallet: &WalletRecord,
) -> Result<SweepOutcome, WorkerError> {
    let balance = ctx.chain.token_balance(&wallet.address).await?;
    if balance < ctx.config.sweep_threshold {
        // Stale flag from an earlier sync; nothing to sweep.
        ctx.ledger.with_wallet_mut(&wallet.address, |w| {
            w.needs_consolidation = false;
            w.set_token_balance(balance);
        })?;
        return Ok(SweepOutcome::BelowThreshold);
    }

    let gas = ctx.chain.native_balance(&wallet.address).await?;
    if gas < ctx.config.min_gas_balance {
        ctx.ledger
            .with_wallet_mut(&wallet.address, |w| w.needs_gas = true)?;
        return Err(WorkerError::InsufficientGas(wallet.address.clone()));
    }

    let signer = ctx.wallet_signer(wallet)?;
    let tx_id = ctx
        .chain
        .send_token(signer, &ctx.config.treasury_address, balance)
        .await?;
    ctx.ledger.record_broadcast(&job.id, &tx_id)?;

    ctx.ledger.with_wallet_mut(&wallet.address, |w| {
        w.set_token_balance(U256::ZERO);
        w.needs_consolidation = false;
        w.needs_gas = false;
    })?;
    Ok(SweepOutcome::Swept(balance))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use alloy::primitives::U256;
    use alloy::signers::local::PrivateKeySigner;
    use async_trait::async_trait;

    use super::super::testutil::*;
    use super::super::{run_job, WorkerContext};
    use crate::chain::fake::FakeChain;
    use crate::chain::{ChainClient, ChainError, TxReceiptInfo};
    use crate::storage::{JobStatus, JobType, Ledger, LedgerError, NewJob};

    const BALANCE: u64 = 20_000_000; // 20 tokens, above the 10-token threshold
    const GAS: u64 = 1_000_000_000_000_000_000;
    const DEST: &str = "0x2222222222222222222222222222222222222222";

    fn global_sweep() -> NewJob {
        NewJob {
            job_type: JobType::Consolidation,
            wallet_address: None,
            user_id: None,
            payload: serde_json::json!({}),
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn scoped_sweep_moves_funds_to_treasury() {
        let h = harness();
        let wallet = create_user_wallet(&h.ctx, "alice");
        h.chain.set_token_balance(&wallet.address, U256::from(BALANCE));
        h.chain.set_native_balance(&wallet.address, U256::from(GAS));
        h.ctx
            .ledger
            .with_wallet_mut(&wallet.address, |w| w.needs_consolidation = true)
            .unwrap();

        h.ctx
            .ledger
            .enqueue(NewJob {
                job_type: JobType::Consolidation,
                wallet_address: Some(wallet.address.clone()),
                user_id: None,
                payload: serde_json::json!({}),
                max_retries: None,
            })
            .unwrap();
        let job = h.ctx.ledger.claim_next(JobType::Consolidation).unwrap().unwrap();
        run_job(&h.ctx, job.clone()).await;

        let done = h.ctx.ledger.require_job(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.as_ref().unwrap()["swept"], 1);

        let treasury = &h.ctx.config.treasury_address;
        assert_eq!(
            h.ctx.chain.token_balance(treasury).await.unwrap(),
            U256::from(BALANCE)
        );

        let reloaded = h.ctx.ledger.require_wallet(&wallet.address).unwrap();
        assert!(!reloaded.needs_consolidation);
        assert!(!reloaded.is_processing);
        assert_eq!(reloaded.token_balance(), U256::ZERO);
    }

    #[tokio::test]
    async fn global_batch_records_per_wallet_outcomes() {
        let h = harness();
        let funded = create_user_wallet(&h.ctx, "funded");
        let gasless = create_user_wallet(&h.ctx, "gasless");
        let dust = create_user_wallet(&h.ctx, "dust");

        h.chain.set_token_balance(&funded.address, U256::from(BALANCE));
        h.chain.set_native_balance(&funded.address, U256::from(GAS));
        h.chain.set_token_balance(&gasless.address, U256::from(BALANCE));
        // dust: below threshold, flag is stale
        h.chain.set_token_balance(&dust.address, U256::from(5u64));

        for wallet in [&funded, &gasless, &dust] {
            h.ctx
                .ledger
                .with_wallet_mut(&wallet.address, |w| w.needs_consolidation = true)
                .unwrap();
        }

        h.ctx.ledger.enqueue(global_sweep()).unwrap();
        let job = h.ctx.ledger.claim_next(JobType::Consolidation).unwrap().unwrap();
        run_job(&h.ctx, job.clone()).await;

        let done = h.ctx.ledger.require_job(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result["swept"], 1);
        assert_eq!(result["skipped"], 1);
        assert_eq!(result["insufficient_gas"], 1);
        assert_eq!(result["total_swept"], BALANCE.to_string());

        // The gasless wallet is flagged for top-up and stays sweep-flagged.
        let gasless = h.ctx.ledger.require_wallet(&gasless.address).unwrap();
        assert!(gasless.needs_gas);
        assert!(gasless.needs_consolidation);
        // The dust wallet's stale flag is cleared.
        assert!(!h.ctx.ledger.require_wallet(&dust.address).unwrap().needs_consolidation);
    }

    #[tokio::test]
    async fn busy_wallets_are_left_alone() {
        let h = harness();
        let wallet = create_user_wallet(&h.ctx, "alice");
        h.chain.set_token_balance(&wallet.address, U256::from(BALANCE));
        h.chain.set_native_balance(&wallet.address, U256::from(GAS));
        h.ctx
            .ledger
            .with_wallet_mut(&wallet.address, |w| {
                w.needs_consolidation = true;
                w.is_processing = true;
            })
            .unwrap();

        h.ctx.ledger.enqueue(global_sweep()).unwrap();
        let job = h.ctx.ledger.claim_next(JobType::Consolidation).unwrap().unwrap();
        run_job(&h.ctx, job.clone()).await;

        let done = h.ctx.ledger.require_job(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result["swept"], 0);
        assert_eq!(result["busy"], 1);
        assert!(h.chain.sent().is_empty());
        // The holder's lock is not disturbed by the batch.
        assert!(h.ctx.ledger.require_wallet(&wallet.address).unwrap().is_processing);
    }

    /// [`ChainClient`] double that submits a withdrawal from inside the
    /// sweep's balance read, landing exactly between target selection and
    /// broadcast.
    struct WithdrawalDuringSweep {
        inner: Arc<FakeChain>,
        ledger: Arc<Ledger>,
        target: String,
        outcome: Mutex<Option<Result<(), LedgerError>>>,
    }

    #[async_trait]
    impl ChainClient for WithdrawalDuringSweep {
        async fn token_balance(&self, address: &str) -> Result<U256, ChainError> {
            self.inner.token_balance(address).await
        }

        async fn native_balance(&self, address: &str) -> Result<U256, ChainError> {
            {
                let mut outcome = self.outcome.lock().unwrap();
                if outcome.is_none() && address.eq_ignore_ascii_case(&self.target) {
                    *outcome = Some(
                        self.ledger
                            .submit_withdrawal("alice", DEST, U256::from(1u64), U256::ZERO)
                            .map(|_| ()),
                    );
                }
            }
            self.inner.native_balance(address).await
        }

        async fn send_token(
            &self,
            signer: PrivateKeySigner,
            to: &str,
            amount: U256,
        ) -> Result<String, ChainError> {
            self.inner.send_token(signer, to, amount).await
        }

        async fn send_native(
            &self,
            signer: PrivateKeySigner,
            to: &str,
            amount: U256,
        ) -> Result<String, ChainError> {
            self.inner.send_native(signer, to, amount).await
        }

        async fn transaction_status(
            &self,
            tx_id: &str,
        ) -> Result<Option<TxReceiptInfo>, ChainError> {
            self.inner.transaction_status(tx_id).await
        }
    }

    #[tokio::test]
    async fn global_sweep_holds_the_wallet_lock_against_withdrawals() {
        let h = harness();
        let wallet = create_user_wallet(&h.ctx, "alice");
        h.chain.set_token_balance(&wallet.address, U256::from(BALANCE));
        h.chain.set_native_balance(&wallet.address, U256::from(GAS));
        h.ctx
            .ledger
            .with_wallet_mut(&wallet.address, |w| w.needs_consolidation = true)
            .unwrap();

        let racy = Arc::new(WithdrawalDuringSweep {
            inner: Arc::clone(&h.chain),
            ledger: Arc::clone(&h.ctx.ledger),
            target: wallet.address.clone(),
            outcome: Mutex::new(None),
        });
        let ctx = WorkerContext {
            ledger: Arc::clone(&h.ctx.ledger),
            chain: Arc::clone(&racy) as Arc<dyn ChainClient>,
            deriver: Arc::clone(&h.ctx.deriver),
            vault: Arc::clone(&h.ctx.vault),
            config: Arc::clone(&h.ctx.config),
        };

        ctx.ledger.enqueue(global_sweep()).unwrap();
        let job = ctx.ledger.claim_next(JobType::Consolidation).unwrap().unwrap();
        run_job(&ctx, job.clone()).await;

        // The mid-sweep withdrawal hit the lock; only the sweep broadcast.
        let attempted = racy.outcome.lock().unwrap().take().unwrap();
        assert!(matches!(attempted, Err(LedgerError::WalletBusy(_))));
        let done = ctx.ledger.require_job(&job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.unwrap()["swept"], 1);
        assert_eq!(h.chain.sent().len(), 1);

        // The lock is dropped with the batch, so the wallet is usable again.
        assert!(!ctx.ledger.require_wallet(&wallet.address).unwrap().is_processing);
        ctx.ledger
            .submit_withdrawal("alice", DEST, U256::from(1u64), U256::ZERO)
            .unwrap();
    }

    #[tokio::test]
    async fn fully_transient_batch_is_retried() {
        let h = harness();
        let wallet = create_user_wallet(&h.ctx, "alice");
        h.chain.set_token_balance(&wallet.address, U256::from(BALANCE));
        h.chain.set_native_balance(&wallet.address, U256::from(GAS));
        h.ctx
            .ledger
            .with_wallet_mut(&wallet.address, |w| w.needs_consolidation = true)
            .unwrap();
        h.chain.queue_send_failure(ChainError::Rpc("rate limited".into()));

        h.ctx.ledger.enqueue(global_sweep()).unwrap();
        let job = h.ctx.ledger.claim_next(JobType::Consolidation).unwrap().unwrap();
        run_job(&h.ctx, job.clone()).await;

        let retrying = h.ctx.ledger.require_job(&job.id).unwrap();
        assert_eq!(retrying.status, JobStatus::Pending);
        assert_eq!(retrying.retry_count, 1);
    }
}
