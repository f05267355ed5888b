// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Background Workers
//!
//! One worker task per job type plus the maintenance scheduler and the
//! reconciler. Each worker loops on [`Ledger::claim_next`], executes the
//! claimed job, and records the outcome:
//!
//! - `Ok` completes the job and releases its wallet
//! - a transient error (RPC, timeout, broadcast) requeues it behind backoff
//! - anything else fails it immediately, retries notwithstanding
//!
//! Workers hold no state of their own; a crash mid-job leaves a `processing`
//! row that the [`reconciler`] picks up after the stale timeout.
//!
//! Shutdown uses `tokio_util::sync::CancellationToken`: every loop checks the
//! token between steps and drains within one poll interval.

pub mod consolidation;
pub mod gas_topup;
pub mod reconciler;
pub mod scheduler;
pub mod sync;
pub mod withdrawal;

use std::sync::Arc;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::{ChainClient, ChainError};
use crate::config::Config;
use crate::keys::{DerivationError, DerivedKey, KeyDeriver};
use crate::storage::{Job, JobStatus, JobType, Ledger, LedgerError};
use crate::vault::{SecretVault, VaultError};

pub use reconciler::Reconciler;
pub use scheduler::MaintenanceScheduler;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error("job payload is malformed: {0}")]
    MalformedPayload(String),

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: U256, available: U256 },

    #[error("wallet {0} lacks gas for the transfer")]
    InsufficientGas(String),

    #[error("derived key does not match stored address for wallet {0}")]
    KeyMismatch(String),

    #[error("transaction {0} reverted on-chain")]
    TransactionReverted(String),

    #[error("transaction {0} not yet confirmed")]
    Unconfirmed(String),
}

impl WorkerError {
    /// Transient failures requeue the job; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Chain(e) => e.is_transient(),
            WorkerError::InsufficientGas(_) => true,
            WorkerError::Unconfirmed(_) => true,
            _ => false,
        }
    }
}

/// Shared dependencies handed to every worker.
pub struct WorkerContext {
    pub ledger: Arc<Ledger>,
    pub chain: Arc<dyn ChainClient>,
    pub deriver: Arc<KeyDeriver>,
    pub vault: Arc<SecretVault>,
    pub config: Arc<Config>,
}

impl WorkerContext {
    /// Re-derive the signer for a custodied wallet.
    ///
    /// The derived address is checked against the stored one, so a wrong
    /// vault key or seed can never sign from an unexpected account.
    pub fn wallet_signer(
        &self,
        wallet: &crate::storage::WalletRecord,
    ) -> Result<PrivateKeySigner, WorkerError> {
        let entropy = self.vault.decrypt(&wallet.entropy_enc)?;
        let key = self.deriver.derive(wallet.derivation_index, Some(&entropy))?;
        if !key.address.eq_ignore_ascii_case(&wallet.address) {
            return Err(WorkerError::KeyMismatch(wallet.address.clone()));
        }
        Ok(key.signer)
    }

    /// The gas funding wallet, derived straight from the master seed.
    pub fn funding_wallet(&self) -> Result<DerivedKey, WorkerError> {
        Ok(self
            .deriver
            .derive(self.config.funding_account_index, None)?)
    }
}

// =============================================================================
// Payload helpers
// =============================================================================

pub(crate) fn payload_str<'a>(job: &'a Job, field: &str) -> Result<&'a str, WorkerError> {
    job.payload
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WorkerError::MalformedPayload(format!("missing `{field}`")))
}

pub(crate) fn payload_amount(job: &Job, field: &str) -> Result<U256, WorkerError> {
    payload_str(job, field)?
        .parse()
        .map_err(|_| WorkerError::MalformedPayload(format!("`{field}` is not a base-unit amount")))
}

// =============================================================================
// Job execution
// =============================================================================

async fn dispatch(ctx: &WorkerContext, job: &Job) -> Result<serde_json::Value, WorkerError> {
    match job.job_type {
        JobType::Withdrawal => withdrawal::execute(ctx, job).await,
        JobType::Consolidation => consolidation::execute(ctx, job).await,
        JobType::GasTopup => gas_topup::execute(ctx, job).await,
        JobType::SyncBalances => sync::execute(ctx, job).await,
    }
}

/// Execute a claimed job and record its outcome in the ledger.
pub async fn run_job(ctx: &WorkerContext, job: Job) {
    info!(job_id = %job.id, job_type = %job.job_type, retry = job.retry_count, "executing job");

    match dispatch(ctx, &job).await {
        Ok(result) => match ctx.ledger.complete(&job.id, Some(result)) {
            Ok(done) => info!(job_id = %done.id, "job completed"),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to mark job completed"),
        },
        Err(e) if e.is_transient() => {
            warn!(job_id = %job.id, error = %e, "job failed, retryable");
            match ctx.ledger.fail(&job.id, &e.to_string()) {
                Ok(updated) if updated.status == JobStatus::Failed => {
                    warn!(job_id = %updated.id, "retries exhausted");
                    on_terminal_failure(ctx, &updated).await;
                }
                Ok(_) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "failed to record job failure"),
            }
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "job failed fatally");
            match ctx.ledger.fail_fatal(&job.id, &e.to_string()) {
                Ok(updated) => on_terminal_failure(ctx, &updated).await,
                Err(e) => error!(job_id = %job.id, error = %e, "failed to record job failure"),
            }
        }
    }
}

/// Propagate a terminal job failure to anything the user can see.
async fn on_terminal_failure(ctx: &WorkerContext, job: &Job) {
    if job.job_type == JobType::Withdrawal {
        withdrawal::mark_withdrawal_failed(ctx, job);
    }
}

// =============================================================================
// Worker loop
// =============================================================================

/// Polls one job type's queue and executes what it claims.
pub struct JobWorker {
    ctx: Arc<WorkerContext>,
    job_type: JobType,
}

impl JobWorker {
    pub fn new(ctx: Arc<WorkerContext>, job_type: JobType) -> Self {
        Self { ctx, job_type }
    }

    /// Run the worker loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(job_type = %self.job_type, "worker starting");

        loop {
            if shutdown.is_cancelled() {
                info!(job_type = %self.job_type, "worker shutting down");
                return;
            }

            let worked = self.step().await;
            if worked {
                // Drain the queue before sleeping again.
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.worker_poll_interval) => {},
                _ = shutdown.cancelled() => {
                    info!(job_type = %self.job_type, "worker shutting down");
                    return;
                }
            }
        }
    }

    /// Claim and run one job. Returns whether anything was claimed.
    async fn step(&self) -> bool {
        match self.ctx.ledger.claim_next(self.job_type) {
            Ok(Some(job)) => {
                run_job(&self.ctx, job).await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(job_type = %self.job_type, error = %e, "claim failed");
                false
            }
        }
    }
}

/// Spawn the full worker set: one queue worker per job type, the maintenance
/// scheduler, and the reconciler.
pub fn spawn_workers(
    ctx: Arc<WorkerContext>,
    shutdown: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for job_type in JobType::ALL {
        let worker = JobWorker::new(Arc::clone(&ctx), job_type);
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }
    handles.push(tokio::spawn(
        MaintenanceScheduler::new(Arc::clone(&ctx)).run(shutdown.clone()),
    ));
    handles.push(tokio::spawn(
        Reconciler::new(ctx).run(shutdown.clone()),
    ));
    handles
}

// =============================================================================
// Test harness
// =============================================================================


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn signer_matches_the_stored_address() {
        let h = harness();
        let wallet = create_user_wallet(&h.ctx, "alice");
        let signer = h.ctx.wallet_signer(&wallet).unwrap();
        assert!(signer
            .address()
            .to_string()
            .eq_ignore_ascii_case(&wallet.address));
    }

    #[test]
    fn tampered_entropy_cannot_produce_a_signer() {
        let h = harness();
        let wallet = create_user_wallet(&h.ctx, "alice");

        let mut forged = wallet.clone();
        forged.entropy_enc = h.ctx.vault.encrypt(&[9u8; 32]).unwrap();
        assert!(matches!(
            h.ctx.wallet_signer(&forged),
            Err(WorkerError::KeyMismatch(_))
        ));
    }

    #[test]
    fn funding_wallet_is_stable() {
        let h = harness();
        let a = h.ctx.funding_wallet().unwrap();
        let b = h.ctx.funding_wallet().unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.derivation_path, "m/44'/60'/0'/0/0");
    }

    #[test]
    fn transient_classification_drives_retries() {
        assert!(WorkerError::Chain(ChainError::Rpc("x".into())).is_transient());
        assert!(WorkerError::InsufficientGas("0xabc".into()).is_transient());
        assert!(WorkerError::Unconfirmed("0xtx".into()).is_transient());
        assert!(!WorkerError::InsufficientFunds {
            needed: U256::from(2u64),
            available: U256::from(1u64),
        }
        .is_transient());
        assert!(!WorkerError::MalformedPayload("no amount".into()).is_transient());
        assert!(!WorkerError::TransactionReverted("0xtx".into()).is_transient());
    }
}
