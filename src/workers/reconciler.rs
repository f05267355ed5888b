// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Reconciler: recover jobs orphaned by a crashed or wedged worker.
//!
//! A `processing` job whose last update is older than the stale timeout has
//! lost its worker. What happens next depends on whether the attempt got as
//! far as broadcasting:
//!
//! - tx_id recorded, receipt successful: the work happened, finish the job
//! - tx_id recorded, receipt reverted: fail it, the chain said no
//! - tx_id recorded, no receipt yet: requeue and look again later
//! - no tx_id: nothing hit the chain, requeue for a clean re-run
//!
//! Requeues go through the normal retry accounting, so a job that keeps
//! going stale eventually fails instead of looping forever.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::storage::{Job, JobStatus, JobType, LedgerError};

use super::WorkerContext;

/// What one reconciliation pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub completed: u64,
    pub failed: u64,
    pub requeued: u64,
}

pub struct Reconciler {
    ctx: Arc<WorkerContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Run the reconciliation loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.ctx.config.reconcile_interval.as_secs(),
            stale_after_secs = self.ctx.config.stale_job_timeout.as_secs(),
            "reconciler starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("reconciler shutting down");
                return;
            }

            match reconcile_once(&self.ctx).await {
                Ok(stats) if stats != ReconcileStats::default() => {
                    info!(
                        completed = stats.completed,
                        failed = stats.failed,
                        requeued = stats.requeued,
                        "reconciled stale jobs"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "reconciliation pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.reconcile_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("reconciler shutting down");
                    return;
                }
            }
        }
    }
}

/// One reconciliation pass over every stale processing job.
pub async fn reconcile_once(ctx: &WorkerContext) -> Result<ReconcileStats, LedgerError> {
    let stale = ctx.ledger.stale_jobs(ctx.config.stale_job_timeout)?;
    let mut stats = ReconcileStats::default();

    for job in stale {
        match reconcile_job(ctx, &job).await {
            Ok(outcome) => match outcome {
                Outcome::Completed => stats.completed += 1,
                Outcome::Failed => stats.failed += 1,
                Outcome::Requeued => stats.requeued += 1,
            },
            Err(e) => warn!(job_id = %job.id, error = %e, "could not reconcile job"),
        }
    }
    Ok(stats)
}

enum Outcome {
    Completed,
    Failed,
    Requeued,
}

async fn reconcile_job(ctx: &WorkerContext, job: &Job) -> Result<Outcome, LedgerError> {
    if let Some(tx_id) = &job.tx_id {
        match ctx.chain.transaction_status(tx_id).await {
            Ok(Some(receipt)) if receipt.success => {
                finish_broadcast_job(ctx, job, tx_id);
                ctx.ledger.complete(
                    &job.id,
                    Some(serde_json::json!({
                        "reconciled": true,
                        "tx_id": tx_id,
                        "block_number": receipt.block_number,
                    })),
                )?;
                info!(job_id = %job.id, tx_id, "stale job completed from receipt");
                return Ok(Outcome::Completed);
            }
            Ok(Some(_)) => {
                let failed = ctx
                    .ledger
                    .fail_fatal(&job.id, &format!("transaction {tx_id} reverted"))?;
                mirror_failure(ctx, &failed);
                return Ok(Outcome::Failed);
            }
            Ok(None) => {
                // Broadcast but unmined: give the chain more time.
                return requeue(ctx, job, "stale with unconfirmed broadcast");
            }
            Err(e) => {
                warn!(job_id = %job.id, tx_id, error = %e, "receipt lookup failed");
                return requeue(ctx, job, "stale, receipt lookup failed");
            }
        }
    }

    // Never reached the chain; safe to re-run from scratch.
    requeue(ctx, job, "stale: worker lost before broadcast")
}

fn requeue(ctx: &WorkerContext, job: &Job, reason: &str) -> Result<Outcome, LedgerError> {
    let updated = ctx.ledger.fail(&job.id, reason)?;
    if updated.status == JobStatus::Failed {
        mirror_failure(ctx, &updated);
        Ok(Outcome::Failed)
    } else {
        Ok(Outcome::Requeued)
    }
}

/// Settle the user-facing record of a withdrawal whose transaction landed.
fn finish_broadcast_job(ctx: &WorkerContext, job: &Job, tx_id: &str) {
    if job.job_type != JobType::Withdrawal {
        return;
    }
    let Some(withdrawal_id) = job.payload.get("withdrawal_id").and_then(|v| v.as_str()) else {
        return;
    };
    match ctx.ledger.complete_withdrawal(withdrawal_id, tx_id) {
        Ok(_) => {}
        Err(LedgerError::InvalidTransition(_)) => {}
        Err(e) => warn!(withdrawal_id, error = %e, "could not settle withdrawal"),
    }
}

fn mirror_failure(ctx: &WorkerContext, job: &Job) {
    if job.job_type == JobType::Withdrawal {
        super::withdrawal::mark_withdrawal_failed(ctx, job);
    }
}
