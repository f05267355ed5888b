// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Maintenance scheduler: keeps the pipeline self-driving.
//!
//! Every sync interval it enqueues a global balance sync, and whenever
//! wallets carry maintenance flags it enqueues the matching global sweep or
//! top-up job. Global jobs are idempotent per type, so a tick that overlaps
//! a still-running job is a no-op.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{JobType, LedgerError, NewJob};

use super::WorkerContext;

pub struct MaintenanceScheduler {
    ctx: Arc<WorkerContext>,
}

impl MaintenanceScheduler {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Run the scheduling loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.ctx.config.sync_interval.as_secs(),
            "maintenance scheduler starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("maintenance scheduler shutting down");
                return;
            }

            self.tick();

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.sync_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("maintenance scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// One scheduling pass: sync always, sweep and top-up when flagged.
    pub(crate) fn tick(&self) {
        self.enqueue_global(JobType::SyncBalances);

        match self.ctx.ledger.wallets_needing_consolidation() {
            Ok(flagged) if !flagged.is_empty() => {
                self.enqueue_global(JobType::Consolidation);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not list sweep-flagged wallets"),
        }

        match self.ctx.ledger.wallets_needing_gas() {
            Ok(flagged) if !flagged.is_empty() => {
                self.enqueue_global(JobType::GasTopup);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not list gas-flagged wallets"),
        }
    }

    fn enqueue_global(&self, job_type: JobType) {
        let new = NewJob {
            job_type,
            wallet_address: None,
            user_id: None,
            payload: serde_json::json!({}),
            max_retries: None,
        };
        match self.ctx.ledger.enqueue(new) {
            Ok((job, true)) => info!(job_id = %job.id, %job_type, "scheduled maintenance job"),
            Ok((job, false)) => debug!(job_id = %job.id, %job_type, "maintenance job already active"),
            Err(e @ LedgerError::WalletBusy(_)) => debug!(%job_type, error = %e, "skipped"),
            Err(e) => warn!(%job_type, error = %e, "could not schedule maintenance job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use crate::storage::JobFilter;

    #[test]
    fn tick_schedules_sync_and_flag_driven_jobs() {
        let h = harness();
        let wallet = create_user_wallet(&h.ctx, "alice");
        h.ctx
            .ledger
            .with_wallet_mut(&wallet.address, |w| {
                w.needs_consolidation = true;
                w.needs_gas = true;
            })
            .unwrap();

        let scheduler = MaintenanceScheduler::new(Arc::clone(&h.ctx));
        scheduler.tick();

        let jobs = h.ctx.ledger.list_jobs(&JobFilter::default()).unwrap();
        let mut types: Vec<JobType> = jobs.iter().map(|j| j.job_type).collect();
        types.sort_by_key(|t| t.as_str());
        assert_eq!(jobs.len(), 3);
        assert!(types.contains(&JobType::SyncBalances));
        assert!(types.contains(&JobType::Consolidation));
        assert!(types.contains(&JobType::GasTopup));

        // A second tick piggybacks on the still-pending global jobs.
        scheduler.tick();
        assert_eq!(h.ctx.ledger.list_jobs(&JobFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn tick_without_flags_only_schedules_sync() {
        let h = harness();
        create_user_wallet(&h.ctx, "alice");

        MaintenanceScheduler::new(Arc::clone(&h.ctx)).tick();

        let jobs = h.ctx.ledger.list_jobs(&JobFilter::default()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::SyncBalances);
    }
}
