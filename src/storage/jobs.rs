// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! The job ledger: durable units of work with retry and mutual exclusion.
//!
//! Every state transition runs inside one redb write transaction together
//! with its lock bookkeeping, so an observer never sees a claimed job whose
//! wallet is unlocked or a terminal job still holding its wallet.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──claim──► processing ──complete──► completed
//!    ▲                   │
//!    │ retries left      ├──fail──────────► failed (exhausted / fatal)
//!    └───────────────────┘
//! pending ──cancel──► cancelled
//! ```
//!
//! The wallet lock is held from enqueue until the job reaches a terminal
//! state; a retryable failure keeps the lock so no other job interleaves
//! with the retry.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::ledger::{
    global_marker_key, queue_key, queue_prefix, queue_prefix_end, Ledger, LedgerError,
    LedgerResult, JOBS, JOB_QUEUE, LEDGER_STATE, WALLETS,
};
use super::wallets::{lock_wallet, unlock_wallet};

// =============================================================================
// Types
// =============================================================================

/// The kinds of work the pipeline executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Send custodied tokens from a user wallet to an external address.
    Withdrawal,
    /// Sweep user balances to the treasury.
    Consolidation,
    /// Fund user wallets with native currency for gas.
    GasTopup,
    /// Refresh cached balances and maintenance flags.
    SyncBalances,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Withdrawal,
        JobType::Consolidation,
        JobType::GasTopup,
        JobType::SyncBalances,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Withdrawal => "withdrawal",
            JobType::Consolidation => "consolidation",
            JobType::GasTopup => "gas-topup",
            JobType::SyncBalances => "sync-balances",
        }
    }

    /// One-byte queue key prefix.
    pub(super) fn tag(self) -> u8 {
        match self {
            JobType::Withdrawal => 1,
            JobType::Consolidation => 2,
            JobType::GasTopup => 3,
            JobType::SyncBalances => 4,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition again (except via explicit retry).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Wallet this job holds exclusively; `None` for global jobs.
    pub wallet_address: Option<String>,
    pub user_id: Option<String>,
    /// Type-specific parameters, opaque to the ledger.
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    /// On-chain transaction id, recorded before completion so a crash
    /// between broadcast and commit stays reconcilable.
    pub tx_id: Option<String>,
    /// Worker-reported outcome of a completed job.
    #[schema(value_type = Object)]
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest claimable time; set by retry backoff.
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for enqueuing a job.
pub struct NewJob {
    pub job_type: JobType,
    pub wallet_address: Option<String>,
    pub user_id: Option<String>,
    pub payload: serde_json::Value,
    /// Overrides the ledger-wide retry cap when set.
    pub max_retries: Option<u32>,
}

/// Filters for listing jobs; all optional, newest-first.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub wallet_address: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Counts per status across the whole ledger.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct JobSummary {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

// =============================================================================
// Shared table helpers
// =============================================================================

pub(super) fn load_job(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    job_id: &str,
) -> LedgerResult<Option<Job>> {
    match table.get(job_id)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

pub(super) fn store_job(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    job: &Job,
) -> LedgerResult<()> {
    let json = serde_json::to_vec(job)?;
    table.insert(job.id.as_str(), json.as_slice())?;
    Ok(())
}

pub(super) fn insert_queue_entry(
    table: &mut redb::Table<'_, &'static [u8], &'static str>,
    job: &Job,
) -> LedgerResult<()> {
    let key = queue_key(job.job_type, Utc::now().timestamp_millis(), &job.id);
    table.insert(key.as_slice(), job.id.as_str())?;
    Ok(())
}

/// Remove every queue entry pointing at a job. The enqueue timestamp is not
/// stored on the job, so removal scans the type's key range.
fn remove_queue_entries(
    table: &mut redb::Table<'_, &'static [u8], &'static str>,
    job_type: JobType,
    job_id: &str,
) -> LedgerResult<()> {
    let start = queue_prefix(job_type);
    let end = queue_prefix_end(job_type);

    let keys: Vec<Vec<u8>> = {
        let mut keys = Vec::new();
        for entry in table.range(start.as_slice()..end.as_slice())? {
            let (key, value) = entry?;
            if value.value() == job_id {
                keys.push(key.value().to_vec());
            }
        }
        keys
    };
    for key in keys {
        table.remove(key.as_slice())?;
    }
    Ok(())
}

/// Release whatever exclusivity a job holds: the wallet lock for scoped jobs,
/// the global marker for wallet-less ones.
fn release_job_locks(
    wallet_table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    state_table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    job: &Job,
) -> LedgerResult<()> {
    match &job.wallet_address {
        Some(address) => unlock_wallet(wallet_table, address)?,
        None => {
            let marker = global_marker_key(job.job_type);
            let held = match state_table.get(marker.as_str())? {
                Some(v) => v.value() == job.id.as_bytes(),
                None => false,
            };
            if held {
                state_table.remove(marker.as_str())?;
            }
        }
    }
    Ok(())
}

fn validate_new_job(new: &NewJob) -> LedgerResult<()> {
    if !new.payload.is_object() && !new.payload.is_null() {
        return Err(LedgerError::Validation(
            "payload must be a JSON object".to_string(),
        ));
    }
    if new.job_type == JobType::Withdrawal {
        if new.wallet_address.is_none() {
            return Err(LedgerError::Validation(
                "withdrawal jobs require a wallet address".to_string(),
            ));
        }
        let payload = new.payload.as_object();
        for field in ["withdrawal_id", "to_address", "amount"] {
            let present = payload
                .and_then(|p| p.get(field))
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.is_empty());
            if !present {
                return Err(LedgerError::Validation(format!(
                    "withdrawal payload missing `{field}`"
                )));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Job Operations
// =============================================================================

impl Ledger {
    /// Enqueue a job, acquiring its exclusivity in the same transaction.
    ///
    /// Wallet-scoped jobs flip the wallet's `is_processing` flag and fail
    /// with [`LedgerError::WalletBusy`] if it is already set. Global jobs
    /// are idempotent per type: while one is pending or processing, enqueue
    /// returns it instead of creating another. Returns `(job, created)`.
    pub fn enqueue(&self, new: NewJob) -> LedgerResult<(Job, bool)> {
        validate_new_job(&new)?;

        let write_txn = self.db.begin_write()?;
        let job = {
            let mut job_table = write_txn.open_table(JOBS)?;
            let mut queue_table = write_txn.open_table(JOB_QUEUE)?;
            let mut wallet_table = write_txn.open_table(WALLETS)?;
            let mut state_table = write_txn.open_table(LEDGER_STATE)?;

            let wallet_address = match &new.wallet_address {
                Some(address) => {
                    let wallet = lock_wallet(&mut wallet_table, address)?;
                    Some(wallet.address)
                }
                None => {
                    let marker = global_marker_key(new.job_type);
                    let active = match state_table.get(marker.as_str())? {
                        Some(v) => String::from_utf8(v.value().to_vec()).ok(),
                        None => None,
                    };
                    if let Some(active_id) = active {
                        if let Some(active_job) = load_job(&job_table, &active_id)? {
                            if !active_job.status.is_terminal() {
                                return Ok((active_job, false));
                            }
                        }
                    }
                    None
                }
            };

            let now = Utc::now();
            let job = Job {
                id: Uuid::new_v4().to_string(),
                job_type: new.job_type,
                status: JobStatus::Pending,
                wallet_address,
                user_id: new.user_id,
                payload: if new.payload.is_null() {
                    serde_json::json!({})
                } else {
                    new.payload
                },
                tx_id: None,
                result: None,
                error_message: None,
                retry_count: 0,
                max_retries: new.max_retries.unwrap_or(self.settings.max_retries),
                not_before: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            };

            store_job(&mut job_table, &job)?;
            insert_queue_entry(&mut queue_table, &job)?;
            if job.wallet_address.is_none() {
                let marker = global_marker_key(job.job_type);
                state_table.insert(marker.as_str(), job.id.as_bytes())?;
            }
            job
        };
        write_txn.commit()?;
        Ok((job, true))
    }

    /// Atomically claim the oldest eligible pending job of a type.
    ///
    /// Claiming flips the job to `processing` in the same transaction that
    /// removes its queue entry, so two workers can never claim the same job.
    /// Jobs whose `not_before` lies in the future are skipped.
    pub fn claim_next(&self, job_type: JobType) -> LedgerResult<Option<Job>> {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        let claimed = {
            let mut job_table = write_txn.open_table(JOBS)?;
            let mut queue_table = write_txn.open_table(JOB_QUEUE)?;

            let start = queue_prefix(job_type);
            let end = queue_prefix_end(job_type);

            // Scan forward (oldest first) for a claimable entry; collect
            // dangling entries for cleanup along the way.
            let mut chosen: Option<(Vec<u8>, Job)> = None;
            let mut dangling: Vec<Vec<u8>> = Vec::new();
            for entry in queue_table.range(start.as_slice()..end.as_slice())? {
                let (key, value) = entry?;
                let job_id = value.value().to_string();
                match load_job(&job_table, &job_id)? {
                    Some(job) if job.status == JobStatus::Pending => {
                        let eligible = job.not_before.map_or(true, |t| t <= now);
                        if eligible {
                            chosen = Some((key.value().to_vec(), job));
                            break;
                        }
                    }
                    // Entry points at a missing or already-transitioned job.
                    _ => dangling.push(key.value().to_vec()),
                }
            }

            for key in dangling {
                queue_table.remove(key.as_slice())?;
            }

            match chosen {
                Some((key, mut job)) => {
                    queue_table.remove(key.as_slice())?;
                    job.status = JobStatus::Processing;
                    job.started_at = Some(now);
                    job.updated_at = now;
                    store_job(&mut job_table, &job)?;
                    Some(job)
                }
                None => None,
            }
        };
        write_txn.commit()?;
        Ok(claimed)
    }

    /// Record the on-chain transaction id of a processing job.
    ///
    /// Called after broadcast and before any further transition, so a crash
    /// in between leaves enough state for the reconciler to finish the job.
    pub fn record_broadcast(&self, job_id: &str, tx_id: &str) -> LedgerResult<Job> {
        self.transition(job_id, |job| {
            if job.status != JobStatus::Processing {
                return Err(LedgerError::InvalidTransition(format!(
                    "job {} is {}, cannot record broadcast",
                    job.id, job.status
                )));
            }
            job.tx_id = Some(tx_id.to_string());
            Ok(JobOutcome::Keep)
        })
    }

    /// Mark a processing job completed and release its exclusivity.
    pub fn complete(
        &self,
        job_id: &str,
        result: Option<serde_json::Value>,
    ) -> LedgerResult<Job> {
        self.transition(job_id, |job| {
            if job.status != JobStatus::Processing {
                return Err(LedgerError::InvalidTransition(format!(
                    "job {} is {}, cannot complete",
                    job.id, job.status
                )));
            }
            job.status = JobStatus::Completed;
            job.result = result;
            job.completed_at = Some(Utc::now());
            Ok(JobOutcome::Release)
        })
    }

    /// Record a retryable failure.
    ///
    /// With retries left the job returns to `pending` behind an exponential
    /// backoff and keeps its wallet lock. Once retries are exhausted it goes
    /// to `failed` and releases.
    pub fn fail(&self, job_id: &str, error: &str) -> LedgerResult<Job> {
        let settings = self.settings.clone();
        self.transition(job_id, move |job| {
            if job.status != JobStatus::Processing {
                return Err(LedgerError::InvalidTransition(format!(
                    "job {} is {}, cannot fail",
                    job.id, job.status
                )));
            }
            job.retry_count += 1;
            job.error_message = Some(error.to_string());
            if job.retry_count < job.max_retries {
                let delay = settings.backoff_delay(job.retry_count);
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.not_before = Some(
                    Utc::now()
                        + ChronoDuration::from_std(delay)
                            .unwrap_or_else(|_| ChronoDuration::seconds(0)),
                );
                Ok(JobOutcome::Requeue)
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                Ok(JobOutcome::Release)
            }
        })
    }

    /// Record a non-retryable failure: straight to `failed`, regardless of
    /// retries left.
    pub fn fail_fatal(&self, job_id: &str, error: &str) -> LedgerResult<Job> {
        self.transition(job_id, |job| {
            if job.status.is_terminal() {
                return Err(LedgerError::InvalidTransition(format!(
                    "job {} is already {}",
                    job.id, job.status
                )));
            }
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.completed_at = Some(Utc::now());
            Ok(JobOutcome::Release)
        })
    }

    /// Cancel a pending job before any worker picks it up.
    pub fn cancel(&self, job_id: &str) -> LedgerResult<Job> {
        self.transition(job_id, |job| {
            if job.status != JobStatus::Pending {
                return Err(LedgerError::InvalidTransition(format!(
                    "job {} is {}, only pending jobs can be cancelled",
                    job.id, job.status
                )));
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            Ok(JobOutcome::Release)
        })
    }

    /// Re-enqueue a failed job.
    ///
    /// Refuses when retries are exhausted unless `reset` also zeroes the
    /// retry counter. Re-acquires the wallet lock, so the call fails with
    /// [`LedgerError::WalletBusy`] if some other job took the wallet since.
    pub fn retry(&self, job_id: &str, reset: bool) -> LedgerResult<Job> {
        let write_txn = self.db.begin_write()?;
        let job = {
            let mut job_table = write_txn.open_table(JOBS)?;
            let mut queue_table = write_txn.open_table(JOB_QUEUE)?;
            let mut wallet_table = write_txn.open_table(WALLETS)?;
            let mut state_table = write_txn.open_table(LEDGER_STATE)?;

            let mut job = load_job(&job_table, job_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("job {job_id}")))?;
            if job.status != JobStatus::Failed {
                return Err(LedgerError::InvalidTransition(format!(
                    "job {} is {}, only failed jobs can be retried",
                    job.id, job.status
                )));
            }
            if !reset && job.retry_count >= job.max_retries {
                return Err(LedgerError::RetriesExhausted(job.id));
            }

            match &job.wallet_address {
                Some(address) => {
                    lock_wallet(&mut wallet_table, address)?;
                }
                None => {
                    let marker = global_marker_key(job.job_type);
                    let active = match state_table.get(marker.as_str())? {
                        Some(v) => String::from_utf8(v.value().to_vec()).ok(),
                        None => None,
                    };
                    if let Some(active_id) = active {
                        if let Some(active_job) = load_job(&job_table, &active_id)? {
                            if !active_job.status.is_terminal() && active_job.id != job.id {
                                return Err(LedgerError::InvalidTransition(format!(
                                    "another {} job ({}) is already active",
                                    job.job_type, active_job.id
                                )));
                            }
                        }
                    }
                    state_table.insert(marker.as_str(), job.id.as_bytes())?;
                }
            }

            if reset {
                job.retry_count = 0;
                job.error_message = None;
            }
            job.status = JobStatus::Pending;
            job.not_before = None;
            job.started_at = None;
            job.completed_at = None;
            job.updated_at = Utc::now();

            store_job(&mut job_table, &job)?;
            insert_queue_entry(&mut queue_table, &job)?;
            job
        };
        write_txn.commit()?;
        Ok(job)
    }

    /// Look up a single job.
    pub fn job(&self, job_id: &str) -> LedgerResult<Option<Job>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(JOBS)?;
        load_job(&table, job_id)
    }

    /// Look up a job, erroring when absent.
    pub fn require_job(&self, job_id: &str) -> LedgerResult<Job> {
        self.job(job_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("job {job_id}")))
    }

    /// Filtered listing, newest-first with offset/limit pagination.
    pub fn list_jobs(&self, filter: &JobFilter) -> LedgerResult<Vec<Job>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(JOBS)?;

        let mut jobs = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let job: Job = serde_json::from_slice(value.value())?;
            if filter.status.is_some_and(|s| s != job.status) {
                continue;
            }
            if filter.job_type.is_some_and(|t| t != job.job_type) {
                continue;
            }
            if let Some(address) = &filter.wallet_address {
                let matches = job
                    .wallet_address
                    .as_deref()
                    .is_some_and(|a| a.eq_ignore_ascii_case(address));
                if !matches {
                    continue;
                }
            }
            jobs.push(job);
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(50);
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    /// Per-status counts across the whole ledger.
    pub fn job_summary(&self) -> LedgerResult<JobSummary> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(JOBS)?;

        let mut summary = JobSummary::default();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let job: Job = serde_json::from_slice(value.value())?;
            match job.status {
                JobStatus::Pending => summary.pending += 1,
                JobStatus::Processing => summary.processing += 1,
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Cancelled => summary.cancelled += 1,
            }
            summary.total += 1;
        }
        Ok(summary)
    }

    /// Processing jobs whose last update is older than `older_than`.
    /// These are the crash survivors the reconciler inspects.
    pub fn stale_jobs(&self, older_than: std::time::Duration) -> LedgerResult<Vec<Job>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(older_than).unwrap_or_else(|_| ChronoDuration::seconds(0));
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(JOBS)?;

        let mut stale = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let job: Job = serde_json::from_slice(value.value())?;
            if job.status == JobStatus::Processing && job.updated_at < cutoff {
                stale.push(job);
            }
        }
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(stale)
    }

    /// Run one guarded state transition inside a single write transaction.
    fn transition(
        &self,
        job_id: &str,
        mutate: impl FnOnce(&mut Job) -> LedgerResult<JobOutcome>,
    ) -> LedgerResult<Job> {
        let write_txn = self.db.begin_write()?;
        let job = {
            let mut job_table = write_txn.open_table(JOBS)?;
            let mut queue_table = write_txn.open_table(JOB_QUEUE)?;
            let mut wallet_table = write_txn.open_table(WALLETS)?;
            let mut state_table = write_txn.open_table(LEDGER_STATE)?;

            let mut job = load_job(&job_table, job_id)?
                .ok_or_else(|| LedgerError::NotFound(format!("job {job_id}")))?;
            let was_pending = job.status == JobStatus::Pending;

            let outcome = mutate(&mut job)?;
            job.updated_at = Utc::now();

            match outcome {
                JobOutcome::Keep => {}
                JobOutcome::Requeue => {
                    insert_queue_entry(&mut queue_table, &job)?;
                }
                JobOutcome::Release => {
                    if was_pending {
                        remove_queue_entries(&mut queue_table, job.job_type, &job.id)?;
                    }
                    release_job_locks(&mut wallet_table, &mut state_table, &job)?;
                }
            }

            store_job(&mut job_table, &job)?;
            job
        };
        write_txn.commit()?;
        Ok(job)
    }
}

/// What a transition does besides rewriting the job row.
enum JobOutcome {
    /// Row update only.
    Keep,
    /// Back into the pending queue; exclusivity kept.
    Requeue,
    /// Terminal: drop queue entries and release locks/markers.
    Release,
}
