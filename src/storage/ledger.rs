// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded job ledger backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `wallets`: lowercase address → serialized WalletRecord
//! - `user_wallets`: user_id → lowercase address
//! - `jobs`: job_id → serialized Job
//! - `job_queue`: composite key (type_tag|created_at_be|job_id) → job_id
//! - `withdrawals`: withdrawal_id → serialized WithdrawalRecord
//! - `ledger_state`: key → value (derivation counter, global-job markers)
//!
//! The queue table keys sort by (job type, enqueue time), so a forward range
//! scan per type yields pending jobs oldest-first.

use std::path::Path;
use std::time::Duration;

use redb::{Database, TableDefinition};

use super::jobs::JobType;

// =============================================================================
// Table Definitions
// =============================================================================

/// Primary wallet table: lowercase address → serialized WalletRecord (JSON bytes).
pub(super) const WALLETS: TableDefinition<&str, &[u8]> = TableDefinition::new("wallets");

/// Map: user_id → lowercase on-chain address.
pub(super) const USER_WALLETS: TableDefinition<&str, &str> = TableDefinition::new("user_wallets");

/// Primary job table: job_id → serialized Job (JSON bytes).
pub(super) const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Pending queue index: composite key → job_id.
/// Key format: `type_tag|enqueued_at_be|job_id` for oldest-first range scans.
pub(super) const JOB_QUEUE: TableDefinition<&[u8], &str> = TableDefinition::new("job_queue");

/// Withdrawal table: withdrawal_id → serialized WithdrawalRecord (JSON bytes).
pub(super) const WITHDRAWALS: TableDefinition<&str, &[u8]> = TableDefinition::new("withdrawals");

/// Ledger state: key → value bytes (e.g., "next_derivation_index" → u32 big-endian,
/// "active_global_sync-balances" → job_id).
pub(super) const LEDGER_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("ledger_state");

/// State key holding the next HD account index to hand out.
pub(super) const NEXT_INDEX_KEY: &str = "next_derivation_index";

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("wallet {0} already has a job in flight")]
    WalletBusy(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("job {0} has exhausted its retries")]
    RetriesExhausted(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// =============================================================================
// Queue Key Helpers
// =============================================================================

/// Build a composite key for the job_queue table.
///
/// Format: `type_tag | enqueued_at_millis_be_bytes | job_id`
///
/// Big-endian millis give oldest-first ordering within a type when scanning
/// forward; the job_id suffix disambiguates same-millisecond enqueues.
pub(super) fn queue_key(job_type: JobType, enqueued_at_millis: i64, job_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8 + job_id.len());
    key.push(job_type.tag());
    key.extend_from_slice(&(enqueued_at_millis as u64).to_be_bytes());
    key.extend_from_slice(job_id.as_bytes());
    key
}

/// Lower bound for a range scan over one job type.
pub(super) fn queue_prefix(job_type: JobType) -> Vec<u8> {
    vec![job_type.tag()]
}

/// Upper bound for a range scan over one job type.
pub(super) fn queue_prefix_end(job_type: JobType) -> Vec<u8> {
    let mut end = Vec::with_capacity(1 + 8);
    end.push(job_type.tag());
    end.extend_from_slice(&[0xFF; 8 + 36 + 4]);
    end
}

/// State key marking the live job of a global (wallet-less) job type.
pub(super) fn global_marker_key(job_type: JobType) -> String {
    format!("active_global_{}", job_type.as_str())
}

// =============================================================================
// Job Settings
// =============================================================================

/// Retry policy applied to every job unless the job carries its own cap.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Attempts before a retryable failure becomes terminal.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Ceiling on the computed delay.
    pub retry_max_delay: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(900),
        }
    }
}

impl JobSettings {
    /// Delay before retry number `retry_count` (1-based) re-enters the queue.
    ///
    /// Exponential: `base * 2^(retry_count - 1)`, capped at `retry_max_delay`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let shift = retry_count.saturating_sub(1).min(32);
        let delay = self.retry_base_delay.saturating_mul(1u32 << shift.min(31));
        delay.min(self.retry_max_delay)
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// Embedded ACID job ledger shared by the API and the workers.
pub struct Ledger {
    pub(super) db: Database,
    pub(super) settings: JobSettings,
}

impl Ledger {
    /// Open (or create) the ledger at the given path.
    pub fn open(path: &Path, settings: JobSettings) -> LedgerResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(WALLETS)?;
            let _ = write_txn.open_table(USER_WALLETS)?;
            let _ = write_txn.open_table(JOBS)?;
            let _ = write_txn.open_table(JOB_QUEUE)?;
            let _ = write_txn.open_table(WITHDRAWALS)?;
            let _ = write_txn.open_table(LEDGER_STATE)?;
        }
        write_txn.commit()?;

        Ok(Self { db, settings })
    }

    /// The retry policy this ledger was opened with.
    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    /// Read a u32 counter from ledger_state, defaulting when absent.
    pub(super) fn read_counter(
        table: &impl redb::ReadableTable<&'static str, &'static [u8]>,
        key: &str,
        default: u32,
    ) -> LedgerResult<u32> {
        match table.get(key)? {
            Some(v) => {
                let bytes = v.value();
                if bytes.len() >= 4 {
                    Ok(u32::from_be_bytes(bytes[..4].try_into().unwrap_or([0; 4])))
                } else {
                    Ok(default)
                }
            }
            None => Ok(default),
        }
    }
}
