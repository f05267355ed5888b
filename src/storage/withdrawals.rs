// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! User-facing withdrawal records.
//!
//! A withdrawal is the durable request a user sees; the job that executes it
//! is pipeline machinery. Both rows are created in one transaction, so there
//! is never a withdrawal without its job or vice versa.

use std::str::FromStr;

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::jobs::{insert_queue_entry, store_job, Job, JobStatus, JobType};
use super::ledger::{Ledger, LedgerError, LedgerResult, JOBS, JOB_QUEUE, USER_WALLETS, WALLETS, WITHDRAWALS};
use super::wallets::lock_wallet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Failed,
}

/// A withdrawal request as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WithdrawalRecord {
    pub id: String,
    pub user_id: String,
    /// Custodied wallet the funds leave from.
    pub wallet_address: String,
    /// External destination.
    pub to_address: String,
    /// Amount in token base units (decimal string).
    pub amount: String,
    /// Platform fee charged for the withdrawal, base units (decimal string).
    pub fee: String,
    pub status: WithdrawalStatus,
    pub tx_id: Option<String>,
    /// Failure reason, for support.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawalRecord {
    pub fn amount(&self) -> U256 {
        self.amount.parse().unwrap_or_default()
    }
}

fn load_withdrawal(
    table: &impl redb::ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> LedgerResult<Option<WithdrawalRecord>> {
    match table.get(id)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn store_withdrawal(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    record: &WithdrawalRecord,
) -> LedgerResult<()> {
    let json = serde_json::to_vec(record)?;
    table.insert(record.id.as_str(), json.as_slice())?;
    Ok(())
}

// =============================================================================
// Withdrawal Operations
// =============================================================================

impl Ledger {
    /// Accept a withdrawal: create the record, its job, and take the wallet
    /// lock, all in one transaction.
    ///
    /// Fails with [`LedgerError::WalletBusy`] when another job holds the
    /// user's wallet; nothing is persisted in that case.
    pub fn submit_withdrawal(
        &self,
        user_id: &str,
        to_address: &str,
        amount: U256,
        fee: U256,
    ) -> LedgerResult<(WithdrawalRecord, Job)> {
        if amount.is_zero() {
            return Err(LedgerError::Validation(
                "withdrawal amount must be positive".to_string(),
            ));
        }
        let to_address = Address::from_str(to_address)
            .map_err(|e| LedgerError::Validation(format!("invalid destination address: {e}")))?
            .to_string();

        let write_txn = self.db.begin_write()?;
        let (record, job) = {
            let user_table = write_txn.open_table(USER_WALLETS)?;
            let mut wallet_table = write_txn.open_table(WALLETS)?;
            let mut job_table = write_txn.open_table(JOBS)?;
            let mut queue_table = write_txn.open_table(JOB_QUEUE)?;
            let mut withdrawal_table = write_txn.open_table(WITHDRAWALS)?;

            let wallet_address = match user_table.get(user_id)? {
                Some(v) => v.value().to_string(),
                None => {
                    return Err(LedgerError::NotFound(format!(
                        "no wallet for user {user_id}"
                    )))
                }
            };
            let wallet = lock_wallet(&mut wallet_table, &wallet_address)?;

            let now = Utc::now();
            let record = WithdrawalRecord {
                id: Uuid::new_v4().to_string(),
                user_id: user_id.to_string(),
                wallet_address: wallet.address.clone(),
                to_address: to_address.clone(),
                amount: amount.to_string(),
                fee: fee.to_string(),
                status: WithdrawalStatus::Pending,
                tx_id: None,
                reason: None,
                created_at: now,
                updated_at: now,
            };

            let job = Job {
                id: Uuid::new_v4().to_string(),
                job_type: JobType::Withdrawal,
                status: JobStatus::Pending,
                wallet_address: Some(wallet.address),
                user_id: Some(user_id.to_string()),
                payload: serde_json::json!({
                    "withdrawal_id": record.id,
                    "to_address": to_address,
                    "amount": record.amount,
                }),
                tx_id: None,
                result: None,
                error_message: None,
                retry_count: 0,
                max_retries: self.settings.max_retries,
                not_before: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            };

            store_withdrawal(&mut withdrawal_table, &record)?;
            store_job(&mut job_table, &job)?;
            insert_queue_entry(&mut queue_table, &job)?;
            (record, job)
        };
        write_txn.commit()?;
        Ok((record, job))
    }

    /// Look up a single withdrawal.
    pub fn withdrawal(&self, id: &str) -> LedgerResult<Option<WithdrawalRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WITHDRAWALS)?;
        load_withdrawal(&table, id)
    }

    /// Withdrawals, optionally restricted to one user, newest first.
    pub fn list_withdrawals(
        &self,
        user_id: Option<&str>,
    ) -> LedgerResult<Vec<WithdrawalRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WITHDRAWALS)?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: WithdrawalRecord = serde_json::from_slice(value.value())?;
            if user_id.is_some_and(|u| u != record.user_id) {
                continue;
            }
            records.push(record);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Mark a withdrawal completed with its on-chain transaction id.
    pub fn complete_withdrawal(&self, id: &str, tx_id: &str) -> LedgerResult<WithdrawalRecord> {
        self.update_withdrawal(id, |record| {
            record.status = WithdrawalStatus::Completed;
            record.tx_id = Some(tx_id.to_string());
        })
    }

    /// Mark a withdrawal failed with a reason the user can be shown.
    pub fn fail_withdrawal(&self, id: &str, reason: &str) -> LedgerResult<WithdrawalRecord> {
        self.update_withdrawal(id, |record| {
            record.status = WithdrawalStatus::Failed;
            record.reason = Some(reason.to_string());
        })
    }

    fn update_withdrawal(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut WithdrawalRecord),
    ) -> LedgerResult<WithdrawalRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(WITHDRAWALS)?;
            let mut record = load_withdrawal(&table, id)?
                .ok_or_else(|| LedgerError::NotFound(format!("withdrawal {id}")))?;
            if record.status != WithdrawalStatus::Pending {
                return Err(LedgerError::InvalidTransition(format!(
                    "withdrawal {id} is no longer pending"
                )));
            }
            mutate(&mut record);
            record.updated_at = Utc::now();
            store_withdrawal(&mut table, &record)?;
            record
        };
        write_txn.commit()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{JobFilter, JobSettings, NewWalletKeys};

    const DEST: &str = "0x2222222222222222222222222222222222222222";

    fn temp_ledger() -> (Ledger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger =
            Ledger::open(&dir.path().join("ledger.redb"), JobSettings::default()).unwrap();
        (ledger, dir)
    }

    fn add_wallet(ledger: &Ledger, user: &str) -> String {
        let (wallet, _) = ledger
            .create_wallet(user, |i| {
                Ok(NewWalletKeys {
                    address: format!("0x{:040x}", i),
                    derivation_path: format!("m/44'/60'/0'/0/{i}"),
                    entropy_enc: "blob".to_string(),
                })
            })
            .unwrap();
        wallet.address
    }

    #[test]
    fn submit_creates_record_and_job_atomically() {
        let (ledger, _dir) = temp_ledger();
        let address = add_wallet(&ledger, "alice");

        let (record, job) = ledger
            .submit_withdrawal("alice", DEST, U256::from(1_000_000u64), U256::ZERO)
            .unwrap();

        assert_eq!(record.status, WithdrawalStatus::Pending);
        assert_eq!(record.amount(), U256::from(1_000_000u64));
        assert_eq!(record.fee, "0");
        assert_eq!(job.job_type, JobType::Withdrawal);
        assert_eq!(job.payload["withdrawal_id"], record.id);
        assert!(ledger.require_wallet(&address).unwrap().is_processing);

        let jobs = ledger
            .list_jobs(&JobFilter {
                job_type: Some(JobType::Withdrawal),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn submit_on_busy_wallet_persists_nothing() {
        let (ledger, _dir) = temp_ledger();
        add_wallet(&ledger, "alice");
        ledger
            .submit_withdrawal("alice", DEST, U256::from(1u64), U256::ZERO)
            .unwrap();

        let second = ledger.submit_withdrawal("alice", DEST, U256::from(2u64), U256::ZERO);
        assert!(matches!(second, Err(LedgerError::WalletBusy(_))));

        assert_eq!(ledger.list_withdrawals(Some("alice")).unwrap().len(), 1);
        assert_eq!(
            ledger.list_jobs(&JobFilter::default()).unwrap().len(),
            1
        );
    }

    #[test]
    fn submit_validates_inputs() {
        let (ledger, _dir) = temp_ledger();
        add_wallet(&ledger, "alice");

        assert!(matches!(
            ledger.submit_withdrawal("alice", DEST, U256::ZERO, U256::ZERO),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.submit_withdrawal("alice", "0xnope", U256::from(1u64), U256::ZERO),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            ledger.submit_withdrawal("nobody", DEST, U256::from(1u64), U256::ZERO),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn completion_and_failure_are_terminal() {
        let (ledger, _dir) = temp_ledger();
        add_wallet(&ledger, "alice");
        let (record, _) = ledger
            .submit_withdrawal("alice", DEST, U256::from(5u64), U256::ZERO)
            .unwrap();

        let done = ledger.complete_withdrawal(&record.id, "0xabc").unwrap();
        assert_eq!(done.status, WithdrawalStatus::Completed);
        assert_eq!(done.tx_id.as_deref(), Some("0xabc"));

        assert!(ledger.fail_withdrawal(&record.id, "late").is_err());
        assert!(ledger.complete_withdrawal(&record.id, "0xdef").is_err());
    }

    #[test]
    fn listing_filters_by_user() {
        let (ledger, _dir) = temp_ledger();
        add_wallet(&ledger, "alice");
        add_wallet(&ledger, "bob");
        ledger
            .submit_withdrawal("alice", DEST, U256::from(1u64), U256::ZERO)
            .unwrap();
        ledger
            .submit_withdrawal("bob", DEST, U256::from(2u64), U256::ZERO)
            .unwrap();

        assert_eq!(ledger.list_withdrawals(None).unwrap().len(), 2);
        assert_eq!(ledger.list_withdrawals(Some("bob")).unwrap().len(), 1);
        assert!(ledger.list_withdrawals(Some("carol")).unwrap().is_empty());
    }
}
