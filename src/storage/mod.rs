// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Storage Module
//!
//! Durable state for the custody pipeline, backed by a single embedded redb
//! database (pure Rust, ACID):
//!
//! - wallet rows with cached balances and the `is_processing` lock
//! - the job ledger and its per-type pending queue
//! - user-facing withdrawal records
//!
//! One [`Ledger`] instance is constructed at startup and shared by the API
//! and all workers. redb write transactions are the concurrency mechanism:
//! claim, enqueue-with-lock and state transitions each happen inside one
//! atomic transaction, so no row is ever read-then-written without
//! exclusivity.

pub mod jobs;
pub mod ledger;
pub mod wallets;
pub mod withdrawals;

pub use jobs::{Job, JobFilter, JobStatus, JobSummary, JobType, NewJob};
pub use ledger::{JobSettings, Ledger, LedgerError, LedgerResult};
pub use wallets::{NewWalletKeys, WalletRecord};
pub use withdrawals::{WithdrawalRecord, WithdrawalStatus};
