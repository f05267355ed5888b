// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Wallet rows: one per custodied user address.
//!
//! A wallet row caches the last-synced balances, carries the maintenance
//! flags the sweep and top-up workers act on, and holds the `is_processing`
//! lock that serializes jobs per wallet. Private keys are never stored; the
//! row keeps the HD account index and the vault-encrypted per-user entropy
//! needed to re-derive them.

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};

use super::ledger::{Ledger, LedgerError, LedgerResult, LEDGER_STATE, NEXT_INDEX_KEY, USER_WALLETS, WALLETS};

/// A custodied wallet as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    /// Checksummed on-chain address.
    pub address: String,
    /// Owning user.
    pub user_id: String,
    /// HD account index this wallet's key derives from.
    pub derivation_index: u32,
    /// Full derivation path, for audit.
    pub derivation_path: String,
    /// Vault-encrypted per-user entropy blob.
    pub entropy_enc: String,
    /// Last-synced custodied-token balance, base units (decimal string).
    pub token_balance: String,
    /// Last-synced native balance, wei (decimal string).
    pub native_balance: String,
    /// Token balance is at or above the sweep threshold.
    pub needs_consolidation: bool,
    /// Native balance is too low to pay for a sweep.
    pub needs_gas: bool,
    /// A job currently holds this wallet.
    pub is_processing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletRecord {
    /// Cached token balance as a number. Zero if the row predates a sync.
    pub fn token_balance(&self) -> U256 {
        self.token_balance.parse().unwrap_or_default()
    }

    /// Cached native balance as a number.
    pub fn native_balance(&self) -> U256 {
        self.native_balance.parse().unwrap_or_default()
    }

    pub fn set_token_balance(&mut self, amount: U256) {
        self.token_balance = amount.to_string();
    }

    pub fn set_native_balance(&mut self, amount: U256) {
        self.native_balance = amount.to_string();
    }
}

/// Key material produced when a wallet is first created.
///
/// The ledger hands the derivation closure the next free account index and
/// stores what comes back; it never sees the private key itself.
pub struct NewWalletKeys {
    pub address: String,
    pub derivation_path: String,
    pub entropy_enc: String,
}

// =============================================================================
// Shared table helpers (used by the job repository inside its transactions)
// =============================================================================

pub(super) fn load_wallet(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    address: &str,
) -> LedgerResult<Option<WalletRecord>> {
    match table.get(address.to_lowercase().as_str())? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

pub(super) fn store_wallet(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    wallet: &WalletRecord,
) -> LedgerResult<()> {
    let json = serde_json::to_vec(wallet)?;
    table.insert(wallet.address.to_lowercase().as_str(), json.as_slice())?;
    Ok(())
}

/// Flip `is_processing` on, failing with [`LedgerError::WalletBusy`] if it
/// already is. Returns the locked row.
pub(super) fn lock_wallet(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    address: &str,
) -> LedgerResult<WalletRecord> {
    let mut wallet = load_wallet(table, address)?
        .ok_or_else(|| LedgerError::NotFound(format!("wallet {address}")))?;
    if wallet.is_processing {
        return Err(LedgerError::WalletBusy(wallet.address.clone()));
    }
    wallet.is_processing = true;
    wallet.updated_at = Utc::now();
    store_wallet(table, &wallet)?;
    Ok(wallet)
}

/// Flip `is_processing` off. Missing rows are ignored; unlock runs on
/// terminal transitions and must not fail them.
pub(super) fn unlock_wallet(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    address: &str,
) -> LedgerResult<()> {
    if let Some(mut wallet) = load_wallet(table, address)? {
        if wallet.is_processing {
            wallet.is_processing = false;
            wallet.updated_at = Utc::now();
            store_wallet(table, &wallet)?;
        }
    }
    Ok(())
}

// =============================================================================
// Wallet Operations
// =============================================================================

impl Ledger {
    /// Create the wallet for a user, or return the existing one.
    ///
    /// `make_keys` receives the next free HD account index and returns the
    /// derived address plus the encrypted entropy blob. Index assignment is
    /// monotonic and transactional, so two concurrent creates can never share
    /// an index. Returns `(wallet, created)`.
    pub fn create_wallet(
        &self,
        user_id: &str,
        make_keys: impl FnOnce(u32) -> Result<NewWalletKeys, String>,
    ) -> LedgerResult<(WalletRecord, bool)> {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut user_table = write_txn.open_table(USER_WALLETS)?;
            let mut wallet_table = write_txn.open_table(WALLETS)?;
            let mut state_table = write_txn.open_table(LEDGER_STATE)?;

            let existing = match user_table.get(user_id)? {
                Some(addr) => Some(addr.value().to_string()),
                None => None,
            };
            if let Some(address) = existing {
                let wallet = load_wallet(&wallet_table, &address)?
                    .ok_or_else(|| LedgerError::NotFound(format!("wallet {address}")))?;
                return Ok((wallet, false));
            }

            // Index 0 is the funding wallet; users start at 1.
            let index = Self::read_counter(&state_table, NEXT_INDEX_KEY, 1)?;
            let keys = make_keys(index).map_err(LedgerError::KeyDerivation)?;

            if load_wallet(&wallet_table, &keys.address)?.is_some() {
                return Err(LedgerError::Validation(format!(
                    "address {} already custodied",
                    keys.address
                )));
            }

            let now = Utc::now();
            let wallet = WalletRecord {
                address: keys.address,
                user_id: user_id.to_string(),
                derivation_index: index,
                derivation_path: keys.derivation_path,
                entropy_enc: keys.entropy_enc,
                token_balance: "0".to_string(),
                native_balance: "0".to_string(),
                needs_consolidation: false,
                needs_gas: false,
                is_processing: false,
                created_at: now,
                updated_at: now,
            };

            store_wallet(&mut wallet_table, &wallet)?;
            user_table.insert(user_id, wallet.address.to_lowercase().as_str())?;
            state_table.insert(NEXT_INDEX_KEY, (index + 1).to_be_bytes().as_slice())?;
            wallet
        };
        write_txn.commit()?;
        Ok((wallet, true))
    }

    /// Look up a wallet by on-chain address (case-insensitive).
    pub fn wallet(&self, address: &str) -> LedgerResult<Option<WalletRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WALLETS)?;
        load_wallet(&table, address)
    }

    /// Look up a wallet by address, erroring when absent.
    pub fn require_wallet(&self, address: &str) -> LedgerResult<WalletRecord> {
        self.wallet(address)?
            .ok_or_else(|| LedgerError::NotFound(format!("wallet {address}")))
    }

    /// Look up the wallet owned by a user.
    pub fn wallet_for_user(&self, user_id: &str) -> LedgerResult<Option<WalletRecord>> {
        let read_txn = self.db.begin_read()?;
        let user_table = read_txn.open_table(USER_WALLETS)?;
        let address = match user_table.get(user_id)? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let wallet_table = read_txn.open_table(WALLETS)?;
        load_wallet(&wallet_table, &address)
    }

    /// All custodied wallets, ordered by derivation index.
    pub fn list_wallets(&self) -> LedgerResult<Vec<WalletRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WALLETS)?;

        let mut wallets = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            wallets.push(serde_json::from_slice::<WalletRecord>(value.value())?);
        }
        wallets.sort_by_key(|w| w.derivation_index);
        Ok(wallets)
    }

    /// Read-modify-write a wallet row inside one transaction.
    pub fn with_wallet_mut(
        &self,
        address: &str,
        mutate: impl FnOnce(&mut WalletRecord),
    ) -> LedgerResult<WalletRecord> {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut table = write_txn.open_table(WALLETS)?;
            let mut wallet = load_wallet(&table, address)?
                .ok_or_else(|| LedgerError::NotFound(format!("wallet {address}")))?;
            mutate(&mut wallet);
            wallet.updated_at = Utc::now();
            store_wallet(&mut table, &wallet)?;
            wallet
        };
        write_txn.commit()?;
        Ok(wallet)
    }

    /// Wallets flagged for a sweep to the treasury.
    pub fn wallets_needing_consolidation(&self) -> LedgerResult<Vec<WalletRecord>> {
        Ok(self
            .list_wallets()?
            .into_iter()
            .filter(|w| w.needs_consolidation)
            .collect())
    }

    /// Wallets flagged as too low on gas to sweep.
    pub fn wallets_needing_gas(&self) -> LedgerResult<Vec<WalletRecord>> {
        Ok(self
            .list_wallets()?
            .into_iter()
            .filter(|w| w.needs_gas)
            .collect())
    }

    /// Take the `is_processing` lock outside a job transition.
    ///
    /// Jobs scoped to a wallet lock it at enqueue; batch workers that pick
    /// their targets at run time lock each one here, sweep it, and release
    /// with [`Self::release_wallet`]. Fails with [`LedgerError::WalletBusy`]
    /// when another job holds the wallet.
    pub fn try_lock_wallet(&self, address: &str) -> LedgerResult<WalletRecord> {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut table = write_txn.open_table(WALLETS)?;
            lock_wallet(&mut table, address)?
        };
        write_txn.commit()?;
        Ok(wallet)
    }

    /// Drop a lock taken with [`Self::try_lock_wallet`].
    pub fn release_wallet(&self, address: &str) -> LedgerResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(WALLETS)?;
            unlock_wallet(&mut table, address)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Clear `is_processing` on every wallet. Admin recovery only; returns
    /// how many rows were flipped.
    pub fn reset_processing_flags(&self) -> LedgerResult<usize> {
        let write_txn = self.db.begin_write()?;
        let cleared = {
            let mut table = write_txn.open_table(WALLETS)?;
            let locked: Vec<String> = {
                let mut locked = Vec::new();
                for entry in table.iter()? {
                    let (_, value) = entry?;
                    let wallet: WalletRecord = serde_json::from_slice(value.value())?;
                    if wallet.is_processing {
                        locked.push(wallet.address);
                    }
                }
                locked
            };
            for address in &locked {
                unlock_wallet(&mut table, address)?;
            }
            locked.len()
        };
        write_txn.commit()?;
        Ok(cleared)
    }
}
