// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared application state handed to every API handler.

use std::sync::Arc;

use aes_gcm::aead::{rand_core::RngCore, OsRng};

use crate::chain::ChainClient;
use crate::config::Config;
use crate::keys::KeyDeriver;
use crate::storage::{Ledger, LedgerResult, NewWalletKeys, WalletRecord};
use crate::vault::SecretVault;
use crate::workers::WorkerContext;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub chain: Arc<dyn ChainClient>,
    pub deriver: Arc<KeyDeriver>,
    pub vault: Arc<SecretVault>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Create (or fetch) the custodied wallet for a user.
    ///
    /// Fresh wallets get 32 bytes of per-user entropy which is mixed into the
    /// key derivation and stored vault-encrypted on the row; the plaintext
    /// entropy never leaves this function.
    pub fn create_wallet(&self, user_id: &str) -> LedgerResult<(WalletRecord, bool)> {
        let mut entropy = [0u8; 32];
        OsRng.fill_bytes(&mut entropy);

        self.ledger.create_wallet(user_id, |index| {
            let key = self
                .deriver
                .derive(index, Some(&entropy))
                .map_err(|e| e.to_string())?;
            let entropy_enc = self.vault.encrypt(&entropy).map_err(|e| e.to_string())?;
            Ok(NewWalletKeys {
                address: key.address,
                derivation_path: key.derivation_path,
                entropy_enc,
            })
        })
    }

    /// The same dependency set, shaped for the background workers.
    pub fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            ledger: Arc::clone(&self.ledger),
            chain: Arc::clone(&self.chain),
            deriver: Arc::clone(&self.deriver),
            vault: Arc::clone(&self.vault),
            config: Arc::clone(&self.config),
        }
    }
}
