// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deterministic in-memory chain for worker tests.
//!
//! Balances are seeded by the test, transfers mutate them, and failures are
//! scripted explicitly. Transaction ids are sequential.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;

use super::{ChainClient, ChainError, TxReceiptInfo};

/// One transfer the fake accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransfer {
    pub kind: TransferKind,
    pub from: String,
    pub to: String,
    pub amount: U256,
    pub tx_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Token,
    Native,
}

#[derive(Default)]
struct FakeState {
    token_balances: HashMap<String, U256>,
    native_balances: HashMap<String, U256>,
    sent: Vec<SentTransfer>,
    queued_send_failures: VecDeque<ChainError>,
    receipts: HashMap<String, TxReceiptInfo>,
    next_tx: u64,
}

/// Scriptable [`ChainClient`] double.
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<FakeState>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_token_balance(&self, address: &str, amount: U256) {
        let mut state = self.state.lock().unwrap();
        state
            .token_balances
            .insert(address.to_lowercase(), amount);
    }

    pub fn set_native_balance(&self, address: &str, amount: U256) {
        let mut state = self.state.lock().unwrap();
        state
            .native_balances
            .insert(address.to_lowercase(), amount);
    }

    /// Queue an error returned by the next send (FIFO across both kinds).
    pub fn queue_send_failure(&self, error: ChainError) {
        self.state
            .lock()
            .unwrap()
            .queued_send_failures
            .push_back(error);
    }

    /// Record a receipt for a transaction id.
    pub fn set_receipt(&self, tx_id: &str, receipt: TxReceiptInfo) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(tx_id.to_string(), receipt);
    }

    /// All transfers accepted so far.
    pub fn sent(&self) -> Vec<SentTransfer> {
        self.state.lock().unwrap().sent.clone()
    }

    fn send(
        &self,
        kind: TransferKind,
        signer: PrivateKeySigner,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.queued_send_failures.pop_front() {
            return Err(error);
        }

        let from = signer.address().to_string().to_lowercase();
        let to = to.to_lowercase();
        state.next_tx += 1;
        let tx_id = format!("0xfeed{:064}", state.next_tx);

        let balances = match kind {
            TransferKind::Token => &mut state.token_balances,
            TransferKind::Native => &mut state.native_balances,
        };
        if let Some(balance) = balances.get_mut(&from) {
            *balance = balance.saturating_sub(amount);
        }
        *balances.entry(to.clone()).or_default() += amount;

        // Broadcast-accepted transactions confirm successfully by default.
        let receipt = TxReceiptInfo {
            block_number: state.next_tx,
            success: true,
        };
        state.receipts.insert(tx_id.clone(), receipt);
        state.sent.push(SentTransfer {
            kind,
            from,
            to,
            amount,
            tx_id: tx_id.clone(),
        });
        Ok(tx_id)
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn token_balance(&self, address: &str) -> Result<U256, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .token_balances
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn native_balance(&self, address: &str) -> Result<U256, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .native_balances
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn send_token(
        &self,
        signer: PrivateKeySigner,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError> {
        self.send(TransferKind::Token, signer, to, amount)
    }

    async fn send_native(
        &self,
        signer: PrivateKeySigner,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError> {
        self.send(TransferKind::Native, signer, to, amount)
    }

    async fn transaction_status(
        &self,
        tx_id: &str,
    ) -> Result<Option<TxReceiptInfo>, ChainError> {
        Ok(self.state.lock().unwrap().receipts.get(tx_id).copied())
    }
}
