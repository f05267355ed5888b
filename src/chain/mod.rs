// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chain access for the custody pipeline.
//!
//! Workers never talk to the network directly; they depend on the
//! [`ChainClient`] trait so production uses the alloy-backed RPC client and
//! tests inject a deterministic fake. Production control flow never contains
//! randomness.

pub mod erc20;
pub mod rpc;

#[cfg(test)]
pub mod fake;

use alloy::primitives::U256;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;

pub use rpc::RpcChainClient;

/// Errors from chain operations.
///
/// Transient errors (network, timeout, nonce races) drive the job retry
/// loop; everything else is fatal to the current attempt.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("chain call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ChainError {
    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Rpc(_) | ChainError::Broadcast(_) | ChainError::Timeout(_)
        )
    }
}

/// Outcome of a broadcast transaction lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceiptInfo {
    /// Block the transaction was included in.
    pub block_number: u64,
    /// Whether the transaction executed successfully.
    pub success: bool,
}

/// Boundary to the blockchain: balance reads, signed transfers, receipts.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Custodied-token balance of an address, in base units.
    async fn token_balance(&self, address: &str) -> Result<U256, ChainError>;

    /// Native (gas) balance of an address, in wei.
    async fn native_balance(&self, address: &str) -> Result<U256, ChainError>;

    /// Build, sign and broadcast a custodied-token transfer.
    /// Returns the transaction id on acceptance.
    async fn send_token(
        &self,
        signer: PrivateKeySigner,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError>;

    /// Build, sign and broadcast a native-currency transfer.
    async fn send_native(
        &self,
        signer: PrivateKeySigner,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError>;

    /// Look up the receipt for a broadcast transaction, if mined.
    async fn transaction_status(&self, tx_id: &str)
        -> Result<Option<TxReceiptInfo>, ChainError>;
}

/// Parse a human-readable amount into base units.
pub fn parse_amount(amount: &str, decimals: u8) -> Result<U256, ChainError> {
    let parts: Vec<&str> = amount.split('.').collect();

    if parts.len() > 2 || parts[0].is_empty() {
        return Err(ChainError::InvalidAmount(format!(
            "malformed amount `{amount}`"
        )));
    }

    let whole = parts[0]
        .parse::<u128>()
        .map_err(|_| ChainError::InvalidAmount(format!("malformed amount `{amount}`")))?;

    let decimal_part = if parts.len() == 2 {
        let dec_str = parts[1];
        if dec_str.len() > decimals as usize {
            return Err(ChainError::InvalidAmount(format!(
                "too many decimal places (max {decimals})"
            )));
        }
        let padded = format!("{:0<width$}", dec_str, width = decimals as usize);
        padded
            .parse::<u128>()
            .map_err(|_| ChainError::InvalidAmount(format!("malformed amount `{amount}`")))?
    } else {
        0u128
    };

    let multiplier = 10u128.pow(decimals as u32);
    let total = whole
        .checked_mul(multiplier)
        .and_then(|w| w.checked_add(decimal_part))
        .ok_or_else(|| ChainError::InvalidAmount("amount overflow".to_string()))?;

    Ok(U256::from(total))
}

/// Format base units into a human-readable amount.
pub fn format_amount(amount: U256, decimals: u8) -> String {
    if amount.is_zero() {
        return "0".to_string();
    }

    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let whole = amount / divisor;
    let remainder = amount % divisor;

    if remainder.is_zero() {
        whole.to_string()
    } else {
        let decimal_str = format!("{:0>width$}", remainder, width = decimals as usize);
        let trimmed = decimal_str.trim_end_matches('0');
        if trimmed.is_empty() {
            whole.to_string()
        } else {
            format!("{}.{}", whole, trimmed)
        }
    }
}
