// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment at startup and validated
//! before anything else runs; a misconfigured process exits non-zero instead
//! of limping along.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the ledger database | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `RPC_URL` | Chain RPC endpoint | Required |
//! | `CHAIN_ID` | EVM chain id | `43113` (Fuji) |
//! | `TOKEN_ADDRESS` | Custodied ERC-20 contract address | Required |
//! | `TOKEN_DECIMALS` | Custodied token decimals | `6` |
//! | `TREASURY_ADDRESS` | Consolidation target address | Required |
//! | `VAULT_KEY` | 32-byte AES key, hex | Required |
//! | `MASTER_SEED_ENC` | Vault-encrypted master seed blob | Required |
//! | `COIN_TYPE` | BIP-44 coin type | `60` |
//! | `FUNDING_ACCOUNT_INDEX` | Derivation index of the gas funding wallet | `0` |
//! | `SWEEP_THRESHOLD` | Minimum sweep-worthy token balance | `10` |
//! | `MIN_GAS_BALANCE` | Native balance needed to pay a sweep fee | `0.01` |
//! | `GAS_TOPUP_AMOUNT` | Native amount sent per gas top-up | `0.05` |
//! | `JOB_MAX_RETRIES` | Default retry budget per job | `3` |
//! | `RETRY_BASE_DELAY_SECS` | Exponential backoff base | `30` |
//! | `RETRY_MAX_DELAY_SECS` | Backoff cap | `900` |
//! | `STALE_JOB_TIMEOUT_SECS` | Age before a job counts as stuck | `3600` |
//! | `WORKER_POLL_INTERVAL_SECS` | Idle worker queue poll interval | `5` |
//! | `SYNC_INTERVAL_SECS` | Balance sync scheduling interval | `300` |
//! | `RECONCILE_INTERVAL_SECS` | Reconciler sweep interval | `60` |
//! | `CHAIN_TIMEOUT_SECS` | Bound on each chain RPC call | `30` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::U256;

use crate::chain::parse_amount;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,

    pub rpc_url: String,
    pub chain_id: u64,
    pub token_address: String,
    pub token_decimals: u8,
    pub native_decimals: u8,
    pub treasury_address: String,

    pub vault_key_hex: String,
    pub master_seed_enc: String,
    pub coin_type: u32,
    pub funding_account_index: u32,

    pub sweep_threshold: U256,
    pub min_gas_balance: U256,
    pub gas_topup_amount: U256,

    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub stale_job_timeout: Duration,
    pub worker_poll_interval: Duration,
    pub sync_interval: Duration,
    pub reconcile_interval: Duration,
    pub chain_timeout: Duration,
}

impl Config {
    /// Load and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Lets tests supply variables without touching process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let native_decimals = 18u8;
        let token_decimals = parse_or("TOKEN_DECIMALS", &lookup, 6u8)?;

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or("PORT", &lookup, 8080u16)?,
            data_dir: PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "/data".to_string())),

            rpc_url: required("RPC_URL", &lookup)?,
            chain_id: parse_or("CHAIN_ID", &lookup, 43113u64)?,
            token_address: required("TOKEN_ADDRESS", &lookup)?,
            token_decimals,
            native_decimals,
            treasury_address: required("TREASURY_ADDRESS", &lookup)?,

            vault_key_hex: required("VAULT_KEY", &lookup)?,
            master_seed_enc: required("MASTER_SEED_ENC", &lookup)?,
            coin_type: parse_or("COIN_TYPE", &lookup, 60u32)?,
            funding_account_index: parse_or("FUNDING_ACCOUNT_INDEX", &lookup, 0u32)?,

            sweep_threshold: amount_or("SWEEP_THRESHOLD", &lookup, "10", token_decimals)?,
            min_gas_balance: amount_or("MIN_GAS_BALANCE", &lookup, "0.01", native_decimals)?,
            gas_topup_amount: amount_or("GAS_TOPUP_AMOUNT", &lookup, "0.05", native_decimals)?,

            max_retries: parse_or("JOB_MAX_RETRIES", &lookup, 3u32)?,
            retry_base_delay: secs_or("RETRY_BASE_DELAY_SECS", &lookup, 30)?,
            retry_max_delay: secs_or("RETRY_MAX_DELAY_SECS", &lookup, 900)?,
            stale_job_timeout: secs_or("STALE_JOB_TIMEOUT_SECS", &lookup, 3600)?,
            worker_poll_interval: secs_or("WORKER_POLL_INTERVAL_SECS", &lookup, 5)?,
            sync_interval: secs_or("SYNC_INTERVAL_SECS", &lookup, 300)?,
            reconcile_interval: secs_or("RECONCILE_INTERVAL_SECS", &lookup, 60)?,
            chain_timeout: secs_or("CHAIN_TIMEOUT_SECS", &lookup, 30)?,
        })
    }

    /// Path of the embedded ledger database file.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.redb")
    }
}

fn required(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    match lookup(name) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: u64,
) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_or(name, lookup, default)?))
}

fn amount_or(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: &str,
    decimals: u8,
) -> Result<U256, ConfigError> {
    let raw = lookup(name).unwrap_or_else(|| default.to_string());
    parse_amount(raw.trim(), decimals).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}
