// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Balance sync: refresh cached balances and derive the maintenance flags.
//!
//! `needs_consolidation` means the token balance reached the sweep
//! threshold. `needs_gas` is only raised for wallets that have something to
//! sweep but cannot pay for it; an empty wallet without gas needs nothing.
//! Wallets currently held by a job are skipped and picked up next round.

use tracing::warn;

use crate::storage::Job;

use super::{WorkerContext, WorkerError};

pub(super) async fn execute(
    ctx: &WorkerContext,
    job: &Job,
) -> Result<serde_json::Value, WorkerError> {
    let wallets = match &job.wallet_address {
        Some(address) => vec![ctx.ledger.require_wallet(address)?],
        None => ctx
            .ledger
            .list_wallets()?
            .into_iter()
            .filter(|w| !w.is_processing)
            .collect(),
    };

    let mut synced = 0u32;
    let mut flagged_consolidation = 0u32;
    let mut flagged_gas = 0u32;
    let mut errors: Vec<String> = Vec::new();
    let mut last_transient: Option<WorkerError> = None;
    let total = wallets.len();

    for wallet in wallets {
        let balances = async {
            let token = ctx.chain.token_balance(&wallet.address).await?;
            let native = ctx.chain.native_balance(&wallet.address).await?;
            Ok::<_, WorkerError>((token, native))
        }
        .await;

        let (token, native) = match balances {
            Ok(pair) => pair,
            Err(e) => {
                warn!(wallet = %wallet.address, error = %e, "balance sync failed");
                errors.push(format!("{}: {e}", wallet.address));
                if e.is_transient() {
                    last_transient = Some(e);
                }
                continue;
            }
        };

        let needs_consolidation = token >= ctx.config.sweep_threshold;
        let needs_gas = needs_consolidation && native < ctx.config.min_gas_balance;

        ctx.ledger.with_wallet_mut(&wallet.address, |w| {
            w.set_token_balance(token);
            w.set_native_balance(native);
            w.needs_consolidation = needs_consolidation;
            w.needs_gas = needs_gas;
        })?;

        synced += 1;
        if needs_consolidation {
            flagged_consolidation += 1;
        }
        if needs_gas {
            flagged_gas += 1;
        }
    }

    if synced == 0 && total > 0 {
        if let Some(e) = last_transient {
            return Err(e);
        }
    }

    Ok(serde_json::json!({
        "synced": synced,
        "flagged_consolidation": flagged_consolidation,
        "flagged_gas": flagged_gas,
        "errors": errors,
    }))
}
