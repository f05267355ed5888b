// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

mod api;
mod chain;
mod config;
mod error;
mod keys;
mod state;
mod storage;
mod vault;
mod workers;

#[cfg(not(test))]
use std::sync::Arc;

#[cfg(not(test))]
use tokio::net::TcpListener;
#[cfg(not(test))]
use tokio::signal;
#[cfg(not(test))]
use tokio_util::sync::CancellationToken;
#[cfg(not(test))]
use tracing::{error, info};
#[cfg(not(test))]
use tracing_subscriber::EnvFilter;

#[cfg(not(test))]
use chain::RpcChainClient;
#[cfg(not(test))]
use config::Config;
#[cfg(not(test))]
use keys::KeyDeriver;
#[cfg(not(test))]
use state::AppState;
#[cfg(not(test))]
use storage::{JobSettings, Ledger};
#[cfg(not(test))]
use vault::SecretVault;

#[cfg(not(test))]
#[tokio::main]
async fn main() {
    init_tracing();

    let config = startup(Config::from_env(), "load configuration");
    let vault = startup(
        SecretVault::from_hex_key(&config.vault_key_hex),
        "initialize vault",
    );
    let seed = startup(vault.decrypt(&config.master_seed_enc), "decrypt master seed");
    let deriver = startup(KeyDeriver::new(seed, config.coin_type), "build key deriver");
    let ledger = startup(
        Ledger::open(
            &config.ledger_path(),
            JobSettings {
                max_retries: config.max_retries,
                retry_base_delay: config.retry_base_delay,
                retry_max_delay: config.retry_max_delay,
            },
        ),
        "open ledger",
    );
    let chain = startup(
        RpcChainClient::new(&config.rpc_url, &config.token_address, config.chain_timeout),
        "build chain client",
    );

    let state = AppState {
        ledger: Arc::new(ledger),
        chain: Arc::new(chain),
        deriver: Arc::new(deriver),
        vault: Arc::new(vault),
        config: Arc::new(config),
    };

    let shutdown = CancellationToken::new();
    let workers = workers::spawn_workers(Arc::new(state.worker_context()), &shutdown);

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = startup(TcpListener::bind(&addr).await, "bind listener");
    info!(%addr, chain_id = state.config.chain_id, "custody server listening (docs at /docs)");

    let app = api::router(state);
    let serve = axum::serve(listener, app).with_graceful_shutdown({
        let token = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining");
            token.cancel();
        }
    });
    if let Err(e) = serve.await {
        error!(error = %e, "server error");
    }

    // Processing jobs left behind by an unclean stop are picked up by the
    // reconciler on the next boot, so a bounded drain is enough here.
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    info!("workers stopped");
}

#[cfg(not(test))]
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(not(test))]
fn startup<T, E: std::fmt::Display>(result: Result<T, E>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "failed to {what}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(test))]
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
