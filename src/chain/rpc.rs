// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Alloy-backed [`ChainClient`] implementation.
//!
//! Every RPC call is wrapped in a bounded timeout; a timeout is reported as
//! a transient error so the owning job retries with backoff instead of
//! wedging a worker.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use alloy::{
    network::{Ethereum, EthereumWallet},
    primitives::{Address, U256},
    providers::{
        fillers::{BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;

use super::erc20::IERC20;
use super::{ChainClient, ChainError, TxReceiptInfo};

/// Read-only HTTP provider type (with all fillers).
type HttpProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider<Ethereum>,
>;

/// Signing HTTP provider type: the read-only stack plus a wallet filler.
type SigningProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider<Ethereum>,
>;

/// Production chain client over HTTP JSON-RPC.
pub struct RpcChainClient {
    rpc_url: url::Url,
    token_address: Address,
    timeout: Duration,
    provider: HttpProvider,
}

impl RpcChainClient {
    /// Create a client for the given endpoint and custodied-token contract.
    pub fn new(
        rpc_url: &str,
        token_address: &str,
        timeout: Duration,
    ) -> Result<Self, ChainError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainError::InvalidRpcUrl(e.to_string()))?;
        let token_address = parse_address(token_address)?;
        let provider = ProviderBuilder::new().connect_http(url.clone());

        Ok(Self {
            rpc_url: url,
            token_address,
            timeout,
            provider,
        })
    }

    /// Build a signing provider for one broadcast.
    fn signing_provider(&self, signer: PrivateKeySigner) -> SigningProvider {
        ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(self.rpc_url.clone())
    }

    /// Apply the configured timeout to a chain call.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, ChainError>
    where
        F: Future<Output = Result<T, ChainError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ChainError::Timeout(self.timeout))?
    }
}

fn parse_address(raw: &str) -> Result<Address, ChainError> {
    Address::from_str(raw).map_err(|e| ChainError::InvalidAddress(format!("{raw}: {e}")))
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn token_balance(&self, address: &str) -> Result<U256, ChainError> {
        let addr = parse_address(address)?;
        let contract = IERC20::new(self.token_address, self.provider.clone());
        self.bounded(async {
            contract
                .balanceOf(addr)
                .call()
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn native_balance(&self, address: &str) -> Result<U256, ChainError> {
        let addr = parse_address(address)?;
        self.bounded(async {
            self.provider
                .get_balance(addr)
                .await
                .map_err(|e| ChainError::Rpc(e.to_string()))
        })
        .await
    }

    async fn send_token(
        &self,
        signer: PrivateKeySigner,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError> {
        let to_addr = parse_address(to)?;
        let provider = self.signing_provider(signer);
        let contract = IERC20::new(self.token_address, provider);

        self.bounded(async {
            let pending = contract
                .transfer(to_addr, amount)
                .send()
                .await
                .map_err(|e| ChainError::Broadcast(e.to_string()))?;
            Ok(format!("{:?}", pending.tx_hash()))
        })
        .await
    }

    async fn send_native(
        &self,
        signer: PrivateKeySigner,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError> {
        let to_addr = parse_address(to)?;
        let provider = self.signing_provider(signer);
        let tx = TransactionRequest::default().to(to_addr).value(amount);

        self.bounded(async {
            let pending = provider
                .send_transaction(tx)
                .await
                .map_err(|e| ChainError::Broadcast(e.to_string()))?;
            Ok(format!("{:?}", pending.tx_hash()))
        })
        .await
    }

    async fn transaction_status(
        &self,
        tx_id: &str,
    ) -> Result<Option<TxReceiptInfo>, ChainError> {
        let hash = tx_id
            .parse()
            .map_err(|e| ChainError::InvalidAddress(format!("invalid tx hash {tx_id}: {e}")))?;

        let receipt = self
            .bounded(async {
                self.provider
                    .get_transaction_receipt(hash)
                    .await
                    .map_err(|e| ChainError::Rpc(e.to_string()))
            })
            .await?;

        Ok(receipt.map(|r| TxReceiptInfo {
            block_number: r.block_number.unwrap_or(0),
            success: r.status(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_rpc_url() {
        let result = RpcChainClient::new(
            "not a url",
            "0x76568BEd5Acf1A5Cd888773C8cAe9ea2a9131A63",
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ChainError::InvalidRpcUrl(_))));
    }

    #[test]
    fn rejects_bad_token_address() {
        let result = RpcChainClient::new(
            "https://api.avax-test.network/ext/bc/C/rpc",
            "0xnot-an-address",
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ChainError::InvalidAddress(_))));
    }
}
