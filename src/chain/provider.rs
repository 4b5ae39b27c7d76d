//! Timeout-bounded JSON-RPC endpoint

use super::validator::{ChainEndpoint, NameResolver};
use crate::error::{SweeperError, SweeperResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

lazy_static::lazy_static! {
    /// `balanceOf(address)` selector
    static ref BALANCE_OF: [u8; 4] = ethers::utils::id("balanceOf(address)");
}

/// A single HTTP RPC endpoint where every call carries the same timeout
#[derive(Clone)]
pub struct RpcEndpoint {
    url: String,
    provider: Provider<Http>,
    timeout: Duration,
}

impl RpcEndpoint {
    pub fn new(url: &str, timeout: Duration) -> SweeperResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| SweeperError::Config(format!("Invalid RPC url {}: {}", url, e)))?
            .interval(Duration::from_millis(500));

        debug!("Added HTTP provider: {}", url);

        Ok(Self {
            url: url.to_string(),
            provider,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn http(&self) -> &Provider<Http> {
        &self.provider
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Await an RPC call, mapping both provider errors and elapsed timeouts
    pub(crate) async fn bounded<T, E, F>(&self, operation: &str, call: F) -> SweeperResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SweeperError::upstream(&self.url, e)),
            Err(_) => Err(SweeperError::Timeout {
                operation: format!("{} on {}", operation, self.url),
            }),
        }
    }

    pub async fn block_number(&self) -> SweeperResult<u64> {
        self.bounded("eth_blockNumber", self.provider.get_block_number())
            .await
            .map(|n| n.as_u64())
    }

    pub async fn get_balance(&self, address: Address) -> SweeperResult<U256> {
        self.bounded("eth_getBalance", self.provider.get_balance(address, None))
            .await
    }

    pub async fn get_code(&self, address: Address) -> SweeperResult<Bytes> {
        self.bounded("eth_getCode", self.provider.get_code(address, None))
            .await
    }

    /// ERC-20 `balanceOf` via `eth_call`
    pub async fn token_balance(&self, token: Address, owner: Address) -> SweeperResult<U256> {
        let mut data = BALANCE_OF.to_vec();
        data.extend_from_slice(&ethers::abi::encode(&[ethers::abi::Token::Address(owner)]));

        let call: TypedTransaction = TransactionRequest::new().to(token).data(data).into();
        let raw = self
            .bounded("balanceOf", self.provider.call(&call, None))
            .await?;

        if raw.len() < 32 {
            return Err(SweeperError::upstream(
                &self.url,
                format!("short balanceOf response from {:?}", token),
            ));
        }
        Ok(U256::from_big_endian(&raw[..32]))
    }

    /// Balance of the native asset (`None`) or an ERC-20 token
    pub async fn asset_balance(&self, token: Option<Address>, owner: Address) -> SweeperResult<U256> {
        match token {
            Some(token) => self.token_balance(token, owner).await,
            None => self.get_balance(owner).await,
        }
    }

    pub async fn resolve_name(&self, name: &str) -> SweeperResult<Option<Address>> {
        match tokio::time::timeout(self.timeout, self.provider.resolve_name(name)).await {
            Ok(Ok(address)) => Ok(Some(address)),
            // ethers reports an unregistered name as an ENS error
            Ok(Err(ProviderError::EnsError(_))) | Ok(Err(ProviderError::EnsNotOwned(_))) => Ok(None),
            Ok(Err(e)) => Err(SweeperError::upstream(&self.url, e)),
            Err(_) => Err(SweeperError::Timeout {
                operation: format!("resolve {} on {}", name, self.url),
            }),
        }
    }

    pub async fn health_check(&self) -> bool {
        self.block_number().await.is_ok()
    }
}

#[async_trait]
impl ChainEndpoint for RpcEndpoint {
    fn label(&self) -> String {
        self.url.clone()
    }

    async fn has_activity(&self, address: Address) -> SweeperResult<bool> {
        let balance = self.get_balance(address).await?;
        if !balance.is_zero() {
            return Ok(true);
        }
        let code = self.get_code(address).await?;
        Ok(!code.as_ref().is_empty())
    }
}

#[async_trait]
impl NameResolver for RpcEndpoint {
    async fn resolve(&self, name: &str) -> SweeperResult<Option<Address>> {
        self.resolve_name(name).await
    }
}
