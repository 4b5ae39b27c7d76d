//! Sweep transaction submission

use super::gas::GasEstimator;
use super::nonce::{NonceLease, NonceManager};
use crate::chain::RpcEndpoint;
use crate::config::ExecutorConfig;
use crate::error::{SweeperError, SweeperResult, TransferFailure};

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

lazy_static::lazy_static! {
    static ref PERFORM_TRANSFER: [u8; 4] =
        ethers::utils::id("performTransfer(address,address,address,uint256)");
}

/// A sweep decided by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub session_id: Uuid,
    pub from: Address,
    pub to: Address,
    /// `None` for the native asset
    pub token: Option<Address>,
    pub amount: U256,
    /// Route through the fee sponsor instead of the signer's own gas
    pub sponsored: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub tx_hash: H256,
}

/// Submits decided transfers on chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(&self, request: TransferRequest) -> Result<TransferReceipt, TransferFailure>;
}

/// Calls the sweep contract with a backend signer; sponsored requests are
/// submitted through the sponsor endpoint
pub struct ContractTransferExecutor {
    direct: RpcEndpoint,
    sponsor: Option<RpcEndpoint>,
    contract: Address,
    wallet: LocalWallet,
    nonces: Arc<NonceManager>,
    gas: GasEstimator,
    submit_timeout: Duration,
}

impl ContractTransferExecutor {
    pub fn from_config(config: &ExecutorConfig) -> SweeperResult<Self> {
        let wallet = Self::load_wallet(&config.private_key_env)?.with_chain_id(config.chain_id);
        let submit_timeout = Duration::from_millis(config.submit_timeout_ms);

        let contract: Address = config
            .contract_address
            .parse()
            .map_err(|e| SweeperError::Config(format!("Invalid contract address: {}", e)))?;

        let direct = RpcEndpoint::new(&config.rpc_url, submit_timeout)?;
        let sponsor = config
            .sponsor_rpc_url
            .as_deref()
            .map(|url| RpcEndpoint::new(url, submit_timeout))
            .transpose()?;

        info!(
            "Transfer executor initialized with signer {:?} on chain {}",
            wallet.address(),
            config.chain_id
        );

        Ok(Self {
            direct,
            sponsor,
            contract,
            nonces: Arc::new(NonceManager::new(wallet.address())),
            wallet,
            gas: GasEstimator::new(),
            submit_timeout,
        })
    }

    fn load_wallet(env_var: &str) -> SweeperResult<LocalWallet> {
        let key = std::env::var(env_var).map_err(|_| {
            SweeperError::Config(format!("No signer configured. Set {}", env_var))
        })?;
        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| SweeperError::Config(format!("Invalid private key: {}", e)))
    }

    pub fn signer_address(&self) -> Address {
        self.wallet.address()
    }

    /// `performTransfer(user, token, to, amount)`; the zero address selects
    /// the native asset
    pub fn encode_call(request: &TransferRequest) -> Bytes {
        let mut data = PERFORM_TRANSFER.to_vec();
        data.extend_from_slice(&abi::encode(&[
            Token::Address(request.from),
            Token::Address(request.token.unwrap_or_else(Address::zero)),
            Token::Address(request.to),
            Token::Uint(request.amount),
        ]));
        data.into()
    }

    fn endpoint_for(&self, request: &TransferRequest) -> &RpcEndpoint {
        match (&self.sponsor, request.sponsored) {
            (Some(sponsor), true) => sponsor,
            (None, true) => {
                warn!("Sponsored transfer requested but no sponsor endpoint configured");
                &self.direct
            }
            _ => &self.direct,
        }
    }

    async fn submit(
        &self,
        endpoint: &RpcEndpoint,
        request: &TransferRequest,
        lease: NonceLease,
    ) -> Result<TransferReceipt, TransferFailure> {
        let started = Instant::now();
        let provider = endpoint.http();

        let data = Self::encode_call(request);
        debug!(
            "Session {} calldata 0x{}",
            request.session_id,
            hex::encode(&data)
        );

        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(self.contract)
            .data(data)
            .nonce(lease.nonce())
            .chain_id(self.wallet.chain_id())
            .into();

        let (gas_limit, gas_price) = self.gas.quote(provider, &tx).await?;
        tx.set_gas(gas_limit);
        tx.set_gas_price(gas_price);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| TransferFailure::Signer(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let timeout_ms = self.submit_timeout.as_millis() as u64;
        // Until the node accepts the transaction, dropping `lease` hands the
        // nonce back
        let pending = match timeout(self.submit_timeout, provider.send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => pending,
            Ok(Err(e)) => return Err(TransferFailure::from_rpc_message(e.to_string())),
            Err(_) => {
                // The node may have it
                lease.settle();
                return Err(TransferFailure::Timeout(timeout_ms));
            }
        };
        let nonce = lease.settle();

        let tx_hash = pending.tx_hash();
        self.nonces.mark_pending(nonce, tx_hash).await;
        info!(
            "Transaction sent: {:?} (nonce {}, {} pending)",
            tx_hash,
            nonce,
            self.nonces.pending_count().await
        );

        // Wait for inclusion so the next tick sees the post-sweep balance
        let remaining = self.submit_timeout.saturating_sub(started.elapsed());
        let receipt = match timeout(remaining, pending).await {
            Ok(Ok(Some(receipt))) => receipt,
            Ok(Ok(None)) => {
                return Err(TransferFailure::Submission(format!(
                    "transaction {:?} dropped",
                    tx_hash
                )))
            }
            Ok(Err(e)) => return Err(TransferFailure::Submission(e.to_string())),
            Err(_) => return Err(TransferFailure::Timeout(timeout_ms)),
        };

        self.nonces.confirm(nonce).await;

        if receipt.status == Some(U64::zero()) {
            return Err(TransferFailure::Reverted(format!("{:?}", tx_hash)));
        }

        Ok(TransferReceipt { tx_hash })
    }
}

#[async_trait]
impl TransferExecutor for ContractTransferExecutor {
    async fn execute(&self, request: TransferRequest) -> Result<TransferReceipt, TransferFailure> {
        let endpoint = self.endpoint_for(&request);

        let lease = self
            .nonces
            .lease(endpoint.http())
            .await
            .map_err(|e| TransferFailure::Submission(e.to_string()))?;

        // Failures before broadcast return the nonce through the lease
        match self.submit(endpoint, &request, lease).await {
            Ok(receipt) => Ok(receipt),
            Err(failure) => {
                if let TransferFailure::Submission(message) = &failure {
                    if message.contains("nonce too low") {
                        warn!("Nonce too low, resyncing");
                        if let Err(e) = self.nonces.sync(endpoint.http()).await {
                            error!("Nonce resync failed: {}", e);
                        }
                    }
                }
                Err(failure)
            }
        }
    }
}
