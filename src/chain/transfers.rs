//! Incoming transfer history and balances for watched wallets

use super::provider::RpcEndpoint;
use crate::error::SweeperResult;

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// A transfer into a watched wallet as reported by the data provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingTransfer {
    /// Provider-unique id, used to skip already recorded transfers
    pub source_id: String,
    pub from: Option<Address>,
    pub to: Address,
    /// `None` for the native asset
    pub token: Option<Address>,
    pub amount: U256,
    pub tx_hash: Option<String>,
    pub block_number: u64,
}

/// Where the next poll picks up.
///
/// While a truncated result is being paged through, the block range stays
/// pinned to the one the first page was requested with and `page_key` names
/// the next page. Once the last page is read the cursor moves past `to_block`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferCursor {
    pub from_block: u64,
    pub page: Option<PageCursor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub to_block: u64,
    pub page_key: String,
}

impl TransferCursor {
    pub fn at(from_block: u64) -> Self {
        Self {
            from_block,
            page: None,
        }
    }
}

/// One poll worth of transfers plus the cursor for the next poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferBatch {
    pub transfers: Vec<IncomingTransfer>,
    pub next: TransferCursor,
}

/// Chain data source used by the watch scheduler
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainDataProvider: Send + Sync {
    /// Transfers into `wallet` from the cursor up to the head, one page at a
    /// time. `None` starts at the current head.
    async fn incoming_transfers(
        &self,
        wallet: Address,
        cursor: Option<TransferCursor>,
    ) -> SweeperResult<TransferBatch>;

    /// Balance of the native asset (`token = None`) or an ERC-20 token
    async fn balance(&self, wallet: Address, token: Option<Address>) -> SweeperResult<U256>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetTransfersResponse {
    #[serde(default)]
    transfers: Vec<AssetTransfer>,
    page_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetTransfer {
    unique_id: String,
    hash: Option<String>,
    from: Option<String>,
    to: Option<String>,
    block_num: String,
    raw_contract: RawContract,
}

#[derive(Debug, Deserialize)]
struct RawContract {
    value: Option<String>,
    address: Option<String>,
}

fn parse_hex_u64(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

fn parse_hex_u256(raw: &str) -> Option<U256> {
    let digits = raw.trim_start_matches("0x");
    if digits.is_empty() {
        return Some(U256::zero());
    }
    U256::from_str_radix(digits, 16).ok()
}

impl IncomingTransfer {
    fn from_asset_transfer(raw: AssetTransfer) -> Option<Self> {
        let to = raw.to.as_deref()?.parse().ok()?;
        let amount = parse_hex_u256(raw.raw_contract.value.as_deref()?)?;
        let token = match raw.raw_contract.address.as_deref() {
            Some(addr) => Some(addr.parse().ok()?),
            None => None,
        };

        Some(Self {
            source_id: raw.unique_id,
            from: raw.from.as_deref().and_then(|a| a.parse().ok()),
            to,
            token,
            amount,
            tx_hash: raw.hash,
            block_number: parse_hex_u64(&raw.block_num)?,
        })
    }
}

/// Transfer history through `alchemy_getAssetTransfers`, balances through
/// plain JSON-RPC on the same endpoint
pub struct AlchemyDataProvider {
    endpoint: RpcEndpoint,
    max_count: usize,
}

impl AlchemyDataProvider {
    pub fn new(endpoint: RpcEndpoint, max_count: usize) -> Self {
        Self {
            endpoint,
            max_count,
        }
    }

    fn batch_from_response(
        response: AssetTransfersResponse,
        from_block: u64,
        to_block: u64,
    ) -> TransferBatch {
        let transfers: Vec<IncomingTransfer> = response
            .transfers
            .into_iter()
            .filter_map(|raw| {
                let id = raw.unique_id.clone();
                let parsed = IncomingTransfer::from_asset_transfer(raw);
                if parsed.is_none() {
                    warn!("Skipping unparseable transfer {}", id);
                }
                parsed
            })
            .collect();

        let next = match response.page_key {
            Some(page_key) => TransferCursor {
                from_block,
                page: Some(PageCursor {
                    to_block,
                    page_key,
                }),
            },
            None => TransferCursor::at(to_block + 1),
        };

        TransferBatch { transfers, next }
    }
}

#[async_trait]
impl ChainDataProvider for AlchemyDataProvider {
    async fn incoming_transfers(
        &self,
        wallet: Address,
        cursor: Option<TransferCursor>,
    ) -> SweeperResult<TransferBatch> {
        let (from, to, page_key) = match cursor {
            Some(TransferCursor {
                from_block,
                page: Some(page),
            }) => (from_block, page.to_block, Some(page.page_key)),
            Some(TransferCursor {
                from_block,
                page: None,
            }) => (from_block, self.endpoint.block_number().await?, None),
            None => {
                let head = self.endpoint.block_number().await?;
                (head, head, None)
            }
        };

        if from > to {
            return Ok(TransferBatch {
                transfers: Vec::new(),
                next: TransferCursor::at(from),
            });
        }

        let mut query = json!({
            "fromBlock": format!("0x{:x}", from),
            "toBlock": format!("0x{:x}", to),
            "toAddress": format!("{:?}", wallet),
            "excludeZeroValue": true,
            "category": ["external", "erc20"],
            "maxCount": format!("0x{:x}", self.max_count),
            "order": "asc",
        });
        if let Some(key) = &page_key {
            query["pageKey"] = json!(key);
        }

        let raw: serde_json::Value = self
            .endpoint
            .bounded(
                "alchemy_getAssetTransfers",
                self.endpoint
                    .http()
                    .request("alchemy_getAssetTransfers", json!([query])),
            )
            .await?;
        let response: AssetTransfersResponse = serde_json::from_value(raw)?;

        debug!(
            "Fetched {} transfers for {:?} in blocks {}..={}{}",
            response.transfers.len(),
            wallet,
            from,
            to,
            if page_key.is_some() { " (continued page)" } else { "" }
        );

        Ok(Self::batch_from_response(response, from, to))
    }

    async fn balance(&self, wallet: Address, token: Option<Address>) -> SweeperResult<U256> {
        self.endpoint.asset_balance(token, wallet).await
    }
}
