//! Warpcast and Farcaster HTTP clients
//!
//! - FID primary-address lookup, used to decide gas sponsorship
//! - Programmable direct casts, used to deliver revoke exports

use crate::config::FarcasterConfig;
use crate::error::{SweeperError, SweeperResult};

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

fn http_client() -> SweeperResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| SweeperError::Config(format!("Failed to create HTTP client: {}", e)))
}

#[derive(Debug, Deserialize)]
struct PrimaryAddressResponse {
    result: PrimaryAddressResult,
}

#[derive(Debug, Deserialize)]
struct PrimaryAddressResult {
    address: PrimaryAddress,
}

#[derive(Debug, Deserialize)]
struct PrimaryAddress {
    address: String,
}

/// Read-only Warpcast API client
#[derive(Clone)]
pub struct WarpcastClient {
    client: reqwest::Client,
    base_url: String,
}

impl WarpcastClient {
    pub fn new(base_url: &str) -> SweeperResult<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Primary Ethereum address registered for a Farcaster id
    pub async fn primary_address(&self, fid: u64) -> SweeperResult<Address> {
        let url = format!("{}/fc/primary-address", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("fid", fid.to_string()), ("protocol", "ethereum".to_string())])
            .send()
            .await
            .map_err(|e| SweeperError::upstream(&url, e))?
            .error_for_status()
            .map_err(|e| SweeperError::upstream(&url, e))?;

        let body: PrimaryAddressResponse = response
            .json()
            .await
            .map_err(|e| SweeperError::upstream(&url, e))?;

        body.result
            .address
            .address
            .parse()
            .map_err(|e| SweeperError::upstream(&url, format!("bad primary address: {}", e)))
    }

    /// Whether `wallet` is the FID's primary address
    pub async fn is_primary_address(&self, fid: u64, wallet: Address) -> SweeperResult<bool> {
        let primary = self.primary_address(fid).await?;
        debug!("FID {} primary address {:?}", fid, primary);
        Ok(primary == wallet)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DirectCastRequest<'a> {
    recipient_fid: u64,
    text: &'a str,
    attachments: Vec<DirectCastAttachment<'a>>,
    idempotency_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DirectCastAttachment<'a> {
    file_name: &'a str,
    content_type: &'a str,
    content: &'a str,
}

/// Sends programmable direct casts
#[derive(Clone)]
pub struct DirectCastClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl DirectCastClient {
    pub fn new(url: &str, api_key: Option<String>) -> SweeperResult<Self> {
        Ok(Self {
            client: http_client()?,
            url: url.to_string(),
            api_key,
        })
    }

    /// Build from config; `None` when no direct-cast endpoint is configured
    pub fn from_config(config: &FarcasterConfig) -> SweeperResult<Option<Self>> {
        let Some(url) = config.direct_cast_url.as_deref() else {
            return Ok(None);
        };
        let api_key = std::env::var(&config.api_key_env).ok();
        Self::new(url, api_key).map(Some)
    }

    /// Send `text` with one JSON attachment. Returns once the endpoint has
    /// accepted the cast.
    pub async fn send(
        &self,
        fid: u64,
        text: &str,
        file_name: &str,
        json_content: &str,
    ) -> SweeperResult<()> {
        let payload = DirectCastRequest {
            recipient_fid: fid,
            text,
            attachments: vec![DirectCastAttachment {
                file_name,
                content_type: "application/json",
                content: json_content,
            }],
            idempotency_key: uuid::Uuid::new_v4().to_string(),
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        request
            .send()
            .await
            .map_err(|e| SweeperError::upstream(&self.url, e))?
            .error_for_status()
            .map_err(|e| SweeperError::upstream(&self.url, e))?;

        info!("Direct cast delivered to FID {}", fid);
        Ok(())
    }
}
