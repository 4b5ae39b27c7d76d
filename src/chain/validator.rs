//! Wallet and name validation across redundant chain endpoints
//!
//! Validation is a liveness check, not a quorum: the first endpoint that
//! reports balance or deployed code for the address decides the outcome.
//! Endpoint failures and timeouts are logged and count as "no vote".

use super::parse_address;
use crate::error::SweeperResult;

use async_trait::async_trait;
use ethers::types::Address;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One chain RPC endpoint that can vouch for an address
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainEndpoint: Send + Sync {
    /// Label used in logs
    fn label(&self) -> String;

    /// `true` when the address holds a non-zero balance or has code deployed
    async fn has_activity(&self, address: Address) -> SweeperResult<bool>;
}

/// Naming authority for human-readable wallet names
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> SweeperResult<Option<Address>>;
}

/// Transient outcome of a validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub resolved_address: Option<Address>,
}

impl ValidationResult {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            resolved_address: None,
        }
    }

    pub fn valid(address: Address) -> Self {
        Self {
            valid: true,
            resolved_address: Some(address),
        }
    }
}

/// Resolves names and races liveness checks over a fixed endpoint set
pub struct ChainValidator {
    resolver: Arc<dyn NameResolver>,
    endpoints: Vec<Arc<dyn ChainEndpoint>>,
    name_suffixes: Vec<String>,
    timeout: Duration,
}

impl ChainValidator {
    pub fn new(
        resolver: Arc<dyn NameResolver>,
        endpoints: Vec<Arc<dyn ChainEndpoint>>,
        name_suffixes: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            endpoints,
            name_suffixes: name_suffixes
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            timeout,
        }
    }

    /// Whether the input should go through the naming authority
    pub fn is_name(&self, input: &str) -> bool {
        let lower = input.to_ascii_lowercase();
        self.name_suffixes
            .iter()
            .any(|suffix| lower.len() > suffix.len() && lower.ends_with(suffix.as_str()))
    }

    /// Validate a raw address or a resolvable name.
    ///
    /// Never fails: every network problem ends up as an invalid result.
    pub async fn validate(&self, input: &str) -> ValidationResult {
        let input = input.trim();

        let address = if self.is_name(input) {
            match self.resolve(input).await {
                Some(address) => address,
                None => return ValidationResult::invalid(),
            }
        } else {
            match parse_address(input) {
                Some(address) => address,
                None => {
                    debug!("Rejected malformed wallet input without network calls");
                    return ValidationResult::invalid();
                }
            }
        };

        if self.first_affirmative(address).await {
            ValidationResult::valid(address)
        } else {
            info!("No endpoint vouched for {:?}", address);
            ValidationResult::invalid()
        }
    }

    async fn resolve(&self, name: &str) -> Option<Address> {
        match timeout(self.timeout, self.resolver.resolve(name)).await {
            Ok(Ok(Some(address))) if !address.is_zero() => Some(address),
            Ok(Ok(_)) => {
                info!("Name {} did not resolve", name);
                None
            }
            Ok(Err(e)) => {
                warn!("Name resolution failed for {}: {}", name, e);
                None
            }
            Err(_) => {
                warn!("Name resolution timed out for {}", name);
                None
            }
        }
    }

    /// Race every endpoint; the first `true` wins and the rest are dropped
    async fn first_affirmative(&self, address: Address) -> bool {
        let mut race: FuturesUnordered<_> = self
            .endpoints
            .iter()
            .map(|endpoint| {
                let endpoint = endpoint.clone();
                let limit = self.timeout;
                async move {
                    let outcome = timeout(limit, endpoint.has_activity(address)).await;
                    (endpoint.label(), outcome)
                }
            })
            .collect();

        while let Some((label, outcome)) = race.next().await {
            match outcome {
                Ok(Ok(true)) => {
                    debug!("{} vouched for {:?}", label, address);
                    crate::metrics::record_validation(true);
                    return true;
                }
                Ok(Ok(false)) => debug!("{} reports no activity for {:?}", label, address),
                Ok(Err(e)) => warn!("Chain validation error from {}: {}", label, e),
                Err(_) => warn!("Chain validation timed out on {}", label),
            }
        }

        crate::metrics::record_validation(false);
        false
    }
}
