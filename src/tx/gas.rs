//! Gas limit and price quoting for sweep calls

use crate::error::TransferFailure;

use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use tracing::debug;

/// Adds safety buffers on top of node estimates
#[derive(Debug, Clone, Copy)]
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    pub fn buffered_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    pub fn buffered_price(&self, price: U256) -> U256 {
        price + price * self.gas_price_buffer_percent / 100
    }

    /// Gas limit and legacy gas price for `tx`.
    ///
    /// Estimation runs the call, so a revert surfaces here before anything
    /// is signed.
    pub async fn quote(
        &self,
        provider: &Provider<Http>,
        tx: &TypedTransaction,
    ) -> Result<(U256, U256), TransferFailure> {
        let estimate = provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| TransferFailure::from_rpc_message(e.to_string()))?;
        let price = provider
            .get_gas_price()
            .await
            .map_err(|e| TransferFailure::Submission(e.to_string()))?;

        let quote = (self.buffered_limit(estimate), self.buffered_price(price));
        debug!(
            "Gas quote: limit {} price {} (max fee {})",
            quote.0,
            quote.1,
            Self::calculate_cost(quote.0, quote.1)
        );
        Ok(quote)
    }

    /// Worst-case fee in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: U256) -> U256 {
        gas_limit * gas_price
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}
