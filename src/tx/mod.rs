//! Transfer execution with nonce management and gas estimation
//!
//! The watch scheduler only sees [`TransferExecutor`]; everything below it
//! (signing, nonce allocation, sponsored submission) stays behind that
//! boundary.

mod executor;
mod gas;
mod nonce;

pub use executor::{ContractTransferExecutor, TransferExecutor, TransferReceipt, TransferRequest};
pub use gas::GasEstimator;
pub use nonce::NonceManager;

#[cfg(test)]
pub use executor::MockTransferExecutor;
