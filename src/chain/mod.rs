//! Chain module - RPC access for validation and watching
//!
//! This module provides:
//! - Timeout-bounded RPC endpoint wrappers
//! - Multi-chain address / name validation with a first-success race
//! - Incoming transfer history and balance lookups for watched wallets

pub mod provider;
pub mod transfers;
pub mod validator;

pub use provider::RpcEndpoint;
pub use transfers::{
    AlchemyDataProvider, ChainDataProvider, IncomingTransfer, PageCursor, TransferBatch,
    TransferCursor,
};
pub use validator::{ChainEndpoint, ChainValidator, NameResolver, ValidationResult};

#[cfg(test)]
pub use transfers::MockChainDataProvider;

use ethers::types::Address;
use ethers::utils::to_checksum;

/// Parse a 0x-prefixed 20-byte hex address.
///
/// Mixed-case input must carry a valid EIP-55 checksum; all-lowercase and
/// all-uppercase input is accepted as is.
pub fn parse_address(input: &str) -> Option<Address> {
    let hex_part = input.strip_prefix("0x")?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let address: Address = input.parse().ok()?;

    let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper && to_checksum(&address, None) != input {
        return None;
    }

    Some(address)
}

/// Display form used in API responses
pub fn display_address(address: &Address) -> String {
    to_checksum(address, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let checksummed = "0xD8900C1b8610A27300ED68C3A248b44616155d37";
        assert!(parse_address(checksummed).is_some());
        assert!(parse_address(&checksummed.to_lowercase()).is_some());
        assert!(parse_address("0xd8900c1b8610a27300ed68c3a248b44616155d3").is_none());
        assert!(parse_address("d8900c1b8610a27300ed68c3a248b44616155d37").is_none());
        assert!(parse_address("0xA").is_none());
        assert!(parse_address("vitalik.eth").is_none());
    }

    #[test]
    fn test_bad_checksum_rejected() {
        // Flip the case of one letter in a valid checksum address
        assert!(parse_address("0xd8900C1b8610A27300ED68C3A248b44616155d37").is_none());
    }

    #[test]
    fn test_display_is_checksummed() {
        let addr = parse_address("0xd8900c1b8610a27300ed68c3a248b44616155d37").unwrap();
        assert_eq!(
            display_address(&addr),
            "0xD8900C1b8610A27300ED68C3A248b44616155d37"
        );
    }
}
