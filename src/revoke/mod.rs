//! Export-then-erase of everything stored for a wallet
//!
//! The export is rendered to a temporary artifact, handed to a delivery
//! channel and only after the channel confirms delivery are the wallet's
//! sessions and records deleted. The artifact is removed on every exit path.

mod delivery;
mod export;
mod service;

pub use delivery::{Delivered, DeliveryMode, ExportDelivery};
pub use export::ExportArtifact;
pub use service::RevocationService;
