//! Channels an export can be handed to the user through

use super::export::ExportArtifact;
use crate::error::{SweeperError, SweeperResult};
use crate::farcaster::DirectCastClient;

use async_trait::async_trait;

const EXPORT_CAST_TEXT: &str = "Your data export from Wally the Wallet Watcher";

/// How the caller wants the export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Return the file in the HTTP response
    Download,
    /// Send it as a Farcaster direct cast
    Farcaster { fid: u64 },
}

impl DeliveryMode {
    pub fn channel(&self) -> &'static str {
        match self {
            DeliveryMode::Download => "download",
            DeliveryMode::Farcaster { .. } => "farcaster",
        }
    }
}

/// Proof of delivery, handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Download { file_name: String, body: Vec<u8> },
    Farcaster { fid: u64 },
}

/// Delivers an export. Returning `Ok` means the user has the data.
#[async_trait]
pub trait ExportDelivery: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn deliver(&self, artifact: &mut ExportArtifact) -> SweeperResult<Delivered>;
}

/// Buffers the artifact for the HTTP response
pub struct DownloadDelivery;

#[async_trait]
impl ExportDelivery for DownloadDelivery {
    fn channel(&self) -> &'static str {
        "download"
    }

    async fn deliver(&self, artifact: &mut ExportArtifact) -> SweeperResult<Delivered> {
        let body = artifact.read()?;
        Ok(Delivered::Download {
            file_name: artifact.file_name().to_string(),
            body,
        })
    }
}

pub struct FarcasterDelivery {
    client: DirectCastClient,
    fid: u64,
}

impl FarcasterDelivery {
    pub fn new(client: DirectCastClient, fid: u64) -> Self {
        Self { client, fid }
    }
}

#[async_trait]
impl ExportDelivery for FarcasterDelivery {
    fn channel(&self) -> &'static str {
        "farcaster"
    }

    async fn deliver(&self, artifact: &mut ExportArtifact) -> SweeperResult<Delivered> {
        let body = artifact.read()?;
        let content = String::from_utf8(body)
            .map_err(|e| SweeperError::Internal(format!("export is not UTF-8: {}", e)))?;

        self.client
            .send(self.fid, EXPORT_CAST_TEXT, artifact.file_name(), &content)
            .await?;

        Ok(Delivered::Farcaster { fid: self.fid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WalletSnapshot;
    use chrono::Utc;
    use ethers::types::Address;

    #[tokio::test]
    async fn test_download_reads_whole_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = WalletSnapshot {
            wallet: Address::repeat_byte(0x11),
            exported_at: Utc::now(),
            sessions: Vec::new(),
            transactions: Vec::new(),
        };
        let mut artifact = ExportArtifact::write(Some(dir.path()), &snapshot).unwrap();

        match DownloadDelivery.deliver(&mut artifact).await.unwrap() {
            Delivered::Download { file_name, body } => {
                assert_eq!(file_name, artifact.file_name());
                let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(value["wallet"], format!("{:?}", snapshot.wallet));
            }
            other => panic!("unexpected delivery {:?}", other),
        }
    }

    #[test]
    fn test_mode_channel() {
        assert_eq!(DeliveryMode::Download.channel(), "download");
        assert_eq!(DeliveryMode::Farcaster { fid: 1 }.channel(), "farcaster");
    }
}
