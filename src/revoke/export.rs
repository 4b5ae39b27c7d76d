//! Export rendering and the temporary artifact

use crate::error::SweeperResult;
use crate::state::WalletSnapshot;

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Strip everything but hex digits, for use in file names
pub fn sanitize_wallet(input: &str) -> String {
    input
        .strip_prefix("0x")
        .unwrap_or(input)
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect()
}

/// A rendered export on disk. The file is removed when this is dropped.
pub struct ExportArtifact {
    file: NamedTempFile,
    file_name: String,
}

impl ExportArtifact {
    /// Render `snapshot` as pretty JSON into a fresh temp file under `dir`
    /// (the system temp dir when `None`)
    pub fn write(dir: Option<&Path>, snapshot: &WalletSnapshot) -> SweeperResult<Self> {
        let wallet = sanitize_wallet(&format!("{:?}", snapshot.wallet));
        let file_name = format!("wally_data_{}.json", wallet);

        let prefix = format!("wally_data_{}_", wallet);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".json");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };

        serde_json::to_writer_pretty(file.as_file_mut(), snapshot)?;
        file.as_file_mut().flush()?;
        debug!("Wrote export artifact {:?}", file.path());

        Ok(Self { file, file_name })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Attachment name presented to the user
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Read the whole artifact back
    pub fn read(&mut self) -> SweeperResult<Vec<u8>> {
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Remove the file now, surfacing any error
    pub fn remove(self) -> SweeperResult<()> {
        self.file.close()?;
        Ok(())
    }
}
