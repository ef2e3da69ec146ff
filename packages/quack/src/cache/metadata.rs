//! The cache entry metadata document.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};

use crate::checksum::sha256_file;
use crate::host::hostname;

/// Filename of the metadata document inside a cache entry directory.
///
/// Presence of this document is the definition of "the cache entry
/// exists", and re-uploading it is how the cloud tier refreshes an entry's
/// access time for expiry sweeps.
pub const CACHE_METADATA_FILENAME: &str = "metadata.json";

/// The JSON document stored alongside each archive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// The fingerprint this entry was saved at.
    pub target_checksum: String,
    /// SHA-256 of the archive file, for integrity checks on load.
    pub file_checksum: String,
    /// Machine that produced the entry.
    pub hostname: String,
    /// Commit under build when produced, empty outside CI.
    pub commit_sha: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
}

impl CacheMetadata {
    /// Build the metadata document for a freshly packed archive.
    pub async fn generate(
        archive_path: &Path,
        target_checksum: &str,
        commit_sha: &str,
    ) -> Result<Self> {
        Ok(Self {
            target_checksum: target_checksum.to_string(),
            file_checksum: sha256_file(archive_path)
                .await
                .context("hash archive for metadata")?,
            hostname: hostname().context("resolve hostname for metadata")?,
            commit_sha: commit_sha.to_string(),
            created_at: jiff::Timestamp::now().to_string(),
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("parse cache metadata")
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read cache metadata: {path:?}"))?;
        Self::parse(&text)
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string(self).context("serialize cache metadata")?;
        tokio::fs::write(path, text)
            .await
            .with_context(|| format!("write cache metadata: {path:?}"))
    }
}
