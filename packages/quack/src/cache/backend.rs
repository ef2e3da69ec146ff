//! The contract shared by every cache backend.

use std::future::Future;

use color_eyre::Result;

use crate::model::Target;

/// Storage for target cache entries, addressed by target name and
/// fingerprint.
///
/// An entry "exists" exactly when its metadata document is present; the
/// archive alone does not count. Writers therefore publish the archive
/// first and the metadata second, so a concurrent reader observes either
/// nothing or a complete entry.
pub trait TargetCacheBackend: Send + Sync {
    /// Whether a complete cache entry exists at this fingerprint.
    fn exists(
        &self,
        target: &Target,
        checksum: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Materialise the entry's outputs into the workspace.
    fn load(&self, target: &Target, checksum: &str) -> impl Future<Output = Result<()>> + Send;

    /// Archive the target's outputs and publish the entry.
    fn save(&self, target: &Target, checksum: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove entries whose last access is beyond the backend's expiry.
    fn clear_expired(&self) -> impl Future<Output = Result<()>> + Send;
}
