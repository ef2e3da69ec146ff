//! The cloud object-store driver contract.
//!
//! The cache's cloud tiers only need a narrow slice of an object store:
//! existence checks, whole-object upload/download/read, recursive removal,
//! and a metadata listing with comparable modification times. Production
//! deployments plug in an S3-compatible driver built elsewhere; the
//! in-tree [`disk::DiskDriver`] implements the same contract against a
//! mounted bucket path and backs the test suite.

pub mod disk;

use std::future::Future;
use std::path::Path;

use color_eyre::Result;

pub use disk::DiskDriver;

/// Listing entry returned by [`CloudDriver::list_files`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloudFileMetadata {
    /// Object key, relative to the driver's configured root.
    pub path: String,
    /// Last modification time, comparable across entries.
    pub modified_time: jiff::Timestamp,
    /// Object size in bytes.
    pub size: u64,
}

/// The object-store operations the cache depends on.
///
/// Keys are `/`-separated and relative to the driver's root. `upload`
/// overwrites; `read` returns `None` on a missing key (any other failure is
/// an error).
pub trait CloudDriver: Clone + Send + Sync + 'static {
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    fn upload(&self, local: &Path, key: &str) -> impl Future<Output = Result<()>> + Send;

    fn download(&self, key: &str, local: &Path) -> impl Future<Output = Result<()>> + Send;

    fn read(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    fn remove(&self, key: &str, recursive: bool) -> impl Future<Output = Result<()>> + Send;

    /// List objects under `prefix` whose file name matches one of
    /// `include_patterns` (shell-style globs) and none of
    /// `exclude_patterns`.
    fn list_files(
        &self,
        prefix: &str,
        include_patterns: &[&str],
        exclude_patterns: &[&str],
    ) -> impl Future<Output = Result<Vec<CloudFileMetadata>>> + Send;
}
