//! The local filesystem cache backend, rooted at the XDG cache directory.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use humansize::{DECIMAL, format_size};
use tokio::task::spawn_blocking;
use tracing::{debug, info, instrument, warn};

use crate::archive;
use crate::cache::metadata::{CACHE_METADATA_FILENAME, CacheMetadata};
use crate::checksum::sha256_file;
use crate::ci::CiEnvironment;
use crate::config::xdg_cache_home;
use crate::model::Target;

/// How often the expiry sweep is allowed to run.
const CACHE_CLEAR_DURATION_DAYS: i64 = 7;
/// Entries not accessed for this long are removed by the sweep.
const CACHE_EXPIRE_DAYS: u64 = 15;
/// Stamp file recording the last sweep time.
const LAST_CLEARED_FILENAME: &str = "last_cleared";

/// A locally cached archive failed its integrity check against the
/// metadata's recorded digest. The cloud tier recovers by re-downloading.
#[derive(Clone, Debug, derive_more::Display, derive_more::Error)]
#[display("archive failed integrity check: {path}")]
pub struct ChecksumError {
    pub path: String,
}

/// Cache entries under `<XDG_CACHE_HOME>/quack/<app_name>`, laid out as
/// `<target>/<checksum[:2]>/<checksum[2:]>/{archive,metadata}`.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    base: PathBuf,
    commit_sha: String,
}

impl LocalBackend {
    /// Open the backend at its canonical location for the app.
    ///
    /// `QUACK_CACHE_DIR` overrides the base directory, which is mainly
    /// useful for tests and sandboxed environments.
    pub fn open(app_name: &str, ci: &CiEnvironment) -> Result<Self> {
        let base = match std::env::var("QUACK_CACHE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => xdg_cache_home()
                .ok_or_else(|| eyre!("could not determine the user cache directory"))?
                .join("quack"),
        };
        Ok(Self::rooted(base.join(app_name), ci))
    }

    /// Open the backend at an explicit base directory.
    pub fn rooted(base: PathBuf, ci: &CiEnvironment) -> Self {
        Self {
            base,
            commit_sha: ci.commit_sha.clone(),
        }
    }

    pub fn cache_dir(&self, target: &Target, checksum: &str) -> PathBuf {
        self.base.join(target.cache_path(checksum))
    }

    pub fn archive_path(&self, target: &Target, checksum: &str) -> PathBuf {
        self.cache_dir(target, checksum)
            .join(target.cache_archive_filename())
    }

    pub fn metadata_path(&self, target: &Target, checksum: &str) -> PathBuf {
        self.cache_dir(target, checksum).join(CACHE_METADATA_FILENAME)
    }

    /// A cache entry exists exactly when its metadata document does.
    pub fn exists(&self, target: &Target, checksum: &str) -> Result<bool> {
        Ok(self.metadata_path(target, checksum).exists())
    }

    #[instrument(name = "LocalBackend::load", skip(self, target), fields(target = %target.name))]
    pub async fn load(&self, target: &Target, checksum: &str) -> Result<()> {
        let archive_path = self.archive_path(target, checksum);
        let metadata = CacheMetadata::read(&self.metadata_path(target, checksum)).await?;

        let size = tokio::fs::metadata(&archive_path)
            .await
            .with_context(|| format!("stat cache archive: {archive_path:?}"))?
            .len();
        info!(
            target = %target.name,
            size = %format_size(size, DECIMAL),
            "loading cache from local storage"
        );

        if sha256_file(&archive_path).await? != metadata.file_checksum {
            return Err(ChecksumError {
                path: archive_path.to_string_lossy().into_owned(),
            }
            .into());
        }
        archive::extract(&archive_path, &target.outputs.paths).await
    }

    #[instrument(name = "LocalBackend::save", skip(self, target), fields(target = %target.name))]
    pub async fn save(&self, target: &Target, checksum: &str) -> Result<()> {
        let cache_dir = self.cache_dir(target, checksum);
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .with_context(|| format!("create cache directory: {cache_dir:?}"))?;

        let archive_path = self.archive_path(target, checksum);
        debug!(?archive_path, "saving cache to local storage");
        archive::archive(&target.outputs.paths, &archive_path).await?;

        let size = tokio::fs::metadata(&archive_path)
            .await
            .with_context(|| format!("stat cache archive: {archive_path:?}"))?
            .len();
        info!(size = %format_size(size, DECIMAL), "cache archive written");

        let metadata =
            CacheMetadata::generate(&archive_path, checksum, &self.commit_sha).await?;
        metadata.write(&self.metadata_path(target, checksum)).await
    }

    /// Sweep entries whose access time is past expiry.
    ///
    /// Rate limited through the `last_cleared` stamp: at most one sweep
    /// every [`CACHE_CLEAR_DURATION_DAYS`]. The sweep stats leaf entry
    /// directories without reading them, so it does not refresh the atime
    /// of entries that survive.
    #[instrument(name = "LocalBackend::clear_expired", skip(self))]
    pub async fn clear_expired(&self) -> Result<()> {
        if !self.base.is_dir() {
            return Ok(());
        }

        let stamp_path = self.base.join(LAST_CLEARED_FILENAME);
        let need_clear = match tokio::fs::read_to_string(&stamp_path).await {
            Ok(text) => match text.trim().parse::<jiff::Timestamp>() {
                Ok(last) => {
                    let elapsed = jiff::Timestamp::now().as_second() - last.as_second();
                    elapsed > CACHE_CLEAR_DURATION_DAYS * 86_400
                }
                // A mangled stamp should not wedge the sweep forever.
                Err(_) => true,
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => return Err(err).context(format!("read sweep stamp: {stamp_path:?}")),
        };
        if !need_clear {
            return Ok(());
        }

        info!("clearing expired local cache entries");
        let base = self.base.clone();
        let removed = spawn_blocking(move || sweep(&base))
            .await
            .context("join sweep task")??;
        if removed > 0 {
            info!(removed, "removed expired cache entries");
        }

        tokio::fs::write(&stamp_path, jiff::Timestamp::now().to_string())
            .await
            .with_context(|| format!("write sweep stamp: {stamp_path:?}"))
    }
}

/// Remove expired leaf entry directories. Only the two directory levels
/// above the entries are read, never the entries themselves.
fn sweep(base: &std::path::Path) -> Result<usize> {
    let expiry = Duration::from_secs(CACHE_EXPIRE_DAYS * 86_400);
    let mut removed = 0usize;

    for entry in walkdir::WalkDir::new(base).min_depth(3).max_depth(3) {
        let entry = entry.with_context(|| format!("walk cache base: {base:?}"))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(accessed) = entry.metadata().ok().and_then(|m| m.accessed().ok()) else {
            warn!(path = ?entry.path(), "could not read entry atime");
            continue;
        };
        let expired = SystemTime::now()
            .duration_since(accessed)
            .map(|elapsed| elapsed > expiry)
            .unwrap_or(false);
        if expired {
            debug!(path = ?entry.path(), "removing expired cache entry");
            if let Err(err) = std::fs::remove_dir_all(entry.path()) {
                warn!(path = ?entry.path(), %err, "could not remove expired entry");
            } else {
                removed += 1;
            }
        }
    }

    // Prune directory levels the removals emptied out; remove_dir refuses
    // non-empty directories, which is exactly what we want.
    for depth in [2, 1] {
        for entry in walkdir::WalkDir::new(base)
            .min_depth(depth)
            .max_depth(depth)
            .into_iter()
            .flatten()
        {
            if entry.file_type().is_dir() {
                let _ = std::fs::remove_dir(entry.path());
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn target(output: &str) -> Target {
        serde_yaml::from_str(&format!(
            "name: 'demo:test'\n\
             description: test artifact\n\
             outputs: {{ paths: ['{output}'] }}\n\
             operations: {{ build: 'true' }}\n"
        ))
        .unwrap()
    }

    fn backend(dir: &std::path::Path) -> LocalBackend {
        LocalBackend::rooted(dir.join("cache"), &CiEnvironment::default())
    }

    const CHECKSUM: &str = "ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12";

    #[tokio::test]
    async fn save_then_exists_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("artifact.txt");
        tokio::fs::write(&out, b"payload").await.unwrap();

        let target = target(out.to_str().unwrap());
        let backend = backend(dir.path());

        pretty_assert_eq!(backend.exists(&target, CHECKSUM).unwrap(), false);
        backend.save(&target, CHECKSUM).await.unwrap();
        pretty_assert_eq!(backend.exists(&target, CHECKSUM).unwrap(), true);

        tokio::fs::remove_file(&out).await.unwrap();
        backend.load(&target, CHECKSUM).await.unwrap();
        pretty_assert_eq!(tokio::fs::read(&out).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn corrupt_archive_is_a_checksum_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("artifact.txt");
        tokio::fs::write(&out, b"payload").await.unwrap();

        let target = target(out.to_str().unwrap());
        let backend = backend(dir.path());
        backend.save(&target, CHECKSUM).await.unwrap();

        tokio::fs::write(backend.archive_path(&target, CHECKSUM), b"garbage")
            .await
            .unwrap();
        let err = backend.load(&target, CHECKSUM).await.unwrap_err();
        assert!(err.downcast_ref::<ChecksumError>().is_some());
    }

    #[tokio::test]
    async fn sweep_with_no_stamp_runs_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("artifact.txt");
        tokio::fs::write(&out, b"payload").await.unwrap();

        let target = target(out.to_str().unwrap());
        let backend = backend(dir.path());
        backend.save(&target, CHECKSUM).await.unwrap();

        backend.clear_expired().await.unwrap();
        let stamp = backend.base.join(LAST_CLEARED_FILENAME);
        let text = tokio::fs::read_to_string(&stamp).await.unwrap();
        assert!(text.parse::<jiff::Timestamp>().is_ok());
        // Fresh entries survive the sweep.
        pretty_assert_eq!(backend.exists(&target, CHECKSUM).unwrap(), true);

        // A fresh stamp suppresses the next sweep entirely.
        backend.clear_expired().await.unwrap();
    }

    #[tokio::test]
    async fn missing_base_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.clear_expired().await.unwrap();
        assert!(!backend.base.join(LAST_CLEARED_FILENAME).exists());
    }
}
