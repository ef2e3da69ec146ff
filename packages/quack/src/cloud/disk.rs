//! Object store driver over a mounted filesystem path.
//!
//! Keys map to paths under a configured root; modification times come from
//! the filesystem, so a re-upload of an existing object advances it the
//! same way an S3 PUT would. Uploads are temp-then-rename so a concurrent
//! reader never observes a torn object.

use std::path::{Path, PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use lazy_regex::Regex;
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};

use super::{CloudDriver, CloudFileMetadata};

#[derive(Clone, Debug, derive_more::Display)]
#[display("{}", root.display())]
pub struct DiskDriver {
    root: PathBuf,
}

impl DiskDriver {
    /// Create a driver rooted at the given directory. The directory is
    /// created when the first object is uploaded.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

impl CloudDriver for DiskDriver {
    #[instrument(name = "DiskDriver::exists")]
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_path(key);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("check object: {key}")),
        }
    }

    #[instrument(name = "DiskDriver::upload")]
    async fn upload(&self, local: &Path, key: &str) -> Result<()> {
        let path = self.key_path(key);
        let parent = path
            .parent()
            .ok_or_else(|| eyre!("object key has no parent: {key}"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create object directory for: {key}"))?;

        let temp = tempfile::NamedTempFile::new_in(parent).context("create temporary object")?;
        tokio::fs::copy(local, temp.path())
            .await
            .with_context(|| format!("stage object content: {key}"))?;
        temp.persist(&path)
            .with_context(|| format!("publish object: {key}"))?;

        // A plain rename preserves the staged mtime; stamp the final object
        // so re-uploads advance modified_time like an object-store PUT.
        filetime::set_file_mtime(&path, filetime::FileTime::now())
            .with_context(|| format!("stamp object mtime: {key}"))?;
        trace!(%key, "uploaded object");
        Ok(())
    }

    #[instrument(name = "DiskDriver::download")]
    async fn download(&self, key: &str, local: &Path) -> Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create download directory: {parent:?}"))?;
        }
        tokio::fs::copy(&path, local)
            .await
            .with_context(|| format!("download object: {key}"))?;
        trace!(%key, ?local, "downloaded object");
        Ok(())
    }

    #[instrument(name = "DiskDriver::read")]
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("read object: {key}")),
        }
    }

    #[instrument(name = "DiskDriver::remove")]
    async fn remove(&self, key: &str, recursive: bool) -> Result<()> {
        let path = self.key_path(key);
        let result = if recursive {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("remove object: {key}")),
        }
    }

    #[instrument(name = "DiskDriver::list_files")]
    async fn list_files(
        &self,
        prefix: &str,
        include_patterns: &[&str],
        exclude_patterns: &[&str],
    ) -> Result<Vec<CloudFileMetadata>> {
        let root = self.root.clone();
        let base = self.key_path(prefix);
        let includes = compile_globs(include_patterns)?;
        let excludes = compile_globs(exclude_patterns)?;

        spawn_blocking(move || {
            let mut entries = Vec::new();
            if !base.is_dir() {
                return Ok(entries);
            }
            for entry in walkdir::WalkDir::new(&base) {
                let entry = entry.with_context(|| format!("walk objects under {base:?}"))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                let included =
                    includes.is_empty() || includes.iter().any(|p| p.is_match(&name));
                if !included || excludes.iter().any(|p| p.is_match(&name)) {
                    continue;
                }

                let metadata = entry
                    .metadata()
                    .with_context(|| format!("stat object: {:?}", entry.path()))?;
                let modified = metadata
                    .modified()
                    .with_context(|| format!("read object mtime: {:?}", entry.path()))?;
                let path = entry
                    .path()
                    .strip_prefix(&root)
                    .expect("walked path is under the driver root")
                    .to_string_lossy()
                    .into_owned();
                entries.push(CloudFileMetadata {
                    path,
                    modified_time: jiff::Timestamp::try_from(modified)
                        .context("convert object mtime")?,
                    size: metadata.len(),
                });
            }
            Ok(entries)
        })
        .await
        .context("join listing task")?
    }
}

/// Compile shell-style glob patterns (only `*` is special) to regexes.
fn compile_globs(patterns: &[&str]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            let mut translated = String::from("^");
            for (i, part) in pattern.split('*').enumerate() {
                if i > 0 {
                    translated.push_str(".*");
                }
                translated.push_str(&lazy_regex::regex::escape(part));
            }
            translated.push('$');
            Regex::new(&translated).with_context(|| format!("compile glob: {pattern}"))
        })
        .collect()
}
