//! The cloud cache backend: an object store with the local backend as L1.
//!
//! Writes publish the archive before the metadata, so a concurrent reader
//! (whose notion of existence is the metadata object) never observes a
//! torn entry. Loads prefer the local copy and fall back to downloading;
//! a successful load re-uploads the metadata ("touch") as the LRU signal
//! the expiry sweep keys off.

use color_eyre::{Result, eyre::Context};
use tracing::{debug, info, instrument, warn};

use crate::cache::local::{ChecksumError, LocalBackend};
use crate::cache::metadata::{CACHE_METADATA_FILENAME, CacheMetadata};
use crate::ci::CiEnvironment;
use crate::cloud::CloudDriver;
use crate::config::Config;
use crate::model::Target;

/// Key prefix of the CI cache tier.
pub const CLOUD_CACHE_PREFIX: &str = ".quack-cache";

const CACHE_EXPIRE_DAYS: i64 = 15;

#[derive(Clone, Debug)]
pub struct CloudBackend<D> {
    driver: D,
    base: String,
    local: LocalBackend,
    commit_sha: String,
    save_for_load: bool,
    expire_days: i64,
}

impl<D: CloudDriver> CloudBackend<D> {
    /// Open the backend at the CI prefix (`.quack-cache/<app_name>`), with
    /// the local backend at its canonical location as L1.
    pub fn open(driver: D, app_name: &str, config: &Config, ci: &CiEnvironment) -> Result<Self> {
        let local = LocalBackend::open(app_name, ci)?;
        Ok(Self::new(
            driver,
            CLOUD_CACHE_PREFIX,
            app_name,
            local,
            config,
            ci,
            CACHE_EXPIRE_DAYS,
        ))
    }

    /// Assemble a backend from explicit parts: prefix, L1, and expiry.
    pub fn new(
        driver: D,
        prefix: &str,
        app_name: &str,
        local: LocalBackend,
        config: &Config,
        ci: &CiEnvironment,
        expire_days: i64,
    ) -> Self {
        Self {
            driver,
            base: format!("{prefix}/{app_name}"),
            local,
            commit_sha: ci.commit_sha.clone(),
            save_for_load: config.save_for_load,
            expire_days,
        }
    }

    fn cache_key(&self, target: &Target, checksum: &str) -> String {
        format!("{}/{}", self.base, target.cache_path(checksum))
    }

    fn archive_key(&self, target: &Target, checksum: &str) -> String {
        format!(
            "{}/{}",
            self.cache_key(target, checksum),
            target.cache_archive_filename()
        )
    }

    fn metadata_key(&self, target: &Target, checksum: &str) -> String {
        format!("{}/{CACHE_METADATA_FILENAME}", self.cache_key(target, checksum))
    }

    /// The commit index key for a target, when a commit is known.
    fn commit_key(&self, target_name: &str) -> Option<String> {
        if self.commit_sha.is_empty() {
            return None;
        }
        Some(format!(
            "{}/_commits/{}/{target_name}.json",
            self.base, self.commit_sha
        ))
    }

    pub async fn exists(&self, target: &Target, checksum: &str) -> Result<bool> {
        self.driver.exists(&self.metadata_key(target, checksum)).await
    }

    /// Re-upload the metadata object to advance its modification time.
    async fn update_access_time(&self, target: &Target, checksum: &str) -> Result<()> {
        self.driver
            .upload(
                &self.local.metadata_path(target, checksum),
                &self.metadata_key(target, checksum),
            )
            .await
            .context("refresh cache entry access time")
    }

    /// Load the entry, optionally touching it.
    ///
    /// The dev backend peeks at the CI tier through this without the
    /// touch, so developer reads don't keep CI entries alive.
    #[instrument(
        name = "CloudBackend::load",
        skip(self, target),
        fields(target = %target.name)
    )]
    pub async fn load_with(
        &self,
        target: &Target,
        checksum: &str,
        update_access_time: bool,
    ) -> Result<()> {
        if self.local.exists(target, checksum)? {
            match self.local.load(target, checksum).await {
                Ok(()) => {
                    if update_access_time {
                        self.update_access_time(target, checksum).await?;
                    }
                    return Ok(());
                }
                Err(err) if err.downcast_ref::<ChecksumError>().is_some() => {
                    warn!(target = %target.name, "local cache corrupt, re-downloading");
                }
                Err(err) => return Err(err),
            }
        }

        info!(target = %target.name, "loading cache from cloud storage");
        self.driver
            .download(
                &self.archive_key(target, checksum),
                &self.local.archive_path(target, checksum),
            )
            .await?;
        self.driver
            .download(
                &self.metadata_key(target, checksum),
                &self.local.metadata_path(target, checksum),
            )
            .await?;
        self.local.load(target, checksum).await?;
        if update_access_time {
            self.update_access_time(target, checksum).await?;
        }
        Ok(())
    }

    #[instrument(
        name = "CloudBackend::save",
        skip(self, target),
        fields(target = %target.name)
    )]
    pub async fn save(&self, target: &Target, checksum: &str) -> Result<()> {
        self.local.save(target, checksum).await?;

        let archive_key = self.archive_key(target, checksum);
        debug!(%archive_key, "uploading cache to cloud storage");
        self.driver
            .upload(&self.local.archive_path(target, checksum), &archive_key)
            .await?;
        self.driver
            .upload(
                &self.local.metadata_path(target, checksum),
                &self.metadata_key(target, checksum),
            )
            .await?;

        // Close the loop for follow-up jobs: record which fingerprint this
        // commit produced, so they can load it without recomputing.
        if self.save_for_load
            && let Some(commit_key) = self.commit_key(&target.name)
        {
            debug!(%commit_key, "recording commit index entry");
            self.driver
                .upload(&self.local.metadata_path(target, checksum), &commit_key)
                .await?;
        }
        Ok(())
    }

    /// Resolve the fingerprint a prior job at this commit produced for the
    /// named target, if it recorded one.
    pub async fn read_commit_checksum(&self, target_name: &str) -> Result<Option<String>> {
        let Some(commit_key) = self.commit_key(target_name) else {
            return Ok(None);
        };
        let Some(text) = self.driver.read(&commit_key).await? else {
            return Ok(None);
        };
        let metadata = CacheMetadata::parse(&text)
            .with_context(|| format!("parse commit index entry: {commit_key}"))?;
        Ok(Some(metadata.target_checksum))
    }

    #[instrument(name = "CloudBackend::clear_expired", skip(self))]
    pub async fn clear_expired(&self) -> Result<()> {
        info!("clearing expired cloud cache entries");
        let entries = self
            .driver
            .list_files(&self.base, &[CACHE_METADATA_FILENAME], &[])
            .await?;

        let now = jiff::Timestamp::now();
        for entry in entries {
            let age = now.as_second() - entry.modified_time.as_second();
            if age <= self.expire_days * 86_400 {
                continue;
            }
            let cache_dir = entry
                .path
                .trim_end_matches(CACHE_METADATA_FILENAME)
                .trim_end_matches('/');
            if !cache_dir.starts_with(&self.base) {
                warn!(path = %entry.path, "listing entry outside the cache prefix, skipping");
                continue;
            }
            info!(%cache_dir, "removing expired cache entry");
            self.driver.remove(cache_dir, true).await?;
        }
        Ok(())
    }
}
