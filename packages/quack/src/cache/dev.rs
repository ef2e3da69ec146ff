//! The developer cache backend.
//!
//! Composition of two cloud tiers: reads peek at the CI tier first (its
//! entries are authoritative and already paid for), falling back to a
//! developer-scoped prefix with a much shorter expiry. Writes only ever go
//! to the developer tier; developers must not publish into the CI tier,
//! and reads from it deliberately skip the access-time touch so developer
//! traffic doesn't keep CI entries alive.

use color_eyre::Result;

use crate::cache::cloud::CloudBackend;
use crate::ci::CiEnvironment;
use crate::cloud::CloudDriver;
use crate::config::Config;
use crate::model::Target;

/// Key prefix of the developer cache tier.
pub const DEV_CACHE_PREFIX: &str = ".quack-cache-dev";

const CACHE_EXPIRE_DAYS: i64 = 3;

#[derive(Clone, Debug)]
pub struct DevBackend<D> {
    ci_tier: CloudBackend<D>,
    dev_tier: CloudBackend<D>,
}

impl<D: CloudDriver> DevBackend<D> {
    pub fn open(driver: D, app_name: &str, config: &Config, ci: &CiEnvironment) -> Result<Self> {
        let local = crate::cache::local::LocalBackend::open(app_name, ci)?;
        let ci_tier = CloudBackend::open(driver.clone(), app_name, config, ci)?;
        let dev_tier = CloudBackend::new(
            driver,
            DEV_CACHE_PREFIX,
            app_name,
            local,
            config,
            ci,
            CACHE_EXPIRE_DAYS,
        );
        Ok(Self { ci_tier, dev_tier })
    }

    /// Assemble a backend from explicit tiers.
    pub fn new(ci_tier: CloudBackend<D>, dev_tier: CloudBackend<D>) -> Self {
        Self { ci_tier, dev_tier }
    }

    pub async fn exists(&self, target: &Target, checksum: &str) -> Result<bool> {
        if self.ci_tier.exists(target, checksum).await? {
            return Ok(true);
        }
        self.dev_tier.exists(target, checksum).await
    }

    pub async fn load(&self, target: &Target, checksum: &str) -> Result<()> {
        if self.ci_tier.exists(target, checksum).await? {
            self.ci_tier.load_with(target, checksum, false).await
        } else {
            self.dev_tier.load_with(target, checksum, true).await
        }
    }

    pub async fn save(&self, target: &Target, checksum: &str) -> Result<()> {
        self.dev_tier.save(target, checksum).await
    }

    pub async fn clear_expired(&self) -> Result<()> {
        self.dev_tier.clear_expired().await
    }
}
