//! The layered target cache.
//!
//! Four backends share one contract ([`TargetCacheBackend`]):
//!
//! - [`RawBackend`]: caching disabled, every lookup misses;
//! - [`LocalBackend`]: XDG cache directory on this machine;
//! - [`CloudBackend`]: an object store, with the local backend as its L1;
//! - [`DevBackend`]: a developer-scoped cloud prefix that peeks at the CI
//!   prefix first (without consuming its access-time budget).
//!
//! Backends are selected by name at invocation time through
//! [`BackendKind`]; [`Backend`] is the one dispatch point, so adding a
//! backend means one new arm here and nothing at the call sites.

mod backend;
mod cloud;
mod dev;
mod local;
mod metadata;
mod raw;

use color_eyre::{Result, eyre::eyre};

pub use backend::TargetCacheBackend;
pub use cloud::{CLOUD_CACHE_PREFIX, CloudBackend};
pub use dev::{DEV_CACHE_PREFIX, DevBackend};
pub use local::{ChecksumError, LocalBackend};
pub use metadata::{CACHE_METADATA_FILENAME, CacheMetadata};
pub use raw::RawBackend;

use crate::ci::CiEnvironment;
use crate::cloud::{CloudDriver, DiskDriver};
use crate::config::Config;
use crate::model::Target;

/// The backend selector: `false` disables caching entirely.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    #[strum(serialize = "false")]
    Raw,
    Local,
    Cloud,
    #[default]
    Dev,
}

/// A concrete cache backend, dispatching the shared contract.
#[derive(Clone, Debug)]
pub enum Backend<D: CloudDriver> {
    Raw(RawBackend),
    Local(LocalBackend),
    Cloud(CloudBackend<D>),
    Dev(DevBackend<D>),
}

/// The backend type the binary wires up: cloud tiers over the disk driver.
pub type DefaultBackend = Backend<DiskDriver>;

impl DefaultBackend {
    /// Construct the backend selected for this invocation.
    pub fn create(
        kind: BackendKind,
        app_name: &str,
        config: &Config,
        ci: &CiEnvironment,
    ) -> Result<Self> {
        match kind {
            BackendKind::Raw => Ok(Self::Raw(RawBackend)),
            BackendKind::Local => Ok(Self::Local(LocalBackend::open(app_name, ci)?)),
            BackendKind::Cloud => Ok(Self::Cloud(CloudBackend::open(
                disk_driver(config)?,
                app_name,
                config,
                ci,
            )?)),
            BackendKind::Dev => Ok(Self::Dev(DevBackend::open(
                disk_driver(config)?,
                app_name,
                config,
                ci,
            )?)),
        }
    }
}

/// The disk driver configured for this project.
pub fn disk_driver(config: &Config) -> Result<DiskDriver> {
    let root = config.cloud.root.as_ref().ok_or_else(|| {
        eyre!("cloud cache requires `cloud.root` in the configuration (or QUACK_CLOUD__ROOT)")
    })?;
    Ok(DiskDriver::new(root))
}

impl<D: CloudDriver> TargetCacheBackend for Backend<D> {
    async fn exists(&self, target: &Target, checksum: &str) -> Result<bool> {
        match self {
            Self::Raw(backend) => backend.exists(target, checksum).await,
            Self::Local(backend) => backend.exists(target, checksum),
            Self::Cloud(backend) => backend.exists(target, checksum).await,
            Self::Dev(backend) => backend.exists(target, checksum).await,
        }
    }

    async fn load(&self, target: &Target, checksum: &str) -> Result<()> {
        match self {
            Self::Raw(backend) => backend.load(target, checksum).await,
            Self::Local(backend) => backend.load(target, checksum).await,
            Self::Cloud(backend) => backend.load_with(target, checksum, true).await,
            Self::Dev(backend) => backend.load(target, checksum).await,
        }
    }

    async fn save(&self, target: &Target, checksum: &str) -> Result<()> {
        match self {
            Self::Raw(backend) => backend.save(target, checksum).await,
            Self::Local(backend) => backend.save(target, checksum).await,
            Self::Cloud(backend) => backend.save(target, checksum).await,
            Self::Dev(backend) => backend.save(target, checksum).await,
        }
    }

    async fn clear_expired(&self) -> Result<()> {
        match self {
            Self::Raw(backend) => backend.clear_expired().await,
            Self::Local(backend) => backend.clear_expired().await,
            Self::Cloud(backend) => backend.clear_expired().await,
            Self::Dev(backend) => backend.clear_expired().await,
        }
    }
}
