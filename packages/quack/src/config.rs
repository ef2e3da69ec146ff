//! Invocation configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults;
//! 2. `<XDG_CONFIG_HOME>/quack/config.yaml` (per-user);
//! 3. `./.quack.yaml` (per-project, resolved against the spec root);
//! 4. `QUACK_*` environment variables, with `__` as the nesting delimiter
//!    (e.g. `QUACK_CLOUD__ROOT`).

use std::env;
use std::path::PathBuf;

use color_eyre::{Result, eyre::Context};
use serde::Deserialize;
use tracing::debug;

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The default cache backend kind (`false`, `local`, `cloud`, `dev`).
    pub cache: String,
    /// Default log level when neither `--log-level` nor `QUACK_LOG` is set.
    pub log_level: Option<String>,
    /// Whether a CI save also records the commit index entry that lets
    /// follow-up jobs load this build by commit SHA.
    pub save_for_load: bool,
    /// Settings for the cloud object-store driver.
    pub cloud: CloudConfig,
}

/// Settings for the cloud object-store driver.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Root of the object store. The in-tree driver addresses a mounted
    /// bucket path; S3-compatible drivers interpret this as a bucket URL.
    pub root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: String::from("dev"),
            log_level: None,
            save_for_load: false,
            cloud: CloudConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the standard file locations plus environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(config_home) = xdg_config_home() {
            paths.push(config_home.join("quack").join("config.yaml"));
        }
        paths.push(PathBuf::from(".quack.yaml"));

        let mut merged = serde_yaml::Value::Null;
        for path in &paths {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    let value: serde_yaml::Value = serde_yaml::from_str(&text)
                        .with_context(|| format!("parse config file: {path:?}"))?;
                    debug!(?path, "loaded config file");
                    merge_value(&mut merged, value);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err).context(format!("read config file: {path:?}")),
            }
        }

        let mut config = if merged.is_null() {
            Self::default()
        } else {
            serde_yaml::from_value(merged).context("deserialize configuration")?
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `QUACK_*` environment overrides on top of the file layers.
    fn apply_env_overrides(&mut self) {
        if let Ok(cache) = env::var("QUACK_CACHE")
            && !cache.is_empty()
        {
            self.cache = cache;
        }
        if let Ok(level) = env::var("QUACK_LOG_LEVEL")
            && !level.is_empty()
        {
            self.log_level = Some(level);
        }
        if let Ok(flag) = env::var("QUACK_SAVE_FOR_LOAD") {
            self.save_for_load = flag == "true" || flag == "1";
        }
        if let Ok(root) = env::var("QUACK_CLOUD__ROOT")
            && !root.is_empty()
        {
            self.cloud.root = Some(PathBuf::from(root));
        }
    }
}

/// Recursively merge `over` into `base`; mappings merge key-wise, everything
/// else replaces.
fn merge_value(base: &mut serde_yaml::Value, over: serde_yaml::Value) {
    match (base, over) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(over)) => {
            for (key, value) in over {
                match base.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}

/// The XDG configuration directory for the current user.
fn xdg_config_home() -> Option<PathBuf> {
    if let Ok(dir) = env::var("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    homedir::my_home()
        .ok()
        .flatten()
        .map(|home| home.join(".config"))
}

/// The XDG cache directory for the current user.
pub fn xdg_cache_home() -> Option<PathBuf> {
    if let Ok(dir) = env::var("XDG_CACHE_HOME")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    homedir::my_home()
        .ok()
        .flatten()
        .map(|home| home.join(".cache"))
}
