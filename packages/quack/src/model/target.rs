//! Targets: named, cacheable build artifacts.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::model::{Command, Dependency};

/// How the engine treats a requested target.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum TargetExecutionMode {
    /// Load from cache if present, otherwise build and save.
    #[default]
    Normal,
    /// Materialise upstream targets only; do not build or load this one.
    DepsOnly,
    /// Require a cache hit; never build.
    LoadOnly,
}

/// The declared output file set of a target.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TargetOutputs {
    #[serde(default)]
    pub paths: BTreeSet<String>,
    /// Whether the outputs of upstream `target` dependencies are folded
    /// into this target's own output set (transitively).
    #[serde(default)]
    pub inherit: bool,
}

/// The operations a target supports.
#[derive(Clone, Debug, Deserialize)]
pub struct TargetOperations {
    pub build: Command,
}

/// A named, cacheable build artifact with declared inputs, build command,
/// and output paths.
#[derive(Clone, Debug, Deserialize)]
pub struct Target {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub outputs: TargetOutputs,
    pub operations: TargetOperations,
}

impl Target {
    /// The cache key path for this target at the given fingerprint:
    /// `<name>/<checksum[:2]>/<checksum[2:]>`.
    pub fn cache_path(&self, checksum: &str) -> String {
        format!("{}/{}/{}", self.name, &checksum[..2], &checksum[2..])
    }

    /// The archive filename stored inside the cache key path.
    pub fn cache_archive_filename(&self) -> String {
        format!("{}.tar.zst", self.name)
    }
}
