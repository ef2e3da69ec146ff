//! The target engine: fingerprint computation and decide-load-or-build.
//!
//! Fingerprints are memoised per target for the whole invocation; inputs
//! must not change mid-run. In `NORMAL` mode a miss builds, saves, and
//! then still loads from the cache, so the on-disk outputs a downstream
//! consumer sees always came through the same archive/extract path as a
//! cache-hit run. That closes the drift between "fresh build" and
//! "restored from cache" machines.

use std::collections::HashMap;
use std::sync::Mutex;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, info, instrument};

use crate::cache::TargetCacheBackend;
use crate::checksum::{render_strings, sha256_hex};
use crate::model::{Dependency, Target, TargetExecutionMode};
use crate::runtime::Runtime;

pub struct Engine<'a, B> {
    runtime: &'a Runtime,
    backend: &'a B,
    checksums: Mutex<HashMap<String, String>>,
}

impl<'a, B: TargetCacheBackend> Engine<'a, B> {
    pub fn new(runtime: &'a Runtime, backend: &'a B) -> Self {
        Self {
            runtime,
            backend,
            checksums: Mutex::new(HashMap::new()),
        }
    }

    /// Pin a target's fingerprint before execution, bypassing computation.
    ///
    /// Used when loading by commit SHA: the recorded fingerprint may cover
    /// environment this invocation doesn't have, so it must not be
    /// recomputed here.
    pub fn seed_checksum(&self, target_name: &str, checksum: String) {
        let mut checksums = self.checksums.lock().expect("checksum memo poisoned");
        checksums.insert(target_name.to_string(), checksum);
    }

    /// The memoised fingerprint of a target.
    pub fn checksum_of(&'a self, target: &'a Target) -> BoxFuture<'a, Result<String>> {
        async move {
            if let Some(checksum) = self
                .checksums
                .lock()
                .expect("checksum memo poisoned")
                .get(&target.name)
            {
                return Ok(checksum.clone());
            }

            let mut parts = Vec::with_capacity(target.dependencies.len());
            for dependency in &target.dependencies {
                let value = self
                    .dependency_checksum(dependency)
                    .await
                    .with_context(|| {
                        format!(
                            "checksum dependency {} of target {}",
                            dependency.display_name(),
                            target.name
                        )
                    })?;
                // The single most useful trace when a cache unexpectedly
                // misses: which dependency drifted.
                debug!(
                    target = %target.name,
                    dependency = %dependency.display_name(),
                    checksum = %value,
                    "dependency checksum"
                );
                parts.push(value);
            }
            let checksum = sha256_hex(render_strings(&parts));

            self.checksums
                .lock()
                .expect("checksum memo poisoned")
                .insert(target.name.clone(), checksum.clone());
            Ok(checksum)
        }
        .boxed()
    }

    async fn dependency_checksum(&'a self, dependency: &'a Dependency) -> Result<String> {
        match dependency {
            Dependency::Source(dep) => dep.checksum(self.runtime.inventory().await?).await,
            Dependency::Command(dep) => dep.checksum(&self.runtime.registry).await,
            Dependency::Variable(dep) => dep.checksum(),
            Dependency::Target(dep) => {
                let upstream = self.runtime.spec.target(&dep.name)?;
                self.checksum_of(upstream).await
            }
            // Post-processing replaces every global reference; one reaching
            // the engine is a bug, not a user error.
            Dependency::Global(dep) => Err(eyre!(
                "unresolved global dependency {} reached the engine",
                dep.name
            )),
        }
    }

    /// Execute a target in the given mode, recursing depth-first through
    /// upstream targets as the mode requires.
    pub fn execute(
        &'a self,
        target_name: &'a str,
        mode: TargetExecutionMode,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let target = self.runtime.spec.target(target_name)?;
            info!(target = %target.name, %mode, "executing target");

            let checksum = self.checksum_of(target).await?;
            info!(target = %target.name, %checksum, "target checksum");

            let hit = self.backend.exists(target, &checksum).await?;
            match mode {
                TargetExecutionMode::DepsOnly => {
                    self.prepare_deps(target).await?;
                }
                TargetExecutionMode::LoadOnly => {
                    if !hit {
                        bail!(
                            "no cache entry for target {} at {checksum}; nothing to load",
                            target.name
                        );
                    }
                    info!(target = %target.name, "cache hit, loading");
                    self.backend.load(target, &checksum).await?;
                }
                TargetExecutionMode::Normal => {
                    if !hit {
                        info!(
                            target = %target.name,
                            build = %target.operations.build.command,
                            "cache miss, building"
                        );
                        self.prepare_deps(target).await?;
                        target
                            .operations
                            .build
                            .execute(&self.runtime.registry, &[])
                            .await
                            .with_context(|| {
                                format!("target {} execution failed", target.name)
                            })?;
                        self.backend
                            .save(target, &checksum)
                            .await
                            .with_context(|| format!("save target {} to cache", target.name))?;
                    } else {
                        info!(target = %target.name, "cache hit, skipping build");
                    }
                    self.backend.load(target, &checksum).await?;
                }
            }

            info!(target = %target.name, "target done");
            Ok(())
        }
        .boxed()
    }

    /// Materialise every upstream target this one depends on.
    #[instrument(skip(self, target), fields(target = %target.name))]
    async fn prepare_deps(&'a self, target: &'a Target) -> Result<()> {
        for dependency in &target.dependencies {
            if let Dependency::Target(upstream) = dependency {
                self.execute(&upstream.name, TargetExecutionMode::Normal)
                    .await?;
            }
        }
        Ok(())
    }
}
