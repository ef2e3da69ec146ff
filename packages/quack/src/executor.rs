//! The invocation surface: run a script, run scripts in parallel, or run a
//! target through the cache engine.

use std::sync::Arc;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

use crate::cache::{CloudBackend, DefaultBackend, disk_driver};
use crate::engine::Engine;
use crate::model::TargetExecutionMode;
use crate::runtime::Runtime;

/// Run a single script by name, forwarding extra CLI arguments.
#[instrument(skip(runtime, args))]
pub async fn execute_script(runtime: &Runtime, name: &str, args: &[String]) -> Result<()> {
    let script = runtime.spec.script(name)?;
    script
        .execute(&runtime.registry, args)
        .await
        .with_context(|| format!("script {name} execution failed"))
}

/// Run several scripts concurrently on a pool sized to the host.
///
/// Target names are rejected: targets mutate shared workspace state and
/// recurse into one another, so they only run sequentially. The first
/// failing script poisons the pool; everything still running is cancelled
/// and its subprocesses terminated.
#[instrument(skip(runtime))]
pub async fn execute_scripts_parallel(runtime: &Arc<Runtime>, names: &[String]) -> Result<()> {
    if names.len() < 2 {
        bail!("parallel mode needs at least two script names");
    }

    let unknown = names
        .iter()
        .filter(|name| {
            !runtime.spec.scripts.contains_key(*name) && !runtime.spec.targets.contains_key(*name)
        })
        .cloned()
        .collect::<Vec<_>>();
    if !unknown.is_empty() {
        bail!("unknown script or target names: {}", unknown.join(", "));
    }
    if names.iter().any(|name| runtime.spec.targets.contains_key(name)) {
        bail!("parallel mode only runs scripts, not targets");
    }

    let pool = Arc::new(Semaphore::new(num_cpus::get()));
    let mut workers = JoinSet::new();
    for name in names {
        let script = runtime.spec.script(name)?.clone();
        let registry = runtime.registry.clone();
        let pool = Arc::clone(&pool);
        let name = name.clone();
        workers.spawn(async move {
            let _slot = pool.acquire_owned().await.expect("pool closed");
            let result = script.execute(&registry, &[]).await;
            (name, result)
        });
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(script = %name, "script succeeded"),
            Ok((name, Err(err))) => {
                error!(script = %name, "script failed");
                // Poison the pool: cancel the rest and kill their children.
                workers.abort_all();
                runtime.registry.terminate_all();
                return Err(err).with_context(|| format!("script {name} execution failed"));
            }
            Err(err) if err.is_cancelled() => continue,
            Err(err) => return Err(err).context("join script worker"),
        }
    }
    Ok(())
}

/// Run a target through the cache engine in the given mode.
///
/// In `LOAD_ONLY` mode the fingerprint is resolved through the CI-tier
/// commit index rather than computed: follow-up jobs may not have the
/// environment the fingerprint covers.
#[instrument(skip(runtime))]
pub async fn execute_target(
    runtime: &Runtime,
    name: &str,
    mode: TargetExecutionMode,
) -> Result<()> {
    // Ensure lookup failures surface before any backend is constructed.
    runtime.spec.target(name)?;

    let backend = DefaultBackend::create(
        runtime.backend_kind,
        &runtime.spec.app_name,
        &runtime.config,
        &runtime.ci,
    )?;
    let engine = Engine::new(runtime, &backend);

    if mode == TargetExecutionMode::LoadOnly {
        let checksum = resolve_commit_checksum(runtime, name).await?;
        info!(target = %name, %checksum, "resolved fingerprint from commit index");
        engine.seed_checksum(name, checksum);
    }

    engine.execute(name, mode).await
}

/// Look up the fingerprint recorded for this commit and target by a prior
/// CI job.
async fn resolve_commit_checksum(runtime: &Runtime, name: &str) -> Result<String> {
    let ci_tier = CloudBackend::open(
        disk_driver(&runtime.config)?,
        &runtime.spec.app_name,
        &runtime.config,
        &runtime.ci,
    )?;
    let checksum = ci_tier.read_commit_checksum(name).await?.ok_or_else(|| {
        eyre!(
            "no commit index entry for target {name} at commit {:?}",
            runtime.ci.commit_sha
        )
    })?;
    if checksum.len() != 64 || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("commit index entry for target {name} holds a malformed fingerprint: {checksum:?}");
    }
    Ok(checksum)
}
