//! The per-invocation runtime context.
//!
//! Everything that used to be ambient (the merged spec, configuration, CI
//! detection, the subprocess registry, the cached `git ls-files` output) is
//! threaded through this one value instead of living in globals. The
//! registry itself stays process-wide in spirit — signal handlers hold a
//! clone — but it is an explicit value here.

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cache::BackendKind;
use crate::ci::CiEnvironment;
use crate::config::Config;
use crate::exec::CommandRegistry;
use crate::spec::Spec;

pub struct Runtime {
    /// The merged, post-processed spec.
    pub spec: Spec,
    pub config: Config,
    pub ci: CiEnvironment,
    pub registry: CommandRegistry,
    /// The cache backend selected for this invocation.
    pub backend_kind: BackendKind,
    /// Whether this is a quack-inside-quack invocation (`QUACK_NESTED`).
    pub is_nested: bool,
    inventory: OnceCell<Vec<String>>,
}

impl Runtime {
    pub fn new(
        spec: Spec,
        config: Config,
        ci: CiEnvironment,
        backend_kind: BackendKind,
    ) -> Self {
        Self {
            spec,
            config,
            ci,
            registry: CommandRegistry::new(),
            backend_kind,
            is_nested: std::env::var("QUACK_NESTED").is_ok_and(|v| v == "1" || v == "true"),
            inventory: OnceCell::new(),
        }
    }

    /// Export the variables nested invocations and user commands rely on.
    ///
    /// Must be called before any subprocess is spawned. Anything exported
    /// here is visible to `variable` dependencies, so new variables may
    /// need an exclude in existing specs to avoid invalidating caches.
    pub fn export_env(&self) {
        // SAFETY: called once during startup, before user commands run and
        // before anything concurrently reads the environment.
        unsafe {
            std::env::set_var("QUACK_NESTED", "true");
            std::env::set_var("QUACK_CACHE", self.backend_kind.to_string());
        }
    }

    /// The repository file inventory used by `source` dependencies.
    ///
    /// Queries git exactly once per invocation: committed files in CI, plus
    /// untracked-but-not-ignored files on developer machines.
    pub async fn inventory(&self) -> Result<&[String]> {
        let files = self
            .inventory
            .get_or_try_init(|| async {
                let mut cmd = tokio::process::Command::new("git");
                cmd.arg("ls-files");
                if !self.ci.is_ci {
                    cmd.args(["-co", "--exclude-standard"]);
                }
                let output = cmd.output().await.context("run git ls-files")?;
                if !output.status.success() {
                    bail!("git ls-files exited with {}", output.status);
                }
                let files = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(String::from)
                    .collect::<Vec<_>>();
                debug!(files = files.len(), "collected repository inventory");
                Ok(files)
            })
            .await?;
        Ok(files)
    }
}
