//! Subprocess execution and the process-wide command registry.
//!
//! Every user command (build operations, scripts, command dependencies) is
//! launched through this module so that a single registry knows about all
//! live children. Children always get their own process group, which keeps
//! the whole process tree of a shell line reachable from `killpg` when the
//! invocation is torn down by a signal or a failed sibling script.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tap::TapFallible;
use tracing::{debug, info, instrument, trace, warn};

/// Environment overlay applied on top of the inherited environment.
pub type EnvOverlay = std::collections::BTreeMap<String, String>;

/// Tracks every currently-running subprocess by pid.
///
/// `register` happens as soon as the child is spawned and `unregister` on
/// every exit path; signal handlers call [`CommandRegistry::terminate_all`]
/// on a snapshot of the registry, never holding the lock across `killpg`.
#[derive(Clone, Debug, Default)]
pub struct CommandRegistry {
    active: Arc<Mutex<HashMap<u32, String>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: u32, line: &str) {
        let mut active = self.active.lock().expect("registry lock poisoned");
        active.insert(pid, line.to_string());
    }

    fn unregister(&self, pid: u32) {
        let mut active = self.active.lock().expect("registry lock poisoned");
        active.remove(&pid);
    }

    /// Send `SIGTERM` to the process group of every registered subprocess.
    ///
    /// Errors are logged and swallowed so that every child is attempted;
    /// a child that already exited is not an error.
    pub fn terminate_all(&self) {
        let snapshot = {
            let mut active = self.active.lock().expect("registry lock poisoned");
            active.drain().collect::<Vec<_>>()
        };
        for (pid, line) in snapshot {
            debug!(pid, %line, "terminating process group");
            // SAFETY: killpg is safe to call with any pid; a stale pid at
            // worst resolves to ESRCH, which we ignore below.
            let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGTERM) };
            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!(pid, %line, %err, "failed to terminate process group");
                }
            }
        }
    }
}

/// Unregisters the pid even when the caller bails between spawn and wait.
struct Registered<'a> {
    registry: &'a CommandRegistry,
    pid: u32,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.pid);
    }
}

fn shell(line: &str, cwd: &Path, overlay: &EnvOverlay) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd.current_dir(cwd);
    cmd.envs(overlay);
    // A fresh process group so terminate_all can reach the whole tree.
    cmd.process_group(0);
    cmd
}

/// Run a shell line to completion, inheriting stdout/stderr.
#[instrument(skip(registry, overlay))]
pub async fn run_shell(
    registry: &CommandRegistry,
    line: &str,
    cwd: &Path,
    overlay: &EnvOverlay,
) -> Result<()> {
    info!(%line, "running command");
    let mut cmd = shell(line, cwd, overlay);
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn command: {line}"))?;
    let pid = child.id().unwrap_or_default();
    registry.register(pid, line);
    let _guard = Registered { registry, pid };

    let status = child
        .wait()
        .await
        .with_context(|| format!("wait for command: {line}"))?;
    if !status.success() {
        bail!("command exited with {status}: {line}");
    }
    Ok(())
}

/// Run a shell line to completion, capturing stdout; stderr is inherited.
#[instrument(skip(registry, overlay))]
pub async fn run_shell_capture(
    registry: &CommandRegistry,
    line: &str,
    cwd: &Path,
    overlay: &EnvOverlay,
) -> Result<String> {
    let mut cmd = shell(line, cwd, overlay);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());

    let child = cmd
        .spawn()
        .with_context(|| format!("spawn command: {line}"))?;
    let pid = child.id().unwrap_or_default();
    registry.register(pid, line);
    let _guard = Registered { registry, pid };

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("wait for command: {line}"))?;
    if !output.status.success() {
        bail!("command exited with {}: {line}", output.status);
    }
    String::from_utf8(output.stdout)
        .with_context(|| format!("decode command output: {line}"))
        .tap_ok(|out| trace!(bytes = out.len(), "captured command output"))
}
