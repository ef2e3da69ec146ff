//! The shell command model shared by build operations, scripts, and
//! command dependencies.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use serde::Deserialize;

use crate::exec::{self, CommandRegistry, EnvOverlay};

/// A shell command with its working directory and environment overlay.
///
/// In YAML a command is either a bare string or a mapping:
///
/// ```yaml
/// command: make build
/// # or
/// command:
///   command: make build
///   path: packages/app
///   variables:
///     PROFILE: release
/// ```
///
/// `base_path` is not part of the file format; the spec loader fills it in
/// (project root for target operations, invocation directory for scripts).
#[derive(Clone, Debug, Deserialize)]
#[serde(from = "CommandRepr")]
pub struct Command {
    pub command: String,
    pub base_path: PathBuf,
    pub path: PathBuf,
    pub variables: EnvOverlay,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandRepr {
    Shell(String),
    Full {
        command: String,
        #[serde(default)]
        path: PathBuf,
        #[serde(default)]
        variables: EnvOverlay,
    },
}

impl From<CommandRepr> for Command {
    fn from(repr: CommandRepr) -> Self {
        match repr {
            CommandRepr::Shell(command) => Self {
                command,
                base_path: PathBuf::new(),
                path: PathBuf::new(),
                variables: EnvOverlay::new(),
            },
            CommandRepr::Full {
                command,
                path,
                variables,
            } => Self {
                command,
                base_path: PathBuf::new(),
                path,
                variables,
            },
        }
    }
}

impl Command {
    /// The working directory of the command: `base_path / path`, resolved.
    /// A command with neither falls back to the process working directory.
    pub fn cwd(&self) -> Result<PathBuf> {
        let joined = self.base_path.join(&self.path);
        if joined.as_os_str().is_empty() {
            return std::env::current_dir().context("resolve command cwd");
        }
        std::path::absolute(&joined).with_context(|| format!("resolve command cwd: {joined:?}"))
    }

    /// The shell line that actually runs: multi-line commands are chained
    /// with `&&` so a failing line aborts the rest, and any extra arguments
    /// are appended verbatim.
    pub fn shell_line(&self, args: &[String]) -> String {
        let mut line = self
            .command
            .trim()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" && ");
        if !args.is_empty() {
            line.push(' ');
            line.push_str(&args.join(" "));
        }
        line
    }

    /// Run the command to completion, inheriting stdout/stderr.
    pub async fn execute(&self, registry: &CommandRegistry, args: &[String]) -> Result<()> {
        exec::run_shell(registry, &self.shell_line(args), &self.cwd()?, &self.variables).await
    }

    /// Run the command and return its stdout.
    pub async fn execute_capture(&self, registry: &CommandRegistry) -> Result<String> {
        exec::run_shell_capture(registry, &self.shell_line(&[]), &self.cwd()?, &self.variables)
            .await
    }

    /// Re-root the command at the given base path.
    pub fn set_base_path(&mut self, base: &Path) {
        self.base_path = base.to_path_buf();
    }
}
