//! Scripts: named shell commands runnable directly, without caching.

use std::path::PathBuf;
use std::time::Instant;

use color_eyre::Result;
use serde::Deserialize;
use tracing::info;

use crate::exec::CommandRegistry;
use crate::fmt::format_duration;
use crate::model::Command;

/// A named command entry, local to the sub-spec of the directory the user
/// invoked quack from.
#[derive(Clone, Debug, Deserialize)]
pub struct Script {
    pub name: String,
    pub description: String,
    pub command: Command,
    /// Directory of the `quack.yaml` that declared this script; filled in
    /// by the spec loader.
    #[serde(skip)]
    pub module_path: PathBuf,
}

impl Script {
    /// The display name, qualified by the declaring module:
    /// `<module>/<name>`, or just `<name>` at the project root.
    pub fn display_name(&self) -> String {
        match self.module_path.file_name() {
            Some(module) => format!("{}/{}", module.to_string_lossy(), self.name),
            None => self.name.clone(),
        }
    }

    /// Run the script's command, logging the elapsed time.
    pub async fn execute(&self, registry: &CommandRegistry, args: &[String]) -> Result<()> {
        let started = Instant::now();
        let result = self.command.execute(registry, args).await;
        info!(
            script = %self.display_name(),
            elapsed = %format_duration(started.elapsed()),
            "script finished"
        );
        result
    }
}
