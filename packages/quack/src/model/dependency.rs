//! The tagged dependency union.
//!
//! A target declares what its fingerprint is computed over through a list
//! of dependencies, each contributing one checksum:
//!
//! - `source`: repository files selected by anchored regexes;
//! - `command`: the stdout of probe commands (toolchain versions etc);
//! - `variable`: environment variables selected by anchored regexes;
//! - `target`: an upstream target, contributing its whole fingerprint;
//! - `global`: a by-name reference to a reusable blueprint declared at the
//!   spec root, substituted for one of the real kinds during spec
//!   post-processing and never observed by the engine.

use color_eyre::{Result, eyre::Context};
use lazy_regex::Regex;
use serde::Deserialize;

use crate::checksum::{render_pairs, sha256_file, sha256_hex};
use crate::exec::CommandRegistry;
use crate::model::Command;
use crate::spec::SpecError;

/// One entry in a target's dependency list.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Dependency {
    Source(SourceDependency),
    Command(CommandDependency),
    Variable(VariableDependency),
    Target(TargetDependency),
    Global(GlobalReference),
}

impl Dependency {
    /// A short name for fingerprint traces.
    pub fn display_name(&self) -> String {
        match self {
            Self::Source(dep) => format!("source[{}]:{}", dep.paths.len(), dep.paths[0]),
            Self::Command(dep) => {
                let first = dep.commands[0]
                    .command
                    .split_whitespace()
                    .next()
                    .unwrap_or_default();
                format!("command[{}]:{first}", dep.commands.len())
            }
            Self::Variable(dep) => format!("variable[{}]:{}", dep.names.len(), dep.names[0]),
            Self::Target(dep) => format!("target:{}", dep.name),
            Self::Global(dep) => format!("global:{}", dep.name),
        }
    }

    /// Whether this dependency is injected into every target of the spec.
    pub fn propagate(&self) -> bool {
        match self {
            Self::Source(dep) => dep.propagate,
            Self::Command(dep) => dep.propagate,
            Self::Variable(dep) => dep.propagate,
            Self::Target(dep) => dep.propagate,
            Self::Global(dep) => dep.propagate,
        }
    }

    /// Structural validation, run once at spec load.
    pub fn validate(&self) -> Result<(), SpecError> {
        match self {
            Self::Source(dep) => {
                require_nonempty("source dependency", "paths", &dep.paths)?;
                require_anchored(&dep.paths)?;
                require_anchored(&dep.excludes)?;
                require_compilable(dep.paths.iter().chain(&dep.excludes))
            }
            Self::Command(dep) => require_nonempty("command dependency", "commands", &dep.commands),
            Self::Variable(dep) => {
                require_nonempty("variable dependency", "names", &dep.names)?;
                require_anchored(&dep.names)?;
                require_anchored(&dep.excludes)?;
                require_compilable(dep.names.iter().chain(&dep.excludes))
            }
            Self::Target(_) | Self::Global(_) => Ok(()),
        }
    }
}

fn require_nonempty<T>(kind: &str, field: &str, items: &[T]) -> Result<(), SpecError> {
    if items.is_empty() {
        return Err(SpecError::new(format!("{kind} requires at least one entry in `{field}`")));
    }
    Ok(())
}

fn require_anchored(patterns: &[String]) -> Result<(), SpecError> {
    for pattern in patterns {
        if !pattern.starts_with('^') || !pattern.ends_with('$') {
            return Err(SpecError::new(format!(
                "pattern must start with ^ and end with $: {pattern}"
            )));
        }
    }
    Ok(())
}

fn require_compilable<'a>(patterns: impl Iterator<Item = &'a String>) -> Result<(), SpecError> {
    for pattern in patterns {
        if let Err(err) = Regex::new(pattern) {
            return Err(SpecError::new(format!("invalid pattern {pattern}: {err}")));
        }
    }
    Ok(())
}

/// Files selected by anchored regexes over the repository inventory.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceDependency {
    pub paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub propagate: bool,
}

impl SourceDependency {
    /// The files this dependency covers, out of the provided inventory
    /// (`git ls-files` output, one path per line).
    ///
    /// Every include and exclude pattern must select at least one file; a
    /// pattern that matches nothing is a stale spec entry and an error, not
    /// an empty contribution.
    pub fn matched_files(&self, inventory: &[String]) -> Result<Vec<String>> {
        let includes = compile(&self.paths)?;
        let excludes = compile(&self.excludes)?;
        let mut match_counts = vec![0usize; includes.len() + excludes.len()];

        let mut matched = Vec::new();
        for file in inventory {
            // Files still listed by git but deleted on disk contribute
            // nothing.
            if !std::path::Path::new(file).exists() {
                continue;
            }

            let mut keep = false;
            for (i, pattern) in includes.iter().enumerate() {
                if pattern.is_match(file) {
                    match_counts[i] += 1;
                    keep = true;
                    break;
                }
            }
            for (i, pattern) in excludes.iter().enumerate() {
                if pattern.is_match(file) {
                    match_counts[includes.len() + i] += 1;
                    keep = false;
                    break;
                }
            }
            if keep {
                matched.push(file.clone());
            }
        }

        for (i, pattern) in self.paths.iter().chain(&self.excludes).enumerate() {
            if match_counts[i] == 0 {
                return Err(SpecError::new(format!("no files match pattern: {pattern}")).into());
            }
        }

        matched.sort();
        matched.dedup();
        Ok(matched)
    }

    /// The checksum over the sorted `(path, file digest)` pairs.
    pub async fn checksum(&self, inventory: &[String]) -> Result<String> {
        let mut pairs = Vec::new();
        for path in self.matched_files(inventory)? {
            let digest = sha256_file(std::path::Path::new(&path))
                .await
                .with_context(|| format!("hash source file: {path}"))?;
            pairs.push((path, digest));
        }
        Ok(sha256_hex(render_pairs(&pairs)))
    }
}

/// Probe commands whose stdout feeds the fingerprint.
#[derive(Clone, Debug, Deserialize)]
pub struct CommandDependency {
    pub commands: Vec<Command>,
    #[serde(default)]
    pub propagate: bool,
}

impl CommandDependency {
    /// The checksum over `(command line, stdout)` pairs in declared order.
    ///
    /// Declaration order is part of the fingerprint; do not sort.
    pub async fn checksum(&self, registry: &CommandRegistry) -> Result<String> {
        let mut outputs = Vec::new();
        for command in &self.commands {
            let stdout = command
                .execute_capture(registry)
                .await
                .with_context(|| format!("run command dependency: {}", command.command))?;
            outputs.push((command.command.clone(), stdout));
        }
        tracing::debug!(?outputs, "command dependency outputs");
        Ok(sha256_hex(render_pairs(&outputs)))
    }
}

/// Environment variables selected by anchored regexes.
#[derive(Clone, Debug, Deserialize)]
pub struct VariableDependency {
    pub names: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub propagate: bool,
}

impl VariableDependency {
    /// The matching `(name, value)` pairs out of the given environment,
    /// sorted by name.
    pub fn matched_variables(
        &self,
        environ: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Vec<(String, String)>> {
        let includes = compile(&self.names)?;
        let excludes = compile(&self.excludes)?;

        let mut matched = Vec::new();
        for (name, value) in environ {
            let keep = includes.iter().any(|p| p.is_match(&name))
                && !excludes.iter().any(|p| p.is_match(&name));
            if keep {
                matched.push((name, value));
            }
        }
        matched.sort();
        Ok(matched)
    }

    /// The checksum over the matching variables of the current process
    /// environment.
    pub fn checksum(&self) -> Result<String> {
        let matched = self.matched_variables(std::env::vars())?;
        tracing::debug!(
            names = ?matched.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            "variable dependency matches"
        );
        Ok(sha256_hex(render_pairs(&matched)))
    }
}

/// An upstream target; contributes that target's whole fingerprint.
#[derive(Clone, Debug, Deserialize)]
pub struct TargetDependency {
    pub name: String,
    #[serde(default)]
    pub propagate: bool,
}

/// A by-name reference to a global dependency blueprint. Only exists
/// between parsing and spec post-processing.
#[derive(Clone, Debug, Deserialize)]
pub struct GlobalReference {
    pub name: String,
    #[serde(default)]
    pub propagate: bool,
}

/// A reusable dependency blueprint declared at the spec root.
///
/// Blueprints with `propagate: true` are prepended to every target's
/// dependency list; the others are opt-in through `global` references.
#[derive(Clone, Debug, Deserialize)]
pub struct GlobalDependency {
    pub name: String,
    #[serde(flatten)]
    pub dependency: Dependency,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("compile pattern: {p}")))
        .collect()
}
