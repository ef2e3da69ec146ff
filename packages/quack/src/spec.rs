//! Spec loading, validation, and post-processing.
//!
//! A project is described by a root `quack.yaml` (the one carrying
//! `app_name`) plus any number of included sub-specs. Sub-specs contribute
//! their targets to the root namespace; their scripts are only visible when
//! the user invoked quack from the sub-spec's own directory.
//!
//! Post-processing runs once on the fully merged root spec, before any
//! fingerprint is computed:
//!
//! 1. `global` references are substituted with the blueprint they name;
//! 2. propagating blueprints are prepended to every target's dependency
//!    list;
//! 3. the target dependency graph is checked for cycles;
//! 4. output inheritance is expanded to its fixpoint.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use lazy_regex::regex_is_match;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::model::{Dependency, GlobalDependency, Script, Target};

/// The spec filename looked up in every participating directory.
pub const SPEC_FILENAME: &str = "quack.yaml";

/// A malformed or inconsistent spec. Always aborts the invocation.
#[derive(Clone, Debug, derive_more::Display, derive_more::Error)]
#[display("{message}")]
pub struct SpecError {
    message: String,
}

impl SpecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The merged, root-level spec of a project.
#[derive(Clone, Debug)]
pub struct Spec {
    pub app_name: String,
    /// Path of the root `quack.yaml`.
    pub path: PathBuf,
    pub global_dependencies: Vec<GlobalDependency>,
    pub targets: BTreeMap<String, Target>,
    pub scripts: BTreeMap<String, Script>,
}

/// The raw file-level document, before merging.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SpecFile {
    app_name: Option<String>,
    include: Vec<PathBuf>,
    global_dependencies: Vec<GlobalDependency>,
    targets: Vec<Target>,
    scripts: Vec<Script>,
}

impl Spec {
    /// Load the root spec at `path` and every included sub-spec.
    ///
    /// `pwd` is the directory quack was invoked from (before changing to
    /// the project root); it decides which sub-spec's scripts are exposed.
    #[instrument]
    pub fn load(pwd: &Path, path: &Path) -> Result<Self> {
        let path = std::path::absolute(path).context("resolve spec path")?;
        let root_dir = path
            .parent()
            .ok_or_else(|| SpecError::new("spec path has no parent directory"))?
            .to_path_buf();
        let pwd = std::path::absolute(pwd).context("resolve working directory")?;

        let mut spec = Self {
            app_name: String::new(),
            path: path.clone(),
            global_dependencies: Vec::new(),
            targets: BTreeMap::new(),
            scripts: BTreeMap::new(),
        };
        spec.absorb(&pwd, &root_dir, &path, true)?;
        Ok(spec)
    }

    /// Parse one spec file and merge its contents, recursing into includes.
    fn absorb(&mut self, pwd: &Path, root_dir: &Path, path: &Path, is_root: bool) -> Result<()> {
        debug!(?path, "parsing spec file");
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read spec file: {path:?}"))?;
        let file: SpecFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parse spec file: {path:?}"))?;
        let dir = path.parent().expect("spec path has a parent");

        // app_name and global dependencies only count at the root; a
        // sub-spec may carry its own for standalone use, which we ignore.
        if is_root {
            self.app_name = file.app_name.unwrap_or_default();
            for mut global in file.global_dependencies {
                Self::root_commands(&mut global.dependency, root_dir);
                if self
                    .global_dependencies
                    .iter()
                    .any(|g| g.name == global.name)
                {
                    return Err(SpecError::new(format!(
                        "duplicate global dependency name: {}",
                        global.name
                    ))
                    .into());
                }
                self.global_dependencies.push(global);
            }
        }

        for mut target in file.targets {
            target.operations.build.set_base_path(root_dir);
            for dependency in &mut target.dependencies {
                Self::root_commands(dependency, root_dir);
            }
            self.add_target(target)?;
        }

        // Scripts are local to the directory quack runs from.
        if dir == pwd {
            for mut script in file.scripts {
                script.module_path = dir.to_path_buf();
                script.command.set_base_path(pwd);
                self.add_script(script)?;
            }
        }

        for include in file.include {
            // Include paths are resolved against the project root, the
            // working directory of the whole invocation.
            let sub_path = root_dir.join(&include).join(SPEC_FILENAME);
            self.absorb(pwd, root_dir, &sub_path, false)?;
        }

        Ok(())
    }

    /// Anchor a dependency's probe commands at the project root, so their
    /// working directories don't depend on where the process happens to be.
    fn root_commands(dependency: &mut Dependency, root_dir: &Path) {
        if let Dependency::Command(dep) = dependency {
            for command in &mut dep.commands {
                command.set_base_path(root_dir);
            }
        }
    }

    fn add_target(&mut self, target: Target) -> Result<()> {
        if self.targets.contains_key(&target.name) || self.scripts.contains_key(&target.name) {
            return Err(SpecError::new(format!("duplicate name: {}", target.name)).into());
        }
        self.targets.insert(target.name.clone(), target);
        Ok(())
    }

    fn add_script(&mut self, script: Script) -> Result<()> {
        if self.targets.contains_key(&script.name) || self.scripts.contains_key(&script.name) {
            return Err(SpecError::new(format!("duplicate name: {}", script.name)).into());
        }
        self.scripts.insert(script.name.clone(), script);
        Ok(())
    }

    /// Look up a target by name.
    pub fn target(&self, name: &str) -> Result<&Target> {
        self.targets
            .get(name)
            .ok_or_else(|| SpecError::new(format!("target not found: {name}")).into())
    }

    /// Look up a script by name.
    pub fn script(&self, name: &str) -> Result<&Script> {
        self.scripts
            .get(name)
            .ok_or_else(|| SpecError::new(format!("script not found: {name}")).into())
    }

    /// Field-level validation of every entity in the merged spec.
    pub fn validate(&self) -> Result<()> {
        if !regex_is_match!(r"^[a-z0-9\-_]{1,32}$", &self.app_name) {
            return Err(SpecError::new(format!(
                "invalid app_name (lowercase/digits/-_, at most 32 chars): {:?}",
                self.app_name
            ))
            .into());
        }

        for target in self.targets.values() {
            if !regex_is_match!(r"^[a-z0-9\-]+:[a-z0-9\-:]+$", &target.name)
                || target.name.len() > 48
            {
                return Err(
                    SpecError::new(format!("invalid target name: {}", target.name)).into(),
                );
            }
            if target.description.len() > 255 {
                return Err(SpecError::new(format!(
                    "target description too long: {}",
                    target.name
                ))
                .into());
            }
            for dependency in &target.dependencies {
                dependency
                    .validate()
                    .with_context(|| format!("invalid dependency of target {}", target.name))?;
            }
        }

        for script in self.scripts.values() {
            if !regex_is_match!(r"^[a-z0-9\-_\.]+$", &script.name) || script.name.len() > 32 {
                return Err(
                    SpecError::new(format!("invalid script name: {}", script.name)).into(),
                );
            }
            if script.description.len() > 255 {
                return Err(SpecError::new(format!(
                    "script description too long: {}",
                    script.name
                ))
                .into());
            }
        }

        for global in &self.global_dependencies {
            global
                .dependency
                .validate()
                .with_context(|| format!("invalid global dependency {}", global.name))?;
            if matches!(global.dependency, Dependency::Global(_)) {
                return Err(SpecError::new(format!(
                    "global dependency {} may not be of type global",
                    global.name
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Resolve global references, inject propagating globals, reject
    /// cycles, and expand output inheritance. Must run exactly once, before
    /// any fingerprint is computed.
    #[instrument(skip(self), fields(app_name = %self.app_name))]
    pub fn post_process(&mut self) -> Result<()> {
        self.resolve_globals()?;
        self.detect_cycles()?;
        self.expand_output_inheritance();
        Ok(())
    }

    fn resolve_globals(&mut self) -> Result<()> {
        let globals = self.global_dependencies.clone();

        for target in self.targets.values_mut() {
            let mut resolved = Vec::with_capacity(target.dependencies.len());
            for dependency in target.dependencies.drain(..) {
                match dependency {
                    Dependency::Global(reference) => {
                        let global = globals
                            .iter()
                            .find(|g| g.name == reference.name)
                            .ok_or_else(|| {
                                SpecError::new(format!(
                                    "target {} references unknown global dependency {}",
                                    target.name, reference.name
                                ))
                            })?;
                        // Propagating globals are injected into every
                        // target below; naming one explicitly would make it
                        // count twice in the fingerprint.
                        if global.dependency.propagate() {
                            return Err(SpecError::new(format!(
                                "target {} references propagating global dependency {}",
                                target.name, global.name
                            ))
                            .into());
                        }
                        resolved.push(global.dependency.clone());
                    }
                    other => resolved.push(other),
                }
            }
            target.dependencies = resolved;
        }

        // Propagating globals affect every fingerprint in the spec; they go
        // first, keeping their declaration order.
        let propagating = globals
            .iter()
            .filter(|g| g.dependency.propagate())
            .map(|g| g.dependency.clone())
            .collect::<Vec<_>>();
        if !propagating.is_empty() {
            for target in self.targets.values_mut() {
                let mut dependencies = propagating.clone();
                dependencies.append(&mut target.dependencies);
                target.dependencies = dependencies;
            }
        }

        Ok(())
    }

    /// Reject cycles in the target dependency graph. Runs after global
    /// resolution so injected target-kind dependencies participate too.
    fn detect_cycles(&self) -> Result<()> {
        #[derive(Copy, Clone, Eq, PartialEq)]
        enum State {
            Visiting,
            Done,
        }

        fn visit(
            name: &str,
            targets: &BTreeMap<String, Target>,
            states: &mut HashMap<String, State>,
        ) -> Result<()> {
            match states.get(name) {
                Some(State::Done) => return Ok(()),
                Some(State::Visiting) => {
                    return Err(
                        SpecError::new(format!("target dependency cycle through {name}")).into(),
                    );
                }
                None => {}
            }
            states.insert(name.to_string(), State::Visiting);

            let target = targets
                .get(name)
                .ok_or_else(|| SpecError::new(format!("target not found: {name}")))?;
            for dependency in &target.dependencies {
                if let Dependency::Target(upstream) = dependency {
                    if !targets.contains_key(&upstream.name) {
                        return Err(SpecError::new(format!(
                            "target {} references unknown target {}",
                            name, upstream.name
                        ))
                        .into());
                    }
                    visit(&upstream.name, targets, states)?;
                }
            }

            states.insert(name.to_string(), State::Done);
            Ok(())
        }

        let mut states = HashMap::new();
        for name in self.targets.keys() {
            visit(name, &self.targets, &mut states)?;
        }
        Ok(())
    }

    /// Expand `outputs.inherit` to its fixpoint over the (acyclic) target
    /// graph: an inheriting target's outputs are its own paths plus the
    /// expanded paths of every upstream target dependency.
    fn expand_output_inheritance(&mut self) {
        fn expanded(
            name: &str,
            targets: &BTreeMap<String, Target>,
            memo: &mut HashMap<String, BTreeSet<String>>,
        ) -> BTreeSet<String> {
            if let Some(paths) = memo.get(name) {
                return paths.clone();
            }

            let target = &targets[name];
            let mut paths = target.outputs.paths.clone();
            if target.outputs.inherit {
                for dependency in &target.dependencies {
                    if let Dependency::Target(upstream) = dependency {
                        paths.extend(expanded(&upstream.name, targets, memo));
                    }
                }
            }
            memo.insert(name.to_string(), paths.clone());
            paths
        }

        let mut memo = HashMap::new();
        let expanded_sets = self
            .targets
            .keys()
            .map(|name| (name.clone(), expanded(name, &self.targets, &mut memo)))
            .collect::<Vec<_>>();
        for (name, paths) in expanded_sets {
            self.targets
                .get_mut(&name)
                .expect("expanded set computed from existing target")
                .outputs
                .paths = paths;
        }
    }
}
