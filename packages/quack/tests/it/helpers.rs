use std::path::{Path, PathBuf};

use quack::cache::BackendKind;
use quack::ci::CiEnvironment;
use quack::config::Config;
use quack::runtime::Runtime;
use quack::spec::{SPEC_FILENAME, Spec};

pub fn write_spec(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join(SPEC_FILENAME);
    std::fs::write(&path, text).unwrap();
    path
}

/// A runtime over a validated, post-processed spec written to `dir`.
pub fn runtime(dir: &Path, text: &str, config: Config, ci: CiEnvironment) -> Runtime {
    let path = write_spec(dir, text);
    let mut spec = Spec::load(dir, &path).unwrap();
    spec.validate().unwrap();
    spec.post_process().unwrap();
    Runtime::new(spec, config, ci, BackendKind::Local)
}
