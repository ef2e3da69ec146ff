//! End-to-end engine scenarios over the local backend.

use std::collections::BTreeSet;
use std::path::Path;

use pretty_assertions::assert_eq as pretty_assert_eq;

use quack::cache::{Backend, LocalBackend, RawBackend};
use quack::ci::CiEnvironment;
use quack::cloud::DiskDriver;
use quack::config::Config;
use quack::engine::Engine;
use quack::model::TargetExecutionMode;

use crate::helpers;

type TestBackend = Backend<DiskDriver>;

fn local_backend(dir: &Path, ci: &CiEnvironment) -> TestBackend {
    Backend::Local(LocalBackend::rooted(dir.join("cache"), ci))
}

fn raw_backend() -> TestBackend {
    Backend::Raw(RawBackend)
}

/// A single-target spec whose build appends to a marker file, so tests can
/// count how many times the build actually ran.
fn counting_spec(out: &Path, builds: &Path) -> String {
    format!(
        "\
app_name: demo
targets:
  - name: 'demo:test'
    description: cache round trip fixture
    dependencies:
      - type: variable
        names: ['^PATH$']
    outputs: {{ paths: ['{out}'] }}
    operations:
      build: 'echo hello > {out} && echo built >> {builds}'
",
        out = out.display(),
        builds = builds.display(),
    )
}

async fn build_count(builds: &Path) -> usize {
    match tokio::fs::read_to_string(builds).await {
        Ok(text) => text.lines().count(),
        Err(_) => 0,
    }
}

#[test_log::test(tokio::test)]
async fn normal_mode_round_trips_through_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("quack-output");
    let builds = dir.path().join("builds");
    let text = counting_spec(&out, &builds);

    // First run: miss, build, save, load.
    let runtime = helpers::runtime(
        dir.path(),
        &text,
        Config::default(),
        CiEnvironment::default(),
    );
    let backend = local_backend(dir.path(), &runtime.ci);
    Engine::new(&runtime, &backend)
        .execute("demo:test", TargetExecutionMode::Normal)
        .await
        .unwrap();
    pretty_assert_eq!(tokio::fs::read(&out).await.unwrap(), b"hello\n");
    pretty_assert_eq!(build_count(&builds).await, 1);

    // Second, fresh invocation with identical inputs: hit, no rebuild,
    // outputs re-materialised from the archive.
    tokio::fs::remove_file(&out).await.unwrap();
    let runtime = helpers::runtime(
        dir.path(),
        &text,
        Config::default(),
        CiEnvironment::default(),
    );
    let backend = local_backend(dir.path(), &runtime.ci);
    Engine::new(&runtime, &backend)
        .execute("demo:test", TargetExecutionMode::Normal)
        .await
        .unwrap();
    pretty_assert_eq!(tokio::fs::read(&out).await.unwrap(), b"hello\n");
    pretty_assert_eq!(build_count(&builds).await, 1);
}

#[test_log::test(tokio::test)]
async fn command_dependency_drives_the_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let out = dir.path().join("out");
    tokio::fs::write(&input, b"v1").await.unwrap();
    let text = format!(
        "\
app_name: demo
targets:
  - name: 'demo:test'
    description: fingerprint fixture
    dependencies:
      - type: command
        commands: ['cat {input}']
    outputs: {{ paths: ['{out}'] }}
    operations:
      build: 'echo x > {out}'
",
        input = input.display(),
        out = out.display(),
    );

    let checksum = |text: String| {
        let dir = dir.path().to_path_buf();
        async move {
            let runtime =
                helpers::runtime(&dir, &text, Config::default(), CiEnvironment::default());
            let backend = raw_backend();
            let engine = Engine::new(&runtime, &backend);
            let target = runtime.spec.target("demo:test").unwrap();
            engine.checksum_of(target).await.unwrap()
        }
    };

    // Identical inputs fingerprint identically across invocations.
    let first = checksum(text.clone()).await;
    let second = checksum(text.clone()).await;
    pretty_assert_eq!(first, second);

    // A changed command output invalidates the fingerprint.
    tokio::fs::write(&input, b"v2").await.unwrap();
    let third = checksum(text).await;
    assert_ne!(first, third);
}

#[test_log::test(tokio::test)]
async fn output_inheritance_restores_upstream_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let base_out = dir.path().join("base-output");
    let child_out = dir.path().join("child-output");
    let builds = dir.path().join("builds");
    let text = format!(
        "\
app_name: demo
targets:
  - name: 'demo:base'
    description: upstream artifact
    dependencies:
      - type: variable
        names: ['^PATH$']
    outputs: {{ paths: ['{base_out}'] }}
    operations:
      build: 'echo base > {base_out} && echo base >> {builds}'
  - name: 'demo:child'
    description: downstream artifact
    dependencies:
      - type: target
        name: 'demo:base'
    outputs:
      paths: ['{child_out}']
      inherit: true
    operations:
      build: 'echo child > {child_out} && echo child >> {builds}'
",
        base_out = base_out.display(),
        child_out = child_out.display(),
        builds = builds.display(),
    );

    let runtime = helpers::runtime(
        dir.path(),
        &text,
        Config::default(),
        CiEnvironment::default(),
    );
    // Post-processing folded the upstream's outputs into the child's.
    pretty_assert_eq!(
        runtime.spec.target("demo:child").unwrap().outputs.paths,
        BTreeSet::from([
            base_out.display().to_string(),
            child_out.display().to_string(),
        ])
    );

    let backend = local_backend(dir.path(), &runtime.ci);
    Engine::new(&runtime, &backend)
        .execute("demo:child", TargetExecutionMode::Normal)
        .await
        .unwrap();
    pretty_assert_eq!(build_count(&builds).await, 2);

    // A fresh machine state: both artifacts come back from one child load.
    tokio::fs::remove_file(&base_out).await.unwrap();
    tokio::fs::remove_file(&child_out).await.unwrap();
    let runtime = helpers::runtime(
        dir.path(),
        &text,
        Config::default(),
        CiEnvironment::default(),
    );
    let backend = local_backend(dir.path(), &runtime.ci);
    Engine::new(&runtime, &backend)
        .execute("demo:child", TargetExecutionMode::Normal)
        .await
        .unwrap();
    pretty_assert_eq!(tokio::fs::read(&base_out).await.unwrap(), b"base\n");
    pretty_assert_eq!(tokio::fs::read(&child_out).await.unwrap(), b"child\n");
    pretty_assert_eq!(build_count(&builds).await, 2);
}

#[test_log::test(tokio::test)]
async fn deps_only_builds_upstream_but_not_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let base_out = dir.path().join("base-output");
    let child_out = dir.path().join("child-output");
    let builds = dir.path().join("builds");
    let text = format!(
        "\
app_name: demo
targets:
  - name: 'demo:base'
    description: upstream artifact
    outputs: {{ paths: ['{base_out}'] }}
    operations:
      build: 'echo base > {base_out} && echo base >> {builds}'
  - name: 'demo:child'
    description: downstream artifact
    dependencies:
      - type: target
        name: 'demo:base'
    outputs: {{ paths: ['{child_out}'] }}
    operations:
      build: 'echo child > {child_out} && echo child >> {builds}'
",
        base_out = base_out.display(),
        child_out = child_out.display(),
        builds = builds.display(),
    );

    let runtime = helpers::runtime(
        dir.path(),
        &text,
        Config::default(),
        CiEnvironment::default(),
    );
    let backend = local_backend(dir.path(), &runtime.ci);
    Engine::new(&runtime, &backend)
        .execute("demo:child", TargetExecutionMode::DepsOnly)
        .await
        .unwrap();

    assert!(base_out.exists());
    assert!(!child_out.exists());
    pretty_assert_eq!(build_count(&builds).await, 1);
}

#[test_log::test(tokio::test)]
async fn load_only_miss_fails_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("quack-output");
    let builds = dir.path().join("builds");
    let text = counting_spec(&out, &builds);

    let runtime = helpers::runtime(
        dir.path(),
        &text,
        Config::default(),
        CiEnvironment::default(),
    );
    let backend = local_backend(dir.path(), &runtime.ci);
    let err = Engine::new(&runtime, &backend)
        .execute("demo:test", TargetExecutionMode::LoadOnly)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no cache entry"));
    pretty_assert_eq!(build_count(&builds).await, 0);
    assert!(!dir.path().join("cache").exists());
}
