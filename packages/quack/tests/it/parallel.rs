//! Parallel script execution and pool poisoning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use quack::ci::CiEnvironment;
use quack::config::Config;
use quack::executor;

use crate::helpers;

const SPEC: &str = "\
app_name: demo
targets:
  - name: 'demo:test'
    description: a target, not a script
    outputs: { paths: ['/tmp/demo-test'] }
    operations: { build: 'true' }
scripts:
  - name: quick
    description: succeeds quickly
    command: 'true'
  - name: also-quick
    description: also succeeds quickly
    command: 'true'
  - name: failing
    description: fails shortly after starting
    command: 'sleep 0.1 && exit 1'
  - name: slow
    description: sleeps essentially forever
    command: 'sleep 100'
";

fn runtime(dir: &std::path::Path) -> Arc<quack::runtime::Runtime> {
    Arc::new(helpers::runtime(
        dir,
        SPEC,
        Config::default(),
        CiEnvironment::default(),
    ))
}

#[test_log::test(tokio::test)]
async fn all_scripts_succeeding_is_a_success() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(dir.path());
    executor::execute_scripts_parallel(
        &runtime,
        &[String::from("quick"), String::from("also-quick")],
    )
    .await
    .unwrap();
}

#[test_log::test(tokio::test)]
async fn first_failure_poisons_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(dir.path());

    let started = Instant::now();
    let err = executor::execute_scripts_parallel(
        &runtime,
        &[String::from("failing"), String::from("slow")],
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("failing"));
    // The slow script's subprocess must have been torn down rather than
    // waited for.
    assert!(
        started.elapsed() < Duration::from_secs(30),
        "pool did not poison promptly: {:?}",
        started.elapsed()
    );
}

#[test_log::test(tokio::test)]
async fn a_single_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(dir.path());
    let err = executor::execute_scripts_parallel(&runtime, &[String::from("quick")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("at least two"));
}

#[test_log::test(tokio::test)]
async fn target_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(dir.path());
    let err = executor::execute_scripts_parallel(
        &runtime,
        &[String::from("quick"), String::from("demo:test")],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("only runs scripts"));
}

#[test_log::test(tokio::test)]
async fn unknown_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(dir.path());
    let err = executor::execute_scripts_parallel(
        &runtime,
        &[String::from("quick"), String::from("nonexistent")],
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("unknown script or target names"));
}
