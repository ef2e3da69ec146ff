//! Cloud and dev tier scenarios over the disk driver.

use std::path::Path;

use pretty_assertions::assert_eq as pretty_assert_eq;

use quack::cache::{
    CACHE_METADATA_FILENAME, CLOUD_CACHE_PREFIX, CloudBackend, DEV_CACHE_PREFIX, DevBackend,
    LocalBackend,
};
use quack::ci::CiEnvironment;
use quack::cloud::{CloudDriver, DiskDriver};
use quack::config::Config;
use quack::model::Target;

const APP: &str = "demo";
const CHECKSUM: &str = "ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12";
const COMMIT: &str = "391562ccc2e3f99ea834d2c0a6bc7bc7799c0312";

fn ci_env() -> CiEnvironment {
    CiEnvironment {
        is_ci: true,
        commit_sha: String::from(COMMIT),
        ..CiEnvironment::default()
    }
}

fn target(output: &Path) -> Target {
    serde_yaml::from_str(&format!(
        "name: 'demo:test'\n\
         description: cloud cache fixture\n\
         outputs: {{ paths: ['{}'] }}\n\
         operations: {{ build: 'true' }}\n",
        output.display()
    ))
    .unwrap()
}

fn cloud_tier(
    dir: &Path,
    driver: &DiskDriver,
    local_name: &str,
    config: &Config,
    ci: &CiEnvironment,
) -> CloudBackend<DiskDriver> {
    let local = LocalBackend::rooted(dir.join(local_name), ci);
    CloudBackend::new(driver.clone(), CLOUD_CACHE_PREFIX, APP, local, config, ci, 15)
}

fn metadata_key(target: &Target) -> String {
    format!(
        "{CLOUD_CACHE_PREFIX}/{APP}/{}/{CACHE_METADATA_FILENAME}",
        target.cache_path(CHECKSUM)
    )
}

#[test_log::test(tokio::test)]
async fn save_publishes_entry_and_commit_index() {
    let dir = tempfile::tempdir().unwrap();
    let driver = DiskDriver::new(dir.path().join("bucket"));
    let out = dir.path().join("artifact");
    tokio::fs::write(&out, b"payload").await.unwrap();

    let config = Config {
        save_for_load: true,
        ..Config::default()
    };
    let ci = ci_env();
    let cloud = cloud_tier(dir.path(), &driver, "local", &config, &ci);
    let target = target(&out);

    assert!(!cloud.exists(&target, CHECKSUM).await.unwrap());
    cloud.save(&target, CHECKSUM).await.unwrap();
    assert!(cloud.exists(&target, CHECKSUM).await.unwrap());
    assert!(driver.exists(&metadata_key(&target)).await.unwrap());

    // The commit index points follow-up jobs at this fingerprint.
    let commit_key = format!("{CLOUD_CACHE_PREFIX}/{APP}/_commits/{COMMIT}/demo:test.json");
    assert!(driver.exists(&commit_key).await.unwrap());
    pretty_assert_eq!(
        cloud.read_commit_checksum("demo:test").await.unwrap(),
        Some(String::from(CHECKSUM))
    );
}

#[test_log::test(tokio::test)]
async fn save_without_save_for_load_skips_the_commit_index() {
    let dir = tempfile::tempdir().unwrap();
    let driver = DiskDriver::new(dir.path().join("bucket"));
    let out = dir.path().join("artifact");
    tokio::fs::write(&out, b"payload").await.unwrap();

    let ci = ci_env();
    let cloud = cloud_tier(dir.path(), &driver, "local", &Config::default(), &ci);
    let target = target(&out);
    cloud.save(&target, CHECKSUM).await.unwrap();

    let commit_key = format!("{CLOUD_CACHE_PREFIX}/{APP}/_commits/{COMMIT}/demo:test.json");
    assert!(!driver.exists(&commit_key).await.unwrap());
    pretty_assert_eq!(cloud.read_commit_checksum("demo:test").await.unwrap(), None);
}

#[test_log::test(tokio::test)]
async fn load_on_a_clean_machine_downloads_from_cloud() {
    let dir = tempfile::tempdir().unwrap();
    let driver = DiskDriver::new(dir.path().join("bucket"));
    let out = dir.path().join("artifact");
    tokio::fs::write(&out, b"payload").await.unwrap();

    let ci = ci_env();
    let target = target(&out);
    let writer = cloud_tier(dir.path(), &driver, "local-writer", &Config::default(), &ci);
    writer.save(&target, CHECKSUM).await.unwrap();

    // A different machine: empty local tier, workspace output missing.
    tokio::fs::remove_file(&out).await.unwrap();
    let reader = cloud_tier(dir.path(), &driver, "local-reader", &Config::default(), &ci);
    reader.load_with(&target, CHECKSUM, true).await.unwrap();
    pretty_assert_eq!(tokio::fs::read(&out).await.unwrap(), b"payload");
}

#[test_log::test(tokio::test)]
async fn touch_advances_remote_metadata_time() {
    let dir = tempfile::tempdir().unwrap();
    let driver = DiskDriver::new(dir.path().join("bucket"));
    let out = dir.path().join("artifact");
    tokio::fs::write(&out, b"payload").await.unwrap();

    let ci = ci_env();
    let cloud = cloud_tier(dir.path(), &driver, "local", &Config::default(), &ci);
    let target = target(&out);
    cloud.save(&target, CHECKSUM).await.unwrap();

    let modified = |driver: DiskDriver| async move {
        driver
            .list_files(CLOUD_CACHE_PREFIX, &[CACHE_METADATA_FILENAME], &[])
            .await
            .unwrap()[0]
            .modified_time
    };
    let before = modified(driver.clone()).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    cloud.load_with(&target, CHECKSUM, true).await.unwrap();
    let after = modified(driver.clone()).await;
    assert!(after > before, "expected touch to advance {before} -> {after}");
}

#[test_log::test(tokio::test)]
async fn corrupt_local_archive_falls_back_to_cloud() {
    let dir = tempfile::tempdir().unwrap();
    let driver = DiskDriver::new(dir.path().join("bucket"));
    let out = dir.path().join("artifact");
    tokio::fs::write(&out, b"payload").await.unwrap();

    let ci = ci_env();
    let cloud = cloud_tier(dir.path(), &driver, "local", &Config::default(), &ci);
    let target = target(&out);
    cloud.save(&target, CHECKSUM).await.unwrap();

    // Corrupt the local copy; the load must degrade to a re-download.
    let local = LocalBackend::rooted(dir.path().join("local"), &ci);
    tokio::fs::write(local.archive_path(&target, CHECKSUM), b"garbage")
        .await
        .unwrap();
    tokio::fs::remove_file(&out).await.unwrap();

    cloud.load_with(&target, CHECKSUM, true).await.unwrap();
    pretty_assert_eq!(tokio::fs::read(&out).await.unwrap(), b"payload");
}

#[test_log::test(tokio::test)]
async fn dev_tier_peeks_at_ci_without_touching_it() {
    let dir = tempfile::tempdir().unwrap();
    let driver = DiskDriver::new(dir.path().join("bucket"));
    let out = dir.path().join("artifact");
    tokio::fs::write(&out, b"payload").await.unwrap();

    let ci = ci_env();
    let target = target(&out);

    // A CI job published the entry into the CI tier.
    let ci_writer = cloud_tier(dir.path(), &driver, "local-ci", &Config::default(), &ci);
    ci_writer.save(&target, CHECKSUM).await.unwrap();

    // A developer machine with empty local and dev tiers.
    let dev_env = CiEnvironment::default();
    let ci_tier = cloud_tier(dir.path(), &driver, "local-dev", &Config::default(), &dev_env);
    let dev_local = LocalBackend::rooted(dir.path().join("local-dev"), &dev_env);
    let dev_tier = CloudBackend::new(
        driver.clone(),
        DEV_CACHE_PREFIX,
        APP,
        dev_local,
        &Config::default(),
        &dev_env,
        3,
    );
    let dev = DevBackend::new(ci_tier, dev_tier);

    assert!(dev.exists(&target, CHECKSUM).await.unwrap());

    let before = driver
        .list_files(CLOUD_CACHE_PREFIX, &[CACHE_METADATA_FILENAME], &[])
        .await
        .unwrap()[0]
        .modified_time;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    tokio::fs::remove_file(&out).await.unwrap();
    dev.load(&target, CHECKSUM).await.unwrap();
    pretty_assert_eq!(tokio::fs::read(&out).await.unwrap(), b"payload");

    // Developer reads must not refresh CI-tier entries.
    let after = driver
        .list_files(CLOUD_CACHE_PREFIX, &[CACHE_METADATA_FILENAME], &[])
        .await
        .unwrap()[0]
        .modified_time;
    pretty_assert_eq!(before, after);
}

#[test_log::test(tokio::test)]
async fn dev_tier_saves_into_its_own_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let driver = DiskDriver::new(dir.path().join("bucket"));
    let out = dir.path().join("artifact");
    tokio::fs::write(&out, b"payload").await.unwrap();

    let env = CiEnvironment::default();
    let target = target(&out);
    let ci_tier = cloud_tier(dir.path(), &driver, "local", &Config::default(), &env);
    let dev_local = LocalBackend::rooted(dir.path().join("local"), &env);
    let dev_tier = CloudBackend::new(
        driver.clone(),
        DEV_CACHE_PREFIX,
        APP,
        dev_local,
        &Config::default(),
        &env,
        3,
    );
    let dev = DevBackend::new(ci_tier, dev_tier);

    dev.save(&target, CHECKSUM).await.unwrap();
    let dev_key = format!(
        "{DEV_CACHE_PREFIX}/{APP}/{}/{CACHE_METADATA_FILENAME}",
        target.cache_path(CHECKSUM)
    );
    assert!(driver.exists(&dev_key).await.unwrap());
    assert!(!driver.exists(&metadata_key(&target)).await.unwrap());
}
