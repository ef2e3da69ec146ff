//! CI environment detection.
//!
//! Fingerprinting and the cache protocol behave slightly differently in CI:
//! the source-file inventory only covers committed files, cache entries are
//! stamped with the commit under build, and the commit index (used by
//! follow-up jobs to re-materialise artifacts) is only written there.
//!
//! Detection is based on the environment variables set by GitLab CI and
//! GitHub Actions; downstream code only consumes `is_ci` and `commit_sha`,
//! the remaining fields exist for log context.

use std::env;

/// A read-only snapshot of the CI-related environment.
#[derive(Clone, Debug, Default)]
pub struct CiEnvironment {
    /// Whether the current process runs under CI (`CI=true`).
    pub is_ci: bool,
    /// The commit under build, empty outside CI.
    pub commit_sha: String,
    /// The name of the running job, empty outside CI.
    pub job_name: String,
    /// The pipeline (workflow run) id, zero outside CI.
    pub pipeline_id: u64,
    /// The merge/pull request id, zero outside merge pipelines.
    pub pr_id: u64,
    /// Whether the pipeline runs for a merge group / merge train.
    pub is_merge_group: bool,
}

impl CiEnvironment {
    /// Snapshot the CI environment from the process environment.
    pub fn from_env() -> Self {
        Self {
            is_ci: env::var("CI").is_ok_and(|v| v.eq_ignore_ascii_case("true")),
            commit_sha: first_var(&["CI_COMMIT_SHA", "GITHUB_SHA"]),
            job_name: first_var(&["CI_JOB_NAME", "GITHUB_JOB"]),
            pipeline_id: first_var(&["CI_PIPELINE_ID", "GITHUB_RUN_ID"])
                .parse()
                .unwrap_or(0),
            pr_id: first_var(&["CI_MERGE_REQUEST_IID", "GITHUB_PULL_REQUEST_ID"])
                .parse()
                .unwrap_or(0),
            is_merge_group: env::var("CI_MERGE_REQUEST_EVENT_TYPE")
                .is_ok_and(|v| v == "merge_train")
                || env::var("GITHUB_EVENT_NAME").is_ok_and(|v| v == "merge_group"),
        }
    }
}

/// The value of the first set variable in the list, or an empty string.
fn first_var(names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| env::var(name).ok().filter(|v| !v.is_empty()))
        .unwrap_or_default()
}
