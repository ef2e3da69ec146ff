//! SHA-256 fingerprinting primitives.
//!
//! Every dependency kind boils down to a list of strings (or of string
//! pairs) that gets rendered to a canonical textual form and hashed. The
//! rendering must be byte-identical across machines because the resulting
//! digests are the cache keys shared through the cloud tier; we use compact
//! JSON, which is stable and platform independent.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Hash a byte buffer, returning the lowercase hex digest.
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// Hash the contents of the file at the specified path.
#[tracing::instrument]
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open file: {path:?}"))?;
    let mut hasher = Sha256::new();
    let mut data = vec![0; 64 * 1024];
    loop {
        let len = file.read(&mut data).await.context("read chunk")?;
        if len == 0 {
            break;
        }
        hasher.update(&data[..len]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Canonical rendering of an ordered sequence of strings.
pub fn render_strings<S: AsRef<str>>(items: &[S]) -> String {
    let items = items.iter().map(|s| s.as_ref()).collect::<Vec<_>>();
    serde_json::to_string(&items).expect("strings are always serializable")
}

/// Canonical rendering of an ordered sequence of string pairs.
pub fn render_pairs(pairs: &[(String, String)]) -> String {
    serde_json::to_string(pairs).expect("string pairs are always serializable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn sha256_known_vector() {
        pretty_assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn rendering_is_stable() {
        pretty_assert_eq!(render_strings(&["a", "b"]), r#"["a","b"]"#);
        pretty_assert_eq!(
            render_pairs(&[("k".into(), "v".into())]),
            r#"[["k","v"]]"#
        );
        // Escaping must be deterministic too; quotes and backslashes show up
        // in shell command lines that feed command-dependency digests.
        pretty_assert_eq!(render_strings(&[r#"echo "hi""#]), r#"["echo \"hi\""]"#);
    }

    #[tokio::test]
    async fn file_hash_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"hello").await.unwrap();
        pretty_assert_eq!(sha256_file(&path).await.unwrap(), sha256_hex(b"hello"));
    }
}
