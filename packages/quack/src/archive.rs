//! Deterministic pack/unpack of target output file sets.
//!
//! Outputs are stored in a zstd-compressed tar, entries named by their
//! declared path minus any leading `/`. Extraction is content-aware: each
//! entry is staged to a temp file, hashed, and only copied over the
//! destination when the content actually differs. Unchanged destinations
//! keep their mtime, which is what keeps incremental toolchains (CMake and
//! friends) from rebuilding the world after a cache load.

use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_compression::Level;
use async_compression::tokio::bufread::ZstdDecoder;
use async_compression::tokio::write::ZstdEncoder;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::compat::{
    FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt,
};
use tracing::{debug, instrument, trace};

use crate::checksum::sha256_file;

/// Pack the declared output paths into a zstd-compressed tar at
/// `archive_path`. Declared directories are walked recursively; a declared
/// path that does not exist is an error (the build did not produce it).
#[instrument(skip(paths))]
pub async fn archive(paths: &BTreeSet<String>, archive_path: &Path) -> Result<()> {
    let parent = archive_path
        .parent()
        .ok_or_else(|| eyre!("archive path has no parent: {archive_path:?}"))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create archive directory: {parent:?}"))?;

    // Stage to a temp file in the same directory; the temp file is removed
    // on every early-error path by its Drop.
    let temp = tempfile::NamedTempFile::new_in(parent).context("create temporary archive")?;
    let file = tokio::fs::File::from_std(
        temp.as_file()
            .try_clone()
            .context("clone temporary archive handle")?,
    );
    let encoder = ZstdEncoder::with_quality(file, Level::Default);
    let mut builder = async_tar::Builder::new(encoder.compat_write());

    for declared in paths {
        let src = Path::new(declared);
        let name = declared.trim_start_matches('/');
        let metadata = tokio::fs::metadata(src)
            .await
            .with_context(|| format!("declared output does not exist: {declared}"))?;

        if metadata.is_dir() {
            for file in walk_files(src).await? {
                let rel = file
                    .strip_prefix(src)
                    .expect("walked path is under the declared directory")
                    .to_path_buf();
                append_file(&mut builder, &file, &Path::new(name).join(rel)).await?;
            }
        } else {
            append_file(&mut builder, src, Path::new(name)).await?;
        }
    }

    let compat = builder.into_inner().await.context("finalize archive")?;
    let mut encoder = compat.into_inner();
    encoder.shutdown().await.context("flush zstd encoder")?;
    let mut file = encoder.into_inner();
    file.flush().await.context("flush archive file")?;
    drop(file);

    temp.persist(archive_path)
        .with_context(|| format!("publish archive: {archive_path:?}"))?;
    debug!(?archive_path, "packed outputs");
    Ok(())
}

/// Extract an archive produced by [`archive`], mapping entries back to
/// their declared destinations via the target's output paths.
#[instrument(skip(outputs))]
pub async fn extract(archive_path: &Path, outputs: &BTreeSet<String>) -> Result<()> {
    let file = tokio::fs::File::open(archive_path)
        .await
        .with_context(|| format!("open archive: {archive_path:?}"))?;
    let decoder = ZstdDecoder::new(BufReader::new(file));
    let archive = async_tar::Archive::new(decoder.compat());
    let mut entries = archive.entries().context("read archive entries")?;

    let staging = tempfile::tempdir().context("create staging directory")?;
    let (mut copied, mut unchanged) = (0usize, 0usize);
    let mut index = 0usize;

    while let Some(entry) = entries.next().await {
        let mut entry = entry.context("read archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let entry_path = entry.path().context("read entry path")?.into_owned();
        let mode = entry.header().mode().unwrap_or(0o644);

        index += 1;
        let staged = staging.path().join(index.to_string());
        let digest = stage_entry(&mut entry, &staged)
            .await
            .with_context(|| format!("stage entry: {entry_path:?}"))?;

        let dest = resolve_destination(Path::new(entry_path.as_os_str()), outputs);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false)
            && sha256_file(&dest).await? == digest
        {
            trace!(?dest, "destination unchanged, keeping mtime");
            unchanged += 1;
            continue;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create destination directory: {parent:?}"))?;
        }
        tokio::fs::copy(&staged, &dest)
            .await
            .with_context(|| format!("restore file: {dest:?}"))?;
        tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("restore permissions: {dest:?}"))?;
        filetime::set_file_mtime(&dest, filetime::FileTime::now())
            .with_context(|| format!("stamp restored file: {dest:?}"))?;
        copied += 1;
    }

    debug!(?archive_path, copied, unchanged, "extracted archive");
    Ok(())
}

async fn append_file<W>(
    builder: &mut async_tar::Builder<W>,
    src: &Path,
    name: &Path,
) -> Result<()>
where
    W: futures::io::AsyncWrite + Unpin + Send + Sync,
{
    let file = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("open output file: {src:?}"))?;
    let metadata = file
        .metadata()
        .await
        .with_context(|| format!("stat output file: {src:?}"))?;

    let mut header = async_tar::Header::new_gnu();
    header.set_size(metadata.len());
    header.set_mode(metadata.permissions().mode() & 0o7777);
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or_default();
    header.set_mtime(mtime);
    header.set_cksum();

    builder
        .append_data(&mut header, name, file.compat())
        .await
        .with_context(|| format!("append output file: {src:?}"))?;
    trace!(?src, ?name, "appended output file");
    Ok(())
}

/// Copy an entry to the staging file while hashing it.
async fn stage_entry<R>(entry: &mut R, staged: &Path) -> Result<String>
where
    R: futures::io::AsyncRead + Unpin,
{
    let mut reader = entry.compat();
    let mut file = tokio::fs::File::create(staged)
        .await
        .with_context(|| format!("create staging file: {staged:?}"))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];
    loop {
        let len = reader.read(&mut buffer).await.context("read entry chunk")?;
        if len == 0 {
            break;
        }
        hasher.update(&buffer[..len]);
        file.write_all(&buffer[..len]).await.context("write staged chunk")?;
    }
    file.flush().await.context("flush staging file")?;
    Ok(hex::encode(hasher.finalize()))
}

/// Map an archive entry back to its declared destination.
///
/// Entries are stored without a leading `/`, so `/tmp/out` and `tmp/out`
/// would collide; the declared output set disambiguates. The longest
/// declared path that is a prefix of the entry wins; an entry matching no
/// declared output restores relative to the working directory.
fn resolve_destination(entry_path: &Path, outputs: &BTreeSet<String>) -> PathBuf {
    let entry = entry_path.to_string_lossy();
    let mut best: Option<(usize, &str)> = None;
    for declared in outputs {
        let stripped = declared.trim_start_matches('/');
        let matches = entry.as_ref() == stripped
            || (entry.starts_with(stripped) && entry[stripped.len()..].starts_with('/'));
        if matches && best.is_none_or(|(len, _)| stripped.len() > len) {
            best = Some((stripped.len(), declared.as_str()));
        }
    }
    match best {
        Some((len, declared)) => PathBuf::from(format!("{declared}{}", &entry[len..])),
        None => PathBuf::from(entry.into_owned()),
    }
}

/// Walk regular files under a directory, sorted for determinism.
async fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk output directory: {root:?}"))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    })
    .await
    .context("join walk task")?
}
