//! Backup creation, verification, restore, and retention.
//!
//! Backups are timestamped `.tar.gz` archives of the data directory with a
//! SHA-256 checksum sidecar. Retention prunes the oldest archives beyond
//! `max_backups`; `max_backups = 0` disables pruning, and deleting every
//! archive requires the explicit `prune_all` opt-in.

use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::json;
use std::sync::Arc;
use talekeep_config::BackupConfig;
use talekeep_model::LogLevel;

use crate::queue::{OperationFunc, ProgressReporter};
use crate::{CoreError, Result, hashing};

const ARCHIVE_PREFIX: &str = "talekeep-backup-";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

pub struct BackupArgs {
    pub data_dir: PathBuf,
    pub cfg: BackupConfig,
}

pub fn backup(args: BackupArgs) -> OperationFunc {
    Box::new(move |_token, reporter| Box::pin(run_backup(args, reporter)))
}

async fn run_backup(args: BackupArgs, reporter: Arc<ProgressReporter>) -> Result<()> {
    let cfg = args.cfg;
    let data_dir = args.data_dir;

    reporter.update_progress(0, 3, "creating backup archive").await?;
    if reporter.is_canceled().await {
        return Ok(());
    }

    let archive = {
        let dir = cfg.directory.clone();
        let data = data_dir.clone();
        tokio::task::spawn_blocking(move || create_archive(&data, &dir))
            .await
            .map_err(|e| CoreError::Internal(format!("backup task: {e}")))??
    };

    reporter.update_progress(1, 3, "writing checksum").await?;
    let checksum = {
        let archive = archive.clone();
        tokio::task::spawn_blocking(move || write_checksum(&archive))
            .await
            .map_err(|e| CoreError::Internal(format!("checksum task: {e}")))??
    };

    reporter.update_progress(2, 3, "applying retention").await?;
    let pruned = {
        let dir = cfg.directory.clone();
        let keep = archive.clone();
        let max_backups = cfg.max_backups;
        let prune_all = cfg.prune_all;
        tokio::task::spawn_blocking(move || apply_retention(&dir, &keep, max_backups, prune_all))
            .await
            .map_err(|e| CoreError::Internal(format!("retention task: {e}")))??
    };

    reporter.update_progress(3, 3, "backup complete").await?;
    reporter
        .log(
            LogLevel::Info,
            "backup finished",
            Some(json!({
                "archive": archive.display().to_string(),
                "sha256": checksum,
                "pruned": pruned,
            })),
        )
        .await?;
    Ok(())
}

/// Create `talekeep-backup-<timestamp>.tar.gz` of `data_dir` in `out_dir`.
pub fn create_archive(data_dir: &Path, out_dir: &Path) -> Result<PathBuf> {
    if !data_dir.exists() {
        return Err(CoreError::not_found(format!(
            "data directory {}",
            data_dir.display()
        )));
    }
    std::fs::create_dir_all(out_dir)?;

    let name = format!(
        "{ARCHIVE_PREFIX}{}{ARCHIVE_SUFFIX}",
        Utc::now().format("%Y%m%d-%H%M%S")
    );
    let archive_path = out_dir.join(name);

    let file = std::fs::File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all("data", data_dir)?;
    builder.into_inner()?.finish()?;

    Ok(archive_path)
}

/// Archive one file (used to snapshot an iTunes library before write-back).
pub async fn archive_single_file(file: &Path) -> Result<PathBuf> {
    let file = file.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let parent = file
            .parent()
            .ok_or_else(|| CoreError::invalid("file has no parent directory"))?;
        let stem = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        let archive_path = parent.join(format!(
            "{stem}.{}.tar.gz",
            Utc::now().format("%Y%m%d-%H%M%S")
        ));

        let out = std::fs::File::create(&archive_path)?;
        let encoder = GzEncoder::new(out, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_path_with_name(&file, stem)?;
        builder.into_inner()?.finish()?;
        write_checksum(&archive_path)?;
        Ok(archive_path)
    })
    .await
    .map_err(|e| CoreError::Internal(format!("archive task: {e}")))?
}

/// Write `<archive>.sha256` next to the archive; returns the digest.
pub fn write_checksum(archive: &Path) -> Result<String> {
    let digest = hashing::sha256_file(archive)?;
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("archive");
    std::fs::write(
        checksum_path(archive),
        format!("{digest}  {name}\n"),
    )?;
    Ok(digest)
}

fn checksum_path(archive: &Path) -> PathBuf {
    let mut os = archive.as_os_str().to_owned();
    os.push(".sha256");
    PathBuf::from(os)
}

/// Recompute the archive digest and compare against the sidecar.
pub fn verify_checksum(archive: &Path) -> Result<bool> {
    let recorded = std::fs::read_to_string(checksum_path(archive))?;
    let recorded = recorded.split_whitespace().next().unwrap_or_default();
    Ok(hashing::sha256_file(archive)? == recorded)
}

/// Unpack an archive into `dest`; the data lands under `dest/data`.
pub fn restore_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    std::fs::create_dir_all(dest)?;
    tar.unpack(dest)?;
    Ok(())
}

/// Prune old archives. Returns how many were deleted.
///
/// With `max_backups == 0` pruning is disabled; `prune_all` is the explicit
/// opt-in that removes every archive except the one just written.
fn apply_retention(
    dir: &Path,
    just_created: &Path,
    max_backups: usize,
    prune_all: bool,
) -> Result<usize> {
    let mut archives: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(ARCHIVE_PREFIX) && n.ends_with(ARCHIVE_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    // Timestamped names sort chronologically.
    archives.sort();

    let doomed: Vec<PathBuf> = if prune_all {
        archives
            .into_iter()
            .filter(|path| path != just_created)
            .collect()
    } else if max_backups == 0 {
        Vec::new()
    } else if archives.len() > max_backups {
        let excess = archives.len() - max_backups;
        archives.into_iter().take(excess).collect()
    } else {
        Vec::new()
    };

    let mut pruned = 0;
    for path in doomed {
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), %err, "failed to prune backup");
            continue;
        }
        let _ = std::fs::remove_file(checksum_path(&path));
        pruned += 1;
    }
    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_data(dir: &Path) {
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("talekeep.db"), b"sqlite bytes").unwrap();
        std::fs::write(dir.join("nested/extra.json"), b"{\"k\":1}").unwrap();
    }

    #[test]
    fn backup_then_restore_reproduces_the_tree() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let restore = tempfile::tempdir().unwrap();
        seed_data(data.path());

        let archive = create_archive(data.path(), out.path()).unwrap();
        write_checksum(&archive).unwrap();
        assert!(verify_checksum(&archive).unwrap());

        restore_archive(&archive, restore.path()).unwrap();
        assert_eq!(
            std::fs::read(restore.path().join("data/talekeep.db")).unwrap(),
            b"sqlite bytes"
        );
        assert_eq!(
            std::fs::read(restore.path().join("data/nested/extra.json")).unwrap(),
            b"{\"k\":1}"
        );
    }

    #[test]
    fn tampering_fails_verification() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        seed_data(data.path());

        let archive = create_archive(data.path(), out.path()).unwrap();
        write_checksum(&archive).unwrap();
        std::fs::write(&archive, b"corrupted").unwrap();
        assert!(!verify_checksum(&archive).unwrap());
    }

    #[test]
    fn retention_prunes_oldest_beyond_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..5 {
            let path = dir
                .path()
                .join(format!("{ARCHIVE_PREFIX}20250101-00000{i}{ARCHIVE_SUFFIX}"));
            std::fs::write(&path, b"x").unwrap();
            paths.push(path);
        }

        let keep = paths.last().unwrap().clone();
        let pruned = apply_retention(dir.path(), &keep, 2, false).unwrap();
        assert_eq!(pruned, 3);
        assert!(!paths[0].exists());
        assert!(!paths[2].exists());
        assert!(paths[3].exists());
        assert!(paths[4].exists());
    }

    #[test]
    fn zero_max_backups_disables_pruning() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            std::fs::write(
                dir.path()
                    .join(format!("{ARCHIVE_PREFIX}20250101-00000{i}{ARCHIVE_SUFFIX}")),
                b"x",
            )
            .unwrap();
        }
        let keep = dir.path().join("none");
        assert_eq!(apply_retention(dir.path(), &keep, 0, false).unwrap(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn prune_all_requires_the_explicit_flag_and_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..3 {
            let path = dir
                .path()
                .join(format!("{ARCHIVE_PREFIX}20250101-00000{i}{ARCHIVE_SUFFIX}"));
            std::fs::write(&path, b"x").unwrap();
            paths.push(path);
        }
        let keep = paths.last().unwrap().clone();
        let pruned = apply_retention(dir.path(), &keep, 0, true).unwrap();
        assert_eq!(pruned, 2);
        assert!(keep.exists());
    }
}
