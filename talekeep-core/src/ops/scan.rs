//! Library scan: walk the root and import paths, hash, dedupe, classify.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use talekeep_model::{Author, AuthorId, Book, BookId, BookLocation, LogLevel};

use crate::queue::{OperationFunc, ProgressReporter};
use crate::store::Store;
use crate::{CoreError, Result, hashing, media};

use super::PROGRESS_BATCH;

pub struct ScanArgs {
    pub store: Arc<dyn Store>,
    pub root: Option<PathBuf>,
    /// Also prune records whose files have vanished.
    pub force_update: bool,
}

pub fn scan(args: ScanArgs) -> OperationFunc {
    Box::new(move |_token, reporter| Box::pin(run_scan(args, reporter)))
}

struct Candidate {
    path: PathBuf,
    base: PathBuf,
    location: BookLocation,
}

async fn run_scan(args: ScanArgs, reporter: Arc<ProgressReporter>) -> Result<()> {
    let store = args.store;
    let import_paths = store.list_import_paths().await?;

    let root = args.root.clone();
    let enabled_imports: Vec<PathBuf> = import_paths
        .iter()
        .filter(|p| p.enabled)
        .map(|p| PathBuf::from(&p.path))
        .collect();

    let candidates = tokio::task::spawn_blocking(move || enumerate(root.as_deref(), &enabled_imports))
        .await
        .map_err(|e| CoreError::Internal(format!("scan enumeration task: {e}")))?;

    let total = candidates.len() as u64;
    reporter
        .update_progress(0, total, &format!("scanning {total} audio files"))
        .await?;

    let mut processed = 0u64;
    let mut added = 0u64;
    let mut updated = 0u64;
    let mut blocked = 0u64;

    for candidate in candidates {
        if reporter.is_canceled().await {
            reporter
                .log(LogLevel::Info, "scan canceled, partial results kept", None)
                .await
                .ok();
            return Ok(());
        }

        match process_file(store.as_ref(), &candidate).await {
            Ok(FileOutcome::Added) => added += 1,
            Ok(FileOutcome::Updated) => updated += 1,
            Ok(FileOutcome::Blocked) => blocked += 1,
            Ok(FileOutcome::Unchanged) => {}
            Err(err) => {
                reporter
                    .log(
                        LogLevel::Warn,
                        &format!("failed to process {}", candidate.path.display()),
                        Some(json!({ "error": err.to_string() })),
                    )
                    .await
                    .ok();
            }
        }

        processed += 1;
        if processed % PROGRESS_BATCH == 0 {
            reporter
                .update_progress(processed, total, &format!("scanned {processed}/{total} files"))
                .await?;
        }
    }

    let mut removed = 0u64;
    if args.force_update {
        for book in store.list_books().await? {
            if reporter.is_canceled().await {
                return Ok(());
            }
            if !Path::new(&book.path).exists() {
                store.delete_book(&book.id).await?;
                removed += 1;
            }
        }
    }

    reporter
        .update_progress(total, total, "scan complete")
        .await?;
    reporter
        .log(
            LogLevel::Info,
            "scan finished",
            Some(json!({
                "files": total,
                "added": added,
                "updated": updated,
                "blocked": blocked,
                "removed": removed,
            })),
        )
        .await?;
    Ok(())
}

/// Collect every audio file under the root and the enabled import paths.
/// Import paths nested under the root are skipped; the root walk already
/// covers them.
fn enumerate(root: Option<&Path>, import_paths: &[PathBuf]) -> Vec<Candidate> {
    let mut out = Vec::new();

    if let Some(root) = root.filter(|r| r.exists()) {
        collect_audio(root, root, BookLocation::Library, &mut out);
    }

    for import in import_paths {
        if !import.exists() {
            continue;
        }
        if root.map(|r| import.starts_with(r)).unwrap_or(false) {
            continue;
        }
        collect_audio(import, import, BookLocation::Import, &mut out);
    }

    out
}

fn collect_audio(dir: &Path, base: &Path, location: BookLocation, out: &mut Vec<Candidate>) {
    for entry in walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() && media::is_audio_file(entry.path()) {
            out.push(Candidate {
                path: entry.path().to_path_buf(),
                base: base.to_path_buf(),
                location,
            });
        }
    }
}

enum FileOutcome {
    Added,
    Updated,
    Unchanged,
    Blocked,
}

async fn process_file(store: &dyn Store, candidate: &Candidate) -> Result<FileOutcome> {
    let path = candidate.path.clone();
    let hash = tokio::task::spawn_blocking(move || hashing::sha256_file(&path))
        .await
        .map_err(|e| CoreError::Internal(format!("hash task: {e}")))??;

    if store.is_hash_blocked(&hash).await? {
        return Ok(FileOutcome::Blocked);
    }

    let path_str = candidate.path.display().to_string();
    let size = tokio::fs::metadata(&candidate.path).await?.len();

    if let Some(existing) = store.book_by_hash(&hash).await? {
        if existing.path == path_str && existing.location == candidate.location {
            return Ok(FileOutcome::Unchanged);
        }
        let mut book = existing;
        book.path = path_str;
        book.location = candidate.location;
        book.size_bytes = size;
        book.updated_at = Utc::now();
        store.upsert_book(&book).await?;
        return Ok(FileOutcome::Updated);
    }

    // A file replaced in place keeps its path but changes hash; retire the
    // stale record so the path index stays truthful.
    if let Some(stale) = store.book_by_path(&path_str).await? {
        if stale.content_hash != hash {
            store.delete_book(&stale.id).await?;
        }
    }

    let meta = media::infer_book_meta(&candidate.path, &candidate.base);
    let now = Utc::now();
    let book = Book {
        id: BookId::new(),
        title: meta.title,
        author: meta.author.clone(),
        series: meta.series,
        series_index: meta.series_index,
        path: path_str,
        size_bytes: size,
        content_hash: hash,
        location: candidate.location,
        work_key: None,
        description: None,
        created_at: now,
        updated_at: now,
    };
    store.upsert_book(&book).await?;

    if store.author_by_name(&meta.author).await?.is_none() {
        store
            .upsert_author(&Author {
                id: AuthorId::new(),
                name: meta.author,
                ol_key: None,
                created_at: now,
            })
            .await?;
    }

    Ok(FileOutcome::Added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use talekeep_model::BlockedHash;

    fn write_audio(dir: &Path, rel: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn blocked_hash_never_becomes_a_book() {
        let store = SledStore::open_temporary().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write_audio(dir.path(), "A/Book.mp3", b"blocked-bytes");

        store
            .block_hash(&BlockedHash {
                hash: hashing::sha256_bytes(b"blocked-bytes"),
                reason: Some("duplicate".into()),
                blocked_at: Utc::now(),
            })
            .await
            .unwrap();

        let candidates = enumerate(Some(dir.path()), &[]);
        assert_eq!(candidates.len(), 1);
        let outcome = process_file(&store, &candidates[0]).await.unwrap();
        assert!(matches!(outcome, FileOutcome::Blocked));
        assert!(store.list_books().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rescan_of_unchanged_file_is_a_noop() {
        let store = SledStore::open_temporary().unwrap();
        let dir = tempfile::tempdir().unwrap();
        write_audio(dir.path(), "Naomi Novik/Uprooted.m4b", b"audio");

        let candidates = enumerate(Some(dir.path()), &[]);
        assert!(matches!(
            process_file(&store, &candidates[0]).await.unwrap(),
            FileOutcome::Added
        ));
        assert!(matches!(
            process_file(&store, &candidates[0]).await.unwrap(),
            FileOutcome::Unchanged
        ));

        let books = store.list_books().await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].author, "Naomi Novik");
        assert_eq!(books[0].title, "Uprooted");
        assert_eq!(books[0].location, BookLocation::Library);
    }

    #[tokio::test]
    async fn moved_file_keeps_one_record() {
        let store = SledStore::open_temporary().unwrap();
        let import = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();

        let src = write_audio(import.path(), "drop/book.mp3", b"same-bytes");
        let import_candidates = enumerate(None, &[import.path().to_path_buf()]);
        process_file(&store, &import_candidates[0]).await.unwrap();
        assert_eq!(
            store.list_books().await.unwrap()[0].location,
            BookLocation::Import
        );

        // Same bytes appear under the root; the record follows the file.
        std::fs::remove_file(&src).unwrap();
        write_audio(root.path(), "Author/book.mp3", b"same-bytes");
        let root_candidates = enumerate(Some(root.path()), &[]);
        assert!(matches!(
            process_file(&store, &root_candidates[0]).await.unwrap(),
            FileOutcome::Updated
        ));

        let books = store.list_books().await.unwrap();
        assert_eq!(books.len(), 1);
        assert_eq!(books[0].location, BookLocation::Library);
    }

    #[test]
    fn import_paths_under_root_are_not_enumerated_twice() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("incoming");
        write_audio(&nested, "x.mp3", b"x");

        let candidates = enumerate(Some(root.path()), &[nested]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].location, BookLocation::Library);
    }
}
