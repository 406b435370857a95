//! Organize: move books into the `Author/[Series/]Title.ext` layout under
//! the library root. Moves are atomic per file (temp name + rename) so a
//! concurrent scan never observes a partially written file, and one failed
//! move never aborts the batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use talekeep_model::{Book, BookLocation, LogLevel};

use crate::queue::{OperationFunc, ProgressReporter};
use crate::store::Store;
use crate::{CoreError, Result, media};

use super::PROGRESS_BATCH;

pub struct OrganizeArgs {
    pub store: Arc<dyn Store>,
    pub root: PathBuf,
}

pub fn organize(args: OrganizeArgs) -> OperationFunc {
    Box::new(move |_token, reporter| Box::pin(run_organize(args, reporter)))
}

/// Target path for a book under the root.
pub fn target_path(root: &Path, book: &Book) -> PathBuf {
    let mut path = root.join(media::sanitize_component(&book.author));
    if let Some(series) = &book.series {
        path = path.join(media::sanitize_component(series));
    }
    let extension = Path::new(&book.path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("m4b");
    let stem = match book.series_index {
        Some(index) if index.fract() == 0.0 => {
            format!("{:02} - {}", index as u64, media::sanitize_component(&book.title))
        }
        Some(index) => format!("{index} - {}", media::sanitize_component(&book.title)),
        None => media::sanitize_component(&book.title),
    };
    path.join(format!("{stem}.{extension}"))
}

async fn run_organize(args: OrganizeArgs, reporter: Arc<ProgressReporter>) -> Result<()> {
    let store = args.store;
    let root = args.root;

    let books = store.list_books().await?;
    let pending: Vec<Book> = books
        .into_iter()
        .filter(|book| Path::new(&book.path) != target_path(&root, book))
        .collect();

    let total = pending.len() as u64;
    reporter
        .update_progress(0, total, &format!("organizing {total} books"))
        .await?;

    let mut moved = 0u64;
    let mut failed = 0u64;
    let mut processed = 0u64;

    for mut book in pending {
        if reporter.is_canceled().await {
            reporter
                .log(LogLevel::Info, "organize canceled, partial moves kept", None)
                .await
                .ok();
            return Ok(());
        }

        let source = PathBuf::from(&book.path);
        let target = target_path(&root, &book);

        let outcome = if !source.exists() {
            Err(CoreError::not_found(format!("source file {}", source.display())))
        } else if target.exists() {
            Err(CoreError::already_exists(format!("target {}", target.display())))
        } else {
            move_file_atomic(&source, &target).await
        };

        match outcome {
            Ok(()) => {
                book.path = target.display().to_string();
                book.location = BookLocation::Library;
                book.updated_at = Utc::now();
                store.upsert_book(&book).await?;
                moved += 1;
            }
            Err(err) => {
                failed += 1;
                reporter
                    .log(
                        LogLevel::Warn,
                        &format!("could not organize {}", source.display()),
                        Some(json!({ "error": err.to_string() })),
                    )
                    .await
                    .ok();
            }
        }

        processed += 1;
        if processed % PROGRESS_BATCH == 0 {
            reporter
                .update_progress(processed, total, &format!("organized {moved}/{total} books"))
                .await?;
        }
    }

    reporter
        .update_progress(total, total, "organize complete")
        .await?;
    reporter
        .log(
            LogLevel::Info,
            "organize finished",
            Some(json!({ "moved": moved, "failed": failed })),
        )
        .await?;
    Ok(())
}

/// Move a file so the destination only ever appears fully written: rename
/// when source and target share a filesystem, otherwise copy to a temporary
/// sibling of the target and rename into place.
pub async fn move_file_atomic(source: &Path, target: &Path) -> Result<()> {
    let source = source.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::rename(&source, &target) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Cross-device move: stage next to the target, then rename.
                let staged = target.with_extension("talekeep-partial");
                std::fs::copy(&source, &staged)?;
                std::fs::rename(&staged, &target)?;
                std::fs::remove_file(&source)?;
                Ok(())
            }
        }
    })
    .await
    .map_err(|e| CoreError::Internal(format!("move task: {e}")))?
}
