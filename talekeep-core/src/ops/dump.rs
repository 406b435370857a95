//! Open Library dump ingestion.
//!
//! Dumps are huge tab-separated files (`type<TAB>key<TAB>revision<TAB>
//! last_modified<TAB>json`), optionally gzipped. Ingestion streams the file
//! on a blocking reader task, feeds record batches to the async side over a
//! small channel, and persists a checkpoint after every batch so a restart
//! resumes from the last offset instead of the beginning.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use flate2::read::GzDecoder;
use serde_json::json;
use talekeep_model::{Author, AuthorId, LogLevel, Work};

use crate::queue::{OperationFunc, ProgressReporter};
use crate::store::Store;
use crate::{CoreError, Result};

const BATCH_SIZE: usize = 500;

pub struct DumpImportArgs {
    pub store: Arc<dyn Store>,
    pub dump_path: PathBuf,
}

pub fn import(args: DumpImportArgs) -> OperationFunc {
    Box::new(move |_token, reporter| Box::pin(run_import(args, reporter)))
}

/// One parsed dump line.
#[derive(Debug, Clone)]
pub enum DumpRecord {
    Work(Work),
    Author(Author),
}

async fn run_import(args: DumpImportArgs, reporter: Arc<ProgressReporter>) -> Result<()> {
    let store = args.store;

    // Resume from the previous lifetime's offset when one exists.
    let start_offset = reporter
        .checkpoint()
        .await
        .and_then(|cp| cp.0.get("offset").and_then(|v| v.as_u64()))
        .unwrap_or(0);

    reporter
        .update_progress(
            start_offset,
            0,
            &format!("importing dump from line {start_offset}"),
        )
        .await?;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<(u64, DumpRecord)>>(2);
    let dump_path = args.dump_path.clone();
    let reader_task = tokio::task::spawn_blocking(move || -> Result<()> {
        let reader = open_dump(&dump_path)?;
        let mut batch = Vec::with_capacity(BATCH_SIZE);
        for (index, line) in reader.lines().enumerate() {
            let offset = index as u64 + 1;
            let line = line?;
            if offset <= start_offset {
                continue;
            }
            if let Some(record) = parse_line(&line) {
                batch.push((offset, record));
            }
            if batch.len() >= BATCH_SIZE {
                if tx.blocking_send(std::mem::take(&mut batch)).is_err() {
                    // The consumer went away (cancel or failure); stop reading.
                    return Ok(());
                }
                batch = Vec::with_capacity(BATCH_SIZE);
            }
        }
        if !batch.is_empty() {
            let _ = tx.blocking_send(batch);
        }
        Ok(())
    });

    let mut works = 0u64;
    let mut authors = 0u64;
    let mut offset = start_offset;
    let mut canceled = false;

    while let Some(batch) = rx.recv().await {
        let mut last_type = "";
        for (line_offset, record) in batch {
            offset = line_offset;
            match record {
                DumpRecord::Work(work) => {
                    store.upsert_work(&work).await?;
                    works += 1;
                    last_type = "work";
                }
                DumpRecord::Author(author) => {
                    store.upsert_author(&author).await?;
                    authors += 1;
                    last_type = "author";
                }
            }
        }

        reporter
            .save_checkpoint(json!({
                "offset": offset,
                "record_type": last_type,
                "status": "running",
            }))
            .await;
        reporter
            .update_progress(offset, 0, &format!("imported {works} works, {authors} authors"))
            .await?;

        if reporter.is_canceled().await {
            canceled = true;
            break;
        }
    }
    // Close the channel so the reader stops if it is still going.
    drop(rx);

    match reader_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if !canceled => return Err(err),
        Ok(Err(_)) => {}
        Err(join_err) => {
            return Err(CoreError::Internal(format!("dump reader task: {join_err}")));
        }
    }

    if canceled {
        reporter
            .log(
                LogLevel::Info,
                "dump import canceled, checkpoint kept",
                Some(json!({ "offset": offset })),
            )
            .await
            .ok();
        return Ok(());
    }

    reporter.clear_checkpoint().await;
    reporter
        .update_progress(offset, offset.max(1), "dump import complete")
        .await?;
    reporter
        .log(
            LogLevel::Info,
            "dump import finished",
            Some(json!({ "works": works, "authors": authors, "lines": offset })),
        )
        .await?;
    Ok(())
}

fn open_dump(path: &std::path::Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Parse one dump line into a record. Lines that are not works or authors
/// (editions, redirects) and malformed lines yield `None`.
pub fn parse_line(line: &str) -> Option<DumpRecord> {
    let mut fields = line.splitn(5, '\t');
    let record_type = fields.next()?;
    let key = fields.next()?;
    let _revision = fields.next()?;
    let _last_modified = fields.next()?;
    let payload: serde_json::Value = serde_json::from_str(fields.next()?).ok()?;

    match record_type {
        "/type/work" => {
            let title = payload.get("title")?.as_str()?.to_owned();
            let description = payload.get("description").and_then(|d| match d {
                serde_json::Value::String(s) => Some(s.clone()),
                other => other.get("value").and_then(|v| v.as_str()).map(str::to_owned),
            });
            Some(DumpRecord::Work(Work {
                key: key.to_owned(),
                title,
                author_names: Vec::new(),
                description,
                ingested_at: Utc::now(),
            }))
        }
        "/type/author" => {
            let name = payload.get("name")?.as_str()?.to_owned();
            Some(DumpRecord::Author(Author {
                id: AuthorId::new(),
                name,
                ol_key: Some(key.to_owned()),
                created_at: Utc::now(),
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_work_lines() {
        let line = "/type/work\t/works/OL45883W\t3\t2010-01-01T00:00:00\t{\"title\":\"The Left Hand of Darkness\",\"description\":{\"type\":\"/type/text\",\"value\":\"Winter planet.\"}}";
        match parse_line(line) {
            Some(DumpRecord::Work(work)) => {
                assert_eq!(work.key, "/works/OL45883W");
                assert_eq!(work.title, "The Left Hand of Darkness");
                assert_eq!(work.description.as_deref(), Some("Winter planet."));
            }
            other => panic!("expected work, got {other:?}"),
        }
    }

    #[test]
    fn parses_author_lines() {
        let line = "/type/author\t/authors/OL26320A\t2\t2010-01-01T00:00:00\t{\"name\":\"Ursula K. Le Guin\"}";
        match parse_line(line) {
            Some(DumpRecord::Author(author)) => {
                assert_eq!(author.name, "Ursula K. Le Guin");
                assert_eq!(author.ol_key.as_deref(), Some("/authors/OL26320A"));
            }
            other => panic!("expected author, got {other:?}"),
        }
    }

    #[test]
    fn skips_editions_and_garbage() {
        assert!(parse_line("/type/edition\t/books/OL1M\t1\tts\t{}").is_none());
        assert!(parse_line("not a dump line").is_none());
        assert!(parse_line("/type/work\t/works/OLX\t1\tts\tnot-json").is_none());
    }
}
