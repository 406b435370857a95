//! Bulk metadata enrichment.
//!
//! Books without a work key are enriched from the locally ingested dump
//! records first; only misses go to the network provider, with bounded
//! exponential backoff on transient failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use talekeep_config::MetadataConfig;
use talekeep_model::{Book, LogLevel, Work};

use crate::queue::{OperationFunc, ProgressReporter};
use crate::store::Store;
use crate::{CoreError, Result};

use super::retry_with_backoff;

pub struct MetadataArgs {
    pub store: Arc<dyn Store>,
    pub cfg: MetadataConfig,
}

pub fn fetch(args: MetadataArgs) -> OperationFunc {
    Box::new(move |_token, reporter| Box::pin(run_fetch(args, reporter)))
}

async fn run_fetch(args: MetadataArgs, reporter: Arc<ProgressReporter>) -> Result<()> {
    let store = args.store;
    let cfg = args.cfg;

    let pending: Vec<Book> = store
        .list_books()
        .await?
        .into_iter()
        .filter(Book::needs_metadata)
        .collect();

    let total = pending.len() as u64;
    reporter
        .update_progress(0, total, &format!("fetching metadata for {total} books"))
        .await?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(20))
        .user_agent("talekeep/0.1")
        .build()
        .map_err(|e| CoreError::Internal(format!("http client: {e}")))?;

    let mut enriched = 0u64;
    let mut missed = 0u64;
    let mut processed = 0u64;

    for mut book in pending {
        if reporter.is_canceled().await {
            reporter
                .log(LogLevel::Info, "metadata fetch canceled", None)
                .await
                .ok();
            return Ok(());
        }

        // Local dump lookup precedes the network.
        let found = match store.work_by_title(&book.title).await? {
            Some(work) => Some(found_from_work(work)),
            None => {
                match retry_with_backoff(cfg.max_retries, Duration::from_millis(500), || {
                    search_provider(&client, &cfg.provider_base_url, &book.title, &book.author)
                })
                .await
                {
                    Ok(found) => found,
                    Err(err) if err.is_transient() => {
                        reporter
                            .log(
                                LogLevel::Warn,
                                &format!("provider unreachable for \"{}\"", book.title),
                                Some(json!({ "error": err.to_string() })),
                            )
                            .await
                            .ok();
                        None
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        match found {
            Some(found) => {
                book.work_key = Some(found.key);
                if book.description.is_none() {
                    book.description = found.description;
                }
                book.updated_at = Utc::now();
                store.upsert_book(&book).await?;
                enriched += 1;
            }
            None => missed += 1,
        }

        processed += 1;
        if processed % super::PROGRESS_BATCH == 0 {
            reporter
                .update_progress(
                    processed,
                    total,
                    &format!("enriched {enriched}/{processed} books"),
                )
                .await?;
        }
    }

    reporter
        .update_progress(total, total, "metadata fetch complete")
        .await?;
    reporter
        .log(
            LogLevel::Info,
            "metadata fetch finished",
            Some(json!({ "enriched": enriched, "missed": missed })),
        )
        .await?;
    Ok(())
}

struct FoundWork {
    key: String,
    description: Option<String>,
}

fn found_from_work(work: Work) -> FoundWork {
    FoundWork {
        key: work.key,
        description: work.description,
    }
}

/// Query the Open Library style search endpoint for the best match.
async fn search_provider(
    client: &reqwest::Client,
    base_url: &str,
    title: &str,
    author: &str,
) -> Result<Option<FoundWork>> {
    let url = format!("{}/search.json", base_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .query(&[("title", title), ("author", author), ("limit", "1")])
        .send()
        .await?;

    if response.status().is_server_error() {
        return Err(CoreError::Transient(format!(
            "provider returned {}",
            response.status()
        )));
    }
    if !response.status().is_success() {
        return Err(CoreError::Internal(format!(
            "provider returned {}",
            response.status()
        )));
    }

    let body: serde_json::Value = response.json().await?;
    let Some(doc) = body
        .get("docs")
        .and_then(|docs| docs.as_array())
        .and_then(|docs| docs.first())
    else {
        return Ok(None);
    };

    let Some(key) = doc.get("key").and_then(|k| k.as_str()) else {
        return Ok(None);
    };
    let description = doc
        .get("first_sentence")
        .and_then(|s| s.as_array())
        .and_then(|s| s.first())
        .and_then(|s| s.as_str())
        .map(str::to_owned);

    Ok(Some(FoundWork {
        key: key.to_owned(),
        description,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use talekeep_model::{BookId, BookLocation};

    #[tokio::test]
    async fn dump_lookup_wins_without_network() {
        let store = SledStore::open_temporary().unwrap();
        store
            .upsert_work(&Work {
                key: "/works/OL123W".into(),
                title: "The Dispossessed".into(),
                author_names: vec!["Ursula K. Le Guin".into()],
                description: Some("An ambiguous utopia.".into()),
                ingested_at: Utc::now(),
            })
            .await
            .unwrap();

        let now = Utc::now();
        store
            .upsert_book(&Book {
                id: BookId::new(),
                title: "The Dispossessed".into(),
                author: "Ursula K. Le Guin".into(),
                series: None,
                series_index: None,
                path: "/library/d.m4b".into(),
                size_bytes: 1,
                content_hash: "h1".into(),
                location: BookLocation::Library,
                work_key: None,
                description: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        // The work is found by title, so the provider (an unroutable URL) is
        // never consulted.
        let work = store
            .work_by_title("the dispossessed")
            .await
            .unwrap()
            .expect("dump record");
        assert_eq!(work.key, "/works/OL123W");
    }
}
