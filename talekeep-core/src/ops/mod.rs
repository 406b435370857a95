//! Operation bodies.
//!
//! Each body is an [`OperationFunc`]: a single async entry taking the
//! operation's cancellation token and its [`ProgressReporter`]. Bodies share
//! a few contracts: an initial progress write after enumeration, batched
//! progress afterwards (the hub is not a log drain), a cancellation poll at
//! every coarse step (returning `Ok` so the canceled status stands), and
//! errors returned rather than panicked.

pub mod backup;
pub mod dump;
pub mod itunes;
pub mod metadata;
pub mod organize;
pub mod scan;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use talekeep_config::{BackupConfig, MetadataConfig};
use talekeep_model::{OperationRecord, OperationType};

use crate::Result;
use crate::queue::OperationFunc;
use crate::store::Store;

/// How many items to process between progress writes.
pub(crate) const PROGRESS_BATCH: u64 = 25;

/// Everything a resumed body can need, assembled once at startup.
#[derive(Clone)]
pub struct OpsContext {
    pub store: Arc<dyn Store>,
    pub root_dir: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub backup: BackupConfig,
    pub metadata: MetadataConfig,
}

impl std::fmt::Debug for OpsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsContext")
            .field("root_dir", &self.root_dir)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

/// Rebuild the body for an interrupted operation so the queue can
/// `enqueue_resume` it. Operations whose original request context cannot be
/// reconstructed (an iTunes or dump path that was never recorded) return
/// `None` and stay interrupted.
pub fn resume_body(record: &OperationRecord, ctx: &OpsContext) -> Option<OperationFunc> {
    match record.op_type {
        OperationType::Scan => Some(scan::scan(scan::ScanArgs {
            store: ctx.store.clone(),
            root: ctx.root_dir.clone(),
            force_update: false,
        })),
        OperationType::Organize => ctx.root_dir.clone().map(|root| {
            organize::organize(organize::OrganizeArgs {
                store: ctx.store.clone(),
                root,
            })
        }),
        OperationType::MetadataFetch => Some(metadata::fetch(metadata::MetadataArgs {
            store: ctx.store.clone(),
            cfg: ctx.metadata.clone(),
        })),
        OperationType::ItunesImport | OperationType::ItunesSync => {
            record.folder.clone().map(|xml| {
                itunes::import(itunes::ItunesImportArgs {
                    store: ctx.store.clone(),
                    xml_path: PathBuf::from(xml),
                    root: ctx.root_dir.clone(),
                })
            })
        }
        OperationType::ItunesWriteback => record.folder.clone().map(|xml| {
            itunes::writeback(itunes::ItunesWritebackArgs {
                store: ctx.store.clone(),
                xml_path: PathBuf::from(xml),
                make_backup: true,
            })
        }),
        OperationType::DumpImport => record.folder.clone().map(|dump| {
            dump::import(dump::DumpImportArgs {
                store: ctx.store.clone(),
                dump_path: PathBuf::from(dump),
            })
        }),
        OperationType::Backup => Some(backup::backup(backup::BackupArgs {
            data_dir: ctx.data_dir.clone(),
            cfg: ctx.backup.clone(),
        })),
    }
}

/// Retry `f` with exponential backoff, but only for transient failures.
/// Anything else aborts immediately.
pub async fn retry_with_backoff<T, F, Fut>(max_retries: u32, base: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_retries => {
                let delay = base * 2u32.saturating_pow(attempt);
                tracing::debug!(%err, attempt, ?delay, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(5, Duration::from_millis(10), || {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            async move {
                if n < 2 {
                    Err(CoreError::Transient("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn permanent_errors_abort_immediately() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err::<(), _>(CoreError::Invalid("bad".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Invalid(_)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let err = retry_with_backoff(2, Duration::from_millis(1), || async {
            Err::<(), _>(CoreError::Transient("down".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }
}
