//! Cadenced maintenance driven by the windowed scheduler.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use talekeep_core::Result;
use talekeep_core::ops::{OpsContext, backup};
use talekeep_core::queue::OperationQueue;
use talekeep_core::scheduler::ScheduledTask;
use talekeep_model::{OperationId, OperationPriority, OperationType};

const BACKUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Enqueues a backup once a day, inside the configured window.
pub struct ScheduledBackup {
    pub queue: Arc<OperationQueue>,
    pub ops: OpsContext,
}

impl std::fmt::Debug for ScheduledBackup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledBackup").finish_non_exhaustive()
    }
}

fn newest_archive_age(dir: &Path) -> Option<Duration> {
    let newest = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with("talekeep-backup-") && n.ends_with(".tar.gz"))
                .unwrap_or(false)
        })
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()?;
    SystemTime::now().duration_since(newest).ok()
}

#[async_trait]
impl ScheduledTask for ScheduledBackup {
    async fn due(&self) -> Result<bool> {
        if self.queue.has_active(OperationType::Backup).await {
            return Ok(false);
        }
        Ok(match newest_archive_age(&self.ops.backup.directory) {
            Some(age) => age >= BACKUP_INTERVAL,
            // No archive yet; the first one is always due.
            None => true,
        })
    }

    async fn run(&self) -> Result<()> {
        let id = OperationId::new(format!("backup-{}", Utc::now().timestamp_millis()));
        self.queue
            .enqueue(
                id,
                OperationType::Backup,
                OperationPriority::Low,
                None,
                backup::backup(backup::BackupArgs {
                    data_dir: self.ops.data_dir.clone(),
                    cfg: self.ops.backup.clone(),
                }),
            )
            .await
    }
}
