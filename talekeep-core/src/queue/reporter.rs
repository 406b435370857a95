//! Per-operation progress facade.
//!
//! The reporter is the only object an operation body may use for progress,
//! logging, checkpoints, and cancellation checks. Keeping the store write,
//! the event fan-out, and the cancellation probe behind one object keeps
//! them in lock-step: a body cannot report progress without persisting it,
//! and cannot persist it without subscribers seeing it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use talekeep_model::{LogLevel, OperationCheckpoint, OperationId, OperationStatus};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::events::EventHub;
use crate::store::{Store, log_entry};

pub struct ProgressReporter {
    id: OperationId,
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    token: CancellationToken,
    current: AtomicU64,
    total: AtomicU64,
    canceled: AtomicBool,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("id", &self.id)
            .field("current", &self.current.load(Ordering::Relaxed))
            .field("total", &self.total.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(
        id: OperationId,
        store: Arc<dyn Store>,
        hub: Arc<EventHub>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            hub,
            token,
            current: AtomicU64::new(0),
            total: AtomicU64::new(0),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    /// Last reported `(current, total)`.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.current.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// Record progress: local fields, then the store (failures propagate),
    /// then a best-effort hub event.
    pub async fn update_progress(&self, current: u64, total: u64, message: &str) -> Result<()> {
        self.current.store(current, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        self.store
            .update_operation_status(&self.id, OperationStatus::Running, current, total, message)
            .await?;
        self.hub
            .send_operation_progress(self.id.as_str(), current, total, message)
            .await;
        Ok(())
    }

    /// Persist and broadcast one structured log line.
    pub async fn log(
        &self,
        level: LogLevel,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        self.store
            .add_operation_log(&log_entry(&self.id, level, message, details.clone()))
            .await?;
        self.hub
            .send_operation_log(self.id.as_str(), level, message, details)
            .await;
        Ok(())
    }

    /// Whether cancellation has been requested for this operation.
    ///
    /// The store status is canonical (an external `Cancel` writes it before
    /// the body can observe anything); the cancellation token covers queue
    /// shutdown. A positive observation is memoized so steady-state polling
    /// stays off the database.
    pub async fn is_canceled(&self) -> bool {
        if self.canceled.load(Ordering::Relaxed) {
            return true;
        }
        if self.token.is_cancelled() {
            self.canceled.store(true, Ordering::Relaxed);
            return true;
        }
        match self.store.get_operation(&self.id).await {
            Ok(Some(record))
                if matches!(
                    record.status,
                    OperationStatus::Canceled | OperationStatus::Interrupted
                ) =>
            {
                self.canceled.store(true, Ordering::Relaxed);
                true
            }
            Ok(_) => false,
            Err(err) => {
                tracing::warn!(id = %self.id, %err, "cancellation probe failed");
                false
            }
        }
    }

    /// Persist a checkpoint blob. Failures are logged and swallowed; losing
    /// a checkpoint costs resume granularity, not correctness.
    pub async fn save_checkpoint(&self, state: serde_json::Value) {
        let checkpoint = OperationCheckpoint::new(state);
        if let Err(err) = self.store.save_operation_state(&self.id, &checkpoint).await {
            tracing::warn!(id = %self.id, %err, "failed to save operation checkpoint");
        }
    }

    /// The previously persisted checkpoint, if any.
    pub async fn checkpoint(&self) -> Option<OperationCheckpoint> {
        match self.store.get_operation_state(&self.id).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(id = %self.id, %err, "failed to load operation checkpoint");
                None
            }
        }
    }

    /// Remove the checkpoint once an operation has fully finished its
    /// resumable work.
    pub async fn clear_checkpoint(&self) {
        if let Err(err) = self.store.delete_operation_state(&self.id).await {
            tracing::warn!(id = %self.id, %err, "failed to clear operation checkpoint");
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
