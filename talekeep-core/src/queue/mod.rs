//! Operation queue and worker pool.
//!
//! Operations are enqueued with a caller-chosen natural-key id, executed by
//! a fixed pool of worker tasks, and persisted through the [`Store`] at
//! every lifecycle transition. Cancellation is cooperative: an external
//! cancel fires the operation's token and writes the terminal status; the
//! body observes both through its [`ProgressReporter`].
//!
//! Priority is advisory. The pending channel is FIFO; the priority tag is
//! persisted and reported but does not reorder dequeues.

pub mod reporter;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::json;
use talekeep_config::QueueConfig;
use talekeep_model::{
    OperationId, OperationPriority, OperationRecord, OperationStatus, OperationSummary,
    OperationType, calculate_percentage,
};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::EventHub;
use crate::store::Store;
use crate::{CoreError, Result};

pub use reporter::ProgressReporter;

/// The future an operation body resolves to.
pub type OperationFuture = BoxFuture<'static, Result<()>>;

/// An operation body: a single continuation-free entry invoked once by a
/// worker. Long bodies split their work into chunks and poll the reporter
/// for cancellation between them.
pub type OperationFunc =
    Box<dyn FnOnce(CancellationToken, Arc<ProgressReporter>) -> OperationFuture + Send + Sync>;

struct QueueEntry {
    op_type: OperationType,
    priority: OperationPriority,
    body: Option<OperationFunc>,
    token: CancellationToken,
}

/// Atomic observability counters for the worker pool.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    busy_millis: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub busy_millis: u64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            busy_millis: self.busy_millis.load(Ordering::Relaxed),
        }
    }
}

/// Priority-tagged queue with a bounded worker pool, per-operation timeout,
/// panic recovery, and crash-resume support.
pub struct OperationQueue {
    ops: RwLock<HashMap<OperationId, QueueEntry>>,
    tx: mpsc::Sender<OperationId>,
    rx: Mutex<Option<mpsc::Receiver<OperationId>>>,
    store: std::sync::RwLock<Option<Arc<dyn Store>>>,
    hub: Arc<EventHub>,
    token: CancellationToken,
    timeout: Duration,
    workers: usize,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    metrics: QueueMetrics,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("workers", &self.workers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Build a queue without a store; [`set_store`](Self::set_store) binds
    /// one before any enqueue. Workers start with
    /// [`start`](Self::start).
    pub fn new(hub: Arc<EventHub>, cfg: &QueueConfig) -> Arc<Self> {
        Self::with_timeout(hub, cfg, Duration::from_secs(cfg.operation_timeout_secs))
    }

    pub fn with_store(store: Arc<dyn Store>, hub: Arc<EventHub>, cfg: &QueueConfig) -> Arc<Self> {
        let queue = Self::new(hub, cfg);
        queue.set_store(store);
        queue
    }

    /// As [`new`](Self::new), with a per-operation deadline finer than the
    /// whole seconds the config file can express.
    pub fn with_timeout(hub: Arc<EventHub>, cfg: &QueueConfig, timeout: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(cfg.pending_capacity.max(1));
        Arc::new(Self {
            ops: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            store: std::sync::RwLock::new(None),
            hub,
            token: CancellationToken::new(),
            timeout,
            workers: cfg.workers.max(1),
            handles: std::sync::Mutex::new(Vec::new()),
            metrics: QueueMetrics::default(),
        })
    }

    /// Late-bind the store. A store that is already set is never
    /// overwritten.
    pub fn set_store(&self, store: Arc<dyn Store>) {
        let mut guard = self.store.write().expect("store lock poisoned");
        if guard.is_none() {
            *guard = Some(store);
        } else {
            tracing::warn!("queue store already configured, ignoring replacement");
        }
    }

    fn store(&self) -> Result<Arc<dyn Store>> {
        self.store
            .read()
            .expect("store lock poisoned")
            .clone()
            .ok_or_else(|| CoreError::Internal("operation queue has no store".into()))
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Spawn the worker pool. Idempotent-ish: the second call finds no
    /// receiver and does nothing.
    pub fn start(self: &Arc<Self>) {
        let Some(rx) = self.rx.try_lock().ok().and_then(|mut guard| guard.take()) else {
            tracing::warn!("queue workers already started");
            return;
        };
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = self.handles.lock().expect("handles lock poisoned");
        for worker_id in 0..self.workers {
            let queue = Arc::clone(self);
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                queue.worker_loop(worker_id, rx).await;
            }));
        }
        tracing::info!(workers = self.workers, "operation queue started");
    }

    /// Enqueue a new operation. The store record is created first; the
    /// pending-channel send is non-blocking, and a full channel leaves the
    /// operation in the map to be handed to a worker once capacity frees.
    /// The caller still gets an acknowledgment.
    pub async fn enqueue(
        &self,
        id: OperationId,
        op_type: OperationType,
        priority: OperationPriority,
        folder: Option<String>,
        body: OperationFunc,
    ) -> Result<()> {
        let store = self.store()?;
        let token = self.token.child_token();
        {
            let mut ops = self.ops.write().await;
            if ops.contains_key(&id) {
                return Err(CoreError::already_exists(format!("operation {id}")));
            }
            ops.insert(
                id.clone(),
                QueueEntry {
                    op_type,
                    priority,
                    body: Some(body),
                    token,
                },
            );
        }

        let mut record = OperationRecord::new(id.clone(), op_type, priority);
        record.message = "operation queued".into();
        record.folder = folder;
        if let Err(err) = store.insert_operation(&record).await {
            self.ops.write().await.remove(&id);
            return Err(err);
        }

        self.dispatch(id);
        Ok(())
    }

    /// Re-enqueue an operation from a previous process lifetime. The
    /// existing record is updated in place; no new row is created.
    pub async fn enqueue_resume(
        &self,
        id: OperationId,
        op_type: OperationType,
        priority: OperationPriority,
        body: OperationFunc,
    ) -> Result<()> {
        let store = self.store()?;
        let token = self.token.child_token();
        {
            let mut ops = self.ops.write().await;
            if ops.contains_key(&id) {
                return Err(CoreError::already_exists(format!("operation {id}")));
            }
            ops.insert(
                id.clone(),
                QueueEntry {
                    op_type,
                    priority,
                    body: Some(body),
                    token,
                },
            );
        }

        if let Err(err) = store
            .update_operation_status(
                &id,
                OperationStatus::Queued,
                0,
                0,
                "operation resumed after restart",
            )
            .await
        {
            self.ops.write().await.remove(&id);
            return Err(err);
        }

        self.dispatch(id);
        Ok(())
    }

    fn dispatch(&self, id: OperationId) {
        match self.tx.try_send(id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(id)) => {
                // Finish the handoff off-path; the map entry already exists
                // and the caller treats non-ack as queued.
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = tx.send(id).await {
                        tracing::warn!(%err, "pending channel closed before dispatch");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(id)) => {
                tracing::warn!(%id, "pending channel closed, operation will not run");
            }
        }
    }

    /// Cancel an operation by id. The body observes the fired token or the
    /// stored status on its next poll.
    pub async fn cancel(&self, id: &OperationId) -> Result<()> {
        let token = {
            let ops = self.ops.read().await;
            let entry = ops
                .get(id)
                .ok_or_else(|| CoreError::not_found(format!("operation {id}")))?;
            entry.token.clone()
        };
        token.cancel();
        self.store()?
            .update_operation_status(
                id,
                OperationStatus::Canceled,
                0,
                0,
                "operation canceled by user",
            )
            .await?;
        tracing::info!(%id, "operation canceled");
        Ok(())
    }

    /// `(id, type)` pairs for every operation currently queued or running.
    pub async fn active_operations(&self) -> Vec<(OperationId, OperationType)> {
        self.ops
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.op_type))
            .collect()
    }

    /// Whether any active operation has the given type. Callers use this to
    /// reject duplicate work before minting a new id.
    pub async fn has_active(&self, op_type: OperationType) -> bool {
        self.ops
            .read()
            .await
            .values()
            .any(|entry| entry.op_type == op_type)
    }

    /// Graceful shutdown: mark every in-flight operation interrupted (and
    /// rewrite its checkpoint status so a later lifetime can resume it),
    /// cancel all workers, and wait for them bounded by `grace`.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        let ids: Vec<OperationId> = self.ops.read().await.keys().cloned().collect();
        if let Ok(store) = self.store() {
            for id in &ids {
                if let Err(err) = store
                    .update_operation_status(
                        id,
                        OperationStatus::Interrupted,
                        0,
                        0,
                        "server shutting down",
                    )
                    .await
                {
                    tracing::warn!(%id, %err, "failed to mark operation interrupted");
                }
                match store.get_operation_state(id).await {
                    Ok(Some(mut checkpoint)) => {
                        checkpoint.set_status("interrupted");
                        if let Err(err) = store.save_operation_state(id, &checkpoint).await {
                            tracing::warn!(%id, %err, "failed to persist interrupted checkpoint");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!(%id, %err, "failed to load checkpoint at shutdown"),
                }
            }
        }

        self.token.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("handles lock poisoned");
            guard.drain(..).collect()
        };
        if handles.is_empty() {
            return Ok(());
        }
        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(_) => {
                tracing::info!(interrupted = ids.len(), "operation queue drained");
                Ok(())
            }
            Err(_) => Err(CoreError::Timeout),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<OperationId>>>) {
        loop {
            let id = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(id) => id,
                        None => break,
                    },
                }
            };
            tracing::debug!(worker_id, %id, "worker picked up operation");
            self.run_operation(id).await;
        }
        tracing::debug!(worker_id, "worker exiting");
    }

    async fn run_operation(self: &Arc<Self>, id: OperationId) {
        let (op_type, body, token) = {
            let mut ops = self.ops.write().await;
            let Some(entry) = ops.get_mut(&id) else {
                return;
            };
            let Some(body) = entry.body.take() else {
                return;
            };
            (entry.op_type, body, entry.token.clone())
        };
        let store = match self.store() {
            Ok(store) => store,
            Err(err) => {
                tracing::error!(%id, %err, "cannot run operation without a store");
                return;
            }
        };

        let started = Instant::now();
        self.metrics.started.fetch_add(1, Ordering::Relaxed);
        let reporter = Arc::new(ProgressReporter::new(
            id.clone(),
            store.clone(),
            Arc::clone(&self.hub),
            token.clone(),
        ));

        let outcome = if token.is_cancelled() {
            // Canceled while still pending; never start the body.
            Ok(())
        } else {
            if let Err(err) = store
                .update_operation_status(&id, OperationStatus::Running, 0, 0, "operation started")
                .await
            {
                tracing::warn!(%id, %err, "failed to mark operation running");
            }
            self.execute_body(body, &token, &reporter).await
        };

        self.resolve(&store, &id, op_type, &reporter, &token, outcome)
            .await;

        self.metrics
            .busy_millis
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        self.ops.write().await.remove(&id);
    }

    /// Run the body under a panic-recovery boundary and the configured
    /// deadline. A panic becomes a `Panicked` error; an elapsed deadline
    /// cancels the body's token and becomes `Timeout`.
    async fn execute_body(
        &self,
        body: OperationFunc,
        token: &CancellationToken,
        reporter: &Arc<ProgressReporter>,
    ) -> Result<()> {
        let fut = body(token.clone(), Arc::clone(reporter));
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        if self.timeout > Duration::ZERO {
            match tokio::time::timeout(self.timeout, guarded).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(CoreError::Panicked(panic_message(panic))),
                Err(_) => {
                    token.cancel();
                    Err(CoreError::Timeout)
                }
            }
        } else {
            match guarded.await {
                Ok(result) => result,
                Err(panic) => Err(CoreError::Panicked(panic_message(panic))),
            }
        }
    }

    async fn resolve(
        &self,
        store: &Arc<dyn Store>,
        id: &OperationId,
        op_type: OperationType,
        reporter: &Arc<ProgressReporter>,
        token: &CancellationToken,
        outcome: Result<()>,
    ) {
        match outcome {
            Err(err) => {
                let message = err.to_string();
                if let Err(store_err) = store.update_operation_error(id, &message).await {
                    // Never mask the original failure with a bookkeeping one.
                    tracing::error!(%id, %store_err, "failed to persist operation error");
                }
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                let mut details = serde_json::Map::new();
                details.insert("error".into(), json!(message));
                self.hub
                    .send_operation_status(id.as_str(), OperationStatus::Failed, Some(details))
                    .await;
                self.write_summary(store, id, op_type, OperationStatus::Failed, reporter, Some(message))
                    .await;
            }
            Ok(()) => {
                let canceled = token.is_cancelled() || reporter.is_canceled().await;
                if canceled {
                    // Shutdown interrupt and user cancel both land here;
                    // the stored status tells them apart.
                    let stored = store
                        .get_operation(id)
                        .await
                        .ok()
                        .flatten()
                        .map(|record| record.status)
                        .filter(|status| status.is_terminal())
                        .unwrap_or(OperationStatus::Canceled);
                    if stored == OperationStatus::Interrupted {
                        self.hub
                            .send_operation_status(id.as_str(), OperationStatus::Interrupted, None)
                            .await;
                    } else {
                        self.metrics.canceled.fetch_add(1, Ordering::Relaxed);
                        self.hub
                            .send_operation_status(id.as_str(), OperationStatus::Canceled, None)
                            .await;
                        self.write_summary(
                            store,
                            id,
                            op_type,
                            OperationStatus::Canceled,
                            reporter,
                            None,
                        )
                        .await;
                    }
                } else {
                    let (current, total) = reporter.progress();
                    if let Err(err) = store
                        .update_operation_status(
                            id,
                            OperationStatus::Completed,
                            current,
                            total,
                            "operation completed",
                        )
                        .await
                    {
                        tracing::error!(%id, %err, "failed to persist operation completion");
                    }
                    self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                    self.hub
                        .send_operation_status(id.as_str(), OperationStatus::Completed, None)
                        .await;
                    self.write_summary(store, id, op_type, OperationStatus::Completed, reporter, None)
                        .await;
                }
            }
        }
    }

    async fn write_summary(
        &self,
        store: &Arc<dyn Store>,
        id: &OperationId,
        op_type: OperationType,
        status: OperationStatus,
        reporter: &Arc<ProgressReporter>,
        error: Option<String>,
    ) {
        let record = store.get_operation(id).await.ok().flatten();
        let (current, total) = reporter.progress();
        let percentage = if status == OperationStatus::Completed && total == 0 {
            100.0
        } else {
            calculate_percentage(current, total)
        };
        let summary = OperationSummary {
            operation_id: id.clone(),
            op_type,
            status,
            started_at: record.as_ref().and_then(|r| r.started_at),
            completed_at: record
                .as_ref()
                .and_then(|r| r.completed_at)
                .unwrap_or_else(chrono::Utc::now),
            percentage,
            error,
        };
        if let Err(err) = store.save_operation_summary(&summary).await {
            tracing::warn!(%id, %err, "failed to persist operation summary");
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
