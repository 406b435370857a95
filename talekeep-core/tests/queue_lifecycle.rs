//! End-to-end operation lifecycle scenarios: enqueue/progress/complete,
//! duplicate rejection, cooperative cancel, timeout, and shutdown with
//! checkpointed resume.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use talekeep_config::QueueConfig;
use talekeep_core::CoreError;
use talekeep_core::events::{Event, EventHub, EventType};
use talekeep_core::queue::{OperationFunc, OperationQueue};
use talekeep_core::store::{SledStore, Store};
use talekeep_model::{OperationId, OperationPriority, OperationStatus, OperationType};
use tokio::sync::mpsc;

fn cfg(workers: usize) -> QueueConfig {
    QueueConfig {
        workers,
        operation_timeout_secs: 60,
        pending_capacity: 100,
    }
}

fn setup(workers: usize) -> (Arc<dyn Store>, Arc<EventHub>, Arc<OperationQueue>) {
    let store: Arc<dyn Store> = Arc::new(SledStore::open_temporary().expect("sled"));
    let hub = EventHub::new(100);
    let queue = OperationQueue::with_store(store.clone(), hub.clone(), &cfg(workers));
    (store, hub, queue)
}

async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within deadline")
        .expect("channel open")
}

async fn await_status(store: &Arc<dyn Store>, id: &OperationId, status: OperationStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = store.get_operation(id).await.unwrap();
        if record.map(|r| r.status) == Some(status) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "operation {id} never reached {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn enqueue_progress_complete() {
    let (store, hub, queue) = setup(2);
    queue.start();

    let (_client, mut rx) = hub.register_client(Some("op-1".into())).await;
    let hello = next_event(&mut rx).await;
    assert_eq!(hello.event_type, EventType::ConnectionEstablished);

    let body: OperationFunc = Box::new(|_token, reporter| {
        Box::pin(async move {
            reporter.update_progress(2, 5, "processing").await?;
            Ok(())
        })
    });
    queue
        .enqueue(
            OperationId::from("op-1"),
            OperationType::Scan,
            OperationPriority::Normal,
            None,
            body,
        )
        .await
        .unwrap();

    let progress = next_event(&mut rx).await;
    assert_eq!(progress.event_type, EventType::OperationProgress);
    assert_eq!(progress.id, "op-1");
    assert_eq!(progress.data["current"], json!(2));
    assert_eq!(progress.data["total"], json!(5));
    assert_eq!(progress.data["percentage"], json!(40.0));

    let status = next_event(&mut rx).await;
    assert_eq!(status.event_type, EventType::OperationStatus);
    assert_eq!(status.data["status"], json!("completed"));

    await_status(&store, &OperationId::from("op-1"), OperationStatus::Completed).await;
    let record = store
        .get_operation(&OperationId::from("op-1"))
        .await
        .unwrap()
        .unwrap();
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());

    let summaries = store.recent_operation_summaries(10).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, OperationStatus::Completed);
}

#[tokio::test]
async fn duplicate_enqueue_returns_already_exists() {
    let (store, _hub, queue) = setup(1);
    // Workers deliberately not started: the first operation must still be
    // present when the duplicate arrives.

    let make_body = || -> OperationFunc { Box::new(|_token, _reporter| Box::pin(async { Ok(()) })) };
    queue
        .enqueue(
            OperationId::from("op-2"),
            OperationType::Scan,
            OperationPriority::Normal,
            None,
            make_body(),
        )
        .await
        .unwrap();

    let err = queue
        .enqueue(
            OperationId::from("op-2"),
            OperationType::Scan,
            OperationPriority::High,
            None,
            make_body(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyExists(_)));

    // The existing record is unperturbed: one queued write, original
    // priority.
    let record = store
        .get_operation(&OperationId::from("op-2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, OperationStatus::Queued);
    assert_eq!(record.priority, OperationPriority::Normal);
    assert_eq!(record.message, "operation queued");
}

#[tokio::test]
async fn cancel_stops_a_cooperative_body() {
    let (store, _hub, queue) = setup(1);
    queue.start();

    let body: OperationFunc = Box::new(|_token, reporter| {
        Box::pin(async move {
            loop {
                if reporter.is_canceled().await {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    });
    let id = OperationId::from("op-3");
    queue
        .enqueue(
            id.clone(),
            OperationType::DumpImport,
            OperationPriority::Normal,
            None,
            body,
        )
        .await
        .unwrap();
    await_status(&store, &id, OperationStatus::Running).await;

    let canceled_at = tokio::time::Instant::now();
    queue.cancel(&id).await.unwrap();
    await_status(&store, &id, OperationStatus::Canceled).await;
    assert!(canceled_at.elapsed() < Duration::from_secs(1));

    // The canceled op leaves a summary and disappears from the active set.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if queue.active_operations().await.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let summaries = store.recent_operation_summaries(10).await.unwrap();
    assert_eq!(summaries[0].status, OperationStatus::Canceled);
}

#[tokio::test]
async fn cancel_of_unknown_operation_is_not_found() {
    let (_store, _hub, queue) = setup(1);
    let err = queue.cancel(&OperationId::from("ghost")).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn slow_body_times_out() {
    let store: Arc<dyn Store> = Arc::new(SledStore::open_temporary().unwrap());
    let hub = EventHub::new(100);
    let queue = OperationQueue::with_timeout(hub.clone(), &cfg(1), Duration::from_millis(50));
    queue.set_store(store.clone());
    queue.start();

    let body: OperationFunc = Box::new(|_token, _reporter| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        })
    });
    let id = OperationId::from("op-4");
    queue
        .enqueue(
            id.clone(),
            OperationType::MetadataFetch,
            OperationPriority::Low,
            None,
            body,
        )
        .await
        .unwrap();

    await_status(&store, &id, OperationStatus::Failed).await;
    let record = store.get_operation(&id).await.unwrap().unwrap();
    assert_eq!(record.error.as_deref(), Some("operation timed out"));
}

#[tokio::test]
async fn panicking_body_is_recovered_as_failure() {
    let (store, _hub, queue) = setup(1);
    queue.start();

    let body: OperationFunc =
        Box::new(|_token, _reporter| Box::pin(async { panic!("sabotaged fixture") }));
    let id = OperationId::from("op-panic");
    queue
        .enqueue(
            id.clone(),
            OperationType::Scan,
            OperationPriority::Normal,
            None,
            body,
        )
        .await
        .unwrap();

    await_status(&store, &id, OperationStatus::Failed).await;
    let record = store.get_operation(&id).await.unwrap().unwrap();
    let error = record.error.unwrap();
    assert!(
        error.starts_with("operation panicked: "),
        "unexpected error {error}"
    );
    assert!(error.contains("sabotaged fixture"));
}

#[tokio::test]
async fn shutdown_interrupts_and_resume_restarts_without_duplicates() {
    let (store, hub, queue) = setup(2);
    queue.start();

    let id = OperationId::from("op-5");
    let body: OperationFunc = Box::new(|_token, reporter| {
        Box::pin(async move {
            reporter.save_checkpoint(json!({ "offset": 42 })).await;
            loop {
                if reporter.is_canceled().await {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    });
    queue
        .enqueue(
            id.clone(),
            OperationType::DumpImport,
            OperationPriority::Normal,
            Some("/dumps/ol_dump.txt".into()),
            body,
        )
        .await
        .unwrap();
    await_status(&store, &id, OperationStatus::Running).await;

    // Wait for the checkpoint before pulling the plug.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.get_operation_state(&id).await.unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    queue.shutdown(Duration::from_secs(2)).await.unwrap();

    let record = store.get_operation(&id).await.unwrap().unwrap();
    assert_eq!(record.status, OperationStatus::Interrupted);
    assert_eq!(record.message, "server shutting down");

    let checkpoint = store.get_operation_state(&id).await.unwrap().unwrap();
    assert_eq!(checkpoint.0["offset"], json!(42));
    assert_eq!(checkpoint.status(), Some("interrupted"));

    // A later lifetime resumes it: same record, no duplicate row.
    let interrupted = store.list_interrupted_operations().await.unwrap();
    assert_eq!(interrupted.len(), 1);

    let queue2 = OperationQueue::with_store(store.clone(), hub, &cfg(2));
    queue2.start();
    let resume_body: OperationFunc = Box::new(|_token, reporter| {
        Box::pin(async move {
            let checkpoint = reporter.checkpoint().await.expect("checkpoint survives");
            assert_eq!(checkpoint.0["offset"], json!(42));
            reporter.update_progress(42, 42, "resumed to completion").await?;
            reporter.clear_checkpoint().await;
            Ok(())
        })
    });
    queue2
        .enqueue_resume(
            id.clone(),
            OperationType::DumpImport,
            OperationPriority::Normal,
            resume_body,
        )
        .await
        .unwrap();

    await_status(&store, &id, OperationStatus::Completed).await;
    assert_eq!(store.recent_operations(10).await.unwrap().len(), 1);
    queue2.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn full_pending_channel_still_runs_everything() {
    let store: Arc<dyn Store> = Arc::new(SledStore::open_temporary().unwrap());
    let hub = EventHub::new(100);
    let queue = OperationQueue::with_store(
        store.clone(),
        hub,
        &QueueConfig {
            workers: 2,
            operation_timeout_secs: 60,
            pending_capacity: 1,
        },
    );

    // Fill the map and the one-slot channel before any worker exists.
    for i in 0..8 {
        let body: OperationFunc = Box::new(|_token, reporter| {
            Box::pin(async move {
                reporter.update_progress(1, 1, "done").await?;
                Ok(())
            })
        });
        queue
            .enqueue(
                OperationId::from(format!("op-flood-{i}").as_str()),
                OperationType::Scan,
                OperationPriority::Normal,
                None,
                body,
            )
            .await
            .expect("enqueue past a full channel still acks");
    }

    queue.start();
    for i in 0..8 {
        await_status(
            &store,
            &OperationId::from(format!("op-flood-{i}").as_str()),
            OperationStatus::Completed,
        )
        .await;
    }
}

#[tokio::test]
async fn terminal_status_event_is_last_for_the_operation() {
    let (_store, hub, queue) = setup(1);
    queue.start();

    let (_client, mut rx) = hub.register_client(Some("op-last".into())).await;
    next_event(&mut rx).await; // hello

    let body: OperationFunc = Box::new(|_token, reporter| {
        Box::pin(async move {
            for step in 1..=3u64 {
                reporter.update_progress(step, 3, "step").await?;
            }
            Ok(())
        })
    });
    queue
        .enqueue(
            OperationId::from("op-last"),
            OperationType::Organize,
            OperationPriority::High,
            None,
            body,
        )
        .await
        .unwrap();

    let mut seen_terminal = false;
    for _ in 0..4 {
        let event = next_event(&mut rx).await;
        assert!(
            !seen_terminal,
            "no events may follow the terminal status event"
        );
        if event.event_type == EventType::OperationStatus {
            assert_eq!(event.data["status"], json!("completed"));
            seen_terminal = true;
        }
    }
    assert!(seen_terminal);
}
