//! Operation bodies driven end-to-end through the queue: scan an import
//! drop, organize it into the library layout, and ingest a dump with a
//! checkpoint.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use talekeep_config::QueueConfig;
use talekeep_core::events::EventHub;
use talekeep_core::ops::{dump, organize, scan};
use talekeep_core::queue::OperationQueue;
use talekeep_core::store::{SledStore, Store};
use talekeep_model::{BookLocation, ImportPath, OperationId, OperationPriority, OperationStatus, OperationType};

fn cfg() -> QueueConfig {
    QueueConfig {
        workers: 2,
        operation_timeout_secs: 60,
        pending_capacity: 100,
    }
}

async fn await_terminal(store: &Arc<dyn Store>, id: &OperationId) -> OperationStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(record) = store.get_operation(id).await.unwrap() {
            if record.status.is_terminal() {
                return record.status;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "operation {id} never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn write_file(dir: &Path, rel: &str, contents: &[u8]) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn scan_then_organize_moves_imports_into_the_library() {
    let store: Arc<dyn Store> = Arc::new(SledStore::open_temporary().unwrap());
    let hub = EventHub::new(100);
    let queue = OperationQueue::with_store(store.clone(), hub, &cfg());
    queue.start();

    let root = tempfile::tempdir().unwrap();
    let import = tempfile::tempdir().unwrap();
    write_file(import.path(), "Frank Herbert - Dune.mp3", b"dune-audio");
    write_file(
        root.path(),
        "Ann Leckie/Ancillary Justice.m4b",
        b"ancillary-audio",
    );

    store
        .add_import_path(&ImportPath {
            path: import.path().display().to_string(),
            enabled: true,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    // Scan picks up both files and classifies them.
    let scan_id = OperationId::from("scan-1");
    queue
        .enqueue(
            scan_id.clone(),
            OperationType::Scan,
            OperationPriority::Normal,
            None,
            scan::scan(scan::ScanArgs {
                store: store.clone(),
                root: Some(root.path().to_path_buf()),
                force_update: false,
            }),
        )
        .await
        .unwrap();
    assert_eq!(await_terminal(&store, &scan_id).await, OperationStatus::Completed);

    let books = store.list_books().await.unwrap();
    assert_eq!(books.len(), 2);
    let dune = books.iter().find(|b| b.title == "Dune").unwrap();
    assert_eq!(dune.location, BookLocation::Import);
    assert_eq!(dune.author, "Frank Herbert");

    // Organize moves the import into Author/Title under the root.
    let organize_id = OperationId::from("organize-1");
    queue
        .enqueue(
            organize_id.clone(),
            OperationType::Organize,
            OperationPriority::Normal,
            None,
            organize::organize(organize::OrganizeArgs {
                store: store.clone(),
                root: root.path().to_path_buf(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(
        await_terminal(&store, &organize_id).await,
        OperationStatus::Completed
    );

    let organized = root.path().join("Frank Herbert/Dune.mp3");
    assert_eq!(std::fs::read(&organized).unwrap(), b"dune-audio");
    assert!(!import.path().join("Frank Herbert - Dune.mp3").exists());

    let dune = store.book_by_hash(&dune.content_hash).await.unwrap().unwrap();
    assert_eq!(dune.location, BookLocation::Library);
    assert_eq!(dune.path, organized.display().to_string());

    // A rescan finds nothing new.
    let rescan_id = OperationId::from("scan-2");
    queue
        .enqueue(
            rescan_id.clone(),
            OperationType::Scan,
            OperationPriority::Normal,
            None,
            scan::scan(scan::ScanArgs {
                store: store.clone(),
                root: Some(root.path().to_path_buf()),
                force_update: false,
            }),
        )
        .await
        .unwrap();
    assert_eq!(await_terminal(&store, &rescan_id).await, OperationStatus::Completed);
    assert_eq!(store.list_books().await.unwrap().len(), 2);

    queue.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn dump_import_ingests_works_and_authors_and_clears_its_checkpoint() {
    let store: Arc<dyn Store> = Arc::new(SledStore::open_temporary().unwrap());
    let hub = EventHub::new(100);
    let queue = OperationQueue::with_store(store.clone(), hub, &cfg());
    queue.start();

    let dumps = tempfile::tempdir().unwrap();
    let dump_path = dumps.path().join("ol_dump.txt");
    let lines = [
        "/type/author\t/authors/OL26320A\t2\tts\t{\"name\":\"Ursula K. Le Guin\"}",
        "/type/work\t/works/OL45883W\t3\tts\t{\"title\":\"The Left Hand of Darkness\"}",
        "/type/edition\t/books/OL1M\t1\tts\t{\"title\":\"ignored edition\"}",
        "/type/work\t/works/OL59812W\t1\tts\t{\"title\":\"The Lathe of Heaven\",\"description\":\"Dreams rewrite reality.\"}",
    ];
    std::fs::write(&dump_path, lines.join("\n")).unwrap();

    let id = OperationId::from("dump-1");
    queue
        .enqueue(
            id.clone(),
            OperationType::DumpImport,
            OperationPriority::Low,
            Some(dump_path.display().to_string()),
            dump::import(dump::DumpImportArgs {
                store: store.clone(),
                dump_path: dump_path.clone(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(await_terminal(&store, &id).await, OperationStatus::Completed);

    assert!(
        store
            .work_by_key("/works/OL45883W")
            .await
            .unwrap()
            .is_some()
    );
    let lathe = store.work_by_key("/works/OL59812W").await.unwrap().unwrap();
    assert_eq!(lathe.description.as_deref(), Some("Dreams rewrite reality."));
    let author = store
        .author_by_name("Ursula K. Le Guin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(author.ol_key.as_deref(), Some("/authors/OL26320A"));
    // Editions are skipped.
    assert_eq!(store.library_counts().await.unwrap().works, 2);

    // A finished import leaves no checkpoint behind.
    assert!(store.get_operation_state(&id).await.unwrap().is_none());

    queue.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn dump_import_resumes_from_a_checkpoint_offset() {
    let store: Arc<dyn Store> = Arc::new(SledStore::open_temporary().unwrap());
    let hub = EventHub::new(100);
    let queue = OperationQueue::with_store(store.clone(), hub, &cfg());
    queue.start();

    let dumps = tempfile::tempdir().unwrap();
    let dump_path = dumps.path().join("ol_dump.txt");
    let lines = [
        "/type/work\t/works/OL1W\t1\tts\t{\"title\":\"Already Ingested\"}",
        "/type/work\t/works/OL2W\t1\tts\t{\"title\":\"Fresh Work\"}",
    ];
    std::fs::write(&dump_path, lines.join("\n")).unwrap();

    // A prior lifetime got through line 1 before being interrupted.
    let id = OperationId::from("dump-resume");
    let record = {
        let mut r = talekeep_model::OperationRecord::new(
            id.clone(),
            OperationType::DumpImport,
            OperationPriority::Low,
        );
        r.folder = Some(dump_path.display().to_string());
        r
    };
    store.insert_operation(&record).await.unwrap();
    store
        .update_operation_status(&id, OperationStatus::Running, 1, 0, "importing")
        .await
        .unwrap();
    store
        .update_operation_status(&id, OperationStatus::Interrupted, 1, 0, "server shutting down")
        .await
        .unwrap();
    store
        .save_operation_state(
            &id,
            &talekeep_model::OperationCheckpoint::new(serde_json::json!({
                "offset": 1,
                "record_type": "work",
                "status": "interrupted",
            })),
        )
        .await
        .unwrap();

    queue
        .enqueue_resume(
            id.clone(),
            OperationType::DumpImport,
            OperationPriority::Low,
            dump::import(dump::DumpImportArgs {
                store: store.clone(),
                dump_path: dump_path.clone(),
            }),
        )
        .await
        .unwrap();
    assert_eq!(await_terminal(&store, &id).await, OperationStatus::Completed);

    // Only the line past the checkpoint was ingested.
    assert!(store.work_by_key("/works/OL1W").await.unwrap().is_none());
    assert!(store.work_by_key("/works/OL2W").await.unwrap().is_some());

    queue.shutdown(Duration::from_secs(2)).await.unwrap();
}
