//! Storage abstraction for domain entities and operation records.
//!
//! One trait, two interchangeable backends: a relational [`sqlite`] store
//! driven by sequenced migrations, and an ordered key-value [`sled`] store
//! that encodes every logical table as a key prefix in a single keyspace.
//! Both produce identical observable results for every method; the contract
//! tests under `tests/store_contract.rs` hold them to that.

pub mod sled;
pub mod sqlite;

use async_trait::async_trait;
use talekeep_model::{
    Author, BlockedHash, Book, BookId, ImportPath, LogLevel, OperationCheckpoint, OperationId,
    OperationLogEntry, OperationRecord, OperationStatus, OperationSummary, Preference, Session,
    Setting, User, UserId, Work,
};

use crate::Result;

pub use self::sled::SledStore;
pub use self::sqlite::SqliteStore;

/// Aggregate counts served by the status endpoint.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct LibraryCounts {
    pub books: u64,
    pub authors: u64,
    pub works: u64,
}

/// Persistence contract shared by both backends.
///
/// Methods are transactional at their own granularity; callers never assume
/// multi-call atomicity. Single-row reads return `Ok(None)` for missing rows;
/// uniqueness violations surface as [`crate::CoreError::AlreadyExists`].
#[async_trait]
pub trait Store: Send + Sync {
    // --- operations ---

    /// Insert a fresh operation record. Fails with `AlreadyExists` when the
    /// id is already present.
    async fn insert_operation(&self, record: &OperationRecord) -> Result<()>;

    /// Idempotent update of the live state of an operation.
    ///
    /// Stamps `started_at` on the first transition to `Running` and
    /// `completed_at` on any terminal transition. A record already terminal
    /// is left untouched (the write is a no-op) except for the
    /// `Interrupted` → `Queued`/`Running` transition used by crash resume.
    async fn update_operation_status(
        &self,
        id: &OperationId,
        status: OperationStatus,
        current: u64,
        total: u64,
        message: &str,
    ) -> Result<()>;

    /// Mark an operation failed with an error string; stamps `completed_at`.
    async fn update_operation_error(&self, id: &OperationId, error: &str) -> Result<()>;

    async fn get_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>>;

    /// Most recent operations first, bounded by `limit`.
    async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>>;

    async fn add_operation_log(&self, entry: &OperationLogEntry) -> Result<()>;

    /// Log entries for one operation in timestamp order, bounded by `limit`.
    async fn operation_logs(&self, id: &OperationId, limit: usize)
    -> Result<Vec<OperationLogEntry>>;

    async fn save_operation_summary(&self, summary: &OperationSummary) -> Result<()>;

    async fn recent_operation_summaries(&self, limit: usize) -> Result<Vec<OperationSummary>>;

    /// Persist a checkpoint blob for a resumable operation body.
    async fn save_operation_state(
        &self,
        id: &OperationId,
        checkpoint: &OperationCheckpoint,
    ) -> Result<()>;

    async fn get_operation_state(&self, id: &OperationId) -> Result<Option<OperationCheckpoint>>;

    async fn delete_operation_state(&self, id: &OperationId) -> Result<()>;

    /// Operations left in `Interrupted` by a previous process lifetime.
    async fn list_interrupted_operations(&self) -> Result<Vec<OperationRecord>>;

    // --- books ---

    async fn upsert_book(&self, book: &Book) -> Result<()>;

    async fn book_by_hash(&self, hash: &str) -> Result<Option<Book>>;

    async fn book_by_path(&self, path: &str) -> Result<Option<Book>>;

    async fn list_books(&self) -> Result<Vec<Book>>;

    async fn delete_book(&self, id: &BookId) -> Result<()>;

    // --- authors and dump works ---

    async fn upsert_author(&self, author: &Author) -> Result<()>;

    async fn author_by_name(&self, name: &str) -> Result<Option<Author>>;

    async fn upsert_work(&self, work: &Work) -> Result<()>;

    async fn work_by_key(&self, key: &str) -> Result<Option<Work>>;

    /// Exact-title lookup into the locally ingested dump records.
    async fn work_by_title(&self, title: &str) -> Result<Option<Work>>;

    async fn library_counts(&self) -> Result<LibraryCounts>;

    // --- import paths ---

    async fn add_import_path(&self, path: &ImportPath) -> Result<()>;

    async fn list_import_paths(&self) -> Result<Vec<ImportPath>>;

    async fn remove_import_path(&self, path: &str) -> Result<()>;

    // --- settings ---

    async fn set_setting(&self, setting: &Setting) -> Result<()>;

    async fn get_setting(&self, key: &str) -> Result<Option<Setting>>;

    // --- blocked hashes ---

    async fn block_hash(&self, blocked: &BlockedHash) -> Result<()>;

    async fn is_hash_blocked(&self, hash: &str) -> Result<bool>;

    async fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>>;

    // --- users, sessions, preferences ---

    async fn create_user(&self, user: &User) -> Result<()>;

    async fn user_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn save_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, token: &str) -> Result<Option<Session>>;

    async fn delete_session(&self, token: &str) -> Result<()>;

    async fn set_preference(&self, preference: &Preference) -> Result<()>;

    async fn get_preference(&self, user_id: &UserId, key: &str) -> Result<Option<Preference>>;
}

/// Convenience for reporter log writes.
pub fn log_entry(
    id: &OperationId,
    level: LogLevel,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> OperationLogEntry {
    OperationLogEntry {
        operation_id: id.clone(),
        level,
        message: message.into(),
        details,
        timestamp: chrono::Utc::now(),
    }
}

/// Whether a stored status transition is permitted.
///
/// Terminal states are frozen, with two carve-outs: writing the identical
/// terminal state again is a harmless no-op, and `Interrupted` may flow back
/// to `Queued`/`Running` when a later process lifetime resumes the operation.
pub(crate) fn transition_allowed(old: OperationStatus, new: OperationStatus) -> bool {
    if !old.is_terminal() || old == new {
        return true;
    }
    old == OperationStatus::Interrupted
        && matches!(new, OperationStatus::Queued | OperationStatus::Running)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_frozen() {
        assert!(!transition_allowed(
            OperationStatus::Completed,
            OperationStatus::Running
        ));
        assert!(!transition_allowed(
            OperationStatus::Canceled,
            OperationStatus::Failed
        ));
        assert!(transition_allowed(
            OperationStatus::Canceled,
            OperationStatus::Canceled
        ));
    }

    #[test]
    fn interrupted_resumes() {
        assert!(transition_allowed(
            OperationStatus::Interrupted,
            OperationStatus::Queued
        ));
        assert!(transition_allowed(
            OperationStatus::Interrupted,
            OperationStatus::Running
        ));
        assert!(!transition_allowed(
            OperationStatus::Interrupted,
            OperationStatus::Completed
        ));
    }
}
