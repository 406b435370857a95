//! Relational store backend on embedded SQLite.
//!
//! Schema is managed by sequenced migrations, each idempotent and guarded by
//! the `schema_migrations` table, so re-running a deployed binary against an
//! existing database is always safe.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Acquire, Row, sqlite::SqliteRow};
use talekeep_model::{
    Author, AuthorId, BlockedHash, Book, BookId, BookLocation, ImportPath, LogLevel,
    OperationCheckpoint, OperationId, OperationLogEntry, OperationPriority, OperationRecord,
    OperationStatus, OperationSummary, OperationType, Preference, Session, Setting, User, UserId,
    Work,
};
use uuid::Uuid;

use super::{LibraryCounts, Store, transition_allowed};
use crate::{CoreError, Result};

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_operations",
        r#"
        CREATE TABLE IF NOT EXISTS operations (
            id TEXT PRIMARY KEY,
            op_type TEXT NOT NULL,
            status TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT 'normal',
            current INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            folder TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);
        CREATE INDEX IF NOT EXISTS idx_operations_created ON operations(created_at DESC);

        CREATE TABLE IF NOT EXISTS operation_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            details TEXT,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_operation_logs_op
            ON operation_logs(operation_id, timestamp);

        CREATE TABLE IF NOT EXISTS operation_summary_logs (
            operation_id TEXT PRIMARY KEY,
            op_type TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT NOT NULL,
            percentage REAL NOT NULL,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS operation_state (
            operation_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    ),
    (
        "0002_library",
        r#"
        CREATE TABLE IF NOT EXISTS books (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            series TEXT,
            series_index REAL,
            path TEXT NOT NULL UNIQUE,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT NOT NULL UNIQUE,
            location TEXT NOT NULL DEFAULT 'library',
            work_key TEXT,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_books_hash ON books(content_hash);
        CREATE INDEX IF NOT EXISTS idx_books_author ON books(author);

        CREATE TABLE IF NOT EXISTS authors (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            ol_key TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS works (
            key TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author_names TEXT NOT NULL DEFAULT '[]',
            description TEXT,
            ingested_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_works_title ON works(title);

        CREATE TABLE IF NOT EXISTS import_paths (
            path TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        "#,
    ),
    (
        "0003_settings_and_hashes",
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            is_secret INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blocked_hashes (
            hash TEXT PRIMARY KEY,
            reason TEXT,
            blocked_at TEXT NOT NULL
        );
        "#,
    ),
    (
        "0004_users",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_admin INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            token TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS preferences (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        );
        "#,
    ),
];

/// SQLite-backed [`Store`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file and apply migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps every caller
    /// on the same memory instance.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CoreError::Store(e.to_string()))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let mut conn = self.pool.acquire().await?;
        for (version, sql) in MIGRATIONS {
            let applied: Option<SqliteRow> =
                sqlx::query("SELECT version FROM schema_migrations WHERE version = ?1")
                    .bind(version)
                    .fetch_optional(&mut *conn)
                    .await?;
            if applied.is_some() {
                continue;
            }

            let mut tx = conn.begin().await?;
            sqlx::raw_sql(sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)")
                .bind(version)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!(version, "applied migration");
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn map_operation(row: &SqliteRow) -> Result<OperationRecord> {
    Ok(OperationRecord {
        id: OperationId::new(row.try_get::<String, _>("id").map_err(CoreError::from)?),
        op_type: OperationType::parse(&row.try_get::<String, _>("op_type")?)?,
        status: OperationStatus::parse(&row.try_get::<String, _>("status")?)?,
        priority: OperationPriority::parse(&row.try_get::<String, _>("priority")?),
        current: row.try_get::<i64, _>("current")? as u64,
        total: row.try_get::<i64, _>("total")? as u64,
        message: row.try_get("message")?,
        folder: row.try_get("folder")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

fn map_book(row: &SqliteRow) -> Result<Book> {
    let id: String = row.try_get("id")?;
    let location: String = row.try_get("location")?;
    Ok(Book {
        id: BookId(parse_uuid(&id)?),
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        series: row.try_get("series")?,
        series_index: row.try_get("series_index")?,
        path: row.try_get("path")?,
        size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
        content_hash: row.try_get("content_hash")?,
        location: BookLocation::parse(&location),
        work_key: row.try_get("work_key")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| CoreError::Store(format!("malformed uuid {s}: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_operation(&self, record: &OperationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO operations
                (id, op_type, status, priority, current, total, message, folder,
                 created_at, started_at, completed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(record.id.as_str())
        .bind(record.op_type.as_str())
        .bind(record.status.as_str())
        .bind(record.priority.as_str())
        .bind(record.current as i64)
        .bind(record.total as i64)
        .bind(&record.message)
        .bind(&record.folder)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_operation_status(
        &self,
        id: &OperationId,
        status: OperationStatus,
        current: u64,
        total: u64,
        message: &str,
    ) -> Result<()> {
        let row = sqlx::query("SELECT status FROM operations WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(CoreError::not_found(format!("operation {id}")));
        };
        let old = OperationStatus::parse(&row.try_get::<String, _>("status")?)?;
        if !transition_allowed(old, status) {
            tracing::debug!(%id, from = %old, to = %status, "ignoring status write to terminal operation");
            return Ok(());
        }

        let now = Utc::now();
        let started_at = if status == OperationStatus::Running {
            Some(now)
        } else {
            None
        };
        let completed_at = if status.is_terminal() { Some(now) } else { None };

        sqlx::query(
            "UPDATE operations SET
                status = ?2,
                current = ?3,
                total = ?4,
                message = ?5,
                started_at = COALESCE(started_at, ?6),
                completed_at = COALESCE(completed_at, ?7)
             WHERE id = ?1",
        )
        .bind(id.as_str())
        .bind(status.as_str())
        .bind(current as i64)
        .bind(total as i64)
        .bind(message)
        .bind(started_at)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_operation_error(&self, id: &OperationId, error: &str) -> Result<()> {
        let row = sqlx::query("SELECT status FROM operations WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(CoreError::not_found(format!("operation {id}")));
        };
        let old = OperationStatus::parse(&row.try_get::<String, _>("status")?)?;
        if !transition_allowed(old, OperationStatus::Failed) {
            tracing::debug!(%id, from = %old, "ignoring error write to terminal operation");
            return Ok(());
        }

        sqlx::query(
            "UPDATE operations SET
                status = 'failed',
                error = ?2,
                completed_at = COALESCE(completed_at, ?3)
             WHERE id = ?1",
        )
        .bind(id.as_str())
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        let row = sqlx::query("SELECT * FROM operations WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_operation).transpose()
    }

    async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        let rows = sqlx::query("SELECT * FROM operations ORDER BY created_at DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_operation).collect()
    }

    async fn add_operation_log(&self, entry: &OperationLogEntry) -> Result<()> {
        let details = entry
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO operation_logs (operation_id, level, message, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(entry.operation_id.as_str())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(details)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn operation_logs(
        &self,
        id: &OperationId,
        limit: usize,
    ) -> Result<Vec<OperationLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM operation_logs WHERE operation_id = ?1
             ORDER BY timestamp ASC, id ASC LIMIT ?2",
        )
        .bind(id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let details: Option<String> = row.try_get("details")?;
                Ok(OperationLogEntry {
                    operation_id: OperationId::new(row.try_get::<String, _>("operation_id")?),
                    level: LogLevel::parse(&row.try_get::<String, _>("level")?)?,
                    message: row.try_get("message")?,
                    details: details.map(|d| serde_json::from_str(&d)).transpose()?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn save_operation_summary(&self, summary: &OperationSummary) -> Result<()> {
        sqlx::query(
            "INSERT INTO operation_summary_logs
                (operation_id, op_type, status, started_at, completed_at, percentage, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(operation_id) DO UPDATE SET
                status = excluded.status,
                completed_at = excluded.completed_at,
                percentage = excluded.percentage,
                error = excluded.error",
        )
        .bind(summary.operation_id.as_str())
        .bind(summary.op_type.as_str())
        .bind(summary.status.as_str())
        .bind(summary.started_at)
        .bind(summary.completed_at)
        .bind(summary.percentage)
        .bind(&summary.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_operation_summaries(&self, limit: usize) -> Result<Vec<OperationSummary>> {
        let rows = sqlx::query(
            "SELECT * FROM operation_summary_logs ORDER BY completed_at DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(OperationSummary {
                    operation_id: OperationId::new(row.try_get::<String, _>("operation_id")?),
                    op_type: OperationType::parse(&row.try_get::<String, _>("op_type")?)?,
                    status: OperationStatus::parse(&row.try_get::<String, _>("status")?)?,
                    started_at: row.try_get("started_at")?,
                    completed_at: row.try_get("completed_at")?,
                    percentage: row.try_get("percentage")?,
                    error: row.try_get("error")?,
                })
            })
            .collect()
    }

    async fn save_operation_state(
        &self,
        id: &OperationId,
        checkpoint: &OperationCheckpoint,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO operation_state (operation_id, state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(operation_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at",
        )
        .bind(id.as_str())
        .bind(serde_json::to_string(&checkpoint.0)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_operation_state(&self, id: &OperationId) -> Result<Option<OperationCheckpoint>> {
        let row = sqlx::query("SELECT state FROM operation_state WHERE operation_id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let state: String = r.try_get("state")?;
            Ok(OperationCheckpoint::new(serde_json::from_str(&state)?))
        })
        .transpose()
    }

    async fn delete_operation_state(&self, id: &OperationId) -> Result<()> {
        sqlx::query("DELETE FROM operation_state WHERE operation_id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_interrupted_operations(&self) -> Result<Vec<OperationRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM operations WHERE status = 'interrupted' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_operation).collect()
    }

    async fn upsert_book(&self, book: &Book) -> Result<()> {
        sqlx::query(
            "INSERT INTO books
                (id, title, author, series, series_index, path, size_bytes, content_hash,
                 location, work_key, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(content_hash) DO UPDATE SET
                title = excluded.title,
                author = excluded.author,
                series = excluded.series,
                series_index = excluded.series_index,
                path = excluded.path,
                size_bytes = excluded.size_bytes,
                location = excluded.location,
                work_key = excluded.work_key,
                description = excluded.description,
                updated_at = excluded.updated_at",
        )
        .bind(book.id.to_string())
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.series)
        .bind(book.series_index)
        .bind(&book.path)
        .bind(book.size_bytes as i64)
        .bind(&book.content_hash)
        .bind(book.location.as_str())
        .bind(&book.work_key)
        .bind(&book.description)
        .bind(book.created_at)
        .bind(book.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn book_by_hash(&self, hash: &str) -> Result<Option<Book>> {
        let row = sqlx::query("SELECT * FROM books WHERE content_hash = ?1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_book).transpose()
    }

    async fn book_by_path(&self, path: &str) -> Result<Option<Book>> {
        let row = sqlx::query("SELECT * FROM books WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_book).transpose()
    }

    async fn list_books(&self) -> Result<Vec<Book>> {
        let rows = sqlx::query("SELECT * FROM books ORDER BY author, series, series_index, title")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_book).collect()
    }

    async fn delete_book(&self, id: &BookId) -> Result<()> {
        sqlx::query("DELETE FROM books WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_author(&self, author: &Author) -> Result<()> {
        sqlx::query(
            "INSERT INTO authors (id, name, ol_key, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                ol_key = COALESCE(excluded.ol_key, authors.ol_key)",
        )
        .bind(author.id.to_string())
        .bind(&author.name)
        .bind(&author.ol_key)
        .bind(author.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn author_by_name(&self, name: &str) -> Result<Option<Author>> {
        let row = sqlx::query("SELECT * FROM authors WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let id: String = r.try_get("id")?;
            Ok(Author {
                id: AuthorId(parse_uuid(&id)?),
                name: r.try_get("name")?,
                ol_key: r.try_get("ol_key")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_work(&self, work: &Work) -> Result<()> {
        sqlx::query(
            "INSERT INTO works (key, title, author_names, description, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                title = excluded.title,
                author_names = excluded.author_names,
                description = excluded.description,
                ingested_at = excluded.ingested_at",
        )
        .bind(&work.key)
        .bind(&work.title)
        .bind(serde_json::to_string(&work.author_names)?)
        .bind(&work.description)
        .bind(work.ingested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn work_by_key(&self, key: &str) -> Result<Option<Work>> {
        let row = sqlx::query("SELECT * FROM works WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_work).transpose()
    }

    async fn work_by_title(&self, title: &str) -> Result<Option<Work>> {
        let row = sqlx::query("SELECT * FROM works WHERE title = ?1 COLLATE NOCASE LIMIT 1")
            .bind(title)
            .fetch_optional(&self.pool)
            .await?;
        row.map(map_work).transpose()
    }

    async fn library_counts(&self) -> Result<LibraryCounts> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM books) AS books,
                (SELECT COUNT(*) FROM authors) AS authors,
                (SELECT COUNT(*) FROM works) AS works",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(LibraryCounts {
            books: row.try_get::<i64, _>("books")? as u64,
            authors: row.try_get::<i64, _>("authors")? as u64,
            works: row.try_get::<i64, _>("works")? as u64,
        })
    }

    async fn add_import_path(&self, path: &ImportPath) -> Result<()> {
        sqlx::query(
            "INSERT INTO import_paths (path, enabled, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET enabled = excluded.enabled",
        )
        .bind(&path.path)
        .bind(path.enabled)
        .bind(path.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_import_paths(&self) -> Result<Vec<ImportPath>> {
        let rows = sqlx::query("SELECT * FROM import_paths ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ImportPath {
                    path: row.try_get("path")?,
                    enabled: row.try_get("enabled")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn remove_import_path(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM import_paths WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_setting(&self, setting: &Setting) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, is_secret, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                is_secret = excluded.is_secret,
                updated_at = excluded.updated_at",
        )
        .bind(&setting.key)
        .bind(&setting.value)
        .bind(setting.is_secret)
        .bind(setting.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        let row = sqlx::query("SELECT * FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(Setting {
                key: r.try_get("key")?,
                value: r.try_get("value")?,
                is_secret: r.try_get("is_secret")?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn block_hash(&self, blocked: &BlockedHash) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocked_hashes (hash, reason, blocked_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(hash) DO NOTHING",
        )
        .bind(&blocked.hash)
        .bind(&blocked.reason)
        .bind(blocked.blocked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM blocked_hashes WHERE hash = ?1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>> {
        let rows = sqlx::query("SELECT * FROM blocked_hashes ORDER BY blocked_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(BlockedHash {
                    hash: row.try_get("hash")?,
                    reason: row.try_get("reason")?,
                    blocked_at: row.try_get("blocked_at")?,
                })
            })
            .collect()
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, is_admin, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.is_admin)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let id: String = r.try_get("id")?;
            Ok(User {
                id: UserId(parse_uuid(&id)?),
                username: r.try_get("username")?,
                password_hash: r.try_get("password_hash")?,
                is_admin: r.try_get("is_admin")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (token, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(token) DO UPDATE SET expires_at = excluded.expires_at",
        )
        .bind(&session.token)
        .bind(session.user_id.to_string())
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let user_id: String = r.try_get("user_id")?;
            Ok(Session {
                token: r.try_get("token")?,
                user_id: UserId(parse_uuid(&user_id)?),
                created_at: r.try_get("created_at")?,
                expires_at: r.try_get("expires_at")?,
            })
        })
        .transpose()
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = ?1")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_preference(&self, preference: &Preference) -> Result<()> {
        sqlx::query(
            "INSERT INTO preferences (user_id, key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(preference.user_id.to_string())
        .bind(&preference.key)
        .bind(serde_json::to_string(&preference.value)?)
        .bind(preference.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_preference(&self, user_id: &UserId, key: &str) -> Result<Option<Preference>> {
        let row = sqlx::query("SELECT * FROM preferences WHERE user_id = ?1 AND key = ?2")
            .bind(user_id.to_string())
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let user_id: String = r.try_get("user_id")?;
            let value: String = r.try_get("value")?;
            Ok(Preference {
                user_id: UserId(parse_uuid(&user_id)?),
                key: r.try_get("key")?,
                value: serde_json::from_str(&value)?,
                updated_at: r.try_get("updated_at")?,
            })
        })
        .transpose()
    }
}

fn map_work(row: SqliteRow) -> Result<Work> {
    let author_names: String = row.try_get("author_names")?;
    Ok(Work {
        key: row.try_get("key")?,
        title: row.try_get("title")?,
        author_names: serde_json::from_str(&author_names)?,
        description: row.try_get("description")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}
