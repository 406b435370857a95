//! Ordered key-value store backend on sled.
//!
//! Every logical table is a key prefix in one keyspace; compound keys encode
//! the secondary indices the relational backend gets from SQL. Scans are
//! range iterations over prefixes, so "recent operations" is a reverse walk
//! of `op_created:` and the interrupted listing is a walk of one
//! `op_status:interrupted:` prefix.
//!
//! Key layout:
//!
//! ```text
//! op:{id}                          operation record
//! op_status:{status}:{id}          status index
//! op_created:{sortable-ts}:{id}    creation-time index
//! oplog:{id}:{seq}                 operation log entry
//! opsum:{id}                       operation summary
//! opsum_at:{sortable-ts}:{id}      summary completion index
//! opstate:{id}                     checkpoint blob
//! book:{id}                        book record
//! book_hash:{hash}                 hash -> book id
//! book_path:{path}                 path -> book id
//! author:{name}                    author record (name is the natural key)
//! work:{key}                       dump work record
//! work_title:{lower-title}:{key}   title index
//! import:{path}                    import path
//! setting:{key}                    setting
//! blocked:{hash}                   blocked hash
//! user:{username}                  user record
//! session:{token}                  session
//! pref:{user_id}:{key}             preference
//! ```

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use talekeep_model::{
    Author, BlockedHash, Book, BookId, ImportPath, OperationCheckpoint, OperationId,
    OperationLogEntry, OperationRecord, OperationStatus, OperationSummary, Preference, Session,
    Setting, User, UserId, Work,
};

use super::{LibraryCounts, Store, transition_allowed};
use crate::{CoreError, Result};

/// sled-backed [`Store`].
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Throwaway on-disk tree for tests, removed when dropped.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.db.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Insert-if-absent; `AlreadyExists` when the key is taken.
    fn insert_new<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let swapped = self.db.compare_and_swap(
            key.as_bytes(),
            None as Option<&[u8]>,
            Some(serde_json::to_vec(value)?),
        )?;
        swapped.map_err(|_| CoreError::already_exists(key.to_owned()))
    }

    fn scan_values<T: serde::de::DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn load_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        self.get_json(&op_key(id))
    }

    fn write_operation(&self, record: &OperationRecord, old_status: Option<OperationStatus>) -> Result<()> {
        if let Some(old) = old_status {
            if old != record.status {
                self.db
                    .remove(status_key(old, &record.id).as_bytes())?;
            }
        }
        self.db.insert(
            status_key(record.status, &record.id).as_bytes(),
            record.id.as_str().as_bytes(),
        )?;
        self.put_json(&op_key(&record.id), record)
    }
}

fn op_key(id: &OperationId) -> String {
    format!("op:{id}")
}

fn status_key(status: OperationStatus, id: &OperationId) -> String {
    format!("op_status:{}:{}", status.as_str(), id)
}

fn sortable_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%.9f").to_string()
}

fn created_key(record: &OperationRecord) -> String {
    format!("op_created:{}:{}", sortable_ts(&record.created_at), record.id)
}

#[async_trait]
impl Store for SledStore {
    async fn insert_operation(&self, record: &OperationRecord) -> Result<()> {
        if self.db.contains_key(op_key(&record.id).as_bytes())? {
            return Err(CoreError::already_exists(format!(
                "operation {}",
                record.id
            )));
        }
        self.insert_new(&op_key(&record.id), record)?;
        self.db
            .insert(created_key(record).as_bytes(), record.id.as_str().as_bytes())?;
        self.db.insert(
            status_key(record.status, &record.id).as_bytes(),
            record.id.as_str().as_bytes(),
        )?;
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
        let Some(mut record) = self.load_operation(id)? else {
            return Err(CoreError::not_found(format!("operation {id}")));
        };
        let old = record.status;
        if !transition_allowed(old, status) {
            tracing::debug!(%id, from = %old, to = %status, "ignoring status write to terminal operation");
            return Ok(());
        }

        let now = Utc::now();
        record.status = status;
        record.current = current;
        record.total = total;
        record.message = message.to_owned();
        if status == OperationStatus::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if status.is_terminal() && record.completed_at.is_none() {
            record.completed_at = Some(now);
        }
        self.write_operation(&record, Some(old))
    }

    async fn update_operation_error(&self, id: &OperationId, error: &str) -> Result<()> {
        let Some(mut record) = self.load_operation(id)? else {
            return Err(CoreError::not_found(format!("operation {id}")));
        };
        let old = record.status;
        if !transition_allowed(old, OperationStatus::Failed) {
            tracing::debug!(%id, from = %old, "ignoring error write to terminal operation");
            return Ok(());
        }
        record.status = OperationStatus::Failed;
        record.error = Some(error.to_owned());
        if record.completed_at.is_none() {
            record.completed_at = Some(Utc::now());
        }
        self.write_operation(&record, Some(old))
    }

    async fn get_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        self.load_operation(id)
    }

    async fn recent_operations(&self, limit: usize) -> Result<Vec<OperationRecord>> {
        let mut out = Vec::with_capacity(limit);
        for item in self.db.scan_prefix(b"op_created:").rev() {
            if out.len() >= limit {
                break;
            }
            let (_, id_bytes) = item?;
            let id = OperationId::new(String::from_utf8_lossy(&id_bytes).into_owned());
            if let Some(record) = self.load_operation(&id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn add_operation_log(&self, entry: &OperationLogEntry) -> Result<()> {
        let seq = self.db.generate_id()?;
        let key = format!("oplog:{}:{seq:020}", entry.operation_id);
        self.put_json(&key, entry)
    }

    async fn operation_logs(
        &self,
        id: &OperationId,
        limit: usize,
    ) -> Result<Vec<OperationLogEntry>> {
        let prefix = format!("oplog:{id}:");
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            if out.len() >= limit {
                break;
            }
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    async fn save_operation_summary(&self, summary: &OperationSummary) -> Result<()> {
        if let Some(old) =
            self.get_json::<OperationSummary>(&format!("opsum:{}", summary.operation_id))?
        {
            self.db.remove(
                format!(
                    "opsum_at:{}:{}",
                    sortable_ts(&old.completed_at),
                    old.operation_id
                )
                .as_bytes(),
            )?;
        }
        self.put_json(&format!("opsum:{}", summary.operation_id), summary)?;
        self.db.insert(
            format!(
                "opsum_at:{}:{}",
                sortable_ts(&summary.completed_at),
                summary.operation_id
            )
            .as_bytes(),
            summary.operation_id.as_str().as_bytes(),
        )?;
        Ok(())
    }

    async fn recent_operation_summaries(&self, limit: usize) -> Result<Vec<OperationSummary>> {
        let mut out = Vec::with_capacity(limit);
        for item in self.db.scan_prefix(b"opsum_at:").rev() {
            if out.len() >= limit {
                break;
            }
            let (_, id_bytes) = item?;
            let id = String::from_utf8_lossy(&id_bytes).into_owned();
            if let Some(summary) = self.get_json(&format!("opsum:{id}"))? {
                out.push(summary);
            }
        }
        Ok(out)
    }

    async fn save_operation_state(
        &self,
        id: &OperationId,
        checkpoint: &OperationCheckpoint,
    ) -> Result<()> {
        self.put_json(&format!("opstate:{id}"), &checkpoint.0)
    }

    async fn get_operation_state(&self, id: &OperationId) -> Result<Option<OperationCheckpoint>> {
        Ok(self
            .get_json::<serde_json::Value>(&format!("opstate:{id}"))?
            .map(OperationCheckpoint::new))
    }

    async fn delete_operation_state(&self, id: &OperationId) -> Result<()> {
        self.db.remove(format!("opstate:{id}").as_bytes())?;
        Ok(())
    }

    async fn list_interrupted_operations(&self) -> Result<Vec<OperationRecord>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(b"op_status:interrupted:") {
            let (_, id_bytes) = item?;
            let id = OperationId::new(String::from_utf8_lossy(&id_bytes).into_owned());
            if let Some(record) = self.load_operation(&id)? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn upsert_book(&self, book: &Book) -> Result<()> {
        // Hash is the identity for dedupe; reuse the existing record id when
        // the same content reappears under a new path.
        let mut book = book.clone();
        if let Some(existing_id) = self.db.get(format!("book_hash:{}", book.content_hash))? {
            let id = String::from_utf8_lossy(&existing_id).into_owned();
            if let Some(existing) = self.get_json::<Book>(&format!("book:{id}"))? {
                if existing.path != book.path {
                    self.db.remove(format!("book_path:{}", existing.path).as_bytes())?;
                }
                book.id = existing.id;
                book.created_at = existing.created_at;
            }
        } else if let Some(other) = self.db.get(format!("book_path:{}", book.path))? {
            // A different hash already claims this path.
            let other_id = String::from_utf8_lossy(&other).into_owned();
            if other_id != book.id.to_string() {
                return Err(CoreError::already_exists(format!("book path {}", book.path)));
            }
        }

        let id = book.id.to_string();
        self.put_json(&format!("book:{id}"), &book)?;
        self.db
            .insert(format!("book_hash:{}", book.content_hash).as_bytes(), id.as_bytes())?;
        self.db
            .insert(format!("book_path:{}", book.path).as_bytes(), id.as_bytes())?;
        Ok(())
    }

    async fn book_by_hash(&self, hash: &str) -> Result<Option<Book>> {
        match self.db.get(format!("book_hash:{hash}"))? {
            Some(id) => self.get_json(&format!("book:{}", String::from_utf8_lossy(&id))),
            None => Ok(None),
        }
    }

    async fn book_by_path(&self, path: &str) -> Result<Option<Book>> {
        match self.db.get(format!("book_path:{path}"))? {
            Some(id) => self.get_json(&format!("book:{}", String::from_utf8_lossy(&id))),
            None => Ok(None),
        }
    }

    async fn list_books(&self) -> Result<Vec<Book>> {
        let mut books: Vec<Book> = self.scan_values("book:")?;
        books.sort_by(|a, b| {
            (&a.author, &a.series, a.series_index.map(ordered), &a.title).cmp(&(
                &b.author,
                &b.series,
                b.series_index.map(ordered),
                &b.title,
            ))
        });
        Ok(books)
    }

    async fn delete_book(&self, id: &BookId) -> Result<()> {
        let key = format!("book:{id}");
        if let Some(bytes) = self.db.get(key.as_bytes())? {
            let book: Book = serde_json::from_slice(&bytes)?;
            self.db.remove(format!("book_hash:{}", book.content_hash).as_bytes())?;
            self.db.remove(format!("book_path:{}", book.path).as_bytes())?;
            self.db.remove(key.as_bytes())?;
        }
        Ok(())
    }

    async fn upsert_author(&self, author: &Author) -> Result<()> {
        let key = format!("author:{}", author.name);
        if let Some(existing) = self.get_json::<Author>(&key)? {
            let merged = Author {
                id: existing.id,
                name: existing.name,
                ol_key: author.ol_key.clone().or(existing.ol_key),
                created_at: existing.created_at,
            };
            self.put_json(&key, &merged)
        } else {
            self.put_json(&key, author)
        }
    }

    async fn author_by_name(&self, name: &str) -> Result<Option<Author>> {
        self.get_json(&format!("author:{name}"))
    }

    async fn upsert_work(&self, work: &Work) -> Result<()> {
        self.put_json(&format!("work:{}", work.key), work)?;
        self.db.insert(
            format!("work_title:{}:{}", work.title.to_lowercase(), work.key).as_bytes(),
            work.key.as_bytes(),
        )?;
        Ok(())
    }

    async fn work_by_key(&self, key: &str) -> Result<Option<Work>> {
        self.get_json(&format!("work:{key}"))
    }

    async fn work_by_title(&self, title: &str) -> Result<Option<Work>> {
        let prefix = format!("work_title:{}:", title.to_lowercase());
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, key_bytes) = item?;
            let key = String::from_utf8_lossy(&key_bytes).into_owned();
            return self.get_json(&format!("work:{key}"));
        }
        Ok(None)
    }

    async fn library_counts(&self) -> Result<LibraryCounts> {
        let count = |prefix: &str| -> Result<u64> {
            let mut n = 0u64;
            for item in self.db.scan_prefix(prefix.as_bytes()) {
                item?;
                n += 1;
            }
            Ok(n)
        };
        Ok(LibraryCounts {
            books: count("book:")?,
            authors: count("author:")?,
            works: count("work:")?,
        })
    }

    async fn add_import_path(&self, path: &ImportPath) -> Result<()> {
        let key = format!("import:{}", path.path);
        // Re-adding an existing path only toggles `enabled`.
        if let Some(existing) = self.get_json::<ImportPath>(&key)? {
            return self.put_json(
                &key,
                &ImportPath {
                    enabled: path.enabled,
                    ..existing
                },
            );
        }
        self.put_json(&key, path)
    }

    async fn list_import_paths(&self) -> Result<Vec<ImportPath>> {
        self.scan_values("import:")
    }

    async fn remove_import_path(&self, path: &str) -> Result<()> {
        self.db.remove(format!("import:{path}").as_bytes())?;
        Ok(())
    }

    async fn set_setting(&self, setting: &Setting) -> Result<()> {
        self.put_json(&format!("setting:{}", setting.key), setting)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<Setting>> {
        self.get_json(&format!("setting:{key}"))
    }

    async fn block_hash(&self, blocked: &BlockedHash) -> Result<()> {
        let key = format!("blocked:{}", blocked.hash);
        if self.db.contains_key(key.as_bytes())? {
            return Ok(());
        }
        self.put_json(&key, blocked)
    }

    async fn is_hash_blocked(&self, hash: &str) -> Result<bool> {
        Ok(self.db.contains_key(format!("blocked:{hash}").as_bytes())?)
    }

    async fn list_blocked_hashes(&self) -> Result<Vec<BlockedHash>> {
        let mut hashes: Vec<BlockedHash> = self.scan_values("blocked:")?;
        hashes.sort_by(|a, b| b.blocked_at.cmp(&a.blocked_at));
        Ok(hashes)
    }

    async fn create_user(&self, user: &User) -> Result<()> {
        self.insert_new(&format!("user:{}", user.username), user)
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.get_json(&format!("user:{username}"))
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.put_json(&format!("session:{}", session.token), session)
    }

    async fn get_session(&self, token: &str) -> Result<Option<Session>> {
        self.get_json(&format!("session:{token}"))
    }

    async fn delete_session(&self, token: &str) -> Result<()> {
        self.db.remove(format!("session:{token}").as_bytes())?;
        Ok(())
    }

    async fn set_preference(&self, preference: &Preference) -> Result<()> {
        self.put_json(
            &format!("pref:{}:{}", preference.user_id, preference.key),
            preference,
        )
    }

    async fn get_preference(&self, user_id: &UserId, key: &str) -> Result<Option<Preference>> {
        self.get_json(&format!("pref:{user_id}:{key}"))
    }
}

fn ordered(f: f64) -> (i64, u64) {
    // Total order for the f64 series index; NaN is never stored.
    let bits = f.to_bits() as i64;
    if bits < 0 { (-1, !(bits as u64)) } else { (1, bits as u64) }
}
