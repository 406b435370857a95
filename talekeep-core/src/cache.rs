//! Derived-state cache for filesystem size aggregates.
//!
//! Walking a multi-terabyte library on every status request is not an
//! option, so the sizes are memoized with a TTL and refreshed under an
//! exclusive lock with a second freshness check after acquiring it. The
//! status endpoint reads sizes only through this cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use talekeep_model::ImportPath;
use tokio::sync::RwLock;

use crate::{CoreError, Result};

/// One computed aggregate: total bytes under the library root and total
/// bytes under the enabled import paths.
#[derive(Debug, Clone, Copy)]
pub struct SizeSnapshot {
    pub library_bytes: u64,
    pub import_bytes: u64,
    pub computed_at: DateTime<Utc>,
    refreshed: Instant,
}

/// TTL-bounded memo of library/import sizes.
pub struct SizeCache {
    ttl: Duration,
    state: RwLock<Option<SizeSnapshot>>,
    walks: AtomicU64,
}

impl std::fmt::Debug for SizeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeCache")
            .field("ttl", &self.ttl)
            .field("walks", &self.walks.load(Ordering::Relaxed))
            .finish()
    }
}

impl SizeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
            walks: AtomicU64::new(0),
        }
    }

    /// Filesystem walks performed since construction. Exposed so tests can
    /// assert that cache hits skip the walk entirely.
    pub fn walks_performed(&self) -> u64 {
        self.walks.load(Ordering::Relaxed)
    }

    /// Current library and import sizes, recomputing at most once per TTL.
    pub async fn library_sizes(
        &self,
        root: Option<&Path>,
        import_paths: &[ImportPath],
    ) -> Result<(u64, u64)> {
        if let Some(snapshot) = *self.state.read().await {
            if snapshot.refreshed.elapsed() < self.ttl {
                return Ok((snapshot.library_bytes, snapshot.import_bytes));
            }
        }

        let mut guard = self.state.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(snapshot) = *guard {
            if snapshot.refreshed.elapsed() < self.ttl {
                return Ok((snapshot.library_bytes, snapshot.import_bytes));
            }
        }

        let snapshot = self.compute(root, import_paths).await?;
        *guard = Some(snapshot);
        Ok((snapshot.library_bytes, snapshot.import_bytes))
    }

    /// Most recent snapshot without triggering a refresh.
    pub async fn peek(&self) -> Option<SizeSnapshot> {
        *self.state.read().await
    }

    async fn compute(
        &self,
        root: Option<&Path>,
        import_paths: &[ImportPath],
    ) -> Result<SizeSnapshot> {
        self.walks.fetch_add(1, Ordering::Relaxed);

        let root: Option<PathBuf> = root.map(Path::to_path_buf);
        let imports: Vec<PathBuf> = import_paths
            .iter()
            .filter(|p| p.enabled)
            .map(|p| PathBuf::from(&p.path))
            .collect();

        let (library_bytes, import_bytes) = tokio::task::spawn_blocking(move || {
            let library_bytes = root
                .as_deref()
                .filter(|r| r.exists())
                .map(walk_size)
                .unwrap_or(0);

            let import_bytes: u64 = imports
                .iter()
                .filter(|p| p.exists())
                // Import paths nested under the root are already counted in
                // the library total; counting them again would double-bill.
                .filter(|p| root.as_deref().map(|r| !p.starts_with(r)).unwrap_or(true))
                .map(|p| walk_size(p))
                .sum();

            (library_bytes, import_bytes)
        })
        .await
        .map_err(|e| CoreError::Internal(format!("size walk task: {e}")))?;

        Ok(SizeSnapshot {
            library_bytes,
            import_bytes,
            computed_at: Utc::now(),
            refreshed: Instant::now(),
        })
    }
}

fn walk_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
