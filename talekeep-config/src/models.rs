use std::path::PathBuf;

use serde::Deserialize;

/// Top-level configuration for the Talekeep server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub library: LibraryConfig,
    pub queue: QueueConfig,
    pub event_hub: EventHubConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub backup: BackupConfig,
    pub metadata: MetadataConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            library: LibraryConfig::default(),
            queue: QueueConfig::default(),
            event_hub: EventHubConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            backup: BackupConfig::default(),
            metadata: MetadataConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8585,
        }
    }
}

/// Which embedded store backend to open at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    Sqlite,
    Sled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Data directory holding the SQLite file or the sled tree.
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl DatabaseConfig {
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("talekeep.db")
    }

    pub fn sled_path(&self) -> PathBuf {
        self.data_dir.join("talekeep.sled")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Root directory of the organized library. Empty disables root walks.
    pub root_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Worker task count, minimum 1.
    pub workers: usize,
    /// Per-operation timeout in seconds; 0 disables the deadline.
    pub operation_timeout_secs: u64,
    /// Pending-channel capacity.
    pub pending_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            operation_timeout_secs: 30 * 60,
            pending_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventHubConfig {
    /// Per-client delivery buffer; events beyond it are dropped for that
    /// client only.
    pub client_buffer: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            client_buffer: 100,
            heartbeat_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub library_size_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            library_size_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub check_interval_minutes: u64,
    /// Local hour the action window opens, 0-23.
    pub window_start: u8,
    /// Local hour the window closes (exclusive), 0-23. A start greater than
    /// the end wraps across midnight.
    pub window_end: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_minutes: 60,
            window_start: 2,
            window_end: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub directory: PathBuf,
    /// Retained archive count; 0 disables pruning entirely.
    pub max_backups: usize,
    /// Explicit opt-in to delete every existing archive during retention.
    pub prune_all: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./backups"),
            max_backups: 5,
            prune_all: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Base URL of the Open Library compatible metadata provider.
    pub provider_base_url: String,
    pub fetch_batch_size: usize,
    pub max_retries: u32,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            provider_base_url: "https://openlibrary.org".into(),
            fetch_batch_size: 25,
            max_retries: 3,
        }
    }
}
