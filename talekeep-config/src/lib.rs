//! Shared configuration library for Talekeep.
//!
//! Centralizes config loading and validation so the server binary and the
//! integration tests share a single source of truth for defaults and
//! validation rules. Values layer as defaults → optional TOML file →
//! `TALEKEEP_*` environment variables.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoadError, load};
pub use models::{
    BackupConfig, CacheConfig, Config, DatabaseBackend, DatabaseConfig, EventHubConfig,
    LibraryConfig, MetadataConfig, QueueConfig, SchedulerConfig, ServerConfig,
};
pub use validation::{ConfigWarning, validate};
