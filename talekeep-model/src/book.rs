use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AuthorId, BookId};

/// Where a book file currently lives relative to the configured library root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookLocation {
    /// Under the library root, organized or awaiting organization.
    Library,
    /// Under one of the import paths, outside the root.
    Import,
}

impl BookLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookLocation::Library => "library",
            BookLocation::Import => "import",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "import" => BookLocation::Import,
            _ => BookLocation::Library,
        }
    }
}

/// One audiobook file known to the library.
///
/// Deduplication is by `content_hash` (SHA-256 of file bytes); a path may
/// change across organize runs while the hash stays stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_index: Option<f64>,
    pub path: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub location: BookLocation,
    /// External metadata identifier (Open Library work key) once enriched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    pub fn needs_metadata(&self) -> bool {
        self.work_key.is_none()
    }
}

/// A known author, either scanned from files or ingested from a dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    pub id: AuthorId,
    pub name: String,
    /// Open Library author key when ingested from a dump.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ol_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A metadata record ingested from an Open Library dump, keyed by the dump's
/// own work key. Local dump lookups precede network lookups during metadata
/// fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work {
    pub key: String,
    pub title: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub author_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub ingested_at: DateTime<Utc>,
}
