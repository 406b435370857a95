use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A directory scanned for incoming audiobooks in addition to the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportPath {
    pub path: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Key/value application setting. Secret values are stored as opaque
/// AES-GCM ciphertext; `is_secret` tells readers whether decryption applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub is_secret: bool,
    pub updated_at: DateTime<Utc>,
}

/// A content hash the scanner must never admit into the library again.
/// Blocking survives file deletion, so a re-copied duplicate stays out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedHash {
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub blocked_at: DateTime<Utc>,
}
