use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::OperationId;

/// Kinds of long-running work the queue executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Scan,
    Organize,
    MetadataFetch,
    ItunesImport,
    ItunesSync,
    ItunesWriteback,
    DumpImport,
    Backup,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Scan => "scan",
            OperationType::Organize => "organize",
            OperationType::MetadataFetch => "metadata_fetch",
            OperationType::ItunesImport => "itunes_import",
            OperationType::ItunesSync => "itunes_sync",
            OperationType::ItunesWriteback => "itunes_writeback",
            OperationType::DumpImport => "dump_import",
            OperationType::Backup => "backup",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "scan" => Ok(OperationType::Scan),
            "organize" => Ok(OperationType::Organize),
            "metadata_fetch" => Ok(OperationType::MetadataFetch),
            "itunes_import" => Ok(OperationType::ItunesImport),
            "itunes_sync" => Ok(OperationType::ItunesSync),
            "itunes_writeback" => Ok(OperationType::ItunesWriteback),
            "dump_import" => Ok(OperationType::DumpImport),
            "backup" => Ok(OperationType::Backup),
            other => Err(ModelError::UnknownOperationType(other.to_owned())),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of an operation record.
///
/// `Completed`, `Failed`, `Canceled`, and `Interrupted` are terminal and never
/// transition again. `Interrupted` is applied only by graceful shutdown to
/// operations that were still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    Interrupted,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Queued => "queued",
            OperationStatus::Running => "running",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Canceled => "canceled",
            OperationStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "queued" => Ok(OperationStatus::Queued),
            "running" => Ok(OperationStatus::Running),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "canceled" => Ok(OperationStatus::Canceled),
            "interrupted" => Ok(OperationStatus::Interrupted),
            other => Err(ModelError::UnknownStatus(other.to_owned())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed
                | OperationStatus::Failed
                | OperationStatus::Canceled
                | OperationStatus::Interrupted
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory priority band attached at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OperationPriority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl OperationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationPriority::Low => "low",
            OperationPriority::Normal => "normal",
            OperationPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => OperationPriority::Low,
            "high" => OperationPriority::High,
            _ => OperationPriority::Normal,
        }
    }
}

/// Severity levels for operation log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ModelError::UnknownLogLevel(other.to_owned())),
        }
    }
}

/// Persistent record of a single operation. The store row is the source of
/// truth across restarts; the queue keeps only a transient in-memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub priority: OperationPriority,
    pub current: u64,
    /// Total work units; 0 means indeterminate.
    pub total: u64,
    pub message: String,
    pub folder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OperationRecord {
    pub fn new(id: OperationId, op_type: OperationType, priority: OperationPriority) -> Self {
        Self {
            id,
            op_type,
            status: OperationStatus::Queued,
            priority,
            current: 0,
            total: 0,
            message: String::new(),
            folder: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Final progress percentage for summary rows: a finished op with an
    /// indeterminate total counts as fully done.
    pub fn percentage(&self) -> f64 {
        calculate_percentage(self.current, self.total)
    }
}

/// Bounded progress percentage. Zero or negative totals yield 0.
pub fn calculate_percentage(current: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((current as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
}

/// One append-only structured log line attached to an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub operation_id: OperationId,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal record written once per completed/failed/canceled/interrupted
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation_id: OperationId,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opaque resumable-state blob persisted by operation bodies.
///
/// The queue only ever touches the well-known top-level `status` field (set
/// to `interrupted` at shutdown); everything else belongs to the body that
/// wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationCheckpoint(pub serde_json::Value);

impl OperationCheckpoint {
    pub fn new(state: serde_json::Value) -> Self {
        OperationCheckpoint(state)
    }

    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(|v| v.as_str())
    }

    pub fn set_status(&mut self, status: &str) {
        if let Some(map) = self.0.as_object_mut() {
            map.insert("status".into(), serde_json::Value::String(status.into()));
        }
    }
}
