//! Error types for symdex operations

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Error payload carried by a failed response on the wire.
///
/// Written by the worker's dispatch loop and turned back into a
/// [`SymdexError`] by the proxy, so a `store_open` raised in the worker
/// surfaces as [`SymdexError::StoreOpen`] in the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SymdexError {
    #[error("Protocol corruption: {0}")]
    ProtocolCorruption(String),

    #[error("Worker process crashed: {diagnostic}")]
    WorkerCrash { diagnostic: String },

    #[error("Worker connection quarantined after a previous failure (reset required): {diagnostic}")]
    Quarantined { diagnostic: String },

    #[error("Failed to start worker {}: {message}", .program.display())]
    WorkerSpawn { program: PathBuf, message: String },

    #[error("Cannot open symbol store {}: {message}", .path.display())]
    StoreOpen { path: PathBuf, message: String },

    #[error("Failed to parse {}: {message}", .path.display())]
    ParseFailure { path: PathBuf, message: String },

    #[error("No databases attached (call set_databases first)")]
    NotAttached,

    #[error("Database index {dbi} out of range ({attached} attached)")]
    InvalidDatabaseIndex { dbi: usize, attached: usize },

    #[error("Database {dbi} is attached read-only")]
    ReadOnlyDatabase { dbi: usize },

    #[error("No file processing sweep active for database {dbi}")]
    NoActiveSweep { dbi: usize },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Invalid arguments for {operation}: {message}")]
    InvalidArguments { operation: String, message: String },

    #[error("Schema version mismatch in {}: store is v{found}, expected v{expected}. Rebuild the index.", .path.display())]
    SchemaVersionMismatch {
        path: PathBuf,
        found: i32,
        expected: i32,
    },

    #[error("Worker error [{kind}]: {message}")]
    Remote { kind: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot walk root {}: {message}", .path.display())]
    RootUnavailable { path: PathBuf, message: String },

    #[error("Config already exists at {}", .0.display())]
    ConfigExists(PathBuf),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Glob pattern error: {0}")]
    GlobPattern(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SymdexError {
    /// Failures after which the connection to a worker can no longer be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolCorruption(_) | Self::WorkerCrash { .. } | Self::Quarantined { .. }
        )
    }

    /// Failures confined to a single source file; a batch skips the file and continues.
    pub fn is_file_local(&self) -> bool {
        match self {
            Self::ParseFailure { .. } | Self::Io(_) => true,
            Self::Remote { kind, .. } => kind == "io",
            _ => false,
        }
    }

    /// Wire kind for this error.
    pub fn kind(&self) -> &str {
        match self {
            Self::ProtocolCorruption(_) => "protocol_corruption",
            Self::WorkerCrash { .. } => "worker_crash",
            Self::Quarantined { .. } => "quarantined",
            Self::WorkerSpawn { .. } => "worker_spawn",
            Self::StoreOpen { .. } => "store_open",
            Self::ParseFailure { .. } => "parse_failure",
            Self::NotAttached => "not_attached",
            Self::InvalidDatabaseIndex { .. } => "invalid_database_index",
            Self::ReadOnlyDatabase { .. } => "read_only_database",
            Self::NoActiveSweep { .. } => "no_active_sweep",
            Self::UnknownOperation(_) => "unknown_operation",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::SchemaVersionMismatch { .. } => "schema_version_mismatch",
            Self::Remote { kind, .. } => kind.as_str(),
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::RootUnavailable { .. } => "root_unavailable",
            Self::ConfigExists(_) | Self::ConfigParse(_) => "config",
            Self::GlobPattern(_) => "glob_pattern",
            Self::Serialization(_) => "serialization",
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        let message = match self {
            // Keep the bare detail for variants rebuilt field-by-field on the other side.
            Self::StoreOpen { message, .. } | Self::ParseFailure { message, .. } => message.clone(),
            Self::ProtocolCorruption(detail) => detail.clone(),
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let path = match self {
            Self::StoreOpen { path, .. } | Self::ParseFailure { path, .. } => {
                Some(path.to_string_lossy().to_string())
            }
            _ => None,
        };
        match path {
            // Path-carrying variants encode as "<path>\n<detail>" so the host can rebuild them.
            Some(path) => ErrorEnvelope::new(self.kind(), format!("{}\n{}", path, message)),
            None => ErrorEnvelope::new(self.kind(), message),
        }
    }

    pub fn from_envelope(envelope: ErrorEnvelope) -> Self {
        let split_path = |message: &str| -> (PathBuf, String) {
            match message.split_once('\n') {
                Some((path, detail)) => (PathBuf::from(path), detail.to_string()),
                None => (PathBuf::new(), message.to_string()),
            }
        };
        match envelope.kind.as_str() {
            "store_open" => {
                let (path, message) = split_path(&envelope.message);
                Self::StoreOpen { path, message }
            }
            "parse_failure" => {
                let (path, message) = split_path(&envelope.message);
                Self::ParseFailure { path, message }
            }
            "protocol_corruption" => Self::ProtocolCorruption(envelope.message),
            _ => Self::Remote {
                kind: envelope.kind,
                message: envelope.message,
            },
        }
    }
}
