// src/error.rs

use crate::transaction::Step;
use thiserror::Error;

/// Core error types for Equo
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache and metadata (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Malformed package specifier
    #[error("Invalid atom '{atom}': {reason}")]
    InvalidAtom { atom: String, reason: String },

    /// Specifier resolves to nothing
    #[error("No match for '{0}'")]
    NotFound(String),

    /// A repository could not be queried and was skipped
    #[error("Repository '{0}' is not available")]
    RepositoryUnavailable(String),

    /// Dependency resolution left specifiers unresolved
    #[error("Unresolved dependencies: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    /// Downloaded file does not match its recorded digest
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A transaction step failed; `completed` lists the steps that already ran
    #[error("Step '{step}' failed: {reason}")]
    StepFailure {
        step: Step,
        completed: Vec<Step>,
        reason: String,
    },

    /// The transaction was cancelled while a step was running
    #[error("cancelled")]
    Cancelled,

    /// Protected system packages are never removed
    #[error("Refusing to remove system package '{0}'")]
    SystemPackage(String),

    /// Another instance holds the transaction lock
    #[error("Could not acquire lock {path} after {attempts} attempts")]
    LockTimeout { path: String, attempts: u32 },

    /// A trigger handler failed
    #[error("Trigger error: {0}")]
    TriggerError(String),

    /// Download failed
    #[error("Download error: {0}")]
    DownloadError(String),

    /// I/O failure with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Parse failure (timestamps, metadata)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Conflicting state (duplicate repository, collision)
    #[error("Conflict: {0}")]
    ConflictError(String),
}

/// Result type alias using Equo's Error type
pub type Result<T> = std::result::Result<T, Error>;
