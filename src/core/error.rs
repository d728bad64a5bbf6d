//! Structured error types.
//!
//! Errors must be classifiable, attributable, and actionable.
//! Every error answers: What failed? Why? What can be done next?
//!
//! Lower layers (storage, reducers) raise their own `thiserror` enums; those
//! convert into [`StoreError`] at the service boundary without losing the
//! underlying I/O error, which stays reachable through
//! [`std::error::Error::source`].

use crate::core::reducer::ReduceError;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed caller input.
    Validation,
    /// Entity, resource or event does not exist.
    NotFound,
    /// Request contradicts existing state (payload mismatch, duplicate, double archive).
    Conflict,
    /// Status change not permitted from the current status.
    InvalidTransition,
    /// Lock could not be acquired before the deadline. Safe to retry.
    LockTimeout,
    /// Filesystem or serialization failure while persisting.
    Io,
    /// On-disk data is damaged and needs the integrity checker.
    Corrupt,
    /// An event was applied in a state that cannot accept it.
    Precondition,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::InvalidTransition => write!(f, "invalid_transition"),
            Self::LockTimeout => write!(f, "lock_timeout"),
            Self::Io => write!(f, "io"),
            Self::Corrupt => write!(f, "corrupt"),
            Self::Precondition => write!(f, "precondition"),
        }
    }
}

/// Structured error with full context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreError {
    /// Error category for classification.
    pub category: ErrorCategory,
    /// Unique error code within category.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Component and operation that originated the error.
    pub origin: String,
    /// Whether retrying the same call can succeed.
    pub recoverable: bool,
    /// Hint for recovery action.
    pub recovery_hint: Option<String>,
    /// Additional context key-value pairs.
    pub context: BTreeMap<String, String>,
    #[serde(skip)]
    source: Option<Arc<StorageError>>,
}

impl StoreError {
    /// Creates a new error with the given parameters.
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            origin: origin.into(),
            recoverable: false,
            recovery_hint: None,
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Sets whether the error is recoverable.
    #[must_use]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Sets the recovery hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    /// Adds context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn validation(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Validation, code, message, origin)
    }

    #[must_use]
    pub fn not_found(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::NotFound, code, message, origin)
    }

    #[must_use]
    pub fn conflict(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Conflict, code, message, origin)
    }

    #[must_use]
    pub fn invalid_transition(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::InvalidTransition, code, message, origin)
    }

    /// Creates an I/O error.
    #[must_use]
    pub fn io(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Io, code, message, origin)
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corrupt(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Corrupt, code, message, origin)
            .with_hint("Run the integrity checker, then rebuild the affected entity")
    }

    /// Creates an invariant error for states the write path should never reach.
    #[must_use]
    pub fn precondition(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Precondition, code, message, origin)
    }

    /// Returns true when the failure was lock contention rather than damage.
    #[must_use]
    pub fn is_lock_timeout(&self) -> bool {
        self.category == ErrorCategory::LockTimeout
    }

    /// Converts a storage failure, keeping it as the error source.
    #[must_use]
    pub fn from_storage(err: StorageError, origin: impl Into<String>) -> Self {
        let (category, code, recoverable) = match &err {
            StorageError::LockTimeout { .. } => (ErrorCategory::LockTimeout, "lock_timeout", true),
            StorageError::IncompleteTail { .. } => (ErrorCategory::Corrupt, "incomplete_tail", false),
            StorageError::Corrupt { .. } => (ErrorCategory::Corrupt, "corrupt_record", false),
            StorageError::MissingParent { .. } => (ErrorCategory::Io, "missing_parent", false),
            StorageError::InvalidLine { .. } => (ErrorCategory::Validation, "invalid_line", false),
            StorageError::InvalidKey { .. } => (ErrorCategory::Validation, "invalid_lock_key", false),
            StorageError::Io { .. } => (ErrorCategory::Io, "io_failed", false),
            StorageError::Serialization(_) => (ErrorCategory::Io, "serialization_failed", false),
        };
        let mut out = Self::new(category, code, err.to_string(), origin).recoverable(recoverable);
        match &err {
            StorageError::LockTimeout { key, waited_ms } => {
                out = out
                    .with_context("lock_key", key.clone())
                    .with_context("waited_ms", waited_ms.to_string())
                    .with_hint("Another writer holds this entity; retry later");
            }
            StorageError::IncompleteTail { path } | StorageError::Corrupt { path, .. } => {
                out = out
                    .with_context("path", path.display().to_string())
                    .with_hint("Run the integrity checker with fix enabled");
            }
            StorageError::Io { path, .. } | StorageError::MissingParent { path } => {
                out = out.with_context("path", path.display().to_string());
            }
            StorageError::InvalidKey { key } => {
                out = out.with_context("lock_key", key.clone());
            }
            StorageError::InvalidLine { .. } | StorageError::Serialization(_) => {}
        }
        out.source = Some(Arc::new(err));
        out
    }

    /// Converts a reducer failure.
    #[must_use]
    pub fn from_reduce(err: &ReduceError, origin: impl Into<String>) -> Self {
        let code = match err {
            ReduceError::MissingCreation { .. } => "missing_creation",
            ReduceError::AlreadyCreated { .. } => "already_created",
            ReduceError::InvalidData { .. } => "invalid_event_data",
            ReduceError::EntityMismatch { .. } => "entity_mismatch",
        };
        Self::precondition(code, err.to_string(), origin)
    }

    /// Returns the underlying I/O error, if the failure came from the filesystem.
    #[must_use]
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self.source.as_deref() {
            Some(StorageError::Io { source, .. }) => Some(source),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.category, self.code, self.message)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn display_names_category_and_code() {
        let err = StoreError::io("io_error", "Failed to read file", "storage:event_store");
        assert!(err.to_string().contains("io"));
        assert!(err.to_string().contains("io_error"));
    }

    #[test]
    fn context_and_hint_are_attached() {
        let err = StoreError::validation("invalid_title", "Task title cannot be empty", "registry:create_task")
            .with_context("field", "title")
            .with_hint("Provide a non-empty title");

        assert_eq!(err.context.get("field"), Some(&"title".to_string()));
        assert!(err.recovery_hint.is_some());
        assert!(!err.recoverable);
    }

    #[test]
    fn lock_timeout_is_distinct_from_corruption() {
        let timeout = StoreError::from_storage(
            StorageError::LockTimeout {
                key: "tasks.t1".to_string(),
                waited_ms: 50,
            },
            "test",
        );
        let corrupt = StoreError::from_storage(
            StorageError::IncompleteTail {
                path: PathBuf::from("events/t1.jsonl"),
            },
            "test",
        );
        assert!(timeout.is_lock_timeout());
        assert!(timeout.recoverable);
        assert!(!corrupt.is_lock_timeout());
        assert_eq!(corrupt.category, ErrorCategory::Corrupt);
    }

    #[test]
    fn io_source_is_preserved() {
        let err = StoreError::from_storage(
            StorageError::Io {
                op: "append",
                path: PathBuf::from("x"),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            },
            "test",
        );
        assert_eq!(
            err.io_error().map(std::io::Error::kind),
            Some(std::io::ErrorKind::PermissionDenied)
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn conflict_survives_json_round_trip() {
        let err = StoreError::conflict("already_archived", "Task is already archived", "registry:archive")
            .with_context("task_id", "t1");

        let json = serde_json::to_string(&err).expect("serialize");
        let restored: StoreError = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.category, ErrorCategory::Conflict);
        assert_eq!(restored.code, "already_archived");
    }
}
