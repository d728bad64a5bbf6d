//! Storage primitives for the event-sourced store.
//!
//! Everything that touches the filesystem lives here. The store keeps no
//! database: events are JSON lines, snapshots are canonical JSON documents, and
//! cross-process exclusion comes from advisory file locks.
//!
//! # Write path
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────────┐   ┌────────┐
//! │  Events  │ ─▶│ Lock (all  │ ─▶│ Reduce in   │ ─▶│ Append + sync│ ─▶│ Swap   │ ─▶ unlock, notify
//! │ (intent) │   │ keys,sorted│   │ memory      │   │ logs         │   │snapshot│
//! └──────────┘   └────────────┘   └─────────────┘   └──────────────┘   └────────┘
//! ```
//!
//! # Modules
//!
//! - [`durable`] - atomic replace and fsync'd append
//! - [`lock`] - single and multi-key advisory locks
//! - [`layout`] - on-disk paths and lock keys
//! - [`codec`] - canonical JSON encoding
//! - [`event_store`] - reading logs, tolerant and strict
//! - [`index`] - short identifier counters
//! - [`writer`] - the write-path orchestrator

pub mod codec;
pub mod durable;
pub mod event_store;
pub mod index;
pub mod layout;
pub mod lock;
pub mod writer;

use std::path::PathBuf;

/// Errors raised by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Parent directory of {} does not exist", path.display())]
    MissingParent { path: PathBuf },
    #[error("Log {} ends with an incomplete record", path.display())]
    IncompleteTail { path: PathBuf },
    #[error("Corrupt record in {} at line {line}: {reason}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("Invalid log line: {reason}")]
    InvalidLine { reason: String },
    #[error("Invalid lock key '{key}'")]
    InvalidKey { key: String },
    #[error("Timed out after {waited_ms}ms waiting for lock '{key}'")]
    LockTimeout { key: String, waited_ms: u64 },
}

impl StorageError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
