//! tasklog - a file-based, event-sourced store for tasks and leasable
//! resources.
//!
//! All state lives in a `.tasklog` directory of append-only JSONL logs and
//! derived JSON snapshots, coordinated between processes with advisory file
//! locks. Start with [`Registry`].

pub mod core;
pub mod logging;
pub mod storage;

pub use crate::core::config::{RegistryConfig, Settings};
pub use crate::core::error::{ErrorCategory, Result, StoreError};
pub use crate::core::events::{Event, EventId, Provenance};
pub use crate::core::lease::{AcquireOutcome, LeaseManager, ResourceStatus};
pub use crate::core::registry::{NewTask, Registry, TaskFilter};
pub use crate::storage::event_store::EventFilter;
