//! Domain layer: events, reducers, and the services built on them.
//!
//! Every entity is an append-only log of [`Event`](events::Event)s. Its
//! snapshot is what a [`Reducer`](reducer::Reducer) folds out of that log,
//! so snapshots can always be thrown away and rebuilt.
//!
//! ```text
//! Events (appended) → Reducer (pure) → Snapshot (derived, rebuildable)
//! ```
//!
//! # Modules
//!
//! - [`events`] - Event record, ids and provenance
//! - [`reducer`] - Reducer trait and replay
//! - [`task`], [`resource`] - The two entity families
//! - [`ids`] - Primary and short identifiers
//! - [`registry`] - Store facade and task operations
//! - [`lease`] - TTL leases on resources
//! - [`integrity`] - Checker and rebuilder
//! - [`notify`] - Listener bus and hook commands
//! - [`config`] - Store settings
//! - [`error`] - Structured errors

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod integrity;
pub mod lease;
pub mod notify;
pub mod reducer;
pub mod registry;
pub mod resource;
pub mod task;
