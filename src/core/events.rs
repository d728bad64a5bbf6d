//! Event definitions and types.
//!
//! All state in the store is derived from events. Events are immutable,
//! append-only, and form the single source of truth. Fields this version
//! does not know about are kept in `extra` maps and written back unchanged.

use crate::storage::codec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Schema version stamped on newly created events.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Prefix of the extension namespace. Reducers record these without mutating
/// domain fields and without a warning.
pub const EXTENSION_PREFIX: &str = "ext.";

const EVENT_ID_PREFIX: &str = "evt-";

const fn default_schema_version() -> u32 {
    EVENT_SCHEMA_VERSION
}

/// Unique, time-ordered identifier for an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates a new unique event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("{EVENT_ID_PREFIX}{}", Uuid::now_v7().simple()))
    }

    /// Wraps an existing id without validating it.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for `evt-` followed by 32 lowercase hex digits.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.strip_prefix(EVENT_ID_PREFIX).is_some_and(|hex| {
            hex.len() == 32 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        })
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an event came from, when it was not produced locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_event_id: Option<EventId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Provenance {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            origin_event_id: None,
            extra: Map::new(),
        }
    }
}

/// A complete event record, exactly as stored on one log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: EventId,
    /// Entity this event belongs to.
    pub entity_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Dotted event type, e.g. `task.created`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Who caused the event.
    pub actor: String,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    /// Unrecognised top-level fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Creates a new event stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        entity_id: impl Into<String>,
        kind: impl Into<String>,
        actor: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            entity_id: entity_id.into(),
            timestamp: Utc::now(),
            kind: kind.into(),
            actor: actor.into(),
            data,
            schema_version: EVENT_SCHEMA_VERSION,
            provenance: None,
            extra: Map::new(),
        }
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Returns true if the type lives in the extension namespace.
    #[must_use]
    pub fn is_extension(&self) -> bool {
        self.kind.starts_with(EXTENSION_PREFIX)
    }

    /// Parses one log line.
    ///
    /// # Errors
    /// Returns the JSON error if the line is not a valid event record.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Encodes the event as one canonical log line, without the newline.
    ///
    /// # Errors
    /// Returns an error if the payload cannot be serialized.
    pub fn to_line(&self) -> crate::storage::Result<String> {
        codec::encode_line(self)
    }
}
