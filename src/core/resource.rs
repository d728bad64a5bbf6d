//! Leasable resources and their event family.

use crate::core::events::{Event, EventId, EXTENSION_PREFIX};
use crate::core::reducer::{decode_data, Disposition, EntitySnapshot, ReduceError, Reducer};
use crate::storage::layout::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const RESOURCE_SCHEMA_VERSION: u32 = 1;

pub const RESOURCE_CREATED: &str = "resource.created";
pub const RESOURCE_CONFIGURED: &str = "resource.configured";
pub const RESOURCE_ACQUIRED: &str = "resource.acquired";
pub const RESOURCE_HEARTBEAT: &str = "resource.heartbeat";
pub const RESOURCE_RELEASED: &str = "resource.released";
pub const RESOURCE_EXPIRED: &str = "resource.expired";

const RESERVED_FIELDS: &[&str] = &[
    "id",
    "schema_version",
    "max_holders",
    "default_ttl_secs",
    "description",
    "holders",
    "created_at",
    "created_by",
    "last_event_id",
    "updated_at",
];

/// One actor's lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub actor: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Holder {
    /// A lease is stale once `expires_at <= now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Materialised state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: String,
    pub schema_version: u32,
    pub max_holders: u32,
    pub default_ttl_secs: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub holders: BTreeMap<String, Holder>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub last_event_id: EventId,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceSnapshot {
    /// Holders whose lease has not expired at `now`.
    pub fn active_holders(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Holder> {
        self.holders.values().filter(move |h| !h.is_stale(now))
    }

    /// Actors whose lease has expired at `now`, sorted.
    #[must_use]
    pub fn stale_actors(&self, now: DateTime<Utc>) -> Vec<String> {
        self.holders
            .values()
            .filter(|h| h.is_stale(now))
            .map(|h| h.actor.clone())
            .collect()
    }
}

impl EntitySnapshot for ResourceSnapshot {
    fn id(&self) -> &str {
        &self.id
    }

    fn last_event_id(&self) -> &EventId {
        &self.last_event_id
    }

    fn touch(&mut self, event: &Event) {
        self.last_event_id = event.id.clone();
        self.updated_at = event.timestamp;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCreated {
    pub max_holders: u32,
    pub default_ttl_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfigured {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_holders: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAcquired {
    pub actor: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub force: bool,
    /// Holders removed by this acquisition, stale or forced out.
    #[serde(default)]
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHeartbeat {
    pub actor: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseReleased {
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeasesExpired {
    pub actors: Vec<String>,
}

/// Decoded resource event.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Created(ResourceCreated),
    Configured(ResourceConfigured),
    Acquired(LeaseAcquired),
    Heartbeat(LeaseHeartbeat),
    Released(LeaseReleased),
    Expired(LeasesExpired),
    Extension,
    Unknown(String),
}

impl ResourceEvent {
    /// Decodes `(type, data)` into the closed resource family.
    ///
    /// # Errors
    /// Returns [`ReduceError::InvalidData`] for a known type whose payload
    /// does not match.
    pub fn decode(event: &Event) -> Result<Self, ReduceError> {
        Ok(match event.kind.as_str() {
            RESOURCE_CREATED => Self::Created(decode_data(event)?),
            RESOURCE_CONFIGURED => Self::Configured(decode_data(event)?),
            RESOURCE_ACQUIRED => Self::Acquired(decode_data(event)?),
            RESOURCE_HEARTBEAT => Self::Heartbeat(decode_data(event)?),
            RESOURCE_RELEASED => Self::Released(decode_data(event)?),
            RESOURCE_EXPIRED => Self::Expired(decode_data(event)?),
            kind if kind.starts_with(EXTENSION_PREFIX) => Self::Extension,
            other => Self::Unknown(other.to_string()),
        })
    }

    #[must_use]
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            Self::Created(_) => Some(RESOURCE_CREATED),
            Self::Configured(_) => Some(RESOURCE_CONFIGURED),
            Self::Acquired(_) => Some(RESOURCE_ACQUIRED),
            Self::Heartbeat(_) => Some(RESOURCE_HEARTBEAT),
            Self::Released(_) => Some(RESOURCE_RELEASED),
            Self::Expired(_) => Some(RESOURCE_EXPIRED),
            Self::Extension | Self::Unknown(_) => None,
        }
    }

    /// Encodes the payload as event `data`.
    ///
    /// # Errors
    /// Returns the serialization error.
    pub fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            Self::Created(d) => serde_json::to_value(d),
            Self::Configured(d) => serde_json::to_value(d),
            Self::Acquired(d) => serde_json::to_value(d),
            Self::Heartbeat(d) => serde_json::to_value(d),
            Self::Released(d) => serde_json::to_value(d),
            Self::Expired(d) => serde_json::to_value(d),
            Self::Extension | Self::Unknown(_) => Ok(Value::Object(Map::new())),
        }
    }
}

/// Reducer for the resource family.
///
/// Heartbeats and releases naming an actor that holds nothing are recorded
/// without changing the holder set.
pub struct ResourceReducer;

impl Reducer for ResourceReducer {
    type Snapshot = ResourceSnapshot;
    const KIND: EntityKind = EntityKind::Resource;

    fn is_creation(kind: &str) -> bool {
        kind == RESOURCE_CREATED
    }

    fn is_lifecycle(kind: &str) -> bool {
        kind == RESOURCE_CREATED
    }

    fn create(event: &Event) -> Result<ResourceSnapshot, ReduceError> {
        let ResourceEvent::Created(data) = ResourceEvent::decode(event)? else {
            return Err(ReduceError::MissingCreation {
                event_id: event.id.clone(),
                kind: event.kind.clone(),
            });
        };
        let extra = data
            .extra
            .into_iter()
            .filter(|(k, v)| !v.is_null() && !RESERVED_FIELDS.contains(&k.as_str()))
            .collect();
        Ok(ResourceSnapshot {
            id: event.entity_id.clone(),
            schema_version: RESOURCE_SCHEMA_VERSION,
            max_holders: data.max_holders,
            default_ttl_secs: data.default_ttl_secs,
            description: data.description.unwrap_or_default(),
            holders: BTreeMap::new(),
            created_at: event.timestamp,
            created_by: event.actor.clone(),
            last_event_id: event.id.clone(),
            updated_at: event.timestamp,
            extra,
        })
    }

    fn fold(resource: &mut ResourceSnapshot, event: &Event) -> Result<Disposition, ReduceError> {
        match ResourceEvent::decode(event)? {
            ResourceEvent::Created(_) => {
                return Err(ReduceError::AlreadyCreated {
                    entity_id: resource.id.clone(),
                    event_id: event.id.clone(),
                })
            }
            ResourceEvent::Configured(change) => {
                if let Some(max_holders) = change.max_holders {
                    resource.max_holders = max_holders;
                }
                if let Some(ttl) = change.default_ttl_secs {
                    resource.default_ttl_secs = ttl;
                }
                if let Some(description) = change.description {
                    resource.description = description;
                }
            }
            ResourceEvent::Acquired(lease) => {
                if lease.force {
                    resource.holders.clear();
                } else {
                    for actor in &lease.evicted {
                        resource.holders.remove(actor);
                    }
                }
                resource.holders.insert(
                    lease.actor.clone(),
                    Holder {
                        actor: lease.actor,
                        acquired_at: lease.acquired_at,
                        expires_at: lease.expires_at,
                        last_heartbeat: lease.acquired_at,
                    },
                );
            }
            ResourceEvent::Heartbeat(beat) => {
                if let Some(holder) = resource.holders.get_mut(&beat.actor) {
                    holder.expires_at = beat.expires_at;
                    holder.last_heartbeat = event.timestamp;
                }
            }
            ResourceEvent::Released(release) => {
                resource.holders.remove(&release.actor);
            }
            ResourceEvent::Expired(expired) => {
                for actor in &expired.actors {
                    resource.holders.remove(actor);
                }
            }
            ResourceEvent::Extension => return Ok(Disposition::Extension),
            ResourceEvent::Unknown(kind) => return Ok(Disposition::Unknown(kind)),
        }
        Ok(Disposition::Applied)
    }
}
