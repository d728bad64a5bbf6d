//! TTL leases on named resources.
//!
//! Every check-then-write runs inside one [`WritePath::transact`] scope, so
//! two actors racing for the last slot are serialised by the resource's
//! locks. Time is always passed in by the caller; the manager never reads
//! the clock, which keeps expiry decisions reproducible.

use crate::core::error::{Result, StoreError};
use crate::core::events::Event;
use crate::core::ids::validate_entity_id;
use crate::core::resource::{
    Holder, LeaseAcquired, LeaseHeartbeat, LeaseReleased, LeasesExpired, ResourceConfigured,
    ResourceCreated, ResourceEvent, ResourceReducer, ResourceSnapshot,
};
use crate::storage::layout::{EntityKind, Location};
use crate::storage::writer::WritePath;
use chrono::{DateTime, Utc};
use serde_json::Map;
use std::collections::BTreeMap;
use tracing::info;

/// Result of an acquire call.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// A new lease was recorded.
    Acquired(ResourceSnapshot),
    /// The actor already held a live lease; nothing was written.
    AlreadyHolding(ResourceSnapshot),
}

impl AcquireOutcome {
    #[must_use]
    pub fn snapshot(&self) -> &ResourceSnapshot {
        match self {
            Self::Acquired(s) | Self::AlreadyHolding(s) => s,
        }
    }
}

/// Point-in-time view of a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceStatus {
    pub resource: ResourceSnapshot,
    pub active: Vec<Holder>,
    pub stale: Vec<Holder>,
    pub available: u32,
}

/// Lease operations over one store.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    writer: WritePath,
}

fn event(name: &str, actor: &str, now: DateTime<Utc>, payload: &ResourceEvent) -> Result<Event> {
    let kind = payload.kind().unwrap_or_default();
    let data = payload.to_data().map_err(|e| {
        StoreError::validation("invalid_payload", e.to_string(), "lease:event")
    })?;
    Ok(Event::new(name, kind, actor, data).at(now))
}

fn expiry(now: DateTime<Utc>, ttl_secs: u64, origin: &str) -> Result<DateTime<Utc>> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| {
            StoreError::validation("invalid_ttl", format!("TTL of {ttl_secs}s is out of range"), origin)
        })
}

/// A lease granted with a zero TTL would be stale on arrival.
fn require_ttl(ttl_secs: Option<u64>, origin: &str) -> Result<()> {
    if ttl_secs == Some(0) {
        return Err(StoreError::validation(
            "invalid_limits",
            "ttl_secs must be at least 1",
            origin,
        ));
    }
    Ok(())
}

fn not_found(name: &str, origin: &str) -> StoreError {
    StoreError::not_found(
        "resource_not_found",
        format!("Resource '{name}' does not exist"),
        origin,
    )
    .with_context("resource", name)
}

fn not_holder(name: &str, actor: &str, origin: &str) -> StoreError {
    StoreError::conflict(
        "not_holder",
        format!("'{actor}' does not hold a live lease on '{name}'"),
        origin,
    )
    .with_context("resource", name)
    .with_context("actor", actor)
}

impl LeaseManager {
    #[must_use]
    pub fn new(writer: WritePath) -> Self {
        Self { writer }
    }

    /// Creates a resource. Repeating the call with identical settings
    /// returns the existing resource without writing an event.
    ///
    /// # Errors
    /// Returns `creation_mismatch` if the resource exists with different
    /// settings, or a validation error for a bad name or limit.
    pub fn create_resource(
        &self,
        name: &str,
        max_holders: u32,
        default_ttl_secs: u64,
        description: Option<&str>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<ResourceSnapshot> {
        let origin = "lease:create_resource";
        validate_entity_id(name, origin)?;
        if max_holders == 0 || default_ttl_secs == 0 {
            return Err(StoreError::validation(
                "invalid_limits",
                "max_holders and default_ttl_secs must be at least 1",
                origin,
            ));
        }
        let committed = self.writer.transact::<ResourceReducer, _>(name, true, |_, prior| {
            if let Some(existing) = prior {
                let same = existing.max_holders == max_holders
                    && existing.default_ttl_secs == default_ttl_secs
                    && existing.description == description.unwrap_or_default();
                return if same {
                    Ok(Vec::new())
                } else {
                    Err(StoreError::conflict(
                        "creation_mismatch",
                        format!("Resource '{name}' already exists with different settings"),
                        origin,
                    )
                    .with_context("resource", name))
                };
            }
            let payload = ResourceEvent::Created(ResourceCreated {
                max_holders,
                default_ttl_secs,
                description: description.map(str::to_string),
                extra: Map::new(),
            });
            Ok(vec![event(name, actor, now, &payload)?])
        })?;
        committed.snapshot.ok_or_else(|| not_found(name, origin))
    }

    /// Changes limits or description of an existing resource.
    ///
    /// # Errors
    /// Returns `not_found`, or a validation error for an empty change or a
    /// zero limit.
    pub fn configure_resource(
        &self,
        name: &str,
        change: ResourceConfigured,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<ResourceSnapshot> {
        let origin = "lease:configure_resource";
        if change == ResourceConfigured::default() {
            return Err(StoreError::validation("empty_change", "Nothing to configure", origin));
        }
        if change.max_holders == Some(0) || change.default_ttl_secs == Some(0) {
            return Err(StoreError::validation(
                "invalid_limits",
                "max_holders and default_ttl_secs must be at least 1",
                origin,
            ));
        }
        let committed = self.writer.transact::<ResourceReducer, _>(name, false, |_, prior| {
            if prior.is_none() {
                return Err(not_found(name, origin));
            }
            Ok(vec![event(name, actor, now, &ResourceEvent::Configured(change))?])
        })?;
        committed.snapshot.ok_or_else(|| not_found(name, origin))
    }

    /// Takes a lease for `actor`.
    ///
    /// Stale holders are evicted in the same event. When every slot is held
    /// by a live lease, `force` evicts all current holders; without it the
    /// call fails with `not_available`.
    ///
    /// # Errors
    /// Returns `not_found`, `not_available`, or a validation error for an
    /// out-of-range TTL.
    pub fn acquire(
        &self,
        name: &str,
        actor: &str,
        ttl_secs: Option<u64>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome> {
        let origin = "lease:acquire";
        require_ttl(ttl_secs, origin)?;
        let committed = self.writer.transact::<ResourceReducer, _>(name, false, |_, prior| {
            let resource = prior.ok_or_else(|| not_found(name, origin))?;
            if resource.holders.get(actor).is_some_and(|h| !h.is_stale(now)) {
                return Ok(Vec::new());
            }
            let stale = resource.stale_actors(now);
            let live = resource.holders.len() - stale.len();
            let (evicted, forced) = if u32::try_from(live).unwrap_or(u32::MAX) < resource.max_holders {
                (stale, false)
            } else if force {
                (resource.holders.keys().cloned().collect(), true)
            } else {
                let holders: Vec<&str> = resource.active_holders(now).map(|h| h.actor.as_str()).collect();
                return Err(StoreError::conflict(
                    "not_available",
                    format!("Resource '{name}' has no free slot"),
                    origin,
                )
                .recoverable(true)
                .with_context("resource", name)
                .with_context("holders", holders.join(","))
                .with_hint("Wait for a holder to release or expire, or acquire with force"));
            };
            let ttl = ttl_secs.unwrap_or(resource.default_ttl_secs);
            let payload = ResourceEvent::Acquired(LeaseAcquired {
                actor: actor.to_string(),
                acquired_at: now,
                expires_at: expiry(now, ttl, origin)?,
                force: forced,
                evicted,
            });
            Ok(vec![event(name, actor, now, &payload)?])
        })?;

        let snapshot = committed.snapshot.clone().ok_or_else(|| not_found(name, origin))?;
        if committed.is_noop() {
            return Ok(AcquireOutcome::AlreadyHolding(snapshot));
        }
        if let Some(evicted) = committed
            .events
            .first()
            .and_then(|e| e.data.get("evicted"))
            .and_then(|v| v.as_array())
            .filter(|v| !v.is_empty())
        {
            info!(resource = %name, %actor, evicted = evicted.len(), "lease acquired with eviction");
        }
        Ok(AcquireOutcome::Acquired(snapshot))
    }

    /// Extends a live lease.
    ///
    /// # Errors
    /// Returns `not_holder` if the actor has no live lease; nothing is written.
    pub fn heartbeat(
        &self,
        name: &str,
        actor: &str,
        ttl_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<ResourceSnapshot> {
        let origin = "lease:heartbeat";
        require_ttl(ttl_secs, origin)?;
        let committed = self.writer.transact::<ResourceReducer, _>(name, false, |_, prior| {
            let resource = prior.ok_or_else(|| not_found(name, origin))?;
            if !resource.holders.get(actor).is_some_and(|h| !h.is_stale(now)) {
                return Err(not_holder(name, actor, origin));
            }
            let ttl = ttl_secs.unwrap_or(resource.default_ttl_secs);
            let payload = ResourceEvent::Heartbeat(LeaseHeartbeat {
                actor: actor.to_string(),
                expires_at: expiry(now, ttl, origin)?,
            });
            Ok(vec![event(name, actor, now, &payload)?])
        })?;
        committed.snapshot.ok_or_else(|| not_found(name, origin))
    }

    /// Gives up a lease, live or stale.
    ///
    /// # Errors
    /// Returns `not_holder` if the actor holds nothing; nothing is written.
    pub fn release(&self, name: &str, actor: &str, now: DateTime<Utc>) -> Result<ResourceSnapshot> {
        let origin = "lease:release";
        let committed = self.writer.transact::<ResourceReducer, _>(name, false, |_, prior| {
            let resource = prior.ok_or_else(|| not_found(name, origin))?;
            if !resource.holders.contains_key(actor) {
                return Err(not_holder(name, actor, origin));
            }
            let payload = ResourceEvent::Released(LeaseReleased {
                actor: actor.to_string(),
            });
            Ok(vec![event(name, actor, now, &payload)?])
        })?;
        committed.snapshot.ok_or_else(|| not_found(name, origin))
    }

    /// Removes every stale holder of one resource. Returns the evicted actors.
    ///
    /// # Errors
    /// Returns `not_found` or a storage error.
    pub fn evict_stale(&self, name: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let origin = "lease:evict_stale";
        let mut evicted = Vec::new();
        self.writer.transact::<ResourceReducer, _>(name, false, |_, prior| {
            let resource = prior.ok_or_else(|| not_found(name, origin))?;
            evicted = resource.stale_actors(now);
            if evicted.is_empty() {
                return Ok(Vec::new());
            }
            let payload = ResourceEvent::Expired(LeasesExpired {
                actors: evicted.clone(),
            });
            Ok(vec![event(name, "system", now, &payload)?])
        })?;
        Ok(evicted)
    }

    /// Runs [`LeaseManager::evict_stale`] over every resource.
    ///
    /// # Errors
    /// Stops at the first failing resource.
    pub fn evict_all_stale(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, Vec<String>>> {
        let mut report = BTreeMap::new();
        for name in self.resource_names()? {
            let evicted = self.evict_stale(&name, now)?;
            if !evicted.is_empty() {
                report.insert(name, evicted);
            }
        }
        if !report.is_empty() {
            info!(resources = report.len(), "evicted stale leases");
        }
        Ok(report)
    }

    /// Splits holders into live and stale at `now`.
    ///
    /// # Errors
    /// Returns `not_found` or a read error.
    pub fn status(&self, name: &str, now: DateTime<Utc>) -> Result<ResourceStatus> {
        let resource = self
            .get_resource(name)?
            .ok_or_else(|| not_found(name, "lease:status"))?;
        let (stale, active): (Vec<Holder>, Vec<Holder>) = resource
            .holders
            .values()
            .cloned()
            .partition(|h| h.is_stale(now));
        let used = u32::try_from(active.len()).unwrap_or(u32::MAX);
        Ok(ResourceStatus {
            available: resource.max_holders.saturating_sub(used),
            resource,
            active,
            stale,
        })
    }

    /// Reads one resource without locking.
    ///
    /// # Errors
    /// Returns a read error if the resource's files are damaged.
    pub fn get_resource(&self, name: &str) -> Result<Option<ResourceSnapshot>> {
        validate_entity_id(name, "lease:get_resource")?;
        self.writer.read_current::<ResourceReducer>(name, Location::Active)
    }

    /// All resources, sorted by name.
    ///
    /// # Errors
    /// Returns a read error if any resource's files are damaged.
    pub fn list_resources(&self) -> Result<Vec<ResourceSnapshot>> {
        let mut out = Vec::new();
        for name in self.resource_names()? {
            if let Some(resource) = self.get_resource(&name)? {
                out.push(resource);
            }
        }
        Ok(out)
    }

    fn resource_names(&self) -> Result<Vec<String>> {
        self.writer
            .layout()
            .entity_ids(EntityKind::Resource, Location::Active)
            .map_err(|e| StoreError::from_storage(e, "lease:list"))
    }
}
