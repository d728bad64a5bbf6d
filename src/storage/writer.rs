//! The write path.
//!
//! Every mutation of an entity goes through [`WritePath`]:
//!
//! 1. lock the entity's log and snapshot keys, plus `events._lifecycle` when
//!    lifecycle events may be written, `events._global` when mirroring is on,
//!    and any caller keys such as `index`, all in sorted order;
//! 2. load the prior snapshot, rebuilding it from the log if it is missing or
//!    behind;
//! 3. fold the new events in memory, so a rejected event writes nothing;
//! 4. append to the entity log, then the lifecycle log, then the global log;
//! 5. atomically replace the snapshot;
//! 6. release the locks and notify.
//!
//! An event is durable before the snapshot that reflects it. A crash between
//! the two leaves a stale snapshot that step 2 repairs on the next write.

use super::event_store;
use super::layout::{EntityKind, Location, StoreLayout, GLOBAL_KEY, LIFECYCLE_KEY};
use super::lock::{LockManager, MultiLockGuard};
use super::{codec, durable, StorageError};
use crate::core::error::{Result, StoreError};
use crate::core::events::Event;
use crate::core::notify::{CommitNotice, Notifier};
use crate::core::reducer::{log_disposition, replay, EntitySnapshot, Reducer};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a commit.
#[derive(Debug, Clone)]
pub struct Committed<S> {
    /// State after the commit, or before it when nothing was written.
    pub snapshot: Option<S>,
    /// Events appended, in log order. Empty when the decision was a no-op.
    pub events: Vec<Event>,
    /// Tree the entity lives in.
    pub location: Location,
}

impl<S> Committed<S> {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// What a decision closure sees under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    pub location: Location,
}

/// Orchestrates locked, event-first commits.
#[derive(Debug, Clone)]
pub struct WritePath {
    layout: StoreLayout,
    locks: LockManager,
    lock_timeout: Duration,
    mirror_global: bool,
    notifier: Notifier,
}

pub(crate) fn storage_err(origin: &str) -> impl Fn(StorageError) -> StoreError + '_ {
    move |e| StoreError::from_storage(e, origin)
}

/// Reads and decodes a snapshot file.
///
/// # Errors
/// Returns the read error, or the decode error as [`StorageError::Serialization`].
pub fn read_snapshot<S: EntitySnapshot>(path: &Path) -> super::Result<Option<S>> {
    match durable::read_optional(path)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Writes a snapshot atomically in canonical form.
///
/// # Errors
/// Returns the encoding or write error.
pub fn write_snapshot<S: EntitySnapshot>(path: &Path, snapshot: &S) -> super::Result<()> {
    durable::atomic_replace(path, &codec::encode_document(snapshot)?)
}

impl WritePath {
    #[must_use]
    pub fn new(
        layout: StoreLayout,
        locks: LockManager,
        lock_timeout: Duration,
        mirror_global: bool,
        notifier: Notifier,
    ) -> Self {
        Self {
            layout,
            locks,
            lock_timeout,
            mirror_global,
            notifier,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    #[must_use]
    pub fn mirrors_global(&self) -> bool {
        self.mirror_global
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Keys a commit to `id` must hold.
    #[must_use]
    pub fn lock_keys(&self, kind: EntityKind, id: &str, lifecycle: bool, extra: &[&str]) -> Vec<String> {
        let mut keys = vec![StoreLayout::log_key(kind, id), StoreLayout::snapshot_key(kind, id)];
        if lifecycle {
            keys.push(LIFECYCLE_KEY.to_string());
        }
        if self.mirror_global {
            keys.push(GLOBAL_KEY.to_string());
        }
        keys.extend(extra.iter().map(|k| (*k).to_string()));
        keys
    }

    /// Acquires `keys` under the configured timeout.
    ///
    /// # Errors
    /// Returns a `lock_timeout` error when another writer holds a key.
    pub fn lock(&self, keys: &[String]) -> Result<MultiLockGuard> {
        self.locks
            .acquire_many(keys, self.lock_timeout)
            .map_err(storage_err("writer:lock"))
    }

    /// Acquires a single key under the configured timeout.
    ///
    /// # Errors
    /// Returns a `lock_timeout` error when another writer holds the key.
    pub fn lock_one(&self, key: &str) -> Result<super::lock::LockGuard> {
        self.locks
            .acquire(key, self.lock_timeout)
            .map_err(storage_err("writer:lock"))
    }

    /// Finds which tree holds an entity. The tree holding the log wins; a
    /// snapshot alone only counts when neither tree has a log. Only stable
    /// under the entity's lock.
    #[must_use]
    pub fn locate(&self, kind: EntityKind, id: &str) -> Option<Location> {
        const TREES: [Location; 2] = [Location::Active, Location::Archived];
        TREES
            .into_iter()
            .find(|loc| self.layout.log_path(kind, id, *loc).is_file())
            .or_else(|| {
                TREES
                    .into_iter()
                    .find(|loc| self.layout.snapshot_path(kind, id, *loc).is_file())
            })
    }

    /// Like [`WritePath::locate`], but also finishes a relocation that
    /// stopped between moving the log and moving the snapshot: a snapshot
    /// left in the other tree follows its log, or is dropped when the log's
    /// tree already has one.
    ///
    /// # Errors
    /// Returns `lock_not_held` without the entity's keys, or a storage error.
    pub fn locate_locked(&self, guard: &MultiLockGuard, kind: EntityKind, id: &str) -> Result<Option<Location>> {
        let origin = "writer:locate";
        Self::require_keys(guard, &[StoreLayout::log_key(kind, id), StoreLayout::snapshot_key(kind, id)])?;
        let Some(location) = self.locate(kind, id) else {
            return Ok(None);
        };
        let stray = self.layout.snapshot_path(kind, id, location.other());
        if !self.layout.log_path(kind, id, location).is_file() || !stray.is_file() {
            return Ok(Some(location));
        }
        let dest = self.layout.snapshot_path(kind, id, location);
        if dest.exists() {
            std::fs::remove_file(&stray)
                .map_err(|e| StorageError::io("remove", &stray, e))
                .map_err(storage_err(origin))?;
        } else {
            durable::rename_durable(&stray, &dest).map_err(storage_err(origin))?;
        }
        warn!(%kind, entity_id = %id, ?location, "finished interrupted relocation");
        Ok(Some(location))
    }

    fn require_keys(guard: &MultiLockGuard, keys: &[String]) -> Result<()> {
        for key in keys {
            if !guard.covers(key) {
                return Err(StoreError::precondition(
                    "lock_not_held",
                    format!("Commit requires lock '{key}' which the caller does not hold"),
                    "writer:commit",
                )
                .with_context("lock_key", key.clone()));
            }
        }
        Ok(())
    }

    /// Loads the current snapshot of an entity whose keys `guard` holds.
    ///
    /// A snapshot that is missing, unreadable, or whose `last_event_id` is
    /// not the log's final event is rebuilt by replaying the log.
    ///
    /// # Errors
    /// Returns a `corrupt` error if the log is damaged, or a snapshot exists
    /// without any log.
    pub fn load_locked<R: Reducer>(
        &self,
        guard: &MultiLockGuard,
        id: &str,
        location: Location,
    ) -> Result<Option<R::Snapshot>> {
        Self::require_keys(
            guard,
            &[StoreLayout::log_key(R::KIND, id), StoreLayout::snapshot_key(R::KIND, id)],
        )?;
        self.load::<R>(id, location, "writer:load")
    }

    /// Reads the current state without locking. Never blocks; a commit in
    /// progress is either fully visible or not at all for the snapshot, and
    /// the log is authoritative when the two disagree.
    ///
    /// # Errors
    /// Same as [`WritePath::load_locked`].
    pub fn read_current<R: Reducer>(&self, id: &str, location: Location) -> Result<Option<R::Snapshot>> {
        self.load::<R>(id, location, "writer:read")
    }

    fn load<R: Reducer>(&self, id: &str, location: Location, origin: &str) -> Result<Option<R::Snapshot>> {
        let log_path = self.layout.log_path(R::KIND, id, location);
        let snapshot_path = self.layout.snapshot_path(R::KIND, id, location);

        let last = event_store::last_event(&log_path).map_err(storage_err(origin))?;
        let stored = match read_snapshot::<R::Snapshot>(&snapshot_path) {
            Ok(s) => s,
            Err(e) => {
                warn!(entity_id = %id, error = %e, "unreadable snapshot; rebuilding from log");
                None
            }
        };

        match (last, stored) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(StoreError::corrupt(
                "orphan_snapshot",
                format!("{} '{id}' has a snapshot but no event log", R::KIND),
                origin,
            )
            .with_context("entity_id", id)),
            (Some(last), Some(snapshot)) if snapshot.last_event_id() == &last.id => Ok(Some(snapshot)),
            (Some(last), stale) => {
                warn!(
                    entity_id = %id,
                    snapshot_event = %stale.as_ref().map(|s| s.last_event_id().to_string()).unwrap_or_default(),
                    log_event = %last.id,
                    "snapshot behind log; replaying"
                );
                let events = event_store::read_events(&log_path).map_err(storage_err(origin))?;
                replay::<R>(&events).map_err(|e| StoreError::from_reduce(&e, origin))
            }
        }
    }

    /// Folds `events` over `prior` and persists them. The caller already
    /// holds the entity's keys.
    ///
    /// # Errors
    /// - `lock_not_held` if `guard` misses a required key;
    /// - a reducer error, in which case nothing was written;
    /// - storage errors from the appends or the snapshot swap.
    pub fn commit_locked<R: Reducer>(
        &self,
        guard: &MultiLockGuard,
        id: &str,
        location: Location,
        prior: Option<R::Snapshot>,
        events: Vec<Event>,
    ) -> Result<Committed<R::Snapshot>> {
        let origin = "writer:commit";
        if events.is_empty() {
            return Ok(Committed {
                snapshot: prior,
                events,
                location,
            });
        }
        let lifecycle = events.iter().any(|e| R::is_lifecycle(&e.kind));
        Self::require_keys(guard, &self.lock_keys(R::KIND, id, lifecycle, &[]))?;

        // Reduce first.
        let mut state = prior;
        for event in &events {
            if event.entity_id != id {
                return Err(StoreError::precondition(
                    "entity_mismatch",
                    format!("Event {} names '{}' but is committed to '{id}'", event.id, event.entity_id),
                    origin,
                ));
            }
            let reduced = R::apply(state.take(), event).map_err(|e| StoreError::from_reduce(&e, origin))?;
            log_disposition(&reduced.disposition, event);
            state = Some(reduced.snapshot);
        }
        let Some(snapshot) = state else {
            return Err(StoreError::precondition("empty_state", "Commit produced no state", origin));
        };
        let lines = events
            .iter()
            .map(Event::to_line)
            .collect::<super::Result<Vec<String>>>()
            .map_err(storage_err(origin))?;
        let document = codec::encode_document(&snapshot).map_err(storage_err(origin))?;

        self.layout
            .ensure_entity_dirs(R::KIND, id, location)
            .map_err(storage_err(origin))?;
        let log_path = self.layout.log_path(R::KIND, id, location);
        for line in &lines {
            durable::append_line(&log_path, line).map_err(storage_err(origin))?;
        }
        for (event, line) in events.iter().zip(&lines) {
            if R::is_lifecycle(&event.kind) {
                durable::append_line(&self.layout.lifecycle_log_path(), line)
                    .map_err(storage_err(origin))?;
            }
        }
        if self.mirror_global {
            for line in &lines {
                durable::append_line(&self.layout.global_log_path(), line)
                    .map_err(storage_err(origin))?;
            }
        }
        durable::atomic_replace(&self.layout.snapshot_path(R::KIND, id, location), &document)
            .map_err(storage_err(origin))?;

        debug!(kind = %R::KIND, entity_id = %id, events = events.len(), "committed");
        Ok(Committed {
            snapshot: Some(snapshot),
            events,
            location,
        })
    }

    /// Locks, loads, decides, commits, releases and notifies.
    ///
    /// `decide` runs under the lock with the current state and returns the
    /// events to append; returning none commits nothing. `lifecycle` must be
    /// true when `decide` may return lifecycle events.
    ///
    /// # Errors
    /// Any error from `decide`, the lock, or [`WritePath::commit_locked`].
    pub fn transact<R, F>(&self, id: &str, lifecycle: bool, decide: F) -> Result<Committed<R::Snapshot>>
    where
        R: Reducer,
        F: FnOnce(TxContext, Option<&R::Snapshot>) -> Result<Vec<Event>>,
    {
        let guard = self.lock(&self.lock_keys(R::KIND, id, lifecycle, &[]))?;
        let location = self.locate_locked(&guard, R::KIND, id)?.unwrap_or(Location::Active);
        let prior = self.load_locked::<R>(&guard, id, location)?;
        let events = decide(TxContext { location }, prior.as_ref())?;
        let committed = self.commit_locked::<R>(&guard, id, location, prior, events)?;
        drop(guard);
        self.notify::<R>(&committed, id);
        Ok(committed)
    }

    /// Moves an entity's log and snapshot between trees.
    ///
    /// # Errors
    /// Returns `lock_not_held` without the entity's keys, `conflict` if the
    /// destination already holds the entity, or the rename error.
    pub fn relocate_locked(
        &self,
        guard: &MultiLockGuard,
        kind: EntityKind,
        id: &str,
        from: Location,
        to: Location,
    ) -> Result<()> {
        let origin = "writer:relocate";
        Self::require_keys(guard, &[StoreLayout::log_key(kind, id), StoreLayout::snapshot_key(kind, id)])?;
        if from == to {
            return Ok(());
        }
        let pairs = [
            (self.layout.log_path(kind, id, from), self.layout.log_path(kind, id, to)),
            (self.layout.snapshot_path(kind, id, from), self.layout.snapshot_path(kind, id, to)),
        ];
        if pairs.iter().any(|(_, dest)| dest.exists()) {
            return Err(StoreError::conflict(
                "relocate_target_exists",
                format!("{kind} '{id}' already exists in the destination tree"),
                origin,
            ));
        }
        self.layout
            .ensure_entity_dirs(kind, id, to)
            .map_err(storage_err(origin))?;
        for (src, dest) in &pairs {
            if src.exists() {
                durable::rename_durable(src, dest).map_err(storage_err(origin))?;
            }
        }
        debug!(%kind, entity_id = %id, ?from, ?to, "relocated");
        Ok(())
    }

    /// Publishes a commit to listeners and hooks. Call after releasing locks.
    pub fn notify<R: Reducer>(&self, committed: &Committed<R::Snapshot>, id: &str) {
        if committed.events.is_empty() {
            return;
        }
        let snapshot = match committed.snapshot.as_ref().map(serde_json::to_value) {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                warn!(entity_id = %id, error = %e, "snapshot not serializable for notification");
                serde_json::Value::Null
            }
            None => serde_json::Value::Null,
        };
        self.notifier.publish(&CommitNotice {
            kind: R::KIND,
            entity_id: id.to_string(),
            events: committed.events.clone(),
            snapshot,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::notify::{HookDispatcher, ListenerBus};
    use crate::core::task::{TaskReducer, TaskSnapshot, TASK_COMMENTED, TASK_CREATED};
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn write_path(root: &Path, mirror: bool) -> (WritePath, ListenerBus) {
        let layout = StoreLayout::new(root);
        layout.create_dirs().unwrap();
        let bus = ListenerBus::new();
        let notifier = Notifier::new(bus.clone(), HookDispatcher::new(Vec::new(), root, Duration::from_secs(1)));
        let locks = LockManager::new(layout.locks_dir()).with_poll_interval(Duration::from_millis(1));
        (
            WritePath::new(layout, locks, Duration::from_millis(200), mirror, notifier),
            bus,
        )
    }

    fn create(wp: &WritePath, id: &str) -> Committed<TaskSnapshot> {
        wp.transact::<TaskReducer, _>(id, true, |_, _| {
            Ok(vec![Event::new(id, TASK_CREATED, "alice", json!({"title": "x"}))])
        })
        .unwrap()
    }

    fn comment(wp: &WritePath, id: &str, body: &str) -> Committed<TaskSnapshot> {
        wp.transact::<TaskReducer, _>(id, false, |_, _| {
            Ok(vec![Event::new(id, TASK_COMMENTED, "bob", json!({"body": body}))])
        })
        .unwrap()
    }

    #[test]
    fn commit_appends_mirrors_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, _) = write_path(dir.path(), true);
        create(&wp, "t1");
        let done = comment(&wp, "t1", "hello");

        let layout = wp.layout();
        let log = fs::read_to_string(layout.log_path(EntityKind::Task, "t1", Location::Active)).unwrap();
        assert_eq!(log.lines().count(), 2);
        let lifecycle = fs::read_to_string(layout.lifecycle_log_path()).unwrap();
        assert_eq!(lifecycle.lines().count(), 1);
        let global = fs::read_to_string(layout.global_log_path()).unwrap();
        assert_eq!(global, log);

        let snapshot: TaskSnapshot =
            read_snapshot(&layout.snapshot_path(EntityKind::Task, "t1", Location::Active))
                .unwrap()
                .unwrap();
        assert_eq!(Some(snapshot), done.snapshot);
    }

    #[test]
    fn global_log_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, _) = write_path(dir.path(), false);
        create(&wp, "t1");
        assert!(!wp.layout().global_log_path().exists());
        assert_eq!(wp.lock_keys(EntityKind::Task, "t1", false, &[]).len(), 2);
    }

    #[test]
    fn reducer_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, _) = write_path(dir.path(), true);
        let err = wp
            .transact::<TaskReducer, _>("t1", false, |_, _| {
                Ok(vec![Event::new("t1", TASK_COMMENTED, "bob", json!({"body": "orphan"}))])
            })
            .unwrap_err();
        assert_eq!(err.code, "missing_creation");
        assert!(!wp.layout().log_path(EntityKind::Task, "t1", Location::Active).exists());
        assert!(!wp.layout().global_log_path().exists());
    }

    #[test]
    fn stale_snapshot_is_rebuilt_before_folding() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, _) = write_path(dir.path(), false);
        create(&wp, "t1");
        let snapshot_path = wp.layout().snapshot_path(EntityKind::Task, "t1", Location::Active);
        let before_comment = fs::read(&snapshot_path).unwrap();
        comment(&wp, "t1", "first");
        // Simulate a crash after the append but before the snapshot swap.
        fs::write(&snapshot_path, before_comment).unwrap();

        let after = comment(&wp, "t1", "second").snapshot.unwrap();
        assert_eq!(after.comments.len(), 2);
    }

    #[test]
    fn commit_locked_requires_lifecycle_key() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, _) = write_path(dir.path(), false);
        let guard = wp.lock(&wp.lock_keys(EntityKind::Task, "t1", false, &[])).unwrap();
        let err = wp
            .commit_locked::<TaskReducer>(
                &guard,
                "t1",
                Location::Active,
                None,
                vec![Event::new("t1", TASK_CREATED, "a", json!({"title": "x"}))],
            )
            .unwrap_err();
        assert_eq!(err.code, "lock_not_held");
        assert_eq!(err.context.get("lock_key").map(String::as_str), Some(LIFECYCLE_KEY));
    }

    #[test]
    fn listeners_fire_after_commit_only() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, bus) = write_path(dir.path(), false);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.subscribe(Arc::new(move |n: &CommitNotice| {
            counter.fetch_add(n.events.len(), Ordering::SeqCst);
        }));

        create(&wp, "t1");
        wp.transact::<TaskReducer, _>("t1", false, |_, _| Ok(Vec::new())).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn relocate_moves_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, _) = write_path(dir.path(), false);
        create(&wp, "t1");
        let guard = wp.lock(&wp.lock_keys(EntityKind::Task, "t1", false, &[])).unwrap();
        wp.relocate_locked(&guard, EntityKind::Task, "t1", Location::Active, Location::Archived)
            .unwrap();
        drop(guard);

        assert_eq!(wp.locate(EntityKind::Task, "t1"), Some(Location::Archived));
        assert!(!wp.layout().snapshot_path(EntityKind::Task, "t1", Location::Active).exists());
        let after = comment(&wp, "t1", "still works");
        assert_eq!(after.location, Location::Archived);
    }

    #[test]
    fn half_moved_snapshot_follows_its_log() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, _) = write_path(dir.path(), false);
        create(&wp, "t1");
        let layout = wp.layout().clone();
        layout
            .ensure_entity_dirs(EntityKind::Task, "t1", Location::Archived)
            .unwrap();
        fs::rename(
            layout.log_path(EntityKind::Task, "t1", Location::Active),
            layout.log_path(EntityKind::Task, "t1", Location::Archived),
        )
        .unwrap();

        assert_eq!(wp.locate(EntityKind::Task, "t1"), Some(Location::Archived));
        let guard = wp.lock(&wp.lock_keys(EntityKind::Task, "t1", false, &[])).unwrap();
        let location = wp.locate_locked(&guard, EntityKind::Task, "t1").unwrap();
        drop(guard);

        assert_eq!(location, Some(Location::Archived));
        assert!(!layout.snapshot_path(EntityKind::Task, "t1", Location::Active).exists());
        assert!(layout.snapshot_path(EntityKind::Task, "t1", Location::Archived).exists());
        assert_eq!(comment(&wp, "t1", "recovered").location, Location::Archived);
    }

    #[test]
    fn incomplete_tail_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (wp, _) = write_path(dir.path(), false);
        create(&wp, "t1");
        let log = wp.layout().log_path(EntityKind::Task, "t1", Location::Active);
        fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"{\"id\""))
            .unwrap();

        let err = wp
            .transact::<TaskReducer, _>("t1", false, |_, _| {
                Ok(vec![Event::new("t1", TASK_COMMENTED, "bob", json!({"body": "x"}))])
            })
            .unwrap_err();
        assert_eq!(err.code, "incomplete_tail");
    }
}
