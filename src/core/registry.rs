//! Store facade.
//!
//! A [`Registry`] is one handle on one store directory. Handles are cheap to
//! clone and independent handles on the same directory, in this process or
//! another, coordinate through the store's file locks.
//!
//! Task operations live here; leases are reached through
//! [`Registry::leases`], integrity tooling through [`Registry::checker`] and
//! [`Registry::rebuilder`].

use crate::core::config::{RegistryConfig, DEFAULT_PREFIX};
use crate::core::error::{Result, StoreError};
use crate::core::events::{Event, Provenance, EXTENSION_PREFIX};
use crate::core::ids::{new_task_id, validate_entity_id, ShortId};
use crate::core::integrity::{index_from_snapshots, Checker, Rebuilder};
use crate::core::lease::LeaseManager;
use crate::core::notify::{CommitListener, HookDispatcher, ListenerBus, Notifier};
use crate::core::reducer::Reducer;
use crate::core::task::{
    normalize_labels, Archived, Assigned, Commented, Priority, RelationKind, Relationship,
    StatusChanged, TaskCreated, TaskEvent, TaskReducer, TaskSnapshot, TaskStatus, TaskUpdated,
};
use crate::storage::event_store::{read_events, read_filtered, EventFilter};
use crate::storage::index::IdIndex;
use crate::storage::layout::{EntityKind, Location, StoreLayout, INDEX_KEY};
use crate::storage::lock::LockManager;
use crate::storage::writer::{storage_err, Committed, WritePath};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Input for [`Registry::create_task`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    /// Caller-chosen id. Repeating a creation with the same id and payload
    /// is a no-op. A fresh `tsk-…` id is generated when unset.
    pub id: Option<String>,
    /// Short-id counter to draw from, `PREFIX` or `PREFIX-SUB`. Defaults to
    /// the store's primary prefix.
    pub counter: Option<String>,
    pub data: TaskCreated,
}

impl NewTask {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            counter: None,
            data: TaskCreated::new(title),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_counter(mut self, counter: impl Into<String>) -> Self {
        self.counter = Some(counter.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.data.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.data.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.data.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.data.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.data.assignee = Some(assignee.into());
        self
    }

    /// Adds a field the store does not interpret.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.extra.insert(key.into(), value);
        self
    }
}

/// Which tasks [`Registry::list_tasks`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub label: Option<String>,
    /// Also list tasks from the archive tree.
    pub include_archived: bool,
    pub limit: Option<usize>,
}

impl TaskFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn matches(&self, task: &TaskSnapshot) -> bool {
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        if self.priority.is_some_and(|p| p != task.priority) {
            return false;
        }
        if let Some(assignee) = &self.assignee {
            if task.assignee.as_ref() != Some(assignee) {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if !task.labels.contains(label) {
                return false;
            }
        }
        true
    }
}

fn task_event(id: &str, payload: &TaskEvent, actor: &str, origin: &str) -> Result<Event> {
    let kind = payload.kind().unwrap_or_default();
    let data = payload
        .to_data()
        .map_err(|e| StoreError::validation("invalid_payload", e.to_string(), origin))?;
    Ok(Event::new(id, kind, actor, data))
}

fn task_not_found(id: &str, origin: &str) -> StoreError {
    StoreError::not_found("task_not_found", format!("Task '{id}' not found"), origin)
        .with_context("task_id", id)
        .with_hint("List tasks to see available ids")
}

fn require_title(title: &str, origin: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(StoreError::validation(
            "invalid_title",
            "Task title cannot be empty",
            origin,
        )
        .with_hint("Provide a non-empty task title"));
    }
    Ok(())
}

/// Handle on one store.
#[derive(Debug, Clone)]
pub struct Registry {
    config: RegistryConfig,
    writer: WritePath,
    bus: ListenerBus,
}

impl Registry {
    /// Creates the store tree under `root` and writes `config.json` if it is
    /// not there yet. Initialising an existing store only fills in missing
    /// directories.
    ///
    /// # Errors
    /// Returns an error if the tree or config cannot be written.
    pub fn init(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let layout = StoreLayout::new(root);
        layout.create_dirs().map_err(storage_err("registry:init"))?;
        let config = RegistryConfig::load(root)?;
        if !layout.config_path().exists() {
            config.save()?;
        }
        info!(root = %root.display(), "store initialised");
        Self::open_with_config(config)
    }

    /// Creates a store with explicit settings, overwriting `config.json`.
    ///
    /// # Errors
    /// Returns an error if the settings are invalid or cannot be written.
    pub fn init_with_config(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        StoreLayout::new(&config.root)
            .create_dirs()
            .map_err(storage_err("registry:init"))?;
        config.save()?;
        Self::open_with_config(config)
    }

    /// Opens the store at `root`.
    ///
    /// # Errors
    /// Returns `store_not_found` if `root` is not a directory, or a config
    /// error.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(RegistryConfig::load(root.as_ref())?)
    }

    /// Opens the store found from `start`; see [`RegistryConfig::discover`].
    ///
    /// # Errors
    /// Returns `store_not_found` when no store is found.
    pub fn discover(start: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(RegistryConfig::discover(start.as_ref())?)
    }

    /// Opens a store with an already loaded config.
    ///
    /// # Errors
    /// Returns `store_not_found` if the root directory does not exist.
    pub fn open_with_config(config: RegistryConfig) -> Result<Self> {
        if !config.root.is_dir() {
            return Err(StoreError::not_found(
                "store_not_found",
                format!("No store at {}", config.root.display()),
                "registry:open",
            )
            .with_hint("Initialise a store first"));
        }
        let layout = StoreLayout::new(&config.root);
        let locks = LockManager::new(layout.locks_dir()).with_poll_interval(config.lock_poll_interval());
        let bus = ListenerBus::new();
        let hooks = HookDispatcher::new(
            config.settings.hooks.clone(),
            &config.root,
            config.hook_timeout(),
        );
        let writer = WritePath::new(
            layout,
            locks,
            config.lock_timeout(),
            config.settings.mirror_global_log,
            Notifier::new(bus.clone(), hooks),
        );
        debug!(root = %config.root.display(), "store opened");
        Ok(Self { config, writer, bus })
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn layout(&self) -> &StoreLayout {
        self.writer.layout()
    }

    /// Registers a listener for every commit made through this handle and
    /// its clones.
    pub fn subscribe(&self, listener: Arc<dyn CommitListener>) {
        self.bus.subscribe(listener);
    }

    #[must_use]
    pub fn leases(&self) -> LeaseManager {
        LeaseManager::new(self.writer.clone())
    }

    #[must_use]
    pub fn checker(&self) -> Checker {
        Checker::new(self.writer.clone())
    }

    #[must_use]
    pub fn rebuilder(&self) -> Rebuilder {
        Rebuilder::new(self.writer.clone())
    }

    /// Loads the short-id index. A missing `index.json` is rebuilt from the
    /// task snapshots so that issued numbers are never handed out again.
    fn load_index(&self, origin: &str) -> Result<IdIndex> {
        let path = self.layout().index_path();
        if path.is_file() {
            return IdIndex::load(&path, self.config.settings.prefix.as_deref()).map_err(storage_err(origin));
        }
        let index = index_from_snapshots(&self.writer)?;
        if !index.short_ids.is_empty() {
            warn!(short_ids = index.short_ids.len(), "index.json missing; rebuilt from task snapshots");
        }
        Ok(index)
    }

    fn counter_key(&self, requested: Option<&str>, index: &IdIndex) -> String {
        requested
            .map(str::to_string)
            .or_else(|| self.config.settings.prefix.clone())
            .or_else(|| index.infer_primary())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string())
    }

    /// Creates a task and gives it the next short id.
    ///
    /// The short id is drawn under the `index` lock inside the creation's
    /// own lock scope. With a caller id that already exists, an identical
    /// creation returns the stored task and writes nothing.
    ///
    /// # Errors
    /// - `invalid_title`, `invalid_id` or `invalid_prefix` for bad input;
    /// - `creation_mismatch` when the id exists with a different payload;
    /// - lock timeouts and storage errors.
    pub fn create_task(&self, new: NewTask, actor: &str) -> Result<TaskSnapshot> {
        let origin = "registry:create_task";
        require_title(&new.data.title, origin)?;
        let id = match new.id {
            Some(id) => {
                validate_entity_id(&id, origin)?;
                id
            }
            None => new_task_id(),
        };
        let mut data = new.data;
        data.short_id = None;

        let keys = self.writer.lock_keys(EntityKind::Task, &id, true, &[INDEX_KEY]);
        let guard = self.writer.lock(&keys)?;
        let location = self
            .writer
            .locate_locked(&guard, EntityKind::Task, &id)?
            .unwrap_or(Location::Active);

        if let Some(existing) = self.writer.load_locked::<TaskReducer>(&guard, &id, location)? {
            let log = self.layout().log_path(EntityKind::Task, &id, location);
            let first = read_events(&log).map_err(storage_err(origin))?.into_iter().next();
            let original = match first.as_ref().map(TaskEvent::decode) {
                Some(Ok(TaskEvent::Created(mut created))) => {
                    created.short_id = None;
                    Some(created)
                }
                _ => None,
            };
            if original.as_ref() == Some(&data) {
                debug!(task_id = %id, "identical creation; returning existing task");
                return Ok(existing);
            }
            return Err(StoreError::conflict(
                "creation_mismatch",
                format!("Task '{id}' already exists with a different payload"),
                origin,
            )
            .with_context("task_id", id.as_str()));
        }

        let index_path = self.layout().index_path();
        let mut index = self.load_index(origin)?;
        let counter = self.counter_key(new.counter.as_deref(), &index);
        let Some(short) = index.allocate(&counter, &id) else {
            return Err(StoreError::validation(
                "invalid_prefix",
                format!("'{counter}' is not a valid short-id counter"),
                origin,
            )
            .with_context("counter", counter));
        };
        data.short_id = Some(short.to_string());
        let event = task_event(&id, &TaskEvent::Created(data), actor, origin)?;

        // Validate in memory before burning the number.
        TaskReducer::apply(None, &event).map_err(|e| StoreError::from_reduce(&e, origin))?;
        index.save(&index_path).map_err(storage_err(origin))?;
        let committed = self
            .writer
            .commit_locked::<TaskReducer>(&guard, &id, location, None, vec![event])?;
        drop(guard);

        self.writer.notify::<TaskReducer>(&committed, &id);
        info!(task_id = %id, short_id = %short, "task created");
        committed.snapshot.ok_or_else(|| task_not_found(&id, origin))
    }


    /// Runs `decide` against an existing task under its locks and commits
    /// the events it returns.
    fn write_task<F>(&self, id_or_short: &str, actor: &str, origin: &str, decide: F) -> Result<TaskSnapshot>
    where
        F: FnOnce(&TaskSnapshot) -> Result<Vec<TaskEvent>>,
    {
        let id = self.resolve_id(id_or_short)?;
        let committed = self.writer.transact::<TaskReducer, _>(&id, false, |_, prior| {
            let task = prior.ok_or_else(|| task_not_found(&id, origin))?;
            decide(task)?
                .iter()
                .map(|payload| task_event(&id, payload, actor, origin))
                .collect()
        })?;
        committed.snapshot.ok_or_else(|| task_not_found(&id, origin))
    }

    /// Applies a partial update. Fields equal to the current values are
    /// dropped; if nothing is left, no event is written.
    ///
    /// # Errors
    /// Returns `empty_update`, `invalid_title`, `task_not_found`, or a write
    /// error.
    pub fn update_task(&self, id_or_short: &str, change: TaskUpdated, actor: &str) -> Result<TaskSnapshot> {
        let origin = "registry:update_task";
        if change.is_empty() {
            return Err(StoreError::validation("empty_update", "Nothing to update", origin));
        }
        if let Some(title) = &change.title {
            require_title(title, origin)?;
        }
        self.write_task(id_or_short, actor, origin, |task| {
            let mut change = change;
            if change.title.as_ref() == Some(&task.title) {
                change.title = None;
            }
            if change.description.as_ref() == Some(&task.description) {
                change.description = None;
            }
            if change.priority == Some(task.priority) {
                change.priority = None;
            }
            if change
                .labels
                .as_ref()
                .is_some_and(|labels| normalize_labels(labels) == task.labels)
            {
                change.labels = None;
            }
            change.extra.retain(|key, value| match task.extra.get(key) {
                Some(current) => current != value,
                None => !value.is_null(),
            });
            Ok(if change.is_empty() {
                Vec::new()
            } else {
                vec![TaskEvent::Updated(change)]
            })
        })
    }

    /// Moves a task to `to`.
    ///
    /// The check runs under the task's lock, so of two racing transitions
    /// to the same status exactly one is recorded.
    ///
    /// # Errors
    /// Returns `invalid_transition` when the move is not allowed from the
    /// current status, `task_not_found`, or a write error.
    pub fn transition(
        &self,
        id_or_short: &str,
        to: TaskStatus,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        let origin = "registry:transition";
        self.write_task(id_or_short, actor, origin, |task| {
            if !task.status.can_transition_to(to) {
                return Err(StoreError::invalid_transition(
                    "invalid_transition",
                    format!("Task '{}' cannot move from {} to {to}", task.id, task.status),
                    origin,
                )
                .with_context("from", task.status.as_str())
                .with_context("to", to.as_str()));
            }
            Ok(vec![TaskEvent::StatusChanged(StatusChanged {
                from: Some(task.status),
                to,
                reason: reason.map(str::to_string),
            })])
        })
    }

    /// Sets or clears the assignee. Assigning the current assignee writes
    /// nothing.
    ///
    /// # Errors
    /// Returns `invalid_assignee` for a blank name, `task_not_found`, or a
    /// write error.
    pub fn assign(&self, id_or_short: &str, assignee: Option<&str>, actor: &str) -> Result<TaskSnapshot> {
        let origin = "registry:assign";
        if assignee.is_some_and(|a| a.trim().is_empty()) {
            return Err(StoreError::validation("invalid_assignee", "Assignee cannot be blank", origin));
        }
        self.write_task(id_or_short, actor, origin, |task| {
            if task.assignee.as_deref() == assignee {
                return Ok(Vec::new());
            }
            Ok(vec![TaskEvent::Assigned(Assigned {
                assignee: assignee.map(str::to_string),
            })])
        })
    }

    /// Appends a comment.
    ///
    /// # Errors
    /// Returns `empty_comment`, `task_not_found`, or a write error.
    pub fn comment(&self, id_or_short: &str, body: &str, actor: &str) -> Result<TaskSnapshot> {
        let origin = "registry:comment";
        if body.trim().is_empty() {
            return Err(StoreError::validation("empty_comment", "Comment cannot be empty", origin));
        }
        self.write_task(id_or_short, actor, origin, |_| {
            Ok(vec![TaskEvent::Commented(Commented {
                body: body.to_string(),
            })])
        })
    }

    /// Adds a directed edge from one task to another.
    ///
    /// # Errors
    /// Returns `self_loop`, `task_not_found` for either end, or
    /// `duplicate_relationship` when the edge exists.
    pub fn add_relationship(
        &self,
        id_or_short: &str,
        kind: RelationKind,
        target: &str,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        let origin = "registry:add_relationship";
        let id = self.resolve_id(id_or_short)?;
        let target = self.resolve_id(target)?;
        if id == target {
            return Err(StoreError::validation(
                "self_loop",
                format!("Task '{id}' cannot {kind} itself"),
                origin,
            ));
        }
        if self.writer.locate(EntityKind::Task, &target).is_none() {
            return Err(task_not_found(&target, origin));
        }
        self.write_task(&id, actor, origin, |task| {
            if task.has_relationship(kind, &target) {
                return Err(StoreError::conflict(
                    "duplicate_relationship",
                    format!("Task '{id}' already {kind} '{target}'"),
                    origin,
                )
                .with_context("target", target.as_str()));
            }
            Ok(vec![TaskEvent::RelationshipAdded(Relationship {
                kind,
                target: target.clone(),
            })])
        })
    }

    /// Removes an edge.
    ///
    /// # Errors
    /// Returns `relationship_not_found` when the edge does not exist.
    pub fn remove_relationship(
        &self,
        id_or_short: &str,
        kind: RelationKind,
        target: &str,
        actor: &str,
    ) -> Result<TaskSnapshot> {
        let origin = "registry:remove_relationship";
        let target = self.resolve_id(target)?;
        self.write_task(id_or_short, actor, origin, |task| {
            if !task.has_relationship(kind, &target) {
                return Err(StoreError::not_found(
                    "relationship_not_found",
                    format!("Task '{}' has no {kind} edge to '{target}'", task.id),
                    origin,
                ));
            }
            Ok(vec![TaskEvent::RelationshipRemoved(Relationship {
                kind,
                target: target.clone(),
            })])
        })
    }

    /// Records an `ext.*` event on a task. The store keeps it in the log
    /// without changing task fields.
    ///
    /// # Errors
    /// Returns `invalid_event_type` unless `event_type` starts with `ext.`,
    /// or the usual write errors.
    pub fn record_extension(
        &self,
        id_or_short: &str,
        event_type: &str,
        data: Value,
        provenance: Option<Provenance>,
        actor: &str,
    ) -> Result<Event> {
        let origin = "registry:record_extension";
        if !event_type.starts_with(EXTENSION_PREFIX) || event_type.len() == EXTENSION_PREFIX.len() {
            return Err(StoreError::validation(
                "invalid_event_type",
                format!("'{event_type}' is not in the {EXTENSION_PREFIX}* namespace"),
                origin,
            ));
        }
        let id = self.resolve_id(id_or_short)?;
        let committed = self.writer.transact::<TaskReducer, _>(&id, false, |_, prior| {
            if prior.is_none() {
                return Err(task_not_found(&id, origin));
            }
            let mut event = Event::new(id.as_str(), event_type, actor, data);
            if let Some(provenance) = provenance {
                event = event.with_provenance(provenance);
            }
            Ok(vec![event])
        })?;
        committed
            .events
            .into_iter()
            .next()
            .ok_or_else(|| task_not_found(&id, origin))
    }

    /// Records the archive event and moves the task into the archive tree.
    ///
    /// # Errors
    /// Returns `already_archived`, `task_not_found`, or a write error.
    pub fn archive(&self, id_or_short: &str, reason: Option<&str>, actor: &str) -> Result<TaskSnapshot> {
        let origin = "registry:archive";
        let id = self.resolve_id(id_or_short)?;
        let guard = self.writer.lock(&self.writer.lock_keys(EntityKind::Task, &id, true, &[]))?;
        let location = self
            .writer
            .locate_locked(&guard, EntityKind::Task, &id)?
            .ok_or_else(|| task_not_found(&id, origin))?;
        let prior = self
            .writer
            .load_locked::<TaskReducer>(&guard, &id, location)?
            .ok_or_else(|| task_not_found(&id, origin))?;
        if location == Location::Archived {
            return Err(StoreError::conflict(
                "already_archived",
                format!("Task '{id}' is already archived"),
                origin,
            ));
        }
        let committed = if prior.is_archived() {
            // An earlier archive stopped before moving the files.
            Committed {
                snapshot: Some(prior),
                events: Vec::new(),
                location,
            }
        } else {
            let event = task_event(
                &id,
                &TaskEvent::Archived(Archived {
                    reason: reason.map(str::to_string),
                }),
                actor,
                origin,
            )?;
            self.writer
                .commit_locked::<TaskReducer>(&guard, &id, location, Some(prior), vec![event])?
        };
        self.writer
            .relocate_locked(&guard, EntityKind::Task, &id, Location::Active, Location::Archived)?;
        drop(guard);

        self.writer.notify::<TaskReducer>(&committed, &id);
        info!(task_id = %id, "task archived");
        committed.snapshot.ok_or_else(|| task_not_found(&id, origin))
    }

    /// Records the unarchive event and moves the task back to the active
    /// tree.
    ///
    /// # Errors
    /// Returns `not_archived`, `task_not_found`, or a write error.
    pub fn unarchive(&self, id_or_short: &str, actor: &str) -> Result<TaskSnapshot> {
        let origin = "registry:unarchive";
        let id = self.resolve_id(id_or_short)?;
        let guard = self.writer.lock(&self.writer.lock_keys(EntityKind::Task, &id, true, &[]))?;
        let location = self
            .writer
            .locate_locked(&guard, EntityKind::Task, &id)?
            .ok_or_else(|| task_not_found(&id, origin))?;
        let prior = self
            .writer
            .load_locked::<TaskReducer>(&guard, &id, location)?
            .ok_or_else(|| task_not_found(&id, origin))?;
        if location == Location::Active && !prior.is_archived() {
            return Err(StoreError::conflict(
                "not_archived",
                format!("Task '{id}' is not archived"),
                origin,
            ));
        }
        let committed = if prior.is_archived() {
            let event = task_event(&id, &TaskEvent::Unarchived, actor, origin)?;
            self.writer
                .commit_locked::<TaskReducer>(&guard, &id, location, Some(prior), vec![event])?
        } else {
            // An earlier unarchive stopped before moving the files.
            Committed {
                snapshot: Some(prior),
                events: Vec::new(),
                location,
            }
        };
        if location == Location::Archived {
            self.writer
                .relocate_locked(&guard, EntityKind::Task, &id, Location::Archived, Location::Active)?;
        }
        drop(guard);

        self.writer.notify::<TaskReducer>(&committed, &id);
        info!(task_id = %id, "task unarchived");
        committed.snapshot.ok_or_else(|| task_not_found(&id, origin))
    }

    /// Turns a short id into the task id it aliases. Anything that is not a
    /// known short id is treated as a task id.
    ///
    /// # Errors
    /// Returns `invalid_id` when the input is neither, or an index read error.
    pub fn resolve_id(&self, id_or_short: &str) -> Result<String> {
        let origin = "registry:resolve_id";
        if ShortId::parse(id_or_short).is_some() {
            let index = self.load_index(origin)?;
            if let Some(id) = index.resolve(id_or_short) {
                return Ok(id.to_string());
            }
        }
        validate_entity_id(id_or_short, origin)?;
        Ok(id_or_short.to_string())
    }

    /// Reads a task from either tree without locking.
    ///
    /// # Errors
    /// Returns `invalid_id` or a read error.
    pub fn find_task(&self, id_or_short: &str) -> Result<Option<TaskSnapshot>> {
        let id = self.resolve_id(id_or_short)?;
        match self.writer.locate(EntityKind::Task, &id) {
            Some(location) => self.writer.read_current::<TaskReducer>(&id, location),
            None => Ok(None),
        }
    }

    /// Like [`Registry::find_task`], failing when the task does not exist.
    ///
    /// # Errors
    /// Returns `task_not_found`, `invalid_id` or a read error.
    pub fn get_task(&self, id_or_short: &str) -> Result<TaskSnapshot> {
        self.find_task(id_or_short)?
            .ok_or_else(|| task_not_found(id_or_short, "registry:get_task"))
    }

    /// Lists tasks matching `filter`, oldest first.
    ///
    /// # Errors
    /// Returns a read error if a task's files are damaged.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskSnapshot>> {
        let origin = "registry:list_tasks";
        let mut locations = vec![Location::Active];
        if filter.include_archived {
            locations.push(Location::Archived);
        }
        let mut tasks = Vec::new();
        for location in locations {
            let ids = self
                .layout()
                .entity_ids(EntityKind::Task, location)
                .map_err(storage_err(origin))?;
            for id in ids {
                if let Some(task) = self.writer.read_current::<TaskReducer>(&id, location)? {
                    if filter.matches(&task) {
                        tasks.push(task);
                    }
                }
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    /// Events of one task in log order.
    ///
    /// # Errors
    /// Returns `task_not_found` or a read error.
    pub fn task_history(&self, id_or_short: &str, filter: &EventFilter) -> Result<Vec<Event>> {
        let origin = "registry:task_history";
        let id = self.resolve_id(id_or_short)?;
        let location = self
            .writer
            .locate(EntityKind::Task, &id)
            .ok_or_else(|| task_not_found(&id, origin))?;
        read_filtered(&self.layout().log_path(EntityKind::Task, &id, location), filter)
            .map_err(storage_err(origin))
    }

    /// Events of one resource in log order.
    ///
    /// # Errors
    /// Returns `invalid_id` or a read error.
    pub fn resource_history(&self, name: &str, filter: &EventFilter) -> Result<Vec<Event>> {
        let origin = "registry:resource_history";
        validate_entity_id(name, origin)?;
        read_filtered(
            &self.layout().log_path(EntityKind::Resource, name, Location::Active),
            filter,
        )
        .map_err(storage_err(origin))
    }

    /// Scans the merged lifecycle log.
    ///
    /// # Errors
    /// Returns a read error if the log is damaged.
    pub fn lifecycle_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        read_filtered(&self.layout().lifecycle_log_path(), filter)
            .map_err(storage_err("registry:lifecycle_events"))
    }

    /// Scans the merged log of every event. Empty when mirroring is off.
    ///
    /// # Errors
    /// Returns a read error if the log is damaged.
    pub fn global_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        read_filtered(&self.layout().global_log_path(), filter)
            .map_err(storage_err("registry:global_events"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorCategory;
    use crate::core::notify::CommitNotice;
    use crate::core::task::{TASK_ARCHIVED, TASK_STATUS_CHANGED};
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::init(dir.path().join(".tasklog")).unwrap();
        (dir, registry)
    }

    #[test]
    fn create_assigns_sequential_short_ids() {
        let (_dir, registry) = store();
        let a = registry.create_task(NewTask::new("First"), "alice").unwrap();
        let b = registry.create_task(NewTask::new("Second"), "alice").unwrap();
        let c = registry
            .create_task(NewTask::new("Third").with_counter("TASK-UI"), "alice")
            .unwrap();

        assert_eq!(a.short_id.as_deref(), Some("TASK-1"));
        assert_eq!(b.short_id.as_deref(), Some("TASK-2"));
        assert_eq!(c.short_id.as_deref(), Some("TASK-UI-1"));
        assert_eq!(registry.get_task("TASK-2").unwrap().id, b.id);
        assert!(a.id.starts_with("tsk-"));
    }

    #[test]
    fn identical_creation_is_idempotent() {
        let (_dir, registry) = store();
        let new = NewTask::new("Deploy").with_id("deploy-1").with_labels(["ops"]);
        let first = registry.create_task(new.clone(), "alice").unwrap();
        let second = registry.create_task(new, "alice").unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.task_history("deploy-1", &EventFilter::all()).unwrap().len(), 1);

        let err = registry
            .create_task(NewTask::new("Other").with_id("deploy-1"), "alice")
            .unwrap_err();
        assert_eq!(err.code, "creation_mismatch");
        assert_eq!(err.category, ErrorCategory::Conflict);
    }

    #[test]
    fn blank_title_and_bad_counter_are_rejected() {
        let (_dir, registry) = store();
        assert_eq!(registry.create_task(NewTask::new("  "), "a").unwrap_err().code, "invalid_title");
        let err = registry
            .create_task(NewTask::new("x").with_counter("lower"), "a")
            .unwrap_err();
        assert_eq!(err.code, "invalid_prefix");
        assert!(registry.list_tasks(&TaskFilter::all()).unwrap().is_empty());
    }

    #[test]
    fn transitions_follow_the_status_rules() {
        let (_dir, registry) = store();
        let task = registry.create_task(NewTask::new("T"), "alice").unwrap();
        registry.transition(&task.id, TaskStatus::InProgress, None, "alice").unwrap();
        let done = registry.transition(&task.id, TaskStatus::Done, Some("shipped"), "alice").unwrap();
        assert!(done.closed_at.is_some());

        let err = registry.transition(&task.id, TaskStatus::Done, None, "bob").unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidTransition);
        let err = registry.transition(&task.id, TaskStatus::Review, None, "bob").unwrap_err();
        assert_eq!(err.context.get("from").map(String::as_str), Some("done"));

        let reopened = registry.transition(&task.id, TaskStatus::Todo, None, "bob").unwrap();
        assert!(reopened.closed_at.is_none());
        let changes = registry
            .task_history(&task.id, &EventFilter::for_kind(TASK_STATUS_CHANGED))
            .unwrap();
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn unchanged_update_writes_nothing() {
        let (_dir, registry) = store();
        let task = registry
            .create_task(NewTask::new("T").with_labels(["b", "a"]).with_field("team", json!("core")), "a")
            .unwrap();
        let same = TaskUpdated {
            title: Some("T".to_string()),
            labels: Some(vec!["a".to_string(), "b".to_string()]),
            extra: Map::from_iter([("team".to_string(), json!("core"))]),
            ..Default::default()
        };
        registry.update_task(&task.id, same, "a").unwrap();
        assert_eq!(registry.task_history(&task.id, &EventFilter::all()).unwrap().len(), 1);

        let changed = registry
            .update_task(
                &task.id,
                TaskUpdated {
                    extra: Map::from_iter([("team".to_string(), Value::Null)]),
                    priority: Some(Priority::Urgent),
                    ..Default::default()
                },
                "a",
            )
            .unwrap();
        assert_eq!(changed.priority, Priority::Urgent);
        assert!(!changed.extra.contains_key("team"));
        assert_eq!(
            registry.update_task(&task.id, TaskUpdated::default(), "a").unwrap_err().code,
            "empty_update"
        );
    }

    #[test]
    fn relationships_are_validated() {
        let (_dir, registry) = store();
        let a = registry.create_task(NewTask::new("A"), "x").unwrap();
        let b = registry.create_task(NewTask::new("B"), "x").unwrap();

        let linked = registry.add_relationship(&a.id, RelationKind::Blocks, "TASK-2", "x").unwrap();
        assert!(linked.has_relationship(RelationKind::Blocks, &b.id));
        assert_eq!(
            registry.add_relationship(&a.id, RelationKind::Blocks, &b.id, "x").unwrap_err().code,
            "duplicate_relationship"
        );
        assert_eq!(
            registry.add_relationship(&a.id, RelationKind::Blocks, &a.id, "x").unwrap_err().code,
            "self_loop"
        );
        assert_eq!(
            registry.add_relationship(&a.id, RelationKind::Blocks, "nope", "x").unwrap_err().code,
            "task_not_found"
        );

        let unlinked = registry.remove_relationship(&a.id, RelationKind::Blocks, &b.id, "x").unwrap();
        assert!(unlinked.relationships.is_empty());
        assert_eq!(
            registry.remove_relationship(&a.id, RelationKind::Blocks, &b.id, "x").unwrap_err().code,
            "relationship_not_found"
        );
    }

    #[test]
    fn archive_round_trip() {
        let (_dir, registry) = store();
        let task = registry.create_task(NewTask::new("Old"), "x").unwrap();
        let archived = registry.archive(&task.id, Some("stale"), "x").unwrap();
        assert!(archived.is_archived());
        assert_eq!(
            registry.archive(&task.id, None, "x").unwrap_err().code,
            "already_archived"
        );
        assert!(registry.list_tasks(&TaskFilter::all()).unwrap().is_empty());
        let all = TaskFilter {
            include_archived: true,
            ..TaskFilter::default()
        };
        assert_eq!(registry.list_tasks(&all).unwrap().len(), 1);

        let restored = registry.unarchive("TASK-1", "x").unwrap();
        assert!(!restored.is_archived());
        assert_eq!(registry.unarchive(&task.id, "x").unwrap_err().code, "not_archived");

        let lifecycle = registry.lifecycle_events(&EventFilter::all()).unwrap();
        let kinds: Vec<&str> = lifecycle.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["task.created", TASK_ARCHIVED, "task.unarchived"]);
    }

    #[test]
    fn assign_and_comment() {
        let (_dir, registry) = store();
        let task = registry.create_task(NewTask::new("T"), "x").unwrap();
        let assigned = registry.assign(&task.id, Some("bob"), "x").unwrap();
        assert_eq!(assigned.assignee.as_deref(), Some("bob"));
        registry.assign(&task.id, Some("bob"), "x").unwrap();
        let cleared = registry.assign(&task.id, None, "x").unwrap();
        assert!(cleared.assignee.is_none());

        let commented = registry.comment(&task.id, "looks good", "carol").unwrap();
        assert_eq!(commented.comments[0].actor, "carol");
        assert_eq!(registry.comment(&task.id, " ", "carol").unwrap_err().code, "empty_comment");
        assert_eq!(registry.task_history(&task.id, &EventFilter::all()).unwrap().len(), 4);
    }

    #[test]
    fn extension_events_are_kept_without_changing_fields() {
        let (_dir, registry) = store();
        let task = registry.create_task(NewTask::new("T"), "x").unwrap();
        let event = registry
            .record_extension(
                &task.id,
                "ext.sync.peer_seen",
                json!({"peer": "laptop"}),
                Some(Provenance::new("sync")),
                "bridge",
            )
            .unwrap();
        assert_eq!(event.provenance.as_ref().map(|p| p.source.as_str()), Some("sync"));
        let after = registry.get_task(&task.id).unwrap();
        assert_eq!(after.title, "T");
        assert_eq!(after.last_event_id, event.id);
        assert!(registry
            .record_extension(&task.id, "task.hacked", json!({}), None, "x")
            .is_err());
    }

    #[test]
    fn listeners_see_commits_from_the_handle() {
        let (_dir, registry) = store();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        registry.subscribe(Arc::new(move |notice: &CommitNotice| {
            counter.fetch_add(notice.events.len(), Ordering::SeqCst);
        }));

        let task = registry.create_task(NewTask::new("T"), "x").unwrap();
        registry.comment(&task.id, "hi", "x").unwrap();
        registry.assign(&task.id, None, "x").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn open_requires_an_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        let err = Registry::open(dir.path().join("missing")).unwrap_err();
        assert_eq!(err.code, "store_not_found");

        let root = dir.path().join(".tasklog");
        Registry::init(&root).unwrap();
        assert!(root.join("config.json").is_file());
        let nested = dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        let found = Registry::discover(&nested).unwrap();
        assert_eq!(found.config().root, root);
    }
}
