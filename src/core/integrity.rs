//! Integrity checking and rebuild.
//!
//! The [`Checker`] compares every snapshot against the log it was derived
//! from, plus the cross-entity structures (relationships, short-id index,
//! merged logs). It only writes in fix mode, and then only to drop the
//! incomplete final segment of a log.
//!
//! The [`Rebuilder`] regenerates derived files from the per-entity logs.
//! Output goes through the same canonical encoders as the write path, so a
//! rebuilt file is byte-identical to one produced incrementally.

use crate::core::error::{Result, StoreError};
use crate::core::events::{Event, EventId};
use crate::core::ids::{is_valid_entity_id, ShortId};
use crate::core::reducer::{replay, EntitySnapshot, Reducer};
use crate::core::resource::ResourceReducer;
use crate::core::task::{TaskReducer, TaskSnapshot};
use crate::storage::event_store::{scan_log, LogScan};
use crate::storage::index::IdIndex;
use crate::storage::layout::{
    EntityKind, Location, StoreLayout, GLOBAL_KEY, INDEX_KEY, LIFECYCLE_KEY,
};
use crate::storage::writer::{read_snapshot, storage_err, write_snapshot, WritePath};
use crate::storage::{durable, StorageError};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOCATIONS: [Location; 2] = [Location::Active, Location::Archived];
const KINDS: [EntityKind; 2] = [EntityKind::Task, EntityKind::Resource];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// Name of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    SnapshotParse,
    LogParse,
    TruncatedLine,
    MissingCreation,
    DuplicateEvent,
    Drift,
    ReplayMismatch,
    MissingSnapshot,
    OrphanSnapshot,
    DanglingEdge,
    SelfLoop,
    DuplicateEdge,
    MalformedId,
    Index,
    LifecycleLog,
    GlobalLog,
}

impl Check {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SnapshotParse => "snapshot_parse",
            Self::LogParse => "log_parse",
            Self::TruncatedLine => "truncated_line",
            Self::MissingCreation => "missing_creation",
            Self::DuplicateEvent => "duplicate_event",
            Self::Drift => "drift",
            Self::ReplayMismatch => "replay_mismatch",
            Self::MissingSnapshot => "missing_snapshot",
            Self::OrphanSnapshot => "orphan_snapshot",
            Self::DanglingEdge => "dangling_edge",
            Self::SelfLoop => "self_loop",
            Self::DuplicateEdge => "duplicate_edge",
            Self::MalformedId => "malformed_id",
            Self::Index => "index",
            Self::LifecycleLog => "lifecycle_log",
            Self::GlobalLog => "global_log",
        }
    }
}

impl std::fmt::Display for Check {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem found by the checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub check: Check,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntityKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub message: String,
}

impl Finding {
    fn new(severity: Severity, check: Check, entity: Option<(EntityKind, &str)>, message: String) -> Self {
        Self {
            severity,
            check,
            kind: entity.map(|(kind, _)| kind),
            entity_id: entity.map(|(_, id)| id.to_string()),
            message,
        }
    }
}

/// A change made in fix mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repair {
    pub check: Check,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub dropped_bytes: usize,
}

/// Result of a full check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub repairs: Vec<Repair>,
    /// Entities examined, both trees included.
    pub entities: usize,
}

impl Report {
    /// True when no finding is an error.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    #[must_use]
    pub fn count(&self, check: Check) -> usize {
        self.findings.iter().filter(|f| f.check == check).count()
    }

    fn error(&mut self, check: Check, entity: Option<(EntityKind, &str)>, message: String) {
        self.findings.push(Finding::new(Severity::Error, check, entity, message));
    }

    fn warning(&mut self, check: Check, entity: Option<(EntityKind, &str)>, message: String) {
        self.findings.push(Finding::new(Severity::Warning, check, entity, message));
    }
}

/// What the checker learned about one entity, kept for cross checks.
struct Examined<S> {
    id: String,
    snapshot: Option<S>,
    events: Vec<Event>,
}

fn is_lifecycle(kind: EntityKind, event_type: &str) -> bool {
    match kind {
        EntityKind::Task => TaskReducer::is_lifecycle(event_type),
        EntityKind::Resource => ResourceReducer::is_lifecycle(event_type),
    }
}

/// Read-only consistency checks over a whole store.
#[derive(Debug, Clone)]
pub struct Checker {
    writer: WritePath,
}

impl Checker {
    #[must_use]
    pub fn new(writer: WritePath) -> Self {
        Self { writer }
    }

    /// Runs every check. With `fix`, incomplete log tails are dropped under
    /// the owning log's lock and listed in [`Report::repairs`]; the finding
    /// itself is still reported.
    ///
    /// # Errors
    /// Returns an error only when a file cannot be read at all, or a lock
    /// cannot be taken in fix mode. Damaged content becomes findings.
    pub fn check(&self, fix: bool) -> Result<Report> {
        let mut report = Report::default();
        let tasks = self.check_family::<TaskReducer>(&mut report, fix)?;
        let resources = self.check_family::<ResourceReducer>(&mut report, fix)?;

        check_edges(&mut report, &tasks);
        self.check_index(&mut report, &tasks);

        let mut lifecycle = BTreeSet::new();
        let mut global = BTreeSet::new();
        let all = tasks
            .iter()
            .map(|t| (EntityKind::Task, &t.events))
            .chain(resources.iter().map(|r| (EntityKind::Resource, &r.events)));
        for (kind, events) in all {
            for event in events {
                if is_lifecycle(kind, &event.kind) {
                    lifecycle.insert(event.id.clone());
                }
                global.insert(event.id.clone());
            }
        }
        let layout = self.writer.layout();
        self.check_merged(
            &mut report,
            Check::LifecycleLog,
            LIFECYCLE_KEY,
            &layout.lifecycle_log_path(),
            &lifecycle,
            fix,
        )?;
        let global_path = layout.global_log_path();
        if self.writer.mirrors_global() || global_path.exists() {
            self.check_merged(&mut report, Check::GlobalLog, GLOBAL_KEY, &global_path, &global, fix)?;
        }

        info!(
            entities = report.entities,
            errors = report.errors().count(),
            warnings = report.warnings().count(),
            repairs = report.repairs.len(),
            "integrity check finished"
        );
        Ok(report)
    }

    fn check_family<R: Reducer>(&self, report: &mut Report, fix: bool) -> Result<Vec<Examined<R::Snapshot>>> {
        let mut examined = Vec::new();
        for location in LOCATIONS {
            let ids = self
                .writer
                .layout()
                .entity_ids(R::KIND, location)
                .map_err(storage_err("integrity:check"))?;
            for id in ids {
                examined.push(self.check_entity::<R>(report, &id, location, fix)?);
            }
        }
        Ok(examined)
    }

    fn check_entity<R: Reducer>(
        &self,
        report: &mut Report,
        id: &str,
        location: Location,
        fix: bool,
    ) -> Result<Examined<R::Snapshot>> {
        let kind = R::KIND;
        let entity = Some((kind, id));
        let layout = self.writer.layout();
        let log_path = layout.log_path(kind, id, location);
        let snapshot_path = layout.snapshot_path(kind, id, location);
        report.entities += 1;

        if !is_valid_entity_id(id) {
            report.error(Check::MalformedId, entity, format!("'{id}' is not a valid {kind} id"));
        }

        let scan = scan_log(&log_path).map_err(storage_err("integrity:check"))?;
        if let Some(tail) = &scan.truncated {
            report.error(
                Check::TruncatedLine,
                entity,
                format!("line {} has no newline terminator ({} bytes)", tail.line, tail.bytes),
            );
            if fix {
                self.repair_tail(report, &StoreLayout::log_key(kind, id), &log_path, Some(id))?;
            }
        }
        let mut consistent = scan.is_clean();
        for bad in &scan.malformed {
            report.error(Check::LogParse, entity, format!("line {}: {}", bad.line, bad.reason));
        }
        let mut seen = HashSet::new();
        for (line, event) in &scan.events {
            if event.entity_id != id {
                consistent = false;
                report.error(
                    Check::LogParse,
                    entity,
                    format!("line {line}: event {} belongs to '{}'", event.id, event.entity_id),
                );
            }
            if !event.id.is_well_formed() {
                report.error(Check::MalformedId, entity, format!("line {line}: malformed event id '{}'", event.id));
            }
            if !seen.insert(&event.id) {
                consistent = false;
                report.error(Check::DuplicateEvent, entity, format!("line {line}: event {} repeats", event.id));
            }
        }
        let events: Vec<Event> = scan.iter_events().cloned().collect();
        if let Some(first) = events.first() {
            if !R::is_creation(&first.kind) {
                consistent = false;
                report.error(
                    Check::MissingCreation,
                    entity,
                    format!("log starts with '{}' instead of a creation event", first.kind),
                );
            }
        }

        let snapshot = match read_snapshot::<R::Snapshot>(&snapshot_path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                report.error(Check::SnapshotParse, entity, e.to_string());
                None
            }
        };
        let replayed = if consistent && !events.is_empty() {
            match replay::<R>(&events) {
                Ok(state) => state,
                Err(e) => {
                    report.error(Check::LogParse, entity, format!("replay failed: {e}"));
                    None
                }
            }
        } else {
            None
        };

        match (&snapshot, events.last()) {
            (None, Some(_)) if !snapshot_path.exists() => {
                report.warning(Check::MissingSnapshot, entity, "log has no snapshot".to_string());
            }
            (Some(_), None) if !log_path.exists() => {
                report.error(Check::OrphanSnapshot, entity, "snapshot has no event log".to_string());
            }
            (Some(stored), None) => {
                report.error(
                    Check::Drift,
                    entity,
                    format!("snapshot at {} but the log holds no events", stored.last_event_id()),
                );
            }
            (Some(stored), Some(last)) => {
                if stored.id() != id {
                    report.error(
                        Check::MalformedId,
                        entity,
                        format!("snapshot names '{}' but is stored as '{id}'", stored.id()),
                    );
                }
                if stored.last_event_id() != &last.id {
                    report.error(
                        Check::Drift,
                        entity,
                        format!("snapshot at {} but the log ends at {}", stored.last_event_id(), last.id),
                    );
                } else if replayed.as_ref().is_some_and(|r| r != stored) {
                    report.warning(
                        Check::ReplayMismatch,
                        entity,
                        "snapshot differs from the replayed state".to_string(),
                    );
                }
            }
            (None, _) => {}
        }

        Ok(Examined {
            id: id.to_string(),
            snapshot,
            events,
        })
    }

    fn check_index(&self, report: &mut Report, tasks: &[Examined<TaskSnapshot>]) {
        let path = self.writer.layout().index_path();
        let index = match IdIndex::load(&path, None) {
            Ok(index) => index,
            Err(e) => {
                report.error(Check::Index, None, format!("index.json unreadable: {e}"));
                return;
            }
        };
        let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

        for task in tasks.iter().filter_map(|t| t.snapshot.as_ref()) {
            let Some(short) = &task.short_id else { continue };
            let entity = Some((EntityKind::Task, task.id.as_str()));
            match index.resolve(short) {
                None => report.warning(Check::Index, entity, format!("short id {short} is missing from the index")),
                Some(other) if other != task.id => report.error(
                    Check::Index,
                    entity,
                    format!("short id {short} maps to '{other}' in the index"),
                ),
                Some(_) => {}
            }
        }
        for (short, target) in &index.short_ids {
            if ShortId::parse(short).is_none() {
                report.error(Check::MalformedId, None, format!("index holds malformed short id '{short}'"));
            }
            if !known.contains(target.as_str()) {
                report.warning(
                    Check::Index,
                    None,
                    format!("short id {short} points at missing task '{target}'"),
                );
            }
        }
        for (key, next, max) in index.lagging_counters() {
            report.error(
                Check::Index,
                None,
                format!("counter {key} would issue {next} but {key}-{max} already exists"),
            );
        }
    }

    fn check_merged(
        &self,
        report: &mut Report,
        check: Check,
        key: &str,
        path: &Path,
        expected: &BTreeSet<EventId>,
        fix: bool,
    ) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let scan = scan_log(path).map_err(storage_err("integrity:check"))?;
        if let Some(tail) = &scan.truncated {
            report.error(
                Check::TruncatedLine,
                None,
                format!("{name} line {} has no newline terminator ({} bytes)", tail.line, tail.bytes),
            );
            if fix {
                self.repair_tail(report, key, path, None)?;
            }
        }
        for bad in &scan.malformed {
            report.warning(check, None, format!("{name} line {}: {}", bad.line, bad.reason));
        }

        let actual: BTreeSet<&EventId> = scan.iter_events().map(|e| &e.id).collect();
        if actual.len() < scan.events.len() {
            report.warning(
                check,
                None,
                format!("{name} repeats {} events", scan.events.len() - actual.len()),
            );
        }
        let missing: Vec<&EventId> = expected.iter().filter(|id| !actual.contains(id)).collect();
        if let Some(first) = missing.first() {
            report.warning(
                check,
                None,
                format!("{} events missing from {name}, first {first}", missing.len()),
            );
        }
        let extra: Vec<&&EventId> = actual.iter().filter(|id| !expected.contains(**id)).collect();
        if let Some(first) = extra.first() {
            report.warning(
                check,
                None,
                format!("{} events in {name} match no entity log, first {first}", extra.len()),
            );
        }
        Ok(())
    }

    fn repair_tail(&self, report: &mut Report, key: &str, path: &Path, entity_id: Option<&str>) -> Result<()> {
        let origin = "integrity:fix";
        let _guard = self.writer.lock_one(key)?;
        // Re-scan under the lock; a writer may have finished the line.
        let scan = scan_log(path).map_err(storage_err(origin))?;
        let Some(tail) = scan.truncated else {
            return Ok(());
        };
        let bytes = durable::read_optional(path)
            .map_err(storage_err(origin))?
            .unwrap_or_default();
        let keep = bytes.get(..tail.valid_len).unwrap_or_default();
        durable::atomic_replace(path, keep).map_err(storage_err(origin))?;
        info!(path = %path.display(), dropped_bytes = tail.bytes, "dropped incomplete log tail");
        report.repairs.push(Repair {
            check: Check::TruncatedLine,
            path: path.to_path_buf(),
            entity_id: entity_id.map(str::to_string),
            dropped_bytes: tail.bytes,
        });
        Ok(())
    }
}

fn check_edges(report: &mut Report, tasks: &[Examined<TaskSnapshot>]) {
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks.iter().filter_map(|t| t.snapshot.as_ref()) {
        let entity = Some((EntityKind::Task, task.id.as_str()));
        let mut seen = HashSet::new();
        for edge in &task.relationships {
            if edge.target == task.id {
                report.error(Check::SelfLoop, entity, format!("{} edge points at itself", edge.kind));
            } else if !known.contains(edge.target.as_str()) {
                report.error(
                    Check::DanglingEdge,
                    entity,
                    format!("{} edge points at missing task '{}'", edge.kind, edge.target),
                );
            }
            if !seen.insert((edge.kind, edge.target.as_str())) {
                report.warning(
                    Check::DuplicateEdge,
                    entity,
                    format!("{} edge to '{}' appears twice", edge.kind, edge.target),
                );
            }
        }
        if let Some(short) = &task.short_id {
            if ShortId::parse(short).is_none() {
                report.error(Check::MalformedId, entity, format!("malformed short id '{short}'"));
            }
        }
    }
}

/// Counts from [`Rebuilder::rebuild_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildSummary {
    pub tasks: usize,
    pub resources: usize,
    pub lifecycle_events: usize,
    pub global_events: Option<usize>,
    pub short_ids: usize,
    /// Entities with a snapshot but no log; left untouched.
    pub skipped: Vec<String>,
}

/// Builds a short-id index from the task snapshots of both trees, with
/// each counter one past the highest number seen. Takes no locks.
///
/// # Errors
/// Returns a read error from the layout or a snapshot.
pub(crate) fn index_from_snapshots(writer: &WritePath) -> Result<IdIndex> {
    let origin = "integrity:index_from_snapshots";
    let layout = writer.layout();
    let mut ids = BTreeSet::new();
    for location in LOCATIONS {
        ids.extend(layout.entity_ids(EntityKind::Task, location).map_err(storage_err(origin))?);
    }
    let mut pairs = Vec::new();
    for id in ids {
        let Some(location) = writer.locate(EntityKind::Task, &id) else {
            continue;
        };
        if let Some(task) = writer.read_current::<TaskReducer>(&id, location)? {
            if let Some(short) = task.short_id {
                pairs.push((short, task.id));
            }
        }
    }
    Ok(IdIndex::rebuild(pairs))
}

/// Regenerates derived files from the per-entity logs.
#[derive(Debug, Clone)]
pub struct Rebuilder {
    writer: WritePath,
}

/// Complete events of a log, in log order. An incomplete tail belongs to a
/// write still in progress and is left out.
fn committed_events(path: &Path) -> crate::storage::Result<Vec<Event>> {
    let LogScan {
        events,
        malformed,
        truncated,
    } = scan_log(path)?;
    if let Some(bad) = malformed.first() {
        return Err(StorageError::Corrupt {
            path: path.to_path_buf(),
            line: bad.line,
            reason: bad.reason.clone(),
        });
    }
    if truncated.is_some() {
        warn!(path = %path.display(), "ignoring incomplete log tail");
    }
    Ok(events.into_iter().map(|(_, e)| e).collect())
}

impl Rebuilder {
    #[must_use]
    pub fn new(writer: WritePath) -> Self {
        Self { writer }
    }

    /// Replays one entity's log and rewrites its snapshot. Returns `None`
    /// when the entity does not exist.
    ///
    /// # Errors
    /// Returns `corrupt` if the log is damaged or a snapshot has no log, a
    /// reducer error if the log does not replay, or a lock timeout.
    pub fn rebuild_entity<R: Reducer>(&self, id: &str) -> Result<Option<R::Snapshot>> {
        let origin = "integrity:rebuild_entity";
        let keys = [StoreLayout::log_key(R::KIND, id), StoreLayout::snapshot_key(R::KIND, id)];
        let guard = self.writer.lock(&keys)?;
        let Some(location) = self.writer.locate_locked(&guard, R::KIND, id)? else {
            return Ok(None);
        };
        let layout = self.writer.layout();
        let events = crate::storage::event_store::read_events(&layout.log_path(R::KIND, id, location))
            .map_err(storage_err(origin))?;
        let Some(snapshot) = replay::<R>(&events).map_err(|e| StoreError::from_reduce(&e, origin))? else {
            return Err(StoreError::corrupt(
                "orphan_snapshot",
                format!("{} '{id}' has a snapshot but no events", R::KIND),
                origin,
            )
            .with_context("entity_id", id));
        };
        write_snapshot(&layout.snapshot_path(R::KIND, id, location), &snapshot)
            .map_err(storage_err(origin))?;
        debug!(kind = %R::KIND, entity_id = %id, events = events.len(), "snapshot rebuilt");
        Ok(Some(snapshot))
    }

    /// Rebuilds a task snapshot.
    ///
    /// # Errors
    /// See [`Rebuilder::rebuild_entity`].
    pub fn rebuild_task(&self, id: &str) -> Result<Option<TaskSnapshot>> {
        self.rebuild_entity::<TaskReducer>(id)
    }

    /// Rebuilds a resource snapshot.
    ///
    /// # Errors
    /// See [`Rebuilder::rebuild_entity`].
    pub fn rebuild_resource(&self, name: &str) -> Result<Option<crate::core::resource::ResourceSnapshot>> {
        self.rebuild_entity::<ResourceReducer>(name)
    }

    /// Rebuilds every snapshot in both trees, then the merged logs and the
    /// index.
    ///
    /// # Errors
    /// Stops at the first entity that cannot be rebuilt, other than
    /// snapshots without a log, which are skipped.
    pub fn rebuild_all(&self) -> Result<RebuildSummary> {
        let mut summary = RebuildSummary::default();
        for kind in KINDS {
            for location in LOCATIONS {
                let ids = self
                    .writer
                    .layout()
                    .entity_ids(kind, location)
                    .map_err(storage_err("integrity:rebuild_all"))?;
                for id in ids {
                    let rebuilt = match kind {
                        EntityKind::Task => self.rebuild_task(&id).map(|s| s.is_some()),
                        EntityKind::Resource => self.rebuild_resource(&id).map(|s| s.is_some()),
                    };
                    match rebuilt {
                        Ok(true) => match kind {
                            EntityKind::Task => summary.tasks += 1,
                            EntityKind::Resource => summary.resources += 1,
                        },
                        Ok(false) => {}
                        Err(e) if e.code == "orphan_snapshot" => {
                            warn!(%kind, entity_id = %id, "skipping snapshot without log");
                            summary.skipped.push(id);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        summary.lifecycle_events = self.rebuild_lifecycle_log()?;
        if self.writer.mirrors_global() {
            summary.global_events = Some(self.rebuild_global_log()?);
        }
        summary.short_ids = self.rebuild_index()?.short_ids.len();
        info!(
            tasks = summary.tasks,
            resources = summary.resources,
            lifecycle_events = summary.lifecycle_events,
            skipped = summary.skipped.len(),
            "store rebuilt"
        );
        Ok(summary)
    }

    /// Rewrites `events/_lifecycle.jsonl` from every entity log, ordered by
    /// `(timestamp, event id)`. Returns the number of events written.
    ///
    /// # Errors
    /// Returns `corrupt` if an entity log has a malformed line.
    pub fn rebuild_lifecycle_log(&self) -> Result<usize> {
        let _guard = self.writer.lock_one(LIFECYCLE_KEY)?;
        let events = self.collect(|kind, event| is_lifecycle(kind, &event.kind))?;
        self.write_merged(&self.writer.layout().lifecycle_log_path(), &events)?;
        info!(events = events.len(), "lifecycle log rebuilt");
        Ok(events.len())
    }

    /// Rewrites `events/_global.jsonl` from every entity log, ordered by
    /// `(timestamp, event id)`. Returns the number of events written.
    ///
    /// # Errors
    /// Returns `corrupt` if an entity log has a malformed line.
    pub fn rebuild_global_log(&self) -> Result<usize> {
        let _guard = self.writer.lock_one(GLOBAL_KEY)?;
        let events = self.collect(|_, _| true)?;
        self.write_merged(&self.writer.layout().global_log_path(), &events)?;
        info!(events = events.len(), "global log rebuilt");
        Ok(events.len())
    }

    /// Recomputes `index.json` from task snapshots: every short id found,
    /// and each counter at the highest observed number plus one.
    ///
    /// # Errors
    /// Returns an error if a task cannot be read or the index not written.
    pub fn rebuild_index(&self) -> Result<IdIndex> {
        let origin = "integrity:rebuild_index";
        let _guard = self.writer.lock_one(INDEX_KEY)?;
        let index = index_from_snapshots(&self.writer)?;
        index
            .save(&self.writer.layout().index_path())
            .map_err(storage_err(origin))?;
        info!(short_ids = index.short_ids.len(), counters = index.next_sequence.len(), "index rebuilt");
        Ok(index)
    }

    fn collect(&self, keep: impl Fn(EntityKind, &Event) -> bool) -> Result<Vec<Event>> {
        let origin = "integrity:rebuild_log";
        let layout = self.writer.layout();
        let mut events = Vec::new();
        for kind in KINDS {
            for location in LOCATIONS {
                for id in layout.log_ids(kind, location).map_err(storage_err(origin))? {
                    let log = committed_events(&layout.log_path(kind, &id, location))
                        .map_err(storage_err(origin))?;
                    events.extend(log.into_iter().filter(|e| keep(kind, e)));
                }
            }
        }
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    fn write_merged(&self, path: &Path, events: &[Event]) -> Result<()> {
        let origin = "integrity:rebuild_log";
        let mut out = String::new();
        for event in events {
            out.push_str(&event.to_line().map_err(storage_err(origin))?);
            out.push('\n');
        }
        durable::atomic_replace(path, out.as_bytes()).map_err(storage_err(origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::notify::{HookDispatcher, ListenerBus, Notifier};
    use crate::core::task::{TASK_COMMENTED, TASK_CREATED, TASK_RELATIONSHIP_ADDED};
    use crate::storage::lock::LockManager;
    use serde_json::json;
    use std::fs;
    use std::time::Duration;

    fn writer(root: &Path) -> WritePath {
        let layout = StoreLayout::new(root);
        layout.create_dirs().unwrap();
        let locks = LockManager::new(layout.locks_dir()).with_poll_interval(Duration::from_millis(1));
        let notifier = Notifier::new(
            ListenerBus::new(),
            HookDispatcher::new(Vec::new(), root, Duration::from_secs(1)),
        );
        WritePath::new(layout, locks, Duration::from_secs(2), true, notifier)
    }

    fn task(wp: &WritePath, id: &str) {
        wp.transact::<TaskReducer, _>(id, true, |_, _| {
            Ok(vec![Event::new(id, TASK_CREATED, "alice", json!({"title": id}))])
        })
        .unwrap();
    }

    fn comment(wp: &WritePath, id: &str, body: &str) {
        wp.transact::<TaskReducer, _>(id, false, |_, _| {
            Ok(vec![Event::new(id, TASK_COMMENTED, "bob", json!({"body": body}))])
        })
        .unwrap();
    }

    fn log(wp: &WritePath, id: &str) -> PathBuf {
        wp.layout().log_path(EntityKind::Task, id, Location::Active)
    }

    #[test]
    fn clean_store_has_no_findings() {
        let dir = tempfile::tempdir().unwrap();
        let wp = writer(dir.path());
        task(&wp, "t1");
        comment(&wp, "t1", "hi");

        let report = Checker::new(wp).check(false).unwrap();
        assert!(report.findings.is_empty(), "{:?}", report.findings);
        assert_eq!(report.entities, 1);
    }

    #[test]
    fn truncated_tail_is_found_and_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let wp = writer(dir.path());
        task(&wp, "t1");
        comment(&wp, "t1", "kept");
        let path = log(&wp, "t1");
        let valid = fs::read(&path).unwrap();
        fs::write(&path, [valid.as_slice(), b"{\"id\":\"evt-"].concat()).unwrap();

        let checker = Checker::new(wp.clone());
        let report = checker.check(false).unwrap();
        assert_eq!(report.count(Check::TruncatedLine), 1);
        assert!(report.repairs.is_empty());
        assert_eq!(fs::read(&path).unwrap().len(), valid.len() + 11);

        let fixed = checker.check(true).unwrap();
        assert_eq!(fixed.repairs.len(), 1);
        assert_eq!(fixed.repairs[0].dropped_bytes, 11);
        assert_eq!(fs::read(&path).unwrap(), valid);
        assert_eq!(checker.check(false).unwrap().count(Check::TruncatedLine), 0);
    }

    #[test]
    fn drift_and_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let wp = writer(dir.path());
        task(&wp, "t1");
        task(&wp, "t2");
        let snapshot = wp.layout().snapshot_path(EntityKind::Task, "t1", Location::Active);
        let before = fs::read(&snapshot).unwrap();
        comment(&wp, "t1", "later");
        fs::write(&snapshot, before).unwrap();
        fs::remove_file(wp.layout().snapshot_path(EntityKind::Task, "t2", Location::Active)).unwrap();

        let report = Checker::new(wp).check(false).unwrap();
        assert_eq!(report.count(Check::Drift), 1);
        assert_eq!(report.count(Check::MissingSnapshot), 1);
        assert!(!report.is_ok());
    }

    #[test]
    fn edited_snapshot_is_a_replay_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let wp = writer(dir.path());
        task(&wp, "t1");
        let path = wp.layout().snapshot_path(EntityKind::Task, "t1", Location::Active);
        let text = fs::read_to_string(&path).unwrap().replace("\"title\": \"t1\"", "\"title\": \"edited\"");
        fs::write(&path, text).unwrap();

        let report = Checker::new(wp).check(false).unwrap();
        assert_eq!(report.count(Check::ReplayMismatch), 1);
        assert!(report.is_ok());
    }

    #[test]
    fn duplicate_and_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let wp = writer(dir.path());
        task(&wp, "t1");
        let path = log(&wp, "t1");
        let line = fs::read_to_string(&path).unwrap();
        fs::write(&path, format!("{line}{line}")).unwrap();
        fs::write(wp.layout().snapshot_path(EntityKind::Task, "ghost", Location::Active), "{}\n").unwrap();

        let report = Checker::new(wp).check(false).unwrap();
        assert_eq!(report.count(Check::DuplicateEvent), 1);
        assert_eq!(report.count(Check::SnapshotParse), 1);
        assert_eq!(report.count(Check::OrphanSnapshot), 0);
    }

    #[test]
    fn edges_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let wp = writer(dir.path());
        task(&wp, "t1");
        let edge = |target: &str| {
            Event::new("t1", TASK_RELATIONSHIP_ADDED, "a", json!({"type": "blocks", "target": target}))
        };
        wp.transact::<TaskReducer, _>("t1", false, |_, _| Ok(vec![edge("t1"), edge("gone")]))
            .unwrap();

        let report = Checker::new(wp).check(false).unwrap();
        assert_eq!(report.count(Check::SelfLoop), 1);
        assert_eq!(report.count(Check::DanglingEdge), 1);
    }

    #[test]
    fn merged_logs_rebuild_in_timestamp_order() {
        let dir = tempfile::tempdir().unwrap();
        let wp = writer(dir.path());
        let late = Event::new("a", TASK_CREATED, "x", json!({"title": "a"}))
            .at("2026-03-01T00:00:00Z".parse().unwrap());
        let early = Event::new("b", TASK_CREATED, "x", json!({"title": "b"}))
            .at("2026-01-01T00:00:00Z".parse().unwrap());
        wp.transact::<TaskReducer, _>("a", true, |_, _| Ok(vec![late.clone()])).unwrap();
        wp.transact::<TaskReducer, _>("b", true, |_, _| Ok(vec![early.clone()])).unwrap();

        let lifecycle = wp.layout().lifecycle_log_path();
        fs::remove_file(&lifecycle).unwrap();
        let report = Checker::new(wp.clone()).check(false).unwrap();
        assert_eq!(report.count(Check::LifecycleLog), 1);

        assert_eq!(Rebuilder::new(wp).rebuild_lifecycle_log().unwrap(), 2);
        let text = fs::read_to_string(&lifecycle).unwrap();
        let ids: Vec<String> = text
            .lines()
            .map(|l| Event::from_line(l).unwrap().entity_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn rebuild_all_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let wp = writer(dir.path());
        task(&wp, "t1");
        comment(&wp, "t1", "one");
        task(&wp, "t2");
        let snapshot = wp.layout().snapshot_path(EntityKind::Task, "t1", Location::Active);
        let global = wp.layout().global_log_path();
        let before = (fs::read(&snapshot).unwrap(), fs::read(&global).unwrap());

        fs::remove_file(&snapshot).unwrap();
        let summary = Rebuilder::new(wp).rebuild_all().unwrap();
        assert_eq!(summary.tasks, 2);
        assert_eq!(summary.global_events, Some(3));
        assert_eq!((fs::read(&snapshot).unwrap(), fs::read(&global).unwrap()), before);
    }
}
