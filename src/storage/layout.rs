//! On-disk layout and lock keys.
//!
//! ```text
//! <root>/
//!   config.json  index.json
//!   tasks/<id>.json            events/<id>.jsonl
//!   events/_lifecycle.jsonl    events/_global.jsonl
//!   archive/tasks/<id>.json    archive/events/<id>.jsonl
//!   resources/<name>/resource.json   resources/<name>/events.jsonl
//!   locks/<key>.lock
//! ```

use super::{durable, Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the marker directory that holds a store.
pub const MARKER_DIR: &str = ".tasklog";

pub const LIFECYCLE_KEY: &str = "events._lifecycle";
pub const GLOBAL_KEY: &str = "events._global";
pub const INDEX_KEY: &str = "index";

const LIFECYCLE_LOG: &str = "_lifecycle.jsonl";
const GLOBAL_LOG: &str = "_global.jsonl";
const SNAPSHOT_EXT: &str = "json";
const LOG_EXT: &str = "jsonl";

/// Entity families stored side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Resource,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

/// Which tree an entity's files live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    Active,
    Archived,
}

impl Location {
    /// The opposite tree.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Active => Self::Archived,
            Self::Archived => Self::Active,
        }
    }
}

/// Resolves every path and lock key of a store rooted at one directory.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn base(&self, location: Location) -> PathBuf {
        match location {
            Location::Active => self.root.clone(),
            Location::Archived => self.root.join("archive"),
        }
    }

    #[must_use]
    pub fn tasks_dir(&self, location: Location) -> PathBuf {
        self.base(location).join("tasks")
    }

    #[must_use]
    pub fn events_dir(&self, location: Location) -> PathBuf {
        self.base(location).join("events")
    }

    #[must_use]
    pub fn resources_dir(&self, location: Location) -> PathBuf {
        self.base(location).join("resources")
    }

    #[must_use]
    pub fn lifecycle_log_path(&self) -> PathBuf {
        self.events_dir(Location::Active).join(LIFECYCLE_LOG)
    }

    #[must_use]
    pub fn global_log_path(&self) -> PathBuf {
        self.events_dir(Location::Active).join(GLOBAL_LOG)
    }

    #[must_use]
    pub fn snapshot_path(&self, kind: EntityKind, id: &str, location: Location) -> PathBuf {
        match kind {
            EntityKind::Task => self.tasks_dir(location).join(format!("{id}.{SNAPSHOT_EXT}")),
            EntityKind::Resource => self
                .resources_dir(location)
                .join(id)
                .join(format!("resource.{SNAPSHOT_EXT}")),
        }
    }

    #[must_use]
    pub fn log_path(&self, kind: EntityKind, id: &str, location: Location) -> PathBuf {
        match kind {
            EntityKind::Task => self.events_dir(location).join(format!("{id}.{LOG_EXT}")),
            EntityKind::Resource => self
                .resources_dir(location)
                .join(id)
                .join(format!("events.{LOG_EXT}")),
        }
    }

    /// Lock key guarding an entity's event log.
    #[must_use]
    pub fn log_key(kind: EntityKind, id: &str) -> String {
        match kind {
            EntityKind::Task => format!("events.{id}"),
            EntityKind::Resource => format!("resources.{id}.events"),
        }
    }

    /// Lock key guarding an entity's snapshot.
    #[must_use]
    pub fn snapshot_key(kind: EntityKind, id: &str) -> String {
        match kind {
            EntityKind::Task => format!("tasks.{id}"),
            EntityKind::Resource => format!("resources.{id}.resource"),
        }
    }

    /// Creates the fixed directory tree.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be created.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            self.tasks_dir(Location::Active),
            self.events_dir(Location::Active),
            self.tasks_dir(Location::Archived),
            self.events_dir(Location::Archived),
            self.resources_dir(Location::Active),
            self.locks_dir(),
        ] {
            durable::ensure_dir(&dir)?;
        }
        Ok(())
    }

    /// Makes sure the directories holding one entity's files exist.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be created.
    pub fn ensure_entity_dirs(&self, kind: EntityKind, id: &str, location: Location) -> Result<()> {
        for path in [
            self.snapshot_path(kind, id, location),
            self.log_path(kind, id, location),
        ] {
            if let Some(parent) = path.parent() {
                durable::ensure_dir(parent)?;
            }
        }
        Ok(())
    }

    /// Lists ids that have a snapshot file, sorted.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be read.
    pub fn snapshot_ids(&self, kind: EntityKind, location: Location) -> Result<Vec<String>> {
        match kind {
            EntityKind::Task => list_stems(&self.tasks_dir(location), SNAPSHOT_EXT),
            EntityKind::Resource => self.resource_names_with(location, |layout, name| {
                layout.snapshot_path(kind, name, location).is_file()
            }),
        }
    }

    /// Lists ids that have an event log, sorted. Merged logs are excluded.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be read.
    pub fn log_ids(&self, kind: EntityKind, location: Location) -> Result<Vec<String>> {
        match kind {
            EntityKind::Task => Ok(list_stems(&self.events_dir(location), LOG_EXT)?
                .into_iter()
                .filter(|id| !id.starts_with('_'))
                .collect()),
            EntityKind::Resource => self.resource_names_with(location, |layout, name| {
                layout.log_path(kind, name, location).is_file()
            }),
        }
    }

    /// Lists ids with either a snapshot or a log, sorted and de-duplicated.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be read.
    pub fn entity_ids(&self, kind: EntityKind, location: Location) -> Result<Vec<String>> {
        let mut ids = self.snapshot_ids(kind, location)?;
        ids.extend(self.log_ids(kind, location)?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn resource_names_with(
        &self,
        location: Location,
        keep: impl Fn(&Self, &str) -> bool,
    ) -> Result<Vec<String>> {
        let dir = self.resources_dir(location);
        let mut names = Vec::new();
        for entry in read_dir_optional(&dir)? {
            let entry = entry.map_err(|e| StorageError::io("read_dir", &dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if keep(self, name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn read_dir_optional(dir: &Path) -> Result<Vec<std::io::Result<fs::DirEntry>>> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StorageError::io("read_dir", dir, e)),
    }
}

fn list_stems(dir: &Path, ext: &str) -> Result<Vec<String>> {
    let mut stems = Vec::new();
    for entry in read_dir_optional(dir)? {
        let entry = entry.map_err(|e| StorageError::io("read_dir", dir, e))?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ext) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if !stem.starts_with('.') {
                stems.push(stem.to_string());
            }
        }
    }
    stems.sort();
    Ok(stems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_layout() {
        let layout = StoreLayout::new("/s");
        assert_eq!(
            layout.snapshot_path(EntityKind::Task, "t1", Location::Archived),
            PathBuf::from("/s/archive/tasks/t1.json")
        );
        assert_eq!(
            layout.log_path(EntityKind::Resource, "printer", Location::Active),
            PathBuf::from("/s/resources/printer/events.jsonl")
        );
        assert_eq!(layout.global_log_path(), PathBuf::from("/s/events/_global.jsonl"));
        assert_eq!(StoreLayout::log_key(EntityKind::Task, "t1"), "events.t1");
        assert_eq!(
            StoreLayout::snapshot_key(EntityKind::Resource, "printer"),
            "resources.printer.resource"
        );
    }

    #[test]
    fn listing_skips_merged_logs_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.create_dirs().unwrap();
        fs::write(layout.log_path(EntityKind::Task, "t2", Location::Active), "").unwrap();
        fs::write(layout.snapshot_path(EntityKind::Task, "t1", Location::Active), "{}").unwrap();
        fs::write(layout.lifecycle_log_path(), "").unwrap();
        fs::write(layout.tasks_dir(Location::Active).join(".tmp-abc"), "").unwrap();

        assert_eq!(layout.log_ids(EntityKind::Task, Location::Active).unwrap(), vec!["t2"]);
        assert_eq!(
            layout.entity_ids(EntityKind::Task, Location::Active).unwrap(),
            vec!["t1", "t2"]
        );
    }

    #[test]
    fn resources_are_listed_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.create_dirs().unwrap();
        layout
            .ensure_entity_dirs(EntityKind::Resource, "printer", Location::Active)
            .unwrap();
        fs::write(
            layout.snapshot_path(EntityKind::Resource, "printer", Location::Active),
            "{}",
        )
        .unwrap();

        assert_eq!(
            layout.snapshot_ids(EntityKind::Resource, Location::Active).unwrap(),
            vec!["printer"]
        );
        assert!(layout.log_ids(EntityKind::Resource, Location::Active).unwrap().is_empty());
    }
}
