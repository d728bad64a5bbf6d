//! Task snapshots and the task event family.

use crate::core::events::{Event, EventId, EXTENSION_PREFIX};
use crate::core::reducer::{decode_data, Disposition, EntitySnapshot, ReduceError, Reducer};
use crate::storage::layout::EntityKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema version written into task snapshots.
pub const TASK_SCHEMA_VERSION: u32 = 1;

pub const TASK_CREATED: &str = "task.created";
pub const TASK_UPDATED: &str = "task.updated";
pub const TASK_STATUS_CHANGED: &str = "task.status_changed";
pub const TASK_ASSIGNED: &str = "task.assigned";
pub const TASK_COMMENTED: &str = "task.commented";
pub const TASK_RELATIONSHIP_ADDED: &str = "task.relationship_added";
pub const TASK_RELATIONSHIP_REMOVED: &str = "task.relationship_removed";
pub const TASK_ARCHIVED: &str = "task.archived";
pub const TASK_UNARCHIVED: &str = "task.unarchived";

/// Keys owned by [`TaskSnapshot`]; payload extras never overwrite them.
const RESERVED_FIELDS: &[&str] = &[
    "id",
    "schema_version",
    "short_id",
    "title",
    "description",
    "status",
    "priority",
    "labels",
    "assignee",
    "relationships",
    "comments",
    "created_at",
    "created_by",
    "closed_at",
    "archived_at",
    "last_event_id",
    "updated_at",
];

/// Workflow status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    Blocked,
    Review,
    Done,
    Cancelled,
}

impl TaskStatus {
    /// Done and cancelled tasks can only be reopened.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Returns true if a task may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return false;
        }
        if self.is_terminal() {
            return matches!(next, Self::Backlog | Self::Todo);
        }
        true
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown task status '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Kind of a directed edge between two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Blocks,
    DependsOn,
    ParentOf,
    ChildOf,
    RelatesTo,
    Duplicates,
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Blocks => "blocks",
            Self::DependsOn => "depends_on",
            Self::ParentOf => "parent_of",
            Self::ChildOf => "child_of",
            Self::RelatesTo => "relates_to",
            Self::Duplicates => "duplicates",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    pub kind: RelationKind,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub actor: String,
    pub at: DateTime<Utc>,
    pub body: String,
}

/// Materialised state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub schema_version: u32,
    #[serde(default)]
    pub short_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    pub last_event_id: EventId,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskSnapshot {
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    #[must_use]
    pub fn has_relationship(&self, kind: RelationKind, target: &str) -> bool {
        self.relationships
            .iter()
            .any(|r| r.kind == kind && r.target == target)
    }
}

impl EntitySnapshot for TaskSnapshot {
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
pub struct TaskCreated {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskCreated {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            status: None,
            priority: None,
            labels: Vec::new(),
            assignee: None,
            short_id: None,
            extra: Map::new(),
        }
    }
}

/// Partial update. Extra keys are merged into the snapshot; a `null` value
/// removes the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdated {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskUpdated {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.labels.is_none()
            && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TaskStatus>,
    pub to: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assigned {
    #[serde(default)]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commented {
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archived {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Decoded task event.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Created(TaskCreated),
    Updated(TaskUpdated),
    StatusChanged(StatusChanged),
    Assigned(Assigned),
    Commented(Commented),
    RelationshipAdded(Relationship),
    RelationshipRemoved(Relationship),
    Archived(Archived),
    Unarchived,
    Extension,
    Unknown(String),
}

impl TaskEvent {
    /// Decodes `(type, data)` into the closed task family.
    ///
    /// # Errors
    /// Returns [`ReduceError::InvalidData`] for a known type whose payload
    /// does not match.
    pub fn decode(event: &Event) -> Result<Self, ReduceError> {
        Ok(match event.kind.as_str() {
            TASK_CREATED => Self::Created(decode_data(event)?),
            TASK_UPDATED => Self::Updated(decode_data(event)?),
            TASK_STATUS_CHANGED => Self::StatusChanged(decode_data(event)?),
            TASK_ASSIGNED => Self::Assigned(decode_data(event)?),
            TASK_COMMENTED => Self::Commented(decode_data(event)?),
            TASK_RELATIONSHIP_ADDED => Self::RelationshipAdded(decode_data(event)?),
            TASK_RELATIONSHIP_REMOVED => Self::RelationshipRemoved(decode_data(event)?),
            TASK_ARCHIVED => Self::Archived(decode_data(event)?),
            TASK_UNARCHIVED => Self::Unarchived,
            kind if kind.starts_with(EXTENSION_PREFIX) => Self::Extension,
            other => Self::Unknown(other.to_string()),
        })
    }

    /// Event type string, or `None` for extension and unknown events.
    #[must_use]
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            Self::Created(_) => Some(TASK_CREATED),
            Self::Updated(_) => Some(TASK_UPDATED),
            Self::StatusChanged(_) => Some(TASK_STATUS_CHANGED),
            Self::Assigned(_) => Some(TASK_ASSIGNED),
            Self::Commented(_) => Some(TASK_COMMENTED),
            Self::RelationshipAdded(_) => Some(TASK_RELATIONSHIP_ADDED),
            Self::RelationshipRemoved(_) => Some(TASK_RELATIONSHIP_REMOVED),
            Self::Archived(_) => Some(TASK_ARCHIVED),
            Self::Unarchived => Some(TASK_UNARCHIVED),
            Self::Extension | Self::Unknown(_) => None,
        }
    }

    /// Encodes the payload as event `data`.
    ///
    /// # Errors
    /// Returns the serialization error, which only happens for payloads
    /// holding non-string map keys.
    pub fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            Self::Created(d) => serde_json::to_value(d),
            Self::Updated(d) => serde_json::to_value(d),
            Self::StatusChanged(d) => serde_json::to_value(d),
            Self::Assigned(d) => serde_json::to_value(d),
            Self::Commented(d) => serde_json::to_value(d),
            Self::RelationshipAdded(d) | Self::RelationshipRemoved(d) => serde_json::to_value(d),
            Self::Archived(d) => serde_json::to_value(d),
            Self::Unarchived | Self::Extension | Self::Unknown(_) => Ok(Value::Object(Map::new())),
        }
    }
}

pub(crate) fn normalize_labels(labels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = labels
        .iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn merge_extra(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        if RESERVED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Reducer for the task family.
pub struct TaskReducer;

impl Reducer for TaskReducer {
    type Snapshot = TaskSnapshot;
    const KIND: EntityKind = EntityKind::Task;

    fn is_creation(kind: &str) -> bool {
        kind == TASK_CREATED
    }

    fn is_lifecycle(kind: &str) -> bool {
        matches!(kind, TASK_CREATED | TASK_ARCHIVED | TASK_UNARCHIVED)
    }

    fn create(event: &Event) -> Result<TaskSnapshot, ReduceError> {
        let TaskEvent::Created(data) = TaskEvent::decode(event)? else {
            return Err(ReduceError::MissingCreation {
                event_id: event.id.clone(),
                kind: event.kind.clone(),
            });
        };
        let status = data.status.unwrap_or(TaskStatus::Backlog);
        let mut extra = Map::new();
        merge_extra(&mut extra, &data.extra);
        Ok(TaskSnapshot {
            id: event.entity_id.clone(),
            schema_version: TASK_SCHEMA_VERSION,
            short_id: data.short_id,
            title: data.title,
            description: data.description.unwrap_or_default(),
            status,
            priority: data.priority.unwrap_or_default(),
            labels: normalize_labels(&data.labels),
            assignee: data.assignee,
            relationships: Vec::new(),
            comments: Vec::new(),
            created_at: event.timestamp,
            created_by: event.actor.clone(),
            closed_at: status.is_terminal().then_some(event.timestamp),
            archived_at: None,
            last_event_id: event.id.clone(),
            updated_at: event.timestamp,
            extra,
        })
    }

    fn fold(task: &mut TaskSnapshot, event: &Event) -> Result<Disposition, ReduceError> {
        match TaskEvent::decode(event)? {
            TaskEvent::Created(_) => {
                return Err(ReduceError::AlreadyCreated {
                    entity_id: task.id.clone(),
                    event_id: event.id.clone(),
                })
            }
            TaskEvent::Updated(update) => {
                if let Some(title) = update.title {
                    task.title = title;
                }
                if let Some(description) = update.description {
                    task.description = description;
                }
                if let Some(priority) = update.priority {
                    task.priority = priority;
                }
                if let Some(labels) = update.labels {
                    task.labels = normalize_labels(&labels);
                }
                merge_extra(&mut task.extra, &update.extra);
            }
            TaskEvent::StatusChanged(change) => {
                task.status = change.to;
                task.closed_at = change.to.is_terminal().then_some(event.timestamp);
            }
            TaskEvent::Assigned(assigned) => {
                task.assignee = assigned.assignee;
            }
            TaskEvent::Commented(comment) => task.comments.push(Comment {
                actor: event.actor.clone(),
                at: event.timestamp,
                body: comment.body,
            }),
            TaskEvent::RelationshipAdded(edge) => {
                if !task.has_relationship(edge.kind, &edge.target) {
                    task.relationships.push(edge);
                }
            }
            TaskEvent::RelationshipRemoved(edge) => {
                task.relationships.retain(|r| *r != edge);
            }
            TaskEvent::Archived(_) => task.archived_at = Some(event.timestamp),
            TaskEvent::Unarchived => task.archived_at = None,
            TaskEvent::Extension => return Ok(Disposition::Extension),
            TaskEvent::Unknown(kind) => return Ok(Disposition::Unknown(kind)),
        }
        Ok(Disposition::Applied)
    }
}
