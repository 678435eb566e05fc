//! Task data structures and related functionality.
//!
//! This module defines the `Task` snapshot the board renders from, the patch
//! type used to edit it, the insert payload for new tasks, and the dependency
//! edge linking two tasks.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::fields::*;

/// Opaque task identifier assigned by the store.
pub type TaskId = u64;
/// Opaque user identifier.
pub type UserId = u64;
/// Opaque team identifier.
pub type TeamId = u64;

/// Subtask totals joined onto a task by the query interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskCounts {
    pub total: u32,
    pub completed: u32,
}

/// Dependency state of one task as computed by the evaluator.
///
/// The default is the vacuous case: no dependencies, nothing to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedInfo {
    pub has_dependencies: bool,
    pub dependencies_completed: bool,
}

impl Default for BlockedInfo {
    fn default() -> Self {
        BlockedInfo {
            has_dependencies: false,
            dependencies_completed: true,
        }
    }
}

impl BlockedInfo {
    /// True when the task has dependencies and at least one is not done.
    pub fn is_blocked(&self) -> bool {
        self.has_dependencies && !self.dependencies_completed
    }
}

/// A task snapshot as held in the cache.
///
/// `subtasks` and `dependencies` are derived: they are never read from or
/// written to the store and must be re-attached after every fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default, deserialize_with = "lenient_optional")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_status_lenient")]
    pub status: Status,
    #[serde(default, deserialize_with = "lenient_optional")]
    pub priority: Option<Priority>,
    #[serde(default, deserialize_with = "lenient_optional")]
    pub due_date: Option<DateTime<Utc>>,
    pub owner_id: UserId,
    #[serde(default, deserialize_with = "lenient_optional")]
    pub assignee_id: Option<UserId>,
    #[serde(default, deserialize_with = "lenient_optional")]
    pub team_id: Option<TeamId>,
    #[serde(default, deserialize_with = "lenient_optional")]
    pub parent_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub subtasks: SubtaskCounts,
    #[serde(skip)]
    pub dependencies: BlockedInfo,
}

impl Task {
    /// Create a todo task with no optional fields set.
    pub fn new(id: TaskId, title: impl Into<String>, owner_id: UserId, created_at: DateTime<Utc>) -> Self {
        Task {
            id,
            title: title.into(),
            description: None,
            status: Status::Todo,
            priority: None,
            due_date: None,
            owner_id,
            assignee_id: None,
            team_id: None,
            parent_id: None,
            created_at,
            subtasks: SubtaskCounts::default(),
            dependencies: BlockedInfo::default(),
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_due(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_team(mut self, team: TeamId) -> Self {
        self.team_id = Some(team);
        self
    }

    pub fn with_assignee(mut self, assignee: UserId) -> Self {
        self.assignee_id = Some(assignee);
        self
    }
}

/// A partial edit of a task.
///
/// `None` leaves a field untouched; `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub status: Option<Status>,
    pub priority: Option<Option<Priority>>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub assignee_id: Option<Option<UserId>>,
    pub team_id: Option<Option<TeamId>>,
}

impl TaskPatch {
    /// A patch that only changes status.
    pub fn status(status: Status) -> Self {
        TaskPatch {
            status: Some(status),
            ..TaskPatch::default()
        }
    }

    pub fn touches_status(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == TaskPatch::default()
    }

    /// Apply the patch to a snapshot in place. Derived fields are left alone.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title = title.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(due) = self.due_date {
            task.due_date = due;
        }
        if let Some(assignee) = self.assignee_id {
            task.assignee_id = assignee;
        }
        if let Some(team) = self.team_id {
            task.team_id = team;
        }
    }
}

/// Insert payload for a new task; the store assigns id and creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub status: Status,
    pub priority: Option<Priority>,
    pub due_date: Option<DateTime<Utc>>,
    pub owner_id: UserId,
    pub assignee_id: Option<UserId>,
    pub team_id: Option<TeamId>,
    pub parent_id: Option<TaskId>,
}

/// "`dependent` cannot start or finish until `dependency` is done."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub dependent_id: TaskId,
    pub dependency_id: TaskId,
}

impl DependencyEdge {
    pub fn new(dependent_id: TaskId, dependency_id: TaskId) -> Self {
        DependencyEdge {
            dependent_id,
            dependency_id,
        }
    }
}

/// Deserialize an optional field, treating malformed values as absent.
fn lenient_optional<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
}
