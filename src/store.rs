//! Interfaces to the external task store.
//!
//! The board core consumes three collaborator interfaces and defines none of
//! their transport: a query side, a command side, and a change feed that only
//! promises "something changed" for a table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::feed::Subscription;
use crate::task::{DependencyEdge, NewTask, Task, TaskId, TaskPatch, TeamId, UserId};

/// Which tasks a board displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every task belonging to a team.
    Team(TeamId),
    /// Every task a user owns or is assigned.
    User(UserId),
}

impl Scope {
    pub fn includes(&self, task: &Task) -> bool {
        match *self {
            Scope::Team(team) => task.team_id == Some(team),
            Scope::User(user) => task.owner_id == user || task.assignee_id == Some(user),
        }
    }

    /// Row filter for the task table feed matching this scope, if expressible.
    pub fn row_filter(&self) -> Option<RowFilter> {
        match *self {
            Scope::Team(team) => Some(RowFilter::Team(team)),
            Scope::User(_) => None,
        }
    }
}

/// Tables that publish change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Tasks,
    TaskDependencies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Optional row filter for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    Team(TeamId),
}

impl RowFilter {
    /// Events without a team are let through; the receiver refetches anyway.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match *self {
            RowFilter::Team(team) => event.team_id.map_or(true, |t| t == team),
        }
    }
}

/// A change notification. Only `table` is guaranteed to be meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub row_id: Option<TaskId>,
    pub team_id: Option<TeamId>,
}

impl ChangeEvent {
    pub fn new(table: Table, kind: ChangeKind) -> Self {
        ChangeEvent {
            table,
            kind,
            row_id: None,
            team_id: None,
        }
    }

    pub fn row(mut self, id: TaskId) -> Self {
        self.row_id = Some(id);
        self
    }

    pub fn team(mut self, team: Option<TeamId>) -> Self {
        self.team_id = team;
        self
    }
}

/// Read side of the store.
#[async_trait]
pub trait TaskQuery: Send + Sync {
    /// Tasks in scope, each joined with its subtask counts. Subtasks themselves
    /// are not returned.
    async fn fetch_tasks(&self, scope: Scope) -> StoreResult<Vec<Task>>;

    /// All edges whose dependent is one of `dependents`.
    async fn fetch_edges(&self, dependents: &[TaskId]) -> StoreResult<Vec<DependencyEdge>>;

    async fn fetch_task(&self, id: TaskId) -> StoreResult<Option<Task>>;
}

/// Write side of the store.
#[async_trait]
pub trait TaskCommand: Send + Sync {
    async fn insert_task(&self, task: NewTask) -> StoreResult<Task>;

    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> StoreResult<()>;

    async fn delete_task(&self, id: TaskId) -> StoreResult<()>;

    /// Insert an edge. Inserting an existing ordered pair fails with
    /// `StoreError::DuplicateEdge`.
    async fn insert_edge(&self, edge: DependencyEdge) -> StoreResult<()>;

    /// Delete the edge with exactly this ordered pair.
    async fn delete_edge(&self, edge: DependencyEdge) -> StoreResult<()>;
}

/// Push side of the store.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, table: Table, filter: Option<RowFilter>) -> StoreResult<Subscription>;
}

/// Everything a board session needs from a store.
pub trait Backend: TaskQuery + TaskCommand + ChangeFeed {}

impl<T: TaskQuery + TaskCommand + ChangeFeed + ?Sized> Backend for T {}
