//! In-memory store backend.
//!
//! Implements the query, command and change-feed interfaces over ordered maps
//! behind an async mutex. It is the store used by tests and by sessions that
//! do not need persistence, and it can be told to fail or slow down so that
//! rollback and interleaving paths can be exercised.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::feed::{FeedHub, Subscription};
use crate::fields::Status;
use crate::store::{ChangeEvent, ChangeFeed, ChangeKind, RowFilter, Scope, Table, TaskCommand, TaskQuery};
use crate::task::{DependencyEdge, NewTask, SubtaskCounts, Task, TaskId, TaskPatch};

#[derive(Debug, Default)]
struct MemoryInner {
    tasks: BTreeMap<TaskId, Task>,
    edges: BTreeSet<DependencyEdge>,
}

impl MemoryInner {
    fn next_id(&self) -> TaskId {
        self.tasks.keys().next_back().copied().unwrap_or(0) + 1
    }

    fn subtask_counts(&self, parent: TaskId) -> SubtaskCounts {
        let mut counts = SubtaskCounts::default();
        for task in self.tasks.values().filter(|t| t.parent_id == Some(parent)) {
            counts.total += 1;
            if task.status == Status::Done {
                counts.completed += 1;
            }
        }
        counts
    }

    fn joined(&self, task: &Task) -> Task {
        let mut out = task.clone();
        out.subtasks = self.subtask_counts(task.id);
        out.dependencies = Default::default();
        out
    }
}

/// Store backend held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    feed: FeedHub,
    failing_updates: AtomicUsize,
    offline: AtomicBool,
    latency: std::sync::Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_tasks(Vec::new(), Vec::new())
    }

    /// Create a store pre-populated with rows. Ids are taken as given.
    pub fn with_tasks(tasks: Vec<Task>, edges: Vec<DependencyEdge>) -> Self {
        let inner = MemoryInner {
            tasks: tasks.into_iter().map(|t| (t.id, t)).collect(),
            edges: edges.into_iter().collect(),
        };
        MemoryStore {
            inner: Mutex::new(inner),
            feed: FeedHub::new(),
            failing_updates: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            latency: std::sync::Mutex::new(None),
        }
    }

    /// Make the next `count` task updates fail.
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    /// While offline, every query and command fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every command by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Close the change feed, as if the push connection dropped.
    pub fn disconnect_feed(&self) {
        self.feed.shutdown();
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    /// Raw row as stored, without joined fields.
    pub async fn row(&self, id: TaskId) -> Option<Task> {
        self.inner.lock().await.tasks.get(&id).cloned()
    }

    pub async fn edges(&self) -> Vec<DependencyEdge> {
        self.inner.lock().await.edges.iter().copied().collect()
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store offline".into()))
        } else {
            Ok(())
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.latency.lock().ok().and_then(|g| *g);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_update_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQuery for MemoryStore {
    async fn fetch_tasks(&self, scope: Scope) -> StoreResult<Vec<Task>> {
        self.check_online()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.parent_id.is_none() && scope.includes(t))
            .map(|t| inner.joined(t))
            .collect())
    }

    async fn fetch_edges(&self, dependents: &[TaskId]) -> StoreResult<Vec<DependencyEdge>> {
        self.check_online()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .edges
            .iter()
            .filter(|e| dependents.contains(&e.dependent_id))
            .copied()
            .collect())
    }

    async fn fetch_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        self.check_online()?;
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&id).map(|t| inner.joined(t)))
    }
}

#[async_trait]
impl TaskCommand for MemoryStore {
    async fn insert_task(&self, new: NewTask) -> StoreResult<Task> {
        self.simulate_latency().await;
        self.check_online()?;
        let task = {
            let mut inner = self.inner.lock().await;
            if let Some(parent) = new.parent_id {
                if !inner.tasks.contains_key(&parent) {
                    return Err(StoreError::NotFound(parent));
                }
            }
            let id = inner.next_id();
            let task = Task {
                description: new.description,
                status: new.status,
                priority: new.priority,
                due_date: new.due_date,
                assignee_id: new.assignee_id,
                team_id: new.team_id,
                parent_id: new.parent_id,
                ..Task::new(id, new.title, new.owner_id, Utc::now())
            };
            inner.tasks.insert(id, task.clone());
            task
        };
        trace!(task_id = task.id, "memory store: inserted task");
        self.feed.publish(
            ChangeEvent::new(Table::Tasks, ChangeKind::Insert)
                .row(task.id)
                .team(task.team_id),
        );
        Ok(task)
    }

    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> StoreResult<()> {
        self.simulate_latency().await;
        self.check_online()?;
        if self.take_update_failure() {
            return Err(StoreError::Unavailable("injected update failure".into()));
        }
        let (old_team, new_team) = {
            let mut inner = self.inner.lock().await;
            let task = inner.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let old_team = task.team_id;
            patch.apply_to(task);
            (old_team, task.team_id)
        };
        self.feed
            .publish(ChangeEvent::new(Table::Tasks, ChangeKind::Update).row(id).team(new_team));
        if old_team != new_team {
            self.feed
                .publish(ChangeEvent::new(Table::Tasks, ChangeKind::Update).row(id).team(old_team));
        }
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> StoreResult<()> {
        self.simulate_latency().await;
        self.check_online()?;
        let team = {
            let mut inner = self.inner.lock().await;
            let removed = inner.tasks.remove(&id).ok_or(StoreError::NotFound(id))?;
            inner.edges.retain(|e| e.dependent_id != id && e.dependency_id != id);
            removed.team_id
        };
        self.feed
            .publish(ChangeEvent::new(Table::Tasks, ChangeKind::Delete).row(id).team(team));
        Ok(())
    }

    async fn insert_edge(&self, edge: DependencyEdge) -> StoreResult<()> {
        self.simulate_latency().await;
        self.check_online()?;
        let team = {
            let mut inner = self.inner.lock().await;
            for id in [edge.dependent_id, edge.dependency_id] {
                if !inner.tasks.contains_key(&id) {
                    return Err(StoreError::NotFound(id));
                }
            }
            if !inner.edges.insert(edge) {
                return Err(StoreError::DuplicateEdge {
                    dependent_id: edge.dependent_id,
                    dependency_id: edge.dependency_id,
                });
            }
            inner.tasks.get(&edge.dependent_id).and_then(|t| t.team_id)
        };
        self.feed.publish(
            ChangeEvent::new(Table::TaskDependencies, ChangeKind::Insert)
                .row(edge.dependent_id)
                .team(team),
        );
        Ok(())
    }

    async fn delete_edge(&self, edge: DependencyEdge) -> StoreResult<()> {
        self.simulate_latency().await;
        self.check_online()?;
        let team = {
            let mut inner = self.inner.lock().await;
            inner.edges.remove(&edge);
            inner.tasks.get(&edge.dependent_id).and_then(|t| t.team_id)
        };
        self.feed.publish(
            ChangeEvent::new(Table::TaskDependencies, ChangeKind::Delete)
                .row(edge.dependent_id)
                .team(team),
        );
        Ok(())
    }
}

impl ChangeFeed for MemoryStore {
    fn subscribe(&self, table: Table, filter: Option<RowFilter>) -> StoreResult<Subscription> {
        self.feed.subscribe(table, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task(id: TaskId) -> Task {
        Task::new(id, format!("task {id}"), 1, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()).with_team(1)
    }

    #[tokio::test]
    async fn test_fetch_joins_subtask_counts() {
        let mut sub_done = task(2).with_status(Status::Done);
        sub_done.parent_id = Some(1);
        let mut sub_open = task(3);
        sub_open.parent_id = Some(1);
        let store = MemoryStore::with_tasks(vec![task(1), sub_done, sub_open], vec![]);

        let tasks = store.fetch_tasks(Scope::Team(1)).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].subtasks, SubtaskCounts { total: 2, completed: 1 });
    }

    #[tokio::test]
    async fn test_duplicate_edge_rejected() {
        let store = MemoryStore::with_tasks(vec![task(1), task(2)], vec![]);
        store.insert_edge(DependencyEdge::new(1, 2)).await.unwrap();
        let err = store.insert_edge(DependencyEdge::new(1, 2)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEdge { .. }));
        // The reverse pair is a different edge.
        store.insert_edge(DependencyEdge::new(2, 1)).await.unwrap();
        assert_eq!(store.edges().await.len(), 2);
    }

    #[tokio::test]
    async fn test_edge_to_unknown_task_rejected() {
        let store = MemoryStore::with_tasks(vec![task(1)], vec![]);
        let err = store.insert_edge(DependencyEdge::new(1, 9)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(9)));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::with_tasks(vec![task(1)], vec![]);
        store.fail_next_updates(1);
        assert!(store.update_task(1, &TaskPatch::status(Status::Done)).await.is_err());
        assert!(store.update_task(1, &TaskPatch::status(Status::Done)).await.is_ok());
        assert_eq!(store.row(1).await.map(|t| t.status), Some(Status::Done));
    }

    #[tokio::test]
    async fn test_commands_publish_events() {
        let store = MemoryStore::with_tasks(vec![task(1)], vec![]);
        let mut sub = store.subscribe(Table::Tasks, Some(RowFilter::Team(1))).unwrap();
        store.update_task(1, &TaskPatch::status(Status::InProgress)).await.unwrap();
        let event = sub.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.row_id, Some(1));
    }

    #[tokio::test]
    async fn test_delete_cascades_edges() {
        let store = MemoryStore::with_tasks(vec![task(1), task(2)], vec![DependencyEdge::new(1, 2)]);
        store.delete_task(2).await.unwrap();
        assert!(store.edges().await.is_empty());
        assert!(store.fetch_task(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_store_fails_queries() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.fetch_tasks(Scope::User(1)).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
