//! Real-time reconciliation.
//!
//! Any change notification for the task or dependency table triggers a full
//! refetch of the board's scope: tasks, their edges, and any dependency tasks
//! that live outside the scope. Blocked state is recomputed over the fresh
//! data and the cache is replaced. Payloads are never trusted, so a client
//! seeing its own write echoed back simply refetches the same state.
//!
//! The task subscription is unfiltered because dependencies may belong to
//! another team. Task events are skipped only when they name a row that is
//! neither in scope nor a dependency of the board.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{self, SharedCache};
use crate::error::StoreResult;
use crate::feed::Subscription;
use crate::fields::MissingDependencyPolicy;
use crate::graph;
use crate::store::{ChangeEvent, ChangeFeed, Scope, Table, TaskQuery};
use crate::task::TaskId;

/// Counts from one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub tasks: usize,
    pub edges: usize,
    pub outside_scope: usize,
    pub removed: usize,
    pub pending_reapplied: usize,
}

pub struct Reconciler<B: ?Sized> {
    backend: Arc<B>,
    cache: SharedCache,
    scope: Scope,
    policy: MissingDependencyPolicy,
}

impl<B> Reconciler<B>
where
    B: TaskQuery + ?Sized,
{
    pub fn new(backend: Arc<B>, cache: SharedCache, scope: Scope, policy: MissingDependencyPolicy) -> Self {
        Reconciler {
            backend,
            cache,
            scope,
            policy,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Refetch the scope and replace the cache contents.
    ///
    /// Entries with a mutation still in flight keep their optimistic patch on
    /// top of the fetched row, so a refetch that raced ahead of the store
    /// does not flicker the card back.
    ///
    /// A dependency outside the scope that cannot be fetched is treated as
    /// not found and goes through the missing-dependency policy; only a
    /// failed scope or edge query fails the refresh.
    pub async fn refresh(&self) -> StoreResult<RefreshStats> {
        let mut tasks = self.backend.fetch_tasks(self.scope).await?;
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        let edges = if ids.is_empty() {
            Vec::new()
        } else {
            let unique: BTreeSet<_> = self.backend.fetch_edges(&ids).await?.into_iter().collect();
            unique.into_iter().collect()
        };

        let in_scope: HashSet<TaskId> = ids.iter().copied().collect();
        let missing: BTreeSet<TaskId> = edges
            .iter()
            .map(|e| e.dependency_id)
            .filter(|id| !in_scope.contains(id))
            .collect();
        let mut outside = Vec::with_capacity(missing.len());
        for id in missing {
            match self.backend.fetch_task(id).await {
                Ok(Some(task)) => outside.push(task),
                Ok(None) => debug!(task_id = id, "dependency not found; evaluated as missing"),
                Err(e) => warn!(task_id = id, error = %e, "dependency fetch failed; evaluated as missing"),
            }
        }

        let mut cache = cache::lock(&self.cache);

        let mut pending_reapplied = 0;
        for task in tasks.iter_mut() {
            if let Some(patch) = cache.pending(task.id) {
                patch.apply_to(task);
                pending_reapplied += 1;
            }
        }

        let blocked = graph::compute_blocked_with(tasks.iter().chain(outside.iter()), &edges, self.policy);
        for task in tasks.iter_mut() {
            task.dependencies = blocked.get(&task.id).copied().unwrap_or_default();
        }

        let before = cache.len();
        cache.retain_ids(&in_scope);
        let removed = before - cache.len();

        let stats = RefreshStats {
            tasks: tasks.len(),
            edges: edges.len(),
            outside_scope: outside.len(),
            removed,
            pending_reapplied,
        };
        cache.replace_edges(edges);
        cache.replace_outside_scope(outside);
        cache.upsert_many(tasks);
        debug!(scope = ?self.scope, ?stats, "board refreshed");
        Ok(stats)
    }

    /// Whether a change can affect this board: a task row in scope, a row the
    /// board depends on, or an event that does not say which row changed.
    fn is_relevant(&self, event: &ChangeEvent) -> bool {
        if event.table != Table::Tasks {
            return true;
        }
        if self.scope.row_filter().map_or(true, |f| f.matches(event)) {
            return true;
        }
        match event.row_id {
            Some(id) => cache::lock(&self.cache).edges().iter().any(|e| e.dependency_id == id),
            None => true,
        }
    }

    async fn on_event(&self, event: ChangeEvent) {
        debug!(table = ?event.table, kind = ?event.kind, row = ?event.row_id, "change notification");
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "refresh after change notification failed; will retry on next event");
        }
    }
}

impl<B> Reconciler<B>
where
    B: TaskQuery + ChangeFeed + ?Sized + 'static,
{
    /// Subscribe to the task and dependency tables and refresh on every event
    /// until the returned handle is stopped or the feed closes.
    pub fn start(self: Arc<Self>) -> StoreResult<ReconcilerHandle> {
        // Unfiltered: dependency rows of other teams gate this board too.
        let tasks = self.backend.subscribe(Table::Tasks, None)?;
        let deps = self.backend.subscribe(Table::TaskDependencies, None)?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(self.listen(tasks, deps, stop_rx));
        Ok(ReconcilerHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }

    async fn listen(self: Arc<Self>, mut tasks: Subscription, mut deps: Subscription, mut stop: oneshot::Receiver<()>) {
        info!(scope = ?self.scope, "listening for board changes");
        loop {
            let event = tokio::select! {
                _ = &mut stop => break,
                event = tasks.next() => event,
                event = deps.next() => event,
            };
            match event {
                Some(event) if self.is_relevant(&event) => self.on_event(event).await,
                Some(_) => {}
                None => {
                    warn!(scope = ?self.scope, "change feed closed; board continues on cached state");
                    break;
                }
            }
        }
        debug!(scope = ?self.scope, "stopped listening for board changes");
    }
}

/// Running subscription of one board. Dropping it stops the listener.
#[derive(Debug)]
pub struct ReconcilerHandle {
    stop: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Whether the listener is still running.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().map_or(false, |j| !j.is_finished())
    }

    /// Stop listening and wait for the listener to exit.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TaskCache;
    use crate::error::StoreError;
    use crate::fields::Status;
    use crate::memory::MemoryStore;
    use crate::store::{ChangeKind, TaskCommand};
    use crate::task::{DependencyEdge, Task, TaskPatch};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn task(id: TaskId, team: u64, status: Status) -> Task {
        Task::new(id, format!("task {id}"), 1, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .with_team(team)
            .with_status(status)
    }

    fn reconciler(store: &Arc<MemoryStore>, scope: Scope) -> Arc<Reconciler<MemoryStore>> {
        Arc::new(Reconciler::new(
            Arc::clone(store),
            TaskCache::shared(),
            scope,
            MissingDependencyPolicy::FailClosed,
        ))
    }

    fn cached_status(r: &Reconciler<MemoryStore>, id: TaskId) -> Option<Status> {
        cache::lock(&r.cache).get(id).map(|t| t.status)
    }

    #[tokio::test]
    async fn test_refresh_loads_scope_and_blocked_state() {
        let store = Arc::new(MemoryStore::with_tasks(
            vec![task(1, 1, Status::Todo), task(2, 1, Status::Todo), task(3, 2, Status::Todo)],
            vec![DependencyEdge::new(1, 2)],
        ));
        let r = reconciler(&store, Scope::Team(1));
        let stats = r.refresh().await.unwrap();
        assert_eq!(stats.tasks, 2);
        assert_eq!(stats.edges, 1);

        let cache = cache::lock(&r.cache);
        assert!(cache.get(1).map(|t| t.dependencies.is_blocked()).unwrap_or(false));
        assert!(!cache.contains(3));
    }

    #[tokio::test]
    async fn test_dependency_outside_scope_is_fetched() {
        let store = Arc::new(MemoryStore::with_tasks(
            vec![task(1, 1, Status::Todo), task(9, 2, Status::Done)],
            vec![DependencyEdge::new(1, 9)],
        ));
        let r = reconciler(&store, Scope::Team(1));
        let stats = r.refresh().await.unwrap();
        assert_eq!(stats.outside_scope, 1);
        let cache = cache::lock(&r.cache);
        assert!(!cache.get(1).map(|t| t.dependencies.is_blocked()).unwrap_or(true));
        assert!(!cache.contains(9));
    }

    #[tokio::test]
    async fn test_refresh_drops_vanished_tasks() {
        let store = Arc::new(MemoryStore::with_tasks(
            vec![task(1, 1, Status::Todo), task(2, 1, Status::Todo)],
            vec![],
        ));
        let r = reconciler(&store, Scope::Team(1));
        r.refresh().await.unwrap();
        store.delete_task(2).await.unwrap();
        let stats = r.refresh().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(cached_status(&r, 2), None);
    }

    #[tokio::test]
    async fn test_pending_patch_survives_stale_refetch() {
        let store = Arc::new(MemoryStore::with_tasks(vec![task(1, 1, Status::Todo)], vec![]));
        let r = reconciler(&store, Scope::Team(1));
        r.refresh().await.unwrap();
        cache::lock(&r.cache).mark_pending(1, TaskPatch::status(Status::InProgress));

        let stats = r.refresh().await.unwrap();
        assert_eq!(stats.pending_reapplied, 1);
        assert_eq!(cached_status(&r, 1), Some(Status::InProgress));
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_cache() {
        let store = Arc::new(MemoryStore::with_tasks(vec![task(1, 1, Status::Todo)], vec![]));
        let r = reconciler(&store, Scope::Team(1));
        r.refresh().await.unwrap();
        store.set_offline(true);
        assert!(r.refresh().await.is_err());
        assert_eq!(cached_status(&r, 1), Some(Status::Todo));
    }

    #[tokio::test]
    async fn test_listener_refreshes_on_remote_change() {
        let store = Arc::new(MemoryStore::with_tasks(vec![task(1, 1, Status::Todo)], vec![]));
        let r = reconciler(&store, Scope::Team(1));
        r.refresh().await.unwrap();
        let handle = Arc::clone(&r).start().unwrap();

        store.update_task(1, &TaskPatch::status(Status::Done)).await.unwrap();
        for _ in 0..50 {
            if cached_status(&r, 1) == Some(Status::Done) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cached_status(&r, 1), Some(Status::Done));
        assert!(handle.is_running());
        handle.stop().await;
        assert_eq!(store.feed().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_events_for_unrelated_rows_are_skipped() {
        let store = Arc::new(MemoryStore::with_tasks(
            vec![task(1, 1, Status::Todo), task(5, 2, Status::Todo), task(9, 2, Status::Todo)],
            vec![DependencyEdge::new(1, 9)],
        ));
        let r = reconciler(&store, Scope::Team(1));
        r.refresh().await.unwrap();

        let update = |row: TaskId, team: u64| ChangeEvent::new(Table::Tasks, ChangeKind::Update).row(row).team(Some(team));
        assert!(r.is_relevant(&update(1, 1)));
        assert!(r.is_relevant(&update(9, 2)));
        assert!(!r.is_relevant(&update(5, 2)));
        assert!(r.is_relevant(&ChangeEvent::new(Table::Tasks, ChangeKind::Update)));
        assert!(r.is_relevant(&ChangeEvent::new(Table::TaskDependencies, ChangeKind::Insert)));
    }

    #[tokio::test]
    async fn test_listener_follows_dependency_of_another_team() {
        let store = Arc::new(MemoryStore::with_tasks(
            vec![task(1, 1, Status::Todo), task(9, 2, Status::Todo)],
            vec![DependencyEdge::new(1, 9)],
        ));
        let r = reconciler(&store, Scope::Team(1));
        r.refresh().await.unwrap();
        let blocked = |r: &Reconciler<MemoryStore>| cache::lock(&r.cache).get(1).map(|t| t.dependencies.is_blocked());
        assert_eq!(blocked(&r), Some(true));
        let handle = Arc::clone(&r).start().unwrap();

        store.update_task(9, &TaskPatch::status(Status::Done)).await.unwrap();
        for _ in 0..50 {
            if blocked(&r) == Some(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(blocked(&r), Some(false));
        handle.stop().await;
    }

    /// Delegates to a memory store but cannot look up single tasks.
    struct NoSingleFetch(MemoryStore);

    #[async_trait::async_trait]
    impl TaskQuery for NoSingleFetch {
        async fn fetch_tasks(&self, scope: Scope) -> StoreResult<Vec<Task>> {
            self.0.fetch_tasks(scope).await
        }

        async fn fetch_edges(&self, dependents: &[TaskId]) -> StoreResult<Vec<DependencyEdge>> {
            self.0.fetch_edges(dependents).await
        }

        async fn fetch_task(&self, _id: TaskId) -> StoreResult<Option<Task>> {
            Err(StoreError::Unavailable("lookup failed".into()))
        }
    }

    #[tokio::test]
    async fn test_unfetchable_dependency_counts_as_missing() {
        let store = Arc::new(NoSingleFetch(MemoryStore::with_tasks(
            vec![task(1, 1, Status::Todo), task(2, 1, Status::Todo), task(9, 2, Status::Done)],
            vec![DependencyEdge::new(1, 9)],
        )));
        let r = Reconciler::new(store, TaskCache::shared(), Scope::Team(1), MissingDependencyPolicy::FailClosed);
        let stats = r.refresh().await.unwrap();
        assert_eq!(stats.tasks, 2);
        assert_eq!(stats.outside_scope, 0);

        let cache = cache::lock(&r.cache);
        assert!(cache.get(1).map(|t| t.dependencies.is_blocked()).unwrap_or(false));
        assert!(cache.contains(2));
    }

    #[tokio::test]
    async fn test_listener_exits_when_feed_closes() {
        let store = Arc::new(MemoryStore::new());
        let r = reconciler(&store, Scope::User(1));
        let handle = Arc::clone(&r).start().unwrap();
        store.disconnect_feed();
        for _ in 0..50 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_running());
    }
}
