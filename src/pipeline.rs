//! Optimistic mutation pipeline.
//!
//! A mutation is applied to the cache before the store hears about it, so the
//! board reflects it immediately. If the store rejects the command the entry
//! is put back exactly as it was and the failure is returned to the caller.
//!
//! Mutations of the same task are serialised by default: a second edit waits
//! for the first to settle, so a rollback can never overwrite a newer
//! optimistic write. With serialisation disabled, same-task mutations race
//! and the last rollback wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::cache::{self, SharedCache};
use crate::config::BoardSettings;
use crate::error::{BoardError, Result};
use crate::fields::MissingDependencyPolicy;
use crate::graph;
use crate::guard;
use crate::store::TaskCommand;
use crate::task::{Task, TaskId, TaskPatch};

type TaskLocks = Mutex<HashMap<TaskId, Arc<AsyncMutex<()>>>>;

pub struct MutationPipeline<B: ?Sized> {
    backend: Arc<B>,
    cache: SharedCache,
    policy: MissingDependencyPolicy,
    serialize_per_task: bool,
    task_locks: TaskLocks,
}

/// Exclusive right to mutate one task. Dropping it releases the task and
/// removes its lock entry when no other mutation is waiting on it.
struct TaskPermit<'a> {
    locks: &'a TaskLocks,
    task_id: TaskId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskPermit<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.task_id).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.task_id);
        }
    }
}

impl<B> MutationPipeline<B>
where
    B: TaskCommand + ?Sized,
{
    pub fn new(backend: Arc<B>, cache: SharedCache, settings: &BoardSettings) -> Self {
        MutationPipeline {
            backend,
            cache,
            policy: settings.missing_dependencies,
            serialize_per_task: settings.serialize_task_mutations,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn policy(&self) -> MissingDependencyPolicy {
        self.policy
    }

    async fn acquire(&self, task_id: TaskId) -> Option<TaskPermit<'_>> {
        if !self.serialize_per_task {
            return None;
        }
        let lock = {
            let mut locks = self.task_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(task_id).or_default())
        };
        Some(TaskPermit {
            locks: &self.task_locks,
            task_id,
            guard: Some(lock.lock_owned().await),
        })
    }

    /// Apply `patch` to `task_id` optimistically and send it to the store.
    ///
    /// Status changes are checked against freshly evaluated dependencies
    /// first; a blocked change returns `BoardError::Blocked` and touches
    /// nothing. A store failure restores the pre-mutation snapshot and
    /// returns `BoardError::Remote`.
    pub async fn mutate(&self, task_id: TaskId, patch: TaskPatch) -> Result<()> {
        let _permit = self.acquire(task_id).await;

        let previous = self.apply_optimistic(task_id, &patch)?;

        match self.backend.update_task(task_id, &patch).await {
            Ok(()) => {
                cache::lock(&self.cache).clear_pending(task_id);
                debug!(task_id, "mutation confirmed by store");
                Ok(())
            }
            Err(source) => {
                warn!(task_id, error = %source, "mutation failed, rolling back");
                self.rollback(previous);
                Err(BoardError::Remote { task_id, source })
            }
        }
    }

    /// Guard check and optimistic write, under one cache lock. Returns the
    /// snapshot to restore on failure.
    fn apply_optimistic(&self, task_id: TaskId, patch: &TaskPatch) -> Result<Task> {
        let mut cache = cache::lock(&self.cache);
        let current = cache.get(task_id).cloned().ok_or(BoardError::TaskNotFound(task_id))?;

        if let Some(target) = patch.status {
            let blocked = graph::blocked_in_cache(&cache, task_id, self.policy);
            guard::check_transition(&current, target, &blocked, || {
                graph::blockers_in_cache(&cache, task_id, self.policy)
            })?;
        }

        let mut next = current.clone();
        patch.apply_to(&mut next);
        cache.upsert(next);
        cache.mark_pending(task_id, patch.clone());
        graph::rederive(&mut cache, self.policy);
        Ok(current)
    }

    fn rollback(&self, previous: Task) {
        let mut cache = cache::lock(&self.cache);
        cache.clear_pending(previous.id);
        if !cache.contains(previous.id) {
            // Removed by reconciliation while in flight; nothing to restore.
            return;
        }
        cache.upsert(previous.clone());
        graph::rederive(&mut cache, self.policy);
        // Restore the exact snapshot, derived fields included.
        cache.upsert(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TaskCache;
    use crate::fields::Status;
    use crate::memory::MemoryStore;
    use crate::task::DependencyEdge;
    use chrono::{TimeZone, Utc};

    fn task(id: TaskId, status: Status) -> Task {
        Task::new(id, format!("task {id}"), 1, Utc.with_ymd_and_hms(2024, 1, id as u32, 0, 0, 0).unwrap())
            .with_status(status)
            .with_team(1)
    }

    fn setup(tasks: Vec<Task>, edges: Vec<DependencyEdge>) -> (Arc<MemoryStore>, MutationPipeline<MemoryStore>) {
        let backend = Arc::new(MemoryStore::with_tasks(tasks.clone(), edges.clone()));
        let cache = TaskCache::shared();
        {
            let mut c = cache::lock(&cache);
            c.upsert_many(tasks);
            c.replace_edges(edges);
            graph::rederive(&mut c, MissingDependencyPolicy::FailClosed);
        }
        let pipeline = MutationPipeline::new(Arc::clone(&backend), cache, &BoardSettings::default());
        (backend, pipeline)
    }

    fn cached(pipeline: &MutationPipeline<MemoryStore>, id: TaskId) -> Option<Task> {
        cache::lock(pipeline.cache()).get(id).cloned()
    }

    #[tokio::test]
    async fn test_successful_mutation_updates_cache_and_store() {
        let (backend, pipeline) = setup(vec![task(1, Status::Todo)], vec![]);
        pipeline.mutate(1, TaskPatch::status(Status::InProgress)).await.unwrap();
        assert_eq!(cached(&pipeline, 1).map(|t| t.status), Some(Status::InProgress));
        assert_eq!(backend.row(1).await.map(|t| t.status), Some(Status::InProgress));
        assert!(cache::lock(pipeline.cache()).pending(1).is_none());
    }

    #[tokio::test]
    async fn test_failed_mutation_restores_snapshot() {
        let (backend, pipeline) = setup(vec![task(1, Status::Todo)], vec![]);
        let before = cached(&pipeline, 1);
        backend.fail_next_updates(1);

        let patch = TaskPatch {
            title: Some("renamed".into()),
            status: Some(Status::Done),
            ..TaskPatch::default()
        };
        let err = pipeline.mutate(1, patch).await.unwrap_err();
        assert!(matches!(err, BoardError::Remote { task_id: 1, .. }));
        assert_eq!(cached(&pipeline, 1), before);
        assert!(cache::lock(pipeline.cache()).pending(1).is_none());
    }

    #[tokio::test]
    async fn test_blocked_mutation_touches_nothing() {
        let (backend, pipeline) = setup(
            vec![task(1, Status::Todo), task(2, Status::Todo)],
            vec![DependencyEdge::new(1, 2)],
        );
        let before = cached(&pipeline, 1);
        let generation = cache::lock(pipeline.cache()).generation();

        let err = pipeline.mutate(1, TaskPatch::status(Status::Done)).await.unwrap_err();
        match err {
            BoardError::Blocked { blockers, .. } => assert_eq!(blockers, vec![2]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(cached(&pipeline, 1), before);
        assert_eq!(cache::lock(pipeline.cache()).generation(), generation);
        assert_eq!(backend.row(1).await.map(|t| t.status), Some(Status::Todo));
    }

    #[tokio::test]
    async fn test_completing_dependency_unblocks_dependent() {
        let (_backend, pipeline) = setup(
            vec![task(1, Status::Todo), task(2, Status::Todo)],
            vec![DependencyEdge::new(1, 2)],
        );
        pipeline.mutate(2, TaskPatch::status(Status::Done)).await.unwrap();
        assert!(!cached(&pipeline, 1).map(|t| t.dependencies.is_blocked()).unwrap_or(true));
        pipeline.mutate(1, TaskPatch::status(Status::Done)).await.unwrap();
        assert_eq!(cached(&pipeline, 1).map(|t| t.status), Some(Status::Done));
    }

    #[tokio::test]
    async fn test_reset_to_todo_allowed_while_blocked() {
        let (_backend, pipeline) = setup(
            vec![task(1, Status::InProgress), task(2, Status::Todo)],
            vec![DependencyEdge::new(1, 2)],
        );
        pipeline.mutate(1, TaskPatch::status(Status::Todo)).await.unwrap();
        assert_eq!(cached(&pipeline, 1).map(|t| t.status), Some(Status::Todo));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let (_backend, pipeline) = setup(vec![], vec![]);
        assert!(matches!(
            pipeline.mutate(5, TaskPatch::status(Status::Done)).await,
            Err(BoardError::TaskNotFound(5))
        ));
    }

    #[tokio::test]
    async fn test_same_task_mutations_are_serialised() {
        let (backend, pipeline) = setup(vec![task(1, Status::Todo)], vec![]);
        let pipeline = Arc::new(pipeline);
        backend.set_latency(Some(std::time::Duration::from_millis(20)));
        backend.fail_next_updates(1);

        let first = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.mutate(1, TaskPatch::status(Status::InProgress)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.mutate(1, TaskPatch::status(Status::Done)).await })
        };

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_ok());
        // The failed first mutation rolled back before the second applied.
        assert_eq!(cached(&pipeline, 1).map(|t| t.status), Some(Status::Done));
        assert_eq!(backend.row(1).await.map(|t| t.status), Some(Status::Done));
        assert_eq!(lock_count(&pipeline), 0);
    }

    fn lock_count(pipeline: &MutationPipeline<MemoryStore>) -> usize {
        pipeline.task_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_task_locks_are_released_once_settled() {
        let (backend, pipeline) = setup((1..=20).map(|id| task(id, Status::Todo)).collect(), vec![]);
        for id in 1..=20 {
            pipeline.mutate(id, TaskPatch::status(Status::InProgress)).await.unwrap();
        }
        backend.fail_next_updates(1);
        assert!(pipeline.mutate(3, TaskPatch::status(Status::Done)).await.is_err());
        assert!(pipeline.mutate(404, TaskPatch::status(Status::Done)).await.is_err());
        assert_eq!(lock_count(&pipeline), 0);
    }

    #[tokio::test]
    async fn test_waiting_mutation_keeps_task_lock() {
        let (backend, pipeline) = setup(vec![task(1, Status::Todo)], vec![]);
        let pipeline = Arc::new(pipeline);
        backend.set_latency(Some(std::time::Duration::from_millis(30)));

        let first = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.mutate(1, TaskPatch::status(Status::InProgress)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.mutate(1, TaskPatch::status(Status::Done)).await })
        };

        first.await.unwrap().unwrap();
        // The second mutation now holds the lock, so the entry stays.
        assert_eq!(lock_count(&pipeline), 1);
        second.await.unwrap().unwrap();
        assert_eq!(lock_count(&pipeline), 0);
    }
}
