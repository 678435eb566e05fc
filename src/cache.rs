//! Client-local task cache.
//!
//! The cache is the single source of truth the board renders from. It holds
//! one snapshot per task id, replaced wholesale on every write, plus the
//! dependency edges and out-of-scope dependency tasks that the evaluator needs
//! to derive blocked state. One cache exists per open board session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::task::{DependencyEdge, Task, TaskId, TaskPatch};

/// A cache shared by reference between the board, pipeline and reconciler.
pub type SharedCache = Arc<Mutex<TaskCache>>;

/// Lock a shared cache. A poisoned lock still holds consistent snapshots
/// because every write replaces whole entries.
pub fn lock(cache: &SharedCache) -> MutexGuard<'_, TaskCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct TaskCache {
    entries: HashMap<TaskId, Task>,
    outside_scope: HashMap<TaskId, Task>,
    edges: Vec<DependencyEdge>,
    pending: HashMap<TaskId, TaskPatch>,
    generation: u64,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a fresh cache for sharing.
    pub fn shared() -> SharedCache {
        Arc::new(Mutex::new(TaskCache::new()))
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replace one entry.
    pub fn upsert(&mut self, task: Task) {
        self.entries.insert(task.id, task);
        self.bump();
    }

    /// Replace many entries. Each snapshot overwrites the previous one for its
    /// id; fields are never merged.
    pub fn upsert_many<I>(&mut self, snapshots: I)
    where
        I: IntoIterator<Item = Task>,
    {
        for task in snapshots {
            self.entries.insert(task.id, task);
        }
        self.bump();
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let removed = self.entries.remove(&id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Drop every entry whose id is not in `keep`.
    pub fn retain_ids(&mut self, keep: &HashSet<TaskId>) {
        let before = self.entries.len();
        self.entries.retain(|id, _| keep.contains(id));
        if self.entries.len() != before {
            self.bump();
        }
    }

    /// All entries, newest first. Ties on creation time fall back to id.
    pub fn all(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.entries.values().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn replace_edges(&mut self, edges: Vec<DependencyEdge>) {
        self.edges = edges;
        self.bump();
    }

    /// Dependency tasks that live outside the board's scope. They feed the
    /// evaluator but are never rendered.
    pub fn outside_scope(&self) -> impl Iterator<Item = &Task> {
        self.outside_scope.values()
    }

    pub fn replace_outside_scope(&mut self, tasks: Vec<Task>) {
        self.outside_scope = tasks.into_iter().map(|t| (t.id, t)).collect();
        self.bump();
    }

    /// Record the optimistic patch of an in-flight mutation.
    pub fn mark_pending(&mut self, id: TaskId, patch: TaskPatch) {
        self.pending.insert(id, patch);
    }

    pub fn clear_pending(&mut self, id: TaskId) -> Option<TaskPatch> {
        self.pending.remove(&id)
    }

    pub fn pending(&self, id: TaskId) -> Option<&TaskPatch> {
        self.pending.get(&id)
    }

    /// Monotonic write counter, used by renderers to detect changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn bump(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Status;
    use chrono::{TimeZone, Utc};

    fn task(id: TaskId, day: u32) -> Task {
        Task::new(id, format!("task {id}"), 1, Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_upsert_replaces_whole_entry() {
        let mut cache = TaskCache::new();
        let mut first = task(1, 1);
        first.description = Some("old".into());
        cache.upsert(first);

        let second = task(1, 1).with_status(Status::Done);
        cache.upsert_many(vec![second.clone()]);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1), Some(&second));
        assert_eq!(cache.get(1).and_then(|t| t.description.clone()), None);
    }

    #[test]
    fn test_all_orders_newest_first() {
        let mut cache = TaskCache::new();
        cache.upsert_many(vec![task(1, 3), task(2, 1), task(3, 2), task(4, 2)]);
        let ids: Vec<TaskId> = cache.all().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 4, 3, 2]);
    }

    #[test]
    fn test_remove_and_retain() {
        let mut cache = TaskCache::new();
        cache.upsert_many(vec![task(1, 1), task(2, 1), task(3, 1)]);
        assert!(cache.remove(2).is_some());
        assert!(cache.remove(2).is_none());

        cache.retain_ids(&HashSet::from([3]));
        assert!(!cache.contains(1));
        assert!(cache.contains(3));
    }

    #[test]
    fn test_generation_moves_on_writes_only() {
        let mut cache = TaskCache::new();
        let start = cache.generation();
        cache.upsert(task(1, 1));
        let after_upsert = cache.generation();
        assert!(after_upsert > start);

        cache.remove(99);
        cache.retain_ids(&HashSet::from([1]));
        assert_eq!(cache.generation(), after_upsert);
    }

    #[test]
    fn test_pending_patches() {
        let mut cache = TaskCache::new();
        cache.mark_pending(1, TaskPatch::status(Status::Done));
        assert_eq!(cache.pending(1).and_then(|p| p.status), Some(Status::Done));
        assert!(cache.clear_pending(1).is_some());
        assert!(cache.pending(1).is_none());
    }
}
