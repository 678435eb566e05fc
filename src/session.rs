//! One open board.
//!
//! A session owns the board's cache and wires the pieces around it: the
//! mutation pipeline and arrangement engine write through it, and a single
//! reconciler subscription keeps it in step with the store until the session
//! is closed.

use std::sync::Arc;

use tracing::{info, warn};

use crate::board::{Board, CardMove, MoveOutcome};
use crate::cache::{self, SharedCache, TaskCache};
use crate::config::BoardSettings;
use crate::deps::{DependencyDiff, DependencyStore};
use crate::error::{Result, StoreResult};
use crate::fields::MissingDependencyPolicy;
use crate::graph::{self, DependencyGraph};
use crate::pipeline::MutationPipeline;
use crate::reconciler::{Reconciler, ReconcilerHandle, RefreshStats};
use crate::store::{Backend, Scope, TaskCommand};
use crate::task::{BlockedInfo, NewTask, Task, TaskId, TaskPatch, TeamId};

pub struct BoardSession<B: ?Sized + 'static> {
    backend: Arc<B>,
    pipeline: Arc<MutationPipeline<B>>,
    reconciler: Arc<Reconciler<B>>,
    deps: DependencyStore<B>,
    board: Board<B>,
    listener: Option<ReconcilerHandle>,
}

impl<B> BoardSession<B>
where
    B: Backend + ?Sized + 'static,
{
    /// Load the scope and subscribe to changes.
    ///
    /// A failed initial load is an error. A failed subscription is not: the
    /// board opens on the loaded state and only updates on `refresh`.
    pub async fn open(backend: Arc<B>, scope: Scope, settings: &BoardSettings) -> StoreResult<Self> {
        let cache = TaskCache::shared();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&backend),
            cache.clone(),
            scope,
            settings.missing_dependencies,
        ));
        let stats = reconciler.refresh().await?;

        let listener = match Arc::clone(&reconciler).start() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(?scope, error = %e, "could not subscribe to changes; board will not update live");
                None
            }
        };

        let pipeline = Arc::new(MutationPipeline::new(Arc::clone(&backend), cache, settings));
        let board = Board::new(Arc::clone(&pipeline), None);
        info!(?scope, tasks = stats.tasks, live = listener.is_some(), "board opened");

        Ok(BoardSession {
            deps: DependencyStore::new(Arc::clone(&backend)),
            backend,
            pipeline,
            reconciler,
            board,
            listener,
        })
    }

    /// Stop the change subscription.
    pub async fn close(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
        info!(scope = ?self.scope(), "board closed");
    }

    pub fn scope(&self) -> Scope {
        self.reconciler.scope()
    }

    pub fn cache(&self) -> &SharedCache {
        self.pipeline.cache()
    }

    pub fn policy(&self) -> MissingDependencyPolicy {
        self.pipeline.policy()
    }

    pub fn board(&self) -> &Board<B> {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut Board<B> {
        &mut self.board
    }

    /// Whether the change subscription is still delivering events.
    pub fn is_live(&self) -> bool {
        self.listener.as_ref().is_some_and(ReconcilerHandle::is_running)
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        cache::lock(self.cache()).get(id).cloned()
    }

    /// Narrow the board to one team, or show everything in scope.
    pub fn set_team_filter(&mut self, team: Option<TeamId>) {
        self.board.set_team_filter(team);
    }

    /// Teams present among the cached tasks, ascending.
    pub fn teams(&self) -> Vec<TeamId> {
        let cache = cache::lock(self.cache());
        let mut teams: Vec<TeamId> = cache.all().into_iter().filter_map(|t| t.team_id).collect();
        teams.sort_unstable();
        teams.dedup();
        teams
    }

    /// Edit a task through the optimistic pipeline.
    pub async fn mutate(&mut self, task_id: TaskId, patch: TaskPatch) -> Result<()> {
        let result = self.pipeline.mutate(task_id, patch).await;
        self.board.sync();
        result
    }

    pub async fn move_card(&mut self, mv: CardMove) -> Result<MoveOutcome> {
        self.board.move_card(mv).await
    }

    /// Insert a task and reload the board.
    pub async fn create(&mut self, task: NewTask) -> Result<Task> {
        let task = self.backend.insert_task(task).await?;
        self.refresh().await?;
        Ok(task)
    }

    /// Refetch the scope now. This is the recovery path after the change feed
    /// has gone away.
    pub async fn refresh(&mut self) -> StoreResult<RefreshStats> {
        let stats = self.reconciler.refresh().await?;
        self.board.sync();
        Ok(stats)
    }

    /// Fresh blocked state of a cached task.
    pub fn blocked(&self, id: TaskId) -> BlockedInfo {
        graph::blocked_in_cache(&cache::lock(self.cache()), id, self.policy())
    }

    /// Incomplete direct dependencies of a cached task.
    pub fn blockers(&self, id: TaskId) -> Vec<TaskId> {
        graph::blockers_in_cache(&cache::lock(self.cache()), id, self.policy())
    }

    /// Direct dependencies of a task as currently cached.
    pub fn dependencies_of(&self, id: TaskId) -> Vec<TaskId> {
        let cache = cache::lock(self.cache());
        DependencyGraph::from_edges(cache.edges()).dependencies_of(id).collect()
    }

    /// Cached tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: TaskId) -> Vec<TaskId> {
        let cache = cache::lock(self.cache());
        DependencyGraph::from_edges(cache.edges()).dependents_of(id)
    }

    pub async fn add_dependency(&mut self, dependent: TaskId, dependency: TaskId) -> Result<()> {
        self.deps.add(dependent, dependency).await?;
        self.refresh().await?;
        Ok(())
    }

    pub async fn remove_dependency(&mut self, dependent: TaskId, dependency: TaskId) -> Result<()> {
        self.deps.remove(dependent, dependency).await?;
        self.refresh().await?;
        Ok(())
    }

    /// Replace a task's whole dependency list.
    pub async fn set_dependencies(&mut self, dependent: TaskId, dependencies: &[TaskId]) -> Result<DependencyDiff> {
        let diff = self.deps.replace(dependent, dependencies).await?;
        if !diff.is_empty() {
            self.refresh().await?;
        }
        Ok(diff)
    }
}
