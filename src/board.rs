//! Board arrangement.
//!
//! The board groups cached tasks into one column per status, each column
//! sorted by due date with undated cards last. Dragging a card inside its
//! column only reorders it locally; dragging it to another column is a status
//! change that must pass the transition guard before anything moves.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{self, SharedCache};
use crate::error::{BoardError, Result};
use crate::fields::Status;
use crate::graph;
use crate::guard;
use crate::pipeline::MutationPipeline;
use crate::store::TaskCommand;
use crate::task::{Task, TaskId, TaskPatch, TeamId};

/// Ordered task ids per status column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Columns {
    pub todo: Vec<TaskId>,
    pub in_progress: Vec<TaskId>,
    pub done: Vec<TaskId>,
}

impl Columns {
    pub fn column(&self, status: Status) -> &[TaskId] {
        match status {
            Status::Todo => &self.todo,
            Status::InProgress => &self.in_progress,
            Status::Done => &self.done,
        }
    }

    fn column_mut(&mut self, status: Status) -> &mut Vec<TaskId> {
        match status {
            Status::Todo => &mut self.todo,
            Status::InProgress => &mut self.in_progress,
            Status::Done => &mut self.done,
        }
    }

    /// Column and index of a card.
    pub fn position(&self, id: TaskId) -> Option<(Status, usize)> {
        Status::ALL
            .into_iter()
            .find_map(|status| self.column(status).iter().position(|&t| t == id).map(|i| (status, i)))
    }

    pub fn len(&self) -> usize {
        self.todo.len() + self.in_progress.len() + self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a card out and put it at `index` in `to`, clamped to the column end.
    fn relocate(&mut self, id: TaskId, to: Status, index: usize) {
        if let Some((from, i)) = self.position(id) {
            self.column_mut(from).remove(i);
        }
        let column = self.column_mut(to);
        let index = index.min(column.len());
        column.insert(index, id);
    }
}

/// Due date ascending, undated last.
fn by_due_date(a: &Task, b: &Task) -> Ordering {
    match (a.due_date, b.due_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Partition tasks into status columns.
///
/// With a team filter only that team's tasks are kept. Each column is sorted
/// by due date ascending with undated tasks last; ties keep input order.
pub fn arrange<'a, I>(tasks: I, team_filter: Option<TeamId>) -> Columns
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut buckets: [Vec<&Task>; 3] = Default::default();
    for task in tasks {
        if team_filter.is_some_and(|team| task.team_id != Some(team)) {
            continue;
        }
        buckets[task.status.column_index()].push(task);
    }
    let [todo, in_progress, done] = buckets.map(|mut bucket| {
        bucket.sort_by(|a, b| by_due_date(a, b));
        bucket.into_iter().map(|t| t.id).collect::<Vec<_>>()
    });
    Columns {
        todo,
        in_progress,
        done,
    }
}

/// A drag from one column position to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardMove {
    pub from: Status,
    pub from_index: usize,
    pub to: Status,
    pub to_index: usize,
}

impl CardMove {
    pub fn new(from: Status, from_index: usize, to: Status, to_index: usize) -> Self {
        CardMove {
            from,
            from_index,
            to,
            to_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Same-column reorder. Local only; undone by the next re-sort.
    Reordered { task_id: TaskId },
    /// Cross-column move, confirmed by the store.
    StatusChanged { task_id: TaskId, status: Status },
}

pub struct Board<B: ?Sized> {
    pipeline: Arc<MutationPipeline<B>>,
    team_filter: Option<TeamId>,
    columns: Columns,
    seen_generation: Option<u64>,
}

impl<B> Board<B>
where
    B: TaskCommand + ?Sized,
{
    pub fn new(pipeline: Arc<MutationPipeline<B>>, team_filter: Option<TeamId>) -> Self {
        let mut board = Board {
            pipeline,
            team_filter,
            columns: Columns::default(),
            seen_generation: None,
        };
        board.rearrange();
        board
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn cache(&self) -> &SharedCache {
        self.pipeline.cache()
    }

    pub fn team_filter(&self) -> Option<TeamId> {
        self.team_filter
    }

    pub fn set_team_filter(&mut self, team: Option<TeamId>) {
        self.team_filter = team;
        self.rearrange();
    }

    /// Rebuild the columns from the cache, discarding local reorders.
    pub fn rearrange(&mut self) {
        let cache = cache::lock(self.pipeline.cache());
        self.columns = arrange(cache.all(), self.team_filter);
        self.seen_generation = Some(cache.generation());
    }

    /// Rebuild the columns if the cache changed since the last arrangement.
    /// Returns whether anything was rebuilt.
    pub fn sync(&mut self) -> bool {
        let generation = cache::lock(self.pipeline.cache()).generation();
        if self.seen_generation == Some(generation) {
            return false;
        }
        self.rearrange();
        true
    }

    /// Snapshots of one column's cards, in column order.
    pub fn cards(&self, status: Status) -> Vec<Task> {
        let cache = cache::lock(self.pipeline.cache());
        self.columns
            .column(status)
            .iter()
            .filter_map(|&id| cache.get(id).cloned())
            .collect()
    }

    /// Apply a drag gesture.
    ///
    /// A cross-column move is checked against fresh dependency state first
    /// and, if rejected, leaves the columns exactly as they were. If the store
    /// then refuses the status change, the card goes back where it came from.
    pub async fn move_card(&mut self, mv: CardMove) -> Result<MoveOutcome> {
        let task_id = self
            .columns
            .column(mv.from)
            .get(mv.from_index)
            .copied()
            .ok_or_else(|| {
                BoardError::InvalidMove(format!("no card at {:?}[{}]", mv.from, mv.from_index))
            })?;

        if mv.from == mv.to {
            self.columns.relocate(task_id, mv.to, mv.to_index);
            debug!(task_id, index = mv.to_index, "card reordered");
            return Ok(MoveOutcome::Reordered { task_id });
        }

        self.check_move(task_id, mv.to)?;

        let before = self.columns.clone();
        self.columns.relocate(task_id, mv.to, mv.to_index);

        if let Err(e) = self.pipeline.mutate(task_id, TaskPatch::status(mv.to)).await {
            self.columns = before;
            return Err(e);
        }

        // Pick up the confirmed cache, then keep the card where it was dropped.
        self.rearrange();
        self.columns.relocate(task_id, mv.to, mv.to_index);
        Ok(MoveOutcome::StatusChanged {
            task_id,
            status: mv.to,
        })
    }

    fn check_move(&self, task_id: TaskId, target: Status) -> Result<()> {
        let cache = cache::lock(self.pipeline.cache());
        let task = cache.get(task_id).ok_or(BoardError::TaskNotFound(task_id))?;
        let policy = self.pipeline.policy();
        let blocked = graph::blocked_in_cache(&cache, task_id, policy);
        guard::check_transition(task, target, &blocked, || {
            graph::blockers_in_cache(&cache, task_id, policy)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TaskCache;
    use crate::config::BoardSettings;
    use crate::fields::MissingDependencyPolicy;
    use crate::memory::MemoryStore;
    use crate::task::DependencyEdge;
    use chrono::{DateTime, TimeZone, Utc};

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn task(id: TaskId, status: Status) -> Task {
        Task::new(id, format!("card {id}"), 1, day(2024, 1, 1)).with_status(status).with_team(1)
    }

    fn board(tasks: Vec<Task>, edges: Vec<DependencyEdge>) -> (Arc<MemoryStore>, Board<MemoryStore>) {
        let backend = Arc::new(MemoryStore::with_tasks(tasks.clone(), edges.clone()));
        let shared = TaskCache::shared();
        {
            let mut c = cache::lock(&shared);
            c.upsert_many(tasks);
            c.replace_edges(edges);
            graph::rederive(&mut c, MissingDependencyPolicy::FailClosed);
        }
        let pipeline = Arc::new(MutationPipeline::new(Arc::clone(&backend), shared, &BoardSettings::default()));
        (backend, Board::new(pipeline, None))
    }

    fn cached_status(board: &Board<MemoryStore>, id: TaskId) -> Option<Status> {
        cache::lock(board.cache()).get(id).map(|t| t.status)
    }

    #[test]
    fn test_arrange_sorts_by_due_date_undated_last() {
        let tasks = vec![
            task(1, Status::Todo).with_due(day(2024, 3, 1)),
            task(2, Status::Todo),
            task(3, Status::Todo).with_due(day(2024, 1, 1)),
        ];
        let columns = arrange(&tasks, None);
        assert_eq!(columns.todo, vec![3, 1, 2]);
        assert!(columns.in_progress.is_empty());
        assert!(columns.done.is_empty());
    }

    #[test]
    fn test_arrange_partitions_and_filters_by_team() {
        let mut other = task(4, Status::Done);
        other.team_id = Some(2);
        let tasks = vec![task(1, Status::InProgress), task(2, Status::Done), other, task(3, Status::Todo)];

        let all = arrange(&tasks, None);
        assert_eq!(all.len(), 4);
        assert_eq!(all.done, vec![2, 4]);

        let team = arrange(&tasks, Some(1));
        assert_eq!(team.todo, vec![3]);
        assert_eq!(team.in_progress, vec![1]);
        assert_eq!(team.done, vec![2]);
    }

    #[test]
    fn test_arrange_is_stable_for_equal_dates() {
        let due = day(2024, 5, 5);
        let tasks = vec![
            task(7, Status::Todo),
            task(5, Status::Todo).with_due(due),
            task(6, Status::Todo),
            task(8, Status::Todo).with_due(due),
        ];
        assert_eq!(arrange(&tasks, None).todo, vec![5, 8, 7, 6]);
    }

    #[test]
    fn test_invalid_status_lands_in_todo() {
        let raw = r#"{"id": 1, "title": "x", "status": "archived", "owner_id": 1, "created_at": "2024-01-01T00:00:00Z"}"#;
        let parsed: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(arrange([&parsed], None).todo, vec![1]);
    }

    #[tokio::test]
    async fn test_same_column_drag_only_reorders() {
        let (backend, mut board) = board(vec![task(1, Status::Todo), task(2, Status::Todo)], vec![]);
        let first = board.columns().todo[0];
        let outcome = board.move_card(CardMove::new(Status::Todo, 0, Status::Todo, 1)).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Reordered { task_id: first });
        assert_eq!(board.columns().todo[1], first);
        assert_eq!(cached_status(&board, first), Some(Status::Todo));
        assert_eq!(backend.row(first).await.map(|t| t.status), Some(Status::Todo));
        assert!(!board.sync());
    }

    #[tokio::test]
    async fn test_blocked_cross_column_drag_changes_nothing() {
        let (backend, mut board) = board(
            vec![task(1, Status::Todo), task(2, Status::Todo)],
            vec![DependencyEdge::new(1, 2)],
        );
        let before = board.columns().clone();
        let index = before.todo.iter().position(|&id| id == 1).unwrap();

        let err = board
            .move_card(CardMove::new(Status::Todo, index, Status::Done, 0))
            .await
            .unwrap_err();
        assert!(err.is_blocked());
        assert_eq!(board.columns(), &before);
        assert_eq!(cached_status(&board, 1), Some(Status::Todo));
        assert_eq!(backend.row(1).await.map(|t| t.status), Some(Status::Todo));
    }

    #[tokio::test]
    async fn test_cross_column_drag_changes_status() {
        let (backend, mut board) = board(
            vec![task(1, Status::Todo), task(2, Status::InProgress), task(3, Status::InProgress)],
            vec![],
        );
        let outcome = board
            .move_card(CardMove::new(Status::Todo, 0, Status::InProgress, 1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MoveOutcome::StatusChanged {
                task_id: 1,
                status: Status::InProgress
            }
        );
        assert_eq!(board.columns().in_progress[1], 1);
        assert!(board.columns().todo.is_empty());
        assert_eq!(cached_status(&board, 1), Some(Status::InProgress));
        assert_eq!(backend.row(1).await.map(|t| t.status), Some(Status::InProgress));
    }

    #[tokio::test]
    async fn test_failed_drag_puts_card_back() {
        let (backend, mut board) = board(vec![task(1, Status::Todo)], vec![]);
        backend.fail_next_updates(1);
        let before = board.columns().clone();

        let err = board
            .move_card(CardMove::new(Status::Todo, 0, Status::Done, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Remote { task_id: 1, .. }));
        assert_eq!(board.columns(), &before);
        assert_eq!(cached_status(&board, 1), Some(Status::Todo));
    }

    #[tokio::test]
    async fn test_drag_from_empty_slot_is_invalid() {
        let (_backend, mut board) = board(vec![task(1, Status::Todo)], vec![]);
        let err = board
            .move_card(CardMove::new(Status::Done, 0, Status::Todo, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::InvalidMove(_)));
    }

    #[test]
    fn test_sync_picks_up_cache_changes() {
        let (_backend, mut board) = board(vec![task(1, Status::Todo)], vec![]);
        assert!(!board.sync());
        cache::lock(board.cache()).upsert(task(1, Status::Done));
        assert!(board.sync());
        assert_eq!(board.columns().done, vec![1]);
        assert_eq!(board.cards(Status::Done)[0].status, Status::Done);
    }
}
