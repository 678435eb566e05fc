//! Property-based tests for the board's derived state.
//!
//! - Blocked flags always match the current edges and statuses
//! - The guard only ever refuses gated moves of blocked tasks
//! - Arrangement partitions by status and sorts by due date, undated last

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use taskboard::graph::compute_blocked_with;
use taskboard::{arrange, can_transition, BlockedInfo, DependencyEdge, MissingDependencyPolicy, Status, Task, TaskId};

// =============================================================================
// Strategies
// =============================================================================

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn status_strategy() -> impl Strategy<Value = Status> {
    prop_oneof![Just(Status::Todo), Just(Status::InProgress), Just(Status::Done)]
}

/// Tasks with ids 1..=n, a random status, an optional due date and a team.
fn tasks_strategy(max: usize) -> impl Strategy<Value = Vec<Task>> {
    proptest::collection::vec((status_strategy(), proptest::option::of(0i64..20), 1u64..4), 0..=max).prop_map(
        |rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (status, due, team))| {
                    let mut task = Task::new(i as TaskId + 1, format!("task {i}"), 1, base())
                        .with_status(status)
                        .with_team(team);
                    task.due_date = due.map(|d| base() + Duration::days(d));
                    task
                })
                .collect()
        },
    )
}

/// Tasks plus edges between them, some pointing at ids that do not exist.
fn board_strategy() -> impl Strategy<Value = (Vec<Task>, Vec<DependencyEdge>)> {
    tasks_strategy(12).prop_flat_map(|tasks| {
        let n = tasks.len() as TaskId;
        let edges = if n == 0 {
            Just(Vec::new()).boxed()
        } else {
            proptest::collection::vec((1..=n, 1..=n + 3), 0..20)
                .prop_map(|pairs| {
                    pairs
                        .into_iter()
                        .filter(|(a, b)| a != b)
                        .map(|(a, b)| DependencyEdge::new(a, b))
                        .collect()
                })
                .boxed()
        };
        (Just(tasks), edges)
    })
}

fn blocked_strategy() -> impl Strategy<Value = BlockedInfo> {
    (any::<bool>(), any::<bool>()).prop_map(|(has_dependencies, dependencies_completed)| BlockedInfo {
        has_dependencies,
        dependencies_completed,
    })
}

// =============================================================================
// Evaluator
// =============================================================================

proptest! {
    #[test]
    fn blocked_flags_follow_edges_and_statuses((tasks, edges) in board_strategy()) {
        let statuses: HashMap<TaskId, Status> = tasks.iter().map(|t| (t.id, t.status)).collect();

        for policy in [MissingDependencyPolicy::FailClosed, MissingDependencyPolicy::FailOpen] {
            let blocked = compute_blocked_with(&tasks, &edges, policy);
            for task in &tasks {
                let deps: HashSet<TaskId> = edges
                    .iter()
                    .filter(|e| e.dependent_id == task.id)
                    .map(|e| e.dependency_id)
                    .collect();
                let expected_complete = deps.iter().all(|d| match statuses.get(d) {
                    Some(status) => *status == Status::Done,
                    None => policy == MissingDependencyPolicy::FailOpen,
                });
                let info = blocked[&task.id];
                prop_assert_eq!(info.has_dependencies, !deps.is_empty());
                prop_assert_eq!(info.dependencies_completed, expected_complete);
            }
        }
    }

    #[test]
    fn evaluation_ignores_input_order((tasks, edges) in board_strategy()) {
        let forward = compute_blocked_with(&tasks, &edges, MissingDependencyPolicy::FailClosed);
        let reversed_tasks: Vec<Task> = tasks.iter().rev().cloned().collect();
        let reversed_edges: Vec<DependencyEdge> = edges.iter().rev().copied().collect();
        let backward = compute_blocked_with(&reversed_tasks, &reversed_edges, MissingDependencyPolicy::FailClosed);
        prop_assert_eq!(forward, backward);
    }
}

// =============================================================================
// Guard
// =============================================================================

proptest! {
    #[test]
    fn guard_refuses_only_gated_moves_of_blocked_tasks(
        status in status_strategy(),
        target in status_strategy(),
        blocked in blocked_strategy(),
    ) {
        let task = Task::new(1, "t", 1, base()).with_status(status);
        let allowed = can_transition(&task, target, &blocked);
        if target == Status::Todo {
            prop_assert!(allowed);
        } else {
            prop_assert_eq!(allowed, !(blocked.has_dependencies && !blocked.dependencies_completed));
        }
    }
}

// =============================================================================
// Arrangement
// =============================================================================

proptest! {
    #[test]
    fn arrange_partitions_and_sorts(tasks in tasks_strategy(20), team in proptest::option::of(1u64..4)) {
        let columns = arrange(&tasks, team);
        let by_id: HashMap<TaskId, &Task> = tasks.iter().map(|t| (t.id, t)).collect();

        let expected: usize = tasks.iter().filter(|t| team.map_or(true, |tm| t.team_id == Some(tm))).count();
        prop_assert_eq!(columns.len(), expected);

        for status in Status::ALL {
            let column = columns.column(status);
            for id in column {
                prop_assert_eq!(by_id[id].status, status);
                if let Some(tm) = team {
                    prop_assert_eq!(by_id[id].team_id, Some(tm));
                }
            }
            for pair in column.windows(2) {
                let (a, b) = (by_id[&pair[0]], by_id[&pair[1]]);
                match (a.due_date, b.due_date) {
                    (Some(x), Some(y)) => prop_assert!(x <= y),
                    (None, Some(_)) => prop_assert!(false, "undated card before a dated one"),
                    (None, None) => prop_assert!(a.id < b.id, "equal keys must keep input order"),
                    (Some(_), None) => {}
                }
                if a.due_date.is_some() && a.due_date == b.due_date {
                    prop_assert!(a.id < b.id, "equal keys must keep input order");
                }
            }
        }
    }
}
