//! Status transition guard.
//!
//! Every pair of statuses is a legal transition except one case: a task with
//! incomplete dependencies may not enter `InProgress` or `Done`. Moving back to
//! `Todo` is always allowed. The guard is advisory; it never waits or retries.

use tracing::debug;

use crate::error::{BoardError, Result};
use crate::fields::Status;
use crate::task::{BlockedInfo, Task, TaskId};

/// Whether `task` may move to `target` given freshly computed blocked state.
pub fn can_transition(_task: &Task, target: Status, blocked: &BlockedInfo) -> bool {
    !(target.is_gated() && blocked.is_blocked())
}

/// Guard check that produces the user-facing rejection.
///
/// `blockers` is only consulted when the transition is rejected.
pub fn check_transition<F>(task: &Task, target: Status, blocked: &BlockedInfo, blockers: F) -> Result<()>
where
    F: FnOnce() -> Vec<TaskId>,
{
    if can_transition(task, target, blocked) {
        return Ok(());
    }
    let blockers = blockers();
    debug!(task_id = task.id, ?target, ?blockers, "transition blocked by incomplete dependencies");
    Err(BoardError::Blocked {
        task_id: task.id,
        target,
        blockers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const BLOCKED: BlockedInfo = BlockedInfo {
        has_dependencies: true,
        dependencies_completed: false,
    };
    const SATISFIED: BlockedInfo = BlockedInfo {
        has_dependencies: true,
        dependencies_completed: true,
    };

    fn task(status: Status) -> Task {
        Task::new(1, "guarded", 1, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()).with_status(status)
    }

    #[test]
    fn test_todo_always_allowed() {
        for from in Status::ALL {
            assert!(can_transition(&task(from), Status::Todo, &BLOCKED));
        }
    }

    #[test]
    fn test_blocked_task_cannot_progress() {
        let t = task(Status::Todo);
        assert!(!can_transition(&t, Status::InProgress, &BLOCKED));
        assert!(!can_transition(&t, Status::Done, &BLOCKED));
    }

    #[test]
    fn test_unblocked_transitions_are_free() {
        let t = task(Status::Todo);
        assert!(can_transition(&t, Status::Done, &SATISFIED));
        assert!(can_transition(&t, Status::Done, &BlockedInfo::default()));
        assert!(can_transition(&task(Status::Done), Status::InProgress, &SATISFIED));
    }

    #[test]
    fn test_check_transition_reports_blockers() {
        let err = check_transition(&task(Status::Todo), Status::Done, &BLOCKED, || vec![2, 3]).unwrap_err();
        match err {
            BoardError::Blocked { task_id, target, blockers } => {
                assert_eq!(task_id, 1);
                assert_eq!(target, Status::Done);
                assert_eq!(blockers, vec![2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_transition_skips_blockers_when_allowed() {
        let result = check_transition(&task(Status::Done), Status::Todo, &BLOCKED, || {
            panic!("blockers should not be computed")
        });
        assert!(result.is_ok());
    }
}
