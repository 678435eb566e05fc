//! # taskboard
//!
//! A collaborative kanban board whose cards can depend on one another.
//!
//! ## How the pieces fit
//!
//! - [`graph`] derives each task's blocked state from its direct dependency
//!   edges. A dependency that cannot be found counts as not done.
//! - [`guard`] refuses moves into `in_progress` or `done` while a task is
//!   blocked. Moving back to `todo` is always allowed.
//! - [`cache`] holds one snapshot per task and is the only state the board
//!   renders from.
//! - [`pipeline`] applies edits to the cache immediately, sends them to the
//!   store, and restores the previous snapshot when the store refuses.
//! - [`reconciler`] listens to the store's change feed and refetches the
//!   whole board scope on every notification.
//! - [`board`] arranges the cache into status columns sorted by due date and
//!   turns drag gestures into guarded status changes.
//! - [`session`] owns one of each for an open board.
//!
//! Stores implement the [`store`] traits. [`memory::MemoryStore`] keeps
//! everything in memory; [`db::JsonStore`] keeps a board in a JSON file that
//! several processes can share.
//!
//! ## Quick Start
//!
//! ```bash
//! tb add "Write release notes" --team 1 --due friday
//! tb add "Tag release" --team 1
//! tb depend 2 --on 1
//! tb board --team 1
//! tb ui --team 1
//! ```

pub mod board;
pub mod cache;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod db;
pub mod deps;
pub mod error;
pub mod feed;
pub mod fields;
pub mod graph;
pub mod guard;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod task;
pub mod tui {
    pub mod board;
    pub mod colors;
    pub mod run;
}

pub use board::{arrange, Board, CardMove, Columns, MoveOutcome};
pub use cache::{SharedCache, TaskCache};
pub use config::{BoardSettings, Config};
pub use error::{BoardError, ConfigError, StoreError};
pub use fields::{MissingDependencyPolicy, Priority, Status};
pub use graph::compute_blocked;
pub use guard::can_transition;
pub use session::BoardSession;
pub use store::{Backend, Scope};
pub use task::{BlockedInfo, DependencyEdge, NewTask, Task, TaskId, TaskPatch};
