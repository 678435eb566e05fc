//! Command implementations for the CLI interface.
//!
//! Every command that changes a task goes through a board session, so status
//! changes are gated on dependencies exactly as they are on the terminal
//! board. Failures are printed to stderr and end the process with a non-zero
//! exit code.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use clap::{Args, Subcommand};
use clap_complete::{generate, Shell};
use tokio::runtime::Runtime;

use crate::board::{CardMove, MoveOutcome};
use crate::config::Config;
use crate::db::*;
use crate::error::BoardError;
use crate::feed::FeedHub;
use crate::fields::*;
use crate::session::BoardSession;
use crate::store::{Scope, TaskCommand, TaskQuery};
use crate::task::{NewTask, Task, TaskId, TaskPatch, TeamId, UserId};
use crate::tui::run::run_board_tui;

/// Which tasks a board command shows.
#[derive(Args, Debug, Clone, Default)]
pub struct ScopeArgs {
    /// Show one team's board.
    #[arg(long, conflicts_with = "mine")]
    pub team: Option<TeamId>,
    /// Show tasks you own or are assigned.
    #[arg(long)]
    pub mine: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the board: one column per status.
    Board {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Launch the interactive kanban board.
    Ui {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Add a new task.
    Add {
        /// Short title for the task.
        title: String,
        /// Optional longer description.
        #[arg(long)]
        desc: Option<String>,
        #[arg(long, value_enum)]
        priority: Option<Priority>,
        /// Due date: YYYY-MM-DD, "today", "tomorrow", "friday", or "in Nd".
        #[arg(long)]
        due: Option<String>,
        /// Team id (default: the configured default team).
        #[arg(long)]
        team: Option<TeamId>,
        #[arg(long)]
        assignee: Option<UserId>,
        /// Parent task ID or title. Subtasks are counted on their parent's card.
        #[arg(long)]
        parent: Option<String>,
        /// Status: todo | in-progress | done.
        #[arg(long, value_enum, default_value_t = Status::Todo)]
        status: Status,
    },

    /// Change a task's status. Blocked tasks cannot start or finish.
    Status {
        /// Task ID or title.
        id: String,
        #[arg(value_enum)]
        status: Status,
    },

    /// Move a card to a column and position, as if dragged on the board.
    Move {
        /// Task ID or title.
        id: String,
        /// Target column.
        #[arg(value_enum)]
        status: Status,
        /// Position in the target column (default: end).
        #[arg(long)]
        index: Option<usize>,
    },

    /// Update fields on a task.
    Update {
        /// Task ID or title.
        id: String,
        #[arg(long)]
        title: Option<String>,
        /// New description; an empty string clears it.
        #[arg(long)]
        desc: Option<String>,
        #[arg(long, value_enum)]
        priority: Option<Priority>,
        #[arg(long)]
        due: Option<String>,
        #[arg(long)]
        clear_due: bool,
        #[arg(long, conflicts_with = "unassign")]
        assignee: Option<UserId>,
        #[arg(long)]
        unassign: bool,
        #[arg(long)]
        team: Option<TeamId>,
    },

    /// Make a task wait on other tasks.
    Depend {
        /// Dependent task ID or title.
        id: String,
        /// Tasks it waits on.
        #[arg(long, required = true, num_args = 1.., value_delimiter = ',')]
        on: Vec<TaskId>,
    },

    /// Remove dependencies from a task.
    Undepend {
        id: String,
        #[arg(long, required = true, num_args = 1.., value_delimiter = ',')]
        on: Vec<TaskId>,
    },

    /// Show a task's dependencies, or replace them with --set.
    Deps {
        id: String,
        /// Replace the whole list. `--set` with no ids removes every dependency.
        #[arg(long, num_args = 0.., value_delimiter = ',')]
        set: Option<Vec<TaskId>>,
    },

    /// View a single task by ID or title.
    View {
        id: String,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Everything a command needs: the store, the settings and a runtime to
/// drive the async core from synchronous command code.
pub struct Context {
    runtime: Runtime,
    store: Arc<JsonStore>,
    config: Config,
    user: UserId,
}

impl Context {
    pub fn new(config: Config, db_path: &Path, user: UserId) -> Self {
        let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                eprintln!("Failed to start runtime: {e}");
                std::process::exit(1);
            }
        };
        let store = match JsonStore::with_feed(db_path, FeedHub::with_capacity(config.feed_capacity)) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                eprintln!("Failed to open board {}: {e}", db_path.display());
                std::process::exit(1);
            }
        };
        Context {
            runtime,
            store,
            config,
            user,
        }
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Scope of an unscoped command: the default team, else the user's tasks.
    fn default_scope(&self) -> Scope {
        match self.config.default_team {
            Some(team) => Scope::Team(team),
            None => Scope::User(self.user),
        }
    }

    fn board_scope(&self, args: &ScopeArgs) -> Scope {
        if args.mine {
            Scope::User(self.user)
        } else if let Some(team) = args.team {
            Scope::Team(team)
        } else {
            self.default_scope()
        }
    }

    fn open(&self, scope: Scope) -> BoardSession<JsonStore> {
        let settings = self.config.board_settings();
        match self.block_on(BoardSession::open(Arc::clone(&self.store), scope, &settings)) {
            Ok(session) => session,
            Err(e) => {
                eprintln!("Failed to load board: {e}");
                std::process::exit(1);
            }
        }
    }

    /// Resolve an ID or title. Titles are looked up on the default board.
    fn resolve(&self, identifier: &str) -> TaskId {
        let tasks = if identifier.parse::<TaskId>().is_ok() {
            Vec::new()
        } else {
            self.block_on(self.store.fetch_tasks(self.default_scope())).unwrap_or_default()
        };
        match resolve_task_identifier(identifier, &tasks) {
            Ok(id) => id,
            Err(e) => {
                eprintln!("Error resolving task: {e}");
                std::process::exit(1);
            }
        }
    }

    /// The board a task is shown on: its team's, or its owner's.
    fn scope_of(&self, id: TaskId) -> Scope {
        match self.block_on(self.store.fetch_task(id)) {
            Ok(Some(task)) => {
                if let Some(parent) = task.parent_id {
                    eprintln!("Task {id} is a subtask of #{parent}; subtasks are not on the board.");
                    std::process::exit(1);
                }
                match task.team_id {
                    Some(team) => Scope::Team(team),
                    None => Scope::User(task.owner_id),
                }
            }
            Ok(None) => {
                eprintln!("Task {id} not found.");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Failed to load task {id}: {e}");
                std::process::exit(1);
            }
        }
    }

    /// Open the board that shows `id`.
    fn open_for(&self, id: TaskId) -> BoardSession<JsonStore> {
        self.open(self.scope_of(id))
    }
}

fn id_list(ids: &[TaskId]) -> String {
    ids.iter().map(|id| format!("#{id}")).collect::<Vec<_>>().join(", ")
}

/// Print a board error the way a user should read it and exit.
fn fail(e: BoardError) -> ! {
    match &e {
        BoardError::Blocked { task_id, blockers, .. } if !blockers.is_empty() => {
            eprintln!(
                "Task {task_id} is blocked by incomplete dependencies: {}",
                id_list(blockers)
            );
        }
        _ => eprintln!("{e}"),
    }
    std::process::exit(1);
}

fn parse_due_or_exit(input: &str) -> chrono::DateTime<chrono::Utc> {
    match parse_due_input(input).and_then(due_at) {
        Some(due) => due,
        None => {
            eprintln!("Unrecognised due date. Use YYYY-MM-DD, 'today', 'tomorrow', 'friday', or 'in Nd'.");
            std::process::exit(1);
        }
    }
}

/// One card line for the printed board.
fn card_line(task: &Task, blockers: &[TaskId]) -> String {
    let today = Local::now().date_naive();
    let mut line = format!(
        "  #{:<4} {:<40} {:<10}",
        task.id,
        truncate(&task.title, 40),
        format_due_relative(task.due_date, today)
    );
    if task.subtasks.total > 0 {
        line.push_str(&format!(" [{}/{} subtasks]", task.subtasks.completed, task.subtasks.total));
    }
    if task.dependencies.is_blocked() {
        line.push_str(&format!(" [blocked by {}]", id_list(blockers)));
    }
    line
}

/// Print the board for a scope.
pub fn cmd_board(ctx: &Context, scope: ScopeArgs) {
    let session = ctx.open(ctx.board_scope(&scope));
    let board = session.board();
    if board.columns().is_empty() {
        println!("No tasks on this board.");
    }
    for status in Status::ALL {
        let cards = board.cards(status);
        println!("{} ({})", format_status(status).to_uppercase(), cards.len());
        for task in &cards {
            println!("{}", card_line(task, &session.blockers(task.id)));
        }
        println!();
    }
    ctx.block_on(session.close());
}

/// Launch the interactive board.
pub fn cmd_ui(ctx: &Context, scope: ScopeArgs) {
    let _poller = {
        let _guard = ctx.runtime.enter();
        ctx.store
            .watch(std::time::Duration::from_millis(ctx.config.poll_interval_ms))
    };
    let session = ctx.open(ctx.board_scope(&scope));
    if let Err(e) = run_board_tui(ctx.runtime.handle(), session) {
        eprintln!("UI error: {e}");
        std::process::exit(1);
    }
}

/// Add a new task.
#[allow(clippy::too_many_arguments)]
pub fn cmd_add(
    ctx: &Context,
    title: String,
    desc: Option<String>,
    priority: Option<Priority>,
    due: Option<String>,
    team: Option<TeamId>,
    assignee: Option<UserId>,
    parent: Option<String>,
    status: Status,
) {
    let parent_id = parent.as_deref().map(|p| ctx.resolve(p));
    let new = NewTask {
        title,
        description: desc.filter(|d| !d.trim().is_empty()),
        status,
        priority,
        due_date: due.as_deref().map(parse_due_or_exit),
        owner_id: ctx.user,
        assignee_id: assignee,
        team_id: team.or(ctx.config.default_team),
        parent_id,
    };
    match ctx.block_on(ctx.store.insert_task(new)) {
        Ok(task) => println!("Added task {}", task.id),
        Err(e) => {
            eprintln!("Failed to add task: {e}");
            std::process::exit(1);
        }
    }
}

/// Change a task's status through the guarded pipeline.
pub fn cmd_status(ctx: &Context, id: String, status: Status) {
    let task_id = ctx.resolve(&id);
    let mut session = ctx.open_for(task_id);
    if let Err(e) = ctx.block_on(session.mutate(task_id, TaskPatch::status(status))) {
        fail(e);
    }
    println!("Task {task_id} is now {}", format_status(status));
    ctx.block_on(session.close());
}

/// Move a card as the board would on a drag.
pub fn cmd_move(ctx: &Context, id: String, status: Status, index: Option<usize>) {
    let task_id = ctx.resolve(&id);
    let mut session = ctx.open_for(task_id);
    let Some((from, from_index)) = session.board().columns().position(task_id) else {
        eprintln!("Task {task_id} is not on its board.");
        std::process::exit(1);
    };
    let to_index = index.unwrap_or(usize::MAX);
    let mv = CardMove::new(from, from_index, status, to_index);
    match ctx.block_on(session.move_card(mv)) {
        Ok(MoveOutcome::Reordered { .. }) => {
            // Column order is not stored; the next load re-sorts by due date.
            println!("Task {task_id} stays in {}", format_status(status));
        }
        Ok(MoveOutcome::StatusChanged { status, .. }) => {
            let position = session.board().columns().position(task_id).map(|(_, i)| i + 1);
            match position {
                Some(p) => println!("Moved task {task_id} to {} (position {p})", format_status(status)),
                None => println!("Moved task {task_id} to {}", format_status(status)),
            }
        }
        Err(e) => fail(e),
    }
    ctx.block_on(session.close());
}

/// Update an existing task's fields.
#[allow(clippy::too_many_arguments)]
pub fn cmd_update(
    ctx: &Context,
    id: String,
    title: Option<String>,
    desc: Option<String>,
    priority: Option<Priority>,
    due: Option<String>,
    clear_due: bool,
    assignee: Option<UserId>,
    unassign: bool,
    team: Option<TeamId>,
) {
    let task_id = ctx.resolve(&id);
    let mut patch = TaskPatch {
        title,
        description: desc.map(|d| if d.trim().is_empty() { None } else { Some(d) }),
        priority: priority.map(Some),
        team_id: team.map(Some),
        ..TaskPatch::default()
    };
    if clear_due {
        patch.due_date = Some(None);
    }
    if let Some(ds) = due {
        patch.due_date = Some(Some(parse_due_or_exit(&ds)));
    }
    if unassign {
        patch.assignee_id = Some(None);
    } else if let Some(a) = assignee {
        patch.assignee_id = Some(Some(a));
    }
    if patch.is_empty() {
        println!("Nothing to update.");
        return;
    }

    let mut session = ctx.open_for(task_id);
    if let Err(e) = ctx.block_on(session.mutate(task_id, patch)) {
        fail(e);
    }
    println!("Updated task {task_id}");
    ctx.block_on(session.close());
}

/// Add dependencies to a task.
pub fn cmd_depend(ctx: &Context, id: String, on: Vec<TaskId>) {
    let task_id = ctx.resolve(&id);
    let mut session = ctx.open_for(task_id);
    for dependency in on {
        if let Err(e) = ctx.block_on(session.add_dependency(task_id, dependency)) {
            fail(e);
        }
        println!("Task {task_id} now depends on #{dependency}");
    }
    report_blocked(&session, task_id);
    ctx.block_on(session.close());
}

/// Remove dependencies from a task.
pub fn cmd_undepend(ctx: &Context, id: String, on: Vec<TaskId>) {
    let task_id = ctx.resolve(&id);
    let mut session = ctx.open_for(task_id);
    for dependency in on {
        if let Err(e) = ctx.block_on(session.remove_dependency(task_id, dependency)) {
            fail(e);
        }
        println!("Task {task_id} no longer depends on #{dependency}");
    }
    report_blocked(&session, task_id);
    ctx.block_on(session.close());
}

/// Show or replace a task's dependency list.
pub fn cmd_deps(ctx: &Context, id: String, set: Option<Vec<TaskId>>) {
    let task_id = ctx.resolve(&id);
    let mut session = ctx.open_for(task_id);
    if let Some(desired) = set {
        match ctx.block_on(session.set_dependencies(task_id, &desired)) {
            Ok(diff) if diff.is_empty() => println!("Dependencies unchanged."),
            Ok(diff) => {
                if !diff.added.is_empty() {
                    println!("Added:   {}", id_list(&diff.added));
                }
                if !diff.removed.is_empty() {
                    println!("Removed: {}", id_list(&diff.removed));
                }
            }
            Err(e) => fail(e),
        }
    }
    print_dependencies(ctx, &session, task_id);
    ctx.block_on(session.close());
}

fn report_blocked(session: &BoardSession<JsonStore>, task_id: TaskId) {
    let blockers = session.blockers(task_id);
    if !blockers.is_empty() {
        println!("Task {task_id} is blocked by {}", id_list(&blockers));
    }
}

/// Title and status of a task, looked up in the store when it is off-board.
fn describe(ctx: &Context, session: &BoardSession<JsonStore>, id: TaskId) -> String {
    let task = session
        .task(id)
        .or_else(|| ctx.block_on(ctx.store.fetch_task(id)).ok().flatten());
    match task {
        Some(t) => format!("#{} {} [{}]", t.id, t.title, format_status(t.status)),
        None => format!("#{id} [missing]"),
    }
}

fn print_dependencies(ctx: &Context, session: &BoardSession<JsonStore>, task_id: TaskId) {
    let deps = session.dependencies_of(task_id);
    if deps.is_empty() {
        println!("Depends on:   -");
    } else {
        println!("Depends on:");
        for dep in deps {
            println!("  {}", describe(ctx, session, dep));
        }
    }
    let dependents = session.dependents_of(task_id);
    if !dependents.is_empty() {
        println!("Needed by:");
        for dep in dependents {
            println!("  {}", describe(ctx, session, dep));
        }
    }
}

/// View a single task.
pub fn cmd_view(ctx: &Context, id: String) {
    let task_id = ctx.resolve(&id);
    let session = ctx.open_for(task_id);
    let Some(task) = session.task(task_id) else {
        eprintln!("Task {task_id} not found.");
        std::process::exit(1);
    };
    let today = Local::now().date_naive();
    let blocked = session.blocked(task_id);
    println!("ID:           {}", task.id);
    println!("Title:        {}", task.title);
    println!("Status:       {}", format_status(task.status));
    println!("Priority:     {}", format_priority(task.priority));
    println!(
        "Due:          {}",
        match task.due_date {
            Some(d) => format!("{} ({})", d.date_naive(), format_due_relative(Some(d), today)),
            None => "-".into(),
        }
    );
    println!("Team:         {}", task.team_id.map(|t| t.to_string()).unwrap_or_else(|| "-".into()));
    println!("Owner:        {}", task.owner_id);
    println!("Assignee:     {}", task.assignee_id.map(|a| a.to_string()).unwrap_or_else(|| "-".into()));
    println!("Subtasks:     {}/{}", task.subtasks.completed, task.subtasks.total);
    println!("Created UTC:  {}", task.created_at.to_rfc3339());
    println!(
        "Blocked:      {}",
        if blocked.is_blocked() {
            format!("yes, waiting on {}", id_list(&session.blockers(task_id)))
        } else {
            "no".into()
        }
    );
    println!("Description:\n{}\n", task.description.as_deref().unwrap_or("-"));
    print_dependencies(ctx, &session, task_id);
    ctx.block_on(session.close());
}

/// Generate shell completion scripts.
pub fn cmd_completions(shell: Shell) {
    use crate::cli::Cli;
    use clap::CommandFactory;

    let mut app = Cli::command();
    let app_name = app.get_name().to_string();
    generate(shell, &mut app, app_name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_id_list() {
        assert_eq!(id_list(&[2, 5]), "#2, #5");
        assert_eq!(id_list(&[]), "");
    }

    #[test]
    fn test_card_line_marks_blocked_and_subtasks() {
        let mut task = Task::new(3, "Release", 1, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        task.subtasks.total = 2;
        task.subtasks.completed = 1;
        task.dependencies.has_dependencies = true;
        task.dependencies.dependencies_completed = false;
        let line = card_line(&task, &[1]);
        assert!(line.contains("#3"));
        assert!(line.contains("[1/2 subtasks]"));
        assert!(line.contains("[blocked by #1]"));
    }

    #[test]
    fn test_scope_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        let ctx = Context::new(config.clone(), &dir.path().join("board.json"), 7);
        assert_eq!(ctx.board_scope(&ScopeArgs::default()), Scope::User(7));
        assert_eq!(
            ctx.board_scope(&ScopeArgs { team: Some(2), mine: false }),
            Scope::Team(2)
        );

        config.default_team = Some(4);
        let ctx = Context::new(config, &dir.path().join("board.json"), 7);
        assert_eq!(ctx.board_scope(&ScopeArgs::default()), Scope::Team(4));
        assert_eq!(ctx.board_scope(&ScopeArgs { team: None, mine: true }), Scope::User(7));
    }
}
