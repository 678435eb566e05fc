//! JSON file store and display helpers.
//!
//! `JsonStore` keeps the whole board in one JSON document holding tasks and
//! dependency edges. Every operation re-reads the file when it changed on disk
//! and every command writes it back atomically, so several `tb` processes can
//! share one file. Changes made by this process are published on its feed
//! directly; changes made by other processes are picked up by `watch`.
//!
//! The free functions at the bottom handle due-date input and table output
//! for the command line and terminal board.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration as StdDuration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::feed::{FeedHub, Subscription};
use crate::fields::*;
use crate::store::{ChangeEvent, ChangeFeed, ChangeKind, RowFilter, Scope, Table, TaskCommand, TaskQuery};
use crate::task::{DependencyEdge, NewTask, SubtaskCounts, Task, TaskId, TaskPatch};

/// On-disk board document.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Database {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub edges: Vec<DependencyEdge>,
}

impl Database {
    /// Load the document, or an empty one if the file doesn't exist.
    ///
    /// A file that exists but cannot be parsed is an error rather than an
    /// empty board, so that the next save never overwrites it.
    pub fn load(path: &Path) -> StoreResult<Self> {
        if !path.exists() {
            return Ok(Database::default());
        }
        let mut buf = String::new();
        File::open(path)?.read_to_string(&mut buf)?;
        if buf.trim().is_empty() {
            return Ok(Database::default());
        }
        Ok(serde_json::from_str(&buf)?)
    }

    /// Save using atomic write (temp file + rename).
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(self)?;
        let mut f = File::create(&tmp)?;
        f.write_all(data.as_bytes())?;
        f.flush()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Generate the next available task ID.
    pub fn next_id(&self) -> TaskId {
        self.tasks.iter().map(|t| t.id).max().unwrap_or(0) + 1
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Total and completed children of `parent`.
    pub fn subtask_counts(&self, parent: TaskId) -> SubtaskCounts {
        self.tasks
            .iter()
            .filter(|t| t.parent_id == Some(parent))
            .fold(SubtaskCounts::default(), |mut acc, t| {
                acc.total += 1;
                if t.status == Status::Done {
                    acc.completed += 1;
                }
                acc
            })
    }

    /// A task with its subtask counts attached.
    fn joined(&self, task: &Task) -> Task {
        Task {
            subtasks: self.subtask_counts(task.id),
            ..task.clone()
        }
    }

    fn contains(&self, id: TaskId) -> bool {
        self.get(id).is_some()
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Store backed by a JSON file.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    db: Mutex<Database>,
    /// Modification time of the file as of our last read or write.
    seen: StdMutex<Option<SystemTime>>,
    feed: FeedHub,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        Self::with_feed(path, FeedHub::new())
    }

    pub fn with_feed(path: impl Into<PathBuf>, feed: FeedHub) -> StoreResult<Self> {
        let path = path.into();
        let db = Database::load(&path)?;
        debug!(path = %path.display(), tasks = db.tasks.len(), "opened board file");
        Ok(JsonStore {
            seen: StdMutex::new(modified(&path)),
            db: Mutex::new(db),
            path,
            feed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    fn seen(&self) -> Option<SystemTime> {
        *self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_seen(&self) {
        *self.seen.lock().unwrap_or_else(PoisonError::into_inner) = modified(&self.path);
    }

    /// Whether the file changed since this store last read or wrote it.
    fn changed_on_disk(&self) -> bool {
        modified(&self.path) != self.seen()
    }

    /// Re-read the file if another process wrote it. Returns whether it did.
    fn reload_if_changed(&self, db: &mut Database) -> StoreResult<bool> {
        if !self.changed_on_disk() {
            return Ok(false);
        }
        *db = Database::load(&self.path)?;
        self.mark_seen();
        debug!(path = %self.path.display(), "board file changed on disk, reloaded");
        Ok(true)
    }

    fn persist(&self, db: &Database) -> StoreResult<()> {
        db.save(&self.path)?;
        self.mark_seen();
        Ok(())
    }

    /// Poll the file for writes by other processes and publish a change
    /// notification for both tables when one is seen.
    ///
    /// The poller holds a weak reference and stops once the store is dropped.
    pub fn watch(self: &Arc<Self>, interval: StdDuration) -> JoinHandle<()> {
        let store: Weak<JsonStore> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(StdDuration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(live) = store.upgrade() else {
                    break;
                };
                if !live.changed_on_disk() {
                    continue;
                }
                let reloaded = {
                    let mut db = live.db.lock().await;
                    live.reload_if_changed(&mut db)
                };
                match reloaded {
                    Ok(true) => {
                        info!(path = %live.path.display(), "board changed by another process");
                        live.feed.publish(ChangeEvent::new(Table::Tasks, ChangeKind::Update));
                        live.feed
                            .publish(ChangeEvent::new(Table::TaskDependencies, ChangeKind::Update));
                    }
                    Ok(false) => {}
                    Err(e) => warn!(path = %live.path.display(), error = %e, "could not reload board file"),
                }
            }
        })
    }
}

#[async_trait]
impl TaskQuery for JsonStore {
    async fn fetch_tasks(&self, scope: Scope) -> StoreResult<Vec<Task>> {
        let mut db = self.db.lock().await;
        self.reload_if_changed(&mut db)?;
        Ok(db
            .tasks
            .iter()
            .filter(|t| t.parent_id.is_none() && scope.includes(t))
            .map(|t| db.joined(t))
            .collect())
    }

    async fn fetch_edges(&self, dependents: &[TaskId]) -> StoreResult<Vec<DependencyEdge>> {
        let mut db = self.db.lock().await;
        self.reload_if_changed(&mut db)?;
        Ok(db
            .edges
            .iter()
            .filter(|e| dependents.contains(&e.dependent_id))
            .copied()
            .collect())
    }

    async fn fetch_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let mut db = self.db.lock().await;
        self.reload_if_changed(&mut db)?;
        Ok(db.get(id).map(|t| db.joined(t)))
    }
}

#[async_trait]
impl TaskCommand for JsonStore {
    async fn insert_task(&self, new: NewTask) -> StoreResult<Task> {
        let task = {
            let mut db = self.db.lock().await;
            self.reload_if_changed(&mut db)?;
            if let Some(parent) = new.parent_id {
                if !db.contains(parent) {
                    return Err(StoreError::NotFound(parent));
                }
            }
            let task = Task {
                description: new.description,
                status: new.status,
                priority: new.priority,
                due_date: new.due_date,
                assignee_id: new.assignee_id,
                team_id: new.team_id,
                parent_id: new.parent_id,
                ..Task::new(db.next_id(), new.title, new.owner_id, Utc::now())
            };
            db.tasks.push(task.clone());
            self.persist(&db)?;
            task
        };
        self.feed.publish(
            ChangeEvent::new(Table::Tasks, ChangeKind::Insert)
                .row(task.id)
                .team(task.team_id),
        );
        Ok(task)
    }

    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> StoreResult<()> {
        let (old_team, new_team) = {
            let mut db = self.db.lock().await;
            self.reload_if_changed(&mut db)?;
            let task = db.get_mut(id).ok_or(StoreError::NotFound(id))?;
            let old_team = task.team_id;
            patch.apply_to(task);
            let new_team = task.team_id;
            self.persist(&db)?;
            (old_team, new_team)
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
        let team = {
            let mut db = self.db.lock().await;
            self.reload_if_changed(&mut db)?;
            let index = db.tasks.iter().position(|t| t.id == id).ok_or(StoreError::NotFound(id))?;
            let removed = db.tasks.remove(index);
            db.edges.retain(|e| e.dependent_id != id && e.dependency_id != id);
            for task in db.tasks.iter_mut().filter(|t| t.parent_id == Some(id)) {
                task.parent_id = None;
            }
            self.persist(&db)?;
            removed.team_id
        };
        self.feed
            .publish(ChangeEvent::new(Table::Tasks, ChangeKind::Delete).row(id).team(team));
        Ok(())
    }

    async fn insert_edge(&self, edge: DependencyEdge) -> StoreResult<()> {
        let team = {
            let mut db = self.db.lock().await;
            self.reload_if_changed(&mut db)?;
            for id in [edge.dependent_id, edge.dependency_id] {
                if !db.contains(id) {
                    return Err(StoreError::NotFound(id));
                }
            }
            if db.edges.contains(&edge) {
                return Err(StoreError::DuplicateEdge {
                    dependent_id: edge.dependent_id,
                    dependency_id: edge.dependency_id,
                });
            }
            db.edges.push(edge);
            self.persist(&db)?;
            db.get(edge.dependent_id).and_then(|t| t.team_id)
        };
        self.feed.publish(
            ChangeEvent::new(Table::TaskDependencies, ChangeKind::Insert)
                .row(edge.dependent_id)
                .team(team),
        );
        Ok(())
    }

    async fn delete_edge(&self, edge: DependencyEdge) -> StoreResult<()> {
        let team = {
            let mut db = self.db.lock().await;
            self.reload_if_changed(&mut db)?;
            let before = db.edges.len();
            db.edges.retain(|e| *e != edge);
            if db.edges.len() != before {
                self.persist(&db)?;
            }
            db.get(edge.dependent_id).and_then(|t| t.team_id)
        };
        self.feed.publish(
            ChangeEvent::new(Table::TaskDependencies, ChangeKind::Delete)
                .row(edge.dependent_id)
                .team(team),
        );
        Ok(())
    }
}

impl ChangeFeed for JsonStore {
    fn subscribe(&self, table: Table, filter: Option<RowFilter>) -> StoreResult<Subscription> {
        self.feed.subscribe(table, filter)
    }
}

/// Parse human-readable due date input with smart natural language support.
///
/// Supports:
/// - "today", "tomorrow", "yesterday"
/// - "next monday", "next tuesday", etc.
/// - "this friday", "this weekend"
/// - "end of week", "end of month"
/// - "in 3d", "in 2w", "in 1m"
/// - "YYYY-MM-DD" format
pub fn parse_due_input(s: &str) -> Option<NaiveDate> {
    parse_due_from(s, Local::now().date_naive())
}

/// `parse_due_input` relative to a fixed day.
pub fn parse_due_from(s: &str, today: NaiveDate) -> Option<NaiveDate> {
    let s = s.trim().to_lowercase();

    match s.as_str() {
        "today" => return Some(today),
        "tomorrow" => return today.succ_opt(),
        "yesterday" => return today.pred_opt(),
        "end of week" | "eow" => {
            let (_, end) = start_end_of_this_week(today);
            return Some(end);
        }
        "end of month" | "eom" => {
            let (year, month) = (today.year(), today.month());
            let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1)?;
            return first_of_next.pred_opt();
        }
        "this weekend" | "weekend" => {
            let days_until_saturday = (5 + 7 - today.weekday().num_days_from_monday()) % 7;
            return today.checked_add_signed(Duration::days(days_until_saturday as i64));
        }
        _ => {}
    }

    if let Some(rest) = s.strip_prefix("in ") {
        let rest = rest.trim();
        if let Some((idx, unit)) = rest.char_indices().last() {
            if let Ok(n) = rest[..idx].trim().parse::<i64>() {
                let days = match unit {
                    'd' => Some(n),
                    'w' => n.checked_mul(7),
                    // Approximate: 30 days per month
                    'm' => n.checked_mul(30),
                    _ => None,
                };
                return today.checked_add_signed(Duration::try_days(days?)?);
            }
        }
    }

    let weekdays = [
        ("monday", 0), ("tuesday", 1), ("wednesday", 2), ("thursday", 3),
        ("friday", 4), ("saturday", 5), ("sunday", 6),
        ("mon", 0), ("tue", 1), ("wed", 2), ("thu", 3),
        ("fri", 4), ("sat", 5), ("sun", 6),
    ];
    let current_day = today.weekday().num_days_from_monday() as i64;
    for (day_name, target_day) in weekdays {
        let days_ahead = (target_day + 7 - current_day) % 7;
        if s == day_name || s == format!("this {day_name}") {
            return today.checked_add_signed(Duration::days(days_ahead));
        }
        if s == format!("next {day_name}") {
            return today.checked_add_signed(Duration::days(days_ahead + 7));
        }
    }

    NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()
}

/// Midnight UTC of a calendar day, as stored in `due_date`.
pub fn due_at(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt))
}

/// Calculate the start and end dates of the current ISO week (Monday to Sunday).
pub fn start_end_of_this_week(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let weekday = today.weekday().num_days_from_monday() as i64;
    let start = today - Duration::days(weekday);
    (start, start + Duration::days(6))
}

/// Format a due date relative to today ("today", "tomorrow", "in 3d", "2d late").
pub fn format_due_relative(due: Option<DateTime<Utc>>, today: NaiveDate) -> String {
    match due {
        None => "-".into(),
        Some(d) => {
            let days = (d.date_naive() - today).num_days();
            match days {
                0 => "today".into(),
                1 => "tomorrow".into(),
                n if n > 1 => format!("in {n}d"),
                n => format!("{}d late", -n),
            }
        }
    }
}

pub fn format_priority(p: Option<Priority>) -> &'static str {
    match p {
        Some(Priority::Low) => "Low",
        Some(Priority::Medium) => "Medium",
        Some(Priority::High) => "High",
        Some(Priority::Urgent) => "Urgent",
        None => "-",
    }
}

pub fn format_status(s: Status) -> &'static str {
    match s {
        Status::Todo => "To Do",
        Status::InProgress => "In Progress",
        Status::Done => "Done",
    }
}

/// Truncate a string to a maximum width, adding ellipsis if needed.
pub fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut out = String::new();
        for (i, ch) in s.chars().enumerate() {
            if i + 1 >= width {
                out.push('…');
                break;
            }
            out.push(ch);
        }
        out
    }
}

/// Resolve a task identifier (either ID or title) among `tasks`.
/// Returns an error if the title has multiple matches and suggests using the ID instead.
pub fn resolve_task_identifier(identifier: &str, tasks: &[Task]) -> Result<TaskId, String> {
    if let Ok(id) = identifier.parse::<TaskId>() {
        return Ok(id);
    }

    let matches: Vec<&Task> = tasks
        .iter()
        .filter(|task| task.title.eq_ignore_ascii_case(identifier))
        .collect();

    match matches.as_slice() {
        [] => Err(format!("No task found with title '{identifier}'")),
        [only] => Ok(only.id),
        many => {
            let mut msg = format!("Multiple tasks found with title '{identifier}':\n");
            for task in many {
                msg.push_str(&format!("  ID {}: {} ({})\n", task.id, task.title, format_status(task.status)));
            }
            msg.push_str("Please use the specific ID instead.");
            Err(msg)
        }
    }
}
