//! Enumerations and field types for board tasks.
//!
//! This module defines the structured values a task carries (status, priority)
//! together with the policy switches that change how the board evaluates them.

use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};

/// Task workflow status. Each value is one board column.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, ValueEnum, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    #[serde(alias = "Todo", alias = "open")]
    Todo,
    #[serde(alias = "InProgress", alias = "in-progress")]
    InProgress,
    #[serde(alias = "Done")]
    Done,
}

impl Status {
    /// All statuses in board column order.
    pub const ALL: [Status; 3] = [Status::Todo, Status::InProgress, Status::Done];

    /// Column position of this status on the board.
    pub fn column_index(self) -> usize {
        match self {
            Status::Todo => 0,
            Status::InProgress => 1,
            Status::Done => 2,
        }
    }

    /// Status shown in the given column, if any.
    pub fn from_column(index: usize) -> Option<Status> {
        Self::ALL.get(index).copied()
    }

    /// Whether moving into this status requires satisfied dependencies.
    pub fn is_gated(self) -> bool {
        matches!(self, Status::InProgress | Status::Done)
    }
}

/// Priority classification for task importance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// How the evaluator treats a dependency whose task is not in the evaluated set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MissingDependencyPolicy {
    /// Unknown dependencies count as not done; the dependent stays blocked.
    #[default]
    FailClosed,
    /// Unknown dependencies are ignored.
    FailOpen,
}

/// Parse a status string leniently, falling back to `Todo` for anything unknown.
pub fn parse_status(s: &str) -> Status {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
        "in_progress" | "inprogress" => Status::InProgress,
        "done" => Status::Done,
        _ => Status::Todo,
    }
}

/// Deserialize a status that may be missing, null, mistyped or unrecognised.
///
/// Store payloads are not trusted to carry a valid status; anything that does
/// not name a known value lands in `Todo`.
pub fn deserialize_status_lenient<'de, D>(deserializer: D) -> Result<Status, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(|v| v.as_str())
        .map(parse_status)
        .unwrap_or_default())
}
