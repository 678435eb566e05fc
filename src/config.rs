//! Configuration loading.
//!
//! Settings live in a JSON file in the taskboard directory (`~/.taskboard/`
//! by default). Every field has a default, so a missing or partial file is
//! fine. Command-line flags and environment variables override the file.

use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::feed::DEFAULT_FEED_CAPACITY;
use crate::fields::MissingDependencyPolicy;
use crate::task::{TeamId, UserId};

pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_DB_FILE: &str = "board.json";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `warn` or `taskboard=debug`.
    pub level: String,
    pub format: LogFormat,
    /// Write logs here instead of stderr. The terminal board always logs to a
    /// file, defaulting to `taskboard.log` in the taskboard directory.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// The knobs that change board semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    pub missing_dependencies: MissingDependencyPolicy,
    pub serialize_task_mutations: bool,
}

impl Default for BoardSettings {
    fn default() -> Self {
        BoardSettings {
            missing_dependencies: MissingDependencyPolicy::FailClosed,
            serialize_task_mutations: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Board database file. Relative paths resolve against the taskboard directory.
    pub db: Option<PathBuf>,
    /// Acting user for new tasks and the `--mine` scope.
    pub user_id: UserId,
    /// Team shown when no scope is given.
    pub default_team: Option<TeamId>,
    #[serde(flatten)]
    pub board: BoardSettings,
    /// How often the file store checks for writes by other processes.
    pub poll_interval_ms: u64,
    pub feed_capacity: usize,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db: None,
            user_id: 1,
            default_team: None,
            board: BoardSettings::default(),
            poll_interval_ms: 500,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load `path`, returning defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the config file from a taskboard directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&dir.join(CONFIG_FILE))
    }

    /// Resolve the database path: explicit override, then config, then default.
    pub fn db_path(&self, dir: &Path, explicit: Option<&Path>) -> PathBuf {
        match explicit.or(self.db.as_deref()) {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => dir.join(p),
            None => dir.join(DEFAULT_DB_FILE),
        }
    }

    pub fn board_settings(&self) -> BoardSettings {
        self.board
    }
}

/// Default taskboard directory: `$HOME/.taskboard`, or `./.taskboard`.
pub fn default_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".taskboard")
}
