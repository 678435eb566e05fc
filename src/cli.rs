use std::path::PathBuf;

use clap::Parser;

use crate::cmd::Commands;
use crate::config::LogFormat;
use crate::task::UserId;

/// Kanban board with task dependencies.
/// Storage defaults to ~/.taskboard/board.json or a path passed via --db.
#[derive(Parser)]
#[command(name = "tb", version, about = "Task board with dependency-gated status changes")]
pub struct Cli {
    /// Path to the JSON board file.
    #[arg(long, global = true, env = "TASKBOARD_DB")]
    pub db: Option<PathBuf>,

    /// Acting user id.
    #[arg(long, global = true, env = "TASKBOARD_USER")]
    pub user: Option<UserId>,

    /// Taskboard directory holding config.json (default: ~/.taskboard).
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `taskboard=trace`. Overrides TASKBOARD_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Status;

    #[test]
    fn test_cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_move() {
        let cli = Cli::try_parse_from(["tb", "move", "4", "in-progress", "--index", "2"]).unwrap();
        match cli.command {
            Commands::Move { id, status, index } => {
                assert_eq!(id, "4");
                assert_eq!(status, Status::InProgress);
                assert_eq!(index, Some(2));
            }
            _ => panic!("expected move"),
        }
    }

    #[test]
    fn test_deps_set_may_be_empty() {
        let cli = Cli::try_parse_from(["tb", "deps", "3", "--set"]).unwrap();
        match cli.command {
            Commands::Deps { set, .. } => assert_eq!(set, Some(vec![])),
            _ => panic!("expected deps"),
        }
        let cli = Cli::try_parse_from(["tb", "deps", "3", "--set", "1,2"]).unwrap();
        match cli.command {
            Commands::Deps { set, .. } => assert_eq!(set, Some(vec![1, 2])),
            _ => panic!("expected deps"),
        }
    }

    #[test]
    fn test_team_and_mine_conflict() {
        assert!(Cli::try_parse_from(["tb", "board", "--team", "1", "--mine"]).is_err());
    }
}
