//! # tb - Task Board CLI
//!
//! Command-line front end for a kanban board whose tasks can depend on one
//! another. A task cannot move to in-progress or done while anything it
//! depends on is unfinished.
//!
//! ## Quick Start
//!
//! ```bash
//! # Print the board for team 1
//! tb board --team 1
//!
//! # Add tasks and a dependency between them
//! tb add "Write release notes" --team 1 --due friday
//! tb add "Tag release" --team 1
//! tb depend 2 --on 1
//!
//! # Refused until task 1 is done
//! tb status 2 in-progress
//!
//! # Interactive board
//! tb ui --team 1
//! ```
//!
//! Data lives in `~/.taskboard/board.json` unless `--db` or the config file
//! says otherwise. Several `tb ui` sessions on the same file see each other's
//! changes.

use clap::Parser;

use taskboard::cli::Cli;
use taskboard::cmd::*;
use taskboard::config::{default_dir, Config};
use taskboard::logging;

const UI_LOG_FILE: &str = "taskboard.log";

fn main() {
    let cli = Cli::parse();

    // Completions need neither config nor storage
    if let Commands::Completions { shell } = &cli.command {
        cmd_completions(*shell);
        return;
    }

    let dir = cli.dir.clone().unwrap_or_else(default_dir);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("Failed to create taskboard directory {}: {}", dir.display(), e);
        std::process::exit(1);
    }

    let mut config = match Config::load_from_dir(&dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }

    // The terminal board owns the screen, so its logs go to a file
    let ui_log = matches!(cli.command, Commands::Ui { .. })
        .then(|| config.log.file.clone().unwrap_or_else(|| dir.join(UI_LOG_FILE)));
    if let Err(e) = logging::init(&config.log, ui_log.as_deref(), cli.log_level.as_deref()) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let db_path = config.db_path(&dir, cli.db.as_deref());
    let user = cli.user.unwrap_or(config.user_id);
    tracing::debug!(db = %db_path.display(), user, "starting");

    let ctx = Context::new(config, &db_path, user);

    match cli.command {
        Commands::Completions { .. } => unreachable!("completions handled above"),

        Commands::Board { scope } => cmd_board(&ctx, scope),

        Commands::Ui { scope } => cmd_ui(&ctx, scope),

        Commands::Add { title, desc, priority, due, team, assignee, parent, status } =>
            cmd_add(&ctx, title, desc, priority, due, team, assignee, parent, status),

        Commands::Status { id, status } => cmd_status(&ctx, id, status),

        Commands::Move { id, status, index } => cmd_move(&ctx, id, status, index),

        Commands::Update { id, title, desc, priority, due, clear_due, assignee, unassign, team } =>
            cmd_update(&ctx, id, title, desc, priority, due, clear_due, assignee, unassign, team),

        Commands::Depend { id, on } => cmd_depend(&ctx, id, on),

        Commands::Undepend { id, on } => cmd_undepend(&ctx, id, on),

        Commands::Deps { id, set } => cmd_deps(&ctx, id, set),

        Commands::View { id } => cmd_view(&ctx, id),
    }
}
