//! Board TUI entry point and setup.

use std::io;

use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{prelude::CrosstermBackend, Terminal};
use tokio::runtime::Handle;

use crate::session::BoardSession;
use crate::store::Backend;
use crate::tui::board::BoardApp;

/// Initialise and run the board terminal user interface.
///
/// Must be called from outside the runtime that `runtime` points at; store
/// calls are driven with `Handle::block_on` while the change listener keeps
/// running on the runtime's workers.
pub fn run_board_tui<B>(runtime: &Handle, session: BoardSession<B>) -> io::Result<()>
where
    B: Backend + ?Sized + 'static,
{
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = BoardApp::new(runtime.clone(), session);
    let result = app.run(&mut terminal);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    runtime.block_on(app.into_session().close());
    result
}
