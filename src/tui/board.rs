//! Kanban board interface.
//!
//! Three columns, one per status, each sorted by due date. Ctrl+Left/Right
//! drags the selected card to the neighbouring column through the dependency
//! guard; Shift+Up/Down reorders it inside its column. Changes made in other
//! sessions show up as soon as the change listener has refetched the board.

use std::io;
use std::time::Duration;

use chrono::Local;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use ratatui::{
    backend::Backend as TerminalBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
    Frame, Terminal,
};
use tokio::runtime::Handle;

use crate::board::{CardMove, MoveOutcome};
use crate::db::{format_due_relative, format_priority, format_status};
use crate::error::BoardError;
use crate::fields::Status;
use crate::session::BoardSession;
use crate::store::{Backend, Scope};
use crate::task::{Task, TaskId};
use crate::tui::colors::{status_color, text_on, DARK_RED};

const CARD_HEIGHT: usize = 5;

/// Main board application state
pub struct BoardApp<B: ?Sized + 'static> {
    runtime: Handle,
    session: BoardSession<B>,
    selected_column: usize,
    selected_card: usize,
    column_scroll_offsets: [usize; 3],
    status_message: String,
    show_task_detail: bool,
    filter_active: bool,
    filter_text: String,
}

impl<B> BoardApp<B>
where
    B: Backend + ?Sized + 'static,
{
    pub fn new(runtime: Handle, session: BoardSession<B>) -> Self {
        BoardApp {
            runtime,
            session,
            selected_column: 0,
            selected_card: 0,
            column_scroll_offsets: [0; 3],
            status_message: String::new(),
            show_task_detail: false,
            filter_active: false,
            filter_text: String::new(),
        }
    }

    /// Hand the session back so it can be closed.
    pub fn into_session(self) -> BoardSession<B> {
        self.session
    }

    fn selected_status(&self) -> Status {
        Status::from_column(self.selected_column).unwrap_or(Status::Todo)
    }

    /// Cards of a column after the text filter.
    fn visible(&self, status: Status) -> Vec<Task> {
        let cards = self.session.board().cards(status);
        if self.filter_text.is_empty() {
            return cards;
        }
        cards.into_iter().filter(|t| matches_filter(t, &self.filter_text)).collect()
    }

    fn selected_task(&self) -> Option<Task> {
        self.visible(self.selected_status()).into_iter().nth(self.selected_card)
    }

    fn clamp_selection(&mut self) {
        let column_len = self.visible(self.selected_status()).len();
        if column_len == 0 {
            self.selected_card = 0;
            self.column_scroll_offsets[self.selected_column] = 0;
        } else if self.selected_card >= column_len {
            self.selected_card = column_len - 1;
        }
    }

    /// Put the cursor on a card, wherever it is now.
    fn select_task(&mut self, id: TaskId) {
        for status in Status::ALL {
            if let Some(i) = self.visible(status).iter().position(|t| t.id == id) {
                self.selected_column = status.column_index();
                self.selected_card = i;
                return;
            }
        }
        self.clamp_selection();
    }

    fn set_status_message(&mut self, msg: impl Into<String>) {
        self.status_message = msg.into();
    }

    fn clear_status_message(&mut self) {
        self.status_message.clear();
    }

    fn report_error(&mut self, e: BoardError) {
        let msg = match &e {
            BoardError::Blocked { task_id, blockers, .. } => format!(
                "#{task_id} is blocked by {}",
                blockers.iter().map(|b| format!("#{b}")).collect::<Vec<_>>().join(", ")
            ),
            _ => format!("Error: {e}"),
        };
        self.set_status_message(msg);
    }

    /// Drag the selected card to the neighbouring column.
    fn move_card(&mut self, forward: bool) {
        let Some(task) = self.selected_task() else {
            return;
        };
        let target = if forward {
            Status::from_column(self.selected_column + 1)
        } else {
            self.selected_column.checked_sub(1).and_then(Status::from_column)
        };
        let Some(target) = target else {
            return;
        };
        let Some((from, from_index)) = self.session.board().columns().position(task.id) else {
            return;
        };

        let mv = CardMove::new(from, from_index, target, usize::MAX);
        match self.runtime.block_on(self.session.move_card(mv)) {
            Ok(MoveOutcome::StatusChanged { task_id, status }) => {
                self.select_task(task_id);
                self.set_status_message(format!("Moved #{task_id} to {}", format_status(status)));
            }
            Ok(MoveOutcome::Reordered { .. }) => {}
            Err(e) => self.report_error(e),
        }
    }

    /// Swap the selected card with its visible neighbour in the same column.
    fn reorder_card(&mut self, down: bool) {
        let status = self.selected_status();
        let visible = self.visible(status);
        let Some(task) = visible.get(self.selected_card) else {
            return;
        };
        let neighbour = if down {
            visible.get(self.selected_card + 1)
        } else {
            self.selected_card.checked_sub(1).and_then(|i| visible.get(i))
        };
        let Some(neighbour) = neighbour else {
            return;
        };
        let columns = self.session.board().columns();
        let (Some((_, from_index)), Some((_, to_index))) =
            (columns.position(task.id), columns.position(neighbour.id))
        else {
            return;
        };

        let task_id = task.id;
        let mv = CardMove::new(status, from_index, status, to_index);
        match self.runtime.block_on(self.session.move_card(mv)) {
            Ok(_) => self.select_task(task_id),
            Err(e) => self.report_error(e),
        }
    }

    fn refresh(&mut self) {
        match self.runtime.block_on(self.session.refresh()) {
            Ok(stats) => {
                self.session.board_mut().sync();
                self.clamp_selection();
                self.set_status_message(format!("Refreshed: {} tasks", stats.tasks));
            }
            Err(e) => self.set_status_message(format!("Refresh failed: {e}")),
        }
    }

    /// Step the team filter through the teams on the board, then back to all.
    fn cycle_team(&mut self) {
        let teams = self.session.teams();
        let next = next_team(self.session.board().team_filter(), &teams);
        self.session.set_team_filter(next);
        self.selected_card = 0;
        self.clamp_selection();
        match next {
            Some(team) => self.set_status_message(format!("Team {team}")),
            None => self.set_status_message("All teams"),
        }
    }

    /// Handle one key press. Returns true when the user asked to quit.
    pub fn handle_key(&mut self, key: KeyEvent) -> bool {
        if self.filter_active {
            match key.code {
                KeyCode::Esc => {
                    self.filter_active = false;
                    self.filter_text.clear();
                    self.clear_status_message();
                }
                KeyCode::Enter => {
                    self.filter_active = false;
                    if self.filter_text.is_empty() {
                        self.set_status_message("Filter cleared");
                    } else {
                        let shown: usize = Status::ALL.iter().map(|&s| self.visible(s).len()).sum();
                        self.set_status_message(format!("Filter: '{}' ({shown} tasks shown)", self.filter_text));
                    }
                }
                KeyCode::Backspace => {
                    self.filter_text.pop();
                }
                KeyCode::Char(c) => self.filter_text.push(c),
                _ => {}
            }
            self.clamp_selection();
            return false;
        }

        self.clear_status_message();

        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Char('q') | KeyCode::Esc => {
                if self.show_task_detail {
                    self.show_task_detail = false;
                } else {
                    return true;
                }
            }

            KeyCode::Enter => self.show_task_detail = !self.show_task_detail,

            // Card movement (check modifiers before plain navigation)
            KeyCode::Left if key.modifiers.contains(KeyModifiers::CONTROL) => self.move_card(false),
            KeyCode::Right if key.modifiers.contains(KeyModifiers::CONTROL) => self.move_card(true),
            KeyCode::Up if key.modifiers.contains(KeyModifiers::SHIFT) => self.reorder_card(false),
            KeyCode::Down if key.modifiers.contains(KeyModifiers::SHIFT) => self.reorder_card(true),

            KeyCode::Left => {
                if self.selected_column > 0 {
                    self.selected_column -= 1;
                    self.clamp_selection();
                }
            }
            KeyCode::Right => {
                if self.selected_column < Status::ALL.len() - 1 {
                    self.selected_column += 1;
                    self.clamp_selection();
                }
            }
            KeyCode::Up => self.selected_card = self.selected_card.saturating_sub(1),
            KeyCode::Down => {
                let column_len = self.visible(self.selected_status()).len();
                if self.selected_card + 1 < column_len {
                    self.selected_card += 1;
                }
            }

            KeyCode::Char('r') => self.refresh(),
            KeyCode::Char('t') => self.cycle_team(),
            KeyCode::Char('/') => {
                self.filter_active = true;
                self.set_status_message("Filter: type to search titles, Enter to apply, Esc to cancel");
            }
            KeyCode::Char('h') => {
                self.set_status_message(
                    "Help: arrows: Select | Ctrl+Left/Right: Move | Shift+Up/Down: Reorder | Enter: Details | r: Refresh | t: Team | /: Filter | q: Quit",
                );
            }
            _ => {}
        }
        false
    }

    fn handle_input(&mut self) -> io::Result<bool> {
        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(self.handle_key(key));
                }
            }
        }
        Ok(false)
    }

    /// Main event loop
    pub fn run<T: TerminalBackend>(&mut self, terminal: &mut Terminal<T>) -> io::Result<()> {
        loop {
            // Pick up whatever the change listener wrote since the last frame
            if self.session.board_mut().sync() {
                self.clamp_selection();
            }
            terminal.draw(|f| self.render(f))?;

            if self.handle_input()? {
                break;
            }
        }
        Ok(())
    }

    fn render(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Board
                Constraint::Length(1), // Status bar
            ])
            .split(f.area());

        self.render_header(f, chunks[0]);
        self.render_board(f, chunks[1]);
        self.render_status_bar(f, chunks[2]);

        if self.show_task_detail {
            self.render_task_detail_popup(f);
        }
    }

    fn render_header(&self, f: &mut Frame, area: Rect) {
        let scope = match self.session.scope() {
            Scope::Team(team) => format!("Team {team}"),
            Scope::User(user) => format!("User {user}"),
        };
        let team = match self.session.board().team_filter() {
            Some(team) => format!("  Showing: team {team}"),
            None => String::new(),
        };
        let live = if self.session.is_live() { "live" } else { "offline" };

        let header_text = vec![Line::from(vec![
            Span::styled("TASK BOARD", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw("  "),
            Span::styled(
                format!("Board: {scope}{team}  [{live}]"),
                Style::default().fg(Color::Cyan).add_modifier(Modifier::ITALIC),
            ),
        ])];

        let header_block = Paragraph::new(header_text)
            .block(Block::default().borders(Borders::ALL))
            .alignment(Alignment::Center);
        f.render_widget(header_block, area);
    }

    fn render_board(&mut self, f: &mut Frame, area: Rect) {
        let columns_layout = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Ratio(1, 3); 3])
            .split(area);

        for (status, &column_area) in Status::ALL.into_iter().zip(columns_layout.iter()) {
            self.render_column(f, column_area, status);
        }
    }

    fn render_column(&mut self, f: &mut Frame, area: Rect, status: Status) {
        let column_index = status.column_index();
        let is_selected = column_index == self.selected_column;
        let cards = self.visible(status);

        let border_style = if is_selected {
            Style::default().fg(status_color(status)).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        let block = Block::default()
            .borders(Borders::ALL)
            .title(format!("{} ({})", format_status(status), cards.len()))
            .border_style(border_style);

        let inner = block.inner(area);
        f.render_widget(block, area);

        if cards.is_empty() || inner.height == 0 {
            return;
        }

        let available_height = inner.height as usize;
        let visible_cards = available_height / CARD_HEIGHT;
        let scroll_offset = if is_selected {
            let offset = scroll_to(self.column_scroll_offsets[column_index], self.selected_card, visible_cards);
            self.column_scroll_offsets[column_index] = offset;
            offset
        } else {
            self.column_scroll_offsets[column_index].min(cards.len() - 1)
        };

        let mut current_y = 0;
        let mut rendered_cards = 0;
        for (card_index, task) in cards.iter().enumerate().skip(scroll_offset) {
            if current_y + CARD_HEIGHT > available_height {
                break;
            }
            let card_area = Rect {
                x: inner.x,
                y: inner.y + current_y as u16,
                width: inner.width,
                height: CARD_HEIGHT as u16,
            };
            self.render_card(f, card_area, task, is_selected && card_index == self.selected_card);
            current_y += CARD_HEIGHT;
            rendered_cards += 1;
        }

        if scroll_offset > 0 {
            let indicator = Paragraph::new(format!("▲ +{scroll_offset} above")).style(Style::default().fg(Color::Cyan));
            f.render_widget(indicator, Rect { x: inner.x, y: inner.y, width: inner.width, height: 1 });
        }
        let remaining = cards.len().saturating_sub(scroll_offset + rendered_cards);
        if remaining > 0 {
            let indicator = Paragraph::new(format!("▼ +{remaining} below")).style(Style::default().fg(Color::Cyan));
            f.render_widget(
                indicator,
                Rect { x: inner.x, y: inner.y + inner.height - 1, width: inner.width, height: 1 },
            );
        }
    }

    fn render_card(&self, f: &mut Frame, area: Rect, task: &Task, is_selected: bool) {
        let blocked = task.dependencies.is_blocked();
        let style = if is_selected {
            let bg = status_color(task.status);
            Style::default().bg(bg).fg(text_on(bg)).add_modifier(Modifier::BOLD)
        } else if blocked {
            Style::default().bg(DARK_RED).fg(Color::White)
        } else {
            Style::default().bg(Color::DarkGray)
        };

        let mut card_text = vec![Line::from(format!("#{}", task.id))];
        let available_width = area.width.saturating_sub(2) as usize;
        for line in wrap_title(&task.title, available_width, 2) {
            card_text.push(Line::from(line));
        }

        let today = Local::now().date_naive();
        let mut footer = format_due_relative(task.due_date, today);
        if task.subtasks.total > 0 {
            footer.push_str(&format!(" | {}/{}", task.subtasks.completed, task.subtasks.total));
        }
        if blocked {
            footer.push_str(" | BLOCKED");
        }
        card_text.push(Line::from(footer));

        let card_block = Paragraph::new(card_text)
            .block(Block::default().borders(Borders::ALL))
            .style(style)
            .wrap(Wrap { trim: true });
        f.render_widget(card_block, area);
    }

    fn render_status_bar(&self, f: &mut Frame, area: Rect) {
        let status_text = if self.filter_active {
            format!("Filter: {} | Type to search, Enter to apply, Esc to cancel", self.filter_text)
        } else if !self.status_message.is_empty() {
            self.status_message.clone()
        } else {
            let total: usize = Status::ALL.iter().map(|&s| self.visible(s).len()).sum();
            let filter_indicator = if self.filter_text.is_empty() {
                String::new()
            } else {
                format!(" [Filter: {}]", self.filter_text)
            };
            format!("Tasks: {total}{filter_indicator} | Ctrl+Left/Right: Move | t: Team | /: Filter | h: Help")
        };

        let color = status_color(self.selected_status());
        let status = Paragraph::new(status_text)
            .style(Style::default().bg(color).fg(text_on(color)))
            .alignment(Alignment::Left);
        f.render_widget(status, area);
    }

    fn render_task_detail_popup(&self, f: &mut Frame) {
        let Some(task) = self.selected_task() else {
            return;
        };

        let popup_area = {
            let area = f.area();
            let popup_width = (area.width * 80) / 100;
            let popup_height = (area.height * 80) / 100;
            let x = (area.width - popup_width) / 2;
            let y = (area.height - popup_height) / 2;
            Rect::new(x, y, popup_width, popup_height)
        };
        f.render_widget(Clear, popup_area);

        let today = Local::now().date_naive();
        let describe = |id: TaskId| match self.session.task(id) {
            Some(t) => format!("#{} {} [{}]", t.id, t.title, format_status(t.status)),
            None => format!("#{id} [not visible]"),
        };
        let dependencies: Vec<String> = self.session.dependencies_of(task.id).into_iter().map(describe).collect();
        let blockers = self.session.blockers(task.id);

        let mut detail_lines = vec![
            Line::from(vec![Span::styled(
                format!("Task #{}: {}", task.id, task.title),
                Style::default().add_modifier(Modifier::BOLD),
            )]),
            Line::from(""),
            Line::from(format!("Status:       {}", format_status(task.status))),
            Line::from(format!("Priority:     {}", format_priority(task.priority))),
            Line::from(format!("Due:          {}", format_due_relative(task.due_date, today))),
            Line::from(format!("Team:         {}", task.team_id.map(|t| t.to_string()).unwrap_or_else(|| "-".into()))),
            Line::from(format!(
                "Assignee:     {}",
                task.assignee_id.map(|a| a.to_string()).unwrap_or_else(|| "-".into())
            )),
            Line::from(format!("Subtasks:     {}/{}", task.subtasks.completed, task.subtasks.total)),
            Line::from(""),
            Line::from("Depends on:"),
        ];
        if dependencies.is_empty() {
            detail_lines.push(Line::from("  -"));
        }
        detail_lines.extend(dependencies.into_iter().map(|d| Line::from(format!("  {d}"))));
        if !blockers.is_empty() {
            detail_lines.push(Line::from(Span::styled(
                format!(
                    "Blocked until done: {}",
                    blockers.iter().map(|b| format!("#{b}")).collect::<Vec<_>>().join(", ")
                ),
                Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            )));
        }
        detail_lines.extend([
            Line::from(""),
            Line::from("Description:"),
            Line::from(task.description.clone().unwrap_or_else(|| "-".into())),
        ]);

        let popup_block = Block::default()
            .borders(Borders::ALL)
            .title("Task Details (Press Enter to close)")
            .title_alignment(Alignment::Center)
            .border_style(Style::default().fg(status_color(task.status)).add_modifier(Modifier::BOLD));

        let popup_paragraph = Paragraph::new(detail_lines)
            .block(popup_block)
            .wrap(Wrap { trim: true })
            .style(Style::default().bg(Color::Black));
        f.render_widget(popup_paragraph, popup_area);
    }
}

fn matches_filter(task: &Task, filter: &str) -> bool {
    let filter = filter.to_lowercase();
    task.title.to_lowercase().contains(&filter)
        || task.description.as_deref().is_some_and(|d| d.to_lowercase().contains(&filter))
}

/// The team after `current` in `teams`; past the last team comes "all".
fn next_team(current: Option<u64>, teams: &[u64]) -> Option<u64> {
    match current {
        None => teams.first().copied(),
        Some(team) => teams.iter().copied().find(|&t| t > team),
    }
}

/// Scroll offset that keeps `selected` inside a window of `visible` rows.
fn scroll_to(offset: usize, selected: usize, visible: usize) -> usize {
    if selected < offset {
        selected
    } else if visible > 0 && selected >= offset + visible {
        selected + 1 - visible
    } else {
        offset
    }
}

/// Greedy word wrap, at most `max_lines` lines.
fn wrap_title(title: &str, width: usize, max_lines: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in title.split_whitespace() {
        if current.is_empty() {
            current = word.to_string();
        } else if current.chars().count() + 1 + word.chars().count() <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            if lines.len() == max_lines {
                return lines;
            }
            current = word.to_string();
        }
    }
    if !current.is_empty() && lines.len() < max_lines {
        lines.push(current);
    }
    lines
}
