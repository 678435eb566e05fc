//! Color constants for the terminal user interface.

use ratatui::style::Color;

use crate::fields::Status;

// Native Color::Blue is used for To Do

/// Used for Done
pub const DARK_GREEN: Color = Color::Rgb(0, 80, 0);
/// Used for In Progress
pub const GOLD: Color = Color::Rgb(255, 215, 0);
/// Used for blocked cards
pub const DARK_RED: Color = Color::Rgb(114, 0, 0);

/// Theme color of a status column.
pub fn status_color(status: Status) -> Color {
    match status {
        Status::Todo => Color::Blue,
        Status::InProgress => GOLD,
        Status::Done => DARK_GREEN,
    }
}

/// Readable text color on top of `background`.
pub fn text_on(background: Color) -> Color {
    match background {
        GOLD => Color::Rgb(20, 20, 20),
        _ => Color::White,
    }
}
