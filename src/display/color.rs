//! Minimal ANSI SGR color helper. Deliberately not a terminal-capability
//! crate: whether to emit codes at all is decided once, by `Config`.

use crate::action::ActionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Green,
    Yellow,
    Red,
    Cyan,
    Dim,
}

impl Color {
    fn code(self) -> &'static str {
        match self {
            Self::Green => "32",
            Self::Yellow => "33",
            Self::Red => "31",
            Self::Cyan => "36",
            Self::Dim => "2",
        }
    }
}

pub fn paint(text: &str, color: Color, enabled: bool) -> String {
    if !enabled {
        return text.to_string();
    }
    format!("\x1b[{}m{}\x1b[0m", color.code(), text)
}

pub fn status_color(status: ActionStatus) -> Color {
    match status {
        ActionStatus::Success => Color::Green,
        ActionStatus::Warning => Color::Yellow,
        ActionStatus::Failure => Color::Red,
        ActionStatus::Skipped | ActionStatus::Omitted => Color::Dim,
        ActionStatus::Pending | ActionStatus::Running => Color::Cyan,
    }
}

pub fn status_mark(status: ActionStatus) -> char {
    match status {
        ActionStatus::Success => '+',
        ActionStatus::Warning => '!',
        ActionStatus::Failure => 'x',
        ActionStatus::Skipped => '-',
        ActionStatus::Omitted => 'o',
        ActionStatus::Pending | ActionStatus::Running => '.',
    }
}
