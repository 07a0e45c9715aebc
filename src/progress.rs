//! Pseudographical progress indicator for batch generation.
//!
//! Strictly observational: the scheduler ticks it after each finalised
//! prompt and never reads it back.

use crossterm::cursor;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};

const FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const CELLS: usize = 30;

pub(crate) struct Progress {
    total: usize,
    done: usize,
    frame: usize,
    enabled: bool,
}

impl Progress {
    pub(crate) fn new(total: usize, enabled: bool) -> Self {
        if enabled {
            let _ = crossterm::execute!(std::io::stderr(), cursor::Hide);
        }
        Progress {
            total,
            done: 0,
            frame: 0,
            enabled,
        }
    }

    /// One more prompt reached a terminal state.
    pub(crate) fn tick(&mut self) {
        self.done = (self.done + 1).min(self.total);
        if !self.enabled {
            return;
        }
        let filled = CELLS * self.done / self.total.max(1);
        let bar = format!("{}{}", "#".repeat(filled), ".".repeat(CELLS - filled));
        let _ = crossterm::execute!(
            std::io::stderr(),
            Print(format!("\r[{bar}] {}/{} ", self.done, self.total)),
            SetForegroundColor(Color::DarkGrey),
            Print(FRAMES[self.frame]),
            ResetColor,
        );
        self.frame = (self.frame + 1) % FRAMES.len();
    }

    /// Clear the indicator line and restore the cursor.
    pub(crate) fn finish(&mut self) {
        if !self.enabled {
            return;
        }
        let _ = crossterm::execute!(
            std::io::stderr(),
            Clear(ClearType::CurrentLine),
            Print("\r"),
            ResetColor,
            cursor::Show,
        );
    }
}
