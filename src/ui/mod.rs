// Terminal output for Exliar GPU
//
// Human-readable rendering of inventories and reports. Machine-readable
// output goes through serde_json in main instead.

pub mod colors;
pub mod report;

use std::io::{self, IsTerminal};

use colors::Theme;

/// Colored theme when stdout is a terminal and NO_COLOR is unset
pub fn detect_theme() -> Theme {
    if io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none() {
        Theme::default()
    } else {
        Theme::plain()
    }
}
