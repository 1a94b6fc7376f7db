//! Terminal color policy.
//!
//! `NO_COLOR` (any value) wins, then `CLICOLOR_FORCE` (non-zero), then
//! `CLICOLOR=0`; otherwise colors follow whether stdout is a terminal.

use colored::control;
use std::io::IsTerminal;

pub fn init_colors() {
    let var = |name| std::env::var(name).ok();
    let enabled = colors_enabled(
        var("NO_COLOR").is_some(),
        var("CLICOLOR_FORCE").as_deref(),
        var("CLICOLOR").as_deref(),
        std::io::stdout().is_terminal(),
    );
    control::set_override(enabled);
}

fn colors_enabled(
    no_color: bool,
    clicolor_force: Option<&str>,
    clicolor: Option<&str>,
    is_tty: bool,
) -> bool {
    if no_color {
        return false;
    }
    if clicolor_force.is_some_and(|v| v != "0") {
        return true;
    }
    if clicolor == Some("0") {
        return false;
    }
    is_tty
}
