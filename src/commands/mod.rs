//! Command implementations for the casket CLI
//!
//! - **install**: install and upgrade from manifest files
//! - **uninstall**: remove installed casks
//! - **list**: installed casks, optionally re-verified
//! - **repair**: reconcile the ledger with what is on disk
//! - **info**: validate and describe a manifest
//!
//! Every command returns the process exit code for its operands; with several
//! operands the highest code wins.

pub mod info;
pub mod install;
pub mod list;
pub mod repair;
pub mod uninstall;

pub use info::info;
pub use install::install;
pub use list::list;
pub use repair::repair;
pub use uninstall::uninstall;

use casket::controller::Reporter;
use casket::{CasketError, InstallState};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Print a failure for one operand and return its exit code
pub(crate) fn report_failure(target: &str, err: &CasketError) -> i32 {
    eprintln!("{} {}: {}", "✗".red(), target.bold(), err);
    err.exit_code()
}

/// Closest installed identifier to a mistyped one
pub(crate) fn suggest<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .into_iter()
        .map(|candidate| (candidate, strsim::jaro_winkler(name, candidate)))
        .filter(|(_, score)| *score >= 0.85)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(candidate, _)| candidate)
}

/// One spinner per identifier showing the current lifecycle stage
pub fn stage_reporter(progress: &MultiProgress) -> Reporter {
    let progress = progress.clone();
    let spinners: Mutex<HashMap<String, ProgressBar>> = Mutex::default();

    Arc::new(move |identifier: &str, state: InstallState| {
        let mut spinners = spinners.lock().unwrap_or_else(|e| e.into_inner());
        match state {
            InstallState::Fetching
            | InstallState::Verifying
            | InstallState::Staging
            | InstallState::Installing
            | InstallState::Uninstalling
            | InstallState::Repairing => {
                let pb = spinners.entry(identifier.to_string()).or_insert_with(|| {
                    let pb = progress.add(ProgressBar::new_spinner());
                    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
                        pb.set_style(style);
                    }
                    pb.enable_steady_tick(Duration::from_millis(100));
                    pb
                });
                pb.set_message(format!("{} {}", identifier.bold(), state.to_string().dimmed()));
            }
            _ => {
                if let Some(pb) = spinners.remove(identifier) {
                    pb.finish_and_clear();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggest_close_match() {
        let installed = ["hv-kb390l-config", "firefox", "visual-studio-code"];
        assert_eq!(
            suggest("hv-kb390-config", installed.iter().copied()),
            Some("hv-kb390l-config")
        );
        assert_eq!(suggest("firefx", installed.iter().copied()), Some("firefox"));
        assert_eq!(suggest("zzz", installed.iter().copied()), None);
    }

    #[test]
    fn test_report_failure_returns_exit_code() {
        let err = CasketError::NotInstalled("demo".into());
        assert_eq!(report_failure("demo", &err), 1);
    }
}
