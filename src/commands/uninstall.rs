use super::{report_failure, suggest};
use casket::{CancelToken, CasketError, Controller};
use colored::Colorize;

pub async fn uninstall(controller: &Controller, identifiers: &[String], cancel: &CancelToken) -> i32 {
    let mut code = 0;

    for identifier in identifiers {
        match controller.uninstall(identifier, cancel).await {
            Ok(outcome) => {
                println!(
                    "  {} Uninstalled {} {}",
                    "✓".green(),
                    outcome.identifier.bold(),
                    outcome.version.dimmed()
                );
            }
            Err(CasketError::NotInstalled(_)) => {
                println!("  {} {} not installed", "⚠".yellow(), identifier.bold());
                if let Ok(records) = controller.list().await
                    && let Some(name) = suggest(identifier, records.iter().map(|r| r.identifier.as_str()))
                {
                    println!("    Did you mean {}?", name.cyan());
                }
                code = code.max(1);
            }
            Err(err) => code = code.max(report_failure(identifier, &err)),
        }
    }
    code
}
