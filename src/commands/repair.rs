use super::report_failure;
use casket::{Controller, RepairOutcome};
use colored::Colorize;

pub async fn repair(controller: &Controller, identifier: &str) -> i32 {
    match controller.repair(identifier).await {
        Ok(RepairOutcome::Healthy(record)) => {
            println!(
                "{} {} {} is consistent",
                "✓".green(),
                record.identifier.bold(),
                record.version.dimmed()
            );
            0
        }
        Ok(RepairOutcome::Recorded(record)) => {
            println!(
                "{} Recorded {} {} (verified {})",
                "✓".green(),
                record.identifier.bold(),
                record.version.cyan(),
                record.install_path.display()
            );
            0
        }
        Ok(RepairOutcome::Removed { version }) => {
            println!(
                "{} Finished removing {} {}",
                "✓".green(),
                identifier.bold(),
                version.dimmed()
            );
            0
        }
        Err(err) => report_failure(identifier, &err),
    }
}
