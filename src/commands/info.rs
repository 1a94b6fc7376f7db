use super::report_failure;
use casket::{Ledger, Manifest};
use colored::Colorize;
use std::path::Path;

/// Validate a manifest and describe it, including install status when a
/// ledger is available. `--cask` prints the normalized DSL instead.
pub async fn info(path: &Path, ledger: &dyn Ledger, as_cask: bool) -> i32 {
    let manifest = match Manifest::load(path) {
        Ok(manifest) => manifest,
        Err(err) => return report_failure(&path.display().to_string(), &err),
    };

    if as_cask {
        print!("{}", manifest.to_cask());
        return 0;
    }

    println!(
        "{} {}: {}",
        "==>".bold().green(),
        manifest.identifier.bold(),
        manifest.version.cyan()
    );
    println!("{}", manifest.display_name);
    if let Some(homepage) = &manifest.homepage {
        println!("{}", homepage.blue().underline());
    }
    println!("{} {}", "URL:".dimmed(), manifest.source_url);
    println!("{} {}", "SHA-256:".dimmed(), manifest.content_hash);
    println!("{} {}", "App:".dimmed(), manifest.app_bundle_name);

    match ledger.get(&manifest.identifier).await {
        Ok(Some(record)) if record.matches(&manifest) => {
            println!("{} {}", "Installed".green(), record.install_path.display());
        }
        Ok(Some(record)) => {
            println!(
                "{} {} (manifest has {})",
                "Installed".yellow(),
                record.version,
                manifest.version
            );
        }
        Ok(None) => println!("{}", "Not installed".dimmed()),
        Err(err) => tracing::debug!(error = %err, "ledger unavailable"),
    }
    0
}
