use super::report_failure;
use casket::{CancelToken, Controller, InstallOutcome, Manifest};
use colored::Colorize;
use futures::future::join_all;
use std::path::PathBuf;

/// Install (or, with `upgrade`, upgrade) every manifest. Distinct identifiers
/// run concurrently; repeats of one identifier queue on its lock.
pub async fn install(
    controller: &Controller,
    manifest_paths: &[PathBuf],
    upgrade: bool,
    cancel: &CancelToken,
) -> i32 {
    let mut code = 0;
    let mut manifests = Vec::new();

    for path in manifest_paths {
        match Manifest::load(path) {
            Ok(manifest) => manifests.push(manifest),
            Err(err) => code = code.max(report_failure(&path.display().to_string(), &err)),
        }
    }

    if manifests.is_empty() {
        return code;
    }

    println!(
        "{} {} casks...",
        if upgrade { "Upgrading" } else { "Installing" },
        manifests.len().to_string().bold()
    );

    let results = join_all(manifests.iter().map(|manifest| async move {
        if upgrade {
            controller.upgrade(manifest, cancel).await
        } else {
            controller.install(manifest, cancel).await
        }
    }))
    .await;

    let mut installed = 0;
    for (manifest, result) in manifests.iter().zip(results) {
        match result {
            Ok(InstallOutcome::Installed(record)) => {
                installed += 1;
                println!(
                    "  {} Installed {} {}",
                    "✓".green(),
                    record.identifier.bold(),
                    record.version.dimmed()
                );
            }
            Ok(InstallOutcome::Upgraded {
                from_version,
                record,
            }) => {
                installed += 1;
                println!(
                    "  {} Upgraded {} {} → {}",
                    "✓".green(),
                    record.identifier.bold(),
                    from_version.dimmed(),
                    record.version.cyan()
                );
            }
            Ok(InstallOutcome::AlreadyInstalled(record)) => {
                println!(
                    "  {} {} {} already installed",
                    "ℹ".blue(),
                    record.identifier.bold(),
                    record.version.dimmed()
                );
            }
            Err(err) => {
                code = code.max(report_failure(&manifest.identifier, &err));
                if err.exit_code() == 4 {
                    eprintln!(
                        "    Files are in place but not recorded; run {}",
                        format!("casket repair {}", manifest.identifier).cyan()
                    );
                }
            }
        }
    }

    if installed > 0 {
        println!(
            "{} {} {}",
            "✓".green().bold(),
            installed.to_string().bold(),
            if upgrade { "upgraded" } else { "installed" }
        );
    }
    code
}
