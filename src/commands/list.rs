use casket::error::IntegrityError;
use casket::{Controller, InstalledRecord, verify};
use colored::Colorize;
use rayon::prelude::*;
use std::path::PathBuf;

enum Check {
    Ok,
    Mismatch(IntegrityError),
    Missing,
    Unreadable(String),
}

/// List installed casks. With `verify`, re-hash each retained artifact against
/// its recorded digest, in parallel.
pub async fn list(controller: &Controller, verify: bool) -> i32 {
    let records = match controller.list().await {
        Ok(records) => records,
        Err(err) => return super::report_failure("ledger", &err),
    };

    if records.is_empty() {
        println!("No casks installed");
        return 0;
    }

    if !verify {
        for record in &records {
            println!(
                "{} {}  {}",
                record.identifier.bold(),
                record.version.dimmed(),
                record.install_path.display()
            );
        }
        return 0;
    }

    let mut targets = Vec::with_capacity(records.len());
    for record in records {
        let artifact = controller.retained_artifact(&record).await;
        targets.push((record, artifact));
    }

    let checked = tokio::task::spawn_blocking(move || check_all(targets)).await;
    let checked = match checked {
        Ok(checked) => checked,
        Err(e) => {
            eprintln!("{} verification task failed: {}", "✗".red(), e);
            return 3;
        }
    };

    let mut code = 0;
    for (record, check) in &checked {
        let label = format!("{} {}", record.identifier.bold(), record.version.dimmed());
        match check {
            Check::Ok => println!("{} {}", "✓".green(), label),
            Check::Mismatch(err) => {
                println!("{} {}: {}", "✗".red(), label, err);
                code = code.max(2);
            }
            Check::Missing => println!("{} {}: no retained artifact", "⚠".yellow(), label),
            Check::Unreadable(e) => {
                println!("{} {}: {}", "✗".red(), label, e);
                code = code.max(3);
            }
        }
    }
    code
}

fn check_all(targets: Vec<(InstalledRecord, Option<PathBuf>)>) -> Vec<(InstalledRecord, Check)> {
    targets
        .into_par_iter()
        .map(|(record, artifact)| {
            let check = match artifact {
                None => Check::Missing,
                Some(path) => match verify::verify_file_blocking(&path, &record.content_hash) {
                    Ok(Ok(())) => Check::Ok,
                    Ok(Err(mismatch)) => Check::Mismatch(mismatch),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Check::Missing,
                    Err(e) => Check::Unreadable(e.to_string()),
                },
            };
            (record, check)
        })
        .collect()
}
