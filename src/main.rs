mod colors;
mod commands;

use casket::{ArchiveStager, CancelToken, Controller, FileLedger, HttpFetcher, Layout};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use indicatif::MultiProgress;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "casket")]
#[command(author, version, about = "Validate cask manifests and install them crash-safely", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Installation prefix [env: CASKET_PREFIX]
    #[arg(long, global = true, value_name = "DIR")]
    prefix: Option<PathBuf>,

    /// Directory applications are installed into [env: CASKET_APPDIR]
    #[arg(long, global = true, value_name = "DIR")]
    appdir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install casks from manifest files (.rb or .json)
    Install {
        /// Manifest paths
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },

    /// Upgrade installed casks to the given manifests
    Upgrade {
        /// Manifest paths
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },

    /// Uninstall casks
    Uninstall {
        /// Cask identifiers
        #[arg(required = true)]
        identifiers: Vec<String>,
    },

    /// List installed casks
    List {
        /// Re-hash retained artifacts against recorded digests
        #[arg(long)]
        verify: bool,
    },

    /// Reconcile the ledger with the files on disk after an interruption
    Repair {
        /// Cask identifier
        identifier: String,
    },

    /// Validate a manifest and show its details
    Info {
        /// Manifest path
        manifest: PathBuf,

        /// Print the normalized cask definition
        #[arg(long)]
        cask: bool,
    },

    /// Generate shell completion scripts
    Completions {
        shell: Shell,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "casket=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    colors::init_colors();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            3
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "casket", &mut std::io::stdout());
        return Ok(0);
    }

    let layout = Layout::detect(cli.prefix, cli.appdir);
    tracing::debug!(prefix = %layout.prefix.display(), appdir = %layout.appdir.display(), "layout");
    let ledger = Arc::new(FileLedger::new(layout.ledger_dir()));

    if let Commands::Info { manifest, cask } = &cli.command {
        return Ok(commands::info(manifest, ledger.as_ref(), *cask).await);
    }

    let progress = MultiProgress::new();
    let fetcher = HttpFetcher::new()?
        .with_cache(layout.cache_dir.clone())
        .with_progress(progress.clone());
    let controller = Controller::new(layout, ledger, Arc::new(fetcher), Arc::new(ArchiveStager))
        .with_reporter(commands::stage_reporter(&progress));

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} Interrupted, cleaning up...", "⚠".yellow());
            on_interrupt.cancel();
        }
    });

    let code = match cli.command {
        Commands::Install { manifests } => {
            commands::install(&controller, &manifests, false, &cancel).await
        }
        Commands::Upgrade { manifests } => {
            commands::install(&controller, &manifests, true, &cancel).await
        }
        Commands::Uninstall { identifiers } => {
            commands::uninstall(&controller, &identifiers, &cancel).await
        }
        Commands::List { verify } => commands::list(&controller, verify).await,
        Commands::Repair { identifier } => commands::repair(&controller, &identifier).await,
        Commands::Info { .. } | Commands::Completions { .. } => 0,
    };
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["casket", "list", "--verify", "--prefix", "/tmp/p", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.prefix, Some(PathBuf::from("/tmp/p")));
        assert!(matches!(cli.command, Commands::List { verify: true }));
    }

    #[test]
    fn test_install_requires_a_manifest() {
        assert!(Cli::try_parse_from(["casket", "install"]).is_err());
    }
}
