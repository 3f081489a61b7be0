//! `syncer`: track files and sync them with cloud storage.
//!
//! ```text
//! syncer auth | status | browse | pull | push | ls | start | stop
//! syncer add <remote-name> [local-path]
//! syncer rm <remote-name>
//! ```

mod process;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use syncerd::config::SyncerConfig;
use syncerd::registry::{FileRegistry, Status, Vendor};
use syncerd::repository::Repository;
use syncerd::sync::orchestrator::{SyncOrchestrator, SyncReport};

#[derive(Parser, Debug)]
#[command(
    name = "syncer",
    version,
    about = "Keep selected files in sync with cloud storage"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authorize access to Google Drive.
    Auth,
    /// Show daemon state, credentials and every tracked file.
    Status,
    /// List remote file names.
    Browse,
    /// Download tracked files changed remotely.
    Pull,
    /// Upload every tracked file.
    Push,
    /// List tracked files.
    Ls,
    /// Start tracking a remote file.
    Add {
        remote_name: String,
        /// Defaults to <sync dir>/google-drive/<remote name>.
        local_path: Option<PathBuf>,
    },
    /// Stop tracking a remote file.
    Rm { remote_name: String },
    /// Start the background daemon.
    Start,
    /// Stop the background daemon.
    Stop,
}

struct App {
    config: SyncerConfig,
    orchestrator: SyncOrchestrator,
}

impl App {
    async fn open() -> Result<Self> {
        let config = SyncerConfig::from_env()?;
        let registry = FileRegistry::open(&config.database_path())
            .await
            .with_context(|| format!("failed to open {}", config.database_path().display()))?;
        let orchestrator = SyncOrchestrator::from_config(&config, registry);
        Ok(Self {
            config,
            orchestrator,
        })
    }

    fn registry(&self) -> &FileRegistry {
        self.orchestrator.registry()
    }

    async fn auth(&self) -> Result<()> {
        for vendor in Vendor::ALL {
            let repo = self.repository(vendor)?;
            repo.authenticate()
                .await
                .with_context(|| format!("{vendor} authorization failed"))?;
            println!("{} {vendor}", "Authenticated with".green());
        }
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let pids = process::daemon_pids();
        if pids.is_empty() {
            println!("Daemon: {}", "stopped".yellow());
        } else {
            let list: Vec<String> = pids.iter().map(u32::to_string).collect();
            println!("Daemon: {} (pid {})", "running".green(), list.join(", "));
        }
        for vendor in Vendor::ALL {
            let state = match self.repository(vendor) {
                Ok(repo) if repo.is_authenticated() => "authenticated".green(),
                _ => "not authenticated".red(),
            };
            println!("{vendor}: {state}");
        }
        let files = self.registry().list().await?;
        if files.is_empty() {
            println!("No tracked files");
        }
        for file in files {
            let status = match file.status {
                Status::Synced => file.status.to_string().green(),
                Status::Error => file.status.to_string().red(),
            };
            println!("{} ({}): {status}", file.remote_name, file.vendor);
        }
        Ok(())
    }

    async fn browse(&self) -> Result<()> {
        for vendor in Vendor::ALL {
            let names = self
                .repository(vendor)?
                .list()
                .await
                .with_context(|| format!("failed to list {vendor}"))?;
            println!("{vendor}:");
            for name in names {
                println!(" - {name}");
            }
        }
        Ok(())
    }

    async fn ls(&self) -> Result<()> {
        for file in self.registry().list().await? {
            println!(
                "{} ({}) => {}",
                file.remote_name,
                file.vendor,
                file.local_path.display()
            );
        }
        Ok(())
    }

    async fn add(&self, remote_name: &str, local_path: Option<PathBuf>) -> Result<()> {
        let vendor = Vendor::GoogleDrive;
        let local_path = match local_path {
            Some(path) => std::path::absolute(&path)
                .with_context(|| format!("cannot resolve {}", path.display()))?,
            None => self.config.default_local_path(vendor, remote_name),
        };
        let mut file = self.registry().add(remote_name, &local_path, vendor).await?;

        let repo = self.repository(vendor)?;
        if repo.is_authenticated() {
            match repo.get_remote_id(remote_name).await {
                Ok(remote_id) => {
                    file.remote_id = remote_id;
                    self.registry().update(&mut file, None).await?;
                }
                Err(err) => eprintln!(
                    "{} {err}; it will be created on the next push",
                    "warning:".yellow()
                ),
            }
        }
        println!(
            "Tracking {} ({vendor}) => {}",
            file.remote_name,
            file.local_path.display()
        );
        Ok(())
    }

    async fn rm(&self, remote_name: &str) -> Result<()> {
        self.registry().remove(remote_name).await?;
        println!("Stopped tracking {remote_name}");
        Ok(())
    }

    fn repository(&self, vendor: Vendor) -> Result<Arc<dyn Repository>> {
        self.orchestrator
            .repository(vendor)
            .with_context(|| format!("no repository configured for {vendor}"))
    }
}

fn print_report(report: &SyncReport) {
    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!(
                "{} {} ({}): {}/{} synced",
                outcome.phase,
                outcome.vendor,
                "ok".green(),
                outcome.synced,
                outcome.files
            ),
            Some(message) => {
                println!(
                    "{} {} ({}): {}/{} synced",
                    outcome.phase,
                    outcome.vendor,
                    "failed".red(),
                    outcome.synced,
                    outcome.files
                );
                for line in message.lines() {
                    println!("  {line}");
                }
            }
        }
    }
    if report.outcomes.is_empty() {
        println!("No tracked files");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Start => return process::start_daemon(),
        Command::Stop => return process::stop_daemon(),
        _ => {}
    }

    syncerd::logging::init("warn")
        .map_err(|err| anyhow::anyhow!("failed to initialise logging: {err}"))?;
    let app = App::open().await?;
    match cli.command {
        Command::Auth => app.auth().await,
        Command::Status => app.status().await,
        Command::Browse => app.browse().await,
        Command::Pull => {
            print_report(&app.orchestrator.run_pull().await?);
            Ok(())
        }
        Command::Push => {
            print_report(&app.orchestrator.run_push().await?);
            Ok(())
        }
        Command::Ls => app.ls().await,
        Command::Add {
            remote_name,
            local_path,
        } => app.add(&remote_name, local_path).await,
        Command::Rm { remote_name } => app.rm(&remote_name).await,
        Command::Start | Command::Stop => Ok(()),
    }
}
