use anyhow::Context;
use syncerd::config::SyncerConfig;
use syncerd::registry::FileRegistry;
use syncerd::sync::orchestrator::SyncOrchestrator;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: syncerd [--once]");
        println!("  --once   Run a single pull and push cycle, then exit");
        return Ok(());
    }
    syncerd::logging::init("info")
        .map_err(|err| anyhow::anyhow!("failed to initialise logging: {err}"))?;

    let config = SyncerConfig::from_env()?;
    let registry = FileRegistry::open(&config.database_path())
        .await
        .with_context(|| format!("failed to open {}", config.database_path().display()))?;
    let orchestrator = SyncOrchestrator::from_config(&config, registry);

    if mode == CliMode::Once {
        let report = orchestrator.run_cycle().await?;
        for failure in report.failures() {
            warn!(
                vendor = %failure.vendor,
                phase = %failure.phase,
                error = failure.error.as_deref().unwrap_or_default(),
                "sync finished with errors"
            );
        }
        return Ok(());
    }

    info!(pid = std::process::id(), "syncerd running");
    orchestrator
        .run_daemon(config.daemon_interval, shutdown_signal())
        .await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "SIGTERM handler unavailable"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
    }
}
