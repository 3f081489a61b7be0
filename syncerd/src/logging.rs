use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the process-wide subscriber. Logs go to stderr so command output on
/// stdout stays clean. `RUST_LOG` overrides `default_filter`.
pub fn init(default_filter: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter_layer =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
