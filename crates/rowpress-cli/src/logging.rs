use anyhow::{Context, Result};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter; records from the `log` facade are forwarded into tracing.
pub fn init(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(false)));

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;
    LogTracer::init().context("failed to bridge log records")?;
    Ok(())
}
