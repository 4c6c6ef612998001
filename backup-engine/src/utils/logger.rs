//! Logging configuration using tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}

/// `level` for the engine, warnings only for everything else. Unknown
/// levels fall back to info.
fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("warn,backup_engine={}", level))
        .unwrap_or_else(|_| EnvFilter::new("warn,backup_engine=info"))
}
