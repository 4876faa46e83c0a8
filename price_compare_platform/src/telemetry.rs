//! Logging initialization driven by the `[logging]` settings section.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::settings::LoggingConfig;

/// Initialize logging based on configuration. `RUST_LOG` wins over the
/// configured level when set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let fmt_layer = if config.format == "json" {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    let subscriber = Registry::default().with(filter).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)?;
    tracing::info!("Logging initialized ({} format)", config.format);
    Ok(())
}
