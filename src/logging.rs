//! Logging initialization
//!
//! `RUST_LOG` takes precedence over the configured `LOG_LEVEL`. With
//! `LOG_JSON=true` every event is written as one JSON object per line.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Settings;

pub fn init_logging(settings: &Settings) -> anyhow::Result<()> {
    let env_filter = build_env_filter(&settings.log_level);
    let registry = tracing_subscriber::registry().with(env_filter);

    if settings.log_json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()?;
    }

    tracing::info!(
        level = %settings.log_level,
        json = settings.log_json,
        "Logging initialized"
    );
    Ok(())
}

fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Keep dependency chatter down unless explicitly requested.
        EnvFilter::new(format!(
            "{level},actix_server=warn,hyper=warn,reqwest=warn,diesel_migrations=info"
        ))
    })
}
