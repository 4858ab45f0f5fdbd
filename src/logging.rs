//! Tracing subscriber setup

use crate::config::LoggingConfig;
use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Expand a bare level with quieter defaults for the HTTP stack.
/// Full directive strings (containing `,` or `=`) pass through unchanged.
pub fn filter_directives(level: &str) -> String {
    let level = level.trim();
    if level.contains(',') || level.contains('=') {
        level.to_string()
    } else {
        format!("{},hyper=info,reqwest=info,rustls=warn", level)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| filter_directives(&config.level));
    let filter = EnvFilter::from_str(&directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_output {
        let json_layer = fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        subscriber.with(json_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer().with_target(false).compact();
        subscriber.with(fmt_layer).try_init()?;
    }

    tracing::debug!(
        "Logging initialized ({}, {})",
        directives,
        if config.json_output { "json" } else { "compact" }
    );
    Ok(())
}
