//! Tracing subscriber setup for the CLI.

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable consulted when no filter is passed explicitly.
pub const LOG_ENV: &str = "BINDHOST_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Pick the filter directive: explicit flag, then [`LOG_ENV`], then `info`.
pub fn filter_directive(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_ENV).ok())
        .filter(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// Parse the chosen directive. A malformed filter is an error rather than a
/// silent fallback.
pub fn build_filter(explicit: Option<&str>) -> Result<EnvFilter> {
    let directive = filter_directive(explicit);
    EnvFilter::try_new(&directive).with_context(|| format!("Invalid log filter '{directive}'"))
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// machine-readable.
pub fn init_tracing(explicit: Option<&str>, format: LogFormat) -> Result<()> {
    let registry = tracing_subscriber::registry().with(build_filter(explicit)?);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr).flatten_event(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr).with_target(false))
            .try_init(),
    }
    .context("Failed to initialize tracing subscriber")
}
