use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use crate::config::{LogFormat, LoggingConfig};

/// Filter directive for `-v` repetitions; `None` keeps the configured level.
fn verbosity_directive(verbose: u8) -> Option<&'static str> {
    match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Build the event filter. `RUST_LOG` wins, then `-v`, then the config level.
///
/// # Errors
/// Fails if the chosen directive does not parse.
pub fn build_env_filter(config: &LoggingConfig, verbose: u8) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = verbosity_directive(verbose).unwrap_or(config.level.as_str());
    EnvFilter::try_new(directive).with_context(|| format!("invalid log filter '{directive}'"))
}

/// Install the global subscriber on stderr.
///
/// `Auto` format resolves to JSON under the Lambda runtime so log lines are
/// parsed by `CloudWatch`, and to text otherwise.
///
/// # Errors
/// Fails on an invalid filter or if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig, verbose: u8, hosted: bool) -> Result<()> {
    let filter = build_env_filter(config, verbose)?;
    let json = match config.format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => hosted,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let installed = if json {
        builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init()
    } else {
        builder.with_ansi(!hosted).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;

    tracing::debug!(json, "logging initialized");
    Ok(())
}
