//! Structured logging using tracing.
//!
//! Engine crates only emit `tracing` events; the embedding process installs
//! the subscriber once through [`init_logging`].

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

use crate::MonitoringConfig;

/// Filter from `RUST_LOG`, falling back to the configured directives
pub fn build_filter(config: &MonitoringConfig) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .with_context(|| format!("Invalid log filter '{}'", config.log_filter)),
    }
}

/// Initialize structured logging as the global subscriber
pub fn init_logging(config: &MonitoringConfig) -> anyhow::Result<()> {
    let env_filter = build_filter(config)?;

    let json_layer = config.enable_json_logging.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_thread_ids(true)
            .with_file(config.with_file_location)
            .with_line_number(config.with_file_location)
    });
    let pretty_layer = (!config.enable_json_logging).then(|| {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(config.with_file_location)
            .with_line_number(config.with_file_location)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    info!(
        service_name = %config.service_name,
        log_format = if config.enable_json_logging { "json" } else { "pretty" },
        "Logging initialized"
    );

    Ok(())
}

/// Test writer subscriber; safe to call from every test
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_test_writer()
        .try_init();
}
