//! Telemetry
//!
//! Provides structured logging and tracing for pipeline operations.
//! Features:
//! - Command execution spans with timing
//! - Processor status transition logging
//! - Configurable log levels via RUST_LOG or the `[logging]` config section
//! - JSON output for log shipping

use std::sync::Once;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Sanitize a string for safe log output by escaping control characters.
/// Names and metadata arrive from processors over the network and must not
/// be able to forge log lines.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0b' => out.push_str("\\v"),
            '\x0c' => out.push_str("\\f"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

/// Pick the filter directive: `RUST_LOG` wins over the configured filter.
pub fn resolve_filter(config: &LoggingConfig) -> String {
    match std::env::var("RUST_LOG") {
        Ok(filter) if !filter.trim().is_empty() => filter,
        _ => config.filter.clone(),
    }
}

/// Initialize the global tracing subscriber. Later calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    static INIT: Once = Once::new();

    let filter = resolve_filter(config);
    let json = config.json;

    INIT.call_once(|| {
        let filter_layer = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("warn"));

        if json {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init();
        } else {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_level(true)
                .compact()
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init();
        }
    });
}

/// Run a command future inside a `command.execute` span, logging duration
/// and outcome.
pub async fn track_command_execution<F, Fut, T, E>(command_name: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let safe_name = sanitize_for_log(command_name);
    let span = info_span!(
        "command.execute",
        command = safe_name.as_str(),
        duration_ms = tracing::field::Empty,
        success = tracing::field::Empty,
    );

    let outcome = async {
        info!("Starting command execution");
        f().await
    }
    .instrument(span.clone())
    .await;

    let duration = start.elapsed().as_millis() as u64;
    span.record("duration_ms", duration);
    match &outcome {
        Ok(_) => {
            span.record("success", true);
            span.in_scope(|| info!(duration_ms = duration, "Command execution completed"));
        }
        Err(e) => {
            span.record("success", false);
            let safe_err = sanitize_for_log(&e.to_string());
            span.in_scope(|| {
                error!(
                    duration_ms = duration,
                    error = safe_err.as_str(),
                    "Command execution failed"
                )
            });
        }
    }
    outcome
}

/// Log a processor status change.
pub fn record_status_transition(processor: &str, from: &str, to: &str) {
    info!(
        processor = sanitize_for_log(processor).as_str(),
        from = from,
        to = to,
        "Processor status transition"
    );
}

/// Initialize tracing for tests with a simple subscriber
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
