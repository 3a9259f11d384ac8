//! # Structured Logging Module
//!
//! Console logging for every process, plus optional JSON log files for
//! long-lived services, so that a recipe's path through several workers can
//! be reconstructed afterwards.

use chrono::Utc;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::constants::env;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging
///
/// `verbosity` is the number of `-v` flags; the `DLSTBX_VERBOSITY` counter is
/// added to it. `RUST_LOG` takes precedence over both when set.
pub fn init_structured_logging(verbosity: u8, log_directory: Option<&str>) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let level = log_level(total_verbosity(verbosity));
        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(filter());

        let file_layer = log_directory.and_then(|dir| {
            let log_dir = PathBuf::from(dir);
            if let Err(e) = std::fs::create_dir_all(&log_dir) {
                eprintln!("Cannot create log directory {}: {e}", log_dir.display());
                return None;
            }
            let log_filename = format!(
                "dlstbx.{}.{}.log",
                process::id(),
                Utc::now().format("%Y%m%d_%H%M%S")
            );
            let file_appender = tracing_appender::rolling::never(&log_dir, log_filename);
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            // The writer must outlive every span in the process.
            std::mem::forget(guard);
            Some(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(filter()),
            )
        });

        let subscriber = tracing_subscriber::registry().with(console).with(file_layer);
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::debug!(
            pid = process::id(),
            level = level,
            log_directory = ?log_directory,
            "Structured logging initialized"
        );
    });
}

/// Combine the command-line counter with the environment counter
fn total_verbosity(flags: u8) -> u8 {
    let from_env = std::env::var(env::VERBOSITY)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(0);
    flags.saturating_add(from_env)
}

fn log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Log the outcome of one message activation
pub fn log_message_outcome(
    service: &str,
    queue: &str,
    message_id: i64,
    outcome: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        service = %service,
        queue = %queue,
        message_id = message_id,
        outcome = %outcome,
        details = details,
        "MESSAGE_OUTCOME"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
