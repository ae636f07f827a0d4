//! Structured logging for the Stratos server.
//!
//! Installs a `tracing` subscriber with a human-readable console layer and, when
//! a log directory is configured, a JSON file layer for later analysis. The
//! filter comes from `RUST_LOG` when set, otherwise from the config.

use std::path::Path;

use stratos_config::LogConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config provides one.
pub const DEFAULT_FILTER: &str = "info";

/// Name of the JSON log file written under `log_dir`.
pub const LOG_FILE_NAME: &str = "stratos.log";

/// Initialize the global tracing subscriber.
///
/// Sets up:
/// - Console output with uptime timestamps, targets and levels
/// - JSON file logging into `log_dir/stratos.log` (optional)
/// - Environment-based filtering (respects RUST_LOG)
///
/// # Examples
///
/// ```no_run
/// use stratos_config::LogConfig;
/// use stratos_log::init_logging;
///
/// init_logging(&LogConfig::default());
/// ```
pub fn init_logging(config: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));
    let filter = env_filter.to_string();

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let file_layer = config
        .log_dir
        .as_deref()
        .and_then(open_log_file)
        .map(|log_file| {
            fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .with_target(true)
                .with_timer(fmt::time::uptime())
                .json()
        });
    let to_file = file_layer.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!(%filter, to_file, "Logging initialized");
}

/// The filter directive configured in `config`, or [`DEFAULT_FILTER`].
pub fn filter_directive(config: &LogConfig) -> &str {
    let level = config.log_level.trim();
    if level.is_empty() { DEFAULT_FILTER } else { level }
}

fn open_log_file(log_dir: &Path) -> Option<std::fs::File> {
    std::fs::create_dir_all(log_dir).ok()?;
    std::fs::File::create(log_dir.join(LOG_FILE_NAME)).ok()
}
