//! # Observability
//!
//! Logging setup shared by the workspace binaries.
//!
//! Binaries call [`init`] or [`init_with_config`] once at startup and use the
//! `tracing` macros everywhere else. Library crates never install a
//! subscriber themselves.
//!
//! Output:
//! - a compact human-readable stream on stderr
//! - optionally, one JSON object per event appended to a log file, suitable
//!   for `tail -f sender.jsonl | jq`
//!
//! The level filter comes from `RUST_LOG` when set, otherwise from
//! [`LogConfig::default_level`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "relp-sender".into(),
//!     default_level: "debug".into(),
//!     log_path: Some("/var/log/relp-sender.jsonl".into()),
//!     ..Default::default()
//! });
//! ```

mod file;
mod record;

pub use file::LogFile;
pub use record::{JsonLinesLayer, Record};

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, written into every JSON line.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// JSON-lines log file; no file output when `None`.
    pub log_path: Option<PathBuf>,

    /// Emit compact logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: true,
        }
    }
}

/// Initialize logging with default settings.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Does nothing if a global subscriber is already installed. A log file
/// that cannot be opened is reported on stderr and skipped.
pub fn init_with_config(config: LogConfig) {
    let file_layer = config.log_path.as_ref().and_then(|path| match LogFile::open(path) {
        Ok(file) => Some(
            JsonLinesLayer::new(config.service_name.clone(), file).with_filter(filter(&config)),
        ),
        Err(e) => {
            eprintln!("failed to open log file {}: {}", path.display(), e);
            None
        }
    });

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .with_filter(filter(&config))
    });

    let installed = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            service = %config.service_name,
            log_path = ?config.log_path,
            "observability initialized"
        );
    }
}

fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_level))
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, trace, warn};
