//! # Observability
//!
//! Logging setup for services embedding the outbox publisher.
//!
//! Library crates only use `tracing` macros. The host binary calls
//! `observability::init()` once at startup to decide where those events go.
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "orders".into(),
//!         default_level: "debug".into(),
//!         json: true,
//!         ..Default::default()
//!     })
//!     .expect("logging");
//!
//!     tracing::info!("service started");
//! }
//! ```
//!
//! `RUST_LOG` always overrides `default_level`.

mod writer;

pub use writer::{AppendLogWriter, WriterFactory};

use std::io;
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, logged once at startup.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Append log lines to this file instead of stderr.
    pub log_path: Option<PathBuf>,

    /// Emit one JSON object per line instead of the compact text format.
    pub json: bool,

    /// Also emit compact logs to stderr when `log_path` is set.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            json: false,
            also_stderr: false,
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Initialize logging with default settings.
pub fn init(service_name: &str) -> io::Result<()> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize logging with custom configuration.
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);

    let writer = match &config.log_path {
        Some(path) => BoxMakeWriter::new(WriterFactory::new(AppendLogWriter::open(path)?)),
        None => BoxMakeWriter::new(io::stderr),
    };
    layers.push(format_layer(writer, config.json, config.log_path.is_none()));

    if config.log_path.is_some() && config.also_stderr {
        layers.push(format_layer(BoxMakeWriter::new(io::stderr), false, true));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::info!(
        service = %config.service_name,
        log_path = ?config.log_path,
        "observability initialized"
    );
    Ok(())
}

fn format_layer(writer: BoxMakeWriter, json: bool, ansi: bool) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(writer);

    if json {
        layer.json().with_ansi(false).boxed()
    } else {
        layer.compact().with_ansi(ansi).boxed()
    }
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};
