//! Logging bootstrap.
//!
//! Installs a `tracing` fmt subscriber that also captures `log` records from
//! the library crates. Output goes to the configured log file or stderr;
//! stdout belongs to the stdio transport.

use crate::config::{LogFormat, ServerConfig};

use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `RUST_LOG` wins over the configured level.
pub fn filter(level: &str) -> Result<EnvFilter, BoxError> {
    match EnvFilter::try_from_default_env() {
        Ok(f) => Ok(f),
        Err(_) => Ok(EnvFilter::try_new(level)?),
    }
}

pub fn init(config: &ServerConfig) -> Result<(), BoxError> {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(&config.log_level)?);
    let file = match &config.log_file {
        Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
        None => None,
    };
    match (config.log_format, file) {
        (LogFormat::Json, Some(f)) => builder.json().with_ansi(false).with_writer(Mutex::new(f)).try_init(),
        (LogFormat::Json, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (LogFormat::Text, Some(f)) => builder.with_ansi(false).with_writer(Mutex::new(f)).try_init(),
        (LogFormat::Text, None) => builder.with_writer(std::io::stderr).try_init(),
    }
}
