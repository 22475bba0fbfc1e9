//! Tracing setup for the hub: an env filter over a console layer plus an
//! optional plain-text file layer under the configured log directory.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_FILE_NAME: &str = "pyrite-hub.log";

/// `--debug` beats `PYRITE_LOG_LEVEL`, which beats the `info` default.
/// [`init_logging`] lets `RUST_LOG` override everything but `--debug`.
pub fn default_directive(debug: bool, configured: Option<&str>) -> String {
    if debug {
        return "debug".to_string();
    }
    configured
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .unwrap_or("info")
        .to_string()
}

/// Opens (appending) the hub log inside `log_dir`. A blank directory means
/// console-only logging.
pub fn open_log_file(log_dir: &str) -> io::Result<Option<(PathBuf, File)>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, file)))
}

fn subscriber(filter: EnvFilter, file: Option<File>) -> impl tracing::Subscriber + Send + Sync {
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
}

/// Installs the global subscriber and returns the log file path, if any.
/// Does nothing when a subscriber is already installed.
pub fn init_logging(debug: bool, log_dir: &str) -> Option<PathBuf> {
    let configured = std::env::var("PYRITE_LOG_LEVEL").ok();
    let directive = default_directive(debug, configured.as_deref());
    let filter = if debug {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let (path, file, open_error) = match open_log_file(log_dir) {
        Ok(Some((path, file))) => (Some(path), Some(file), None),
        Ok(None) => (None, None, None),
        Err(err) => (None, None, Some(err)),
    };
    if subscriber(filter, file).try_init().is_err() {
        return None;
    }
    if let Some(err) = open_error {
        tracing::warn!(event = "log_file_error", log_dir = %log_dir, error = %err);
    }
    path
}
