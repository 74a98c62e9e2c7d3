//! Structured logging setup.
//!
//! Uses `tracing` with two sinks: a human-readable console layer and a
//! plain-text session log file under the application log directory. The file
//! of the previous session is rotated away before the new one opens, keeping
//! the last five sessions on disk.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::error::Result;
use crate::paths;

const LOG_STEM: &str = "labhost";

/// Initializes tracing for the host process.
///
/// `debug` lowers the default level from `info` to `debug`; the `RUST_LOG`
/// environment variable still takes precedence for fine-grained filtering.
/// Safe to call more than once; later calls are ignored, which keeps tests
/// that each set up a host from fighting over the global dispatcher.
pub fn init(debug: bool, log_dir: &Path) -> Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));
    let file_filter = EnvFilter::new(level.to_string().to_lowercase());

    paths::rotate_session_logs(log_dir, LOG_STEM)?;
    let log_file = File::create(log_dir.join(format!("{LOG_STEM}.log")))?;

    let console_layer = fmt::layer()
        .compact()
        .with_thread_names(true)
        .with_filter(console_filter);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(Arc::new(log_file))
        .with_filter(file_filter);

    let init_result = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if init_result.is_err() {
        tracing::debug!("tracing already initialized, keeping existing subscriber");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        init(true, dir.path()).unwrap();
        init(false, dir.path()).unwrap();
        assert!(dir.path().join("labhost.log").exists());
    }
}
