//! Tracing bootstrap with a reloadable level filter.

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, Registry};

/// Handle for changing the log level after initialization.
#[derive(Clone)]
pub struct LogHandle {
    pub(crate) reload: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Swap the active filter for `level` (an `EnvFilter` directive such
    /// as `info` or `claude_api_server=debug`).
    pub fn set_level(&self, level: &str) {
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if self.reload.reload(filter).is_ok() {
                    tracing::info!("Log level changed to {}", level);
                }
            }
            Err(err) => {
                tracing::warn!("Ignoring invalid log level {:?}: {}", level, err);
            }
        }
    }
}

/// Initialize the global subscriber: stderr output, optional plain-text
/// file output, and a reloadable level filter.
pub fn init(level: &str, log_file: Option<&Path>) -> anyhow::Result<LogHandle> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(LogHandle { reload: handle })
}
