//! Structured logging setup.
//!
//! # Responsibilities
//! - Map the verbosity ladder onto a `tracing_subscriber::EnvFilter`
//! - Write to stderr, or to a file when a debug path is given
//! - Install the global subscriber exactly once
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level
//! - File output has ANSI colouring disabled

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Verbosity ladder, from quietest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Same as [`LogLevel::Standard`].
    #[default]
    Default,
    ErrorOnly,
    Standard,
    Elevated,
    Full,
    Debug,
    Trace,
    Verbose,
}

impl LogLevel {
    /// Filter directives for this level.
    pub fn directives(self) -> &'static str {
        match self {
            LogLevel::ErrorOnly => "error",
            LogLevel::Default | LogLevel::Standard => "info",
            LogLevel::Elevated => "info,ws_relay_proxy=debug",
            LogLevel::Full => "debug,hyper=info,h2=info",
            LogLevel::Debug => "debug,ws_relay_proxy=trace",
            LogLevel::Trace => "trace,hyper=debug,h2=debug",
            LogLevel::Verbose => "trace",
        }
    }
}

/// Options for [`init`].
#[derive(Debug, Clone, Default)]
pub struct LogInit {
    pub level: LogLevel,
    /// Write logs to this file instead of stderr.
    pub debug_file_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("global subscriber already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global tracing subscriber.
pub fn init(options: LogInit) -> Result<(), LogInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(options.level.directives()));

    match options.debug_file_path {
        Some(path) => {
            let file = File::create(&path).map_err(|source| LogInitError::File {
                path: path.clone(),
                source,
            })?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()?;
        }
    }

    Ok(())
}
