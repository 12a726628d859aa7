//! Log initialization for the volcap daemons.
//!
//! A capture rig spans several hosts whose logs are read side by side when
//! debugging shutter sync, so timestamps are always UTC RFC 3339 rather
//! than host-local time. The filter honors `VOLCAP_LOG` first, then
//! `RUST_LOG`, and falls back to `info`: a headless capture daemon that
//! logs nothing is indistinguishable from one that hung.

use std::path::{Path, PathBuf};

use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{self, time::UtcTime},
    layer::SubscriberExt,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not create log file: {source}")]
    LogFile {
        #[from]
        source: std::io::Error,
    },
    #[error("a global logger is already installed")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Keeps logging alive for the life of the process; dropping it marks the
/// end of the run in the log file.
pub struct LogGuard {
    log_file: Option<PathBuf>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.log_file {
            tracing::debug!("closing log file \"{}\"", path.display());
        }
    }
}

fn volcap_filter() -> EnvFilter {
    if let Ok(directives) = std::env::var("VOLCAP_LOG") {
        return EnvFilter::new(directives);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console-only logging; cannot fail unless a logger is already installed,
/// in which case there is nothing sensible to do but stop.
pub fn init() -> LogGuard {
    start(None, false).expect("global logger already installed")
}

/// Start logging to an optional file and the console.
///
/// The file layer carries source locations and targets for post-mortem
/// digging; the console stays terse for operators watching a rig.
pub fn start(log_file: Option<&Path>, disable_console: bool) -> Result<LogGuard> {
    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(
                fmt::layer()
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = if disable_console {
        None
    } else {
        Some(
            fmt::layer()
                .with_timer(UtcTime::rfc_3339())
                .with_ansi(!cfg!(windows))
                .with_target(false),
        )
    };

    let subscriber = tracing_subscriber::registry()
        .with(volcap_filter())
        .with(file_layer)
        .with(console_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = log_file {
        tracing::debug!("logging to file \"{}\"", path.display());
    }

    Ok(LogGuard {
        log_file: log_file.map(Path::to_path_buf),
    })
}
