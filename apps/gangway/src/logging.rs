//! Subscriber setup for the binary.
//!
//! Everything outside the crate logs at `warn`. The crate's own modules log at
//! the level picked on the command line. `GANGWAY_TRACE_DEPS=1` lets the
//! WebRTC, HTTP and websocket stacks log at that level too, and
//! `GANGWAY_LOG_FILTER` replaces the computed directives entirely.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

const FILTER_ENV: &str = "GANGWAY_LOG_FILTER";
const DEPS_ENV: &str = "GANGWAY_TRACE_DEPS";

/// Modules that emit under their own `target`.
const CRATE_TARGETS: &[&str] = &[
    "gangway::session",
    "gangway::messenger",
    "gangway::control",
    "gangway::signaling",
    "gangway::transport::webrtc",
    "gangway::observer",
];

/// Stacks underneath the transport and signaling layers.
const DEPENDENCY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_data",
    "reqwest",
    "hyper",
    "tungstenite",
    "tokio_tungstenite",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("failed to install subscriber: {0}")]
    Install(#[from] TryInitError),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once it is installed, later calls return
/// `Ok` without touching it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match std::env::var(FILTER_ENV) {
        Ok(custom) => EnvFilter::try_new(custom)?,
        Err(_) => EnvFilter::try_new(directives(config.level, deps_requested()))?,
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish()
        .try_init()?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn deps_requested() -> bool {
    std::env::var(DEPS_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
}

/// Filter directives: `warn` by default, the crate's targets at `level`, and
/// dependency targets at `level` only when asked for.
fn directives(level: LogLevel, with_deps: bool) -> String {
    let level = LevelFilter::from(level).to_string().to_lowercase();
    let mut targets = CRATE_TARGETS.to_vec();
    if with_deps {
        targets.extend_from_slice(DEPENDENCY_TARGETS);
    }
    std::iter::once("warn".to_string())
        .chain(targets.iter().map(|target| format!("{target}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}
