use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Full filter override, e.g. `notesync::channel=trace,warn`.
pub const FILTER_ENV: &str = "NOTESYNC_LOG_FILTER";

/// Crates whose events follow `--log-level`; everything else is capped at
/// `info`.
const OWN_TARGETS: &[&str] = &["notesync", "notesync_cli", "event_bus"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid NOTESYNC_LOG_FILTER `{filter}`: {reason}")]
    Filter { filter: String, reason: String },
    #[error("failed to install logger: {0}")]
    Install(String),
}

// Keeps the non-blocking writer flushing until the process exits.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber; stdout stays free for command output.
/// Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = build_filter(config.level, std::env::var(FILTER_ENV).ok().as_deref())?;
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

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn build_filter(level: LogLevel, custom: Option<&str>) -> Result<EnvFilter, InitError> {
    match custom.filter(|filter| !filter.trim().is_empty()) {
        Some(filter) => EnvFilter::try_new(filter).map_err(|err| InitError::Filter {
            filter: filter.to_owned(),
            reason: err.to_string(),
        }),
        None => Ok(EnvFilter::new(default_directives(level))),
    }
}

fn default_directives(level: LogLevel) -> String {
    let mut directives = level.min(LogLevel::Info).directive().to_owned();
    for target in OWN_TARGETS {
        directives.push_str(&format!(",{target}={}", level.directive()));
    }
    directives
}
