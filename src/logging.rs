use std::fs::File;
use std::path::PathBuf;

use simplelog::{ConfigBuilder, LevelFilter, ThreadLogMode, WriteLogger};

pub const LOG_PATH_ENV: &str = "BOXMUX_LOG";
pub const LOG_LEVEL_ENV: &str = "BOXMUX_LOG_LEVEL";

#[derive(Debug)]
pub enum LoggingError {
    Open {
        path: PathBuf,
        error: std::io::Error,
    },
    Install(log::SetLoggerError),
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::Open { path, error } => {
                write!(f, "failed opening log file {}: {error}", path.display())
            }
            LoggingError::Install(error) => write!(f, "failed installing logger: {error}"),
        }
    }
}

impl std::error::Error for LoggingError {}

pub fn parse_level(raw: Option<&str>) -> LevelFilter {
    match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        Some("off") => LevelFilter::Off,
        Some("error") => LevelFilter::Error,
        Some("warn") | Some("warning") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Installs a file logger when `BOXMUX_LOG` names a path. The terminal is
/// owned by the UI, so nothing is ever logged to stdout or stderr.
pub fn init_from_env() -> Result<Option<PathBuf>, LoggingError> {
    let Some(path) = std::env::var_os(LOG_PATH_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
    else {
        return Ok(None);
    };
    let level = parse_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
    let file = File::create(&path).map_err(|error| LoggingError::Open {
        path: path.clone(),
        error,
    })?;
    let config = ConfigBuilder::new()
        .set_thread_level(LevelFilter::Error)
        .set_thread_mode(ThreadLogMode::Names)
        .set_target_level(LevelFilter::Error)
        .build();
    WriteLogger::init(level, config, file).map_err(LoggingError::Install)?;
    log::info!("logging to {} at {level}", path.display());
    Ok(Some(path))
}
