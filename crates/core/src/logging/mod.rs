//! Tracing setup shared by the server and the queue runner.
//!
//! Two sinks: the console (stderr) and a daily-rolling file under
//! `<data_dir>/logs`. Both go through [`RedactingMakeWriter`] so session
//! cookies never reach disk or the terminal.

mod crash;
mod redact;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub use crash::{install_crash_hook, CrashHook};
pub use redact::{redact_secrets, RedactingMakeWriter, RedactingWriter, REDACTED};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
pub const LOG_RETENTION_DAYS: usize = 14;

/// Chatty HTTP plumbing, quieted unless the user picked a filter explicitly.
pub const NOISY_TARGETS: [&str; 5] = ["hyper", "hyper_util", "h2", "reqwest", "tower_http"];

/// Kept at debug in the file sink even when the console quiets them.
const FILE_DEBUG_TARGETS: [&str; 2] = ["tower_http", "bulkgen_core::generation"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeLogMode {
    /// The HTTP service with its background worker.
    #[default]
    Server,
    /// The command-line queue runner talking to a remote server.
    Queue,
}

impl RuntimeLogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Queue => "queue",
        }
    }

    /// Queue runs get their own file so a local server and a runner sharing
    /// a data directory don't interleave.
    fn file_prefix(self) -> &'static str {
        match self {
            Self::Server => "bulkgen",
            Self::Queue => "bulkgen-queue",
        }
    }
}

/// Where the effective filter came from, highest precedence first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    Cli(String),
    Verbose(u8),
    Env(String),
    Default,
}

impl FilterSource {
    pub fn pick(cli: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        match (cli, verbose, rust_log) {
            (Some(filter), _, _) => Self::Cli(filter.to_string()),
            (None, v, _) if v > 0 => Self::Verbose(v),
            (None, _, Some(filter)) if !filter.trim().is_empty() => Self::Env(filter.to_string()),
            _ => Self::Default,
        }
    }

    /// `-v` and `--log-filter` mean the user wants to see everything they
    /// asked for, hyper included.
    fn is_explicit(&self) -> bool {
        matches!(self, Self::Cli(_) | Self::Verbose(_))
    }

    fn directives(&self) -> &str {
        match self {
            Self::Cli(filter) | Self::Env(filter) => filter,
            Self::Verbose(1) => "debug",
            Self::Verbose(_) => "trace",
            Self::Default => DEFAULT_LOG_FILTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    pub fn from_source(source: &FilterSource) -> Self {
        let user = source.directives();
        if source.is_explicit() {
            return Self {
                console: user.to_string(),
                file: user.to_string(),
            };
        }

        let console_noise = NOISY_TARGETS.iter().map(|target| format!("{target}=warn"));
        let file_noise = NOISY_TARGETS
            .iter()
            .filter(|target| !FILE_DEBUG_TARGETS.contains(*target))
            .map(|target| format!("{target}=warn"))
            .chain(FILE_DEBUG_TARGETS.iter().map(|target| format!("{target}=debug")));

        Self {
            console: console_noise.chain([user.to_string()]).collect::<Vec<_>>().join(","),
            file: file_noise.chain([user.to_string()]).collect::<Vec<_>>().join(","),
        }
    }
}

/// A ready rolling appender plus the directory it writes into.
#[derive(Debug)]
pub struct FileSink {
    pub dir: PathBuf,
    pub appender: RollingFileAppender,
}

/// Why a log or crash sink could not be set up. Callers degrade to
/// console-only output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkUnavailable {
    pub attempted: Option<PathBuf>,
    pub reason: String,
}

impl fmt::Display for SinkUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attempted {
            Some(path) => write!(f, "{} ({})", self.reason, path.display()),
            None => f.write_str(&self.reason),
        }
    }
}

impl std::error::Error for SinkUnavailable {}

pub fn open_file_sink(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
) -> Result<FileSink, SinkUnavailable> {
    let data_dir = data_dir.ok_or_else(|| SinkUnavailable {
        attempted: None,
        reason: "no data directory configured".to_string(),
    })?;
    let dir = data_dir.join(LOG_DIR_NAME);
    let unavailable = |reason: String| SinkUnavailable {
        attempted: Some(dir.clone()),
        reason,
    };

    fs::create_dir_all(&dir)
        .map_err(|err| unavailable(format!("failed to create log directory: {err}")))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(mode.file_prefix())
        .filename_suffix("log")
        .max_log_files(LOG_RETENTION_DAYS)
        .build(&dir)
        .map_err(|err| unavailable(format!("failed to open rolling log file: {err}")))?;

    Ok(FileSink { dir, appender })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_is_cli_then_verbose_then_env() {
        assert_eq!(
            FilterSource::pick(Some("bulkgen_core=trace"), 2, Some("warn")),
            FilterSource::Cli("bulkgen_core=trace".into())
        );
        assert_eq!(FilterSource::pick(None, 1, Some("warn")), FilterSource::Verbose(1));
        assert_eq!(
            FilterSource::pick(None, 0, Some("warn")),
            FilterSource::Env("warn".into())
        );
        assert_eq!(FilterSource::pick(None, 0, Some("  ")), FilterSource::Default);
        assert_eq!(FilterSource::pick(None, 0, None), FilterSource::Default);
    }

    #[test]
    fn explicit_sources_skip_noise_targets() {
        let filters = LogFilters::from_source(&FilterSource::Verbose(3));
        assert_eq!(filters.console, "trace");
        assert_eq!(filters.file, "trace");

        let filters = LogFilters::from_source(&FilterSource::Cli("bulkgen_core=debug".into()));
        assert_eq!(filters.file, "bulkgen_core=debug");
    }

    #[test]
    fn implicit_sources_quiet_http_and_keep_file_debug_targets() {
        let filters = LogFilters::from_source(&FilterSource::Env("warn,bulkgen_core=debug".into()));
        assert_eq!(
            filters.console,
            "hyper=warn,hyper_util=warn,h2=warn,reqwest=warn,tower_http=warn,warn,bulkgen_core=debug"
        );
        assert_eq!(
            filters.file,
            "hyper=warn,hyper_util=warn,h2=warn,reqwest=warn,tower_http=debug,bulkgen_core::generation=debug,warn,bulkgen_core=debug"
        );
    }

    #[test]
    fn file_sink_lives_under_data_dir() {
        let data_dir = tempfile::tempdir().unwrap();
        let sink = open_file_sink(RuntimeLogMode::Server, Some(data_dir.path())).unwrap();
        assert_eq!(sink.dir, data_dir.path().join(LOG_DIR_NAME));
        assert!(sink.dir.is_dir());
    }

    #[test]
    fn file_sink_reports_why_it_is_unavailable() {
        let err = open_file_sink(RuntimeLogMode::Queue, None).unwrap_err();
        assert!(err.attempted.is_none());

        let blocker = tempfile::NamedTempFile::new().unwrap();
        let err = open_file_sink(RuntimeLogMode::Queue, Some(blocker.path())).unwrap_err();
        assert_eq!(err.attempted, Some(blocker.path().join(LOG_DIR_NAME)));
        assert!(err.reason.starts_with("failed to create log directory"));
        assert!(err.to_string().contains(LOG_DIR_NAME));
    }
}
