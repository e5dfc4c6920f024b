//! Tracing subscriber setup for the `sluice` binary.
//!
//! Events go to stderr, filtered by `SLUICE_DEBUG` (debug everything), else
//! `RUST_LOG`, else `warn`. When `SLUICE_LOG_DIR` names a directory, a second
//! layer appends plain-text events at `info` or above to `sluice.log` there.

use std::env;
use std::io;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, File, OpenOptions};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Enables debug output for every target when set to a truthy value.
pub const DEBUG_ENV: &str = "SLUICE_DEBUG";

/// Directory receiving the log file.
pub const LOG_DIR_ENV: &str = "SLUICE_LOG_DIR";

/// Name of the log file inside [`LOG_DIR_ENV`].
pub const LOG_FILE_NAME: &str = "sluice.log";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Raised when the log file cannot be opened for appending.
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        /// Log file path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Raised when a global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Logging choices read from the environment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogSettings {
    /// Debug output for every target.
    pub debug: bool,
    /// Value of `RUST_LOG`, when set.
    pub rust_log: Option<String>,
    /// Directory for the log file.
    pub log_dir: Option<Utf8PathBuf>,
}

impl LogSettings {
    /// Reads [`DEBUG_ENV`], `RUST_LOG`, and [`LOG_DIR_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            debug: env::var(DEBUG_ENV).is_ok_and(|raw| is_truthy(&raw)),
            rust_log: env::var(EnvFilter::DEFAULT_ENV)
                .ok()
                .filter(|raw| !raw.trim().is_empty()),
            log_dir: env::var(LOG_DIR_ENV)
                .ok()
                .filter(|raw| !raw.trim().is_empty())
                .map(Utf8PathBuf::from),
        }
    }

    /// Directive for the stderr layer.
    #[must_use]
    pub fn terminal_directive(&self) -> String {
        if self.debug {
            String::from("debug")
        } else {
            self.rust_log
                .clone()
                .unwrap_or_else(|| String::from("warn"))
        }
    }

    /// Directive for the file layer.
    #[must_use]
    pub const fn file_directive(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}

fn is_truthy(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

/// Opens `<dir>/sluice.log` for appending, creating the directory.
///
/// # Errors
///
/// Returns [`LoggingError::LogFile`] when the directory or file cannot be
/// created.
pub fn open_log_file(dir: &Utf8Path) -> Result<File, LoggingError> {
    let path = dir.join(LOG_FILE_NAME);
    let failed = |source: io::Error| LoggingError::LogFile {
        path: path.clone(),
        source,
    };
    Dir::create_ambient_dir_all(dir, ambient_authority()).map_err(failed)?;
    let handle = Dir::open_ambient_dir(dir, ambient_authority()).map_err(failed)?;
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    handle.open_with(LOG_FILE_NAME, &options).map_err(failed)
}

/// Installs the global subscriber described by `settings`.
///
/// # Errors
///
/// Returns [`LoggingError`] when the log file cannot be opened or a
/// subscriber is already installed.
pub fn init(settings: &LogSettings) -> Result<(), LoggingError> {
    let terminal_filter = EnvFilter::try_new(settings.terminal_directive())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let terminal_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(terminal_filter);

    let file_layer = match settings.log_dir.as_deref() {
        Some(dir) => {
            let file = open_log_file(dir)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new(settings.file_directive())),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::TempDir;

    #[rstest]
    #[case(true, None, "debug")]
    #[case(true, Some("info"), "debug")]
    #[case(false, Some("sluice=trace"), "sluice=trace")]
    #[case(false, None, "warn")]
    fn terminal_directive_prefers_debug_then_rust_log(
        #[case] debug: bool,
        #[case] rust_log: Option<&str>,
        #[case] expected: &str,
    ) {
        let settings = LogSettings {
            debug,
            rust_log: rust_log.map(str::to_owned),
            log_dir: None,
        };

        assert_eq!(settings.terminal_directive(), expected);
    }

    #[rstest]
    #[case("1", true)]
    #[case("yes", true)]
    #[case("0", false)]
    #[case("False", false)]
    #[case("", false)]
    fn debug_flag_values(#[case] raw: &str, #[case] expected: bool) {
        assert_eq!(is_truthy(raw), expected);
    }

    #[test]
    fn log_file_is_created_and_appended() {
        let tmp = TempDir::new().expect("tempdir");
        let dir = Utf8PathBuf::from_path_buf(tmp.path().join("logs"))
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));

        for line in ["first", "second"] {
            let mut file = open_log_file(&dir).expect("open log file");
            writeln!(file, "{line}").expect("write log line");
        }

        let contents = std::fs::read_to_string(dir.join(LOG_FILE_NAME)).expect("read log");
        assert_eq!(contents, "first\nsecond\n");
    }
}
