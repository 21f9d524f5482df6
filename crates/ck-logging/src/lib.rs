// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Leveled logging for Common Kit test tools.
//!
//! Lines carry a timestamp, the level, the message and the file and line of
//! the call:
//!
//! ```text
//! time="2025-01-02T03:04:05+00:00" level=warning msg="disk almost full" file="main.rs:42"
//! ```
//!
//! The crate keeps one process-wide [`Logger`] behind [`logger()`] and the
//! [`debugf!`], [`infof!`], [`warnf!`], [`errorf!`] and [`fatalf!`] macros.
//! Separate [`Logger`] values can be created for tests or embedding.

mod format;
pub mod logger;
pub mod logging_config;

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use logger::{Logger, FATAL_EXIT_CODE};
pub use logging_config::LoggingConfig;

// Re-export clap for convenience when using CliLoggingArgs
pub use clap;

/// Severity of a log message, most severe first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Level {
    /// Logged, then the process exits with status 1
    Fatal = 1,
    /// Error conditions
    Error,
    /// Errors and warnings
    #[value(name = "warning", alias = "warn")]
    #[serde(rename = "warning", alias = "warn")]
    Warn,
    /// Errors, warnings, and informational messages
    #[default]
    Info,
    /// All above plus debug information
    Debug,
}

impl Level {
    /// Every level, most severe first.
    pub const ALL: [Level; 5] = [
        Level::Fatal,
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Fatal => "fatal",
            Level::Error => "error",
            Level::Warn => "warning",
            Level::Info => "info",
            Level::Debug => "debug",
        }
    }

    pub(crate) fn from_repr(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|level| *level as u8 == value)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fatal" => Ok(Level::Fatal),
            "error" => Ok(Level::Error),
            "warn" | "warning" => Ok(Level::Warn),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `key=value` text lines
    #[default]
    Plaintext,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoggingError {
    #[error("invalid log level: {0}. Use fatal, error, warning, info or debug")]
    InvalidLevel(String),

    #[error("invalid log format: {0}. Use 'plaintext' or 'json'")]
    InvalidFormat(String),
}

/// Standardized CLI logging arguments for clap integration
///
/// Use with `#[command(flatten)]` so every tool exposes the same flags.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    /// Log verbosity level
    #[arg(long, value_enum, help = "Log verbosity level (default: info)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<Level>,

    /// Log output format
    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    /// Append log lines to this file instead of stderr
    #[arg(long, help = "Append log lines to this file instead of stderr")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Print the caller's path as compiled
    #[arg(long, help = "Print the full source path of each call site")]
    #[serde(default)]
    pub log_full_path: bool,
}

impl CliLoggingArgs {
    /// Apply the parsed arguments to the global logger.
    ///
    /// # Examples
    /// ```rust
    /// use ck_logging::CliLoggingArgs;
    /// use ck_logging::clap::Parser;
    ///
    /// #[derive(Parser)]
    /// struct Args {
    ///     #[command(flatten)]
    ///     logging: CliLoggingArgs,
    /// }
    ///
    /// fn main() -> anyhow::Result<()> {
    ///     let args = Args::parse_from(["tool", "--log-level", "debug"]);
    ///     args.logging.init()?;
    ///     ck_logging::debugf!("ready");
    ///     Ok(())
    /// }
    /// ```
    pub fn init(&self) -> anyhow::Result<()> {
        self.apply(logger())
    }

    /// Apply the parsed arguments to `logger`. Unset options are left alone.
    pub fn apply(&self, logger: &Logger) -> anyhow::Result<()> {
        if let Some(level) = self.log_level {
            logger.set_level(level);
        }
        if let Some(format) = self.log_format {
            logger.set_format(format);
        }
        if self.log_full_path {
            logger.set_full_path(true);
        }
        if let Some(path) = &self.log_file {
            // Create parent directory if it doesn't exist
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            logger.set_output(file);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.log_level.is_none()
            && self.log_format.is_none()
            && self.log_file.is_none()
            && !self.log_full_path
    }
}

/// The process-wide logger used by the logging macros.
pub fn logger() -> &'static Logger {
    static LOGGER: OnceLock<Logger> = OnceLock::new();
    LOGGER.get_or_init(Logger::new)
}

pub fn set_level(level: Level) {
    logger().set_level(level);
}

pub fn level() -> Level {
    logger().level()
}

pub fn set_output<W>(output: W)
where
    W: Write + Send + 'static,
{
    logger().set_output(output);
}

pub fn reset_output() {
    logger().reset_output();
}

pub fn set_full_path(full_path: bool) {
    logger().set_full_path(full_path);
}

pub fn set_format(format: LogFormat) {
    logger().set_format(format);
}

#[doc(hidden)]
#[macro_export]
macro_rules! __ck_log {
    (logger: $logger:expr, $level:expr, $($arg:tt)+) => {
        $logger.log($level, ::std::file!(), ::std::line!(), ::std::format_args!($($arg)+))
    };
    ($level:expr, $($arg:tt)+) => {
        $crate::__ck_log!(logger: $crate::logger(), $level, $($arg)+)
    };
}

/// Log at [`Level::Debug`]. Pass `logger: <expr>,` first to use a specific
/// [`Logger`] instead of the global one.
#[macro_export]
macro_rules! debugf {
    (logger: $logger:expr, $($arg:tt)+) => {
        $crate::__ck_log!(logger: $logger, $crate::Level::Debug, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__ck_log!($crate::Level::Debug, $($arg)+)
    };
}

/// Log at [`Level::Info`].
#[macro_export]
macro_rules! infof {
    (logger: $logger:expr, $($arg:tt)+) => {
        $crate::__ck_log!(logger: $logger, $crate::Level::Info, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__ck_log!($crate::Level::Info, $($arg)+)
    };
}

/// Log at [`Level::Warn`].
#[macro_export]
macro_rules! warnf {
    (logger: $logger:expr, $($arg:tt)+) => {
        $crate::__ck_log!(logger: $logger, $crate::Level::Warn, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__ck_log!($crate::Level::Warn, $($arg)+)
    };
}

/// Log at [`Level::Error`].
#[macro_export]
macro_rules! errorf {
    (logger: $logger:expr, $($arg:tt)+) => {
        $crate::__ck_log!(logger: $logger, $crate::Level::Error, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__ck_log!($crate::Level::Error, $($arg)+)
    };
}

/// Log at [`Level::Fatal`] and exit the process with status 1.
#[macro_export]
macro_rules! fatalf {
    (logger: $logger:expr, $($arg:tt)+) => {
        $logger.fatal(::std::file!(), ::std::line!(), ::std::format_args!($($arg)+))
    };
    ($($arg:tt)+) => {
        $crate::logger().fatal(::std::file!(), ::std::line!(), ::std::format_args!($($arg)+))
    };
}

/// Test utilities for working with log output
pub mod test_utils {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex, PoisonError};

    /// In-memory log output that can be read back after logging.
    #[derive(Clone, Debug, Default)]
    pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

    impl CaptureBuffer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Everything written so far, lossily decoded as UTF-8.
        pub fn contents(&self) -> String {
            let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl Write for CaptureBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::test_utils::CaptureBuffer;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        logging: CliLoggingArgs,
    }

    #[test]
    fn test_levels_are_ordered_by_severity() {
        assert!(Level::Fatal < Level::Error);
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        let mut sorted = Level::ALL;
        sorted.sort();
        assert_eq!(sorted, Level::ALL);
    }

    #[test]
    fn test_level_display_and_parse() {
        for level in Level::ALL {
            assert_eq!(level.to_string().parse::<Level>().unwrap(), level);
            assert_eq!(Level::from_repr(level as u8), Some(level));
        }
        assert_eq!(Level::Warn.to_string(), "warning");
        assert_eq!("warn".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("DEBUG".parse::<Level>().unwrap(), Level::Debug);
        assert_eq!(
            "trace".parse::<Level>(),
            Err(LoggingError::InvalidLevel("trace".to_string()))
        );
        assert_eq!(Level::from_repr(0), None);
    }

    #[test]
    fn test_level_serde_names() {
        assert_eq!(serde_json::to_string(&Level::Warn).unwrap(), r#""warning""#);
        assert_eq!(serde_json::from_str::<Level>(r#""warn""#).unwrap(), Level::Warn);
        assert_eq!(serde_json::from_str::<Level>(r#""fatal""#).unwrap(), Level::Fatal);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "plaintext");
    }

    #[test]
    fn test_cli_logging_args_parse() {
        let args = TestArgs::parse_from([
            "tool",
            "--log-level",
            "warn",
            "--log-format",
            "json",
            "--log-full-path",
        ]);
        assert_eq!(args.logging.log_level, Some(Level::Warn));
        assert_eq!(args.logging.log_format, Some(LogFormat::Json));
        assert!(args.logging.log_full_path);
        assert!(!args.logging.is_empty());

        let args = TestArgs::parse_from(["tool"]);
        assert!(args.logging.is_empty());
    }

    #[test]
    fn test_cli_logging_args_apply() {
        let logger = Logger::new();
        let args = CliLoggingArgs {
            log_level: Some(Level::Debug),
            log_full_path: true,
            ..Default::default()
        };
        args.apply(&logger).unwrap();
        assert_eq!(logger.level(), Level::Debug);
        assert!(logger.full_path());
        assert_eq!(logger.format(), LogFormat::Plaintext);
    }

    #[test]
    fn test_cli_logging_args_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("tool.log");
        let logger = Logger::new();
        let args = CliLoggingArgs {
            log_file: Some(path.clone()),
            ..Default::default()
        };
        args.apply(&logger).unwrap();
        infof!(logger: logger, "written to {}", "file");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains(r#"level=info msg="written to file" file="lib.rs:"#));
    }

    #[test]
    fn test_macros_with_explicit_logger() {
        let logger = Logger::new();
        let buffer = CaptureBuffer::new();
        logger.set_output(buffer.clone());
        logger.set_level(Level::Debug);

        debugf!(logger: logger, "d={}", 1);
        infof!(logger: logger, "i={}", 2);
        warnf!(logger: logger, "w={}", 3);
        errorf!(logger: logger, "e={}", 4);

        let output = buffer.contents();
        let levels: Vec<_> = output
            .lines()
            .map(|line| line.split_whitespace().nth(1).unwrap_or_default())
            .collect();
        assert_eq!(
            levels,
            ["level=debug", "level=info", "level=warning", "level=error"]
        );
        assert!(output.contains(r#"msg="w=3""#));
    }
}
