// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The [`Logger`] type.
//!
//! Each logger owns a private `tracing` dispatcher. Events never reach the
//! global subscriber, so a logger can be used next to whatever the
//! application installs with `tracing_subscriber::fmt().init()`.

use std::fmt;
use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{dispatcher, Dispatch};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

use crate::format::EventFormat;
use crate::{Level, LogFormat};

/// Exit status of the process after a fatal message.
pub const FATAL_EXIT_CODE: i32 = 1;

type Output = Box<dyn Write + Send>;

/// Settings shared between a [`Logger`] and its event formatter.
pub(crate) struct LoggerState {
    level: AtomicU8,
    full_path: AtomicBool,
    json: AtomicBool,
    output: Mutex<Output>,
}

impl LoggerState {
    fn new() -> Self {
        Self {
            level: AtomicU8::new(Level::Info as u8),
            full_path: AtomicBool::new(false),
            json: AtomicBool::new(false),
            output: Mutex::new(Box::new(io::stderr())),
        }
    }

    pub(crate) fn level(&self) -> Level {
        Level::from_repr(self.level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub(crate) fn full_path(&self) -> bool {
        self.full_path.load(Ordering::Relaxed)
    }

    pub(crate) fn format(&self) -> LogFormat {
        if self.json.load(Ordering::Relaxed) {
            LogFormat::Json
        } else {
            LogFormat::Plaintext
        }
    }

    fn output(&self) -> MutexGuard<'_, Output> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hands the formatter a locked handle to the current output.
struct SharedWriter(Arc<LoggerState>);

struct OutputGuard<'a>(MutexGuard<'a, Output>);

impl Write for OutputGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = OutputGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        OutputGuard(self.0.output())
    }
}

/// Leveled logger that annotates every line with its call site.
///
/// Cloning is cheap and clones share settings and output.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    state: Arc<LoggerState>,
}

impl Logger {
    /// A logger at [`Level::Info`] writing plaintext to stderr.
    pub fn new() -> Self {
        let state = Arc::new(LoggerState::new());
        let layer = tracing_subscriber::fmt::layer()
            .event_format(EventFormat::new(state.clone()))
            .with_writer(SharedWriter(state.clone()));
        let dispatch = Dispatch::new(tracing_subscriber::registry().with(layer));
        Self { dispatch, state }
    }

    pub fn set_level(&self, level: Level) {
        self.state.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> Level {
        self.state.level()
    }

    /// Whether a message at `level` would be written.
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level()
    }

    /// Send subsequent lines to `output`.
    pub fn set_output<W>(&self, output: W)
    where
        W: Write + Send + 'static,
    {
        *self.state.output() = Box::new(output);
    }

    /// Send subsequent lines back to stderr.
    pub fn reset_output(&self) {
        self.set_output(io::stderr());
    }

    /// Print the caller's file as compiled (`true`) or only its file name.
    pub fn set_full_path(&self, full_path: bool) {
        self.state.full_path.store(full_path, Ordering::Relaxed);
    }

    pub fn full_path(&self) -> bool {
        self.state.full_path()
    }

    pub fn set_format(&self, format: LogFormat) {
        self.state
            .json
            .store(format == LogFormat::Json, Ordering::Relaxed);
    }

    pub fn format(&self) -> LogFormat {
        self.state.format()
    }

    /// Write one line for a message logged at `file:line`.
    ///
    /// Messages below the configured level are dropped. A [`Level::Fatal`]
    /// message terminates the process; see [`Logger::fatal`].
    pub fn log(&self, level: Level, file: &str, line: u32, args: fmt::Arguments<'_>) {
        if level == Level::Fatal {
            self.fatal(file, line, args);
        }
        if self.enabled(level) {
            self.emit(level, file, line, args);
        }
    }

    /// Write the message, flush the output and exit with [`FATAL_EXIT_CODE`].
    pub fn fatal(&self, file: &str, line: u32, args: fmt::Arguments<'_>) -> ! {
        self.emit(Level::Fatal, file, line, args);
        if let Err(err) = self.state.output().flush() {
            eprintln!("failed to flush log output: {}", err);
        }
        process::exit(FATAL_EXIT_CODE)
    }

    fn emit(&self, level: Level, file: &str, line: u32, args: fmt::Arguments<'_>) {
        let severity = level.as_str();
        let line = u64::from(line);
        dispatcher::with_default(&self.dispatch, || match level {
            Level::Fatal | Level::Error => tracing::error!(
                severity,
                caller.file = file,
                caller.line = line,
                "{}",
                args
            ),
            Level::Warn => tracing::warn!(
                severity,
                caller.file = file,
                caller.line = line,
                "{}",
                args
            ),
            Level::Info => tracing::info!(
                severity,
                caller.file = file,
                caller.line = line,
                "{}",
                args
            ),
            Level::Debug => tracing::debug!(
                severity,
                caller.file = file,
                caller.line = line,
                "{}",
                args
            ),
        });
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level())
            .field("format", &self.format())
            .field("full_path", &self.full_path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use regex::Regex;

    use super::*;
    use crate::test_utils::CaptureBuffer;

    const MESSAGE_LINE: &str =
        r#"^time="[^"]+" level=(\w+) msg="hello=world lorem=ipsum number=42" file="logger.rs:[0-9]+"\n$"#;

    fn captured(logger: &Logger) -> CaptureBuffer {
        let buffer = CaptureBuffer::new();
        logger.set_output(buffer.clone());
        buffer
    }

    #[test]
    fn test_new_logger_defaults() {
        let logger = Logger::new();
        assert_eq!(logger.level(), Level::Info);
        assert_eq!(logger.format(), LogFormat::Plaintext);
        assert!(!logger.full_path());
    }

    #[test]
    fn test_each_level_writes_its_name() {
        let logger = Logger::new();
        logger.set_level(Level::Debug);
        let pattern = Regex::new(MESSAGE_LINE).unwrap();

        for level in [Level::Error, Level::Warn, Level::Info, Level::Debug] {
            let buffer = captured(&logger);
            logger.log(
                level,
                file!(),
                line!(),
                format_args!("hello={} lorem={} number={}", "world", "ipsum", 42),
            );
            let output = buffer.contents();
            let caps = pattern
                .captures(&output)
                .unwrap_or_else(|| panic!("unexpected line for {level}: {output:?}"));
            assert_eq!(&caps[1], level.to_string());
        }
    }

    #[test]
    fn test_messages_below_level_are_dropped() {
        let logger = Logger::new();
        let buffer = captured(&logger);
        logger.log(Level::Debug, file!(), line!(), format_args!("quiet"));
        assert_eq!(buffer.contents(), "");

        logger.set_level(Level::Error);
        logger.log(Level::Warn, file!(), line!(), format_args!("quiet"));
        assert_eq!(buffer.contents(), "");
        logger.log(Level::Error, file!(), line!(), format_args!("loud"));
        assert!(buffer.contents().contains(" msg=loud "));
    }

    #[test]
    fn test_full_path_keeps_compiled_path() {
        let logger = Logger::new();
        let buffer = captured(&logger);
        logger.set_full_path(true);
        logger.log(Level::Warn, "crates/ck-logging/src/logger.rs", 7, format_args!("x"));
        assert!(buffer
            .contents()
            .contains(r#"file="crates/ck-logging/src/logger.rs:7""#));

        let buffer = captured(&logger);
        logger.set_full_path(false);
        logger.log(Level::Warn, "crates/ck-logging/src/logger.rs", 7, format_args!("x"));
        assert!(buffer.contents().contains(r#"file="logger.rs:7""#));
    }

    #[test]
    fn test_message_is_quoted() {
        let logger = Logger::new();
        let buffer = captured(&logger);
        logger.log(Level::Info, "a.rs", 1, format_args!("say \"hi\""));
        assert!(buffer.contents().contains(r#"msg="say \"hi\"""#));
    }

    #[test]
    fn test_simple_and_empty_messages_are_bare() {
        let logger = Logger::new();
        let buffer = captured(&logger);
        logger.log(Level::Info, "a.rs", 1, format_args!("ready"));
        logger.log(Level::Info, "a.rs", 2, format_args!(""));
        let contents = buffer.contents();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2, "output: {contents:?}");
        assert!(lines[0].contains(r#" level=info msg=ready file="a.rs:1""#));
        assert!(lines[1].contains(r#" level=info msg= file="a.rs:2""#));
    }

    #[test]
    fn test_json_format() {
        let logger = Logger::new();
        let buffer = captured(&logger);
        logger.set_format(LogFormat::Json);
        logger.log(Level::Info, "src/a.rs", 3, format_args!("hello {}", 1));

        let value: serde_json::Value = serde_json::from_str(buffer.contents().trim()).unwrap();
        assert_eq!(value["level"], "info");
        assert_eq!(value["msg"], "hello 1");
        assert_eq!(value["file"], "a.rs:3");
        assert!(value["time"].is_string());
    }

    #[test]
    fn test_clones_share_settings() {
        let logger = Logger::new();
        let clone = logger.clone();
        clone.set_level(Level::Debug);
        assert_eq!(logger.level(), Level::Debug);
    }

    #[test]
    fn test_logger_ignores_global_subscriber() {
        let logger = Logger::new();
        let buffer = captured(&logger);
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        logger.log(Level::Info, "a.rs", 1, format_args!("still here"));
        assert!(buffer.contents().contains("still here"));
    }
}
