// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Event formatting for [`crate::Logger`].
//!
//! Plaintext lines follow the logfmt shape:
//!
//! ```text
//! time="2025-01-02T03:04:05+00:00" level=info msg="hello=world" file="main.rs:12"
//! time="2025-01-02T03:04:05+00:00" level=info msg=ready file="main.rs:13"
//! ```
//!
//! A value is quoted only when it holds a character outside
//! `A-Za-z0-9-._/@^+`. Empty values are written bare.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::logger::LoggerState;
use crate::LogFormat;

pub(crate) const SEVERITY_FIELD: &str = "severity";
pub(crate) const FILE_FIELD: &str = "caller.file";
pub(crate) const LINE_FIELD: &str = "caller.line";

/// Formats the events emitted by [`crate::Logger::log`].
pub(crate) struct EventFormat {
    state: Arc<LoggerState>,
}

impl EventFormat {
    pub(crate) fn new(state: Arc<LoggerState>) -> Self {
        Self { state }
    }
}

impl<S, N> FormatEvent<S, N> for EventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut record = EventRecord::default();
        event.record(&mut record);

        let file = if self.state.full_path() {
            record.file.as_str()
        } else {
            short_file(&record.file)
        };
        let time = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        let caller = format!("{}:{}", file, record.line);

        match self.state.format() {
            LogFormat::Plaintext => writeln!(
                writer,
                "time={} level={} msg={} file={}",
                LogfmtValue(&time),
                LogfmtValue(&record.severity),
                LogfmtValue(&record.message),
                LogfmtValue(&caller)
            ),
            LogFormat::Json => {
                let line = serde_json::json!({
                    "time": time,
                    "level": record.severity,
                    "msg": record.message,
                    "file": caller,
                });
                writeln!(writer, "{}", line)
            }
        }
    }
}

/// A logfmt value, quoted and escaped only when it needs to be.
struct LogfmtValue<'a>(&'a str);

impl LogfmtValue<'_> {
    fn needs_quoting(&self) -> bool {
        self.0.chars().any(|c| {
            !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '/' | '@' | '^' | '+'))
        })
    }
}

impl fmt::Display for LogfmtValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.needs_quoting() {
            write!(f, "{:?}", self.0)
        } else {
            f.write_str(self.0)
        }
    }
}

fn short_file(file: &str) -> &str {
    Path::new(file)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(file)
}

/// Fields of one logger event.
#[derive(Default)]
struct EventRecord {
    message: String,
    severity: String,
    file: String,
    line: u64,
}

impl Visit for EventRecord {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            SEVERITY_FIELD => self.severity = value.to_string(),
            FILE_FIELD => self.file = value.to_string(),
            "message" => self.message = value.to_string(),
            _ => {}
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == LINE_FIELD {
            self.line = value;
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            SEVERITY_FIELD => self.severity = format!("{:?}", value),
            _ => {}
        }
    }
}
