// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the isolation harness and fixture staging.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors reported by an isolated run.
///
/// Every variant is returned alongside whatever output was captured, so a
/// test can still assert on stdout/stderr when the child failed.
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("could not resolve an enclosing test {offset} frames above the resolver")]
    Unresolved { offset: usize },

    #[error("failed to locate the current test executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("isolated child exited with status {code}")]
    Exit { code: i32 },

    #[error("isolated child terminated abnormally{}", describe_signal(.signal))]
    Terminated { signal: Option<i32> },

    #[error("filter `{filter}` did not select any test in the current executable")]
    TestNotRun { filter: String },

    #[error("isolated child for `{filter}` ended before reaching harness call {call}")]
    CallNotReached { filter: String, call: usize },

    /// Returned inside a child for the harness calls it skips on the way to
    /// the call it was started for.
    #[error("harness call {call} is not the one this isolated child runs")]
    NotSelected { call: usize },
}

impl IsolationError {
    /// True when no child process was ever started.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            IsolationError::Spawn { .. } | IsolationError::CurrentExe(_)
        )
    }

    /// Exit code of the child, when it exited voluntarily.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            IsolationError::Exit { code } => Some(*code),
            _ => None,
        }
    }
}

fn describe_signal(signal: &Option<i32>) -> String {
    signal.map(|signal| format!(" (signal {signal})")).unwrap_or_default()
}

/// Errors that can occur while staging fixtures into a temporary directory.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("no Cargo.toml found in {} or any parent directory", .start.display())]
    ProjectRootNotFound { start: PathBuf },

    #[error("failed to stage {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to walk fixture tree: {0}")]
    Walk(#[from] walkdir::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_error_reports_code() {
        let err = IsolationError::Exit { code: 2 };
        assert_eq!(err.to_string(), "isolated child exited with status 2");
        assert_eq!(err.exit_code(), Some(2));
        assert!(!err.is_spawn_failure());
    }

    #[test]
    fn test_spawn_failure_is_distinguishable() {
        let err = IsolationError::Spawn {
            program: PathBuf::from("/missing/binary"),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.is_spawn_failure());
        assert_eq!(err.exit_code(), None);
        assert!(err.to_string().starts_with("failed to spawn /missing/binary"));
    }

    #[test]
    fn test_call_not_reached_names_call() {
        let err = IsolationError::CallNotReached {
            filter: "repeated".to_string(),
            call: 1,
        };
        assert_eq!(
            err.to_string(),
            "isolated child for `repeated` ended before reaching harness call 1"
        );
        assert_eq!(err.exit_code(), None);
    }

    #[test]
    fn test_terminated_mentions_signal_when_known() {
        let with_signal = IsolationError::Terminated { signal: Some(6) };
        let without = IsolationError::Terminated { signal: None };
        assert_eq!(
            with_signal.to_string(),
            "isolated child terminated abnormally (signal 6)"
        );
        assert_eq!(without.to_string(), "isolated child terminated abnormally");
    }
}
