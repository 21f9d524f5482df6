// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Common Kit Test Utilities
//!
//! Shared testing infrastructure:
//!
//! - [`run_child`] / [`Isolation`] run code that may exit or abort the process
//!   in a re-executed copy of the calling test, and hand back its stdout,
//!   stderr and exit status.
//! - [`resolve_caller`] names the function a given number of frames up the
//!   stack; the isolation launcher uses it to pick the test to re-run.
//! - [`setup_dir`] stages fixture files into a temporary working directory.
//! - [`case_name!`] formats readable names for table-driven cases.

pub mod case_name;
pub mod error;
pub mod fixtures;
pub mod frames;
pub mod isolation;
pub mod macros;

pub use error::{IsolationError, StageError};
pub use fixtures::{find_project_root, setup_dir, StagedDir};
pub use frames::{resolve_caller, FrameLabel, FrameOffset};
pub use isolation::{
    run_child, ChildOutput, Isolation, IsolationMode, IsolationStrategy, Reexec, Termination,
    TestFilter, TestTarget, ISOLATION_CALL_ENV, ISOLATION_ENV,
};

// Macros are automatically available at the crate root via #[macro_export]
