// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Run process-terminating code inside a test without terminating the test.
//!
//! A test hands [`run_child`] (or a configured [`Isolation`]) a closure that
//! may call `std::process::exit`, abort, or log a fatal event. The harness
//! re-executes the current test binary restricted to the calling test and
//! marks the child with [`ISOLATION_ENV`]. Inside the child the same call runs
//! the closure directly and ends the process; in the parent it returns the
//! child's stdout, stderr and exit status as a [`ChildOutput`].
//!
//! ```rust,no_run
//! use ck_test_utils::run_child;
//!
//! #[test]
//! fn exits_with_two() {
//!     let output = run_child(|| {
//!         print!("Hello");
//!         std::process::exit(2);
//!     });
//!     assert_eq!(output.stdout, "Hello");
//!     assert_eq!(output.result.unwrap_err().exit_code(), Some(2));
//! }
//! ```

use std::collections::HashMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{self, Command, ExitStatus, Output, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::{debug, warn};

use crate::error::IsolationError;
use crate::frames::{resolve_caller, FrameLabel, FrameOffset};

/// Environment variable the parent sets on the child it spawns.
pub const ISOLATION_ENV: &str = "CK_ISOLATED_CHILD";

/// Environment variable holding which harness call of the test the child
/// should run, counting from 0.
pub const ISOLATION_CALL_ENV: &str = "CK_ISOLATED_CALL";

/// Exit status of a child whose operation panicked, matching libtest's.
pub const PANIC_EXIT_CODE: i32 = 101;

/// Written by the child on both streams, followed by the call index, right
/// before the operation runs. Everything libtest printed earlier is discarded
/// by the parent.
const START_MARKER_PREFIX: &str = "\x1eck-isolated-child#";

fn start_marker(call: usize) -> String {
    format!("{START_MARKER_PREFIX}{call}\x1e\n")
}

/// Whether this process is the orchestrating parent or an isolated child.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationMode {
    #[default]
    Parent,
    Child,
}

impl IsolationMode {
    /// Mode of the current process, read from [`ISOLATION_ENV`] once.
    pub fn from_env() -> Self {
        static MODE: OnceLock<IsolationMode> = OnceLock::new();
        *MODE.get_or_init(|| Self::from_flag(env::var_os(ISOLATION_ENV).as_deref()))
    }

    /// Interpret a raw flag value. Only `1` selects [`IsolationMode::Child`].
    pub fn from_flag(value: Option<&OsStr>) -> Self {
        match value {
            Some(value) if value == "1" => IsolationMode::Child,
            _ => IsolationMode::Parent,
        }
    }
}

/// How the parent finds the test to re-run in the child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestTarget {
    /// Resolve the test from the stack, this many frames above the resolver.
    CallSite(FrameOffset),
    /// A test name as libtest reports it, e.g. `module::tests::exits`.
    Named(String),
}

impl From<FrameLabel> for TestTarget {
    fn from(label: FrameLabel) -> Self {
        TestTarget::Named(label.test_path())
    }
}

/// Exact-match selector for a single test of the current executable, and for
/// one harness call within that test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestFilter {
    name: String,
    call: usize,
}

impl TestFilter {
    pub fn exact(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            call: 0,
        }
    }

    /// Select the `call`-th harness call made by the test, counting from 0.
    pub fn with_call(mut self, call: usize) -> Self {
        self.call = call;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self) -> usize {
        self.call
    }

    /// libtest arguments that run this test and nothing else, on one thread,
    /// with its output going straight to the process streams. Ignored tests
    /// are included so a test run with `--ignored` can still isolate itself.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            OsString::from(&self.name),
            OsString::from("--exact"),
            OsString::from("--include-ignored"),
            OsString::from("--nocapture"),
            OsString::from("--test-threads=1"),
        ]
    }
}

impl fmt::Display for TestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// How an isolated child ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Success,
    Exited(i32),
    /// Killed by a signal or otherwise ended without an exit code.
    Abnormal(Option<i32>),
}

/// What an isolated run produced.
#[derive(Debug)]
pub struct ChildOutput {
    pub stdout: String,
    pub stderr: String,
    pub result: Result<(), IsolationError>,
}

impl ChildOutput {
    /// An outcome where no child ran and nothing was captured.
    pub fn failed(error: IsolationError) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            result: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The `(stdout, stderr, result)` triple.
    pub fn into_parts(self) -> (String, String, Result<(), IsolationError>) {
        (self.stdout, self.stderr, self.result)
    }

    /// How the child ended, or `None` if it never ran the operation.
    pub fn termination(&self) -> Option<Termination> {
        match &self.result {
            Ok(()) => Some(Termination::Success),
            Err(IsolationError::Exit { code }) => Some(Termination::Exited(*code)),
            Err(IsolationError::Terminated { signal }) => Some(Termination::Abnormal(*signal)),
            Err(_) => None,
        }
    }
}

/// Parent-side mechanism that runs the selected test somewhere isolated.
pub trait IsolationStrategy {
    fn launch(&self, filter: &TestFilter) -> ChildOutput;
}

/// Re-executes the test binary as a child process.
#[derive(Clone, Debug, Default)]
pub struct Reexec {
    program: Option<PathBuf>,
}

impl Reexec {
    /// Re-execute [`env::current_exe`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute `program` instead of the current executable.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn program(&self) -> Result<PathBuf, IsolationError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => env::current_exe().map_err(IsolationError::CurrentExe),
        }
    }
}

impl IsolationStrategy for Reexec {
    fn launch(&self, filter: &TestFilter) -> ChildOutput {
        let program = match self.program() {
            Ok(program) => program,
            Err(err) => return ChildOutput::failed(err),
        };

        debug!(
            program = %program.display(),
            filter = %filter,
            call = filter.call(),
            "spawning isolated child"
        );

        // The flags go on this command only; the parent environment is untouched.
        let output = Command::new(&program)
            .args(filter.args())
            .env(ISOLATION_ENV, "1")
            .env(ISOLATION_CALL_ENV, filter.call().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match output {
            Ok(output) => collect_output(filter, output),
            Err(source) => ChildOutput::failed(IsolationError::Spawn { program, source }),
        }
    }
}

fn collect_output(filter: &TestFilter, output: Output) -> ChildOutput {
    let Output {
        status,
        stdout,
        stderr,
    } = output;

    let marker = start_marker(filter.call());
    let started = find_marker(&stdout, &marker).is_some();
    let mut result = status_result(status);
    if !started && filter.call() > 0 {
        warn!(
            filter = %filter,
            call = filter.call(),
            "isolated child ended before reaching the requested call"
        );
        result = Err(IsolationError::CallNotReached {
            filter: filter.name().to_string(),
            call: filter.call(),
        });
    } else if !started && result.is_ok() {
        warn!(filter = %filter, "isolated child exited cleanly without running a test");
        result = Err(IsolationError::TestNotRun {
            filter: filter.name().to_string(),
        });
    }

    debug!(filter = %filter, ?status, started, "isolated child finished");

    ChildOutput {
        stdout: after_marker(&stdout, &marker),
        stderr: after_marker(&stderr, &marker),
        result,
    }
}

fn status_result(status: ExitStatus) -> Result<(), IsolationError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(IsolationError::Exit { code }),
        None => Err(IsolationError::Terminated {
            signal: termination_signal(&status),
        }),
    }
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn find_marker(stream: &[u8], marker: &str) -> Option<usize> {
    let marker = marker.as_bytes();
    stream
        .windows(marker.len())
        .position(|window| window == marker)
}

/// Text after the start marker, or the whole stream if the child never got
/// that far.
fn after_marker(stream: &[u8], marker: &str) -> String {
    let body = match find_marker(stream, marker) {
        Some(start) => &stream[start + marker.len()..],
        None => stream,
    };
    String::from_utf8_lossy(body).into_owned()
}

/// Index of this launch among the launches made for the same test by this
/// process.
fn next_launch(name: &str) -> usize {
    static LAUNCHES: OnceLock<Mutex<HashMap<String, usize>>> = OnceLock::new();
    let mut launches = LAUNCHES
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let count = launches.entry(name.to_string()).or_insert(0);
    let call = *count;
    *count += 1;
    call
}

/// The harness call this child was started for, read from
/// [`ISOLATION_CALL_ENV`] once.
fn selected_call() -> usize {
    static CALL: OnceLock<usize> = OnceLock::new();
    *CALL.get_or_init(|| {
        env::var(ISOLATION_CALL_ENV)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    })
}

fn next_child_call() -> usize {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    CALLS.fetch_add(1, Ordering::SeqCst)
}

/// Configured isolated runner.
pub struct Isolation {
    target: TestTarget,
    mode: IsolationMode,
    strategy: Box<dyn IsolationStrategy>,
}

impl Isolation {
    /// Runner for `target`, in the mode of the current process, re-executing
    /// the current binary.
    pub fn new(target: TestTarget) -> Self {
        Self {
            target,
            mode: IsolationMode::from_env(),
            strategy: Box::new(Reexec::new()),
        }
    }

    pub fn mode(mut self, mode: IsolationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Re-execute `program` instead of the current executable.
    pub fn program(self, program: impl Into<PathBuf>) -> Self {
        self.strategy(Reexec::with_program(program))
    }

    pub fn strategy<S: IsolationStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    /// Run `op` isolated from the calling test.
    ///
    /// In a child process this runs `op` once and exits: status 0 when it
    /// returns, [`PANIC_EXIT_CODE`] when it panics. In the parent `op` is
    /// never called here; the child started by the strategy calls it.
    ///
    /// Each call from the same test gets its own child. The child re-runs the
    /// test from the top and skips the harness calls before the one it was
    /// started for; those return [`IsolationError::NotSelected`] inside the
    /// child.
    ///
    /// [`TestTarget::CallSite`] offsets count from the resolver, which this
    /// method calls directly: [`FrameOffset::CALLER_OF_RUN`] names the
    /// function calling `run`.
    #[inline(never)]
    pub fn run<F: FnOnce()>(&self, op: F) -> ChildOutput {
        if self.mode == IsolationMode::Child {
            let call = next_child_call();
            if call == selected_call() {
                run_in_child(op, call);
            }
            return ChildOutput::failed(IsolationError::NotSelected { call });
        }

        let filter = match &self.target {
            TestTarget::Named(name) => TestFilter::exact(name.as_str()),
            TestTarget::CallSite(offset) => {
                let label = resolve_caller(*offset);
                if label.is_empty() {
                    warn!(%offset, "no enclosing test found; refusing to run the whole binary");
                    return ChildOutput::failed(IsolationError::Unresolved {
                        offset: offset.get(),
                    });
                }
                TestFilter::exact(label.test_path())
            }
        };

        // An empty name cannot select a test.
        if filter.name().is_empty() {
            return ChildOutput::failed(IsolationError::Unresolved { offset: 0 });
        }
        let call = next_launch(filter.name());
        self.strategy.launch(&filter.with_call(call))
    }
}

fn run_in_child<F: FnOnce()>(op: F, call: usize) -> ! {
    announce_start(call);
    let outcome = panic::catch_unwind(AssertUnwindSafe(op));
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    process::exit(match outcome {
        Ok(()) => 0,
        Err(_) => PANIC_EXIT_CODE,
    })
}

fn announce_start(call: usize) {
    let marker = start_marker(call);
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(marker.as_bytes());
    let _ = stdout.flush();
    let _ = io::stderr().write_all(marker.as_bytes());
}

/// Run `op` in a re-executed copy of the calling test.
///
/// Call this directly from the `#[test]` function body; the test is found
/// [`FrameOffset::CALLER_OF_RUN_CHILD`] frames up. Code that wraps this call
/// in helpers should build an [`Isolation`] with an adjusted offset or a
/// [`TestTarget::Named`] target instead.
///
/// A test may call this more than once. The child for a later call re-runs
/// the test body up to that call, with every earlier call returning an error
/// instead of output. Code between calls must not assert on earlier results;
/// if it panics, the later call fails with
/// [`IsolationError::CallNotReached`].
#[inline(never)]
pub fn run_child<F: FnOnce()>(op: F) -> ChildOutput {
    Isolation::new(TestTarget::CallSite(FrameOffset::CALLER_OF_RUN_CHILD)).run(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        filters: Arc<Mutex<Vec<String>>>,
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl IsolationStrategy for Recorder {
        fn launch(&self, filter: &TestFilter) -> ChildOutput {
            self.filters.lock().unwrap().push(filter.name().to_string());
            self.calls.lock().unwrap().push(filter.call());
            ChildOutput {
                stdout: "recorded".to_string(),
                stderr: String::new(),
                result: Ok(()),
            }
        }
    }

    #[test]
    fn test_mode_from_flag() {
        assert_eq!(IsolationMode::from_flag(None), IsolationMode::Parent);
        assert_eq!(
            IsolationMode::from_flag(Some(OsStr::new("0"))),
            IsolationMode::Parent
        );
        assert_eq!(
            IsolationMode::from_flag(Some(OsStr::new(""))),
            IsolationMode::Parent
        );
        assert_eq!(
            IsolationMode::from_flag(Some(OsStr::new("1"))),
            IsolationMode::Child
        );
    }

    #[test]
    fn test_filter_args_are_exact() {
        let filter = TestFilter::exact("isolation::tests::exits");
        assert_eq!(
            filter.args(),
            vec![
                OsString::from("isolation::tests::exits"),
                OsString::from("--exact"),
                OsString::from("--include-ignored"),
                OsString::from("--nocapture"),
                OsString::from("--test-threads=1"),
            ]
        );
    }

    #[test]
    fn test_call_site_target_resolves_enclosing_test() {
        let recorder = Recorder::default();
        let output = Isolation::new(TestTarget::CallSite(FrameOffset::CALLER_OF_RUN))
            .mode(IsolationMode::Parent)
            .strategy(recorder.clone())
            .run(|| unreachable!("the parent never runs the operation"));

        assert_eq!(output.stdout, "recorded");
        assert_eq!(
            *recorder.filters.lock().unwrap(),
            vec!["isolation::tests::test_call_site_target_resolves_enclosing_test".to_string()]
        );
    }

    #[test]
    fn test_named_target_skips_resolution() {
        let recorder = Recorder::default();
        Isolation::new(TestTarget::Named("some::other::test".to_string()))
            .mode(IsolationMode::Parent)
            .strategy(recorder.clone())
            .run(|| {});

        assert_eq!(*recorder.filters.lock().unwrap(), vec!["some::other::test"]);
    }

    #[test]
    fn test_unresolvable_call_site_does_not_launch() {
        let recorder = Recorder::default();
        let output = Isolation::new(TestTarget::CallSite(FrameOffset::new(100_000)))
            .mode(IsolationMode::Parent)
            .strategy(recorder.clone())
            .run(|| {});

        assert!(matches!(
            output.result,
            Err(IsolationError::Unresolved { offset: 100_000 })
        ));
        assert!(recorder.filters.lock().unwrap().is_empty());
        assert_eq!(output.termination(), None);
    }

    #[test]
    fn test_after_marker_drops_harness_preamble() {
        let mut stream = b"\nrunning 1 test\ntest a ... ".to_vec();
        stream.extend_from_slice(start_marker(0).as_bytes());
        stream.extend_from_slice(b"HelloWorld");
        assert_eq!(after_marker(&stream, &start_marker(0)), "HelloWorld");
        assert_eq!(after_marker(b"no marker", &start_marker(0)), "no marker");
    }

    #[test]
    fn test_repeated_launches_for_one_test_are_numbered() {
        let recorder = Recorder::default();
        let isolation = Isolation::new(TestTarget::Named(
            "isolation::tests::numbered_launches".to_string(),
        ))
        .mode(IsolationMode::Parent)
        .strategy(recorder.clone());

        isolation.run(|| {});
        isolation.run(|| {});
        isolation.run(|| {});

        assert_eq!(*recorder.calls.lock().unwrap(), vec![0, 1, 2]);
    }

    #[cfg(unix)]
    #[test]
    fn test_child_that_never_reaches_later_call_is_an_error() {
        use std::os::unix::process::ExitStatusExt;

        let filter = TestFilter::exact("isolation::tests::later_call").with_call(1);
        let mut stdout = b"running 1 test\n".to_vec();
        stdout.extend_from_slice(b"test isolation::tests::later_call ... FAILED\n");
        // Wait status encoding of exit code 101.
        let status = ExitStatus::from_raw(PANIC_EXIT_CODE << 8);

        let output = collect_output(
            &filter,
            Output {
                status,
                stdout,
                stderr: b"assertion failed".to_vec(),
            },
        );

        assert!(matches!(
            output.result,
            Err(IsolationError::CallNotReached { call: 1, .. })
        ));
        assert_eq!(output.stderr, "assertion failed");
    }

    #[test]
    fn test_marker_of_other_call_is_not_accepted() {
        let mut stream = start_marker(0).into_bytes();
        stream.extend_from_slice(b"first");
        assert_eq!(find_marker(&stream, &start_marker(1)), None);
        assert_eq!(after_marker(&stream, &start_marker(0)), "first");
    }

    #[test]
    fn test_termination_of_outputs() {
        let exited = ChildOutput {
            stdout: String::new(),
            stderr: String::new(),
            result: Err(IsolationError::Exit { code: 2 }),
        };
        assert_eq!(exited.termination(), Some(Termination::Exited(2)));

        let spawn = ChildOutput::failed(IsolationError::CurrentExe(io::Error::new(
            io::ErrorKind::NotFound,
            "gone",
        )));
        assert_eq!(spawn.termination(), None);
    }

    // Runs through a real child process; see tests/isolation.rs for the rest.
    #[test]
    fn test_run_child_from_unit_test() {
        let (stdout, stderr, result) = run_child(|| {
            print!("Hello");
            eprint!("Lorem");
            process::exit(3);
        })
        .into_parts();

        assert_eq!(stdout, "Hello");
        assert_eq!(stderr, "Lorem");
        assert_eq!(result.unwrap_err().exit_code(), Some(3));
    }
}
