// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Convenience macros for isolated tests and table-driven cases.

/// Label of the enclosing function, found at compile time.
///
/// Unlike [`crate::resolve_caller`] this does not depend on stack depth, so it
/// keeps working when the isolated call sits behind helpers. Convert the
/// result into a [`crate::TestTarget`] to select the enclosing test:
///
/// ```rust,no_run
/// use ck_test_utils::{current_test, Isolation};
///
/// #[test]
/// fn exits_from_helper() {
///     let output = Isolation::new(current_test!().into()).run(|| std::process::exit(4));
///     assert_eq!(output.result.unwrap_err().exit_code(), Some(4));
/// }
/// ```
#[macro_export]
macro_rules! current_test {
    () => {{
        fn __ck_here() {}
        $crate::FrameLabel::enclosing(::std::any::type_name_of_val(&__ck_here))
    }};
}

/// Build a readable test case name from heterogeneous serializable parts.
///
/// ```rust
/// use ck_test_utils::case_name;
///
/// assert_eq!(case_name!(3, "exit_code", "/bin/true"), "03 exit code %bin%true");
/// ```
#[macro_export]
macro_rules! case_name {
    ($($part:expr),* $(,)?) => {
        $crate::case_name::format_case_name(&[$($crate::case_name::to_part(&$part)),*])
    };
}
