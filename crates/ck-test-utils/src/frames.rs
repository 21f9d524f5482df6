// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Call-site resolution by stack inspection.
//!
//! [`resolve_caller`] captures the current stack, finds its own frame and
//! returns the symbol a fixed number of frames above it. The isolation
//! launcher uses this to discover which `#[test]` function it was called from,
//! so it can re-execute the test binary restricted to exactly that test.
//!
//! The depth is always supplied by the caller as a [`FrameOffset`]. Every
//! wrapper placed between a test body and the resolver adds one frame, so a
//! wrong offset silently names the wrong function. The offsets used by this
//! crate's own entry points are published as constants and pinned by tests.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Label libtest and the demanglers give closure bodies, after normalization.
pub const CLOSURE: &str = "{{closure}}";

const ANCHOR: &str = concat!(module_path!(), "::resolve_caller");

/// Number of frames above [`resolve_caller`]'s own frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameOffset(usize);

impl FrameOffset {
    /// The resolver itself.
    pub const RESOLVER: FrameOffset = FrameOffset(0);

    /// The function that called [`crate::Isolation::run`].
    pub const CALLER_OF_RUN: FrameOffset = FrameOffset(2);

    /// The function that called [`crate::run_child`].
    pub const CALLER_OF_RUN_CHILD: FrameOffset = FrameOffset(3);

    pub const fn new(frames: usize) -> Self {
        Self(frames)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    /// Offset for a caller that sits `extra` wrapper frames further away.
    pub const fn deeper(self, extra: usize) -> Self {
        Self(self.0 + extra)
    }
}

impl fmt::Display for FrameOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalized symbol path of a single stack frame.
///
/// Hash suffixes, generic argument lists and the closure spelling of the v0
/// mangling scheme are removed, so labels compare equal across toolchains.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FrameLabel {
    path: String,
}

impl FrameLabel {
    /// Build a label from a demangled symbol name.
    pub fn new(symbol: &str) -> Self {
        Self {
            path: normalize_symbol(symbol),
        }
    }

    /// Label of the item that encloses `item_path`.
    ///
    /// Used by [`crate::current_test!`], which names a nested item and needs
    /// its parent.
    pub fn enclosing(item_path: &str) -> Self {
        let label = Self::new(item_path);
        let segments = split_path(&label.path);
        match segments.len() {
            0 | 1 => Self::default(),
            n => Self {
                path: segments[..n - 1].join("::"),
            },
        }
    }

    /// Full normalized path, including the crate name.
    pub fn qualified(&self) -> &str {
        &self.path
    }

    /// Last path segment: the plain function name.
    pub fn bare_name(&self) -> &str {
        split_path(&self.path).last().copied().unwrap_or("")
    }

    /// The name libtest gives a test defined at this path: the path without
    /// its leading crate segment.
    pub fn test_path(&self) -> String {
        let segments = split_path(&self.path);
        if segments.len() > 1 {
            segments[1..].join("::")
        } else {
            self.path.clone()
        }
    }

    pub fn is_closure(&self) -> bool {
        self.bare_name() == CLOSURE
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

impl fmt::Display for FrameLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Return the label of the frame `offset` frames above this function.
///
/// Offset 0 is `resolve_caller` itself, 1 its caller, 2 the caller's caller.
/// When the stack cannot be captured, symbols are unavailable or the offset
/// runs past the outermost frame, the result is an empty label.
#[inline(never)]
pub fn resolve_caller(offset: FrameOffset) -> FrameLabel {
    let backtrace = Backtrace::force_capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return FrameLabel::default();
    }

    let labels = parse_listing(&format!("{backtrace:?}"));
    labels
        .iter()
        .position(|label| label.qualified() == ANCHOR)
        .and_then(|anchor| anchor.checked_add(offset.get()))
        .and_then(|index| labels.get(index))
        .cloned()
        .unwrap_or_default()
}

/// Parse the `Debug` listing of a captured [`Backtrace`] into one label per
/// symbol, innermost first. Inlined functions appear as their own entries.
fn parse_listing(listing: &str) -> Vec<FrameLabel> {
    symbol_pattern()
        .captures_iter(listing)
        .map(|captures| {
            captures
                .get(1)
                .map(|name| FrameLabel::new(name.as_str()))
                .unwrap_or_default()
        })
        .collect()
}

fn symbol_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"\{ fn: (?:"([^"]*)"|<unknown>)"#).expect("symbol pattern is valid")
    })
}

fn hash_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"::h[0-9a-f]{16}$").expect("hash pattern is valid"))
}

fn closure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{closure#\d+\}").expect("closure pattern is valid"))
}

fn normalize_symbol(symbol: &str) -> String {
    let symbol = hash_pattern().replace(symbol.trim(), "");
    let symbol = closure_pattern().replace_all(&symbol, CLOSURE);
    unwrap_inherent_impl(strip_generic_args(&symbol))
}

/// Drop every `::<...>` argument list, respecting nesting.
fn strip_generic_args(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    let mut rest = symbol;
    while let Some(start) = rest.find("::<") {
        out.push_str(&rest[..start]);
        let mut depth = 0usize;
        let mut end = rest.len();
        let mut prev = ':';
        for (i, c) in rest[start + 2..].char_indices() {
            let arrow = prev == '-';
            prev = c;
            match c {
                '<' => depth += 1,
                '>' if !arrow => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        end = start + 2 + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

/// `<crate::Type>::method` becomes `crate::Type::method`; trait impls
/// (`<A as B>::method`) are left alone.
fn unwrap_inherent_impl(symbol: String) -> String {
    if !symbol.starts_with('<') {
        return symbol;
    }
    let mut depth = 0usize;
    for (i, c) in symbol.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let inner = &symbol[1..i];
                    if inner.contains(" as ") {
                        return symbol;
                    }
                    return format!("{inner}{}", &symbol[i + 1..]);
                }
            }
            _ => {}
        }
    }
    symbol
}

/// Split on `::` separators that are not inside angle brackets.
fn split_path(path: &str) -> Vec<&str> {
    if path.is_empty() {
        return Vec::new();
    }
    let bytes = path.as_bytes();
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                segments.push(&path[start..i]);
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(&path[start..]);
    segments
}
