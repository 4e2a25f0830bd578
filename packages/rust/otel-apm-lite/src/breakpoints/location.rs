//! Location identity for capture points.
//!
//! A capture point is primarily identified by `function:label`, which survives
//! edits that move code around inside a file. `file:line` is the fallback for
//! breakpoints created against a bare source position.

use super::BreakpointDescriptor;
use crate::stack::CallSite;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocationKey {
    Function {
        function: String,
        label: Option<String>,
    },
    File {
        file: String,
        line: u32,
    },
}

impl LocationKey {
    /// The primary key for a call site, or `None` when the enclosing function is unknown.
    pub fn for_call_site(site: &CallSite, label: Option<&str>) -> Option<Self> {
        site.function.as_ref().map(|function| LocationKey::Function {
            function: function.clone(),
            label: label.map(str::to_string),
        })
    }

    pub fn file(file: impl Into<String>, line: u32) -> Self {
        LocationKey::File {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationKey::Function { function, label } => {
                write!(f, "{}:{}", function, label.as_deref().unwrap_or_default())
            }
            LocationKey::File { file, line } => write!(f, "{}:{}", file, line),
        }
    }
}

/// Finds the breakpoint for a call site: `function:label` first, then `file:line`.
pub fn resolve<'a>(
    breakpoints: &'a [BreakpointDescriptor],
    site: &CallSite,
    label: Option<&str>,
) -> Option<&'a BreakpointDescriptor> {
    let by_function = site.function.as_deref().and_then(|function| {
        breakpoints.iter().find(|bp| {
            bp.function_name.as_deref() == Some(function) && bp.label.as_deref() == label
        })
    });
    by_function.or_else(|| resolve_by_file_line(breakpoints, &site.file, site.line))
}

/// Finds the breakpoint registered at `file:line`.
pub fn resolve_by_file_line<'a>(
    breakpoints: &'a [BreakpointDescriptor],
    file: &str,
    line: u32,
) -> Option<&'a BreakpointDescriptor> {
    breakpoints
        .iter()
        .find(|bp| bp.line_number == line && same_file(&bp.file_path, file))
}

/// Compares paths, tolerating one side being a suffix of the other at a
/// component boundary (`/srv/app/src/main.rs` vs `src/main.rs`).
fn same_file(a: &str, b: &str) -> bool {
    let a = a.trim_start_matches("./").replace('\\', "/");
    let b = b.trim_start_matches("./").replace('\\', "/");
    if a == b {
        return true;
    }
    let (long, short) = if a.len() > b.len() { (&a, &b) } else { (&b, &a) };
    !short.is_empty() && long.ends_with(short.as_str()) && long[..long.len() - short.len()].ends_with('/')
}
