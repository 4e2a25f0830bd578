//! Call-site detection and stack formatting.
//!
//! Location detection relies on `#[track_caller]`: [`CallSite::caller`] reports
//! the location of the nearest caller that is *not* itself `#[track_caller]`.
//! Every public capture entry point in this crate is `#[track_caller]`, so the
//! detected location is always the user's call site no matter how many of
//! those entry points sit in between.
//!
//! The enclosing function cannot be recovered from a `Location`, so the
//! [`call_site!`](crate::call_site) macro records it at expansion time.

use backtrace::Backtrace;
use std::{error::Error, fmt, panic::Location};

/// A source location, optionally with the enclosing function path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
}

impl CallSite {
    pub fn new(file: impl Into<String>, line: u32, function: Option<&str>) -> Self {
        Self {
            file: file.into(),
            line,
            function: function.map(str::to_string),
        }
    }

    /// The location of the caller. Function is unknown.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self::new(location.file(), location.line(), None)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[doc(hidden)]
pub fn type_name_of<T>(_: T) -> &'static str {
    std::any::type_name::<T>()
}

#[doc(hidden)]
pub fn enclosing_function(marker_path: &str) -> &str {
    let mut path = marker_path.strip_suffix("::__apm_call_site").unwrap_or(marker_path);
    while let Some(stripped) = path.strip_suffix("::{{closure}}") {
        path = stripped;
    }
    path
}

/// Captures the current file, line and enclosing function path.
///
/// ```
/// use otel_apm_lite::call_site;
///
/// fn handler() -> otel_apm_lite::stack::CallSite {
///     call_site!()
/// }
///
/// let site = handler();
/// assert!(site.function.unwrap().ends_with("handler"));
/// ```
#[macro_export]
macro_rules! call_site {
    () => {{
        fn __apm_call_site() {}
        let marker = $crate::stack::type_name_of(__apm_call_site);
        $crate::stack::CallSite::new(
            file!(),
            line!(),
            Some($crate::stack::enclosing_function(marker)),
        )
    }};
}

/// Raw frame addresses of the current thread's stack. Symbols are resolved
/// only by [`UnresolvedStack::resolve`], so taking one is cheap.
#[derive(Debug, Clone)]
pub struct UnresolvedStack(Backtrace);

impl UnresolvedStack {
    pub fn capture() -> Self {
        Self(Backtrace::new_unresolved())
    }

    /// Resolves symbols and formats one `file:line function` line per frame,
    /// innermost first. Frames of the backtrace machinery and this module are
    /// skipped. Blocking.
    pub fn resolve(mut self) -> String {
        self.0.resolve();
        frame_lines(&self.0).join("\n")
    }
}

fn frame_lines(backtrace: &Backtrace) -> Vec<String> {
    let mut lines = Vec::new();
    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let name = symbol.name().map(|n| format!("{:#}", n)).unwrap_or_default();
            if name.starts_with("backtrace::")
                || name.contains("::stack::UnresolvedStack::capture")
                || name.contains("::stack::ExceptionInfo::capture")
            {
                continue;
            }
            if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                if name.is_empty() {
                    lines.push(format!("{}:{}", file.display(), line));
                } else {
                    lines.push(format!("{}:{} {}", file.display(), line, name));
                }
            }
        }
    }
    lines
}

/// An error captured at its throw site, ready to be attached to a span.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    pub location: CallSite,
    /// `file:line` of the throw site first, then the caller frames.
    pub stack: String,
}

impl ExceptionInfo {
    /// Captures `error` at the caller's location.
    ///
    /// For trait objects the type is taken from the error's `Debug` output.
    #[track_caller]
    pub fn capture<E: Error + ?Sized>(error: &E) -> Self {
        let location = CallSite::caller();
        let mut lines = vec![location.to_string()];
        lines.extend(frame_lines(&Backtrace::new()));
        Self {
            type_name: error_type_name(error),
            message: error_chain(error),
            location,
            stack: lines.join("\n"),
        }
    }
}

fn error_type_name<E: Error + ?Sized>(error: &E) -> String {
    let static_name = std::any::type_name::<E>();
    if !static_name.starts_with("dyn ") {
        return static_name.to_string();
    }
    let debug = format!("{:?}", error);
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.is_empty() {
        static_name.to_string()
    } else {
        name
    }
}

/// Renders an error and its sources as `outer: inner: root`.
fn error_chain<E: Error + ?Sized>(error: &E) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn level_three() -> CallSite {
        CallSite::caller()
    }

    #[track_caller]
    fn level_two() -> CallSite {
        level_three()
    }

    #[track_caller]
    fn level_one() -> CallSite {
        level_two()
    }

    fn untracked() -> (CallSite, u32) {
        (level_one(), line!())
    }

    #[test]
    fn test_caller_three_frames_deep_reports_true_call_site() {
        let (site, line) = (level_one(), line!());
        assert_eq!(site.file, file!());
        assert_eq!(site.line, line);
        assert!(site.function.is_none());
    }

    #[test]
    fn test_untracked_frame_stops_propagation() {
        let (site, line) = untracked();
        assert_eq!(site.line, line);
    }

    #[test]
    fn test_call_site_macro_records_function() {
        let (site, line) = (crate::call_site!(), line!());
        assert_eq!(site.line, line);
        let function = site.function.unwrap();
        assert!(
            function.ends_with("test_call_site_macro_records_function"),
            "{}",
            function
        );
    }

    #[test]
    fn test_call_site_macro_inside_closure() {
        let site = (|| crate::call_site!())();
        assert!(site
            .function
            .unwrap()
            .ends_with("test_call_site_macro_inside_closure"));
    }

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "disk full")
        }
    }

    impl Error for Inner {}

    #[derive(Debug)]
    struct Outer(Inner);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "write failed")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_exception_stack_starts_at_throw_site() {
        let err = Outer(Inner);
        let (info, line) = (ExceptionInfo::capture(&err), line!());
        let first = info.stack.lines().next().unwrap();
        assert_eq!(first, format!("{}:{}", file!(), line));
        assert_eq!(info.message, "write failed: disk full");
        assert!(info.type_name.ends_with("Outer"));
        assert_eq!(info.location.line, line);
    }

    #[test]
    fn test_exception_type_of_boxed_error() {
        let boxed: Box<dyn Error + Send + Sync> = Box::new(Outer(Inner));
        let info = ExceptionInfo::capture(&*boxed);
        assert_eq!(info.type_name, "Outer");
        assert_eq!(info.message, "write failed: disk full");

        let concrete = ExceptionInfo::capture(&Box::new(Outer(Inner)));
        assert!(concrete.type_name.contains("Outer"), "{}", concrete.type_name);
    }

    #[test]
    fn test_unresolved_stack_resolves_later() {
        let stack = UnresolvedStack::capture();
        let rendered = std::thread::spawn(move || stack.resolve()).join().unwrap();
        for line in rendered.lines() {
            assert!(line.contains(':'), "{}", line);
            assert!(!line.contains("UnresolvedStack::capture"), "{}", line);
        }
    }
}
