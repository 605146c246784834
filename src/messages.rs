//! Compile-time diagnostics.
//!
//! Grounded on `original_source/src/compile_message.hpp`: a message is a
//! severity, free text, and a source location, collected rather than
//! thrown (see `spec.md` §7). `Severity`/`CompileMessage` intentionally do
//! not implement `std::error::Error` — they are accumulated data, not
//! control flow.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "Error"),
            Severity::Warning => write!(f, "Warning"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLocation { line, column }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.line, self.column)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileMessage {
    pub severity: Severity,
    pub text: String,
    pub loc: SourceLocation,
}

impl CompileMessage {
    pub fn error(text: impl Into<String>, loc: SourceLocation) -> Self {
        CompileMessage { severity: Severity::Error, text: text.into(), loc }
    }

    pub fn warning(text: impl Into<String>, loc: SourceLocation) -> Self {
        CompileMessage { severity: Severity::Warning, text: text.into(), loc }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for CompileMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.loc, self.text)
    }
}

/// True if any message in the list is an `ERROR`. Compilation succeeds
/// only when this is false (spec.md §7).
pub fn has_errors(messages: &[CompileMessage]) -> bool {
    messages.iter().any(CompileMessage::is_error)
}
