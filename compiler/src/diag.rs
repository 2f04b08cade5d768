// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across the loader, registrar and
// lowering passes, plus the `CompileError` that aborts compilation.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use thiserror::Error;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0301`, `W0601`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes, grouped by hundreds.
///
/// E01xx module loading, E02xx definitions, E03xx types, E04xx variable
/// usage and deadlock, E05xx annotations, E06xx app functions, W06xx app
/// warnings.
pub mod codes {
    use super::DiagCode;

    pub const E0100: DiagCode = DiagCode("E0100"); // module not found
    pub const E0101: DiagCode = DiagCode("E0101"); // module unreadable
    pub const E0102: DiagCode = DiagCode("E0102"); // syntax error
    pub const E0103: DiagCode = DiagCode("E0103"); // no entry function

    pub const E0200: DiagCode = DiagCode("E0200"); // duplicate definition
    pub const E0201: DiagCode = DiagCode("E0201"); // unknown type
    pub const E0202: DiagCode = DiagCode("E0202"); // invalid composite signature
    pub const E0203: DiagCode = DiagCode("E0203"); // builtin without implementation
    pub const E0204: DiagCode = DiagCode("E0204"); // duplicate struct field
    pub const E0205: DiagCode = DiagCode("E0205"); // invalid global constant
    pub const E0206: DiagCode = DiagCode("E0206"); // bad inline template

    pub const E0300: DiagCode = DiagCode("E0300"); // type mismatch
    pub const E0301: DiagCode = DiagCode("E0301"); // array key type mismatch
    pub const E0302: DiagCode = DiagCode("E0302"); // not an array / struct
    pub const E0303: DiagCode = DiagCode("E0303"); // wrong argument count
    pub const E0304: DiagCode = DiagCode("E0304"); // unsupported wait type
    pub const E0305: DiagCode = DiagCode("E0305"); // unknown function
    pub const E0306: DiagCode = DiagCode("E0306"); // unsupported operand types

    pub const E0400: DiagCode = DiagCode("E0400"); // undefined variable
    pub const E0401: DiagCode = DiagCode("E0401"); // duplicate variable
    pub const E0402: DiagCode = DiagCode("E0402"); // self-assignment
    pub const E0403: DiagCode = DiagCode("E0403"); // conditional deadlock
    pub const E0404: DiagCode = DiagCode("E0404"); // wait deadlock
    pub const E0405: DiagCode = DiagCode("E0405"); // foreach over written array
    pub const E0406: DiagCode = DiagCode("E0406"); // chain stage without output
    pub const E0407: DiagCode = DiagCode("E0407"); // invalid updateable use
    pub const E0408: DiagCode = DiagCode("E0408"); // invalid mapping

    pub const E0500: DiagCode = DiagCode("E0500"); // invalid annotation
    pub const E0501: DiagCode = DiagCode("E0501"); // unknown builtin op
    pub const E0502: DiagCode = DiagCode("E0502"); // unknown dispatch mode
    pub const E0503: DiagCode = DiagCode("E0503"); // parallel must run on workers

    pub const E0600: DiagCode = DiagCode("E0600"); // invalid app output type
    pub const E0601: DiagCode = DiagCode("E0601"); // invalid redirect
    pub const E0602: DiagCode = DiagCode("E0602"); // duplicate redirect
    pub const E0603: DiagCode = DiagCode("E0603"); // invalid command line arg

    pub const W0600: DiagCode = DiagCode("W0600"); // output unused on command line
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Source origin ────────────────────────────────────────────────────────

/// Module and line/column a diagnostic was raised in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub module: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.module, self.line, self.column)
    }
}

/// Byte offset → 1-based line/column lookup for one source file.
#[derive(Debug, Clone)]
pub struct LineMap {
    line_starts: Vec<usize>,
}

impl LineMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        LineMap { line_starts }
    }

    pub fn location(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (line + 1, offset - self.line_starts[line] + 1)
    }
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub origin: Option<Origin>,
    pub related_spans: Vec<RelatedSpan>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, origin or related spans.
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            origin: None,
            related_spans: Vec::new(),
        }
    }

    pub fn error(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message).with_code(code)
    }

    pub fn warning(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, span, message).with_code(code)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related span.
    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }

    /// Attach the module/line the diagnostic was raised in. Keeps an
    /// existing origin so the innermost context wins.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        if self.origin.is_none() {
            self.origin = Some(origin);
        }
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(origin) = &self.origin {
            write!(f, "\n  --> {}", origin)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ── Compile error ────────────────────────────────────────────────────────

/// Aborting failure of the frontend. User errors carry a diagnostic;
/// internal errors indicate a compiler bug.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    User(Box<Diagnostic>),
    #[error("{}", render_syntax(.path, .errors))]
    Syntax { path: String, errors: Vec<String> },
    #[error("internal compiler error: {message}")]
    Internal { message: String },
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn render_syntax(path: &str, errors: &[String]) -> String {
    let mut out = format!("error[{}]: syntax errors in {}", codes::E0102, path);
    for e in errors {
        out.push_str("\n  ");
        out.push_str(e);
    }
    out
}

impl CompileError {
    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal {
            message: message.into(),
        }
    }

    /// The diagnostic behind a user error, if any.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            CompileError::User(d) => Some(d),
            _ => None,
        }
    }

    /// Attach module/line context to a user error on its way out.
    pub fn in_origin(self, origin: impl FnOnce(Span) -> Origin) -> Self {
        match self {
            CompileError::User(d) => {
                let o = origin(d.span);
                CompileError::User(Box::new(d.with_origin(o)))
            }
            other => other,
        }
    }
}

impl From<Diagnostic> for CompileError {
    fn from(d: Diagnostic) -> Self {
        CompileError::User(Box::new(d))
    }
}

/// Result type threaded through every frontend pass.
pub type WalkResult<T> = Result<T, CompileError>;
