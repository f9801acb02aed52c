// diag.rs — Diagnostics reported to the user
//
// Every stage reports problems as `Diagnostic`s. Stages that fail with a
// `CompileError` are converted at the pipeline boundary (see error.rs), so
// callers only ever see this one type.
//
// Preconditions: none.
// Postconditions: `Display` renders `level[code]: message`, followed by the
//   hint and related notes on their own indented lines.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

/// Stable identifier for a class of diagnostic, e.g. `E0200`.
///
/// A code never changes meaning once published; tests and tools match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Codes grouped by hundreds: 0xx syntax, 1xx input catalog, 2xx calls,
/// 3xx declarations, 4xx selection, 9xx compiler invariants.
pub mod codes {
    use super::DiagCode;

    pub const E0001: DiagCode = DiagCode("E0001"); // parse error

    pub const E0100: DiagCode = DiagCode("E0100"); // unknown input path
    pub const E0101: DiagCode = DiagCode("E0101"); // duplicate axis

    pub const E0200: DiagCode = DiagCode("E0200"); // no matching signature
    pub const E0201: DiagCode = DiagCode("E0201"); // join policy missing or unusable
    pub const E0202: DiagCode = DiagCode("E0202"); // unknown function

    pub const E0300: DiagCode = DiagCode("E0300"); // cyclic dependency
    pub const E0301: DiagCode = DiagCode("E0301"); // unknown declaration
    pub const E0302: DiagCode = DiagCode("E0302"); // duplicate declaration
    pub const W0300: DiagCode = DiagCode("W0300"); // skipped after upstream failure

    pub const E0400: DiagCode = DiagCode("E0400"); // cascade without else

    pub const E0900: DiagCode = DiagCode("E0900"); // internal error
    pub const E0901: DiagCode = DiagCode("E0901"); // loop program verification failed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

impl DiagLevel {
    fn as_str(self) -> &'static str {
        match self {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        }
    }
}

/// Another location that explains the primary one.
#[derive(Debug, Clone)]
pub struct Note {
    pub span: Span,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub notes: Vec<Note>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Diagnostic {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            notes: Vec::new(),
        }
    }

    pub fn with_code(self, code: DiagCode) -> Self {
        Diagnostic {
            code: Some(code),
            ..self
        }
    }

    /// Suggest a fix.
    pub fn with_hint(self, hint: impl Into<String>) -> Self {
        Diagnostic {
            hint: Some(hint.into()),
            ..self
        }
    }

    /// Point at a second location, e.g. an earlier definition.
    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.notes.push(Note {
            span,
            label: label.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.level.as_str())?;
        if let Some(code) = self.code {
            write!(f, "[{}]", code)?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        for note in &self.notes {
            write!(f, "\n  note: {} (offset {})", note.label, note.span.start)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chumsky::span::Span as _;

    fn at(start: usize) -> Span {
        Span::new((), start..start + 1)
    }

    #[test]
    fn plain_message() {
        let d = Diagnostic::new(DiagLevel::Error, at(0), "unknown input path");
        assert_eq!(d.to_string(), "error: unknown input path");
        assert!(d.is_error());
    }

    #[test]
    fn code_goes_in_brackets() {
        let d = Diagnostic::new(DiagLevel::Warning, at(0), "declaration skipped").with_code(codes::W0300);
        assert_eq!(d.to_string(), "warning[W0300]: declaration skipped");
        assert!(!d.is_error());
    }

    #[test]
    fn hint_and_notes_follow_on_own_lines() {
        let d = Diagnostic::new(DiagLevel::Error, at(40), "duplicate declaration 'total'")
            .with_code(codes::E0302)
            .with_hint("rename one of them")
            .with_related(at(12), "first defined here");
        assert_eq!(
            d.to_string(),
            "error[E0302]: duplicate declaration 'total'\n  hint: rename one of them\n  note: first defined here (offset 12)"
        );
    }
}
