// error.rs — Compile error taxonomy
//
// Every failure a core pass can raise is one `CompileError` variant. Errors
// carry full context (function id, argument shapes, declaration name) and
// map onto a stable diagnostic code for user-facing reporting.
//
// Preconditions: none (types only).
// Postconditions: none.
// Failure modes: none.
// Side effects: none.

use thiserror::Error;

use crate::ast::Span;
use crate::diag::{codes, DiagCode, DiagLevel, Diagnostic};
use crate::shape::{fmt_shapes, Shape};

/// Result type used by all compiler passes.
pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("unknown input path 'input.{path}'")]
    UnknownPath { path: String },

    #[error("axis '{axis}' is introduced twice (by '{first}' and '{second}')")]
    DuplicateAxis {
        axis: String,
        first: String,
        second: String,
    },

    #[error("no signature of '{fn_id}' matches argument shapes {}: {reason}", fmt_shapes(.shapes))]
    SignatureMatch {
        fn_id: String,
        shapes: Vec<Shape>,
        reason: String,
    },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("cannot join argument shapes {} of '{fn_id}': {detail}", fmt_shapes(.shapes))]
    JoinPolicy {
        fn_id: String,
        shapes: Vec<Shape>,
        detail: String,
    },

    #[error("cyclic declaration dependency: {}", .cycle.join(" -> "))]
    CyclicDeclaration { cycle: Vec<String> },

    #[error("unknown declaration '{name}'")]
    UnknownDeclaration { name: String },

    #[error("declaration '{name}' is defined more than once")]
    DuplicateDeclaration { name: String },

    #[error("cascade in '{decl}' has no else branch")]
    AmbiguousSelection { decl: String },

    #[error("internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }

    pub fn code(&self) -> DiagCode {
        match self {
            CompileError::UnknownPath { .. } => codes::E0100,
            CompileError::DuplicateAxis { .. } => codes::E0101,
            CompileError::SignatureMatch { .. } => codes::E0200,
            CompileError::JoinPolicy { .. } => codes::E0201,
            CompileError::UnknownFunction { .. } => codes::E0202,
            CompileError::CyclicDeclaration { .. } => codes::E0300,
            CompileError::UnknownDeclaration { .. } => codes::E0301,
            CompileError::DuplicateDeclaration { .. } => codes::E0302,
            CompileError::AmbiguousSelection { .. } => codes::E0400,
            CompileError::Internal(_) => codes::E0900,
        }
    }

    /// Convert to an error-level diagnostic anchored at `span`.
    pub fn to_diagnostic(&self, span: Span) -> Diagnostic {
        let diag = Diagnostic::new(DiagLevel::Error, span, self.to_string()).with_code(self.code());
        match self {
            CompileError::JoinPolicy { .. } => {
                diag.with_hint("use a function that declares @zip or @product, or reduce one side first")
            }
            CompileError::AmbiguousSelection { .. } => {
                diag.with_hint("add an `else` arm to the cascade")
            }
            CompileError::Internal(_) => diag.with_hint("this is a compiler bug"),
            _ => diag,
        }
    }
}

/// A `CompileError` tied to the source construct that raised it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedError {
    pub error: CompileError,
    pub span: Span,
}

impl SpannedError {
    pub fn to_diagnostic(&self) -> Diagnostic {
        self.error.to_diagnostic(self.span)
    }
}

/// Attach a span to a plain `Result`.
pub trait WithSpan<T> {
    fn at(self, span: Span) -> std::result::Result<T, SpannedError>;
}

impl<T> WithSpan<T> for Result<T> {
    fn at(self, span: Span) -> std::result::Result<T, SpannedError> {
        self.map_err(|error| SpannedError { error, span })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_message_names_function_and_shapes() {
        let err = CompileError::SignatureMatch {
            fn_id: "zip_add".into(),
            shapes: vec![Shape::from_names(["a", "b"]), Shape::from_names(["c"])],
            reason: "outer shapes [a] and [] disagree".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("zip_add"));
        assert!(msg.contains("[a, b], [c]"));
        assert!(msg.contains("outer"));
        assert_eq!(err.code(), codes::E0200);
    }

    #[test]
    fn cycle_message_joins_names() {
        let err = CompileError::CyclicDeclaration {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic declaration dependency: a -> b -> a");
    }

    #[test]
    fn diagnostic_carries_code_and_hint() {
        use chumsky::span::Span as _;
        let err = CompileError::AmbiguousSelection { decl: "tier".into() };
        let diag = err.to_diagnostic(Span::new((), 3..9));
        assert_eq!(diag.code, Some(codes::E0400));
        assert!(diag.hint.is_some());
        assert_eq!(format!("{diag}").lines().next(), Some("error[E0400]: cascade in 'tier' has no else branch"));
    }
}
