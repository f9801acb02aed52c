// AST node types for .nest schema files.
//
// A schema is an `input { … }` block describing the nested input document,
// followed by `value`/`trait` declarations. Expressions are an explicit
// tagged union: operators are desugared to named calls by the parser.
// Every node carries a `SimpleSpan` for error reporting in downstream phases.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use std::fmt;
use std::hash::{Hash, Hasher};

use chumsky::span::SimpleSpan;
use serde::Serialize;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

/// A complete schema: the input description plus its declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub inputs: Vec<InputField>,
    pub decls: Vec<Decl>,
    pub span: Span,
}

// ── Input block ──

#[derive(Debug, Clone, PartialEq)]
pub struct InputField {
    pub name: Ident,
    pub ty: InputType,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputType {
    /// `float price`
    Scalar(ElemType),
    /// `object config { … }`: navigation only, never an axis.
    Object(Vec<InputField>),
    /// `array items [as alias] { … }` or `array tags of string`.
    Array {
        alias: Option<Ident>,
        element: ArrayElement,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArrayElement {
    Scalar(ElemType),
    Object(Vec<InputField>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElemType {
    Integer,
    Float,
    String,
    Boolean,
    Any,
}

impl ElemType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "integer" | "int" => Some(ElemType::Integer),
            "float" | "number" => Some(ElemType::Float),
            "string" => Some(ElemType::String),
            "boolean" | "bool" => Some(ElemType::Boolean),
            "any" => Some(ElemType::Any),
            _ => None,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElemType::Integer => "integer",
            ElemType::Float => "float",
            ElemType::String => "string",
            ElemType::Boolean => "boolean",
            ElemType::Any => "any",
        };
        f.write_str(name)
    }
}

// ── Declarations ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclKind {
    Value,
    Trait,
}

impl fmt::Display for DeclKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclKind::Value => f.write_str("value"),
            DeclKind::Trait => f.write_str("trait"),
        }
    }
}

/// `value NAME = expr` / `trait NAME = expr`
#[derive(Debug, Clone, PartialEq)]
pub struct Decl {
    pub kind: DeclKind,
    pub name: Ident,
    pub expr: Expr,
    pub span: Span,
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    /// `input.a.b.c`: the steps after `input`.
    Input(Vec<Ident>),
    /// A bare name: a reference to another declaration.
    Ref(Ident),
    /// `f(a, b)`; operators arrive here as `add`, `lt`, `not`, …
    Call { func: Ident, args: Vec<Expr> },
    /// `cascade { when c => v … else d }`
    Cascade {
        arms: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
    /// `[a, b, c]`
    Array(Vec<Expr>),
    /// `{ key: expr, … }`
    Object(Vec<(Ident, Expr)>),
}

/// A literal constant. Floats compare and hash by bit pattern so literals
/// can key value-interning tables.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Null,
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Integer(a), Literal::Integer(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::String(a), Literal::String(b)) => a == b,
            (Literal::Boolean(a), Literal::Boolean(b)) => a == b,
            (Literal::Null, Literal::Null) => true,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Literal::Integer(n) => n.hash(state),
            Literal::Float(f) => f.to_bits().hash(state),
            Literal::String(s) => s.hash(state),
            Literal::Boolean(b) => b.hash(state),
            Literal::Null => {}
        }
    }
}

impl Literal {
    /// Convert a JSON scalar (catalog identities, evaluator inputs).
    pub fn from_json(value: &serde_json::Value) -> Option<Literal> {
        match value {
            serde_json::Value::Null => Some(Literal::Null),
            serde_json::Value::Bool(b) => Some(Literal::Boolean(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Literal::Integer(i)),
                None => n.as_f64().map(Literal::Float),
            },
            serde_json::Value::String(s) => Some(Literal::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Literal::Integer(n) => serde_json::Value::from(*n),
            Literal::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Literal::String(s) => serde_json::Value::String(s.clone()),
            Literal::Boolean(b) => serde_json::Value::Bool(*b),
            Literal::Null => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(n) => write!(f, "{n}"),
            Literal::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::String(s) => write!(f, "{s:?}"),
            Literal::Boolean(b) => write!(f, "{b}"),
            Literal::Null => write!(f, "null"),
        }
    }
}

// ── Common ──

/// An identifier with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}
