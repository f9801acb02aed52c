// ir.rs — Declaration op IR
//
// A declaration lowers to a flat, value-interned arena of ops. Each op has
// a kind, operand op ids, the shape it was resolved to, and an ordered
// attribute bag. Ops are referenced by `OpId` only; the arena belongs to
// exactly one declaration.
//
// Preconditions: none (types and builder).
// Postconditions: op ids are dense and assigned in emission order; operands
//   always precede their users; structurally identical ops share one id.
// Failure modes: `Internal` when an op names a missing operand or the result
//   id is out of range.
// Side effects: none.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

use crate::ast::{DeclKind, Literal};
use crate::error::{CompileError, Result};
use crate::id::OpId;
use crate::shape::{Axis, Shape};

// ── Op kinds and attributes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Const,
    LoadInput,
    Map,
    /// Args: `cond0, value0, cond1, value1, …, default`.
    Select,
    Reduce,
    LoadDeclaration,
    MakeArray,
    MakeObject,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Const => "const",
            OpKind::LoadInput => "load_input",
            OpKind::Map => "map",
            OpKind::Select => "select",
            OpKind::Reduce => "reduce",
            OpKind::LoadDeclaration => "load_decl",
            OpKind::MakeArray => "make_array",
            OpKind::MakeObject => "make_object",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrKey {
    /// Function id of a `Map` or `Reduce`.
    Fn,
    Literal,
    /// Input path of a `LoadInput`.
    Path,
    /// Axes consumed by a `Reduce`.
    Reduced,
    /// Referenced declaration of a `LoadDeclaration`.
    Decl,
    /// Axes active where a `LoadDeclaration` is used.
    UseSite,
    RefMode,
    /// Field names of a `MakeObject`.
    Keys,
    /// Per-argument zip aliases `(argument axis, carrier axis)`.
    Align,
}

/// How a cross-declaration reference is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefMode {
    /// The consumer re-runs the producer's ops in its own loop nest.
    Inline,
    /// The consumer reads the producer's materialized result by index.
    Indexed,
}

impl fmt::Display for RefMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefMode::Inline => f.write_str("inline"),
            RefMode::Indexed => f.write_str("indexed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Literal(Literal),
    Axes(Vec<Axis>),
    Shape(Shape),
    RefMode(RefMode),
    Keys(Vec<String>),
    Aliases(Vec<Vec<(Axis, Axis)>>),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::Literal(lit) => write!(f, "{}", lit),
            AttrValue::Axes(axes) => {
                let names: Vec<&str> = axes.iter().map(|a| a.name()).collect();
                write!(f, "{}", names.join(","))
            }
            AttrValue::Shape(shape) => write!(f, "{}", shape),
            AttrValue::RefMode(mode) => write!(f, "{}", mode),
            AttrValue::Keys(keys) => write!(f, "{}", keys.join(",")),
            AttrValue::Aliases(per_arg) => {
                let parts: Vec<String> = per_arg
                    .iter()
                    .map(|aliases| {
                        aliases
                            .iter()
                            .map(|(a, c)| format!("{}->{}", a, c))
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .collect();
                write!(f, "[{}]", parts.join("; "))
            }
        }
    }
}

/// Ordered attribute bag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Attrs(BTreeMap<AttrKey, AttrValue>);

impl Attrs {
    pub fn new() -> Self {
        Attrs(BTreeMap::new())
    }

    pub fn with(mut self, key: AttrKey, value: AttrValue) -> Self {
        self.0.insert(key, value);
        self
    }

    pub fn set(&mut self, key: AttrKey, value: AttrValue) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: AttrKey) -> Option<&AttrValue> {
        self.0.get(&key)
    }

    pub fn str(&self, key: AttrKey) -> Option<&str> {
        match self.0.get(&key) {
            Some(AttrValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<&Literal> {
        match self.0.get(&AttrKey::Literal) {
            Some(AttrValue::Literal(lit)) => Some(lit),
            _ => None,
        }
    }

    pub fn axes(&self, key: AttrKey) -> &[Axis] {
        match self.0.get(&key) {
            Some(AttrValue::Axes(axes)) => axes,
            _ => &[],
        }
    }

    pub fn shape(&self, key: AttrKey) -> Option<&Shape> {
        match self.0.get(&key) {
            Some(AttrValue::Shape(shape)) => Some(shape),
            _ => None,
        }
    }

    pub fn ref_mode(&self) -> Option<RefMode> {
        match self.0.get(&AttrKey::RefMode) {
            Some(AttrValue::RefMode(mode)) => Some(*mode),
            _ => None,
        }
    }

    pub fn keys(&self) -> &[String] {
        match self.0.get(&AttrKey::Keys) {
            Some(AttrValue::Keys(keys)) => keys,
            _ => &[],
        }
    }

    /// Zip aliases for argument `arg`.
    pub fn aliases(&self, arg: usize) -> &[(Axis, Axis)] {
        match self.0.get(&AttrKey::Align) {
            Some(AttrValue::Aliases(per_arg)) => per_arg.get(arg).map(Vec::as_slice).unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AttrKey, &AttrValue)> {
        self.0.iter()
    }
}

// ── Ops and declarations ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Op {
    pub id: OpId,
    pub kind: OpKind,
    pub args: Vec<OpId>,
    pub shape: Shape,
    pub attrs: Attrs,
}

impl Op {
    pub fn fn_id(&self) -> Option<&str> {
        self.attrs.str(AttrKey::Fn)
    }
}

/// One compiled declaration: its op arena and result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Declaration {
    pub name: String,
    pub kind: DeclKind,
    pub shape: Shape,
    pub ops: Vec<Op>,
    pub result: OpId,
}

impl Declaration {
    pub fn op(&self, id: OpId) -> Result<&Op> {
        self.ops
            .get(id.0 as usize)
            .ok_or_else(|| CompileError::internal(format!("{}: no op {}", self.name, id)))
    }

    pub fn result_op(&self) -> Result<&Op> {
        self.op(self.result)
    }

    pub fn has_reduction(&self) -> bool {
        self.ops.iter().any(|op| op.kind == OpKind::Reduce)
    }

    /// Names of declarations this one loads, first use first.
    pub fn references(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for op in &self.ops {
            if op.kind == OpKind::LoadDeclaration {
                if let Some(name) = op.attrs.str(AttrKey::Decl) {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.id, self.kind.name())?;
        if let Some(fn_id) = self.fn_id() {
            write!(f, " {}", fn_id)?;
        }
        if !self.args.is_empty() {
            let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
            write!(f, "({})", args.join(", "))?;
        }
        for (key, value) in self.attrs.iter() {
            match key {
                AttrKey::Fn => {}
                AttrKey::Literal | AttrKey::Path | AttrKey::Decl => write!(f, " {}", value)?,
                AttrKey::Reduced => write!(f, " over {}", value)?,
                AttrKey::UseSite => write!(f, " @{}", value)?,
                AttrKey::RefMode => write!(f, " {}", value)?,
                AttrKey::Keys => write!(f, " {{{}}}", value)?,
                AttrKey::Align => write!(f, " align {}", value)?,
            }
        }
        write!(f, " : {}", self.shape)
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} : {}", self.kind, self.name, self.shape)?;
        for op in &self.ops {
            writeln!(f, "  {}", op)?;
        }
        writeln!(f, "  result {}", self.result)
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

type InternKey = (OpKind, Vec<OpId>, Shape, Attrs);

/// Accumulates a declaration's ops, interning identical ones.
#[derive(Debug)]
pub struct DeclarationBuilder {
    name: String,
    kind: DeclKind,
    ops: Vec<Op>,
    interned: HashMap<InternKey, OpId>,
}

impl DeclarationBuilder {
    pub fn new(name: &str, kind: DeclKind) -> Self {
        DeclarationBuilder {
            name: name.to_string(),
            kind,
            ops: Vec::new(),
            interned: HashMap::new(),
        }
    }

    /// Add an op, or return the id of an identical one already present.
    pub fn push(&mut self, kind: OpKind, args: Vec<OpId>, shape: Shape, attrs: Attrs) -> Result<OpId> {
        if let Some(bad) = args.iter().find(|a| a.0 as usize >= self.ops.len()) {
            return Err(CompileError::internal(format!(
                "{}: {} op references missing operand {}",
                self.name,
                kind.name(),
                bad
            )));
        }
        let key = (kind, args, shape, attrs);
        if let Some(&id) = self.interned.get(&key) {
            return Ok(id);
        }
        let id = OpId(self.ops.len() as u32);
        let (kind, args, shape, attrs) = key.clone();
        self.ops.push(Op {
            id,
            kind,
            args,
            shape,
            attrs,
        });
        self.interned.insert(key, id);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn finish(self, result: OpId) -> Result<Declaration> {
        let shape = self
            .ops
            .get(result.0 as usize)
            .map(|op| op.shape.clone())
            .ok_or_else(|| {
                CompileError::internal(format!("{}: result {} out of range", self.name, result))
            })?;
        Ok(Declaration {
            name: self.name,
            kind: self.kind,
            shape,
            ops: self.ops,
            result,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
