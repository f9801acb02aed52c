// lir.rs — Loop programs: the physical nested-loop IR
//
// A `LoopProgram` is the ordered instruction list a declaration compiles to:
// loop open/close pairs over input collections, pure value instructions in
// registers, accumulator reset/add/load, and a final yield of the value with
// its index tuple. This module defines the IR, its tree view (used by
// fusion), verification, and the emitter that turns a linked `Declaration`
// into a loop program.
//
// Preconditions (emitter): the declaration's references are linked; inline
//   producers are present in `EmitCtx::declarations`.
// Postconditions: open/close nest like parentheses; every instruction's
//   depth equals the number of loops open around it; every register is
//   defined before use in an enclosing scope.
// Failure modes: `Internal` for unbalanced nesting, unknown axes, missing
//   producers, or axes whose parent collection is not in scope.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::ast::{DeclKind, Literal};
use crate::axis::AxisCatalog;
use crate::error::{CompileError, Result};
use crate::id::{AccId, IdAllocator, OpId, Reg};
use crate::ir::{AttrKey, Declaration, OpKind, RefMode};
use crate::pass::StageCert;
use crate::registry::Registry;
use crate::shape::{Axis, Shape};

// ── Instructions ────────────────────────────────────────────────────────────

/// The collection a loop iterates: an array field reached from the element
/// of the parent axis (or from the document root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LoopSource {
    pub axis: Axis,
    /// Dotted path of the array field.
    pub collection: String,
    pub parent: Option<Reg>,
    pub keys: Vec<String>,
}

impl LoopSource {
    /// Same collection reached from the same place.
    pub fn same_collection(&self, other: &LoopSource) -> bool {
        self.collection == other.collection && self.parent == other.parent && self.keys == other.keys
    }
}

impl fmt::Display for LoopSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(reg) => write!(f, "{}.{}", reg, self.keys.join(".")),
            None => write!(f, "input.{}", self.keys.join(".")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstrKind {
    OpenLoop {
        source: LoopSource,
        element: Reg,
        index: Reg,
    },
    CloseLoop {
        axis: Axis,
    },
    Const {
        dst: Reg,
        value: Literal,
    },
    /// Read `keys` from `base` (the document root when `None`).
    LoadInput {
        dst: Reg,
        base: Option<Reg>,
        keys: Vec<String>,
        path: String,
    },
    /// Element of `source` at a position taken from another loop (zip).
    ElemAt {
        dst: Reg,
        source: LoopSource,
        index: Reg,
    },
    Map {
        dst: Reg,
        fn_id: String,
        args: Vec<Reg>,
    },
    Select {
        dst: Reg,
        arms: Vec<(Reg, Reg)>,
        default: Reg,
    },
    MakeArray {
        dst: Reg,
        items: Vec<Reg>,
    },
    MakeObject {
        dst: Reg,
        fields: Vec<(String, Reg)>,
    },
    /// Read a materialized declaration result by index tuple.
    LoadIndexed {
        dst: Reg,
        decl: String,
        indices: Vec<Reg>,
    },
    AccReset {
        acc: AccId,
        fn_id: String,
        init: Option<Literal>,
    },
    AccAdd {
        acc: AccId,
        fn_id: String,
        args: Vec<Reg>,
    },
    AccLoad {
        dst: Reg,
        acc: AccId,
    },
    Yield {
        value: Reg,
        indices: Vec<Reg>,
    },
}

impl InstrKind {
    /// Registers read by this instruction.
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            InstrKind::OpenLoop { source, .. } => source.parent.into_iter().collect(),
            InstrKind::CloseLoop { .. }
            | InstrKind::Const { .. }
            | InstrKind::AccReset { .. }
            | InstrKind::AccLoad { .. } => Vec::new(),
            InstrKind::LoadInput { base, .. } => base.iter().copied().collect(),
            InstrKind::ElemAt { source, index, .. } => {
                source.parent.into_iter().chain([*index]).collect()
            }
            InstrKind::Map { args, .. } | InstrKind::AccAdd { args, .. } => args.clone(),
            InstrKind::Select { arms, default, .. } => arms
                .iter()
                .flat_map(|(c, v)| [*c, *v])
                .chain([*default])
                .collect(),
            InstrKind::MakeArray { items, .. } => items.clone(),
            InstrKind::MakeObject { fields, .. } => fields.iter().map(|(_, r)| *r).collect(),
            InstrKind::LoadIndexed { indices, .. } => indices.clone(),
            InstrKind::Yield { value, indices } => {
                std::iter::once(*value).chain(indices.iter().copied()).collect()
            }
        }
    }

    /// Registers written by this instruction.
    pub fn defs(&self) -> Vec<Reg> {
        match self {
            InstrKind::OpenLoop { element, index, .. } => vec![*element, *index],
            InstrKind::Const { dst, .. }
            | InstrKind::LoadInput { dst, .. }
            | InstrKind::ElemAt { dst, .. }
            | InstrKind::Map { dst, .. }
            | InstrKind::Select { dst, .. }
            | InstrKind::MakeArray { dst, .. }
            | InstrKind::MakeObject { dst, .. }
            | InstrKind::LoadIndexed { dst, .. }
            | InstrKind::AccLoad { dst, .. } => vec![*dst],
            InstrKind::CloseLoop { .. }
            | InstrKind::AccReset { .. }
            | InstrKind::AccAdd { .. }
            | InstrKind::Yield { .. } => Vec::new(),
        }
    }

    /// The single destination of a value instruction.
    pub fn dst(&self) -> Option<Reg> {
        match self {
            InstrKind::OpenLoop { .. } => None,
            _ => self.defs().first().copied(),
        }
    }

    /// Replace the destination of a value instruction.
    pub fn set_dst(&mut self, reg: Reg) {
        match self {
            InstrKind::Const { dst, .. }
            | InstrKind::LoadInput { dst, .. }
            | InstrKind::ElemAt { dst, .. }
            | InstrKind::Map { dst, .. }
            | InstrKind::Select { dst, .. }
            | InstrKind::MakeArray { dst, .. }
            | InstrKind::MakeObject { dst, .. }
            | InstrKind::LoadIndexed { dst, .. }
            | InstrKind::AccLoad { dst, .. } => *dst = reg,
            _ => {}
        }
    }

    /// Rewrite every register read through `map`.
    pub fn rename_uses(&mut self, map: &HashMap<Reg, Reg>) {
        let r = |reg: &mut Reg| {
            if let Some(new) = map.get(reg) {
                *reg = *new;
            }
        };
        match self {
            InstrKind::OpenLoop { source, .. } => source.parent.iter_mut().for_each(r),
            InstrKind::CloseLoop { .. }
            | InstrKind::Const { .. }
            | InstrKind::AccReset { .. }
            | InstrKind::AccLoad { .. } => {}
            InstrKind::LoadInput { base, .. } => base.iter_mut().for_each(r),
            InstrKind::ElemAt { source, index, .. } => {
                source.parent.iter_mut().for_each(r);
                r(index);
            }
            InstrKind::Map { args, .. } | InstrKind::AccAdd { args, .. } => args.iter_mut().for_each(r),
            InstrKind::Select { arms, default, .. } => {
                for (c, v) in arms.iter_mut() {
                    r(c);
                    r(v);
                }
                r(default);
            }
            InstrKind::MakeArray { items, .. } => items.iter_mut().for_each(r),
            InstrKind::MakeObject { fields, .. } => fields.iter_mut().for_each(|(_, reg)| r(reg)),
            InstrKind::LoadIndexed { indices, .. } => indices.iter_mut().for_each(r),
            InstrKind::Yield { value, indices } => {
                r(value);
                indices.iter_mut().for_each(r);
            }
        }
    }

    /// Accumulator touched by this instruction, if any.
    pub fn acc(&self) -> Option<AccId> {
        match self {
            InstrKind::AccReset { acc, .. }
            | InstrKind::AccAdd { acc, .. }
            | InstrKind::AccLoad { acc, .. } => Some(*acc),
            _ => None,
        }
    }

    /// Pure value instructions: free to move and to deduplicate.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            InstrKind::Const { .. }
                | InstrKind::LoadInput { .. }
                | InstrKind::ElemAt { .. }
                | InstrKind::Map { .. }
                | InstrKind::Select { .. }
                | InstrKind::MakeArray { .. }
                | InstrKind::MakeObject { .. }
                | InstrKind::LoadIndexed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instr {
    pub depth: usize,
    #[serde(flatten)]
    pub kind: InstrKind,
}

// ── Program state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramState {
    Empty,
    Building,
    Fused,
    Scheduled,
    Final,
}

impl ProgramState {
    /// Allowed transitions: forward one step, or re-running Fused/Scheduled.
    pub fn can_advance_to(self, next: ProgramState) -> bool {
        use ProgramState::*;
        matches!(
            (self, next),
            (Empty, Building)
                | (Building, Fused)
                | (Fused, Fused)
                | (Fused, Scheduled)
                | (Scheduled, Scheduled)
                | (Scheduled, Final)
        )
    }
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgramState::Empty => "empty",
            ProgramState::Building => "building",
            ProgramState::Fused => "fused",
            ProgramState::Scheduled => "scheduled",
            ProgramState::Final => "final",
        };
        f.write_str(name)
    }
}

// ── Loop program ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopProgram {
    pub declaration: String,
    pub kind: DeclKind,
    pub shape: Shape,
    pub instrs: Vec<Instr>,
    pub state: ProgramState,
}

impl LoopProgram {
    pub fn new(declaration: &str, kind: DeclKind, shape: Shape) -> Self {
        LoopProgram {
            declaration: declaration.to_string(),
            kind,
            shape,
            instrs: Vec::new(),
            state: ProgramState::Empty,
        }
    }

    pub fn advance(&mut self, next: ProgramState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(CompileError::internal(format!(
                "{}: illegal program state transition {} -> {}",
                self.declaration, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn tree(&self) -> Result<Vec<Node>> {
        to_tree(&self.instrs)
    }

    pub fn set_tree(&mut self, nodes: &[Node]) {
        self.instrs = flatten(nodes);
    }

    /// Register carried by the final yield.
    pub fn result(&self) -> Option<Reg> {
        self.instrs.iter().rev().find_map(|i| match i.kind {
            InstrKind::Yield { value, .. } => Some(value),
            _ => None,
        })
    }

    pub fn loop_count(&self) -> usize {
        self.instrs
            .iter()
            .filter(|i| matches!(i.kind, InstrKind::OpenLoop { .. }))
            .count()
    }

    /// Deepest loop nesting.
    pub fn max_depth(&self) -> usize {
        self.instrs
            .iter()
            .filter_map(|i| match i.kind {
                InstrKind::OpenLoop { .. } => Some(i.depth + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }
}

// ── Tree view ───────────────────────────────────────────────────────────────

/// Structured view of a program: loops own their bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Instr(InstrKind),
    Loop {
        source: LoopSource,
        element: Reg,
        index: Reg,
        body: Vec<Node>,
    },
}

/// Rebuild loop structure from a flat list.
pub fn to_tree(instrs: &[Instr]) -> Result<Vec<Node>> {
    let mut stack: Vec<(Option<(LoopSource, Reg, Reg)>, Vec<Node>)> = vec![(None, Vec::new())];
    for instr in instrs {
        match &instr.kind {
            InstrKind::OpenLoop {
                source,
                element,
                index,
            } => stack.push((Some((source.clone(), *element, *index)), Vec::new())),
            InstrKind::CloseLoop { axis } => {
                let (header, body) = stack
                    .pop()
                    .ok_or_else(|| CompileError::internal("loop stack underflow"))?;
                let Some((source, element, index)) = header else {
                    return Err(CompileError::internal(format!(
                        "close of loop '{}' without a matching open",
                        axis
                    )));
                };
                if source.axis != *axis {
                    return Err(CompileError::internal(format!(
                        "loop over '{}' closed as '{}'",
                        source.axis, axis
                    )));
                }
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| CompileError::internal("loop stack underflow"))?;
                parent.1.push(Node::Loop {
                    source,
                    element,
                    index,
                    body,
                });
            }
            other => {
                if let Some(top) = stack.last_mut() {
                    top.1.push(Node::Instr(other.clone()));
                }
            }
        }
    }
    if stack.len() != 1 {
        return Err(CompileError::internal(format!(
            "{} loop(s) left open",
            stack.len() - 1
        )));
    }
    Ok(stack.pop().map(|(_, body)| body).unwrap_or_default())
}

/// Flatten a tree, assigning depths from the nesting.
pub fn flatten(nodes: &[Node]) -> Vec<Instr> {
    let mut out = Vec::new();
    flatten_into(nodes, 0, &mut out);
    out
}

fn flatten_into(nodes: &[Node], depth: usize, out: &mut Vec<Instr>) {
    for node in nodes {
        match node {
            Node::Instr(kind) => out.push(Instr {
                depth,
                kind: kind.clone(),
            }),
            Node::Loop {
                source,
                element,
                index,
                body,
            } => {
                out.push(Instr {
                    depth,
                    kind: InstrKind::OpenLoop {
                        source: source.clone(),
                        element: *element,
                        index: *index,
                    },
                });
                flatten_into(body, depth + 1, out);
                out.push(Instr {
                    depth,
                    kind: InstrKind::CloseLoop {
                        axis: source.axis.clone(),
                    },
                });
            }
        }
    }
}

// ── Verification ────────────────────────────────────────────────────────────

/// Machine-checkable evidence for loop-program postconditions (L1-L3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LirCert {
    /// L1: open/close instructions nest like balanced parentheses.
    pub l1_balanced: bool,
    /// L2: every register and accumulator is defined before use, in scope.
    pub l2_operands_defined: bool,
    /// L3: every depth equals the number of loops open around it.
    pub l3_depths_consistent: bool,
}

impl StageCert for LirCert {
    fn all_pass(&self) -> bool {
        self.l1_balanced && self.l2_operands_defined && self.l3_depths_consistent
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("L1_balanced", self.l1_balanced),
            ("L2_operands_defined", self.l2_operands_defined),
            ("L3_depths_consistent", self.l3_depths_consistent),
        ]
    }
}

pub fn verify_program(program: &LoopProgram) -> LirCert {
    LirCert {
        l1_balanced: to_tree(&program.instrs).is_ok(),
        l2_operands_defined: verify_operands(&program.instrs),
        l3_depths_consistent: verify_depths(&program.instrs),
    }
}

fn verify_operands(instrs: &[Instr]) -> bool {
    let mut regs: Vec<Vec<Reg>> = vec![Vec::new()];
    let mut accs: Vec<Vec<AccId>> = vec![Vec::new()];
    let defined = |scopes: &[Vec<Reg>], r: &Reg| scopes.iter().any(|s| s.contains(r));
    for instr in instrs {
        if !instr.kind.uses().iter().all(|r| defined(&regs, r)) {
            return false;
        }
        match &instr.kind {
            InstrKind::OpenLoop { .. } => {
                regs.push(instr.kind.defs());
                accs.push(Vec::new());
            }
            InstrKind::CloseLoop { .. } => {
                if regs.len() < 2 {
                    return false;
                }
                regs.pop();
                accs.pop();
            }
            InstrKind::AccReset { acc, .. } => {
                if let Some(scope) = accs.last_mut() {
                    scope.push(*acc);
                }
            }
            InstrKind::AccAdd { acc, .. } | InstrKind::AccLoad { acc, .. } => {
                if !accs.iter().any(|s| s.contains(acc)) {
                    return false;
                }
                if let (Some(dst), Some(scope)) = (instr.kind.dst(), regs.last_mut()) {
                    scope.push(dst);
                }
            }
            other => {
                if let Some(scope) = regs.last_mut() {
                    scope.extend(other.defs());
                }
            }
        }
    }
    true
}

fn verify_depths(instrs: &[Instr]) -> bool {
    let mut level = 0usize;
    for instr in instrs {
        match instr.kind {
            InstrKind::OpenLoop { .. } => {
                if instr.depth != level {
                    return false;
                }
                level += 1;
            }
            InstrKind::CloseLoop { .. } => {
                if level == 0 {
                    return false;
                }
                level -= 1;
                if instr.depth != level {
                    return false;
                }
            }
            _ => {
                if instr.depth != level {
                    return false;
                }
            }
        }
    }
    level == 0
}

// ── Display ─────────────────────────────────────────────────────────────────

fn fmt_regs(regs: &[Reg]) -> String {
    regs.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for InstrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrKind::OpenLoop {
                source,
                element,
                index,
            } => write!(f, "loop {}: {}[{}] <- {}", source.axis, element, index, source),
            InstrKind::CloseLoop { axis } => write!(f, "end {}", axis),
            InstrKind::Const { dst, value } => write!(f, "{} = {}", dst, value),
            InstrKind::LoadInput { dst, base, keys, .. } => match (base, keys.is_empty()) {
                (Some(b), true) => write!(f, "{} = {}", dst, b),
                (Some(b), false) => write!(f, "{} = {}.{}", dst, b, keys.join(".")),
                (None, _) => write!(f, "{} = input.{}", dst, keys.join(".")),
            },
            InstrKind::ElemAt { dst, source, index } => write!(f, "{} = {}[{}]", dst, source, index),
            InstrKind::Map { dst, fn_id, args } => write!(f, "{} = {}({})", dst, fn_id, fmt_regs(args)),
            InstrKind::Select { dst, arms, default } => {
                write!(f, "{} = select(", dst)?;
                for (c, v) in arms {
                    write!(f, "{} ? {}, ", c, v)?;
                }
                write!(f, "else {})", default)
            }
            InstrKind::MakeArray { dst, items } => write!(f, "{} = [{}]", dst, fmt_regs(items)),
            InstrKind::MakeObject { dst, fields } => {
                let parts: Vec<String> = fields.iter().map(|(k, r)| format!("{}: {}", k, r)).collect();
                write!(f, "{} = {{{}}}", dst, parts.join(", "))
            }
            InstrKind::LoadIndexed { dst, decl, indices } => {
                write!(f, "{} = {}[{}]", dst, decl, fmt_regs(indices))
            }
            InstrKind::AccReset { acc, fn_id, init } => match init {
                Some(v) => write!(f, "{} = reset {} {}", acc, fn_id, v),
                None => write!(f, "{} = reset {}", acc, fn_id),
            },
            InstrKind::AccAdd { acc, fn_id, args } => write!(f, "{} += {}({})", acc, fn_id, fmt_regs(args)),
            InstrKind::AccLoad { dst, acc } => write!(f, "{} = {}", dst, acc),
            InstrKind::Yield { value, indices } => write!(f, "yield {} [{}]", value, fmt_regs(indices)),
        }
    }
}

impl fmt::Display for LoopProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} : {} ({})",
            self.kind, self.declaration, self.shape, self.state
        )?;
        for instr in &self.instrs {
            writeln!(f, "{}{}", "  ".repeat(instr.depth + 1), instr.kind)?;
        }
        Ok(())
    }
}

// ── Emitter ─────────────────────────────────────────────────────────────────

/// Read-only inputs to the emitter.
pub struct EmitCtx<'a> {
    pub catalog: &'a AxisCatalog,
    pub registry: &'a Registry,
    /// Linked declarations compiled so far (inline producers).
    pub declarations: &'a HashMap<String, Declaration>,
}

/// Emit the loop program of a linked declaration.
pub fn emit_program(decl: &Declaration, ctx: &EmitCtx<'_>) -> Result<LoopProgram> {
    let mut program = LoopProgram::new(&decl.name, decl.kind, decl.shape.clone());
    program.advance(ProgramState::Building)?;

    let mut emitter = Emitter {
        ctx,
        ids: IdAllocator::new(),
        frames: vec![Frame {
            uid: 0,
            header: None,
            body: Vec::new(),
        }],
        next_uid: 1,
        memo: HashMap::new(),
        elem_cache: HashMap::new(),
    };

    for axis in decl.shape.axes() {
        emitter.open_axis(axis, &[])?;
    }
    let value = emitter.emit_op(decl, decl.result, &[])?;
    let mut indices = Vec::with_capacity(decl.shape.rank());
    for axis in decl.shape.axes() {
        indices.push(emitter.resolve_axis(axis, &[])?.1);
    }
    emitter.push(InstrKind::Yield { value, indices })?;
    while emitter.frames.len() > 1 {
        emitter.close_frame()?;
    }
    let root = emitter
        .frames
        .pop()
        .ok_or_else(|| CompileError::internal("emitter lost its root frame"))?;
    program.set_tree(&root.body);
    Ok(program)
}

type Aliases = [(Axis, Axis)];
type MemoKey = (String, OpId, Vec<(Axis, Axis)>);

struct Frame {
    uid: u64,
    header: Option<(LoopSource, Reg, Reg)>,
    body: Vec<Node>,
}

impl Frame {
    fn axis(&self) -> Option<&Axis> {
        self.header.as_ref().map(|(s, _, _)| &s.axis)
    }
}

struct Emitter<'a> {
    ctx: &'a EmitCtx<'a>,
    ids: IdAllocator,
    frames: Vec<Frame>,
    next_uid: u64,
    /// Emitted op → (register, frame it was emitted in).
    memo: HashMap<MemoKey, (Reg, u64)>,
    /// Zip element lookups: (axis, index register) → (register, frame).
    elem_cache: HashMap<(Axis, Reg), (Reg, u64)>,
}

impl Emitter<'_> {
    fn live(&self, uid: u64) -> bool {
        self.frames.iter().any(|f| f.uid == uid)
    }

    fn innermost_uid(&self) -> u64 {
        self.frames.last().map(|f| f.uid).unwrap_or(0)
    }

    fn push(&mut self, kind: InstrKind) -> Result<()> {
        self.frames
            .last_mut()
            .ok_or_else(|| CompileError::internal("no open frame"))?
            .body
            .push(Node::Instr(kind));
        Ok(())
    }

    fn push_at(&mut self, frame: usize, kind: InstrKind) -> Result<()> {
        self.frames
            .get_mut(frame)
            .ok_or_else(|| CompileError::internal(format!("no frame {}", frame)))?
            .body
            .push(Node::Instr(kind));
        Ok(())
    }

    fn frame_of(&self, axis: &Axis) -> Option<usize> {
        self.frames.iter().rposition(|f| f.axis() == Some(axis))
    }

    /// Element and index registers for `axis`, following zip aliases.
    fn resolve_axis(&mut self, axis: &Axis, aliases: &Aliases) -> Result<(Reg, Reg)> {
        if let Some(i) = self.frame_of(axis) {
            if let Some((_, element, index)) = &self.frames[i].header {
                return Ok((*element, *index));
            }
        }
        let Some((_, target)) = aliases.iter().find(|(a, _)| a == axis) else {
            return Err(CompileError::internal(format!("axis '{}' is not in scope", axis)));
        };
        let target = target.clone();
        let (_, index) = self.resolve_axis(&target, &[])?;
        if let Some(&(reg, uid)) = self.elem_cache.get(&(axis.clone(), index)) {
            if self.live(uid) {
                return Ok((reg, index));
            }
        }
        let source = self.loop_source(axis, aliases)?;
        let dst = self.ids.alloc_reg();
        self.push(InstrKind::ElemAt { dst, source, index })?;
        let uid = self.innermost_uid();
        self.elem_cache.insert((axis.clone(), index), (dst, uid));
        Ok((dst, index))
    }

    fn loop_source(&mut self, axis: &Axis, aliases: &Aliases) -> Result<LoopSource> {
        let info = self
            .ctx
            .catalog
            .axis(axis)
            .ok_or_else(|| CompileError::internal(format!("unknown axis '{}'", axis)))?
            .clone();
        let parent = match &info.parent {
            Some(p) => Some(
                self.resolve_axis(p, aliases)
                    .map_err(|_| {
                        CompileError::internal(format!(
                            "axis '{}' needs its parent axis '{}' in scope",
                            axis, p
                        ))
                    })?
                    .0,
            ),
            None => None,
        };
        Ok(LoopSource {
            axis: info.axis,
            collection: info.collection,
            parent,
            keys: info.keys,
        })
    }

    fn open_axis(&mut self, axis: &Axis, aliases: &Aliases) -> Result<()> {
        let source = self.loop_source(axis, aliases)?;
        let element = self.ids.alloc_reg();
        let index = self.ids.alloc_reg();
        let uid = self.next_uid;
        self.next_uid += 1;
        self.frames.push(Frame {
            uid,
            header: Some((source, element, index)),
            body: Vec::new(),
        });
        Ok(())
    }

    fn close_frame(&mut self) -> Result<()> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| CompileError::internal("no frame to close"))?;
        let Some((source, element, index)) = frame.header else {
            return Err(CompileError::internal("attempt to close the root frame"));
        };
        let parent = self
            .frames
            .last_mut()
            .ok_or_else(|| CompileError::internal("loop frame without parent"))?;
        parent.body.push(Node::Loop {
            source,
            element,
            index,
            body: frame.body,
        });
        Ok(())
    }

    fn emit_op(&mut self, decl: &Declaration, id: OpId, aliases: &Aliases) -> Result<Reg> {
        let key: MemoKey = (decl.name.clone(), id, aliases.to_vec());
        if let Some(&(reg, uid)) = self.memo.get(&key) {
            if self.live(uid) {
                return Ok(reg);
            }
        }
        let op = decl.op(id)?.clone();

        let (reg, uid) = match op.kind {
            OpKind::Reduce => self.emit_reduce(decl, id, aliases)?,
            OpKind::LoadDeclaration => {
                let name = op
                    .attrs
                    .str(AttrKey::Decl)
                    .ok_or_else(|| CompileError::internal(format!("{}: {} names no declaration", decl.name, id)))?
                    .to_string();
                match op.attrs.ref_mode() {
                    Some(RefMode::Inline) => {
                        let ctx = self.ctx;
                        let producer = ctx.declarations.get(&name).ok_or_else(|| {
                            CompileError::internal(format!("inline producer '{}' is not compiled", name))
                        })?;
                        let reg = self.emit_op(producer, producer.result, aliases)?;
                        (reg, self.innermost_uid())
                    }
                    Some(RefMode::Indexed) => {
                        let mut indices = Vec::with_capacity(op.shape.rank());
                        for axis in op.shape.axes() {
                            indices.push(self.resolve_axis(axis, aliases)?.1);
                        }
                        let dst = self.ids.alloc_reg();
                        self.push(InstrKind::LoadIndexed {
                            dst,
                            decl: name,
                            indices,
                        })?;
                        (dst, self.innermost_uid())
                    }
                    None => {
                        return Err(CompileError::internal(format!(
                            "{}: reference to '{}' was never linked",
                            decl.name, name
                        )))
                    }
                }
            }
            _ => {
                let mut args = Vec::with_capacity(op.args.len());
                for (i, arg) in op.args.iter().enumerate() {
                    let arg_aliases = extend_aliases(aliases, op.attrs.aliases(i));
                    args.push(self.emit_op(decl, *arg, &arg_aliases)?);
                }
                let dst = self.ids.alloc_reg();
                let kind = match op.kind {
                    OpKind::Const => InstrKind::Const {
                        dst,
                        value: op
                            .attrs
                            .literal()
                            .cloned()
                            .ok_or_else(|| CompileError::internal(format!("{}: {} has no literal", decl.name, id)))?,
                    },
                    OpKind::LoadInput => {
                        let path = op
                            .attrs
                            .str(AttrKey::Path)
                            .ok_or_else(|| CompileError::internal(format!("{}: {} has no path", decl.name, id)))?
                            .to_string();
                        let access = self.ctx.catalog.access(&path)?.clone();
                        let base = match &access.base {
                            Some(axis) => Some(self.resolve_axis(axis, aliases)?.0),
                            None => None,
                        };
                        InstrKind::LoadInput {
                            dst,
                            base,
                            keys: access.keys,
                            path,
                        }
                    }
                    OpKind::Map => InstrKind::Map {
                        dst,
                        fn_id: op.fn_id().unwrap_or_default().to_string(),
                        args,
                    },
                    OpKind::Select => {
                        let default = *args
                            .last()
                            .ok_or_else(|| CompileError::internal(format!("{}: select without default", decl.name)))?;
                        let arms = args[..args.len() - 1]
                            .chunks(2)
                            .filter_map(|pair| match pair {
                                [c, v] => Some((*c, *v)),
                                _ => None,
                            })
                            .collect();
                        InstrKind::Select { dst, arms, default }
                    }
                    OpKind::MakeArray => InstrKind::MakeArray { dst, items: args },
                    OpKind::MakeObject => InstrKind::MakeObject {
                        dst,
                        fields: op.attrs.keys().iter().cloned().zip(args).collect(),
                    },
                    OpKind::Reduce | OpKind::LoadDeclaration => {
                        return Err(CompileError::internal("unreachable op kind"));
                    }
                };
                self.push(kind)?;
                (dst, self.innermost_uid())
            }
        };

        self.memo.insert(key, (reg, uid));
        Ok(reg)
    }

    /// Accumulate a reduction in fresh loops over the consumed axes, placed
    /// in the innermost frame that still covers the result's axes.
    fn emit_reduce(&mut self, decl: &Declaration, id: OpId, aliases: &Aliases) -> Result<(Reg, u64)> {
        let op = decl.op(id)?.clone();
        let fn_id = op.fn_id().unwrap_or_default().to_string();

        let mut home = 0usize;
        for axis in op.shape.axes() {
            let target = match self.frame_of(axis) {
                Some(i) => i,
                None => aliases
                    .iter()
                    .find(|(a, _)| a == axis)
                    .and_then(|(_, t)| self.frame_of(t))
                    .ok_or_else(|| {
                        CompileError::internal(format!("{}: reduce result axis '{}' not in scope", decl.name, axis))
                    })?,
            };
            home = home.max(target);
        }

        let parked = self.frames.split_off(home + 1);

        let acc = self.ids.alloc_acc();
        let init = self
            .ctx
            .registry
            .lookup(&fn_id)
            .and_then(|e| e.reduce.as_ref())
            .and_then(|r| r.identity.clone());
        self.push_at(home, InstrKind::AccReset {
            acc,
            fn_id: fn_id.clone(),
            init,
        })?;

        let mut all_aliases = aliases.to_vec();
        for i in 0..op.args.len() {
            all_aliases.extend(op.attrs.aliases(i).iter().cloned());
        }
        let mut space: Vec<Axis> = Vec::new();
        for arg in &op.args {
            for axis in decl.op(*arg)?.shape.axes() {
                if !space.contains(axis) {
                    space.push(axis.clone());
                }
            }
        }
        let base = self.frames.len();
        for axis in &space {
            let aliased = all_aliases.iter().any(|(a, _)| a == axis);
            if self.frame_of(axis).is_none() && !aliased {
                self.open_axis(axis, aliases)?;
            }
        }

        let mut args = Vec::with_capacity(op.args.len());
        for (i, arg) in op.args.iter().enumerate() {
            let arg_aliases = extend_aliases(aliases, op.attrs.aliases(i));
            args.push(self.emit_op(decl, *arg, &arg_aliases)?);
        }
        self.push(InstrKind::AccAdd {
            acc,
            fn_id,
            args,
        })?;
        while self.frames.len() > base {
            self.close_frame()?;
        }

        let dst = self.ids.alloc_reg();
        self.push_at(home, InstrKind::AccLoad { dst, acc })?;
        let uid = self.frames[home].uid;
        self.frames.extend(parked);
        Ok((dst, uid))
    }
}

fn extend_aliases(base: &Aliases, extra: &[(Axis, Axis)]) -> Vec<(Axis, Axis)> {
    let mut out = base.to_vec();
    for pair in extra {
        if !out.contains(pair) {
            out.push(pair.clone());
        }
    }
    out
}

// ── Tests ───────────────────────────────────────────────────────────────────
