// eval.rs — Reference interpreter for loop programs over JSON documents
//
// Executes loop programs directly against a `serde_json::Value` input. Used by
// `--emit run`, by the pipeline-equivalence tests (optimized and unoptimized
// programs must agree), and as the executable meaning of a renderer.
//
// Preconditions: programs are at least `Building` and balanced; programs are
//   run in dependency order so indexed references find their producers.
// Postconditions: each result is nested arrays following the declaration's
//   axes (scalars for rank 0). Empty collections produce empty arrays.
// Failure modes: `EvalError` for data that does not fit the schema (a
//   non-array where an axis is expected, zipped collections of different
//   lengths, reducer type mismatches). Elementwise kernels are total: an
//   operand of the wrong type yields null, so hoisting one out of a loop
//   that never runs cannot introduce an error.
// Side effects: none.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde_json::{Number, Value};
use thiserror::Error;

use crate::id::{AccId, Reg};
use crate::lir::{to_tree, InstrKind, LoopProgram, LoopSource, Node, ProgramState};
use crate::pipeline::CompiledSchema;
use crate::shape::Axis;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("'{path}' is not an array (found {found})")]
    NotAnArray { path: String, found: &'static str },

    #[error("zipped collection '{path}' has {len} element(s), needed index {index}")]
    ZipLength { path: String, index: usize, len: usize },

    #[error("index {index} out of range reading '{decl}'")]
    BadIndex { decl: String, index: usize },

    #[error("no kernel for function '{0}'")]
    UnknownKernel(String),

    #[error("{fn_id}: {detail}")]
    TypeMismatch { fn_id: String, detail: String },

    #[error("{fn_id}: expected {want} argument(s), got {got}")]
    Arity { fn_id: String, want: usize, got: usize },

    #[error("result of '{0}' is not available")]
    MissingResult(String),

    #[error("malformed program: {0}")]
    Malformed(String),

    #[error("in '{decl}': {source}")]
    InDeclaration {
        decl: String,
        #[source]
        source: Box<EvalError>,
    },
}

type EvalResult<T> = std::result::Result<T, EvalError>;

// ── Entry points ───────────────────────────────────────────────────────────

/// Run every compiled program in dependency order.
pub fn evaluate_schema(compiled: &CompiledSchema, input: &Value) -> EvalResult<BTreeMap<String, Value>> {
    let mut results = BTreeMap::new();
    for program in compiled.programs() {
        let value = run_program(program, input, &results)?;
        results.insert(program.declaration.clone(), value);
    }
    Ok(results)
}

/// Run one program. `results` holds the values of earlier declarations.
pub fn run_program(program: &LoopProgram, input: &Value, results: &BTreeMap<String, Value>) -> EvalResult<Value> {
    let wrap = |source: EvalError| EvalError::InDeclaration {
        decl: program.declaration.clone(),
        source: Box::new(source),
    };
    if program.state == ProgramState::Empty {
        return Err(wrap(EvalError::Malformed("program was never emitted".into())));
    }
    let tree = to_tree(&program.instrs).map_err(|e| wrap(EvalError::Malformed(e.to_string())))?;
    let out = if program.shape.is_scalar() {
        Value::Null
    } else {
        Value::Array(Vec::new())
    };
    let mut machine = Machine {
        input,
        results,
        axes: program.shape.axes(),
        regs: HashMap::new(),
        accs: HashMap::new(),
        open: Vec::new(),
        out,
    };
    machine.exec(&tree).map_err(wrap)?;
    Ok(machine.out)
}

// ── Machine ────────────────────────────────────────────────────────────────

struct Machine<'a> {
    input: &'a Value,
    results: &'a BTreeMap<String, Value>,
    axes: &'a [Axis],
    regs: HashMap<Reg, Value>,
    /// `None` until the first step of a reducer without identity.
    accs: HashMap<AccId, Option<Value>>,
    /// Axis and position of every open loop, outermost first.
    open: Vec<(Axis, usize)>,
    out: Value,
}

impl Machine<'_> {
    fn exec(&mut self, nodes: &[Node]) -> EvalResult<()> {
        for node in nodes {
            match node {
                Node::Instr(kind) => self.step(kind)?,
                Node::Loop {
                    source,
                    element,
                    index,
                    body,
                } => {
                    let items = self.collection(source)?;
                    self.ensure_container(&source.axis)?;
                    for (i, item) in items.into_iter().enumerate() {
                        self.regs.insert(*element, item);
                        self.regs.insert(*index, Value::from(i));
                        self.open.push((source.axis.clone(), i));
                        let run = self.exec(body);
                        self.open.pop();
                        run?;
                    }
                }
            }
        }
        Ok(())
    }

    fn reg(&self, reg: Reg) -> EvalResult<&Value> {
        self.regs
            .get(&reg)
            .ok_or_else(|| EvalError::Malformed(format!("{} read before it was written", reg)))
    }

    fn regs_of(&self, regs: &[Reg]) -> EvalResult<Vec<Value>> {
        regs.iter().map(|r| self.reg(*r).cloned()).collect()
    }

    fn index(&self, reg: Reg) -> EvalResult<usize> {
        let value = self.reg(reg)?;
        value
            .as_u64()
            .map(|i| i as usize)
            .ok_or_else(|| EvalError::Malformed(format!("{} holds {} where an index was expected", reg, value)))
    }

    fn base(&self, base: Option<Reg>) -> EvalResult<&Value> {
        match base {
            Some(reg) => self.reg(reg),
            None => Ok(self.input),
        }
    }

    /// Elements of a loop source; a missing or null collection is empty.
    fn collection(&self, source: &LoopSource) -> EvalResult<Vec<Value>> {
        match walk(self.base(source.parent)?, &source.keys) {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items.clone()),
            other => Err(EvalError::NotAnArray {
                path: source.collection.clone(),
                found: type_name(other),
            }),
        }
    }

    /// Opening declaration axis `k` materializes the (possibly empty) array
    /// at the current outer position.
    fn ensure_container(&mut self, axis: &Axis) -> EvalResult<()> {
        let Some(k) = self.axes.iter().position(|a| a == axis) else {
            return Ok(());
        };
        if k == 0 {
            return Ok(());
        }
        let mut path = Vec::with_capacity(k);
        for outer in &self.axes[..k] {
            match self.open.iter().rev().find(|(a, _)| a == outer) {
                Some((_, i)) => path.push(*i),
                None => return Ok(()),
            }
        }
        let slot = slot_mut(&mut self.out, &path);
        if slot.is_null() {
            *slot = Value::Array(Vec::new());
        }
        Ok(())
    }

    fn step(&mut self, kind: &InstrKind) -> EvalResult<()> {
        match kind {
            InstrKind::OpenLoop { .. } | InstrKind::CloseLoop { .. } => {
                Err(EvalError::Malformed("loop marker outside the tree view".into()))
            }
            InstrKind::Const { dst, value } => {
                self.regs.insert(*dst, value.to_json());
                Ok(())
            }
            InstrKind::LoadInput { dst, base, keys, .. } => {
                let value = walk(self.base(*base)?, keys).clone();
                self.regs.insert(*dst, value);
                Ok(())
            }
            InstrKind::ElemAt { dst, source, index } => {
                let i = self.index(*index)?;
                let items = self.collection(source)?;
                let len = items.len();
                let value = items.into_iter().nth(i).ok_or_else(|| EvalError::ZipLength {
                    path: source.collection.clone(),
                    index: i,
                    len,
                })?;
                self.regs.insert(*dst, value);
                Ok(())
            }
            InstrKind::Map { dst, fn_id, args } => {
                let args = self.regs_of(args)?;
                let value = apply(fn_id, &args)?;
                self.regs.insert(*dst, value);
                Ok(())
            }
            InstrKind::Select { dst, arms, default } => {
                let mut chosen = *default;
                for (cond, value) in arms {
                    if matches!(self.reg(*cond)?, Value::Bool(true)) {
                        chosen = *value;
                        break;
                    }
                }
                let value = self.reg(chosen)?.clone();
                self.regs.insert(*dst, value);
                Ok(())
            }
            InstrKind::MakeArray { dst, items } => {
                let items = self.regs_of(items)?;
                self.regs.insert(*dst, Value::Array(items));
                Ok(())
            }
            InstrKind::MakeObject { dst, fields } => {
                let mut object = serde_json::Map::new();
                for (key, reg) in fields {
                    object.insert(key.clone(), self.reg(*reg)?.clone());
                }
                self.regs.insert(*dst, Value::Object(object));
                Ok(())
            }
            InstrKind::LoadIndexed { dst, decl, indices } => {
                let mut value = self
                    .results
                    .get(decl)
                    .ok_or_else(|| EvalError::MissingResult(decl.clone()))?;
                for reg in indices {
                    let i = self.index(*reg)?;
                    value = value.get(i).ok_or_else(|| EvalError::BadIndex {
                        decl: decl.clone(),
                        index: i,
                    })?;
                }
                let value = value.clone();
                self.regs.insert(*dst, value);
                Ok(())
            }
            InstrKind::AccReset { acc, init, .. } => {
                self.accs.insert(*acc, init.as_ref().map(|l| l.to_json()));
                Ok(())
            }
            InstrKind::AccAdd { acc, fn_id, args } => {
                let args = self.regs_of(args)?;
                let current = self
                    .accs
                    .remove(acc)
                    .ok_or_else(|| EvalError::Malformed(format!("{} stepped before reset", acc)))?;
                let next = accumulate(fn_id, current, &args)?;
                self.accs.insert(*acc, next);
                Ok(())
            }
            InstrKind::AccLoad { dst, acc } => {
                let value = self
                    .accs
                    .get(acc)
                    .ok_or_else(|| EvalError::Malformed(format!("{} loaded before reset", acc)))?
                    .clone()
                    .unwrap_or(Value::Null);
                self.regs.insert(*dst, value);
                Ok(())
            }
            InstrKind::Yield { value, indices } => {
                let value = self.reg(*value)?.clone();
                let path = indices
                    .iter()
                    .map(|r| self.index(*r))
                    .collect::<EvalResult<Vec<_>>>()?;
                *slot_mut(&mut self.out, &path) = value;
                Ok(())
            }
        }
    }
}

/// Follow object keys; anything missing reads as null.
fn walk<'v>(mut value: &'v Value, keys: &[String]) -> &'v Value {
    static NULL: Value = Value::Null;
    for key in keys {
        value = value.get(key).unwrap_or(&NULL);
    }
    value
}

/// Slot at `path` inside nested arrays, growing them with nulls as needed.
fn slot_mut<'v>(value: &'v mut Value, path: &[usize]) -> &'v mut Value {
    let Some((&i, rest)) = path.split_first() else {
        return value;
    };
    if !value.is_array() {
        *value = Value::Array(Vec::new());
    }
    match value {
        Value::Array(items) => {
            if items.len() <= i {
                items.resize(i + 1, Value::Null);
            }
            slot_mut(&mut items[i], rest)
        }
        other => other,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ── Kernels ────────────────────────────────────────────────────────────────

fn mismatch(fn_id: &str, args: &[Value]) -> EvalError {
    let kinds: Vec<&str> = args.iter().map(type_name).collect();
    EvalError::TypeMismatch {
        fn_id: fn_id.to_string(),
        detail: format!("unsupported operand types ({})", kinds.join(", ")),
    }
}

fn truthy(fn_id: &str, value: &Value) -> EvalResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(mismatch(fn_id, std::slice::from_ref(other))),
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        let Value::Number(n) = value else {
            return None;
        };
        match n.as_i64() {
            Some(i) => Some(Num::Int(i)),
            None => n.as_f64().map(Num::Float),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

/// Integer arithmetic when both sides are integers and the result fits,
/// float arithmetic otherwise.
fn arith(
    fn_id: &str,
    args: &[Value],
    int: impl Fn(i64, i64) -> Option<i64>,
    flt: impl Fn(f64, f64) -> f64,
) -> EvalResult<Value> {
    let [a, b] = args else {
        return Err(arity(fn_id, 2, args.len()));
    };
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    match (Num::of(a), Num::of(b)) {
        (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(int(x, y)
            .map(Value::from)
            .unwrap_or_else(|| float(flt(x as f64, y as f64)))),
        (Some(x), Some(y)) => Ok(float(flt(x.as_f64(), y.as_f64()))),
        _ => Err(mismatch(fn_id, args)),
    }
}

fn arity(fn_id: &str, want: usize, got: usize) -> EvalError {
    EvalError::Arity {
        fn_id: fn_id.to_string(),
        want,
        got,
    }
}

/// Order numbers with numbers and strings with strings.
fn compare(fn_id: &str, a: &Value, b: &Value) -> EvalResult<Option<Ordering>> {
    if a.is_null() || b.is_null() {
        return Ok(None);
    }
    match (Num::of(a), Num::of(b), a, b) {
        (Some(Num::Int(x)), Some(Num::Int(y)), _, _) => Ok(Some(x.cmp(&y))),
        (Some(x), Some(y), _, _) => Ok(x.as_f64().partial_cmp(&y.as_f64())),
        (_, _, Value::String(x), Value::String(y)) => Ok(Some(x.cmp(y))),
        _ => Err(mismatch(fn_id, &[a.clone(), b.clone()])),
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    match (Num::of(a), Num::of(b)) {
        (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn unary<'v>(fn_id: &str, args: &'v [Value]) -> EvalResult<&'v Value> {
    match args {
        [a] => Ok(a),
        _ => Err(arity(fn_id, 1, args.len())),
    }
}

fn binary<'v>(fn_id: &str, args: &'v [Value]) -> EvalResult<(&'v Value, &'v Value)> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(arity(fn_id, 2, args.len())),
    }
}

fn ordered(fn_id: &str, args: &[Value], accept: fn(Ordering) -> bool) -> EvalResult<Value> {
    let (a, b) = binary(fn_id, args)?;
    Ok(match compare(fn_id, a, b)? {
        Some(ord) => Value::Bool(accept(ord)),
        None => Value::Null,
    })
}

fn rounding(fn_id: &str, args: &[Value], op: fn(f64) -> f64) -> EvalResult<Value> {
    let a = unary(fn_id, args)?;
    match Num::of(a) {
        _ if a.is_null() => Ok(Value::Null),
        Some(Num::Int(i)) => Ok(Value::from(i)),
        Some(Num::Float(f)) => {
            let r = op(f);
            if r.is_finite() && r.abs() < i64::MAX as f64 {
                Ok(Value::from(r as i64))
            } else {
                Ok(float(r))
            }
        }
        None => Err(mismatch(fn_id, args)),
    }
}

/// Apply an elementwise kernel. Operands of the wrong type give null.
pub fn apply(fn_id: &str, args: &[Value]) -> EvalResult<Value> {
    match kernel(fn_id, args) {
        Err(EvalError::TypeMismatch { .. }) => Ok(Value::Null),
        other => other,
    }
}

fn kernel(fn_id: &str, args: &[Value]) -> EvalResult<Value> {
    match fn_id {
        "add" | "zip_add" | "outer_add" => arith(fn_id, args, i64::checked_add, |x, y| x + y),
        "sub" => arith(fn_id, args, i64::checked_sub, |x, y| x - y),
        "mul" | "zip_mul" | "outer_mul" => arith(fn_id, args, i64::checked_mul, |x, y| x * y),
        "div" => {
            let (_, b) = binary(fn_id, args)?;
            if Num::of(b).is_some_and(|n| n.as_f64() == 0.0) {
                return Ok(Value::Null);
            }
            arith(fn_id, args, |_, _| None, |x, y| x / y)
        }
        "mod" => {
            let (_, b) = binary(fn_id, args)?;
            if Num::of(b).is_some_and(|n| n.as_f64() == 0.0) {
                return Ok(Value::Null);
            }
            arith(fn_id, args, i64::checked_rem_euclid, f64::rem_euclid)
        }
        "pow" => arith(
            fn_id,
            args,
            |x, y| u32::try_from(y).ok().and_then(|y| x.checked_pow(y)),
            f64::powf,
        ),
        "min2" => {
            let (a, b) = binary(fn_id, args)?;
            Ok(match compare(fn_id, a, b)? {
                Some(Ordering::Greater) => b.clone(),
                Some(_) => a.clone(),
                None => Value::Null,
            })
        }
        "max2" => {
            let (a, b) = binary(fn_id, args)?;
            Ok(match compare(fn_id, a, b)? {
                Some(Ordering::Less) => b.clone(),
                Some(_) => a.clone(),
                None => Value::Null,
            })
        }
        "eq" => {
            let (a, b) = binary(fn_id, args)?;
            Ok(Value::Bool(equal(a, b)))
        }
        "ne" => {
            let (a, b) = binary(fn_id, args)?;
            Ok(Value::Bool(!equal(a, b)))
        }
        "lt" => ordered(fn_id, args, Ordering::is_lt),
        "le" => ordered(fn_id, args, Ordering::is_le),
        "gt" => ordered(fn_id, args, Ordering::is_gt),
        "ge" => ordered(fn_id, args, Ordering::is_ge),
        "and" => {
            let (a, b) = binary(fn_id, args)?;
            Ok(Value::Bool(truthy(fn_id, a)? && truthy(fn_id, b)?))
        }
        "or" => {
            let (a, b) = binary(fn_id, args)?;
            Ok(Value::Bool(truthy(fn_id, a)? || truthy(fn_id, b)?))
        }
        "not" => Ok(Value::Bool(!truthy(fn_id, unary(fn_id, args)?)?)),
        "concat" => match binary(fn_id, args)? {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.iter().chain(b).cloned().collect())),
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            _ => Err(mismatch(fn_id, args)),
        },
        "neg" => match unary(fn_id, args)? {
            Value::Null => Ok(Value::Null),
            a => match Num::of(a) {
                Some(Num::Int(i)) => Ok(i.checked_neg().map(Value::from).unwrap_or_else(|| float(-(i as f64)))),
                Some(Num::Float(f)) => Ok(float(-f)),
                None => Err(mismatch(fn_id, args)),
            },
        },
        "abs" => match unary(fn_id, args)? {
            Value::Null => Ok(Value::Null),
            a => match Num::of(a) {
                Some(Num::Int(i)) => Ok(i.checked_abs().map(Value::from).unwrap_or_else(|| float((i as f64).abs()))),
                Some(Num::Float(f)) => Ok(float(f.abs())),
                None => Err(mismatch(fn_id, args)),
            },
        },
        "round" => rounding(fn_id, args, f64::round),
        "floor" => rounding(fn_id, args, f64::floor),
        "ceil" => rounding(fn_id, args, f64::ceil),
        "to_float" => match unary(fn_id, args)? {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(float(if *b { 1.0 } else { 0.0 })),
            Value::String(s) => Ok(s.trim().parse::<f64>().map(float).unwrap_or(Value::Null)),
            a => match Num::of(a) {
                Some(n) => Ok(float(n.as_f64())),
                None => Err(mismatch(fn_id, args)),
            },
        },
        "to_integer" => match unary(fn_id, args)? {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::from(i64::from(*b))),
            Value::String(s) => Ok(s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::Null)),
            a => match Num::of(a) {
                Some(Num::Int(i)) => Ok(Value::from(i)),
                Some(Num::Float(f)) if f.is_finite() => Ok(Value::from(f.trunc() as i64)),
                Some(Num::Float(_)) => Ok(Value::Null),
                None => Err(mismatch(fn_id, args)),
            },
        },
        "to_string" => match unary(fn_id, args)? {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Null => Ok(Value::Null),
            other => Ok(Value::String(other.to_string())),
        },
        other => Err(EvalError::UnknownKernel(other.to_string())),
    }
}

/// One accumulator step. `None` is the state of a reducer without identity
/// before its first element.
pub fn accumulate(fn_id: &str, acc: Option<Value>, args: &[Value]) -> EvalResult<Option<Value>> {
    match fn_id {
        "sum" => {
            let a = unary(fn_id, args)?;
            if a.is_null() {
                return Ok(acc);
            }
            let base = acc.unwrap_or_else(|| Value::from(0));
            arith(fn_id, &[base, a.clone()], i64::checked_add, |x, y| x + y).map(Some)
        }
        "count" => {
            let base = acc.unwrap_or_else(|| Value::from(0));
            arith(fn_id, &[base, Value::from(1)], i64::checked_add, |x, y| x + y).map(Some)
        }
        "max" | "min" => {
            let a = unary(fn_id, args)?;
            if a.is_null() {
                return Ok(acc);
            }
            let Some(current) = acc else {
                return Ok(Some(a.clone()));
            };
            let keep_new = match compare(fn_id, a, &current)? {
                Some(Ordering::Greater) => fn_id == "max",
                Some(Ordering::Less) => fn_id == "min",
                _ => false,
            };
            Ok(Some(if keep_new { a.clone() } else { current }))
        }
        "any" => {
            let a = truthy(fn_id, unary(fn_id, args)?)?;
            let current = acc.as_ref().map(|v| truthy(fn_id, v)).transpose()?.unwrap_or(false);
            Ok(Some(Value::Bool(current || a)))
        }
        "all" => {
            let a = truthy(fn_id, unary(fn_id, args)?)?;
            let current = acc.as_ref().map(|v| truthy(fn_id, v)).transpose()?.unwrap_or(true);
            Ok(Some(Value::Bool(current && a)))
        }
        "dot" => {
            let product = arith(fn_id, args, i64::checked_mul, |x, y| x * y)?;
            if product.is_null() {
                return Ok(acc);
            }
            let base = acc.unwrap_or_else(|| Value::from(0));
            arith(fn_id, &[base, product], i64::checked_add, |x, y| x + y).map(Some)
        }
        other => Err(EvalError::UnknownKernel(other.to_string())),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_arithmetic_stays_integral() {
        assert_eq!(apply("add", &[json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(apply("mul", &[json!(2), json!(1.5)]).unwrap(), json!(3.0));
        assert_eq!(apply("div", &[json!(7), json!(2)]).unwrap(), json!(3.5));
        assert_eq!(apply("mod", &[json!(-7), json!(3)]).unwrap(), json!(2));
        assert_eq!(apply("pow", &[json!(2), json!(10)]).unwrap(), json!(1024));
    }

    #[test]
    fn overflow_falls_back_to_float() {
        let v = apply("add", &[json!(i64::MAX), json!(1)]).unwrap();
        assert!(v.is_f64());
    }

    #[test]
    fn division_by_zero_is_null() {
        assert_eq!(apply("div", &[json!(1), json!(0)]).unwrap(), Value::Null);
        assert_eq!(apply("mod", &[json!(1), json!(0.0)]).unwrap(), Value::Null);
    }

    #[test]
    fn null_propagates_through_arithmetic() {
        assert_eq!(apply("sub", &[Value::Null, json!(1)]).unwrap(), Value::Null);
        assert_eq!(apply("lt", &[Value::Null, json!(1)]).unwrap(), Value::Null);
    }

    #[test]
    fn comparisons_mix_integers_and_floats() {
        assert_eq!(apply("eq", &[json!(1), json!(1.0)]).unwrap(), json!(true));
        assert_eq!(apply("lt", &[json!(1), json!(1.5)]).unwrap(), json!(true));
        assert_eq!(apply("ge", &[json!("b"), json!("a")]).unwrap(), json!(true));
        assert_eq!(apply("lt", &[json!("a"), json!(1)]).unwrap(), Value::Null);
    }

    #[test]
    fn wrong_operand_types_are_null() {
        assert_eq!(apply("add", &[json!("a"), json!(1)]).unwrap(), Value::Null);
        assert_eq!(apply("neg", &[json!([1])]).unwrap(), Value::Null);
        assert_eq!(apply("and", &[json!(1), json!(true)]).unwrap(), Value::Null);
        assert!(matches!(
            apply("add", &[json!(1)]),
            Err(EvalError::Arity { want: 2, got: 1, .. })
        ));
        assert!(matches!(
            accumulate("sum", None, &[json!("a")]),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn rounding_returns_integers() {
        assert_eq!(apply("round", &[json!(2.5)]).unwrap(), json!(3));
        assert_eq!(apply("floor", &[json!(-1.5)]).unwrap(), json!(-2));
        assert_eq!(apply("ceil", &[json!(4)]).unwrap(), json!(4));
    }

    #[test]
    fn conversions() {
        assert_eq!(apply("to_float", &[json!("2.5")]).unwrap(), json!(2.5));
        assert_eq!(apply("to_integer", &[json!(3.9)]).unwrap(), json!(3));
        assert_eq!(apply("to_string", &[json!(12)]).unwrap(), json!("12"));
        assert_eq!(apply("concat", &[json!("a"), json!("b")]).unwrap(), json!("ab"));
    }

    #[test]
    fn unknown_kernel() {
        assert_eq!(
            apply("frobnicate", &[]).unwrap_err(),
            EvalError::UnknownKernel("frobnicate".into())
        );
    }

    #[test]
    fn reducers_step() {
        let fold = |fn_id: &str, init: Option<Value>, xs: &[Value]| {
            xs.iter()
                .try_fold(init, |acc, x| accumulate(fn_id, acc, std::slice::from_ref(x)))
                .unwrap()
        };
        let xs = [json!(3), json!(1), json!(2)];
        assert_eq!(fold("sum", Some(json!(0)), &xs), Some(json!(6)));
        assert_eq!(fold("count", Some(json!(0)), &xs), Some(json!(3)));
        assert_eq!(fold("max", None, &xs), Some(json!(3)));
        assert_eq!(fold("min", None, &xs), Some(json!(1)));
        assert_eq!(fold("max", None, &[]), None);
        let bs = [json!(true), json!(false)];
        assert_eq!(fold("any", Some(json!(false)), &bs), Some(json!(true)));
        assert_eq!(fold("all", Some(json!(true)), &bs), Some(json!(false)));
    }

    #[test]
    fn dot_accumulates_products() {
        let acc = accumulate("dot", Some(json!(0)), &[json!(2), json!(3)]).unwrap();
        let acc = accumulate("dot", acc, &[json!(4), json!(5)]).unwrap();
        assert_eq!(acc, Some(json!(26)));
    }

    #[test]
    fn slot_grows_nested_arrays() {
        let mut out = Value::Array(Vec::new());
        *slot_mut(&mut out, &[1, 0]) = json!(5);
        assert_eq!(out, json!([null, [5]]));
    }

    #[test]
    fn walk_missing_key_is_null() {
        let doc = json!({"a": {"b": 1}});
        assert_eq!(walk(&doc, &["a".into(), "b".into()]), &json!(1));
        assert_eq!(walk(&doc, &["a".into(), "c".into()]), &Value::Null);
        assert_eq!(walk(&doc, &["x".into(), "y".into()]), &Value::Null);
    }
}
