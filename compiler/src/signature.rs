// signature.rs — SignatureResolver: function call → result shape
//
// Matches a call's argument shapes against the generalized signatures the
// registry lists for the function. Each argument splits into `outer ++ cell`,
// where the cell is matched right-to-left against that argument's dimension
// pattern. Outer prefixes must agree (an empty outer broadcasts), shared
// dimension variables must bind the same axis, and the result is the common
// outer followed by the bound output cell.
//
// Preconditions: argument shapes are valid (no duplicate axes).
// Postconditions: the chosen candidate has the fewest broadcast-extended
//   arguments (scalar stand-ins, shorter outers, omitted `|1` dimensions);
//   ties go to the first declared signature.
// Failure modes: `UnknownFunction`; `SignatureMatch` naming the function,
//   the shapes, and the most specific reason (outer mismatch first).
// Side effects: none.

use std::collections::BTreeMap;

use crate::error::{CompileError, Result};
use crate::registry::{DimVar, JoinPolicy, Registry, Signature};
use crate::shape::{Axis, Shape};

/// Outcome of resolving one call site.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    pub fn_id: String,
    /// Index of the chosen signature in the registry entry.
    pub signature_index: usize,
    /// Dimension variable → concrete axis.
    pub bindings: BTreeMap<String, Axis>,
    pub shape: Shape,
    /// Cell axes consumed by the call (absent from the result).
    pub dropped: Vec<Axis>,
    /// Number of arguments that needed scalar extension or outer broadcast.
    pub broadcasts: usize,
    pub join: Option<JoinPolicy>,
}

impl ResolvedCall {
    pub fn is_reduction(&self) -> bool {
        !self.dropped.is_empty()
    }
}

// ── Cell matching ───────────────────────────────────────────────────────────

/// One way of splitting an argument shape into `outer ++ cell`.
#[derive(Debug, Clone)]
struct CellMatch {
    outer: Shape,
    cell: Vec<Axis>,
    binds: Vec<(String, Axis)>,
    /// A scalar stood in for required dimensions, or a `|1` dimension was
    /// left out and broadcast.
    extended: bool,
}

fn cell_matches(shape: &Shape, pattern: &[DimVar]) -> Vec<CellMatch> {
    if shape.is_scalar() {
        return vec![CellMatch {
            outer: Shape::scalar(),
            cell: Vec::new(),
            binds: Vec::new(),
            extended: pattern.iter().any(|v| !v.optional),
        }];
    }
    let mut out = Vec::new();
    let mut binds = Vec::new();
    match_from_right(shape.axes(), pattern, &mut binds, false, &mut out);
    out
}

/// Enumerate matches, binding before skipping so the greediest match is
/// found first. Leaving out an optional dimension is free; leaving out a
/// `|1` dimension broadcasts it.
fn match_from_right(
    axes: &[Axis],
    pattern: &[DimVar],
    binds: &mut Vec<(String, Axis)>,
    broadcast: bool,
    out: &mut Vec<CellMatch>,
) {
    let Some((var, rest_pattern)) = pattern.split_last() else {
        // binds were pushed innermost first
        let cell = binds.iter().rev().map(|(_, a)| a.clone()).collect();
        out.push(CellMatch {
            outer: Shape::new(axes.to_vec()),
            cell,
            binds: binds.clone(),
            extended: broadcast,
        });
        return;
    };
    if let Some((last, rest_axes)) = axes.split_last() {
        binds.push((var.name.clone(), last.clone()));
        match_from_right(rest_axes, rest_pattern, binds, broadcast, out);
        binds.pop();
    }
    if var.may_be_absent() {
        let broadcast = broadcast || !var.optional;
        match_from_right(axes, rest_pattern, binds, broadcast, out);
    }
}

// ── Candidate evaluation ────────────────────────────────────────────────────

/// Why a candidate failed, ordered from least to most specific.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    Arity(String),
    Cell(String),
    Duplicate(String),
    Conflict(String),
    Outer(String),
}

impl Failure {
    fn rank(&self) -> u8 {
        match self {
            Failure::Arity(_) => 0,
            Failure::Cell(_) => 1,
            Failure::Duplicate(_) => 2,
            Failure::Conflict(_) => 3,
            Failure::Outer(_) => 4,
        }
    }

    fn into_reason(self) -> String {
        match self {
            Failure::Arity(r)
            | Failure::Cell(r)
            | Failure::Duplicate(r)
            | Failure::Conflict(r)
            | Failure::Outer(r) => r,
        }
    }
}

#[derive(Debug)]
struct Candidate {
    signature_index: usize,
    bindings: BTreeMap<String, Axis>,
    shape: Shape,
    dropped: Vec<Axis>,
    broadcasts: usize,
}

fn evaluate(index: usize, sig: &Signature, combo: &[&CellMatch]) -> std::result::Result<Candidate, Failure> {
    let mut bindings: BTreeMap<String, Axis> = BTreeMap::new();
    for cm in combo {
        for (var, axis) in &cm.binds {
            match bindings.get(var) {
                Some(bound) if bound != axis => {
                    return Err(Failure::Conflict(format!(
                        "dimension '{}' binds both '{}' and '{}'",
                        var, bound, axis
                    )));
                }
                Some(_) => {}
                None => {
                    bindings.insert(var.clone(), axis.clone());
                }
            }
        }
    }

    let mut common: Option<&Shape> = None;
    for cm in combo.iter().filter(|cm| !cm.outer.is_scalar()) {
        match common {
            None => common = Some(&cm.outer),
            Some(first) if *first != cm.outer => {
                return Err(Failure::Outer(format!(
                    "outer shapes {} and {} do not match",
                    first, cm.outer
                )));
            }
            Some(_) => {}
        }
    }
    let common = common.cloned().unwrap_or_default();

    let broadcasts = combo
        .iter()
        .filter(|cm| cm.extended || cm.outer.rank() < common.rank())
        .count();

    let mut axes = common.axes().to_vec();
    for var in &sig.output {
        if let Some(axis) = bindings.get(&var.name) {
            if axes.contains(axis) {
                return Err(Failure::Duplicate(format!(
                    "axis '{}' would appear twice in the result",
                    axis
                )));
            }
            axes.push(axis.clone());
        }
    }
    let shape = Shape::new(axes);

    let mut dropped: Vec<Axis> = Vec::new();
    for cm in combo {
        for axis in &cm.cell {
            if !shape.contains(axis) && !dropped.contains(axis) {
                dropped.push(axis.clone());
            }
        }
    }

    Ok(Candidate {
        signature_index: index,
        bindings,
        shape,
        dropped,
        broadcasts,
    })
}

/// All ways of picking one cell match per argument.
fn combinations(per_arg: &[Vec<CellMatch>]) -> Vec<Vec<&CellMatch>> {
    let mut combos: Vec<Vec<&CellMatch>> = vec![Vec::new()];
    for matches in per_arg {
        let mut next = Vec::with_capacity(combos.len() * matches.len());
        for prefix in &combos {
            for m in matches {
                let mut combo = prefix.clone();
                combo.push(m);
                next.push(combo);
            }
        }
        combos = next;
    }
    combos
}

fn fmt_pattern(pattern: &[DimVar]) -> String {
    let vars: Vec<String> = pattern.iter().map(|v| v.to_string()).collect();
    format!("({})", vars.join(","))
}

fn try_signature(
    index: usize,
    sig: &Signature,
    shapes: &[Shape],
) -> std::result::Result<Candidate, Failure> {
    if sig.arity() != shapes.len() {
        return Err(Failure::Arity(format!(
            "expects {} argument(s), got {}",
            sig.arity(),
            shapes.len()
        )));
    }

    let mut per_arg = Vec::with_capacity(shapes.len());
    for (i, (shape, pattern)) in shapes.iter().zip(&sig.inputs).enumerate() {
        let matches = cell_matches(shape, pattern);
        if matches.is_empty() {
            return Err(Failure::Cell(format!(
                "argument {} of shape {} does not fit cell pattern {}",
                i + 1,
                shape,
                fmt_pattern(pattern)
            )));
        }
        per_arg.push(matches);
    }

    let mut best: Option<Candidate> = None;
    let mut failure: Option<Failure> = None;
    for combo in combinations(&per_arg) {
        match evaluate(index, sig, &combo) {
            Ok(c) => {
                if best.as_ref().map_or(true, |b| c.broadcasts < b.broadcasts) {
                    best = Some(c);
                }
            }
            Err(f) => {
                if failure.as_ref().map_or(true, |prev| f.rank() > prev.rank()) {
                    failure = Some(f);
                }
            }
        }
    }
    match (best, failure) {
        (Some(c), _) => Ok(c),
        (None, Some(f)) => Err(f),
        (None, None) => Err(Failure::Cell("no cell split".to_string())),
    }
}

// ── Public API ──────────────────────────────────────────────────────────────

/// Resolve a call of `fn_id` with the given argument shapes.
pub fn resolve(registry: &Registry, fn_id: &str, arg_shapes: &[Shape]) -> Result<ResolvedCall> {
    let entry = registry
        .lookup(fn_id)
        .ok_or_else(|| CompileError::UnknownFunction {
            name: fn_id.to_string(),
        })?;

    let mut best: Option<Candidate> = None;
    let mut failure: Option<Failure> = None;
    for (index, sig) in entry.signatures.iter().enumerate() {
        match try_signature(index, sig, arg_shapes) {
            Ok(c) => {
                if best.as_ref().map_or(true, |b| c.broadcasts < b.broadcasts) {
                    best = Some(c);
                }
            }
            Err(f) => {
                if failure.as_ref().map_or(true, |prev| f.rank() > prev.rank()) {
                    failure = Some(f);
                }
            }
        }
    }

    match best {
        Some(c) => Ok(ResolvedCall {
            fn_id: fn_id.to_string(),
            signature_index: c.signature_index,
            bindings: c.bindings,
            shape: c.shape,
            dropped: c.dropped,
            broadcasts: c.broadcasts,
            join: entry.join_policy(),
        }),
        None => Err(CompileError::SignatureMatch {
            fn_id: fn_id.to_string(),
            shapes: arg_shapes.to_vec(),
            reason: failure
                .map(Failure::into_reason)
                .unwrap_or_else(|| "no signatures".to_string()),
        }),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn s(names: &[&str]) -> Shape {
        Shape::from_names(names.iter().copied())
    }

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.load_json_str(
            r#"{"functions":[
                {"id":"reduce_like","signatures":["(i)->()"],"reduce":{}},
                {"id":"zip_like","signatures":["(i),(i)->(i)"]},
                {"id":"exact_second","signatures":["(),(i)->(i)","(i),(i)->(i)"]},
                {"id":"elementwise","signatures":["(),()->()"]},
                {"id":"matvec","signatures":["(m?,n),(n)->(m?)"]},
                {"id":"sum","signatures":["(i)->()"],"reduce":{"identity":0}},
                {"id":"stretch","signatures":["(i,j|1)->(i)","(i)->(i)"]}
            ]}"#,
        )
        .unwrap();
        reg
    }

    #[test]
    fn reducer_lifts_over_outer_axes() {
        let call = resolve(
            &registry(),
            "reduce_like",
            &[s(&["companies", "employees", "projects"])],
        )
        .unwrap();
        assert_eq!(call.shape, s(&["companies", "employees"]));
        assert_eq!(call.dropped, vec![Axis::new("projects")]);
        assert!(call.is_reduction());
    }

    #[test]
    fn scalar_broadcasts_without_scalar_signature() {
        let call = resolve(
            &registry(),
            "zip_like",
            &[s(&["companies", "employees"]), Shape::scalar()],
        )
        .unwrap();
        assert_eq!(call.shape, s(&["companies", "employees"]));
        assert!(call.dropped.is_empty());
        assert_eq!(call.broadcasts, 1);
    }

    #[test]
    fn mismatched_outer_mentions_outer() {
        let err = resolve(
            &registry(),
            "zip_like",
            &[s(&["departments", "employees"]), s(&["projects", "employees"])],
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::SignatureMatch { .. }));
        let msg = err.to_string();
        assert!(msg.contains("outer"), "{msg}");
        assert!(msg.contains("zip_like"), "{msg}");
    }

    #[test]
    fn exact_match_beats_broadcast() {
        let call = resolve(
            &registry(),
            "exact_second",
            &[s(&["employees"]), s(&["employees"])],
        )
        .unwrap();
        assert_eq!(call.signature_index, 1);
        assert_eq!(call.broadcasts, 0);
        assert_eq!(call.shape, s(&["employees"]));
    }

    #[test]
    fn declared_scalar_pattern_beats_extension() {
        let call = resolve(&registry(), "exact_second", &[Shape::scalar(), s(&["e"])]).unwrap();
        assert_eq!(call.signature_index, 0);
        assert_eq!(call.shape, s(&["e"]));
    }

    #[test]
    fn elementwise_broadcasts_prefix_outer() {
        let call = resolve(&registry(), "elementwise", &[s(&["items"]), Shape::scalar()]).unwrap();
        assert_eq!(call.shape, s(&["items"]));
        assert_eq!(call.broadcasts, 1);

        let err = resolve(&registry(), "elementwise", &[s(&["a"]), s(&["a", "b"])]).unwrap_err();
        assert!(err.to_string().contains("outer"));
    }

    #[test]
    fn optional_dimension_may_be_absent() {
        let reg = registry();
        let mv = resolve(&reg, "matvec", &[s(&["r", "c"]), s(&["c"])]).unwrap();
        assert_eq!(mv.shape, s(&["r"]));
        assert_eq!(mv.dropped, vec![Axis::new("c")]);

        let vv = resolve(&reg, "matvec", &[s(&["c"]), s(&["c"])]).unwrap();
        assert_eq!(vv.shape, Shape::scalar());
        assert_eq!(vv.broadcasts, 0);
    }

    #[test]
    fn conflicting_bindings_fail() {
        let err = resolve(&registry(), "zip_like", &[s(&["a"]), s(&["b"])]).unwrap_err();
        assert!(err.to_string().contains("binds both"), "{err}");
    }

    #[test]
    fn arity_and_unknown_function() {
        let reg = registry();
        let err = resolve(&reg, "sum", &[s(&["a"]), s(&["a"])]).unwrap_err();
        assert!(err.to_string().contains("expects 1 argument"));
        let err = resolve(&reg, "nope", &[]).unwrap_err();
        assert_eq!(err, CompileError::UnknownFunction { name: "nope".into() });
    }

    #[test]
    fn reducer_on_scalar_drops_nothing() {
        let call = resolve(&registry(), "sum", &[Shape::scalar()]).unwrap();
        assert!(!call.is_reduction());
        assert_eq!(call.broadcasts, 1);
    }

    #[test]
    fn omitted_length_one_dimension_counts_as_broadcast() {
        let call = resolve(&registry(), "stretch", &[s(&["items"])]).unwrap();
        assert_eq!(call.signature_index, 1);
        assert_eq!(call.broadcasts, 0);

        let call = resolve(&registry(), "stretch", &[s(&["items", "parts"])]).unwrap();
        assert_eq!(call.signature_index, 0);
        assert_eq!(call.shape, s(&["items"]));
        assert_eq!(call.broadcasts, 0);
    }

    #[test]
    fn builtin_catalog_resolves_operators() {
        let reg = Registry::builtin().unwrap();
        let call = resolve(&reg, "mul", &[s(&["items"]), s(&["items"])]).unwrap();
        assert_eq!(call.shape, s(&["items"]));
        let total = resolve(&reg, "sum", &[call.shape.clone()]).unwrap();
        assert_eq!(total.shape, Shape::scalar());
        assert_eq!(total.dropped, vec![Axis::new("items")]);
    }
}
