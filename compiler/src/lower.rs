// lower.rs — LoopIRBuilder: shaped expressions → declaration op IR
//
// Walks a shape-annotated declaration body bottom-up and emits one op per
// distinct sub-expression into the declaration's arena. Calls that drop axes
// become `Reduce`, other calls `Map`; references become `LoadDeclaration`
// carrying the axes active where they are used. Then verifies the op-level
// obligations recorded in `OpCert`.
//
// Preconditions: the body passed shape inference.
// Postconditions: a `Declaration` whose ops are interned and whose operands
//   precede their users; `OpCert` evidence for O1-O4.
// Failure modes: `AmbiguousSelection` for a cascade with no else branch;
//   `Internal` for malformed arenas.
// Side effects: none.

use crate::ast::DeclKind;
use crate::error::{CompileError, Result};
use crate::id::OpId;
use crate::ir::{AttrKey, AttrValue, Attrs, Declaration, DeclarationBuilder, OpKind};
use crate::join::JoinPlan;
use crate::pass::StageCert;
use crate::shape::Shape;
use crate::shape_infer::{ShapedExpr, ShapedKind};

// ── Public entry point ──────────────────────────────────────────────────────

/// Build the op IR for one declaration.
pub fn build_declaration(name: &str, kind: DeclKind, body: &ShapedExpr) -> Result<Declaration> {
    let mut builder = Builder {
        decl: name,
        ops: DeclarationBuilder::new(name, kind),
    };
    let result = builder.lower(body, &body.shape)?;
    builder.ops.finish(result)
}

// ── Builder ─────────────────────────────────────────────────────────────────

struct Builder<'a> {
    decl: &'a str,
    ops: DeclarationBuilder,
}

/// The index space a node's operands are evaluated in.
fn exec_shape(expr: &ShapedExpr) -> Shape {
    match &expr.kind {
        ShapedKind::Call {
            call, plan, args, ..
        } if call.is_reduction() => match plan {
            Some(plan) => plan.carrier().clone(),
            None => args
                .iter()
                .map(|a| &a.shape)
                .fold(None::<&Shape>, |best, s| match best {
                    Some(b) if b.rank() >= s.rank() => Some(b),
                    _ => Some(s),
                })
                .cloned()
                .unwrap_or_default(),
        },
        _ => expr.shape.clone(),
    }
}

impl Builder<'_> {
    fn lower(&mut self, expr: &ShapedExpr, use_site: &Shape) -> Result<OpId> {
        let inner = exec_shape(expr);
        match &expr.kind {
            ShapedKind::Literal(lit) => self.ops.push(
                OpKind::Const,
                vec![],
                Shape::scalar(),
                Attrs::new().with(AttrKey::Literal, AttrValue::Literal(lit.clone())),
            ),
            ShapedKind::Input { path } => self.ops.push(
                OpKind::LoadInput,
                vec![],
                expr.shape.clone(),
                Attrs::new().with(AttrKey::Path, AttrValue::Str(path.clone())),
            ),
            ShapedKind::Ref { name } => self.ops.push(
                OpKind::LoadDeclaration,
                vec![],
                expr.shape.clone(),
                Attrs::new()
                    .with(AttrKey::Decl, AttrValue::Str(name.clone()))
                    .with(AttrKey::UseSite, AttrValue::Shape(use_site.clone())),
            ),
            ShapedKind::Call { call, plan, args } => {
                let mut ids = Vec::with_capacity(args.len());
                for arg in args {
                    ids.push(self.lower(arg, &inner)?);
                }
                let mut attrs = Attrs::new().with(AttrKey::Fn, AttrValue::Str(call.fn_id.clone()));
                if let Some(plan @ JoinPlan::Zip { .. }) = plan {
                    let per_arg = (0..args.len()).map(|i| plan.aliases_for(i).to_vec()).collect();
                    attrs.set(AttrKey::Align, AttrValue::Aliases(per_arg));
                }
                let kind = if call.is_reduction() {
                    attrs.set(AttrKey::Reduced, AttrValue::Axes(call.dropped.clone()));
                    OpKind::Reduce
                } else {
                    OpKind::Map
                };
                self.ops.push(kind, ids, expr.shape.clone(), attrs)
            }
            ShapedKind::Select { arms, default } => {
                let Some(default) = default else {
                    return Err(CompileError::AmbiguousSelection {
                        decl: self.decl.to_string(),
                    });
                };
                let mut ids = Vec::with_capacity(arms.len() * 2 + 1);
                for (cond, value) in arms {
                    ids.push(self.lower(cond, &inner)?);
                    ids.push(self.lower(value, &inner)?);
                }
                ids.push(self.lower(default, &inner)?);
                self.ops.push(OpKind::Select, ids, expr.shape.clone(), Attrs::new())
            }
            ShapedKind::Array(items) => {
                let mut ids = Vec::with_capacity(items.len());
                for item in items {
                    ids.push(self.lower(item, &inner)?);
                }
                self.ops.push(OpKind::MakeArray, ids, expr.shape.clone(), Attrs::new())
            }
            ShapedKind::Object(fields) => {
                let mut ids = Vec::with_capacity(fields.len());
                let mut keys = Vec::with_capacity(fields.len());
                for (key, value) in fields {
                    keys.push(key.clone());
                    ids.push(self.lower(value, &inner)?);
                }
                self.ops.push(
                    OpKind::MakeObject,
                    ids,
                    expr.shape.clone(),
                    Attrs::new().with(AttrKey::Keys, AttrValue::Keys(keys)),
                )
            }
        }
    }
}

// ── Verification ────────────────────────────────────────────────────────────

/// Evidence for the op-level obligations of one declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpCert {
    /// O1: every operand id precedes the op that uses it.
    pub o1_operands_precede: bool,
    /// O2: the result id names an op of the declaration's shape.
    pub o2_result_in_range: bool,
    /// O3: every `Reduce` records at least one consumed axis.
    pub o3_reductions_annotated: bool,
    /// O4: every `LoadDeclaration` records its use-site axes.
    pub o4_references_annotated: bool,
}

impl StageCert for OpCert {
    fn all_pass(&self) -> bool {
        self.o1_operands_precede
            && self.o2_result_in_range
            && self.o3_reductions_annotated
            && self.o4_references_annotated
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("O1_operands_precede", self.o1_operands_precede),
            ("O2_result_in_range", self.o2_result_in_range),
            ("O3_reductions_annotated", self.o3_reductions_annotated),
            ("O4_references_annotated", self.o4_references_annotated),
        ]
    }
}

pub fn verify_declaration(decl: &Declaration) -> OpCert {
    let o1_operands_precede = decl
        .ops
        .iter()
        .enumerate()
        .all(|(i, op)| op.id.0 as usize == i && op.args.iter().all(|a| (a.0 as usize) < i));
    let o2_result_in_range = decl
        .ops
        .get(decl.result.0 as usize)
        .is_some_and(|op| op.shape == decl.shape);
    let o3_reductions_annotated = decl
        .ops
        .iter()
        .filter(|op| op.kind == OpKind::Reduce)
        .all(|op| !op.attrs.axes(AttrKey::Reduced).is_empty());
    let o4_references_annotated = decl
        .ops
        .iter()
        .filter(|op| op.kind == OpKind::LoadDeclaration)
        .all(|op| op.attrs.shape(AttrKey::UseSite).is_some() && op.attrs.str(AttrKey::Decl).is_some());
    OpCert {
        o1_operands_precede,
        o2_result_in_range,
        o3_reductions_annotated,
        o4_references_annotated,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::AxisCatalog;
    use crate::registry::Registry;
    use crate::shape_infer::{infer, InferCtx};
    use std::collections::HashMap;

    const INPUT: &str = "input {
        array items { float price  integer quantity }
        object config { float bias }
        array departments { array employees { float salary } array projects { float budget } }
    }";

    fn build_all(decls: &str) -> HashMap<String, Result<Declaration>> {
        let source = format!("{}\n{}", INPUT, decls);
        let parsed = crate::parser::parse(&source);
        assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
        let schema = parsed.schema.expect("schema");
        let catalog = AxisCatalog::from_ast(&schema.inputs).expect("catalog");
        let registry = Registry::builtin().expect("registry");
        let mut shapes = HashMap::new();
        let mut out = HashMap::new();
        for decl in &schema.decls {
            let ctx = InferCtx {
                catalog: &catalog,
                registry: &registry,
                decl_shapes: &shapes,
            };
            let shaped = infer(&decl.expr, &ctx).expect("shape inference");
            shapes.insert(decl.name.name.clone(), shaped.shape.clone());
            out.insert(
                decl.name.name.clone(),
                build_declaration(&decl.name.name, decl.kind, &shaped),
            );
        }
        out
    }

    fn build_one(decls: &str, name: &str) -> Declaration {
        build_all(decls)
            .remove(name)
            .expect("declaration present")
            .expect("builds")
    }

    #[test]
    fn map_over_items() {
        let d = build_one("value subtotal = input.items.price * input.items.quantity", "subtotal");
        assert_eq!(
            d.to_string(),
            "value subtotal : [items]\n\
             \x20 %0 = load_input items.price : [items]\n\
             \x20 %1 = load_input items.quantity : [items]\n\
             \x20 %2 = map mul(%0, %1) : [items]\n\
             \x20 result %2\n"
        );
        assert!(verify_declaration(&d).all_pass());
    }

    #[test]
    fn reduction_records_dropped_axes() {
        let d = build_one("value total = sum(input.items.price * input.items.quantity)", "total");
        let result = d.result_op().unwrap();
        assert_eq!(result.kind, OpKind::Reduce);
        assert_eq!(result.attrs.axes(AttrKey::Reduced), &[crate::shape::Axis::new("items")]);
        assert!(d.has_reduction());
    }

    #[test]
    fn repeated_subexpressions_share_ops() {
        let d = build_one(
            "value sq = input.items.price * input.items.price + input.items.price * input.items.price",
            "sq",
        );
        // load, mul, add
        assert_eq!(d.ops.len(), 3);
        assert_eq!(d.ops[2].args, vec![OpId(1), OpId(1)]);
    }

    #[test]
    fn reference_records_use_site() {
        let d = build_one(
            "value dept_total = sum(input.departments.employees.salary)\n\
             value share = input.departments.employees.salary / dept_total",
            "share",
        );
        let load = d
            .ops
            .iter()
            .find(|op| op.kind == OpKind::LoadDeclaration)
            .unwrap();
        assert_eq!(load.attrs.str(AttrKey::Decl), Some("dept_total"));
        assert_eq!(
            load.attrs.shape(AttrKey::UseSite),
            Some(&Shape::from_names(["departments", "employees"]))
        );
        assert_eq!(load.shape, Shape::from_names(["departments"]));
        assert_eq!(d.references(), vec!["dept_total"]);
    }

    #[test]
    fn reference_inside_reduction_uses_reduced_space() {
        let d = build_one(
            "value sub = input.items.price * 2\nvalue total = sum(sub)",
            "total",
        );
        let load = &d.ops[0];
        assert_eq!(load.kind, OpKind::LoadDeclaration);
        assert_eq!(load.attrs.shape(AttrKey::UseSite), Some(&Shape::from_names(["items"])));
    }

    #[test]
    fn cascade_without_else_is_ambiguous() {
        let mut all = build_all("value tier = cascade { when input.items.price > 10 => 1 }");
        let err = all.remove("tier").unwrap().unwrap_err();
        assert_eq!(err, CompileError::AmbiguousSelection { decl: "tier".into() });
    }

    #[test]
    fn cascade_lowers_to_select() {
        let d = build_one(
            "value tier = cascade { when input.items.price > 100 => 2 when input.items.price > 10 => 1 else 0 }",
            "tier",
        );
        let select = d.result_op().unwrap();
        assert_eq!(select.kind, OpKind::Select);
        assert_eq!(select.args.len(), 5);
        assert_eq!(select.shape, Shape::from_names(["items"]));
    }

    #[test]
    fn zip_records_aliases() {
        let d = build_one(
            "value z = zip_add(input.departments.employees.salary, input.departments.projects.budget)",
            "z",
        );
        let op = d.result_op().unwrap();
        assert_eq!(op.kind, OpKind::Map);
        assert!(op.attrs.aliases(0).is_empty());
        assert_eq!(op.attrs.aliases(1).len(), 1);
    }

    #[test]
    fn cert_detects_bad_operand_order() {
        let mut d = build_one("value x = input.items.price + 1", "x");
        d.ops.swap(0, 2);
        let cert = verify_declaration(&d);
        assert!(!cert.o1_operands_precede);
        assert!(!cert.all_pass());
        assert_eq!(cert.obligations().len(), 4);
    }
}
