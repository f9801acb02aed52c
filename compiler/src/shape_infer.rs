// shape_infer.rs — Shape annotation of declaration bodies
//
// Walks each declaration's expression bottom-up and attaches a `Shape` to
// every node: input paths through the AxisCatalog, calls through the
// SignatureResolver (falling back to the JoinPlanner when the argument
// shapes do not share an outer prefix), and references through the shapes
// of already-inferred declarations.
//
// Preconditions: names resolved; referenced declarations already inferred
//                (dependency order).
// Postconditions: every node carries its shape; calls carry their
//                 `ResolvedCall` and, when one was needed, their `JoinPlan`.
// Failure modes: `UnknownPath`, `SignatureMatch`, `JoinPolicy`,
//                `UnknownFunction`, each with the span of the offending node.
// Side effects: none.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::ast::{Expr, ExprKind, Literal, Span};
use crate::axis::AxisCatalog;
use crate::error::{CompileError, SpannedError, WithSpan};
use crate::join::{self, JoinPlan};
use crate::registry::Registry;
use crate::shape::Shape;
use crate::signature::{self, ResolvedCall};

// ── Public types ────────────────────────────────────────────────────────────

/// An expression node annotated with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedExpr {
    pub shape: Shape,
    pub span: Span,
    pub kind: ShapedKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapedKind {
    Literal(Literal),
    /// Dotted path without the `input.` prefix.
    Input { path: String },
    Ref { name: String },
    Call {
        call: ResolvedCall,
        plan: Option<JoinPlan>,
        args: Vec<ShapedExpr>,
    },
    Select {
        arms: Vec<(ShapedExpr, ShapedExpr)>,
        default: Option<Box<ShapedExpr>>,
    },
    Array(Vec<ShapedExpr>),
    Object(Vec<(String, ShapedExpr)>),
}

/// Read-only context shared by all declarations of one schema.
pub struct InferCtx<'a> {
    pub catalog: &'a AxisCatalog,
    pub registry: &'a Registry,
    /// Shapes of declarations inferred so far.
    pub decl_shapes: &'a HashMap<String, Shape>,
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Annotate one declaration body.
pub fn infer(expr: &Expr, ctx: &InferCtx<'_>) -> Result<ShapedExpr, SpannedError> {
    let span = expr.span;
    match &expr.kind {
        ExprKind::Literal(lit) => Ok(ShapedExpr {
            shape: Shape::scalar(),
            span,
            kind: ShapedKind::Literal(lit.clone()),
        }),
        ExprKind::Input(steps) => {
            let path = steps
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(".");
            let shape = ctx.catalog.shape_of(&path).at(span)?;
            Ok(ShapedExpr {
                shape,
                span,
                kind: ShapedKind::Input { path },
            })
        }
        ExprKind::Ref(ident) => {
            let shape = ctx
                .decl_shapes
                .get(&ident.name)
                .cloned()
                .ok_or_else(|| {
                    CompileError::internal(format!(
                        "declaration '{}' referenced before its shape is known",
                        ident.name
                    ))
                })
                .at(span)?;
            Ok(ShapedExpr {
                shape,
                span,
                kind: ShapedKind::Ref {
                    name: ident.name.clone(),
                },
            })
        }
        ExprKind::Call { func, args } => {
            let args = args
                .iter()
                .map(|a| infer(a, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            let shapes: Vec<Shape> = args.iter().map(|a| a.shape.clone()).collect();
            let (call, plan) =
                resolve_call(&func.name, &shapes, ctx.registry, ctx.catalog).at(span)?;
            Ok(ShapedExpr {
                shape: call.shape.clone(),
                span,
                kind: ShapedKind::Call { call, plan, args },
            })
        }
        ExprKind::Cascade { arms, default } => {
            let mut shaped_arms = Vec::with_capacity(arms.len());
            let mut shapes = Vec::new();
            for (cond, value) in arms {
                let cond = infer(cond, ctx)?;
                let value = infer(value, ctx)?;
                shapes.push(cond.shape.clone());
                shapes.push(value.shape.clone());
                shaped_arms.push((cond, value));
            }
            let default = match default {
                Some(d) => {
                    let d = infer(d, ctx)?;
                    shapes.push(d.shape.clone());
                    Some(Box::new(d))
                }
                None => None,
            };
            let plan = join::plan("cascade", &shapes, None).at(span)?;
            Ok(ShapedExpr {
                shape: plan.carrier().clone(),
                span,
                kind: ShapedKind::Select {
                    arms: shaped_arms,
                    default,
                },
            })
        }
        ExprKind::Array(items) => {
            let items = items
                .iter()
                .map(|i| infer(i, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            let shapes: Vec<Shape> = items.iter().map(|i| i.shape.clone()).collect();
            let plan = join::plan("array", &shapes, None).at(span)?;
            Ok(ShapedExpr {
                shape: plan.carrier().clone(),
                span,
                kind: ShapedKind::Array(items),
            })
        }
        ExprKind::Object(fields) => {
            let mut shaped = Vec::with_capacity(fields.len());
            for (key, value) in fields {
                shaped.push((key.name.clone(), infer(value, ctx)?));
            }
            let shapes: Vec<Shape> = shaped.iter().map(|(_, v)| v.shape.clone()).collect();
            let plan = join::plan("object", &shapes, None).at(span)?;
            Ok(ShapedExpr {
                shape: plan.carrier().clone(),
                span,
                kind: ShapedKind::Object(shaped),
            })
        }
    }
}

/// Resolve a call, joining the arguments first if their outers disagree.
///
/// The result shape must stay iterable: every kept axis needs its parent
/// axis kept before it.
fn resolve_call(
    fn_id: &str,
    shapes: &[Shape],
    registry: &Registry,
    catalog: &AxisCatalog,
) -> crate::error::Result<(ResolvedCall, Option<JoinPlan>)> {
    let direct = signature::resolve(registry, fn_id, shapes);
    let (call, plan) = match direct {
        Ok(call) => (call, None),
        Err(err @ CompileError::SignatureMatch { .. }) => {
            let arity_fits = registry
                .lookup(fn_id)
                .is_some_and(|e| e.signatures.iter().any(|s| s.arity() == shapes.len()));
            if !arity_fits {
                return Err(err);
            }
            let plan = join::plan(fn_id, shapes, registry.join_policy(fn_id))?;
            let aligned = plan.aligned_shapes(shapes);
            if aligned == shapes {
                return Err(err);
            }
            match signature::resolve(registry, fn_id, &aligned) {
                Ok(call) => (call, Some(plan)),
                Err(_) => return Err(err),
            }
        }
        Err(err) => return Err(err),
    };

    let is_reducer = registry.lookup(fn_id).is_some_and(|e| e.is_reducer());
    if is_reducer && !call.is_reduction() {
        return Err(CompileError::SignatureMatch {
            fn_id: fn_id.to_string(),
            shapes: shapes.to_vec(),
            reason: "reducer applied to a value with no axis to reduce".to_string(),
        });
    }

    let axes = call.shape.axes();
    for (pos, axis) in axes.iter().enumerate() {
        let parent = catalog.axis(axis).and_then(|info| info.parent.as_ref());
        if parent.is_some_and(|p| !axes[..pos].contains(p)) {
            return Err(CompileError::SignatureMatch {
                fn_id: fn_id.to_string(),
                shapes: shapes.to_vec(),
                reason: format!("result axis '{}' is not nested under the kept outer axes", axis),
            });
        }
    }
    Ok((call, plan))
}

// ── Display ─────────────────────────────────────────────────────────────────

impl ShapedExpr {
    /// Indented one-node-per-line listing used by `--emit shapes`.
    pub fn to_tree(&self) -> String {
        let mut out = String::new();
        self.write_tree(&mut out, 0, "");
        out
    }

    fn write_tree(&self, out: &mut String, indent: usize, label: &str) {
        let pad = "  ".repeat(indent);
        let head = match &self.kind {
            ShapedKind::Literal(lit) => format!("literal {}", lit),
            ShapedKind::Input { path } => format!("input.{}", path),
            ShapedKind::Ref { name } => format!("ref {}", name),
            ShapedKind::Call { call, plan, .. } => {
                let mut head = format!("call {}", call.fn_id);
                if !call.dropped.is_empty() {
                    let dropped: Vec<&str> = call.dropped.iter().map(|a| a.name()).collect();
                    let _ = write!(head, " reduces {}", dropped.join(", "));
                }
                if let Some(plan) = plan {
                    let kind = match plan {
                        JoinPlan::Broadcast { .. } => "broadcast",
                        JoinPlan::Align { .. } => "align",
                        JoinPlan::Zip { .. } => "zip",
                        JoinPlan::Product { .. } => "product",
                    };
                    let _ = write!(head, " via {}", kind);
                }
                head
            }
            ShapedKind::Select { .. } => "cascade".to_string(),
            ShapedKind::Array(_) => "array".to_string(),
            ShapedKind::Object(_) => "object".to_string(),
        };
        let _ = writeln!(out, "{}{}{} : {}", pad, label, head, self.shape);

        match &self.kind {
            ShapedKind::Call { args, .. } => {
                for arg in args {
                    arg.write_tree(out, indent + 1, "");
                }
            }
            ShapedKind::Select { arms, default } => {
                for (cond, value) in arms {
                    cond.write_tree(out, indent + 1, "when ");
                    value.write_tree(out, indent + 2, "=> ");
                }
                if let Some(d) = default {
                    d.write_tree(out, indent + 1, "else ");
                }
            }
            ShapedKind::Array(items) => {
                for item in items {
                    item.write_tree(out, indent + 1, "");
                }
            }
            ShapedKind::Object(fields) => {
                for (key, value) in fields {
                    value.write_tree(out, indent + 1, &format!("{}: ", key));
                }
            }
            _ => {}
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
