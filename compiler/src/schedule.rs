// schedule.rs — Reference linking and depth scheduling
//
// Two jobs, run at different points of a declaration's compilation:
//
// * `link_references` decides, before loop emission, whether each
//   `LoadDeclaration` re-executes its producer in the consumer's loop nest
//   (inline) or reads the producer's materialized result by index tuple.
// * `schedule_program` moves every pure instruction to the shallowest loop
//   depth its operands allow, then deduplicates identical pure instructions
//   within a scope, repeating both until nothing changes.
//
// Preconditions: producers are linked and compiled before their consumers;
//   programs handed to the scheduler are balanced and `Fused`.
// Postconditions: every `LoadDeclaration` carries a `RefMode`; every pure
//   instruction sits at the max depth of its operands (0 without operands);
//   loop control, accumulator and yield instructions keep their depth.
// Failure modes: `Internal` for a missing producer or unbalanced program.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{CompileError, Result};
use crate::id::Reg;
use crate::ir::{AttrKey, AttrValue, Declaration, OpKind, RefMode};
use crate::lir::{InstrKind, LoopProgram, Node, ProgramState};

// ── Reference linking ───────────────────────────────────────────────────────

/// Which references may be inlined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum InlinePolicy {
    /// Inline rank-compatible producers that contain no reduction.
    #[default]
    Auto,
    /// Inline every rank-compatible producer.
    Always,
    /// Always read materialized results.
    Never,
}

impl fmt::Display for InlinePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InlinePolicy::Auto => f.write_str("auto"),
            InlinePolicy::Always => f.write_str("always"),
            InlinePolicy::Never => f.write_str("never"),
        }
    }
}

impl FromStr for InlinePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(InlinePolicy::Auto),
            "always" => Ok(InlinePolicy::Always),
            "never" => Ok(InlinePolicy::Never),
            other => Err(format!("unknown inline policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub inline: usize,
    pub indexed: usize,
}

/// Decide inline vs indexed for every reference in `decl`.
pub fn link_references(
    decl: &mut Declaration,
    producers: &HashMap<String, Declaration>,
    policy: InlinePolicy,
) -> Result<LinkStats> {
    let mut stats = LinkStats::default();
    for op in decl.ops.iter_mut().filter(|op| op.kind == OpKind::LoadDeclaration) {
        let name = op
            .attrs
            .str(AttrKey::Decl)
            .ok_or_else(|| CompileError::internal(format!("{}: {} names no declaration", decl.name, op.id)))?;
        let producer = producers.get(name).ok_or_else(|| {
            CompileError::internal(format!(
                "{}: producer '{}' must be compiled before its consumers",
                decl.name, name
            ))
        })?;
        let use_site = op.attrs.shape(AttrKey::UseSite).cloned().unwrap_or_else(|| op.shape.clone());

        let compatible = producer.shape.rank() <= use_site.rank()
            && producer.shape.is_subsequence_of(&use_site);
        let allowed = match policy {
            InlinePolicy::Auto => !producer.has_reduction(),
            InlinePolicy::Always => true,
            InlinePolicy::Never => false,
        };
        let mode = if compatible && allowed {
            stats.inline += 1;
            RefMode::Inline
        } else {
            stats.indexed += 1;
            RefMode::Indexed
        };
        op.attrs.set(AttrKey::RefMode, AttrValue::RefMode(mode));
    }
    Ok(stats)
}

// ── Depth scheduling ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub hoisted: usize,
    pub deduplicated: usize,
}

/// Hoist and deduplicate `program` in place, advancing it to `Scheduled`.
pub fn schedule_program(program: &mut LoopProgram) -> Result<ScheduleStats> {
    let mut stats = ScheduleStats::default();
    let mut tree = program.tree()?;
    // a dedup can lower operand depths and unlock another hoist
    loop {
        let mut round = ScheduleStats::default();
        let (kept, escaped) = hoist(tree, 0, &mut HashMap::new(), &mut round);
        if !escaped.is_empty() {
            return Err(CompileError::internal(format!(
                "{}: instruction hoisted above the root",
                program.declaration
            )));
        }
        tree = dedup(kept, &mut vec![HashMap::new()], &mut HashMap::new(), &mut round);
        stats.hoisted += round.hoisted;
        stats.deduplicated += round.deduplicated;
        if round == ScheduleStats::default() {
            break;
        }
    }
    program.set_tree(&tree);
    program.advance(ProgramState::Scheduled)?;
    if stats.hoisted + stats.deduplicated > 0 {
        debug!(
            decl = %program.declaration,
            hoisted = stats.hoisted,
            deduplicated = stats.deduplicated,
            "scheduled"
        );
    }
    Ok(stats)
}

/// Hoist pure instructions at `depth`. Returns the nodes that stay and the
/// instructions escaping to a shallower depth, with their target depth.
fn hoist(
    nodes: Vec<Node>,
    depth: usize,
    depths: &mut HashMap<Reg, usize>,
    stats: &mut ScheduleStats,
) -> (Vec<Node>, Vec<(usize, Node)>) {
    let mut kept = Vec::with_capacity(nodes.len());
    let mut escaped = Vec::new();
    for node in nodes {
        match node {
            Node::Instr(kind) if kind.is_pure() => {
                let target = kind
                    .uses()
                    .iter()
                    .map(|r| depths.get(r).copied().unwrap_or(0))
                    .max()
                    .unwrap_or(0);
                for d in kind.defs() {
                    depths.insert(d, target);
                }
                if target < depth {
                    stats.hoisted += 1;
                    escaped.push((target, Node::Instr(kind)));
                } else {
                    kept.push(Node::Instr(kind));
                }
            }
            Node::Instr(kind) => {
                for d in kind.defs() {
                    depths.insert(d, depth);
                }
                kept.push(Node::Instr(kind));
            }
            Node::Loop {
                source,
                element,
                index,
                body,
            } => {
                depths.insert(element, depth + 1);
                depths.insert(index, depth + 1);
                let (body, inner) = hoist(body, depth + 1, depths, stats);
                for (target, node) in inner {
                    if target == depth {
                        kept.push(node);
                    } else {
                        escaped.push((target, node));
                    }
                }
                kept.push(Node::Loop {
                    source,
                    element,
                    index,
                    body,
                });
            }
        }
    }
    (kept, escaped)
}

/// Drop pure instructions identical to one already available in an
/// enclosing scope, redirecting their uses.
fn dedup(
    nodes: Vec<Node>,
    scopes: &mut Vec<HashMap<InstrKind, Reg>>,
    renames: &mut HashMap<Reg, Reg>,
    stats: &mut ScheduleStats,
) -> Vec<Node> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::Instr(mut kind) => {
                kind.rename_uses(renames);
                if kind.is_pure() {
                    if let Some(dst) = kind.dst() {
                        let mut key = kind.clone();
                        key.set_dst(Reg(u32::MAX));
                        if let Some(existing) = scopes.iter().rev().find_map(|s| s.get(&key)) {
                            renames.insert(dst, *existing);
                            stats.deduplicated += 1;
                            continue;
                        }
                        if let Some(scope) = scopes.last_mut() {
                            scope.insert(key, dst);
                        }
                    }
                }
                out.push(Node::Instr(kind));
            }
            Node::Loop {
                mut source,
                element,
                index,
                body,
            } => {
                if let Some(parent) = source.parent.as_mut() {
                    if let Some(new) = renames.get(parent) {
                        *parent = *new;
                    }
                }
                scopes.push(HashMap::new());
                let body = dedup(body, scopes, renames, stats);
                scopes.pop();
                out.push(Node::Loop {
                    source,
                    element,
                    index,
                    body,
                });
            }
        }
    }
    out
}

/// Seal a scheduled program.
pub fn finalize_program(program: &mut LoopProgram) -> Result<()> {
    program.advance(ProgramState::Final)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{DeclKind, Literal};
    use crate::ir::{Attrs, DeclarationBuilder};
    use crate::lir::{verify_program, Instr, LoopSource};
    use crate::pass::StageCert;
    use crate::shape::{Axis, Shape};

    fn source(axis: &str, parent: Option<u32>) -> LoopSource {
        LoopSource {
            axis: Axis::new(axis),
            collection: axis.into(),
            parent: parent.map(Reg),
            keys: vec![axis.into()],
        }
    }

    fn bias_load(dst: u32) -> Node {
        Node::Instr(InstrKind::LoadInput {
            dst: Reg(dst),
            base: None,
            keys: vec!["config".into(), "bias".into()],
            path: "config.bias".into(),
        })
    }

    /// `row` loop inside `batch` with a root-only load buried inside.
    fn nested() -> Vec<Node> {
        vec![Node::Loop {
            source: source("batch", None),
            element: Reg(0),
            index: Reg(1),
            body: vec![Node::Loop {
                source: source("row", Some(0)),
                element: Reg(2),
                index: Reg(3),
                body: vec![
                    Node::Instr(InstrKind::LoadInput {
                        dst: Reg(4),
                        base: Some(Reg(2)),
                        keys: vec!["val".into()],
                        path: "batch.row.val".into(),
                    }),
                    bias_load(5),
                    Node::Instr(InstrKind::Map {
                        dst: Reg(6),
                        fn_id: "add".into(),
                        args: vec![Reg(4), Reg(5)],
                    }),
                    Node::Instr(InstrKind::Yield {
                        value: Reg(6),
                        indices: vec![Reg(1), Reg(3)],
                    }),
                ],
            }],
        }]
    }

    fn program(nodes: &[Node]) -> LoopProgram {
        let mut p = LoopProgram::new("out", DeclKind::Value, Shape::from_names(["batch", "row"]));
        p.advance(ProgramState::Building).unwrap();
        p.advance(ProgramState::Fused).unwrap();
        p.set_tree(nodes);
        p
    }

    #[test]
    fn root_load_hoists_to_depth_zero() {
        let mut p = program(&nested());
        let stats = schedule_program(&mut p).unwrap();
        assert_eq!(stats.hoisted, 1);
        assert_eq!(
            p.instrs[0],
            Instr {
                depth: 0,
                kind: match bias_load(5) {
                    Node::Instr(k) => k,
                    _ => unreachable!(),
                },
            }
        );
        assert!(verify_program(&p).all_pass());
        assert_eq!(p.state, ProgramState::Scheduled);
    }

    #[test]
    fn element_dependent_work_stays_in_its_loop() {
        let mut p = program(&nested());
        schedule_program(&mut p).unwrap();
        let add = p
            .instrs
            .iter()
            .find(|i| matches!(i.kind, InstrKind::Map { .. }))
            .unwrap();
        assert_eq!(add.depth, 2);
    }

    #[test]
    fn scheduling_is_idempotent() {
        let mut p = program(&nested());
        schedule_program(&mut p).unwrap();
        let once = p.instrs.clone();
        let stats = schedule_program(&mut p).unwrap();
        assert_eq!(stats, ScheduleStats::default());
        assert_eq!(p.instrs, once);
    }

    #[test]
    fn identical_instructions_collapse_after_hoisting() {
        let nodes = vec![
            Node::Loop {
                source: source("items", None),
                element: Reg(0),
                index: Reg(1),
                body: vec![
                    bias_load(2),
                    Node::Instr(InstrKind::Yield {
                        value: Reg(2),
                        indices: vec![Reg(1)],
                    }),
                ],
            },
            bias_load(3),
            Node::Instr(InstrKind::Const {
                dst: Reg(4),
                value: Literal::Integer(1),
            }),
        ];
        let mut p = program(&nodes);
        let stats = schedule_program(&mut p).unwrap();
        assert_eq!(stats.deduplicated, 1);
        let loads = p
            .instrs
            .iter()
            .filter(|i| matches!(i.kind, InstrKind::LoadInput { .. }))
            .count();
        assert_eq!(loads, 1);
        assert!(verify_program(&p).all_pass());
    }

    #[test]
    fn scheduling_requires_fused_state() {
        let mut p = LoopProgram::new("x", DeclKind::Value, Shape::scalar());
        p.advance(ProgramState::Building).unwrap();
        assert!(schedule_program(&mut p).is_err());
    }

    fn producer(name: &str, shape: Shape, reduce: bool) -> Declaration {
        let mut b = DeclarationBuilder::new(name, DeclKind::Value);
        let kind = if reduce { OpKind::Reduce } else { OpKind::Map };
        let id = b.push(kind, vec![], shape, Attrs::new()).unwrap();
        b.finish(id).unwrap()
    }

    fn consumer(of: &str, use_site: Shape) -> Declaration {
        let mut b = DeclarationBuilder::new("consumer", DeclKind::Value);
        let attrs = Attrs::new()
            .with(AttrKey::Decl, AttrValue::Str(of.into()))
            .with(AttrKey::UseSite, AttrValue::Shape(use_site.clone()));
        let id = b.push(OpKind::LoadDeclaration, vec![], use_site, attrs).unwrap();
        b.finish(id).unwrap()
    }

    fn link(producer: Declaration, mut consumer: Declaration, policy: InlinePolicy) -> RefMode {
        let producers: HashMap<String, Declaration> = [(producer.name.clone(), producer)].into_iter().collect();
        link_references(&mut consumer, &producers, policy).unwrap();
        consumer.ops[0].attrs.ref_mode().unwrap()
    }

    #[test]
    fn rank_compatible_producer_inlines() {
        let items = Shape::from_names(["items"]);
        assert_eq!(link(producer("p", items.clone(), false), consumer("p", items), InlinePolicy::Auto), RefMode::Inline);
    }

    #[test]
    fn deeper_producer_is_indexed() {
        let deep = Shape::from_names(["departments", "employees"]);
        let shallow = Shape::from_names(["departments"]);
        assert_eq!(link(producer("p", deep, false), consumer("p", shallow), InlinePolicy::Always), RefMode::Indexed);
    }

    #[test]
    fn auto_refuses_reductions() {
        let scalar = Shape::scalar();
        let items = Shape::from_names(["items"]);
        assert_eq!(
            link(producer("p", scalar.clone(), true), consumer("p", items.clone()), InlinePolicy::Auto),
            RefMode::Indexed
        );
        assert_eq!(
            link(producer("p", scalar, true), consumer("p", items), InlinePolicy::Always),
            RefMode::Inline
        );
    }

    #[test]
    fn never_policy_indexes_everything() {
        let items = Shape::from_names(["items"]);
        assert_eq!(link(producer("p", items.clone(), false), consumer("p", items), InlinePolicy::Never), RefMode::Indexed);
    }

    #[test]
    fn missing_producer_is_internal() {
        let mut c = consumer("ghost", Shape::scalar());
        let err = link_references(&mut c, &HashMap::new(), InlinePolicy::Auto).unwrap_err();
        assert!(matches!(err, CompileError::Internal(_)));
    }

    #[test]
    fn policy_parses() {
        assert_eq!("never".parse::<InlinePolicy>().unwrap(), InlinePolicy::Never);
        assert!("sometimes".parse::<InlinePolicy>().is_err());
    }
}
