// fusion.rs — Merge sibling loops over the same collection
//
// Two loops at the same level that iterate the same collection from the same
// parent element are merged into one when only accumulator resets, loads
// and pure instructions stand between them, and the second loop reads no
// value defined between them. Resets move before the merged loop; loads and
// pure instructions move after it, in order. Bodies are fused recursively,
// so nested loops that become adjacent after a merge are merged too.
//
// Preconditions: the program is balanced (`Building` or later).
// Postconditions: no two adjacent-mergeable loops remain; results are
//   unchanged; running fusion again is a no-op.
// Failure modes: `Internal` when the program is unbalanced or its state
//   forbids the transition.
// Side effects: none.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::Result;
use crate::id::Reg;
use crate::lir::{InstrKind, LoopProgram, Node, ProgramState};

/// Merge statistics for one program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    pub merged: usize,
}

/// Fuse `program` in place and advance it to `Fused`.
pub fn fuse_program(program: &mut LoopProgram) -> Result<FusionStats> {
    let tree = program.tree()?;
    let mut stats = FusionStats::default();
    let fused = fuse_nodes(tree, &mut stats);
    program.set_tree(&fused);
    program.advance(ProgramState::Fused)?;
    if stats.merged > 0 {
        debug!(decl = %program.declaration, merged = stats.merged, "fused loops");
    }
    Ok(stats)
}

/// Fuse one level to a fixed point, then every loop body.
pub fn fuse_nodes(mut nodes: Vec<Node>, stats: &mut FusionStats) -> Vec<Node> {
    while let Some((first, second)) = find_pair(&nodes) {
        nodes = merge_pair(nodes, first, second);
        stats.merged += 1;
    }
    nodes
        .into_iter()
        .map(|node| match node {
            Node::Loop {
                source,
                element,
                index,
                body,
            } => Node::Loop {
                source,
                element,
                index,
                body: fuse_nodes(body, stats),
            },
            other => other,
        })
        .collect()
}

fn find_pair(nodes: &[Node]) -> Option<(usize, usize)> {
    for (i, node) in nodes.iter().enumerate() {
        let Node::Loop { source: first, .. } = node else {
            continue;
        };
        // registers defined between the two loops
        let mut between: HashSet<Reg> = HashSet::new();
        for (j, later) in nodes.iter().enumerate().skip(i + 1) {
            match later {
                Node::Instr(InstrKind::AccReset { .. }) => {}
                Node::Instr(kind @ InstrKind::AccLoad { .. }) => between.extend(kind.defs()),
                Node::Instr(kind) if kind.is_pure() => between.extend(kind.defs()),
                Node::Loop { source, body, .. } => {
                    if source.same_collection(first) && !uses_any(body, &between) {
                        return Some((i, j));
                    }
                    break;
                }
                Node::Instr(_) => break,
            }
        }
    }
    None
}

fn merge_pair(nodes: Vec<Node>, first: usize, second: usize) -> Vec<Node> {
    let mut before = Vec::new();
    let mut resets = Vec::new();
    // accumulator loads and pure values, kept in order
    let mut sunk = Vec::new();
    let mut after = Vec::new();
    let mut head = None;
    let mut tail = None;

    for (k, node) in nodes.into_iter().enumerate() {
        if k < first {
            before.push(node);
        } else if k == first {
            head = Some(node);
        } else if k < second {
            match node {
                Node::Instr(InstrKind::AccReset { .. }) => resets.push(node),
                _ => sunk.push(node),
            }
        } else if k == second {
            tail = Some(node);
        } else {
            after.push(node);
        }
    }

    let merged = match (head, tail) {
        (
            Some(Node::Loop {
                source,
                element,
                index,
                mut body,
            }),
            Some(Node::Loop {
                element: e2,
                index: i2,
                body: body2,
                ..
            }),
        ) => {
            let renames: HashMap<Reg, Reg> = [(e2, element), (i2, index)].into_iter().collect();
            body.extend(rename_nodes(body2, &renames));
            Node::Loop {
                source,
                element,
                index,
                body,
            }
        }
        // find_pair only returns loop pairs
        (head, tail) => {
            let mut out = before;
            out.extend(head);
            out.extend(resets);
            out.extend(sunk);
            out.extend(tail);
            out.extend(after);
            return out;
        }
    };

    let mut out = before;
    out.extend(resets);
    out.push(merged);
    out.extend(sunk);
    out.extend(after);
    out
}

fn rename_nodes(nodes: Vec<Node>, renames: &HashMap<Reg, Reg>) -> Vec<Node> {
    nodes
        .into_iter()
        .map(|node| match node {
            Node::Instr(mut kind) => {
                kind.rename_uses(renames);
                Node::Instr(kind)
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
                Node::Loop {
                    source,
                    element,
                    index,
                    body: rename_nodes(body, renames),
                }
            }
        })
        .collect()
}

fn uses_any(nodes: &[Node], regs: &HashSet<Reg>) -> bool {
    if regs.is_empty() {
        return false;
    }
    nodes.iter().any(|node| match node {
        Node::Instr(kind) => kind.uses().iter().any(|r| regs.contains(r)),
        Node::Loop { source, body, .. } => {
            source.parent.is_some_and(|p| regs.contains(&p)) || uses_any(body, regs)
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{DeclKind, Literal};
    use crate::id::AccId;
    use crate::lir::{flatten, verify_program, LoopSource};
    use crate::pass::StageCert;
    use crate::shape::{Axis, Shape};

    fn items() -> LoopSource {
        LoopSource {
            axis: Axis::new("items"),
            collection: "items".into(),
            parent: None,
            keys: vec!["items".into()],
        }
    }

    fn load(dst: u32, base: u32, key: &str) -> Node {
        Node::Instr(InstrKind::LoadInput {
            dst: Reg(dst),
            base: Some(Reg(base)),
            keys: vec![key.into()],
            path: format!("items.{}", key),
        })
    }

    fn reset(acc: u32) -> Node {
        Node::Instr(InstrKind::AccReset {
            acc: AccId(acc),
            fn_id: "sum".into(),
            init: Some(Literal::Integer(0)),
        })
    }

    fn add(acc: u32, arg: u32) -> Node {
        Node::Instr(InstrKind::AccAdd {
            acc: AccId(acc),
            fn_id: "sum".into(),
            args: vec![Reg(arg)],
        })
    }

    fn acc_load(dst: u32, acc: u32) -> Node {
        Node::Instr(InstrKind::AccLoad {
            dst: Reg(dst),
            acc: AccId(acc),
        })
    }

    fn items_loop(element: u32, index: u32, body: Vec<Node>) -> Node {
        Node::Loop {
            source: items(),
            element: Reg(element),
            index: Reg(index),
            body,
        }
    }

    /// `sum(price) + sum(qty)` as emitted: two sibling loops.
    fn two_sums() -> Vec<Node> {
        vec![
            reset(0),
            items_loop(0, 1, vec![load(2, 0, "price"), add(0, 2)]),
            acc_load(3, 0),
            reset(1),
            items_loop(4, 5, vec![load(6, 4, "qty"), add(1, 6)]),
            acc_load(7, 1),
            Node::Instr(InstrKind::Map {
                dst: Reg(8),
                fn_id: "add".into(),
                args: vec![Reg(3), Reg(7)],
            }),
            Node::Instr(InstrKind::Yield {
                value: Reg(8),
                indices: vec![],
            }),
        ]
    }

    fn program(nodes: &[Node]) -> LoopProgram {
        let mut p = LoopProgram::new("total", DeclKind::Value, Shape::scalar());
        p.advance(ProgramState::Building).unwrap();
        p.set_tree(nodes);
        p
    }

    #[test]
    fn sibling_sums_share_one_loop() {
        let mut p = program(&two_sums());
        let stats = fuse_program(&mut p).unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(p.loop_count(), 1);
        assert!(verify_program(&p).all_pass());

        let tree = p.tree().unwrap();
        assert!(matches!(tree[0], Node::Instr(InstrKind::AccReset { acc: AccId(0), .. })));
        assert!(matches!(tree[1], Node::Instr(InstrKind::AccReset { acc: AccId(1), .. })));
        let Node::Loop { body, .. } = &tree[2] else {
            panic!("expected merged loop");
        };
        // the second body now reads the first loop's element register
        assert_eq!(body[2], load(6, 0, "qty"));
    }

    #[test]
    fn fusion_is_idempotent() {
        let mut p = program(&two_sums());
        fuse_program(&mut p).unwrap();
        let once = p.instrs.clone();
        let stats = fuse_program(&mut p).unwrap();
        assert_eq!(stats.merged, 0);
        assert_eq!(p.instrs, once);
    }

    #[test]
    fn loaded_value_blocks_fusion() {
        // second loop reads r3, which only exists after the first completes
        let nodes = vec![
            reset(0),
            items_loop(0, 1, vec![load(2, 0, "price"), add(0, 2)]),
            acc_load(3, 0),
            reset(1),
            items_loop(
                4,
                5,
                vec![
                    load(6, 4, "price"),
                    Node::Instr(InstrKind::Map {
                        dst: Reg(7),
                        fn_id: "div".into(),
                        args: vec![Reg(6), Reg(3)],
                    }),
                    add(1, 7),
                ],
            ),
            acc_load(8, 1),
            Node::Instr(InstrKind::Yield {
                value: Reg(8),
                indices: vec![],
            }),
        ];
        let mut stats = FusionStats::default();
        let out = fuse_nodes(nodes.clone(), &mut stats);
        assert_eq!(stats.merged, 0);
        assert_eq!(flatten(&out), flatten(&nodes));
    }

    /// `sum(price) * 2 + sum(qty)`: a constant and a product sit between
    /// the loops.
    fn scaled_sums() -> Vec<Node> {
        vec![
            reset(0),
            items_loop(0, 1, vec![load(2, 0, "price"), add(0, 2)]),
            acc_load(3, 0),
            Node::Instr(InstrKind::Const {
                dst: Reg(4),
                value: Literal::Integer(2),
            }),
            Node::Instr(InstrKind::Map {
                dst: Reg(5),
                fn_id: "mul".into(),
                args: vec![Reg(3), Reg(4)],
            }),
            reset(1),
            items_loop(6, 7, vec![load(8, 6, "qty"), add(1, 8)]),
            acc_load(9, 1),
            Node::Instr(InstrKind::Map {
                dst: Reg(10),
                fn_id: "add".into(),
                args: vec![Reg(5), Reg(9)],
            }),
            Node::Instr(InstrKind::Yield {
                value: Reg(10),
                indices: vec![],
            }),
        ]
    }

    #[test]
    fn pure_values_between_loops_sink_after_merge() {
        let mut p = program(&scaled_sums());
        let stats = fuse_program(&mut p).unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(p.loop_count(), 1);
        assert!(verify_program(&p).all_pass());

        let tree = p.tree().unwrap();
        assert!(matches!(tree[0], Node::Instr(InstrKind::AccReset { acc: AccId(0), .. })));
        assert!(matches!(tree[1], Node::Instr(InstrKind::AccReset { acc: AccId(1), .. })));
        assert!(matches!(tree[2], Node::Loop { .. }));
        assert_eq!(tree[3], acc_load(3, 0));
        assert!(matches!(tree[4], Node::Instr(InstrKind::Const { dst: Reg(4), .. })));
        assert!(matches!(tree[5], Node::Instr(InstrKind::Map { dst: Reg(5), .. })));
        assert_eq!(tree[6], acc_load(9, 1));
    }

    #[test]
    fn pure_value_read_by_second_loop_blocks_fusion() {
        let nodes = vec![
            items_loop(0, 1, vec![]),
            Node::Instr(InstrKind::Const {
                dst: Reg(2),
                value: Literal::Integer(1),
            }),
            items_loop(
                3,
                4,
                vec![Node::Instr(InstrKind::Yield {
                    value: Reg(2),
                    indices: vec![Reg(4)],
                })],
            ),
        ];
        let mut stats = FusionStats::default();
        fuse_nodes(nodes, &mut stats);
        assert_eq!(stats.merged, 0);
    }

    #[test]
    fn side_effects_between_loops_block_fusion() {
        let nodes = vec![
            Node::Instr(InstrKind::Const {
                dst: Reg(0),
                value: Literal::Integer(1),
            }),
            items_loop(1, 2, vec![]),
            Node::Instr(InstrKind::Yield {
                value: Reg(0),
                indices: vec![],
            }),
            items_loop(3, 4, vec![]),
        ];
        let mut stats = FusionStats::default();
        fuse_nodes(nodes, &mut stats);
        assert_eq!(stats.merged, 0);
    }

    #[test]
    fn nested_loops_fuse_after_outer_merge() {
        let employees = |parent: u32| LoopSource {
            axis: Axis::new("employees"),
            collection: "departments.employees".into(),
            parent: Some(Reg(parent)),
            keys: vec!["employees".into()],
        };
        let depts = LoopSource {
            axis: Axis::new("departments"),
            collection: "departments".into(),
            parent: None,
            keys: vec!["departments".into()],
        };
        let inner = |parent: u32, e: u32, i: u32| Node::Loop {
            source: employees(parent),
            element: Reg(e),
            index: Reg(i),
            body: vec![],
        };
        let nodes = vec![
            Node::Loop {
                source: depts.clone(),
                element: Reg(0),
                index: Reg(1),
                body: vec![inner(0, 2, 3)],
            },
            Node::Loop {
                source: depts,
                element: Reg(4),
                index: Reg(5),
                body: vec![inner(4, 6, 7)],
            },
        ];
        let mut stats = FusionStats::default();
        let out = fuse_nodes(nodes, &mut stats);
        assert_eq!(stats.merged, 2);
        assert_eq!(out.len(), 1);
        let Node::Loop { body, .. } = &out[0] else {
            panic!("expected loop");
        };
        assert_eq!(body.len(), 1);
    }
}
