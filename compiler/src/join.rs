// join.rs — JoinPlanner: combining arguments of different shapes
//
// When a call's argument shapes do not share one outer prefix, the planner
// decides how they meet in a single index space (the carrier):
//
//   Broadcast  every shape is a prefix of the longest; shorter arguments
//              replicate along the missing trailing axes.
//   Align      every shape is a subsequence of the longest; each shorter
//              argument replicates along the carrier axes it lacks.
//   Zip        disjoint shapes of equal rank, combined position-wise.
//   Product    disjoint shapes, carrier is the ordered union of all axes.
//
// Preconditions: shapes are valid.
// Postconditions: `aligned_shapes` maps every non-scalar argument onto the
//   carrier.
// Failure modes: `JoinPolicy` when shapes are disjoint and the function has
//   no policy, or when a zip is requested over unequal ranks.
// Side effects: none.

use serde::Serialize;

use crate::error::{CompileError, Result};
use crate::registry::JoinPolicy;
use crate::shape::{Axis, Shape};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlignStep {
    pub arg: usize,
    /// Carrier axes the argument is replicated along.
    pub replicate: Vec<Axis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZipMapping {
    pub arg: usize,
    /// `(argument axis, carrier axis)` pairs that differ.
    pub aliases: Vec<(Axis, Axis)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JoinPlan {
    Broadcast { carrier: Shape },
    Align { carrier: Shape, steps: Vec<AlignStep> },
    Zip { carrier: Shape, mappings: Vec<ZipMapping> },
    Product { carrier: Shape },
}

impl JoinPlan {
    pub fn carrier(&self) -> &Shape {
        match self {
            JoinPlan::Broadcast { carrier }
            | JoinPlan::Align { carrier, .. }
            | JoinPlan::Zip { carrier, .. }
            | JoinPlan::Product { carrier } => carrier,
        }
    }

    /// Argument shapes as seen from the carrier. Scalars stay scalar.
    pub fn aligned_shapes(&self, shapes: &[Shape]) -> Vec<Shape> {
        shapes
            .iter()
            .map(|s| {
                if s.is_scalar() {
                    Shape::scalar()
                } else {
                    self.carrier().clone()
                }
            })
            .collect()
    }

    /// Zip aliases for one argument, if any.
    pub fn aliases_for(&self, arg: usize) -> &[(Axis, Axis)] {
        match self {
            JoinPlan::Zip { mappings, .. } => mappings
                .iter()
                .find(|m| m.arg == arg)
                .map(|m| m.aliases.as_slice())
                .unwrap_or(&[]),
            _ => &[],
        }
    }
}

/// Plan how the argument shapes of `fn_id` combine.
pub fn plan(fn_id: &str, shapes: &[Shape], policy: Option<JoinPolicy>) -> Result<JoinPlan> {
    let non_scalar: Vec<(usize, &Shape)> = shapes
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_scalar())
        .collect();

    let longest = non_scalar
        .iter()
        .map(|(_, s)| *s)
        .fold(None::<&Shape>, |best, s| match best {
            Some(b) if b.rank() >= s.rank() => Some(b),
            _ => Some(s),
        })
        .cloned()
        .unwrap_or_default();

    if non_scalar.iter().all(|(_, s)| s.is_prefix_of(&longest)) {
        return Ok(JoinPlan::Broadcast { carrier: longest });
    }

    if non_scalar.iter().all(|(_, s)| s.is_subsequence_of(&longest)) {
        let steps = non_scalar
            .iter()
            .filter(|(_, s)| s.rank() < longest.rank())
            .map(|(i, s)| AlignStep {
                arg: *i,
                replicate: longest.difference(s),
            })
            .collect();
        return Ok(JoinPlan::Align {
            carrier: longest,
            steps,
        });
    }

    match policy {
        Some(JoinPolicy::Zip) => {
            let carrier = non_scalar[0].1.clone();
            if let Some((_, bad)) = non_scalar.iter().find(|(_, s)| s.rank() != carrier.rank()) {
                return Err(CompileError::JoinPolicy {
                    fn_id: fn_id.to_string(),
                    shapes: shapes.to_vec(),
                    detail: format!(
                        "zip needs equal ranks, but {} has rank {} and {} has rank {}",
                        carrier,
                        carrier.rank(),
                        bad,
                        bad.rank()
                    ),
                });
            }
            let mappings = non_scalar
                .iter()
                .map(|(i, s)| ZipMapping {
                    arg: *i,
                    aliases: s
                        .axes()
                        .iter()
                        .zip(carrier.axes())
                        .filter(|(a, c)| a != c)
                        .map(|(a, c)| (a.clone(), c.clone()))
                        .collect(),
                })
                .filter(|m| !m.aliases.is_empty())
                .collect();
            Ok(JoinPlan::Zip { carrier, mappings })
        }
        Some(JoinPolicy::Product) => {
            let carrier = non_scalar
                .iter()
                .flat_map(|(_, s)| s.axes().iter().cloned())
                .collect();
            Ok(JoinPlan::Product { carrier })
        }
        None => Err(CompileError::JoinPolicy {
            fn_id: fn_id.to_string(),
            shapes: shapes.to_vec(),
            detail: format!("shapes are not prefix-compatible and '{}' declares no join policy", fn_id),
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

    #[test]
    fn prefix_shapes_broadcast() {
        let p = plan("add", &[s(&["d"]), s(&["d", "e"]), Shape::scalar()], None).unwrap();
        assert_eq!(p, JoinPlan::Broadcast { carrier: s(&["d", "e"]) });
        assert_eq!(
            p.aligned_shapes(&[s(&["d"]), s(&["d", "e"]), Shape::scalar()]),
            vec![s(&["d", "e"]), s(&["d", "e"]), Shape::scalar()]
        );
    }

    #[test]
    fn subsequence_shapes_align() {
        let p = plan("add", &[s(&["a", "c"]), s(&["a", "b", "c"])], None).unwrap();
        match p {
            JoinPlan::Align { carrier, steps } => {
                assert_eq!(carrier, s(&["a", "b", "c"]));
                assert_eq!(
                    steps,
                    vec![AlignStep {
                        arg: 0,
                        replicate: vec![Axis::new("b")]
                    }]
                );
            }
            other => panic!("expected align, got {other:?}"),
        }
    }

    #[test]
    fn disjoint_without_policy_fails() {
        let err = plan("add", &[s(&["a"]), s(&["b"])], None).unwrap_err();
        assert!(matches!(err, CompileError::JoinPolicy { .. }));
        assert!(err.to_string().contains("no join policy"));
    }

    #[test]
    fn zip_maps_positionally() {
        let p = plan(
            "zip_add",
            &[s(&["departments", "employees"]), s(&["projects", "employees"])],
            Some(JoinPolicy::Zip),
        )
        .unwrap();
        assert_eq!(p.carrier(), &s(&["departments", "employees"]));
        assert_eq!(
            p.aliases_for(1),
            &[(Axis::new("projects"), Axis::new("departments"))]
        );
        assert!(p.aliases_for(0).is_empty());
    }

    #[test]
    fn zip_rejects_unequal_ranks() {
        let err = plan("zip_add", &[s(&["a", "b"]), s(&["c"])], Some(JoinPolicy::Zip)).unwrap_err();
        assert!(err.to_string().contains("equal ranks"));
    }

    #[test]
    fn product_unions_axes() {
        let p = plan("outer_mul", &[s(&["a"]), s(&["b"])], Some(JoinPolicy::Product)).unwrap();
        assert_eq!(p, JoinPlan::Product { carrier: s(&["a", "b"]) });
    }
}
