// shape.rs — Axes and shapes
//
// An `Axis` names one array boundary of the input document. A `Shape` is the
// ordered list of axes a value varies over, outer to inner. The empty shape
// is a scalar.
//
// Preconditions: none (types only).
// Postconditions: a `Shape` never holds the same axis twice.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::Serialize;

// ── Axis ────────────────────────────────────────────────────────────────────

/// One semantic dimension, introduced by an array-typed input field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Axis(pub String);

impl Axis {
    pub fn new(name: impl Into<String>) -> Self {
        Axis(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Shape ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Shape(Vec<Axis>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    /// Build a shape from axes, dropping repeats (first occurrence wins).
    pub fn new(axes: Vec<Axis>) -> Self {
        let mut out: Vec<Axis> = Vec::with_capacity(axes.len());
        for axis in axes {
            if !out.contains(&axis) {
                out.push(axis);
            }
        }
        Shape(out)
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Shape::new(names.into_iter().map(|n| Axis(n.into())).collect())
    }

    pub fn axes(&self) -> &[Axis] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, axis: &Axis) -> bool {
        self.0.contains(axis)
    }

    pub fn position(&self, axis: &Axis) -> Option<usize> {
        self.0.iter().position(|a| a == axis)
    }

    pub fn last(&self) -> Option<&Axis> {
        self.0.last()
    }

    /// The first `n` axes.
    pub fn prefix(&self, n: usize) -> Shape {
        Shape(self.0[..n.min(self.0.len())].to_vec())
    }

    /// Split into `(outer, cell)` where `outer` holds the first `outer_len` axes.
    pub fn split_at(&self, outer_len: usize) -> (Shape, Shape) {
        let n = outer_len.min(self.0.len());
        (Shape(self.0[..n].to_vec()), Shape(self.0[n..].to_vec()))
    }

    pub fn is_prefix_of(&self, other: &Shape) -> bool {
        other.0.starts_with(&self.0)
    }

    /// True when every axis of `self` appears in `other`, in the same order.
    pub fn is_subsequence_of(&self, other: &Shape) -> bool {
        let mut rest = other.0.iter();
        self.0.iter().all(|a| rest.any(|b| b == a))
    }

    /// `self ++ other`, skipping axes already present.
    pub fn concat(&self, other: &Shape) -> Shape {
        let mut axes = self.0.clone();
        axes.extend(other.0.iter().cloned());
        Shape::new(axes)
    }

    /// Axes of `self` that are not in `other`, in order.
    pub fn difference(&self, other: &Shape) -> Vec<Axis> {
        self.0
            .iter()
            .filter(|a| !other.contains(a))
            .cloned()
            .collect()
    }
}

impl FromIterator<Axis> for Shape {
    fn from_iter<T: IntoIterator<Item = Axis>>(iter: T) -> Self {
        Shape::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, axis) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", axis)?;
        }
        write!(f, "]")
    }
}

/// Render a list of shapes as `[a], [a, b]` for diagnostics.
pub fn fmt_shapes(shapes: &[Shape]) -> String {
    shapes
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn s(names: &[&str]) -> Shape {
        Shape::from_names(names.iter().copied())
    }

    #[test]
    fn scalar_is_empty() {
        assert!(Shape::scalar().is_scalar());
        assert_eq!(Shape::scalar().rank(), 0);
        assert_eq!(Shape::scalar().to_string(), "[]");
    }

    #[test]
    fn new_drops_repeated_axes() {
        let shape = s(&["a", "b", "a"]);
        assert_eq!(shape, s(&["a", "b"]));
    }

    #[test]
    fn prefix_and_subsequence() {
        let ab = s(&["a", "b"]);
        let abc = s(&["a", "b", "c"]);
        let ac = s(&["a", "c"]);
        assert!(ab.is_prefix_of(&abc));
        assert!(!ac.is_prefix_of(&abc));
        assert!(ac.is_subsequence_of(&abc));
        assert!(!s(&["c", "a"]).is_subsequence_of(&abc));
        assert!(Shape::scalar().is_prefix_of(&abc));
    }

    #[test]
    fn split_and_concat() {
        let abc = s(&["a", "b", "c"]);
        let (outer, cell) = abc.split_at(1);
        assert_eq!(outer, s(&["a"]));
        assert_eq!(cell, s(&["b", "c"]));
        assert_eq!(outer.concat(&cell), abc);
        assert_eq!(abc.difference(&s(&["b"])), vec![Axis::new("a"), Axis::new("c")]);
    }

    #[test]
    fn display_lists_axes() {
        assert_eq!(s(&["departments", "employees"]).to_string(), "[departments, employees]");
        assert_eq!(fmt_shapes(&[s(&["a"]), Shape::scalar()]), "[a], []");
    }
}
