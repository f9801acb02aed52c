// id.rs — Small integer identifiers for per-declaration arenas
//
// Op ids index a declaration's op arena. Registers and accumulators name
// values inside one loop program. All three are private to the declaration
// that allocated them, so independent declarations never share counters.

use std::fmt;

use serde::Serialize;

/// Index of an op in its declaration's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OpId(pub u32);

/// A value register in a loop program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Reg(pub u32);

/// A named accumulator in a loop program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AccId(pub u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for AccId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acc{}", self.0)
    }
}

/// Allocator for registers and accumulators. Produces monotonically
/// increasing ids in emission order, ensuring deterministic assignment.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_reg: u32,
    next_acc: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_reg(&mut self) -> Reg {
        let id = Reg(self.next_reg);
        self.next_reg += 1;
        id
    }

    pub fn alloc_acc(&mut self) -> AccId {
        let id = AccId(self.next_acc);
        self.next_acc += 1;
        id
    }
}
