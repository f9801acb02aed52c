// pass.rs — Pass table: names, inputs, artifacts, stage certificates
//
// Parsing happens before any pass runs. The schema-wide passes (resolve,
// catalog, order) run once; the rest run per declaration. The pipeline plans
// each `--emit` target with `required_passes` and stops after the last one.

use std::collections::HashSet;

// ── Identifiers ────────────────────────────────────────────────────────────

/// Compiler passes, in execution order for a full compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassId {
    Resolve,
    BuildCatalog,
    Order,
    InferShapes,
    BuildOps,
    LinkRefs,
    EmitLoops,
    Fuse,
    Schedule,
    Finalize,
}

/// What a pass leaves behind in the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Resolved,     // ResolvedSchema
    Catalog,      // AxisCatalog
    Order,        // Vec<String>
    Shaped,       // ShapedExpr per declaration
    Declarations, // Declaration per declaration
    Programs,     // LoopProgram per declaration
}

// ── Descriptors ────────────────────────────────────────────────────────────

pub struct PassDescriptor {
    /// Name used in `tracing` events.
    pub name: &'static str,
    /// Passes whose artifacts this one reads.
    pub inputs: &'static [PassId],
    pub outputs: &'static [ArtifactId],
    /// Postconditions, for humans.
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Resolve => PassDescriptor {
            name: "resolve",
            inputs: &[],
            outputs: &[ArtifactId::Resolved],
            invariants: "declaration names unique, references and functions known",
        },
        PassId::BuildCatalog => PassDescriptor {
            name: "build_catalog",
            inputs: &[],
            outputs: &[ArtifactId::Catalog],
            invariants: "every input path has a shape, axis names unique",
        },
        PassId::Order => PassDescriptor {
            name: "order",
            inputs: &[PassId::Resolve],
            outputs: &[ArtifactId::Order],
            invariants: "producers precede consumers, no cycles",
        },
        PassId::InferShapes => PassDescriptor {
            name: "infer_shapes",
            inputs: &[PassId::BuildCatalog, PassId::Order],
            outputs: &[ArtifactId::Shaped],
            invariants: "every call resolved to a signature, joins planned",
        },
        PassId::BuildOps => PassDescriptor {
            name: "build_ops",
            inputs: &[PassId::InferShapes],
            outputs: &[ArtifactId::Declarations],
            invariants: "O1-O4 obligations verified, ops interned by value",
        },
        PassId::LinkRefs => PassDescriptor {
            name: "link_refs",
            inputs: &[PassId::BuildOps],
            outputs: &[ArtifactId::Declarations],
            invariants: "every reference is inline or indexed",
        },
        PassId::EmitLoops => PassDescriptor {
            name: "emit_loops",
            inputs: &[PassId::LinkRefs],
            outputs: &[ArtifactId::Programs],
            invariants: "L1-L3 obligations verified",
        },
        PassId::Fuse => PassDescriptor {
            name: "fuse",
            inputs: &[PassId::EmitLoops],
            outputs: &[ArtifactId::Programs],
            invariants: "no mergeable sibling loops remain",
        },
        PassId::Schedule => PassDescriptor {
            name: "schedule",
            inputs: &[PassId::Fuse],
            outputs: &[ArtifactId::Programs],
            invariants: "pure instructions at their shallowest legal depth",
        },
        PassId::Finalize => PassDescriptor {
            name: "finalize",
            inputs: &[PassId::Schedule],
            outputs: &[ArtifactId::Programs],
            invariants: "programs verified and sealed",
        },
    }
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable evidence that a stage met its postconditions.
pub trait StageCert {
    fn all_pass(&self) -> bool;

    /// `(obligation name, passed)` pairs, in a stable order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that failed.
    fn failed(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Planning ───────────────────────────────────────────────────────────────

pub const ALL_PASSES: [PassId; 10] = [
    PassId::Resolve,
    PassId::BuildCatalog,
    PassId::Order,
    PassId::InferShapes,
    PassId::BuildOps,
    PassId::LinkRefs,
    PassId::EmitLoops,
    PassId::Fuse,
    PassId::Schedule,
    PassId::Finalize,
];

/// Passes that must run for `terminal`, dependencies first.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────
