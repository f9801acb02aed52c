// dot.rs — Graphviz DOT output for declaration dependency graphs
//
// One node per declaration (labelled with its result shape), one edge per
// reference from producer to consumer. Once references are linked, edges
// carry the reference mode: solid for inline, dashed for indexed.
//
// Preconditions: `compiled` holds at least the dependency graph.
// Postconditions: returns a valid DOT string; node and edge order follow the
//   dependency order, so output is deterministic.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::ast::DeclKind;
use crate::ir::{AttrKey, OpKind, RefMode};
use crate::pipeline::CompiledSchema;

/// Emit the declaration graph as a Graphviz DOT string.
pub fn emit_dot(compiled: &CompiledSchema) -> String {
    let mut buf = String::new();
    buf.push_str("digraph nest {\n");
    buf.push_str("    rankdir=LR;\n");
    buf.push_str("    node [fontname=\"Helvetica\", fontsize=10];\n");
    buf.push_str("    edge [fontname=\"Helvetica\", fontsize=9];\n");

    if !compiled.declarations.is_empty() {
        buf.push('\n');
    }
    for decl in &compiled.declarations {
        let shape = match decl.kind {
            DeclKind::Value => "box",
            DeclKind::Trait => "ellipse",
        };
        let _ = writeln!(
            buf,
            "    {} [label=\"{}\\n{}\", shape={}];",
            sanitize(&decl.name),
            escape(&decl.name),
            decl.shaped.shape,
            shape
        );
    }
    for name in &compiled.skipped {
        let _ = writeln!(
            buf,
            "    {} [label=\"{}\\n(skipped)\", style=dashed, color=gray50];",
            sanitize(name),
            escape(name)
        );
    }

    let modes = ref_modes(compiled);
    let edges = compiled.graph.edges();
    if !edges.is_empty() {
        buf.push('\n');
    }
    for (producer, consumer) in edges {
        let from = sanitize(producer);
        let to = sanitize(consumer);
        match modes.get(&(consumer, producer)) {
            Some(RefMode::Inline) => {
                let _ = writeln!(buf, "    {from} -> {to} [label=\"inline\"];");
            }
            Some(RefMode::Indexed) => {
                let _ = writeln!(buf, "    {from} -> {to} [label=\"indexed\", style=dashed];");
            }
            None => {
                let _ = writeln!(buf, "    {from} -> {to};");
            }
        }
    }

    buf.push_str("}\n");
    buf
}

/// `(consumer, producer) → mode` for every linked reference.
fn ref_modes(compiled: &CompiledSchema) -> BTreeMap<(&str, &str), RefMode> {
    let mut modes = BTreeMap::new();
    for compiled_decl in &compiled.declarations {
        let Some(decl) = &compiled_decl.declaration else {
            continue;
        };
        for op in &decl.ops {
            if op.kind != OpKind::LoadDeclaration {
                continue;
            }
            if let (Some(producer), Some(mode)) = (op.attrs.str(AttrKey::Decl), op.attrs.ref_mode()) {
                modes.insert((decl.name.as_str(), producer), mode);
            }
        }
    }
    modes
}

fn sanitize(name: &str) -> String {
    let body: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("d_{body}")
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{compile_source, CompileOptions};
    use crate::registry::Registry;
    use crate::schedule::InlinePolicy;

    const SRC: &str = "\
input {
    array items { float price  integer quantity }
}
value subtotal = input.items.price * input.items.quantity
value total = sum(subtotal)
value share = subtotal / total
";

    fn dot_with(policy: InlinePolicy) -> String {
        let registry = Registry::builtin().unwrap();
        let options = CompileOptions {
            inline_policy: policy,
            ..CompileOptions::default()
        };
        let out = compile_source(SRC, &registry, &options);
        assert!(!out.has_errors(), "{:?}", out.diagnostics);
        emit_dot(out.compiled.as_ref().unwrap())
    }

    #[test]
    fn nodes_carry_shapes() {
        let dot = dot_with(InlinePolicy::Auto);
        assert!(dot.starts_with("digraph nest {"));
        assert!(dot.contains("d_subtotal [label=\"subtotal\\n[items]\", shape=box];"));
        assert!(dot.contains("d_total [label=\"total\\n[]\", shape=box];"));
        assert!(dot.ends_with("}\n"));
    }

    #[test]
    fn edges_carry_ref_modes() {
        let dot = dot_with(InlinePolicy::Auto);
        assert!(dot.contains("d_subtotal -> d_total [label=\"inline\"];"));
        assert!(dot.contains("d_total -> d_share [label=\"indexed\", style=dashed];"));

        let dot = dot_with(InlinePolicy::Never);
        assert!(dot.contains("d_subtotal -> d_total [label=\"indexed\", style=dashed];"));
    }

    #[test]
    fn sanitize_replaces_punctuation() {
        assert_eq!(sanitize("a-b.c"), "d_a_b_c");
    }
}
