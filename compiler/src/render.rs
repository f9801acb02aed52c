// render.rs — Renderer contract and a pseudo-code reference renderer
//
// A renderer receives a final loop program as a sequence of calls: open and
// close loops, reset/add/load accumulators, compute values, and yield each
// result with its index tuple. It is told the full axis list of every
// declaration up front so it can build nested output containers.
//
// Preconditions: programs are `Final`.
// Postconditions: every instruction is delivered exactly once, in order.
// Failure modes: `Internal` for a program that is not final or unbalanced.
// Side effects: none (renderers accumulate their own output).

use std::fmt::Write;

use crate::ast::{DeclKind, Literal};
use crate::error::{CompileError, Result};
use crate::id::{AccId, Reg};
use crate::lir::{InstrKind, LoopProgram, LoopSource, ProgramState};
use crate::shape::Shape;

/// Output layout of one declaration: one container level per axis.
#[derive(Debug, Clone, Copy)]
pub struct Layout<'a> {
    pub kind: DeclKind,
    pub axes: &'a Shape,
}

pub trait Renderer {
    fn begin_declaration(&mut self, name: &str, layout: Layout<'_>);
    fn open_loop(&mut self, depth: usize, source: &LoopSource, element: Reg, index: Reg);
    fn close_loop(&mut self, depth: usize, source: &LoopSource);
    fn acc_reset(&mut self, depth: usize, acc: AccId, fn_id: &str, init: Option<&Literal>);
    fn acc_add(&mut self, depth: usize, acc: AccId, fn_id: &str, args: &[Reg]);
    fn acc_load(&mut self, depth: usize, dst: Reg, acc: AccId);
    /// A pure value instruction (`Const`, `LoadInput`, `Map`, …).
    fn value(&mut self, depth: usize, dst: Reg, expr: &InstrKind);
    fn yield_value(&mut self, depth: usize, value: Reg, indices: &[Reg]);
    fn end_declaration(&mut self);
    fn finish(&mut self) -> String;
}

/// Drive `renderer` over one final program.
pub fn render_program(program: &LoopProgram, renderer: &mut dyn Renderer) -> Result<()> {
    if program.state != ProgramState::Final {
        return Err(CompileError::internal(format!(
            "{}: cannot render a program in state {}",
            program.declaration, program.state
        )));
    }
    renderer.begin_declaration(
        &program.declaration,
        Layout {
            kind: program.kind,
            axes: &program.shape,
        },
    );
    let mut open: Vec<&LoopSource> = Vec::new();
    for instr in &program.instrs {
        let depth = instr.depth;
        match &instr.kind {
            InstrKind::OpenLoop {
                source,
                element,
                index,
            } => {
                renderer.open_loop(depth, source, *element, *index);
                open.push(source);
            }
            InstrKind::CloseLoop { .. } => {
                let source = open
                    .pop()
                    .ok_or_else(|| CompileError::internal(format!("{}: unbalanced loops", program.declaration)))?;
                renderer.close_loop(depth, source);
            }
            InstrKind::AccReset { acc, fn_id, init } => renderer.acc_reset(depth, *acc, fn_id, init.as_ref()),
            InstrKind::AccAdd { acc, fn_id, args } => renderer.acc_add(depth, *acc, fn_id, args),
            InstrKind::AccLoad { dst, acc } => renderer.acc_load(depth, *dst, *acc),
            InstrKind::Yield { value, indices } => renderer.yield_value(depth, *value, indices),
            other => {
                let dst = other
                    .dst()
                    .ok_or_else(|| CompileError::internal(format!("{}: value without destination", program.declaration)))?;
                renderer.value(depth, dst, other);
            }
        }
    }
    renderer.end_declaration();
    Ok(())
}

/// Render every program in order and return the renderer's output.
pub fn render_all<'a>(
    programs: impl IntoIterator<Item = &'a LoopProgram>,
    renderer: &mut dyn Renderer,
) -> Result<String> {
    for program in programs {
        render_program(program, renderer)?;
    }
    Ok(renderer.finish())
}

// ── Pseudo renderer ─────────────────────────────────────────────────────────

/// Python-flavoured pseudo code. Demonstrates the contract only.
#[derive(Debug, Default)]
pub struct PseudoRenderer {
    out: String,
    current: Option<String>,
    rank: usize,
    order: Vec<String>,
}

impl PseudoRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(&mut self, depth: usize, text: &str) {
        let _ = writeln!(self.out, "{}{}", "    ".repeat(depth + 1), text);
    }
}

fn access(base: Option<Reg>, keys: &[String]) -> String {
    let mut s = match base {
        Some(reg) => reg.to_string(),
        None => "input".to_string(),
    };
    for key in keys {
        let _ = write!(s, "[{:?}]", key);
    }
    s
}

fn subscripts(indices: &[Reg]) -> String {
    indices.iter().map(|r| format!("[{}]", r)).collect()
}

fn args(regs: &[Reg]) -> String {
    regs.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
}

fn literal(value: &Literal) -> String {
    match value {
        Literal::Boolean(true) => "True".into(),
        Literal::Boolean(false) => "False".into(),
        Literal::Null => "None".into(),
        other => other.to_string(),
    }
}

impl Renderer for PseudoRenderer {
    fn begin_declaration(&mut self, name: &str, layout: Layout<'_>) {
        let _ = writeln!(self.out, "# {} {} : {}", layout.kind, name, layout.axes);
        let _ = writeln!(self.out, "def {}(input, results):", name);
        self.rank = layout.axes.rank();
        if self.rank > 0 {
            let _ = writeln!(self.out, "    out = nested({})", self.rank);
        }
        self.current = Some(name.to_string());
    }

    fn open_loop(&mut self, depth: usize, source: &LoopSource, element: Reg, index: Reg) {
        let text = format!(
            "for {}, {} in enumerate({}):  # {}",
            index,
            element,
            access(source.parent, &source.keys),
            source.axis
        );
        self.line(depth, &text);
    }

    fn close_loop(&mut self, _depth: usize, _source: &LoopSource) {}

    fn acc_reset(&mut self, depth: usize, acc: AccId, fn_id: &str, init: Option<&Literal>) {
        let init = init.map(literal).unwrap_or_else(|| "EMPTY".into());
        self.line(depth, &format!("{} = {}  # {}", acc, init, fn_id));
    }

    fn acc_add(&mut self, depth: usize, acc: AccId, fn_id: &str, regs: &[Reg]) {
        self.line(depth, &format!("{} = {}_step({}, {})", acc, fn_id, acc, args(regs)));
    }

    fn acc_load(&mut self, depth: usize, dst: Reg, acc: AccId) {
        self.line(depth, &format!("{} = {}", dst, acc));
    }

    fn value(&mut self, depth: usize, dst: Reg, expr: &InstrKind) {
        let rhs = match expr {
            InstrKind::Const { value, .. } => literal(value),
            InstrKind::LoadInput { base, keys, .. } => access(*base, keys),
            InstrKind::ElemAt { source, index, .. } => {
                format!("{}[{}]", access(source.parent, &source.keys), index)
            }
            InstrKind::Map { fn_id, args: regs, .. } => format!("{}({})", fn_id, args(regs)),
            InstrKind::Select { arms, default, .. } => {
                let mut s = default.to_string();
                for (cond, value) in arms.iter().rev() {
                    s = format!("({} if {} else {})", value, cond, s);
                }
                s
            }
            InstrKind::MakeArray { items, .. } => format!("[{}]", args(items)),
            InstrKind::MakeObject { fields, .. } => {
                let parts: Vec<String> = fields.iter().map(|(k, r)| format!("{:?}: {}", k, r)).collect();
                format!("{{{}}}", parts.join(", "))
            }
            InstrKind::LoadIndexed { decl, indices, .. } => {
                format!("results[{:?}]{}", decl, subscripts(indices))
            }
            other => format!("<{:?}>", other),
        };
        self.line(depth, &format!("{} = {}", dst, rhs));
    }

    fn yield_value(&mut self, depth: usize, value: Reg, indices: &[Reg]) {
        if indices.is_empty() {
            self.line(depth, &format!("out = {}", value));
        } else {
            self.line(depth, &format!("out{} = {}", subscripts(indices), value));
        }
    }

    fn end_declaration(&mut self) {
        let _ = writeln!(self.out, "    return out\n");
        if let Some(name) = self.current.take() {
            self.order.push(name);
        }
    }

    fn finish(&mut self) -> String {
        let mut out = std::mem::take(&mut self.out);
        out.push_str("def run(input):\n    results = {}\n");
        for name in self.order.drain(..) {
            let _ = writeln!(out, "    results[{:?}] = {}(input, results)", name, name);
        }
        out.push_str("    return results\n");
        out
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Node;
    use crate::shape::Axis;

    fn final_program() -> LoopProgram {
        let mut p = LoopProgram::new("subtotal", DeclKind::Value, Shape::from_names(["items"]));
        p.set_tree(&[Node::Loop {
            source: LoopSource {
                axis: Axis::new("items"),
                collection: "items".into(),
                parent: None,
                keys: vec!["items".into()],
            },
            element: Reg(0),
            index: Reg(1),
            body: vec![
                Node::Instr(InstrKind::LoadInput {
                    dst: Reg(2),
                    base: Some(Reg(0)),
                    keys: vec!["price".into()],
                    path: "items.price".into(),
                }),
                Node::Instr(InstrKind::Yield {
                    value: Reg(2),
                    indices: vec![Reg(1)],
                }),
            ],
        }]);
        for state in [
            ProgramState::Building,
            ProgramState::Fused,
            ProgramState::Scheduled,
            ProgramState::Final,
        ] {
            p.advance(state).unwrap();
        }
        p
    }

    #[test]
    fn pseudo_output() {
        let mut r = PseudoRenderer::new();
        let text = render_all([&final_program()], &mut r).unwrap();
        assert_eq!(
            text,
            "# value subtotal : [items]\n\
             def subtotal(input, results):\n\
             \x20   out = nested(1)\n\
             \x20   for r1, r0 in enumerate(input[\"items\"]):  # items\n\
             \x20       r2 = r0[\"price\"]\n\
             \x20       out[r1] = r2\n\
             \x20   return out\n\
             \n\
             def run(input):\n\
             \x20   results = {}\n\
             \x20   results[\"subtotal\"] = subtotal(input, results)\n\
             \x20   return results\n"
        );
    }

    #[derive(Default)]
    struct Recorder(Vec<String>);

    impl Renderer for Recorder {
        fn begin_declaration(&mut self, name: &str, layout: Layout<'_>) {
            self.0.push(format!("begin {} {}", name, layout.axes.rank()));
        }
        fn open_loop(&mut self, depth: usize, source: &LoopSource, _: Reg, _: Reg) {
            self.0.push(format!("open {} {}", depth, source.axis));
        }
        fn close_loop(&mut self, depth: usize, source: &LoopSource) {
            self.0.push(format!("close {} {}", depth, source.axis));
        }
        fn acc_reset(&mut self, _: usize, _: AccId, _: &str, _: Option<&Literal>) {}
        fn acc_add(&mut self, _: usize, _: AccId, _: &str, _: &[Reg]) {}
        fn acc_load(&mut self, _: usize, _: Reg, _: AccId) {}
        fn value(&mut self, depth: usize, dst: Reg, _: &InstrKind) {
            self.0.push(format!("value {} {}", depth, dst));
        }
        fn yield_value(&mut self, depth: usize, value: Reg, indices: &[Reg]) {
            self.0.push(format!("yield {} {} {}", depth, value, indices.len()));
        }
        fn end_declaration(&mut self) {
            self.0.push("end".into());
        }
        fn finish(&mut self) -> String {
            self.0.join("\n")
        }
    }

    #[test]
    fn calls_arrive_in_order() {
        let mut r = Recorder::default();
        let text = render_all([&final_program()], &mut r).unwrap();
        assert_eq!(
            text,
            "begin subtotal 1\nopen 0 items\nvalue 1 r2\nyield 1 r2 1\nclose 0 items\nend"
        );
    }

    #[test]
    fn non_final_program_is_rejected() {
        let mut p = final_program();
        p.state = ProgramState::Scheduled;
        let err = render_program(&p, &mut PseudoRenderer::new()).unwrap_err();
        assert!(matches!(err, CompileError::Internal(_)));
    }
}
