// pipeline.rs — Compilation state and pass orchestration
//
// Runs the schema-wide passes (resolve, catalog, order) once, then drives
// every declaration through shape inference, op building, reference linking,
// loop emission, fusion, scheduling and finalization in dependency order.
//
// Preconditions: the registry is fully loaded before `compile` is called.
// Postconditions: on success every declaration has a `Final` loop program
//   (or stops at the requested terminal pass); with `keep_going`, failed
//   declarations and their dependents are absent and reported.
// Failure modes: error-level diagnostics from any pass; internal errors are
//   always fatal, even with `keep_going`.
// Side effects: calls `on_pass_complete` after each pass for immediate
//   diagnostic display; emits `tracing` events.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chumsky::span::Span as _;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ast::{DeclKind, Schema, Span};
use crate::axis::AxisCatalog;
use crate::diag::codes;
use crate::diag::{DiagLevel, Diagnostic};
use crate::error::CompileError;
use crate::graph::DependencyGraph;
use crate::ir::Declaration;
use crate::lir::{verify_program, EmitCtx, LoopProgram, ProgramState};
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::registry::Registry;
use crate::resolve::ResolvedSchema;
use crate::schedule::InlinePolicy;
use crate::shape::Shape;
use crate::shape_infer::{InferCtx, ShapedExpr};

// ── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub inline_policy: InlinePolicy,
    pub fuse: bool,
    pub hoist: bool,
    pub keep_going: bool,
    pub verbose: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            inline_policy: InlinePolicy::Auto,
            fuse: true,
            hoist: true,
            keep_going: false,
            verbose: false,
        }
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for hermetic builds and cache-key use.
///
/// `source_hash`: SHA-256 of the raw `.nest` source text.
/// `registry_fingerprint`: SHA-256 of `Registry::canonical_json()`.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub registry_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    pub fn registry_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.registry_fingerprint)
    }

    /// Pretty JSON for `--emit build-info`.
    pub fn to_json(&self) -> String {
        let value = serde_json::json!({
            "source_hash": self.source_hash_hex(),
            "registry_fingerprint": self.registry_fingerprint_hex(),
            "manifest_schema_version": 1,
            "compiler_version": self.compiler_version,
        });
        let mut text = serde_json::to_string_pretty(&value).unwrap_or_default();
        text.push('\n');
        text
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Compute provenance from source text and registry.
pub fn compute_provenance(source: &str, registry: &Registry) -> Provenance {
    Provenance {
        source_hash: sha256(source.as_bytes()),
        registry_fingerprint: sha256(registry.canonical_json().as_bytes()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Artifacts ──────────────────────────────────────────────────────────────

/// Everything produced for one declaration, up to the terminal pass.
#[derive(Debug, Clone)]
pub struct CompiledDeclaration {
    pub name: String,
    pub kind: DeclKind,
    pub shaped: ShapedExpr,
    pub declaration: Option<Declaration>,
    pub program: Option<LoopProgram>,
}

/// Public result surface of one declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultInfo {
    pub shape: Shape,
    pub rank: usize,
    pub kind: DeclKind,
}

#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub schema: Schema,
    pub catalog: AxisCatalog,
    pub graph: DependencyGraph,
    /// Compiled declarations in dependency order.
    pub declarations: Vec<CompiledDeclaration>,
    /// Declarations left out after a failure (with `keep_going`).
    pub skipped: Vec<String>,
    pub provenance: Provenance,
}

impl CompiledSchema {
    pub fn get(&self, name: &str) -> Option<&CompiledDeclaration> {
        self.declarations.iter().find(|d| d.name == name)
    }

    pub fn program(&self, name: &str) -> Option<&LoopProgram> {
        self.get(name).and_then(|d| d.program.as_ref())
    }

    /// Final programs in dependency order.
    pub fn programs(&self) -> impl Iterator<Item = &LoopProgram> {
        self.declarations.iter().filter_map(|d| d.program.as_ref())
    }

    /// Name → result table.
    pub fn results(&self) -> BTreeMap<String, ResultInfo> {
        self.declarations
            .iter()
            .map(|d| {
                let info = ResultInfo {
                    shape: d.shaped.shape.clone(),
                    rank: d.shaped.shape.rank(),
                    kind: d.kind,
                };
                (d.name.clone(), info)
            })
            .collect()
    }
}

/// Output of a compilation: artifacts (absent on fatal failure) plus every
/// diagnostic raised on the way.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub compiled: Option<CompiledSchema>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        has_error_diags(&self.diagnostics)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.level == DiagLevel::Error)
    }
}

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

// ── Pass bookkeeping ───────────────────────────────────────────────────────

fn finish_pass(
    pass_id: PassId,
    decl: Option<&str>,
    elapsed: Duration,
    diags: &[Diagnostic],
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) {
    on_pass_complete(pass_id, diags);
    debug!(
        pass = descriptor(pass_id).name,
        decl = decl.unwrap_or("-"),
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "pass complete"
    );
}

/// Why a declaration did not compile.
enum DeclFailure {
    /// A user error; with `keep_going` the schema carries on without it.
    Error(Diagnostic),
    /// An internal error; always fatal.
    Internal(Diagnostic),
}

impl DeclFailure {
    fn from_error(error: CompileError, span: Span) -> Self {
        let diag = error.to_diagnostic(span);
        match error {
            CompileError::Internal(_) => DeclFailure::Internal(diag),
            _ => DeclFailure::Error(diag),
        }
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Compile `source` through finalization.
pub fn compile_source(source: &str, registry: &Registry, options: &CompileOptions) -> CompileOutput {
    compile(source, registry, options, PassId::Finalize, |_, _| {})
}

/// Compile `source` up to and including `terminal`.
///
/// Preconditions: `registry` is fully loaded.
/// Postconditions: every per-declaration pass up to `terminal` has run for
///   each compiled declaration, in dependency order.
/// Failure modes: see the module header.
/// Side effects: calls `on_pass_complete` after each pass.
pub fn compile(
    source: &str,
    registry: &Registry,
    options: &CompileOptions,
    terminal: PassId,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> CompileOutput {
    let mut diagnostics = Vec::new();
    let provenance = compute_provenance(source, registry);

    // ── parse ──
    let parsed = crate::parser::parse(source);
    for err in &parsed.errors {
        diagnostics.push(
            Diagnostic::new(DiagLevel::Error, *err.span(), err.to_string()).with_code(codes::E0001),
        );
    }
    let schema = match parsed.schema {
        Some(schema) if parsed.errors.is_empty() => schema,
        _ => {
            if diagnostics.is_empty() {
                diagnostics.push(
                    Diagnostic::new(DiagLevel::Error, Span::new((), 0..0), "parse failed with no output")
                        .with_code(codes::E0001),
                );
            }
            return CompileOutput {
                compiled: None,
                diagnostics,
            };
        }
    };

    // ── Resolve ──
    let t = Instant::now();
    let resolved = crate::resolve::resolve(&schema, registry);
    finish_pass(PassId::Resolve, None, t.elapsed(), &resolved.diagnostics, &mut on_pass_complete);
    let resolve_failed = has_error_diags(&resolved.diagnostics);
    diagnostics.extend(resolved.diagnostics);
    let resolved = resolved.resolved;
    if resolve_failed && !options.keep_going {
        return CompileOutput {
            compiled: None,
            diagnostics,
        };
    }

    // ── BuildCatalog ──
    let t = Instant::now();
    let catalog = match AxisCatalog::from_ast(&schema.inputs) {
        Ok(catalog) => {
            finish_pass(PassId::BuildCatalog, None, t.elapsed(), &[], &mut on_pass_complete);
            catalog
        }
        Err(err) => {
            let diag = err.to_diagnostic(schema.span);
            finish_pass(PassId::BuildCatalog, None, t.elapsed(), std::slice::from_ref(&diag), &mut on_pass_complete);
            diagnostics.push(diag);
            return CompileOutput {
                compiled: None,
                diagnostics,
            };
        }
    };

    // ── Order ──
    let t = Instant::now();
    let graph = DependencyGraph::build(&resolved);
    let order = match graph.topo_order() {
        Ok(order) => {
            finish_pass(PassId::Order, None, t.elapsed(), &[], &mut on_pass_complete);
            order
        }
        Err(err) => {
            let span = cycle_span(&err, &resolved).unwrap_or(schema.span);
            let diag = err.to_diagnostic(span);
            finish_pass(PassId::Order, None, t.elapsed(), std::slice::from_ref(&diag), &mut on_pass_complete);
            diagnostics.push(diag);
            return CompileOutput {
                compiled: None,
                diagnostics,
            };
        }
    };

    // ── Per-declaration passes ──
    let mut skip: BTreeMap<String, String> = BTreeMap::new();
    for failed in &resolved.failed {
        mark_failed(failed, &graph, &mut skip);
    }

    let mut runner = DeclRunner {
        schema: &schema,
        resolved: &resolved,
        catalog: &catalog,
        registry,
        options,
        planned: required_passes(terminal),
        decl_shapes: HashMap::new(),
        linked: HashMap::new(),
        on_pass_complete: &mut on_pass_complete,
    };
    let mut compiled = Vec::new();
    let mut skipped = Vec::new();

    for name in &order {
        if resolved.failed.contains(name) {
            skipped.push(name.clone());
            continue;
        }
        if let Some(root) = skip.get(name) {
            if let Some(info) = resolved.get(name) {
                diagnostics.push(
                    Diagnostic::new(
                        DiagLevel::Warning,
                        info.name_span,
                        format!("declaration '{}' skipped: depends on failed declaration '{}'", name, root),
                    )
                    .with_code(codes::W0300),
                );
            }
            warn!(decl = %name, failed = %root, "skipping dependent declaration");
            skipped.push(name.clone());
            continue;
        }
        match runner.run(name) {
            Ok(decl) => compiled.push(decl),
            Err(DeclFailure::Internal(diag)) => {
                diagnostics.push(diag);
                return CompileOutput {
                    compiled: None,
                    diagnostics,
                };
            }
            Err(DeclFailure::Error(diag)) => {
                diagnostics.push(diag);
                if !options.keep_going {
                    return CompileOutput {
                        compiled: None,
                        diagnostics,
                    };
                }
                skipped.push(name.clone());
                mark_failed(name, &graph, &mut skip);
            }
        }
    }

    info!(
        compiled = compiled.len(),
        skipped = skipped.len(),
        "schema compiled"
    );

    CompileOutput {
        compiled: Some(CompiledSchema {
            schema,
            catalog,
            graph,
            declarations: compiled,
            skipped,
            provenance,
        }),
        diagnostics,
    }
}

/// Record every transitive dependent of `failed`, keeping the first cause.
fn mark_failed(failed: &str, graph: &DependencyGraph, skip: &mut BTreeMap<String, String>) {
    for dependent in graph.dependents(failed) {
        skip.entry(dependent).or_insert_with(|| failed.to_string());
    }
}

fn cycle_span(err: &CompileError, resolved: &ResolvedSchema) -> Option<Span> {
    match err {
        CompileError::CyclicDeclaration { cycle } => {
            cycle.first().and_then(|name| resolved.get(name)).map(|d| d.name_span)
        }
        _ => None,
    }
}

// ── Per-declaration runner ─────────────────────────────────────────────────

struct DeclRunner<'a, F: FnMut(PassId, &[Diagnostic])> {
    schema: &'a Schema,
    resolved: &'a ResolvedSchema,
    catalog: &'a AxisCatalog,
    registry: &'a Registry,
    options: &'a CompileOptions,
    /// Passes needed for the terminal, in execution order.
    planned: Vec<PassId>,
    decl_shapes: HashMap<String, Shape>,
    /// Linked declarations of every compiled producer.
    linked: HashMap<String, Declaration>,
    on_pass_complete: &'a mut F,
}

impl<F: FnMut(PassId, &[Diagnostic])> DeclRunner<'_, F> {
    fn finish(&mut self, pass: PassId, name: &str, t: Instant) -> bool {
        finish_pass(pass, Some(name), t.elapsed(), &[], self.on_pass_complete);
        self.planned.iter().any(|&p| p > pass)
    }

    fn fail(&mut self, pass: PassId, name: &str, t: Instant, failure: DeclFailure) -> DeclFailure {
        let diag = match &failure {
            DeclFailure::Error(d) | DeclFailure::Internal(d) => d.clone(),
        };
        finish_pass(pass, Some(name), t.elapsed(), std::slice::from_ref(&diag), self.on_pass_complete);
        failure
    }

    fn run(&mut self, name: &str) -> Result<CompiledDeclaration, DeclFailure> {
        let info = self
            .resolved
            .get(name)
            .ok_or_else(|| DeclFailure::from_error(CompileError::internal(format!("'{}' was never resolved", name)), self.schema.span))?;
        let decl_ast = self.schema.decls.get(info.stmt_index).ok_or_else(|| {
            DeclFailure::from_error(CompileError::internal(format!("'{}' has no statement", name)), info.name_span)
        })?;
        let span = decl_ast.span;
        let kind = info.kind;

        // InferShapes
        let t = Instant::now();
        let ctx = InferCtx {
            catalog: self.catalog,
            registry: self.registry,
            decl_shapes: &self.decl_shapes,
        };
        let shaped = match crate::shape_infer::infer(&decl_ast.expr, &ctx) {
            Ok(shaped) => shaped,
            Err(err) => {
                let diag = err.to_diagnostic();
                let failure = match err.error {
                    CompileError::Internal(_) => DeclFailure::Internal(diag),
                    _ => DeclFailure::Error(diag),
                };
                return Err(self.fail(PassId::InferShapes, name, t, failure));
            }
        };
        self.decl_shapes.insert(name.to_string(), shaped.shape.clone());
        let mut out = CompiledDeclaration {
            name: name.to_string(),
            kind,
            shaped,
            declaration: None,
            program: None,
        };
        if !self.finish(PassId::InferShapes, name, t) {
            return Ok(out);
        }

        // BuildOps
        let t = Instant::now();
        let mut declaration = match crate::lower::build_declaration(name, kind, &out.shaped) {
            Ok(d) => d,
            Err(err) => return Err(self.fail(PassId::BuildOps, name, t, DeclFailure::from_error(err, span))),
        };
        let cert = crate::lower::verify_declaration(&declaration);
        if !cert.all_pass() {
            let err = CompileError::internal(format!(
                "op verification failed for '{}': {}",
                name,
                cert.failed().join(", ")
            ));
            return Err(self.fail(PassId::BuildOps, name, t, DeclFailure::from_error(err, span)));
        }
        if !self.finish(PassId::BuildOps, name, t) {
            out.declaration = Some(declaration);
            return Ok(out);
        }

        // LinkRefs
        let t = Instant::now();
        if let Err(err) = crate::schedule::link_references(&mut declaration, &self.linked, self.options.inline_policy) {
            return Err(self.fail(PassId::LinkRefs, name, t, DeclFailure::from_error(err, span)));
        }
        self.linked.insert(name.to_string(), declaration.clone());
        let more = self.finish(PassId::LinkRefs, name, t);
        out.declaration = Some(declaration);
        if !more {
            return Ok(out);
        }
        let Some(declaration) = out.declaration.as_ref() else {
            return Ok(out);
        };

        // EmitLoops
        let t = Instant::now();
        let emit_ctx = EmitCtx {
            catalog: self.catalog,
            registry: self.registry,
            declarations: &self.linked,
        };
        let mut program = match crate::lir::emit_program(declaration, &emit_ctx) {
            Ok(p) => p,
            Err(err) => return Err(self.fail(PassId::EmitLoops, name, t, DeclFailure::from_error(err, span))),
        };
        if let Err(failure) = check_program(&program, span) {
            return Err(self.fail(PassId::EmitLoops, name, t, failure));
        }
        if !self.finish(PassId::EmitLoops, name, t) {
            out.program = Some(program);
            return Ok(out);
        }

        // Fuse
        let t = Instant::now();
        let fused = if self.options.fuse {
            crate::fusion::fuse_program(&mut program).map(|_| ())
        } else {
            program.advance(ProgramState::Fused)
        };
        if let Err(err) = fused {
            return Err(self.fail(PassId::Fuse, name, t, DeclFailure::from_error(err, span)));
        }
        if !self.finish(PassId::Fuse, name, t) {
            out.program = Some(program);
            return Ok(out);
        }

        // Schedule
        let t = Instant::now();
        let scheduled = if self.options.hoist {
            crate::schedule::schedule_program(&mut program).map(|_| ())
        } else {
            program.advance(ProgramState::Scheduled)
        };
        if let Err(err) = scheduled {
            return Err(self.fail(PassId::Schedule, name, t, DeclFailure::from_error(err, span)));
        }
        if !self.finish(PassId::Schedule, name, t) {
            out.program = Some(program);
            return Ok(out);
        }

        // Finalize
        let t = Instant::now();
        if let Err(failure) = check_program(&program, span) {
            return Err(self.fail(PassId::Finalize, name, t, failure));
        }
        if let Err(err) = crate::schedule::finalize_program(&mut program) {
            return Err(self.fail(PassId::Finalize, name, t, DeclFailure::from_error(err, span)));
        }
        self.finish(PassId::Finalize, name, t);
        out.program = Some(program);
        Ok(out)
    }
}

fn check_program(program: &LoopProgram, span: Span) -> Result<(), DeclFailure> {
    let cert = verify_program(program);
    if cert.all_pass() {
        return Ok(());
    }
    let diag = Diagnostic::new(
        DiagLevel::Error,
        span,
        format!(
            "loop program verification failed for '{}': {}",
            program.declaration,
            cert.failed().join(", ")
        ),
    )
    .with_code(codes::E0901)
    .with_hint("this is a compiler bug");
    Err(DeclFailure::Internal(diag))
}

// ── Tests ──────────────────────────────────────────────────────────────────
