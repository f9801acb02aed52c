// resolve.rs — Name resolution for .nest schemas
//
// Builds the declaration table, records which declarations each one
// references, and reports unknown or duplicate names and calls to
// functions the registry does not know.
//
// Preconditions: `schema` is a well-formed AST from the parser.
//                `registry` is fully loaded.
// Postconditions: returns the declaration table plus all accumulated
//                 diagnostics; declarations with errors are listed in `failed`.
// Failure modes: unknown references (E0301), duplicate names (E0302),
//                unknown functions (E0202). Resolution continues past errors.
// Side effects: none.

use std::collections::{BTreeSet, HashMap};

use crate::ast::{DeclKind, Expr, ExprKind, Schema, Span};
use crate::diag::Diagnostic;
use crate::error::CompileError;
use crate::registry::Registry;

// ── Public types ────────────────────────────────────────────────────────────

/// Result of name resolution.
#[derive(Debug)]
pub struct ResolveResult {
    pub resolved: ResolvedSchema,
    pub diagnostics: Vec<Diagnostic>,
}

/// One declaration as seen by later passes.
#[derive(Debug, Clone)]
pub struct DeclInfo {
    pub name: String,
    pub kind: DeclKind,
    /// Index into `Schema::decls`.
    pub stmt_index: usize,
    pub name_span: Span,
    /// Referenced declarations, first use first, without repeats.
    pub deps: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedSchema {
    /// Declarations in source order. Later duplicates are not included.
    pub decls: Vec<DeclInfo>,
    index: HashMap<String, usize>,
    /// Declarations that reported a resolution error.
    pub failed: BTreeSet<String>,
}

impl ResolvedSchema {
    pub fn get(&self, name: &str) -> Option<&DeclInfo> {
        self.index.get(name).map(|&i| &self.decls[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.decls.iter().map(|d| d.name.as_str())
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Resolve all names in a parsed schema.
pub fn resolve(schema: &Schema, registry: &Registry) -> ResolveResult {
    let mut ctx = ResolveCtx {
        registry,
        resolved: ResolvedSchema::default(),
        diagnostics: Vec::new(),
    };

    // Pass 1: collect declaration names
    ctx.collect_decls(schema);

    // Pass 2: resolve references in each body
    ctx.resolve_bodies(schema);

    ResolveResult {
        resolved: ctx.resolved,
        diagnostics: ctx.diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct ResolveCtx<'a> {
    registry: &'a Registry,
    resolved: ResolvedSchema,
    diagnostics: Vec<Diagnostic>,
}

impl ResolveCtx<'_> {
    fn report(&mut self, decl: &str, err: CompileError, span: Span) {
        self.diagnostics.push(err.to_diagnostic(span));
        self.resolved.failed.insert(decl.to_string());
    }

    fn collect_decls(&mut self, schema: &Schema) {
        for (i, decl) in schema.decls.iter().enumerate() {
            let name = &decl.name.name;
            if let Some(&existing) = self.resolved.index.get(name) {
                let first = self.resolved.decls[existing].name_span;
                let diag = CompileError::DuplicateDeclaration { name: name.clone() }
                    .to_diagnostic(decl.name.span)
                    .with_related(first, "first defined here");
                self.diagnostics.push(diag);
                self.resolved.failed.insert(name.clone());
                continue;
            }
            self.resolved.index.insert(name.clone(), self.resolved.decls.len());
            self.resolved.decls.push(DeclInfo {
                name: name.clone(),
                kind: decl.kind,
                stmt_index: i,
                name_span: decl.name.span,
                deps: Vec::new(),
            });
        }
    }

    fn resolve_bodies(&mut self, schema: &Schema) {
        for i in 0..self.resolved.decls.len() {
            let stmt_index = self.resolved.decls[i].stmt_index;
            let name = self.resolved.decls[i].name.clone();
            let mut deps = Vec::new();
            self.walk(&name, &schema.decls[stmt_index].expr, &mut deps);
            self.resolved.decls[i].deps = deps;
        }
    }

    fn walk(&mut self, decl: &str, expr: &Expr, deps: &mut Vec<String>) {
        match &expr.kind {
            ExprKind::Literal(_) | ExprKind::Input(_) => {}
            ExprKind::Ref(ident) => {
                if !self.resolved.contains(&ident.name) {
                    self.report(
                        decl,
                        CompileError::UnknownDeclaration {
                            name: ident.name.clone(),
                        },
                        ident.span,
                    );
                } else if !deps.contains(&ident.name) {
                    deps.push(ident.name.clone());
                }
            }
            ExprKind::Call { func, args } => {
                if self.registry.lookup(&func.name).is_none() {
                    self.report(
                        decl,
                        CompileError::UnknownFunction {
                            name: func.name.clone(),
                        },
                        func.span,
                    );
                }
                for arg in args {
                    self.walk(decl, arg, deps);
                }
            }
            ExprKind::Cascade { arms, default } => {
                for (cond, value) in arms {
                    self.walk(decl, cond, deps);
                    self.walk(decl, value, deps);
                }
                if let Some(d) = default {
                    self.walk(decl, d, deps);
                }
            }
            ExprKind::Array(items) => {
                for item in items {
                    self.walk(decl, item, deps);
                }
            }
            ExprKind::Object(fields) => {
                for (_, value) in fields {
                    self.walk(decl, value, deps);
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
