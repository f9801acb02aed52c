use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nestc::diag::Diagnostic;
use nestc::pass::PassId;
use nestc::pipeline::{CompileOptions, CompileOutput, CompiledSchema};
use nestc::registry::Registry;
use nestc::render::{render_all, PseudoRenderer};
use nestc::schedule::InlinePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    Ast,
    Shapes,
    Ops,
    Loops,
    Pseudo,
    Dot,
    BuildInfo,
    Run,
}

impl EmitStage {
    fn terminal(self) -> PassId {
        match self {
            EmitStage::Shapes => PassId::InferShapes,
            EmitStage::Ops | EmitStage::Dot => PassId::LinkRefs,
            _ => PassId::Finalize,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "nestc",
    version,
    about = "Nest Compiler — compiles declarative array schemas to fused nested-loop programs"
)]
struct Cli {
    /// Input .nest schema file
    schema: PathBuf,

    /// Extra signature catalog (JSON, repeatable)
    #[arg(long = "catalog")]
    catalogs: Vec<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Loops)]
    emit: EmitStage,

    /// Input document for `--emit run`
    #[arg(long)]
    input: Option<PathBuf>,

    /// How references between declarations are satisfied
    #[arg(long = "inline", value_enum, default_value_t = InlinePolicy::Auto)]
    inline_policy: InlinePolicy,

    /// Keep sibling loops over the same collection separate
    #[arg(long)]
    no_fuse: bool,

    /// Leave loop-invariant instructions where they were emitted
    #[arg(long)]
    no_hoist: bool,

    /// Skip failing declarations and their dependents instead of stopping
    #[arg(long)]
    keep_going: bool,

    /// Debug-level logging of every pass
    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "nestc=debug" } else { "nestc=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `file:line:col` for a byte offset.
fn location(path: &Path, source: &str, offset: usize) -> String {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before.rfind('\n').map_or(offset, |nl| offset - nl - 1) + 1;
    format!("{}:{}:{}", path.display(), line, col)
}

fn report(path: &Path, source: &str, diags: &[Diagnostic]) {
    for diag in diags {
        eprintln!("{}: {}", location(path, source, diag.span.start), diag);
    }
}

fn io_error(what: &Path, err: impl std::fmt::Display) -> ExitCode {
    eprintln!("nestc: error: {}: {}", what.display(), err);
    ExitCode::from(2)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // ── Load signature catalog ──
    let mut registry = match Registry::builtin() {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("nestc: error: built-in catalog: {}", e);
            return ExitCode::from(2);
        }
    };
    for path in &cli.catalogs {
        match registry.load_file(path) {
            Ok(n) => info!(path = %path.display(), functions = n, "catalog loaded"),
            Err(e) => return io_error(path, e),
        }
    }

    // ── Read source ──
    let source = match std::fs::read_to_string(&cli.schema) {
        Ok(s) => s,
        Err(e) => return io_error(&cli.schema, e),
    };

    if cli.emit == EmitStage::Ast {
        let parsed = nestc::parser::parse(&source);
        if !parsed.errors.is_empty() {
            for err in &parsed.errors {
                eprintln!("{}: error: {}", location(&cli.schema, &source, err.span().start), err);
            }
            return ExitCode::from(1);
        }
        match parsed.schema {
            Some(schema) => {
                println!("{:#?}", schema);
                return ExitCode::SUCCESS;
            }
            None => {
                eprintln!("nestc: error: parse failed with no output");
                return ExitCode::from(1);
            }
        }
    }

    if cli.emit == EmitStage::BuildInfo {
        let provenance = nestc::pipeline::compute_provenance(&source, &registry);
        print!("{}", provenance.to_json());
        return ExitCode::SUCCESS;
    }

    // ── Compile ──
    let options = CompileOptions {
        inline_policy: cli.inline_policy,
        fuse: !cli.no_fuse,
        hoist: !cli.no_hoist,
        keep_going: cli.keep_going,
        verbose: cli.verbose,
    };
    let CompileOutput { compiled, diagnostics } =
        nestc::pipeline::compile(&source, &registry, &options, cli.emit.terminal(), |_, _| {});
    report(&cli.schema, &source, &diagnostics);
    let failed = diagnostics.iter().any(|d| d.level == nestc::diag::DiagLevel::Error);
    let Some(compiled) = compiled else {
        return ExitCode::from(1);
    };

    let code = match emit(&cli, &compiled) {
        Ok(text) => {
            print!("{}", text);
            ExitCode::SUCCESS
        }
        Err(code) => code,
    };
    if failed {
        ExitCode::from(1)
    } else {
        code
    }
}

fn emit(cli: &Cli, compiled: &CompiledSchema) -> Result<String, ExitCode> {
    let mut out = String::new();
    match cli.emit {
        EmitStage::Shapes => {
            for decl in &compiled.declarations {
                out.push_str(&format!("{} {} : {}\n", decl.kind, decl.name, decl.shaped.shape));
                for line in decl.shaped.to_tree().lines() {
                    out.push_str(&format!("  {}\n", line));
                }
            }
        }
        EmitStage::Ops => {
            for decl in compiled.declarations.iter().filter_map(|d| d.declaration.as_ref()) {
                out.push_str(&decl.to_string());
            }
        }
        EmitStage::Loops => {
            for program in compiled.programs() {
                out.push_str(&program.to_string());
            }
        }
        EmitStage::Pseudo => {
            let mut renderer = PseudoRenderer::new();
            out = render_all(compiled.programs(), &mut renderer).map_err(|e| {
                eprintln!("nestc: error: {}", e);
                ExitCode::from(1)
            })?;
        }
        EmitStage::Dot => out = nestc::dot::emit_dot(compiled),
        EmitStage::Run => {
            let Some(path) = &cli.input else {
                eprintln!("nestc: error: --emit run needs --input DATA.json");
                return Err(ExitCode::from(2));
            };
            let text = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
            let input: serde_json::Value = serde_json::from_str(&text).map_err(|e| io_error(path, e))?;
            let results: BTreeMap<String, serde_json::Value> =
                nestc::eval::evaluate_schema(compiled, &input).map_err(|e| {
                    eprintln!("nestc: error: {}", e);
                    ExitCode::from(1)
                })?;
            let mut text = serde_json::to_string_pretty(&results).map_err(|e| {
                eprintln!("nestc: error: {}", e);
                ExitCode::from(1)
            })?;
            text.push('\n');
            out = text;
        }
        EmitStage::Ast | EmitStage::BuildInfo => {}
    }
    Ok(out)
}
