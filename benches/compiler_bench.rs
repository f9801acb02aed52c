use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use nestc::*;
use std::path::Path;

// Benchmark scenarios: the bundled demo schemas plus a generated schema whose
// declaration count scales.

fn demo_source(name: &str) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).parent().unwrap();
    std::fs::read_to_string(root.join("demos").join(format!("{}.nest", name)))
        .unwrap_or_else(|e| panic!("failed to read demo {}: {}", name, e))
}

fn scenarios() -> Vec<(&'static str, String)> {
    ["shop", "departments", "batch", "vectors"]
        .into_iter()
        .map(|name| (name, demo_source(name)))
        .collect()
}

/// A chain of `n` declarations over one nested collection. Every third link
/// also gets a per-group total, so references mix inline and indexed modes.
fn generate_scaling_schema(n: usize) -> String {
    let mut src = String::from(
        "input {\n    array groups { array cells { float v  float w } }\n    object config { float bias }\n}\n",
    );
    src.push_str("value d0 = input.groups.cells.v * input.groups.cells.w\n");
    for i in 1..n {
        src.push_str(&format!(
            "value d{} = d{} * input.config.bias + input.groups.cells.v\n",
            i,
            i - 1
        ));
        if i % 3 == 0 {
            src.push_str(&format!("value s{} = sum(d{})\n", i, i));
        }
    }
    src
}

fn registry() -> registry::Registry {
    registry::Registry::builtin().expect("built-in catalog loads")
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &source, |b, source| {
            b.iter(|| {
                let r = parser::parse(black_box(source.as_str()));
                black_box(&r.schema);
            });
        });
    }
    group.finish();
}

fn bench_full_compile(c: &mut Criterion) {
    let registry = registry();
    let options = pipeline::CompileOptions::default();
    let mut group = c.benchmark_group("full_compile");
    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &source, |b, source| {
            b.iter(|| {
                let out = pipeline::compile_source(black_box(source), &registry, &options);
                assert!(!out.has_errors());
                black_box(&out.compiled);
            });
        });
    }
    group.finish();
}

/// Compile to each terminal pass; differences between groups give the cost
/// of the passes in between.
fn bench_phase_latency(c: &mut Criterion) {
    let registry = registry();
    let options = pipeline::CompileOptions::default();
    let source = demo_source("batch");
    for (label, terminal) in [
        ("infer_shapes", pass::PassId::InferShapes),
        ("link_refs", pass::PassId::LinkRefs),
        ("emit_loops", pass::PassId::EmitLoops),
        ("fuse", pass::PassId::Fuse),
        ("finalize", pass::PassId::Finalize),
    ] {
        let mut group = c.benchmark_group(format!("phase_latency/{}", label));
        group.bench_function("batch", |b| {
            b.iter(|| {
                let out = pipeline::compile(black_box(&source), &registry, &options, terminal, |_, _| {});
                black_box(&out.compiled);
            });
        });
        group.finish();
    }
}

fn bench_evaluate(c: &mut Criterion) {
    let registry = registry();
    let source = demo_source("departments");
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).parent().unwrap();
    let input: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(root.join("demos").join("departments.json")).unwrap(),
    )
    .unwrap();
    let mut group = c.benchmark_group("evaluate");
    group.bench_function("departments", |b| {
        b.iter_batched(
            || {
                pipeline::compile_source(&source, &registry, &pipeline::CompileOptions::default())
                    .compiled
                    .unwrap()
            },
            |compiled| black_box(eval::evaluate_schema(&compiled, black_box(&input)).unwrap()),
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_compile_scaling(c: &mut Criterion) {
    let registry = registry();
    let options = pipeline::CompileOptions::default();
    let mut group = c.benchmark_group("compile_scaling");
    for n in [4_usize, 16, 64] {
        let source = generate_scaling_schema(n);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}decls", n)),
            &source,
            |b, source| {
                b.iter(|| {
                    let out = pipeline::compile_source(black_box(source), &registry, &options);
                    black_box(&out.compiled);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_full_compile,
    bench_phase_latency,
    bench_evaluate,
    bench_compile_scaling
);
criterion_main!(benches);
