use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use std::path::Path;
use wfc::config::Settings;
use wfc::*;

// Scenarios are self-contained: no implicit imports are loaded.

const PRELUDE: &str = r#"
@builtin_op=MAX_INT (int o) max_integer (int a, int b) "weft" "0.3" "max_integer";
(int o) work (int i) "weft" "0.3" "work";
@dispatch=LOCAL () trace (int i) "weft" "0.3" "trace";
"#;

const SIMPLE: &str = r#"
main {
    int x = 1 + 2;
    int y = max_integer(x, 4);
    trace(y);
}
"#;

const LOOPS: &str = r#"
main {
    int A[];
    foreach i in [0:99] {
        A[i] = work(i);
    }
    foreach v, k in A {
        trace(v + k);
    }
    for (int i = 0, int acc = 0; i < 10; i = i + 1, acc = acc + i) {
        trace(acc);
    }
    iterate k {
        trace(k);
    } until (k > 5);
}
"#;

const CONTROL: &str = r#"
(int o) classify (int x) {
    if (x < 0) {
        o = -1;
    } else if (x == 0) {
        o = 0;
    } else {
        switch (x) {
            case 1: o = 1;
            case 2: o = 2;
            default: o = 3;
        }
    }
}

main {
    int a = classify(4);
    wait (a) {
        trace(a);
    }
    int b = work(1) => int c = work(b) => trace(c);
}
"#;

const APPS: &str = r#"
app (file o) cp (file i) { "cp" @i @o; }
@pure app (file o) gen (int n, string s) { "gen" n s @stdout=o; }

main {
    file a<"in.txt">;
    file b<"out.txt"> = cp(a);
    file c<"gen.txt"> = gen(3, "x");
}
"#;

fn scenarios() -> [(&'static str, &'static str); 4] {
    [
        ("simple", SIMPLE),
        ("loops", LOOPS),
        ("control", CONTROL),
        ("apps", APPS),
    ]
}

fn with_prelude(source: &str) -> String {
    format!("{}\n{}", PRELUDE, source)
}

/// Chain of `n` composite functions, each calling the previous one.
fn generate_scaling_program(n_functions: usize) -> String {
    let mut src = String::from(PRELUDE);
    for f in 0..n_functions {
        src.push_str(&format!("(int o) stage_{} (int i) {{\n", f));
        if f == 0 {
            src.push_str("    o = work(i);\n");
        } else {
            src.push_str(&format!("    int t = stage_{}(i);\n    o = t + 1;\n", f - 1));
        }
        src.push_str("}\n\n");
    }
    src.push_str(&format!(
        "main {{\n    trace(stage_{}(0));\n}}\n",
        n_functions.saturating_sub(1)
    ));
    src
}

fn bare_settings() -> Settings {
    Settings {
        implicit_imports: Vec::new(),
        ..Settings::default()
    }
}

fn compile_full(source: &str) {
    let out = pipeline::compile_source(Path::new("bench.weft"), source, bare_settings())
        .expect("benchmark scenario must compile");
    black_box(out.ir.instrs.len());
}

// Parser latency for representative scenarios.
fn bench_parse_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/parse_latency");
    for (name, source) in scenarios() {
        let source = with_prelude(source);
        group.bench_with_input(BenchmarkId::from_parameter(name), &source, |b, source| {
            b.iter(|| {
                let result = parser::parse(black_box(source));
                black_box(&result.program);
            });
        });
    }
    group.finish();
}

// Full frontend latency (parse -> definitions -> lowering).
fn bench_full_compile_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/full_compile_latency");
    for (name, source) in scenarios() {
        let source = with_prelude(source);
        group.bench_with_input(BenchmarkId::from_parameter(name), &source, |b, source| {
            b.iter(|| compile_full(black_box(source)));
        });
    }
    group.finish();
}

// Lowering alone, with parsing moved into setup.
fn bench_walk_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/walk_latency");
    let source = with_prelude(LOOPS);
    group.bench_function("loops", |b| {
        b.iter_batched(
            || loader::LoadedModule::main("bench.weft", source.clone()).unwrap(),
            |main| {
                let mut buf = ir::IrBuffer::new();
                {
                    let mut session = loader::Session::new(bare_settings(), &mut buf);
                    session.walk(main).unwrap();
                }
                black_box(buf.instrs.len());
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

// Compile time as the number of functions grows.
fn bench_compile_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("kpi/compile_scaling");
    for n_functions in [1_usize, 5, 10, 20, 40] {
        let source = generate_scaling_program(n_functions);
        group.bench_with_input(
            BenchmarkId::from_parameter(n_functions),
            &source,
            |b, source| {
                b.iter(|| compile_full(black_box(source)));
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_parse_latency,
    bench_full_compile_latency,
    bench_walk_latency,
    bench_compile_scaling
);
criterion_main!(benches);
