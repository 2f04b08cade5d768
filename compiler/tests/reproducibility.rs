// Reproducibility and CLI tests.
//
// These tests run the `wfc` binary and verify that identical inputs give
// byte-identical outputs, that every emit stage works and that failures map
// to the documented exit codes.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn wfc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_wfc"))
}

const PROGRAM: &str = r#"
import shapes;

app (file o) render (file i, int scale) { "render" "-s" scale @i @stdout=o; }

main {
    file input<"in.txt">;
    file out<"out.txt"> = render(input, area(3));
    int A[];
    foreach v in [1:4] {
        A[v] = area(v);
    }
    trace(fromint(size(A)));
}
"#;

const SHAPES: &str = "(int a) area (int side) { a = side * side; }";

fn setup() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.weft"), PROGRAM).unwrap();
    std::fs::write(dir.path().join("shapes.weft"), SHAPES).unwrap();
    dir
}

fn run_wfc(args: &[&str]) -> Output {
    Command::new(wfc_binary())
        .args(args)
        .output()
        .expect("failed to run wfc")
}

fn run_ok(args: &[&str]) -> String {
    let output = run_wfc(args);
    assert!(
        output.status.success(),
        "wfc failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

fn main_args<'a>(dir: &'a Path, emit: &'a str) -> Vec<String> {
    vec![
        dir.join("main.weft").display().to_string(),
        "-I".to_string(),
        dir.display().to_string(),
        "--emit".to_string(),
        emit.to_string(),
    ]
}

fn run_stage(dir: &Path, emit: &str) -> String {
    let args = main_args(dir, emit);
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run_ok(&refs)
}

#[test]
fn ir_is_byte_identical_across_runs() {
    let dir = setup();
    let first = run_stage(dir.path(), "ir");
    let second = run_stage(dir.path(), "ir");
    assert_eq!(first, second);
    assert!(first.contains("function area (int a) <- (int side) CONTROL"), "{}", first);
    assert!(first.contains("wait render-app-leaf0"), "{}", first);
}

#[test]
fn json_emit_parses() {
    let dir = setup();
    let json = run_stage(dir.path(), "json");
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value["instrs"].as_array().is_some_and(|a| !a.is_empty()));
}

#[test]
fn defs_list_every_function() {
    let dir = setup();
    let defs = run_stage(dir.path(), "defs");
    for name in ["area", "render", "main", "trace", "size"] {
        assert!(
            defs.lines().any(|l| l.split_whitespace().nth(1) == Some(name)),
            "{} missing from\n{}",
            name,
            defs
        );
    }
    assert!(
        defs.lines()
            .any(|l| l.contains(" max_integer ") && l.ends_with(" pure,commutative,minmax")),
        "{}",
        defs
    );
}

#[test]
fn build_info_is_stable_and_tracks_imports() {
    let dir = setup();
    let a = run_stage(dir.path(), "build-info");
    let b = run_stage(dir.path(), "build-info");
    assert_eq!(a, b);
    let before: serde_json::Value = serde_json::from_str(&a).unwrap();
    assert_eq!(before["source_hash"].as_str().unwrap().len(), 64);

    std::fs::write(
        dir.path().join("shapes.weft"),
        "(int a) area (int side) { a = side * side * 1; }",
    )
    .unwrap();
    let after: serde_json::Value = serde_json::from_str(&run_stage(dir.path(), "build-info")).unwrap();
    assert_eq!(before["source_hash"], after["source_hash"]);
    assert_ne!(before["module_fingerprint"], after["module_fingerprint"]);
}

#[test]
fn output_flag_writes_file() {
    let dir = setup();
    let out = dir.path().join("out.ir");
    let mut args = main_args(dir.path(), "ir");
    args.push("-o".to_string());
    args.push(out.display().to_string());
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let stdout = run_ok(&refs);
    assert!(stdout.is_empty());
    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written, run_stage(dir.path(), "ir"));
}

#[test]
fn config_file_sets_entry_point() {
    let dir = setup();
    std::fs::write(dir.path().join("entry.weft"), "() start () { }").unwrap();
    let config = dir.path().join("wfc.json");
    std::fs::write(&config, r#"{ "main_function": "start", "implicit_imports": [] }"#).unwrap();
    let output = run_wfc(&[
        dir.path().join("entry.weft").to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
}

#[test]
fn compile_errors_exit_with_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.weft");
    std::fs::write(&path, "main { int x = \"s\"; }").unwrap();
    let output = run_wfc(&[path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("wfc: error[E0300]"), "{}", stderr);
}

#[test]
fn missing_source_exits_with_two() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_wfc(&[dir.path().join("nope.weft").to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}
