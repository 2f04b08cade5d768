// Property-based tests for lowering invariants.
//
// Two categories:
// 1. For loops: the carried vector is condition first, then every loop
//    variable, with one defined/blocking flag per entry
// 2. Construct nesting: generated programs of nested if/foreach/block
//    statements always lower to a balanced instruction stream
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use proptest::prelude::*;
use std::path::Path;

use wfc::config::Settings;
use wfc::ir::check_balanced;
use wfc::pipeline::{compile_source, CompileOutput};

// ── Test helpers ────────────────────────────────────────────────────────────

const PRELUDE: &str = r#"() trace (int i) "weft" "0.3" "trace";"#;

fn compile(body: &str) -> CompileOutput {
    let settings = Settings {
        implicit_imports: Vec::new(),
        ..Settings::default()
    };
    let src = format!("{}\nmain {{\n{}\n}}\n", PRELUDE, body);
    compile_source(Path::new("prop.weft"), &src, settings)
        .unwrap_or_else(|e| panic!("compile failed: {}\n{}", e, src))
}

// ── For-loop carried vector ─────────────────────────────────────────────────

fn for_loop_source(declared: usize, outer: usize) -> String {
    let mut src = String::new();
    for k in 0..outer {
        src.push_str(&format!("int o{};\n", k));
    }
    let mut init = vec!["int i = 0".to_string()];
    init.extend((0..declared).map(|k| format!("int d{} = {}", k, k)));
    init.extend((0..outer).map(|k| format!("o{} = 0", k)));
    src.push_str(&format!("for ({}; i < 4; i = i + 1) {{ trace(i); }}\n", init.join(", ")));
    src
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn for_loop_flags_cover_every_variable(declared in 0usize..5, outer in 0usize..4) {
        let out = compile(&for_loop_source(declared, outer));
        let ir = out.ir.render();
        let defined = format!(
            "defined={}{}",
            "1".repeat(declared + 2),
            "0".repeat(outer)
        );
        let blocking = format!("blocking={}", "1".repeat(declared + outer + 2));
        prop_assert!(ir.contains(&format!("{} {}", defined, blocking)), "{}", ir);
        prop_assert_eq!(ir.matches("continue (").count(), 1);
        prop_assert_eq!(ir.matches("break").count(), 1);
    }
}

// ── Nested constructs ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Node {
    Call(i64),
    If(Vec<Node>, Vec<Node>),
    Foreach(Vec<Node>),
    Block(Vec<Node>),
}

fn arb_nodes() -> impl Strategy<Value = Vec<Node>> {
    let leaf = (0i64..100).prop_map(Node::Call);
    let node = leaf.prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            (
                prop::collection::vec(inner.clone(), 0..3),
                prop::collection::vec(inner.clone(), 0..3)
            )
                .prop_map(|(t, e)| Node::If(t, e)),
            prop::collection::vec(inner.clone(), 0..3).prop_map(Node::Foreach),
            prop::collection::vec(inner, 0..3).prop_map(Node::Block),
        ]
    });
    prop::collection::vec(node, 1..4)
}

/// Render statements; loop members get unique names so nothing shadows.
fn render(nodes: &[Node], next_name: &mut usize, out: &mut String) {
    for node in nodes {
        match node {
            Node::Call(v) => out.push_str(&format!("trace({});\n", v)),
            Node::If(t, e) => {
                out.push_str("if (true) {\n");
                render(t, next_name, out);
                out.push_str("} else {\n");
                render(e, next_name, out);
                out.push_str("}\n");
            }
            Node::Foreach(body) => {
                let name = format!("m{}", *next_name);
                *next_name += 1;
                out.push_str(&format!("foreach {} in [0:2] {{\n", name));
                render(body, next_name, out);
                out.push_str("}\n");
            }
            Node::Block(body) => {
                out.push_str("{\n");
                render(body, next_name, out);
                out.push_str("}\n");
            }
        }
    }
}

fn count(nodes: &[Node], pred: &dyn Fn(&Node) -> bool) -> usize {
    nodes
        .iter()
        .map(|n| {
            let own = usize::from(pred(n));
            own + match n {
                Node::Call(_) => 0,
                Node::If(t, e) => count(t, pred) + count(e, pred),
                Node::Foreach(b) | Node::Block(b) => count(b, pred),
            }
        })
        .sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn nested_constructs_lower_balanced(nodes in arb_nodes()) {
        let mut body = String::new();
        render(&nodes, &mut 0, &mut body);
        let out = compile(&body);
        prop_assert!(check_balanced(&out.ir.instrs).is_ok());

        let ir = out.ir.render();
        let ifs = count(&nodes, &|n| matches!(n, Node::If(..)));
        let loops = count(&nodes, &|n| matches!(n, Node::Foreach(_)));
        let calls = count(&nodes, &|n| matches!(n, Node::Call(_)));
        prop_assert_eq!(ir.matches("end if\n").count(), ifs);
        prop_assert_eq!(ir.matches("end range\n").count(), loops);
        prop_assert_eq!(ir.matches("call trace").count(), calls);
    }

    #[test]
    fn lowering_is_deterministic(nodes in arb_nodes()) {
        let mut body = String::new();
        render(&nodes, &mut 0, &mut body);
        let a = compile(&body).ir.render();
        let b = compile(&body).ir.render();
        prop_assert_eq!(a, b);
    }
}
