// usage.rs — Variable usage summaries for statement blocks
//
// Computes, per block, which variables visible from outside the block are
// possibly assigned inside it. Struct variables track assignments per
// field path. Names declared inside the block (including loop members and
// chain-stage declarations) shadow outer names and are not reported.
//
// Preconditions: block is a parsed AST fragment; no name resolution needed.
// Postconditions: a name is reported iff some assignment inside the block
//   may target the outer variable of that name (conservative).
// Failure modes: none.
// Side effects: none.

use std::collections::{BTreeMap, HashSet};

use crate::ast::{Block, ForStmt, LValueExpr, PathStep, Stmt, StmtKind};

/// Assignment facts for one variable or struct field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarUsage {
    /// Assigned as a whole (or, for arrays, element-wise).
    pub assigned: bool,
    pub fields: BTreeMap<String, VarUsage>,
}

impl VarUsage {
    /// Assigned anywhere at or below this node.
    pub fn possibly_assigned(&self) -> bool {
        self.assigned || self.fields.values().any(|f| f.possibly_assigned())
    }

    pub fn field(&self, name: &str) -> Option<&VarUsage> {
        self.fields.get(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSummary {
    vars: BTreeMap<String, VarUsage>,
}

impl UsageSummary {
    pub fn lookup(&self, name: &str) -> Option<&VarUsage> {
        self.vars.get(name)
    }

    pub fn possibly_assigned(&self, name: &str) -> bool {
        self.lookup(name).is_some_and(|u| u.possibly_assigned())
    }

    /// Names of outer variables possibly assigned, sorted.
    pub fn assigned_names(&self) -> Vec<&str> {
        self.vars
            .iter()
            .filter(|(_, u)| u.possibly_assigned())
            .map(|(n, _)| n.as_str())
            .collect()
    }

    fn record(&mut self, target: &LValueExpr) {
        let mut node = self.vars.entry(target.root.name.clone()).or_default();
        for step in &target.path {
            match step {
                PathStep::Field(f) => node = node.fields.entry(f.name.clone()).or_default(),
                PathStep::Index(_) => break,
            }
        }
        node.assigned = true;
    }

    fn record_name(&mut self, name: &str) {
        self.vars.entry(name.to_string()).or_default().assigned = true;
    }
}

/// Summarize assignments to outer variables within `block`.
pub fn summarize_block(block: &Block) -> UsageSummary {
    let mut summary = UsageSummary::default();
    let mut locals = HashSet::new();
    collect_block(&mut summary, block, &mut locals);
    summary
}

/// Summarize a statement list sharing one scope (a chain, or a case body).
pub fn summarize_stmts(stmts: &[Stmt]) -> UsageSummary {
    let mut summary = UsageSummary::default();
    let mut locals = HashSet::new();
    for s in stmts {
        collect_stmt(&mut summary, s, &mut locals);
    }
    summary
}

fn collect_block(summary: &mut UsageSummary, block: &Block, outer: &HashSet<String>) {
    let mut locals = outer.clone();
    for s in &block.stmts {
        collect_stmt(summary, s, &mut locals);
    }
}

fn collect_stmt(summary: &mut UsageSummary, stmt: &Stmt, locals: &mut HashSet<String>) {
    match &stmt.kind {
        StmtKind::Block(b) => collect_block(summary, b, locals),
        StmtKind::If(i) => {
            collect_block(summary, &i.then_block, locals);
            if let Some(e) = &i.else_block {
                collect_block(summary, e, locals);
            }
        }
        StmtKind::Switch(s) => {
            for c in &s.cases {
                collect_block(summary, &c.body, locals);
            }
            if let Some(d) = &s.default {
                collect_block(summary, d, locals);
            }
        }
        StmtKind::Foreach(f) => {
            let mut inner = locals.clone();
            inner.insert(f.member.name.clone());
            if let Some(c) = &f.counter {
                inner.insert(c.name.clone());
            }
            collect_block(summary, &f.body, &inner);
        }
        StmtKind::For(f) => collect_for(summary, f, locals),
        StmtKind::Iterate(it) => {
            let mut inner = locals.clone();
            inner.insert(it.var.name.clone());
            collect_block(summary, &it.body, &inner);
        }
        StmtKind::Wait(w) => collect_block(summary, &w.body, locals),
        StmtKind::Chain(c) => {
            for s in &c.stages {
                collect_stmt(summary, s, locals);
            }
            collect_stmt(summary, &c.last, locals);
        }
        StmtKind::Declaration(d) => {
            for v in &d.vars {
                locals.insert(v.name.name.clone());
            }
        }
        StmtKind::Assign(a) => {
            for t in &a.targets {
                if !locals.contains(&t.root.name) {
                    summary.record(t);
                }
            }
        }
        StmtKind::Expr(_) | StmtKind::Update(_) => {}
    }
}

fn collect_for(summary: &mut UsageSummary, f: &ForStmt, locals: &HashSet<String>) {
    let mut inner = locals.clone();
    for init in &f.init {
        if init.type_name.is_some() {
            inner.insert(init.name.name.clone());
        } else if !locals.contains(&init.name.name) {
            summary.record_name(&init.name.name);
        }
    }
    for u in &f.updates {
        if !inner.contains(&u.name.name) {
            summary.record_name(&u.name.name);
        }
    }
    collect_block(summary, &f.body, &inner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::TopLevelKind;

    fn body(src: &str) -> Block {
        let result = crate::parser::parse(&format!("main {{ {} }}", src));
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        let program = result.program.unwrap();
        let TopLevelKind::Function(f) = &program.items[0].kind else {
            panic!()
        };
        f.body.clone()
    }

    #[test]
    fn plain_assignment_is_reported() {
        let s = summarize_block(&body("x = 1; A[2] = 3;"));
        assert_eq!(s.assigned_names(), vec!["A", "x"]);
    }

    #[test]
    fn local_declaration_shadows() {
        let s = summarize_block(&body("int x; x = 1; { y = 2; }"));
        assert!(!s.possibly_assigned("x"));
        assert!(s.possibly_assigned("y"));
    }

    #[test]
    fn nested_block_declaration_does_not_leak() {
        let s = summarize_block(&body("{ int x = 1; } x = 2;"));
        assert!(s.possibly_assigned("x"));
    }

    #[test]
    fn struct_fields_are_tracked_by_path() {
        let s = summarize_block(&body("s.a.b = 1; s.c[3] = 2;"));
        let usage = s.lookup("s").unwrap();
        assert!(!usage.assigned);
        assert!(usage.field("a").unwrap().field("b").unwrap().assigned);
        assert!(usage.field("c").unwrap().assigned);
        assert!(s.possibly_assigned("s"));
    }

    #[test]
    fn loop_members_are_local() {
        let s = summarize_block(&body("foreach v, i in A { v = 1; i = 2; B[i] = v; }"));
        assert_eq!(s.assigned_names(), vec!["B"]);
    }

    #[test]
    fn for_loop_outer_vars_are_assigned() {
        let s = summarize_block(&body("for (int i = 0, j = 0; i < 3; i = i + 1, j = j + 1) { }"));
        assert_eq!(s.assigned_names(), vec!["j"]);
    }

    #[test]
    fn chain_declarations_shadow_later_stages() {
        let s = summarize_block(&body("int t = f() => t2 = g(t);"));
        assert_eq!(s.assigned_names(), vec!["t2"]);
    }

    #[test]
    fn branches_of_if_and_switch() {
        let s = summarize_block(&body(
            "if (c) { a = 1; } else { b = 2; } switch (n) { case 1: d = 3; default: e = 4; }",
        ));
        assert_eq!(s.assigned_names(), vec!["a", "b", "d", "e"]);
    }
}
