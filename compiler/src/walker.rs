// walker.rs — Statement walker and control-flow lowering
//
// A `Walker` lowers one function body. It owns the local scope and naming
// counters for that body and borrows the session for globals, semantics
// and the backend. Expression evaluation, assignment targets and type
// rules are further `impl Walker` blocks in expr.rs, lvalue.rs and
// typecheck.rs.
//
// Preconditions: the definitions pass has completed over the whole program.
// Postconditions: every construct opened while walking a body is closed in
//   LIFO order, on success and on error.
// Failure modes: `CompileError::User` with E03xx (types), E04xx (variable
//   usage and deadlock) and E05xx (annotations).
// Side effects: emits instructions to the session backend.

use std::collections::{HashMap, HashSet};

use log::{debug, info, trace};

use crate::ast::{
    Annotation, Block, ChainStmt, Declaration, Expr, ExprKind, ForStmt, ForeachSource,
    ForeachStmt, FunctionDecl, IfStmt, IterateStmt, Span, Stmt, StmtKind, SwitchStmt,
    UpdateStmt, VarDeclarator, WaitStmt,
};
use crate::deadlock::{
    check_conditional_deadlock, check_no_self_write_under_wait, summarise_branch_variable_usage,
};
use crate::diag::{codes, CompileError, Diagnostic, WalkResult};
use crate::id::NameCounters;
use crate::ir::{
    Arg, Instr, LoopHints, Opcode, TaskMode, TaskProps, UpdateMode, WaitMode, WaitSpec,
};
use crate::loader::Session;
use crate::scope::{Alloc, DefKind, FnProp, LocalScope, Var};
use crate::types::Type;
use crate::usage::{summarize_block, UsageSummary};

/// How much of a statement to lower. Chains declare every stage before
/// evaluating any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Full,
    DeclareOnly,
    EvaluateOnly,
}

impl Phase {
    fn declares(self) -> bool {
        self != Phase::EvaluateOnly
    }

    fn evaluates(self) -> bool {
        self != Phase::DeclareOnly
    }
}

/// Lowering state for one function body.
pub(crate) struct Walker<'s, 'b> {
    pub(crate) session: &'s mut Session<'b>,
    pub(crate) scope: LocalScope,
    pub(crate) names: NameCounters,
    /// User names temporarily bound to compiler variables (loop-carried
    /// values of outer variables).
    renames: HashMap<String, Var>,
}

// ── Function entry ─────────────────────────────────────────────────────────

impl<'b> Session<'b> {
    pub(crate) fn compile_function(&mut self, decl: &FunctionDecl) -> WalkResult<()> {
        let name = decl.name.name.as_str();
        info!("compiling function {}", name);
        let sync = self
            .globals
            .lookup_function(name)
            .ok_or_else(|| {
                CompileError::internal(format!("function {} was not defined before compilation", name))
            })?
            .has(FnProp::Sync);
        let sig = self.signature(name, &decl.outputs, &decl.inputs, &[])?;
        let mode = if sync { TaskMode::Sync } else { TaskMode::Control };

        let mut w = Walker::new(self, name);
        for arg in sig.outputs.iter().chain(&sig.inputs) {
            w.bind_var(arg.clone(), decl.name.span)?;
        }
        let start = Instr::StartFunction {
            name: name.to_string(),
            outputs: sig.outputs,
            inputs: sig.inputs,
            mode,
        };
        w.construct(start, Instr::EndFunction, |w| w.walk_stmts(&decl.body.stmts))?;
        debug!("compiled function {}", name);
        Ok(())
    }
}

impl<'s, 'b> Walker<'s, 'b> {
    pub(crate) fn new(session: &'s mut Session<'b>, function: &str) -> Self {
        Walker {
            session,
            scope: LocalScope::new(),
            names: NameCounters::new(function),
            renames: HashMap::new(),
        }
    }

    // ── Variables ──

    pub(crate) fn emit(&mut self, instr: Instr) {
        self.session.emit(instr);
    }

    pub(crate) fn lookup_var(&self, name: &str) -> Option<Var> {
        self.renames
            .get(name)
            .or_else(|| self.scope.lookup(name))
            .or_else(|| self.session.globals.lookup_constant(name))
            .cloned()
    }

    pub(crate) fn require_var(&self, name: &str, span: Span) -> WalkResult<Var> {
        self.lookup_var(name).ok_or_else(|| {
            Diagnostic::error(codes::E0400, span, format!("Variable {} is not defined", name)).into()
        })
    }

    /// Declare a user variable in the innermost frame and allocate it.
    pub(crate) fn declare_var(&mut self, var: Var, span: Span) -> WalkResult<Var> {
        self.bind_var(var.clone(), span)?;
        self.emit(Instr::Declare { var: var.clone() });
        Ok(var)
    }

    /// Make a variable allocated elsewhere (a formal argument, a loop
    /// member) visible by name without allocating it.
    pub(crate) fn bind_var(&mut self, var: Var, span: Span) -> WalkResult<()> {
        let name = var.name.clone();
        let shadows_global = self.session.globals.lookup_constant(&name).is_some();
        if shadows_global || self.scope.declare(var).is_err() {
            return Err(Diagnostic::error(
                codes::E0401,
                span,
                format!("Variable {} is already defined", name),
            )
            .into());
        }
        Ok(())
    }

    pub(crate) fn create_tmp(&mut self, ty: Type) -> Var {
        let var = Var::new(self.names.temp("t"), ty, Alloc::Temp, DefKind::LocalCompiler);
        self.emit(Instr::Declare { var: var.clone() });
        var
    }

    pub(crate) fn create_alias(&mut self, ty: Type) -> Var {
        let var = Var::new(self.names.temp("alias"), ty, Alloc::Alias, DefKind::LocalCompiler);
        self.emit(Instr::Declare { var: var.clone() });
        var
    }

    /// Declare a local value slot for the contents of `var`.
    pub(crate) fn create_value_of(&mut self, var: &Var) -> Var {
        let value = Var::new(
            self.names.temp_for("v", &var.name),
            var.ty.clone(),
            Alloc::Local,
            DefKind::LocalCompiler,
        );
        self.emit(Instr::Declare { var: value.clone() });
        value
    }

    /// Read the closed future `var` into a fresh local value.
    pub(crate) fn fetch_value_of(&mut self, var: &Var) -> Var {
        let value = self.create_value_of(var);
        self.emit(Instr::Retrieve {
            dst: value.clone(),
            src: var.clone(),
        });
        value
    }

    // ── Scoped helpers ──

    /// Emit `start`, run `body`, then emit `end` whether or not `body`
    /// failed.
    pub(crate) fn construct<T>(
        &mut self,
        start: Instr,
        end: Instr,
        body: impl FnOnce(&mut Self) -> WalkResult<T>,
    ) -> WalkResult<T> {
        self.emit(start);
        let result = body(self);
        self.emit(end);
        result
    }

    pub(crate) fn in_scope<T>(&mut self, body: impl FnOnce(&mut Self) -> WalkResult<T>) -> WalkResult<T> {
        self.scope.push();
        let result = body(self);
        self.scope.pop();
        result
    }

    /// Run `body` with user names bound to the given variables.
    pub(crate) fn with_renames<T>(
        &mut self,
        renames: Vec<(String, Var)>,
        body: impl FnOnce(&mut Self) -> WalkResult<T>,
    ) -> WalkResult<T> {
        let mut saved = Vec::with_capacity(renames.len());
        for (name, var) in renames {
            let old = self.renames.insert(name.clone(), var);
            saved.push((name, old));
        }
        let result = body(self);
        for (name, old) in saved.into_iter().rev() {
            match old {
                Some(v) => self.renames.insert(name, v),
                None => self.renames.remove(&name),
            };
        }
        result
    }

    // ── Statements ──

    /// Lower a block body in a fresh nested scope.
    pub(crate) fn walk_block(&mut self, block: &Block) -> WalkResult<()> {
        self.in_scope(|w| w.walk_stmts(&block.stmts))
    }

    fn walk_stmts(&mut self, stmts: &[Stmt]) -> WalkResult<()> {
        for stmt in stmts {
            self.walk_statement(stmt)?;
        }
        Ok(())
    }

    /// Lower one statement, returning the futures it produces.
    pub(crate) fn walk_statement(&mut self, stmt: &Stmt) -> WalkResult<Vec<Var>> {
        self.walk(stmt, Phase::Full)
    }

    pub(crate) fn declare_only(&mut self, stmt: &Stmt) -> WalkResult<()> {
        self.walk(stmt, Phase::DeclareOnly).map(|_| ())
    }

    pub(crate) fn evaluate_only(&mut self, stmt: &Stmt) -> WalkResult<Vec<Var>> {
        self.walk(stmt, Phase::EvaluateOnly)
    }

    fn walk(&mut self, stmt: &Stmt, phase: Phase) -> WalkResult<Vec<Var>> {
        trace!("{} {:?} ({:?})", stmt.kind.describe(), stmt.span, phase);
        let none = |r: WalkResult<()>| r.map(|_| Vec::new());
        match (&stmt.kind, phase) {
            (StmtKind::Declaration(d), _) => self.declaration(d, stmt.span, phase),
            (StmtKind::Chain(c), _) => self.chain(c, phase),
            (_, Phase::DeclareOnly) => Ok(Vec::new()),
            (StmtKind::Block(b), _) => none(self.construct(
                Instr::StartNestedBlock,
                Instr::EndNestedBlock,
                |w| w.walk_block(b),
            )),
            (StmtKind::If(s), _) => none(self.if_stmt(s, stmt.span)),
            (StmtKind::Switch(s), _) => none(self.switch_stmt(s, stmt.span)),
            (StmtKind::Foreach(s), _) => none(self.foreach(s, stmt.span)),
            (StmtKind::For(s), _) => none(self.for_loop(s)),
            (StmtKind::Iterate(s), _) => none(self.iterate(s)),
            (StmtKind::Wait(s), _) => none(self.wait_stmt(s, stmt.span)),
            (StmtKind::Assign(a), _) => self.assignment(a, stmt.span),
            (StmtKind::Expr(e), _) => self.expr_stmt(e),
            (StmtKind::Update(u), _) => none(self.update(u)),
        }
    }

    /// Arrays and struct array fields visible here that `branches` may write.
    fn written_in(&self, branches: &[UsageSummary]) -> Vec<Var> {
        summarise_branch_variable_usage(self.scope.visible(), branches)
    }

    // ── Conditionals ──

    fn if_stmt(&mut self, stmt: &IfStmt, span: Span) -> WalkResult<()> {
        let cond_ty = self.expr_type(&stmt.cond)?;
        let ty = [Type::bool(), Type::int()]
            .into_iter()
            .find(|t| cond_ty.assignable_to(t))
            .ok_or_else(|| {
                Diagnostic::error(
                    codes::E0300,
                    stmt.cond.span,
                    format!("Condition of if statement must be boolean or int, not {}", cond_ty),
                )
            })?;
        let cond = self.eval(&stmt.cond, &ty)?;

        let mut branches = vec![summarize_block(&stmt.then_block)];
        if let Some(e) = &stmt.else_block {
            branches.push(summarize_block(e));
        }
        check_conditional_deadlock(&cond, &branches, span)?;

        let mut spec = WaitSpec::wait_only(
            self.names.construct_name("if"),
            vec![cond.clone()],
            TaskMode::LocalControl,
        );
        spec.keep_open = self.written_in(&branches);
        self.construct(Instr::StartWait { spec }, Instr::EndWait, |w| {
            let value = w.fetch_value_of(&cond);
            let start = Instr::StartIf {
                cond: Arg::Var(value),
                has_else: stmt.else_block.is_some(),
            };
            w.construct(start, Instr::EndIf, |w| {
                w.walk_block(&stmt.then_block)?;
                if let Some(e) = &stmt.else_block {
                    w.emit(Instr::StartElse);
                    w.walk_block(e)?;
                }
                Ok(())
            })
        })
    }

    fn switch_stmt(&mut self, stmt: &SwitchStmt, span: Span) -> WalkResult<()> {
        let ty = self.expr_type(&stmt.scrutinee)?;
        if !ty.assignable_to(&Type::int()) {
            return Err(Diagnostic::error(
                codes::E0300,
                stmt.scrutinee.span,
                format!("Switch statement scrutinee must be int, not {}", ty),
            )
            .into());
        }
        let mut seen = HashSet::new();
        for case in &stmt.cases {
            if !seen.insert(case.label) {
                return Err(Diagnostic::error(
                    codes::E0200,
                    case.span,
                    format!("Duplicate case label {} in switch statement", case.label),
                )
                .into());
            }
        }
        let value = self.eval(&stmt.scrutinee, &Type::int())?;

        let mut branches: Vec<UsageSummary> =
            stmt.cases.iter().map(|c| summarize_block(&c.body)).collect();
        if let Some(d) = &stmt.default {
            branches.push(summarize_block(d));
        }
        check_conditional_deadlock(&value, &branches, span)?;

        let mut spec = WaitSpec::wait_only(
            self.names.construct_name("switch"),
            vec![value.clone()],
            TaskMode::LocalControl,
        );
        spec.keep_open = self.written_in(&branches);
        self.construct(Instr::StartWait { spec }, Instr::EndWait, |w| {
            let fetched = w.fetch_value_of(&value);
            let start = Instr::StartSwitch {
                value: Arg::Var(fetched),
                labels: stmt.cases.iter().map(|c| c.label).collect(),
                has_default: stmt.default.is_some(),
            };
            w.construct(start, Instr::EndSwitch, |w| {
                for case in &stmt.cases {
                    w.walk_block(&case.body)?;
                    w.emit(Instr::EndCase);
                }
                if let Some(d) = &stmt.default {
                    w.walk_block(d)?;
                    w.emit(Instr::EndCase);
                }
                Ok(())
            })
        })
    }

    // ── Foreach loops ──

    fn foreach(&mut self, stmt: &ForeachStmt, span: Span) -> WalkResult<()> {
        let (hints, sync) = loop_hints(&stmt.annotations)?;
        match &stmt.source {
            ForeachSource::Range { start, end, step } => {
                self.range_foreach(stmt, start, end, step.as_ref(), hints, sync)
            }
            ForeachSource::Array(array) => self.array_foreach(stmt, array, hints, sync, span),
        }
    }

    /// Wrap a loop iteration in its own dispatched task unless the loop is
    /// synchronous.
    fn iteration(
        &mut self,
        sync: bool,
        name: String,
        body: impl FnOnce(&mut Self) -> WalkResult<()>,
    ) -> WalkResult<()> {
        if sync {
            return body(self);
        }
        let spec = WaitSpec {
            name,
            wait_vars: Vec::new(),
            keep_open: Vec::new(),
            mode: WaitMode::TaskDispatch,
            explicit: false,
            deep: false,
            task_mode: TaskMode::Control,
            props: TaskProps::new(),
        };
        self.construct(Instr::StartWait { spec }, Instr::EndWait, body)
    }

    fn int_operand(&mut self, e: &Expr, what: &str) -> WalkResult<Var> {
        let ty = self.expr_type(e)?;
        if !ty.assignable_to(&Type::int()) {
            return Err(Diagnostic::error(
                codes::E0300,
                e.span,
                format!("{} must be int, not {}", what, ty),
            )
            .into());
        }
        self.eval(e, &Type::int())
    }

    fn range_foreach(
        &mut self,
        stmt: &ForeachStmt,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        hints: LoopHints,
        sync: bool,
    ) -> WalkResult<()> {
        let start = self.int_operand(start, "Range start")?;
        let end = self.int_operand(end, "Range end")?;
        let step = match step {
            Some(e) => self.int_operand(e, "Range step")?,
            None => {
                let one = self.create_tmp(Type::int());
                self.emit(Instr::Assign {
                    dst: one.clone(),
                    src: Arg::Int(1),
                });
                one
            }
        };

        let n = self.names.counter_val("foreach-range");
        let function = self.names.function().to_string();
        let mut spec = WaitSpec::wait_only(
            format!("{}-wait-range{}", function, n),
            vec![start.clone(), end.clone(), step.clone()],
            TaskMode::LocalControl,
        );
        spec.keep_open = self.written_in(&[summarize_block(&stmt.body)]);

        self.construct(Instr::StartWait { spec }, Instr::EndWait, |w| {
            let start_val = w.fetch_value_of(&start);
            let end_val = w.fetch_value_of(&end);
            let step_val = w.fetch_value_of(&step);
            let member_val = Var::new(
                w.names.temp_for("v", &stmt.member.name),
                Type::int(),
                Alloc::Local,
                DefKind::LocalCompiler,
            );
            let counter_val = stmt.counter.as_ref().map(|c| {
                Var::new(
                    w.names.temp_for("v", &c.name),
                    Type::int(),
                    Alloc::Local,
                    DefKind::LocalCompiler,
                )
            });
            let loop_start = Instr::StartRangeLoop {
                name: format!("{}-range{}", function, n),
                member: member_val.clone(),
                counter: counter_val.clone(),
                start: Arg::Var(start_val),
                end: Arg::Var(end_val),
                step: Arg::Var(step_val),
                hints,
            };
            w.construct(loop_start, Instr::EndRangeLoop, |w| {
                w.iteration(sync, format!("{}-range-iter{}", function, n), |w| {
                    w.in_scope(|w| {
                        let member = w.declare_var(
                            Var::new(&stmt.member.name, Type::int(), Alloc::Stack, DefKind::LocalUser),
                            stmt.member.span,
                        )?;
                        w.emit(Instr::Assign {
                            dst: member,
                            src: Arg::Var(member_val),
                        });
                        if let (Some(c), Some(cv)) = (&stmt.counter, counter_val) {
                            let counter = w.declare_var(
                                Var::new(&c.name, Type::int(), Alloc::Stack, DefKind::LocalUser),
                                c.span,
                            )?;
                            w.emit(Instr::Assign {
                                dst: counter,
                                src: Arg::Var(cv),
                            });
                        }
                        w.walk_stmts(&stmt.body.stmts)
                    })
                })
            })
        })
    }

    fn array_foreach(
        &mut self,
        stmt: &ForeachStmt,
        array: &Expr,
        hints: LoopHints,
        sync: bool,
        span: Span,
    ) -> WalkResult<()> {
        let array_ty = self.expr_type(array)?;
        if !array_ty.is_array_or_ref() {
            return Err(Diagnostic::error(
                codes::E0302,
                array.span,
                format!("Foreach loop over non-array type {}", array_ty),
            )
            .into());
        }
        let arr = self.eval(array, &array_ty.concrete())?;

        let written = self.written_in(&[summarize_block(&stmt.body)]);
        if let Some(path) = expr_path(array) {
            if written.iter().any(|v| v.name == path) {
                return Err(Diagnostic::error(
                    codes::E0405,
                    span,
                    format!(
                        "Array variable {} is written in the foreach loop it is the loop array for",
                        path
                    ),
                )
                .into());
            }
        }

        let n = self.names.counter_val("foreach-array");
        let function = self.names.function().to_string();

        let foreach = |w: &mut Self, arr: Var| -> WalkResult<()> {
            let mut spec = WaitSpec::wait_only(
                format!("{}-foreach-wait{}", function, n),
                vec![arr.clone()],
                TaskMode::LocalControl,
            );
            spec.keep_open = written.clone();
            w.construct(Instr::StartWait { spec }, Instr::EndWait, |w| {
                let (Some(key), Some(elem)) = (arr.ty.array_key().cloned(), arr.ty.array_elem().cloned())
                else {
                    return Err(CompileError::internal(format!("{} is not an array", arr.name)));
                };
                let member = Var::new(&stmt.member.name, elem, Alloc::Alias, DefKind::LocalUser);
                let counter_val = stmt.counter.as_ref().map(|c| {
                    Var::new(
                        w.names.temp_for("v", &c.name),
                        key.clone(),
                        Alloc::Local,
                        DefKind::LocalCompiler,
                    )
                });
                let loop_start = Instr::StartForeachLoop {
                    name: format!("{}-foreach{}", function, n),
                    array: arr.clone(),
                    member: member.clone(),
                    counter: counter_val.clone(),
                    hints,
                    array_closed: true,
                };
                w.construct(loop_start, Instr::EndForeachLoop, |w| {
                    w.iteration(sync, format!("{}-foreach-iter{}", function, n), |w| {
                        w.in_scope(|w| {
                            w.bind_var(member, stmt.member.span)?;
                            if let (Some(c), Some(cv)) = (&stmt.counter, counter_val) {
                                let counter = w.declare_var(
                                    Var::new(&c.name, key, Alloc::Stack, DefKind::LocalUser),
                                    c.span,
                                )?;
                                w.emit(Instr::Assign {
                                    dst: counter,
                                    src: Arg::Var(cv),
                                });
                            }
                            w.walk_stmts(&stmt.body.stmts)
                        })
                    })
                })
            })
        };
        if !arr.ty.is_ref() {
            return foreach(self, arr);
        }

        let mut spec = WaitSpec::wait_only(
            format!("{}-foreach-refwait{}", function, n),
            vec![arr.clone()],
            TaskMode::LocalControl,
        );
        spec.keep_open = written.clone();
        self.construct(Instr::StartWait { spec }, Instr::EndWait, |w| {
            let target = arr.ty.member_type().cloned().ok_or_else(|| {
                CompileError::internal(format!("reference {} has no referent type", arr.name))
            })?;
            let resolved = w.create_alias(target);
            w.emit(Instr::RetrieveRef {
                dst: resolved.clone(),
                src: arr,
            });
            foreach(w, resolved)
        })
    }

    // ── Loops with carried state ──

    fn for_loop(&mut self, stmt: &ForStmt) -> WalkResult<()> {
        if let Some(ann) = stmt.annotations.first() {
            return Err(Diagnostic::error(
                codes::E0500,
                ann.span,
                format!("Unknown annotation @{} on for loop", ann.key.name),
            )
            .into());
        }

        // Initial values are evaluated outside the loop.
        let mut carried: Vec<Carried> = Vec::with_capacity(stmt.init.len());
        let mut init_vals = Vec::with_capacity(stmt.init.len());
        for init in &stmt.init {
            if carried.iter().any(|c| c.name == init.name.name) {
                return Err(Diagnostic::error(
                    codes::E0401,
                    init.name.span,
                    format!("Variable {} is initialised twice in for loop", init.name.name),
                )
                .into());
            }
            let (var, outer) = match &init.type_name {
                Some(type_name) => {
                    let ty = self.session.resolve_type(type_name, &[], &[])?;
                    let var = Var::new(&init.name.name, ty, Alloc::Stack, DefKind::LocalUser);
                    (var, None)
                }
                None => {
                    let outer = self.require_var(&init.name.name, init.name.span)?;
                    let var = Var::new(
                        self.names.temp_for("lv", &outer.name),
                        outer.ty.clone(),
                        Alloc::Stack,
                        DefKind::LocalCompiler,
                    );
                    (var, Some(outer))
                }
            };
            let value_ty = self.expr_type(&init.value)?;
            self.check_assignment(&init.name.name, &var.ty, &value_ty, init.value.span)?;
            init_vals.push(self.eval(&init.value, &var.ty)?);
            carried.push(Carried {
                name: init.name.name.clone(),
                var,
                outer,
                span: init.name.span,
            });
        }

        let initial: Vec<(String, Var)> = carried
            .iter()
            .zip(&init_vals)
            .map(|(c, v)| (c.name.clone(), v.clone()))
            .collect();
        let cond0 = self.with_renames(initial, |w| w.loop_condition(&stmt.cond))?;

        let cond_var = Var::new(self.names.temp("cond"), Type::bool(), Alloc::Stack, DefKind::LocalCompiler);
        let mut loop_vars = vec![cond_var.clone()];
        let mut defined_here = vec![true];
        let mut blocking = vec![true];
        for c in &carried {
            loop_vars.push(c.var.clone());
            defined_here.push(c.outer.is_none());
            blocking.push(blocks_next_iteration(&c.var.ty));
        }
        let mut all_init = vec![cond0];
        all_init.extend(init_vals);

        let name = self.names.construct_name("forloop");
        debug!("{}: {} carried variables", name, carried.len());
        let start = Instr::StartLoop {
            name,
            loop_vars,
            defined_here,
            init_vals: all_init,
            blocking: blocking.clone(),
        };
        let outer_renames: Vec<(String, Var)> = carried
            .iter()
            .filter(|c| c.outer.is_some())
            .map(|c| (c.name.clone(), c.var.clone()))
            .collect();

        self.construct(start, Instr::EndLoop, |w| {
            w.with_renames(outer_renames, |w| {
                w.in_scope(|w| {
                    for c in carried.iter().filter(|c| c.outer.is_none()) {
                        w.bind_var(c.var.clone(), c.span)?;
                    }
                    let cond_val = w.fetch_value_of(&cond_var);
                    let branch = Instr::StartIf {
                        cond: Arg::Var(cond_val),
                        has_else: true,
                    };
                    w.construct(branch, Instr::EndIf, |w| {
                        w.walk_block(&stmt.body)?;
                        let new_vals = w.for_loop_updates(stmt, &carried)?;
                        let next: Vec<(String, Var)> = carried
                            .iter()
                            .zip(&new_vals)
                            .map(|(c, v)| (c.name.clone(), v.clone()))
                            .collect();
                        let new_cond = w.with_renames(next, |w| w.loop_condition(&stmt.cond))?;
                        let mut all_new = vec![new_cond];
                        all_new.extend(new_vals);
                        w.emit(Instr::LoopContinue {
                            new_vals: all_new,
                            blocking,
                        });

                        w.emit(Instr::StartElse);
                        for c in &carried {
                            if let Some(outer) = &c.outer {
                                w.copy_into(&c.var, outer)?;
                            }
                        }
                        w.emit(Instr::LoopBreak);
                        Ok(())
                    })
                })
            })
        })
    }

    fn loop_condition(&mut self, cond: &Expr) -> WalkResult<Var> {
        let ty = self.expr_type(cond)?;
        if !ty.assignable_to(&Type::bool()) {
            return Err(Diagnostic::error(
                codes::E0300,
                cond.span,
                format!("Loop condition must be boolean, not {}", ty),
            )
            .into());
        }
        self.eval(cond, &Type::bool())
    }

    /// Values of the carried variables for the next iteration. Variables
    /// without an update keep their current value.
    fn for_loop_updates(&mut self, stmt: &ForStmt, carried: &[Carried]) -> WalkResult<Vec<Var>> {
        let mut new_vals: Vec<Var> = carried.iter().map(|c| c.var.clone()).collect();
        for update in &stmt.updates {
            let Some(i) = carried.iter().position(|c| c.name == update.name.name) else {
                return Err(Diagnostic::error(
                    codes::E0400,
                    update.name.span,
                    format!(
                        "Variable {} in for loop update is not a loop variable",
                        update.name.name
                    ),
                )
                .into());
            };
            let ty = carried[i].var.ty.clone();
            let value_ty = self.expr_type(&update.value)?;
            self.check_assignment(&update.name.name, &ty, &value_ty, update.value.span)?;
            new_vals[i] = self.eval(&update.value, &ty)?;
        }
        Ok(new_vals)
    }

    fn iterate(&mut self, stmt: &IterateStmt) -> WalkResult<()> {
        let cond_init = self.create_tmp(Type::bool());
        self.emit(Instr::Assign {
            dst: cond_init.clone(),
            src: Arg::Bool(false),
        });
        let counter_init = self.create_tmp(Type::int());
        self.emit(Instr::Assign {
            dst: counter_init.clone(),
            src: Arg::Int(0),
        });

        let cond_var = Var::new(self.names.temp("cond"), Type::bool(), Alloc::Stack, DefKind::LocalCompiler);
        let counter = Var::new(&stmt.var.name, Type::int(), Alloc::Stack, DefKind::LocalUser);
        let blocking = vec![true, false];
        let start = Instr::StartLoop {
            name: self.names.construct_name("iterate"),
            loop_vars: vec![cond_var.clone(), counter.clone()],
            defined_here: vec![true, true],
            init_vals: vec![cond_init, counter_init],
            blocking: blocking.clone(),
        };
        self.construct(start, Instr::EndLoop, |w| {
            w.in_scope(|w| {
                w.bind_var(counter.clone(), stmt.var.span)?;
                let cond_val = w.fetch_value_of(&cond_var);
                let branch = Instr::StartIf {
                    cond: Arg::Var(cond_val),
                    has_else: true,
                };
                w.construct(branch, Instr::EndIf, |w| {
                    w.emit(Instr::LoopBreak);
                    w.emit(Instr::StartElse);
                    w.walk_block(&stmt.body)?;
                    let new_cond = w.loop_condition(&stmt.until)?;
                    let next = w.create_tmp(Type::int());
                    w.emit(Instr::AsyncOp {
                        op: Opcode::PlusInt,
                        out: next.clone(),
                        args: vec![Arg::Var(counter), Arg::Int(1)],
                    });
                    w.emit(Instr::LoopContinue {
                        new_vals: vec![new_cond, next],
                        blocking,
                    });
                    Ok(())
                })
            })
        })
    }

    // ── Waits and chains ──

    fn wait_stmt(&mut self, stmt: &WaitStmt, span: Span) -> WalkResult<()> {
        let mut waited = Vec::with_capacity(stmt.exprs.len());
        for e in &stmt.exprs {
            let ty = self.expr_type(e)?;
            let chosen = ty
                .alternatives()
                .into_iter()
                .find(|t| t.can_wait_for_finalize())
                .cloned()
                .ok_or_else(|| {
                    Diagnostic::error(
                        codes::E0304,
                        e.span,
                        format!("Waiting for type {} is not supported", ty),
                    )
                })?;
            waited.push(self.eval(e, &chosen)?);
        }
        let branches = [summarize_block(&stmt.body)];
        check_no_self_write_under_wait(&waited, &branches, span)?;

        let mut spec = WaitSpec::wait_only(
            self.names.construct_name("explicitwait"),
            waited,
            TaskMode::LocalControl,
        );
        spec.deep = stmt.deep;
        spec.keep_open = self.written_in(&branches);
        self.construct(Instr::StartWait { spec }, Instr::EndWait, |w| w.walk_block(&stmt.body))
    }

    fn chain(&mut self, stmt: &ChainStmt, phase: Phase) -> WalkResult<Vec<Var>> {
        if phase.declares() {
            for s in stmt.stages.iter().chain(std::iter::once(stmt.last.as_ref())) {
                self.declare_only(s)?;
            }
        }
        if !phase.evaluates() {
            return Ok(Vec::new());
        }
        let mut opened = 0usize;
        let result = self.chain_stages(stmt, &mut opened);
        for _ in 0..opened {
            self.emit(Instr::EndWait);
        }
        result
    }

    fn chain_stages(&mut self, stmt: &ChainStmt, opened: &mut usize) -> WalkResult<Vec<Var>> {
        for stage in &stmt.stages {
            let outputs = self.evaluate_only(stage)?;
            if outputs.is_empty() {
                return Err(Diagnostic::error(
                    codes::E0406,
                    stage.span,
                    format!(
                        "Tried to wait for result of statement of type {} but statement doesn't have output future to wait on",
                        stage.kind.describe()
                    ),
                )
                .into());
            }
            let spec = WaitSpec::wait_only(self.names.construct_name("chain"), outputs, TaskMode::Local);
            self.emit(Instr::StartWait { spec });
            *opened += 1;
        }
        self.evaluate_only(&stmt.last)
    }

    // ── Declarations and updates ──

    fn declaration(&mut self, decl: &Declaration, span: Span, phase: Phase) -> WalkResult<Vec<Var>> {
        let mut outputs = Vec::new();
        for v in &decl.vars {
            if phase.declares() {
                self.declare_one(decl, v, phase == Phase::DeclareOnly)?;
            }
            if phase.evaluates() {
                if let Some(init) = &v.init {
                    let var = self.require_var(&v.name.name, v.name.span)?;
                    if !var.ty.is_updateable() {
                        outputs.push(self.assign_declared(var, init, span)?);
                    }
                }
            }
        }
        Ok(outputs)
    }

    fn declare_one(&mut self, decl: &Declaration, v: &VarDeclarator, in_chain: bool) -> WalkResult<()> {
        let ty = self.session.resolve_type(&decl.type_name, &v.dims, &[])?;
        let mut var = Var::new(&v.name.name, ty.clone(), Alloc::Stack, DefKind::LocalUser);

        if let Some(mapping) = &v.mapping {
            if !ty.is_mappable() {
                return Err(Diagnostic::error(
                    codes::E0408,
                    mapping.span,
                    format!("Variable {} of type {} cannot be mapped", v.name.name, ty),
                )
                .into());
            }
            let mapping_ty = self.expr_type(mapping)?;
            if !mapping_ty.assignable_to(&Type::string()) {
                return Err(Diagnostic::error(
                    codes::E0408,
                    mapping.span,
                    format!("Mapping expression for {} must be a string, not {}", v.name.name, mapping_ty),
                )
                .into());
            }
            let filename = self.eval(mapping, &Type::string())?;
            var.mapping = Some(filename.name);
        }

        if !ty.is_updateable() {
            self.declare_var(var, v.name.span)?;
            return Ok(());
        }
        if in_chain {
            return Err(Diagnostic::error(
                codes::E0407,
                v.span,
                format!("Updateable variable {} cannot be declared in a statement chain", v.name.name),
            )
            .into());
        }
        let initial = v
            .init
            .as_ref()
            .and_then(|e| e.float_literal().or_else(|| e.int_literal().map(|i| i as f64)))
            .ok_or_else(|| {
                Diagnostic::error(
                    codes::E0407,
                    v.span,
                    format!("Updateable variable {} must be initialised with a literal value", v.name.name),
                )
            })?;
        let var = self.declare_var(var, v.name.span)?;
        self.emit(Instr::InitUpdateable {
            var,
            value: Arg::Float(initial),
        });
        Ok(())
    }

    fn update(&mut self, stmt: &UpdateStmt) -> WalkResult<()> {
        let target = self.require_var(&stmt.target.name, stmt.target.span)?;
        if !target.ty.is_updateable() {
            return Err(Diagnostic::error(
                codes::E0407,
                stmt.target.span,
                format!("Can only update updateable variables: {} has type {}", target.name, target.ty),
            )
            .into());
        }
        let mode = UpdateMode::from_name(&stmt.mode.name).ok_or_else(|| {
            Diagnostic::error(
                codes::E0407,
                stmt.mode.span,
                format!("Unknown update mode {}. Valid options are: min, incr, scale", stmt.mode.name),
            )
        })?;
        let value_ty = self.expr_type(&stmt.value)?;
        if !value_ty.assignable_to(&Type::float()) {
            return Err(Diagnostic::error(
                codes::E0300,
                stmt.value.span,
                format!("Update value for {} must be float, not {}", target.name, value_ty),
            )
            .into());
        }
        let value = self.eval(&stmt.value, &Type::float())?;
        self.emit(Instr::Update {
            var: target,
            mode,
            value,
        });
        Ok(())
    }

    fn expr_stmt(&mut self, e: &Expr) -> WalkResult<Vec<Var>> {
        if let ExprKind::Call { name, args } = &e.kind {
            let sig = self.resolve_call(name, args)?;
            let outputs: Vec<Var> = sig
                .outputs
                .iter()
                .map(|t| self.create_tmp(t.concrete()))
                .collect();
            self.eval_call(name, args, &outputs)?;
            return Ok(outputs);
        }
        let ty = self.expr_type(e)?.concrete();
        let tmp = self.create_tmp(ty);
        self.eval_into(e, &tmp)?;
        Ok(vec![tmp])
    }
}

/// A for-loop variable: the loop-carried variable and, for variables
/// declared before the loop, the outer variable receiving its final value.
struct Carried {
    name: String,
    var: Var,
    outer: Option<Var>,
    span: Span,
}

/// Scalars must be closed before the next iteration starts; containers
/// are passed on open.
fn blocks_next_iteration(ty: &Type) -> bool {
    ty.prim().is_some()
}

/// `a` or `a.b.c` for plain variable and field-access expressions.
fn expr_path(e: &Expr) -> Option<String> {
    match &e.kind {
        ExprKind::Var(name) => Some(name.clone()),
        ExprKind::Field { base, field } => Some(format!("{}.{}", expr_path(base)?, field.name)),
        _ => None,
    }
}

const LOOP_ANNOTATIONS: &str = "sync, unroll, splitdegree, leafdegree";

/// Loop hints and the synchronous flag from foreach annotations.
fn loop_hints(annotations: &[Annotation]) -> WalkResult<(LoopHints, bool)> {
    let mut hints = LoopHints::default();
    let mut sync = false;
    for ann in annotations {
        let key = ann.key.name.as_str();
        match (key, &ann.value) {
            ("sync", None) => sync = true,
            ("unroll" | "splitdegree" | "leafdegree", Some(value)) => {
                let n = value.parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                    Diagnostic::error(
                        codes::E0500,
                        ann.span,
                        format!("Expected positive integer value for @{}, got {}", key, value),
                    )
                })?;
                match key {
                    "unroll" => hints.unroll = n,
                    "splitdegree" => hints.split_degree = n,
                    _ => hints.leaf_degree = n,
                }
            }
            _ => {
                return Err(Diagnostic::error(
                    codes::E0500,
                    ann.span,
                    format!("Unknown annotation @{} on foreach loop, valid: {}", key, LOOP_ANNOTATIONS),
                )
                .into())
            }
        }
    }
    Ok((hints, sync))
}
