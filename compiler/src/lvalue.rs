// lvalue.rs — Assignment targets
//
// Resolves `root.field[index]...` targets into the variable that receives
// the value. Struct fields become aliases; indexing creates nested arrays
// on demand and defers the final insertion until the value variable
// exists. Members reached through a computed index, and non-array members
// on the way to a field, are held as references. Pending insertions are
// flushed last-in first-out.
//
// Preconditions: the root variable is declared.
// Postconditions: every pending insertion is emitted exactly once.
// Failure modes: E0300 (types), E0301 (key), E0302 (not array/struct),
//   E0402 (self-assignment), E0407 (updateable).
// Side effects: emits instructions.

use crate::ast::{Assignment, Expr, ExprKind, LValueExpr, PathStep, Span};
use crate::diag::{codes, CompileError, Diagnostic, WalkResult};
use crate::ir::{Arg, InsertKind, Instr};
use crate::scope::Var;
use crate::types::Type;
use crate::walker::Walker;

/// An array insertion waiting for its member variable to be assigned.
#[derive(Debug, Clone)]
pub(crate) struct PendingInsert {
    pub array: Var,
    pub index: Arg,
    pub member: Var,
    /// Outermost array when `array` is itself a nested member.
    pub outer: Option<Var>,
}

impl<'s, 'b> Walker<'s, 'b> {
    /// Lower an assignment statement. Returns the variables it closes.
    pub(crate) fn assignment(&mut self, a: &Assignment, span: Span) -> WalkResult<Vec<Var>> {
        match (a.targets.as_slice(), a.values.as_slice()) {
            ([target], [value]) => Ok(vec![self.assign_single(target, value)?]),
            (targets, [value]) => self.assign_multi(targets, value),
            (targets, values) if targets.len() == values.len() => targets
                .iter()
                .zip(values)
                .map(|(t, v)| self.assign_single(t, v))
                .collect(),
            (targets, values) => Err(Diagnostic::error(
                codes::E0300,
                span,
                format!(
                    "Assignment has {} targets but {} values",
                    targets.len(),
                    values.len()
                ),
            )
            .into()),
        }
    }

    fn assign_single(&mut self, target: &LValueExpr, value: &Expr) -> WalkResult<Var> {
        let root = self.require_var(&target.root.name, target.root.span)?;
        if target.path.is_empty() && value.var_name() == Some(root.name.as_str()) {
            return Err(self_assignment(&root.name, target.span));
        }
        reject_updateable(&root, target.span)?;
        let rval_ty = self.expr_type(value)?;
        // An array lookup on the right yields a reference to the member.
        let rval_ref = matches!(value.kind, ExprKind::Index { .. });

        // A bare variable on the right can be inserted into an array as is.
        let direct = match value.var_name() {
            Some(name) => Some(self.require_var(name, value.span)?),
            None => None,
        };
        let (lval, pending) = self.eval_lvalue(&root, &target.path, direct.as_ref(), rval_ref)?;
        let lval_ty = match lval.ty.member_type() {
            Some(member) if lval.ty.is_ref() => member.clone(),
            _ => lval.ty.clone(),
        };
        self.check_assignment(&describe(target), &lval_ty, &rval_ty, value.span)?;
        if direct.as_ref().map(|d| d.name.as_str()) != Some(lval.name.as_str()) {
            self.eval_into(value, &lval)?;
        }
        self.flush_inserts(pending);
        Ok(lval)
    }

    /// `a, b = f(...)`: one call closing several targets.
    fn assign_multi(&mut self, targets: &[LValueExpr], value: &Expr) -> WalkResult<Vec<Var>> {
        let ExprKind::Call { name, args } = &value.kind else {
            return Err(Diagnostic::error(
                codes::E0300,
                value.span,
                format!(
                    "Cannot assign a single value to {} targets; the right-hand side must be a function call",
                    targets.len()
                ),
            )
            .into());
        };
        let outputs = self.call_output_types(name, args)?;
        if outputs.len() != targets.len() {
            return Err(Diagnostic::error(
                codes::E0300,
                value.span,
                format!(
                    "Function {} returns {} values but {} targets were given",
                    name.name,
                    outputs.len(),
                    targets.len()
                ),
            )
            .into());
        }
        let mut lvals = Vec::with_capacity(targets.len());
        let mut pending = Vec::new();
        for (target, out_ty) in targets.iter().zip(&outputs) {
            let root = self.require_var(&target.root.name, target.root.span)?;
            reject_updateable(&root, target.span)?;
            let (lval, p) = self.eval_lvalue(&root, &target.path, None, false)?;
            self.check_assignment(&describe(target), &lval.ty, out_ty, value.span)?;
            lvals.push(lval);
            pending.extend(p);
        }
        self.eval_call(name, args, &lvals)?;
        self.flush_inserts(pending);
        Ok(lvals)
    }

    /// Initialiser of a declaration.
    pub(crate) fn assign_declared(&mut self, var: Var, init: &Expr, span: Span) -> WalkResult<Var> {
        if init.var_name() == Some(var.name.as_str()) {
            return Err(self_assignment(&var.name, span));
        }
        let ty = self.expr_type(init)?;
        self.check_assignment(&var.name, &var.ty, &ty, init.span)?;
        self.eval_into(init, &var)?;
        Ok(var)
    }

    /// Walk the target path from `root`, returning the variable to close
    /// and the insertions to emit once it is closed. With `rval_ref` the
    /// final member is a reference, inserted by dereferencing.
    fn eval_lvalue(
        &mut self,
        root: &Var,
        path: &[PathStep],
        direct: Option<&Var>,
        rval_ref: bool,
    ) -> WalkResult<(Var, Vec<PendingInsert>)> {
        let mut current = root.clone();
        let mut outer: Option<Var> = None;
        let mut pending = Vec::new();
        for (i, step) in path.iter().enumerate() {
            let last = i + 1 == path.len();
            match step {
                PathStep::Field(field) => {
                    if current.ty.is_ref() {
                        current = self.deref_handle(&current)?;
                    }
                    current = self.struct_lookup(&current, field)?;
                }
                PathStep::Index(index_expr) => {
                    let (Some(key), Some(elem)) =
                        (current.ty.array_key().cloned(), current.ty.array_elem().cloned())
                    else {
                        return Err(Diagnostic::error(
                            codes::E0302,
                            index_expr.span,
                            format!("Cannot index into {} of non-array type {}", current.name, current.ty),
                        )
                        .into());
                    };
                    let index_ty = self.expr_type(index_expr)?;
                    if !index_ty.assignable_to(&key) {
                        return Err(Diagnostic::error(
                            codes::E0301,
                            index_expr.span,
                            format!(
                                "Array key type mismatch in LVal. Expected: {} Actual: {}",
                                key, index_ty
                            ),
                        )
                        .into());
                    }
                    let index = self.eval_index(index_expr, &key)?;
                    if last {
                        let member = match direct {
                            Some(d) if !rval_ref && d.ty == elem => d.clone(),
                            _ if rval_ref => self.create_tmp(Type::reference(elem)),
                            _ => self.create_tmp(elem),
                        };
                        pending.push(PendingInsert {
                            array: current,
                            index,
                            member: member.clone(),
                            outer: outer.clone(),
                        });
                        current = member;
                    } else if elem.is_array() {
                        // Only a literal index into an array value yields a plain alias.
                        let nested = if index.is_int_literal() && !current.ty.is_ref() {
                            self.create_alias(elem)
                        } else {
                            self.create_tmp(Type::reference(elem))
                        };
                        self.emit(Instr::ArrayCreateNested {
                            dst: nested.clone(),
                            array: current.clone(),
                            index,
                            outer: outer.clone(),
                        });
                        outer.get_or_insert(current);
                        current = nested;
                    } else {
                        // The member may not be inserted yet: hold a reference to it.
                        let handle = self.create_tmp(Type::reference(elem));
                        self.emit(Instr::ArrayLookup {
                            dst: handle.clone(),
                            array: current.clone(),
                            index,
                        });
                        outer.get_or_insert(current);
                        current = handle;
                    }
                }
            }
        }
        Ok((current, pending))
    }

    /// Alias for the value behind a reference, closed once the referent is.
    fn deref_handle(&mut self, handle: &Var) -> WalkResult<Var> {
        let inner = handle
            .ty
            .member_type()
            .cloned()
            .ok_or_else(|| CompileError::internal(format!("{} is not a reference", handle.name)))?;
        let value = self.create_alias(inner);
        self.emit(Instr::Dereference {
            dst: value.clone(),
            src: handle.clone(),
        });
        Ok(value)
    }

    fn flush_inserts(&mut self, pending: Vec<PendingInsert>) {
        for p in pending.into_iter().rev() {
            let kind = InsertKind::select(p.array.ty.is_ref(), p.member.ty.is_ref());
            self.emit(Instr::ArrayInsert {
                kind,
                array: p.array,
                index: p.index,
                member: p.member,
                outer: p.outer,
            });
        }
    }
}

fn self_assignment(name: &str, span: Span) -> crate::diag::CompileError {
    Diagnostic::error(codes::E0402, span, format!("Assigning var {} to itself", name)).into()
}

fn reject_updateable(var: &Var, span: Span) -> WalkResult<()> {
    if var.ty.is_updateable() {
        return Err(Diagnostic::error(
            codes::E0407,
            span,
            format!("Cannot assign to updateable {}; use an update statement", var.name),
        )
        .into());
    }
    Ok(())
}

/// `a.b[...]` rendering of a target for diagnostics.
fn describe(target: &LValueExpr) -> String {
    let mut out = target.root.name.clone();
    for step in &target.path {
        match step {
            PathStep::Field(f) => {
                out.push('.');
                out.push_str(&f.name);
            }
            PathStep::Index(_) => out.push_str("[]"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::diag::WalkResult;
    use crate::ir::IrBuffer;
    use crate::loader::{LoadedModule, Session};

    const PRELUDE: &str = r#"
        type pt { int x; int xs[]; }
        (int a, int b) pair () "weft" "1.0" "pair";
        (int o) one () "weft" "1.0" "one";
    "#;

    fn compile(src: &str) -> WalkResult<String> {
        let mut buf = IrBuffer::new();
        {
            let settings = Settings {
                implicit_imports: Vec::new(),
                ..Settings::default()
            };
            let mut session = Session::new(settings, &mut buf);
            let main = LoadedModule::main("t.weft", format!("{}\nmain {{ {} }}", PRELUDE, src))?;
            session.walk(main)?;
        }
        Ok(buf.render())
    }

    fn render(src: &str) -> String {
        compile(src).unwrap()
    }

    fn error(src: &str) -> String {
        compile(src).unwrap_err().to_string()
    }

    #[test]
    fn plain_assignment() {
        let ir = render("int x; x = 1;");
        assert!(ir.contains("x := 1"), "{}", ir);
    }

    #[test]
    fn self_assignment_is_rejected() {
        assert!(error("int x; x = x;").contains("Assigning var x to itself"));
        assert!(error("int y = y;").contains("Assigning var y to itself"));
    }

    #[test]
    fn indexed_assignment_inserts_member() {
        let ir = render("int A[]; A[3] = 7;");
        assert!(ir.contains("__t0 := 7"), "{}", ir);
        assert!(ir.contains("array_insert_imm A[3] <- __t0"), "{}", ir);
    }

    #[test]
    fn variable_is_inserted_directly() {
        let ir = render("int A[]; int v = 2; A[0] = v;");
        assert!(ir.contains("array_insert_imm A[0] <- v"), "{}", ir);
        assert!(!ir.contains("COPY_INT"), "{}", ir);
    }

    #[test]
    fn future_index() {
        let ir = render("int A[]; int i = 1; A[i] = 2;");
        assert!(ir.contains("array_insert_future A[i] <- __t0"), "{}", ir);
    }

    #[test]
    fn nested_arrays_are_created() {
        let ir = render("int A[][]; A[1][2] = 3;");
        assert!(ir.contains("__alias0 := array_create_nested_imm A[1]"), "{}", ir);
        assert!(ir.contains("array_insert_imm __alias0[2] <- __t1 outer A"), "{}", ir);
    }

    #[test]
    fn future_index_creates_nested_reference() {
        let ir = render("int A[][]; int i = 1; A[i][2] = 3;");
        assert!(ir.contains("declare temp *(int[]) __t0"), "{}", ir);
        assert!(ir.contains("__t0 := array_create_nested_future A[i]"), "{}", ir);
        assert!(ir.contains("array_ref_insert_imm __t0[2] <- __t1 outer A"), "{}", ir);
    }

    #[test]
    fn literal_index_below_a_reference_stays_a_reference() {
        let ir = render("int A[][][]; int i = 1; A[i][2][3] = 4;");
        assert!(ir.contains("__t0 := array_create_nested_future A[i]"), "{}", ir);
        assert!(ir.contains("__t1 := array_ref_create_nested_imm __t0[2] outer A"), "{}", ir);
        assert!(ir.contains("array_ref_insert_imm __t1[3] <- __t2 outer A"), "{}", ir);
    }

    #[test]
    fn reference_member_into_reference_array() {
        let ir = render("int A[][]; int B[][]; int i = 0; A[0][0] = 1; B[i][0] = A[0][0];");
        assert!(ir.contains("array_ref_deref_insert_imm"), "{}", ir);
    }

    #[test]
    fn array_lookup_is_inserted_by_reference() {
        let ir = render("int A[][]; int B[][]; int C[]; A[0] = C; B[0] = A[0];");
        assert!(ir.contains("array_insert_imm A[0] <- C"), "{}", ir);
        assert!(ir.contains("declare temp *(int[]) __t0"), "{}", ir);
        assert!(ir.contains("__t0 lookup A[0]"), "{}", ir);
        assert!(ir.contains("array_deref_insert_imm B[0] <- __t0"), "{}", ir);
        assert!(!ir.contains(":= *"), "{}", ir);
    }

    #[test]
    fn array_of_struct_member_field() {
        let ir = render("pt P[]; P[0].x = 1;");
        assert!(ir.contains("__t0 lookup P[0]"), "{}", ir);
        assert!(ir.contains("__alias1 := *__t0"), "{}", ir);
        assert!(ir.contains("__alias2 alias __alias1.x"), "{}", ir);
        assert!(ir.contains("__alias2 := 1"), "{}", ir);
    }

    #[test]
    fn struct_field_targets() {
        let ir = render("pt p; p.x = 1; p.xs[0] = 2;");
        assert!(ir.contains("__alias0 alias p.x"), "{}", ir);
        assert!(ir.contains("__alias0 := 1"), "{}", ir);
        assert!(ir.contains("array_insert_imm __alias1[0] <- __t2"), "{}", ir);
    }

    #[test]
    fn key_type_mismatch() {
        let msg = error("int M[string]; M[1] = 2;");
        assert!(msg.contains("Array key type mismatch in LVal. Expected: string Actual: int|float"), "{}", msg);
    }

    #[test]
    fn indexing_a_scalar() {
        assert!(error("int x; x[0] = 1;").contains("non-array type int"));
    }

    #[test]
    fn multiple_targets_from_one_call() {
        let ir = render("int a; int b; a, b = pair();");
        assert!(ir.contains("call pair (a, b) <- () CONTROL"), "{}", ir);
        let msg = error("int a; int b; a, b = one();");
        assert!(msg.contains("Function one returns 1 values but 2 targets were given"), "{}", msg);
        assert!(error("int a; int b; a, b = 1;").contains("right-hand side must be a function call"));
    }

    #[test]
    fn pairwise_assignment() {
        let ir = render("int a; int b; a, b = 1, 2;");
        assert!(ir.contains("a := 1"), "{}", ir);
        assert!(ir.contains("b := 2"), "{}", ir);
    }

    #[test]
    fn type_mismatch_names_target() {
        let msg = error("int x; x = \"s\";");
        assert!(msg.contains("Cannot assign to x: LVal has type int but RVal has type string"), "{}", msg);
    }
}
