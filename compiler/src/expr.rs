// expr.rs — Expression evaluation
//
// Lowers expressions into instructions that close a destination future.
// `eval` returns a variable holding the value (reusing an existing one
// when no conversion is needed); `eval_into` writes into a given one.
//
// Preconditions: the expression type-checked against the destination.
// Postconditions: the destination is closed by the emitted instructions,
//   possibly asynchronously.
// Failure modes: typing errors from typecheck.rs; internal errors for
//   destination types the checker should have rejected.
// Side effects: emits instructions.

use log::{debug, trace};

use crate::ast::{Expr, ExprKind, Ident, Span};
use crate::diag::{codes, CompileError, Diagnostic, WalkResult};
use crate::ir::{Arg, Instr, Opcode, TaskMode, TaskProps};
use crate::scope::{FnProp, Var};
use crate::semantics::Intrinsic;
use crate::typecheck::{field_type, unary_opcode};
use crate::types::{FunctionType, PrimType, Type};
use crate::walker::Walker;

impl<'s, 'b> Walker<'s, 'b> {
    /// A variable of type `ty` holding the value of `e`.
    pub(crate) fn eval(&mut self, e: &Expr, ty: &Type) -> WalkResult<Var> {
        let target = ty.concrete();
        match &e.kind {
            ExprKind::Var(name) => {
                let var = self.require_var(name, e.span)?;
                if var.ty == target {
                    return Ok(var);
                }
            }
            ExprKind::Field { .. } => {
                let alias = self.eval_field(e)?;
                if alias.ty == target {
                    return Ok(alias);
                }
                let tmp = self.create_tmp(target);
                self.copy_into(&alias, &tmp)?;
                return Ok(tmp);
            }
            _ => {}
        }
        let tmp = self.create_tmp(target);
        self.eval_into(e, &tmp)?;
        Ok(tmp)
    }

    /// Close `dst` with the value of `e`.
    pub(crate) fn eval_into(&mut self, e: &Expr, dst: &Var) -> WalkResult<()> {
        trace!("eval {:?} into {}", e.kind, dst.name);
        if let Some(value) = literal_arg(e, dst.ty.prim()) {
            self.emit(Instr::Assign {
                dst: dst.clone(),
                src: value,
            });
            return Ok(());
        }
        match &e.kind {
            ExprKind::Var(name) => {
                let src = self.require_var(name, e.span)?;
                self.copy_into(&src, dst)
            }
            ExprKind::Field { .. } => {
                let alias = self.eval_field(e)?;
                self.copy_into(&alias, dst)
            }
            ExprKind::Index { base, index } => {
                let base_ty = self.expr_type(base)?;
                let array = self.eval(base, &base_ty)?;
                let (Some(key), Some(elem)) = (array.ty.array_key().cloned(), array.ty.array_elem().cloned())
                else {
                    return Err(CompileError::internal(format!("{} is not an array", array.name)));
                };
                let index = self.eval_index(index, &key)?;
                if dst.ty.is_ref() {
                    self.emit(Instr::ArrayLookup {
                        dst: dst.clone(),
                        array,
                        index,
                    });
                    return Ok(());
                }
                let member = self.create_tmp(Type::reference(elem));
                self.emit(Instr::ArrayLookup {
                    dst: member.clone(),
                    array,
                    index,
                });
                self.emit(Instr::Dereference {
                    dst: dst.clone(),
                    src: member,
                });
                Ok(())
            }
            ExprKind::ArrayLit(elems) => {
                let elem_ty = dst.ty.array_elem().cloned().ok_or_else(|| {
                    CompileError::internal(format!("array literal assigned to {} of type {}", dst.name, dst.ty))
                })?;
                let members = elems
                    .iter()
                    .map(|m| self.eval(m, &elem_ty))
                    .collect::<WalkResult<Vec<_>>>()?;
                self.emit(Instr::ArrayBuild {
                    dst: dst.clone(),
                    members,
                });
                Ok(())
            }
            ExprKind::Unary { op, operand } => {
                let (Some(prim), Some(code)) = (dst.ty.prim(), dst.ty.prim().and_then(|p| unary_opcode(*op, p)))
                else {
                    return Err(CompileError::internal(format!(
                        "unary operator result assigned to {} of type {}",
                        dst.name, dst.ty
                    )));
                };
                let arg = self.eval_arg(operand, prim)?;
                self.emit(Instr::AsyncOp {
                    op: code,
                    out: dst.clone(),
                    args: vec![arg],
                });
                Ok(())
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let typing = self.type_binary(*op, lhs, rhs, dst.ty.prim())?;
                let l = self.eval_arg(lhs, typing.operand)?;
                let r = self.eval_arg(rhs, typing.operand)?;
                self.emit(Instr::AsyncOp {
                    op: typing.op,
                    out: dst.clone(),
                    args: vec![l, r],
                });
                Ok(())
            }
            ExprKind::Call { name, args } => self.eval_call(name, args, std::slice::from_ref(dst)),
            ExprKind::IntLit(_) | ExprKind::FloatLit(_) | ExprKind::StringLit(_) | ExprKind::BoolLit(_) => {
                Err(CompileError::internal(format!(
                    "literal cannot initialise {} of type {}",
                    dst.name, dst.ty
                )))
            }
        }
    }

    /// Operand of a builtin operation: literals are passed immediately.
    fn eval_arg(&mut self, e: &Expr, prim: PrimType) -> WalkResult<Arg> {
        match literal_arg(e, Some(prim)) {
            Some(arg) => Ok(arg),
            None => Ok(Arg::Var(self.eval(e, &Type::Prim(prim))?)),
        }
    }

    /// Close `dst` with the value of `src`.
    pub(crate) fn copy_into(&mut self, src: &Var, dst: &Var) -> WalkResult<()> {
        let instr = match (src.ty.is_ref(), dst.ty.is_ref()) {
            (false, true) => Instr::AssignReference {
                dst: dst.clone(),
                src: src.clone(),
            },
            (true, false) => Instr::Dereference {
                dst: dst.clone(),
                src: src.clone(),
            },
            _ if !src.ty.assignable_to(&dst.ty) => {
                return Err(CompileError::internal(format!(
                    "cannot copy {} of type {} into {} of type {}",
                    src.name, src.ty, dst.name, dst.ty
                )))
            }
            _ => match Opcode::copy_for(&dst.ty) {
                Some(op) => Instr::AsyncOp {
                    op,
                    out: dst.clone(),
                    args: vec![Arg::Var(src.clone())],
                },
                None => Instr::MakeAlias {
                    dst: dst.clone(),
                    src: src.clone(),
                },
            },
        };
        self.emit(instr);
        Ok(())
    }

    /// Alias for a struct field access expression.
    pub(crate) fn eval_field(&mut self, e: &Expr) -> WalkResult<Var> {
        let ExprKind::Field { base, field } = &e.kind else {
            return Err(CompileError::internal("eval_field on a non-field expression"));
        };
        let src = match &base.kind {
            ExprKind::Var(name) => self.require_var(name, base.span)?,
            ExprKind::Field { .. } => self.eval_field(base)?,
            _ => {
                let ty = self.expr_type(base)?;
                self.eval(base, &ty)?
            }
        };
        self.struct_lookup(&src, field)
    }

    pub(crate) fn struct_lookup(&mut self, src: &Var, field: &Ident) -> WalkResult<Var> {
        let ty = field_type(&src.ty, field)?.clone();
        let alias = self.create_alias(ty);
        self.emit(Instr::StructLookup {
            dst: alias.clone(),
            src: src.clone(),
            field: field.name.clone(),
        });
        Ok(alias)
    }

    /// Subscript for an array with key type `key`.
    pub(crate) fn eval_index(&mut self, index: &Expr, key: &Type) -> WalkResult<Arg> {
        let ty = self.expr_type(index)?;
        if !ty.assignable_to(key) {
            return Err(Diagnostic::error(
                codes::E0301,
                index.span,
                format!("Array key type mismatch. Expected: {} Actual: {}", key, ty),
            )
            .into());
        }
        match literal_arg(index, key.prim()) {
            Some(arg) => Ok(arg),
            None => Ok(Arg::Var(self.eval(index, key)?)),
        }
    }

    /// Call `name`, closing `outs` with its results.
    pub(crate) fn eval_call(&mut self, name: &Ident, args: &[Expr], outs: &[Var]) -> WalkResult<()> {
        let sig = self.resolve_call(name, args)?;
        if sig.outputs.len() != outs.len() {
            return Err(call_arity(name, sig.outputs.len(), outs.len(), name.span));
        }
        let record = self
            .session
            .globals
            .lookup_function(&name.name)
            .ok_or_else(|| CompileError::internal(format!("function {} vanished", name.name)))?;
        let wrapped = record.has(FnProp::WrappedBuiltin).then(|| record.ty.clone());
        let mode = if record.has(FnProp::Sync) {
            TaskMode::Sync
        } else if record.has(FnProp::Builtin) || record.has(FnProp::WrappedBuiltin) {
            self.session.semantics.task_mode(&name.name)
        } else {
            TaskMode::Control
        };

        let inputs = args
            .iter()
            .zip(&sig.inputs)
            .map(|(a, t)| self.eval(a, t))
            .collect::<WalkResult<Vec<_>>>()?;

        if self.session.semantics.intrinsic(&name.name) == Some(Intrinsic::Filename) {
            if let ([file], [out]) = (inputs.as_slice(), outs) {
                self.emit(Instr::GetFileName {
                    dst: out.clone(),
                    file: file.clone(),
                    init_unmapped: false,
                });
                return Ok(());
            }
        }
        if let (Some(op), [out]) = (self.session.semantics.local_equivalent(&name.name), outs) {
            self.emit(Instr::AsyncOp {
                op,
                out: out.clone(),
                args: inputs.into_iter().map(Arg::Var).collect(),
            });
            return Ok(());
        }
        if let Some(ty) = wrapped {
            self.define_wrapper(&name.name, ty)?;
        }
        self.emit(Instr::CallFunction {
            name: name.name.clone(),
            outputs: outs.to_vec(),
            inputs,
            mode,
            props: TaskProps::new(),
        });
        Ok(())
    }

    /// Define the wrapper of a template-only builtin ahead of its first call.
    fn define_wrapper(&mut self, name: &str, ty: FunctionType) -> WalkResult<()> {
        if self.session.wrappers_defined.contains(name) {
            return Ok(());
        }
        let semantics = &self.session.semantics;
        let (Some(template), Some(spec)) = (
            semantics.inline_template(name).cloned(),
            semantics.wrapper(name).cloned(),
        ) else {
            return Err(CompileError::internal(format!("no wrapper saved for builtin {}", name)));
        };
        debug!("defining wrapper for {}", name);
        self.session.wrappers_defined.insert(name.to_string());
        self.emit(Instr::DefineWrapper {
            name: name.to_string(),
            ty,
            template,
            spec,
        });
        Ok(())
    }
}

fn call_arity(name: &Ident, returns: usize, expected: usize, span: Span) -> CompileError {
    Diagnostic::error(
        codes::E0303,
        span,
        format!(
            "Function {} returns {} values but {} were expected",
            name.name, returns, expected
        ),
    )
    .into()
}

/// Immediate operand for a literal expression of a primitive type. Integer
/// literals widen to float.
fn literal_arg(e: &Expr, prim: Option<PrimType>) -> Option<Arg> {
    match (prim?, &e.kind) {
        (PrimType::Float, _) => e
            .float_literal()
            .or_else(|| e.int_literal().map(|i| i as f64))
            .map(Arg::Float),
        (PrimType::Int, _) => e.int_literal().map(Arg::Int),
        (PrimType::String, ExprKind::StringLit(s)) => Some(Arg::Str(s.clone())),
        (PrimType::Bool, ExprKind::BoolLit(b)) => Some(Arg::Bool(*b)),
        _ => None,
    }
}
