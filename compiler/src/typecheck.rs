// typecheck.rs — Expression typing and call resolution
//
// Computes the type of an expression without emitting anything. Integer
// literals type as `int|float` so they can initialise either; operators
// pick the first operand type both sides fit. Polymorphic builtins bind
// their type parameters from the actual arguments.
//
// Preconditions: every variable named by the expression is in scope.
// Postconditions: a successfully typed expression can be evaluated into a
//   variable of any type its type is assignable to.
// Failure modes: `CompileError::User` with E0300-E0306, E0400.
// Side effects: none.

use std::collections::HashMap;

use crate::ast::{join, BinaryOp, Expr, ExprKind, Ident, Span, UnaryOp};
use crate::diag::{codes, Diagnostic, WalkResult};
use crate::ir::Opcode;
use crate::types::{PrimType, Type};
use crate::walker::Walker;

/// Concrete argument and result types of one call site.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CallSig {
    pub inputs: Vec<Type>,
    pub outputs: Vec<Type>,
}

/// How a binary operator applies to a pair of operands.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BinaryTyping {
    pub operand: PrimType,
    pub result: Type,
    pub op: Opcode,
}

impl<'s, 'b> Walker<'s, 'b> {
    pub(crate) fn expr_type(&self, e: &Expr) -> WalkResult<Type> {
        match &e.kind {
            ExprKind::IntLit(_) => Ok(Type::int_literal()),
            ExprKind::FloatLit(_) => Ok(Type::float()),
            ExprKind::StringLit(_) => Ok(Type::string()),
            ExprKind::BoolLit(_) => Ok(Type::bool()),
            ExprKind::Var(name) => Ok(self.require_var(name, e.span)?.ty),
            ExprKind::Call { name, args } => {
                let sig = self.resolve_call(name, args)?;
                match <[Type; 1]>::try_from(sig.outputs) {
                    Ok([ty]) => Ok(ty),
                    Err(outputs) => Err(Diagnostic::error(
                        codes::E0303,
                        e.span,
                        format!(
                            "Function {} has {} outputs and cannot be used as an expression",
                            name.name,
                            outputs.len()
                        ),
                    )
                    .into()),
                }
            }
            ExprKind::Index { base, index } => {
                let base_ty = self.expr_type(base)?;
                let (Some(key), Some(elem)) = (base_ty.array_key(), base_ty.array_elem()) else {
                    return Err(Diagnostic::error(
                        codes::E0302,
                        base.span,
                        format!("Cannot index into non-array type {}", base_ty),
                    )
                    .into());
                };
                let index_ty = self.expr_type(index)?;
                if !index_ty.assignable_to(key) {
                    return Err(Diagnostic::error(
                        codes::E0301,
                        index.span,
                        format!("Array key type mismatch. Expected: {} Actual: {}", key, index_ty),
                    )
                    .into());
                }
                Ok(elem.clone())
            }
            ExprKind::Field { base, field } => {
                let base_ty = self.expr_type(base)?;
                field_type(&base_ty, field).cloned()
            }
            ExprKind::ArrayLit(elems) => self.array_literal_type(elems, e.span),
            ExprKind::Unary { op, operand } => {
                let ty = self.expr_type(operand)?;
                match op {
                    UnaryOp::Neg if ty.is_union() && ty.assignable_to(&Type::int()) => Ok(ty),
                    UnaryOp::Neg => [PrimType::Int, PrimType::Float]
                        .into_iter()
                        .map(Type::Prim)
                        .find(|p| ty.assignable_to(p))
                        .ok_or_else(|| unary_error("-", &ty, e.span)),
                    UnaryOp::Not if ty.assignable_to(&Type::bool()) => Ok(Type::bool()),
                    UnaryOp::Not => Err(unary_error("!", &ty, e.span)),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => Ok(self.type_binary(*op, lhs, rhs, None)?.result),
        }
    }

    fn array_literal_type(&self, elems: &[Expr], span: Span) -> WalkResult<Type> {
        let Some(first) = elems.first() else {
            return Ok(Type::array(Type::int(), Type::TypeVar("?".to_string())));
        };
        let types = elems
            .iter()
            .map(|e| self.expr_type(e))
            .collect::<WalkResult<Vec<_>>>()?;
        let first_ty = self.expr_type(first)?;
        first_ty
            .alternatives()
            .into_iter()
            .find(|alt| types.iter().all(|t| t.assignable_to(alt)))
            .map(|alt| Type::array(Type::int(), alt.clone()))
            .ok_or_else(|| {
                let names: Vec<String> = types.iter().map(|t| t.to_string()).collect();
                Diagnostic::error(
                    codes::E0300,
                    span,
                    format!("Array literal elements have incompatible types: {}", names.join(", ")),
                )
                .into()
            })
    }

    /// Type a binary operation. `prefer` is tried first when both operands
    /// fit it, so literals adopt the type of their destination.
    pub(crate) fn type_binary(
        &self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        prefer: Option<PrimType>,
    ) -> WalkResult<BinaryTyping> {
        let lt = self.expr_type(lhs)?;
        let rt = self.expr_type(rhs)?;
        let candidates = operand_candidates(op);
        let fits = |p: &PrimType| {
            let t = Type::Prim(*p);
            lt.assignable_to(&t) && rt.assignable_to(&t)
        };
        let operand = prefer
            .filter(|p| candidates.contains(p) && fits(p))
            .or_else(|| candidates.iter().copied().find(|p| fits(p)));
        let Some((operand, opcode)) = operand.and_then(|p| binary_opcode(op, p).map(|o| (p, o))) else {
            return Err(Diagnostic::error(
                codes::E0306,
                join(lhs.span, rhs.span),
                format!(
                    "Operator {} not supported for operand types {} and {}",
                    op.symbol(),
                    lt,
                    rt
                ),
            )
            .into());
        };
        let result = match op {
            BinaryOp::Eq
            | BinaryOp::Neq
            | BinaryOp::Lt
            | BinaryOp::Lte
            | BinaryOp::Gt
            | BinaryOp::Gte
            | BinaryOp::And
            | BinaryOp::Or => Type::bool(),
            BinaryOp::Div => Type::float(),
            _ if operand == PrimType::Int && lt.is_union() && rt.is_union() => Type::int_literal(),
            _ => Type::Prim(operand),
        };
        Ok(BinaryTyping {
            operand,
            result,
            op: opcode,
        })
    }

    /// Resolve a call against the callee's signature, binding type
    /// parameters from the actual argument types.
    pub(crate) fn resolve_call(&self, name: &Ident, args: &[Expr]) -> WalkResult<CallSig> {
        let record = self.session.globals.lookup_function(&name.name).ok_or_else(|| {
            Diagnostic::error(codes::E0305, name.span, format!("Unknown function {}", name.name))
        })?;
        let ft = record.ty.clone();
        if !ft.accepts_arity(args.len()) {
            let expected = if ft.varargs {
                format!("at least {}", ft.inputs.len().saturating_sub(1))
            } else {
                ft.inputs.len().to_string()
            };
            return Err(Diagnostic::error(
                codes::E0303,
                name.span,
                format!(
                    "Function {} expects {} input arguments but was given {}",
                    name.name,
                    expected,
                    args.len()
                ),
            )
            .into());
        }

        let mut bindings: HashMap<String, Type> = HashMap::new();
        let mut inputs = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let formal = ft.input_for(i).cloned().unwrap_or_else(Type::void);
            let actual = self.expr_type(arg)?;
            if !unify(&formal, &actual, &mut bindings) {
                return Err(Diagnostic::error(
                    codes::E0300,
                    arg.span,
                    format!(
                        "Argument {} of {} has type {} but {} was expected",
                        i + 1,
                        name.name,
                        actual,
                        substitute(&formal, &bindings)
                    ),
                )
                .into());
            }
            let bound = substitute(&formal, &bindings);
            inputs.push(if bound.is_polymorphic() {
                actual.concretize_for(&bound).unwrap_or_else(|| actual.concrete())
            } else {
                bound
            });
        }

        let mut outputs = Vec::with_capacity(ft.outputs.len());
        for out in &ft.outputs {
            let bound = substitute(out, &bindings);
            if matches!(bound.base(), Type::TypeVar(_)) {
                return Err(Diagnostic::error(
                    codes::E0300,
                    name.span,
                    format!("Cannot infer output type {} of {} from its arguments", bound, name.name),
                )
                .into());
            }
            outputs.push(bound);
        }
        Ok(CallSig { inputs, outputs })
    }

    pub(crate) fn call_output_types(&self, name: &Ident, args: &[Expr]) -> WalkResult<Vec<Type>> {
        Ok(self.resolve_call(name, args)?.outputs)
    }

    pub(crate) fn check_assignment(&self, target: &str, lhs: &Type, rhs: &Type, span: Span) -> WalkResult<()> {
        if rhs.assignable_to(lhs) {
            return Ok(());
        }
        Err(Diagnostic::error(
            codes::E0300,
            span,
            format!(
                "Cannot assign to {}: LVal has type {} but RVal has type {}",
                target, lhs, rhs
            ),
        )
        .into())
    }
}

pub(crate) fn field_type<'t>(base: &'t Type, field: &Ident) -> WalkResult<&'t Type> {
    let Some(st) = base.as_struct() else {
        return Err(Diagnostic::error(
            codes::E0302,
            field.span,
            format!("Cannot access field {} of non-struct type {}", field.name, base),
        )
        .into());
    };
    st.field(&field.name).ok_or_else(|| {
        Diagnostic::error(
            codes::E0302,
            field.span,
            format!("Type {} has no field {}", st.name, field.name),
        )
        .into()
    })
}

fn unary_error(symbol: &str, ty: &Type, span: Span) -> crate::diag::CompileError {
    Diagnostic::error(
        codes::E0306,
        span,
        format!("Operator {} not supported for operand type {}", symbol, ty),
    )
    .into()
}

/// Operand types an operator accepts, in preference order.
fn operand_candidates(op: BinaryOp) -> &'static [PrimType] {
    use PrimType::*;
    match op {
        BinaryOp::Add => &[Int, Float, String],
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Pow => &[Int, Float],
        BinaryOp::Div => &[Float],
        BinaryOp::IntDiv | BinaryOp::Mod => &[Int],
        BinaryOp::Eq | BinaryOp::Neq => &[Int, Float, String, Bool],
        BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => &[Int, Float],
        BinaryOp::And | BinaryOp::Or => &[Bool],
    }
}

pub(crate) fn binary_opcode(op: BinaryOp, operand: PrimType) -> Option<Opcode> {
    use PrimType::*;
    let code = match (op, operand) {
        (BinaryOp::Add, Int) => Opcode::PlusInt,
        (BinaryOp::Add, Float) => Opcode::PlusFloat,
        (BinaryOp::Add, String) => Opcode::Strcat,
        (BinaryOp::Sub, Int) => Opcode::MinusInt,
        (BinaryOp::Sub, Float) => Opcode::MinusFloat,
        (BinaryOp::Mul, Int) => Opcode::MultInt,
        (BinaryOp::Mul, Float) => Opcode::MultFloat,
        (BinaryOp::Div, Float) => Opcode::DivFloat,
        (BinaryOp::IntDiv, Int) => Opcode::DivInt,
        (BinaryOp::Mod, Int) => Opcode::ModInt,
        (BinaryOp::Pow, Int) => Opcode::PowInt,
        (BinaryOp::Pow, Float) => Opcode::PowFloat,
        (BinaryOp::Eq, Int) => Opcode::EqInt,
        (BinaryOp::Eq, Float) => Opcode::EqFloat,
        (BinaryOp::Eq, String) => Opcode::EqString,
        (BinaryOp::Eq, Bool) => Opcode::EqBool,
        (BinaryOp::Neq, Int) => Opcode::NeqInt,
        (BinaryOp::Neq, Float) => Opcode::NeqFloat,
        (BinaryOp::Neq, String) => Opcode::NeqString,
        (BinaryOp::Neq, Bool) => Opcode::NeqBool,
        (BinaryOp::Lt, Int) => Opcode::LtInt,
        (BinaryOp::Lt, Float) => Opcode::LtFloat,
        (BinaryOp::Lte, Int) => Opcode::LteInt,
        (BinaryOp::Lte, Float) => Opcode::LteFloat,
        (BinaryOp::Gt, Int) => Opcode::GtInt,
        (BinaryOp::Gt, Float) => Opcode::GtFloat,
        (BinaryOp::Gte, Int) => Opcode::GteInt,
        (BinaryOp::Gte, Float) => Opcode::GteFloat,
        (BinaryOp::And, Bool) => Opcode::And,
        (BinaryOp::Or, Bool) => Opcode::Or,
        _ => return None,
    };
    Some(code)
}

pub(crate) fn unary_opcode(op: UnaryOp, operand: PrimType) -> Option<Opcode> {
    match (op, operand) {
        (UnaryOp::Neg, PrimType::Int) => Some(Opcode::NegateInt),
        (UnaryOp::Neg, PrimType::Float) => Some(Opcode::NegateFloat),
        (UnaryOp::Not, PrimType::Bool) => Some(Opcode::Not),
        _ => None,
    }
}

/// Match an actual argument type against a formal, binding type variables.
fn unify(formal: &Type, actual: &Type, bindings: &mut HashMap<String, Type>) -> bool {
    match formal {
        Type::TypeVar(name) => match bindings.get(name) {
            Some(bound) => actual.assignable_to(bound),
            None => {
                bindings.insert(name.clone(), actual.concrete());
                true
            }
        },
        Type::Array { key, elem } if elem.is_polymorphic() => {
            match (actual.array_key(), actual.array_elem()) {
                (Some(ak), Some(ae)) if !actual.is_ref() => {
                    ak.assignable_to(key) && unify(elem, ae, bindings)
                }
                _ => false,
            }
        }
        _ => actual.assignable_to(formal),
    }
}

fn substitute(ty: &Type, bindings: &HashMap<String, Type>) -> Type {
    match ty {
        Type::TypeVar(name) => bindings.get(name).cloned().unwrap_or_else(|| ty.clone()),
        Type::Array { key, elem } => Type::array(substitute(key, bindings), substitute(elem, bindings)),
        Type::Ref(inner) => Type::reference(substitute(inner, bindings)),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::ir::IrBuffer;
    use crate::loader::{LoadedModule, Session};
    use crate::pass::FrontendPass;
    use crate::scope::{Alloc, DefKind, Var};
    use std::rc::Rc;

    fn expr(src: &str) -> Expr {
        let program = crate::parser::parse(&format!("main {{ {}; }}", src)).program.unwrap();
        let crate::ast::TopLevelKind::Function(f) = &program.items[0].kind else {
            panic!()
        };
        let crate::ast::StmtKind::Expr(e) = &f.body.stmts[0].kind else {
            panic!("not an expression: {}", src)
        };
        e.clone()
    }

    const DEFS: &str = r#"
        type pt { int x; float ys[]; }
        (T o) first <T> (T xs[]) "weft" "1.0" "first";
        (int o) two (int a, int b) "weft" "1.0" "two";
        () noop () "weft" "1.0" "noop";
    "#;

    /// Run `check` with a walker over `DEFS` and a few locals.
    fn with_walker(check: impl FnOnce(&mut Walker<'_, '_>)) {
        let mut buf = IrBuffer::new();
        let settings = Settings {
            implicit_imports: Vec::new(),
            ..Settings::default()
        };
        let mut session = Session::new(settings, &mut buf);
        let module = Rc::new(LoadedModule::main("t.weft", DEFS).unwrap());
        session.run_pass(&module, FrontendPass::Definitions).unwrap();
        let pt = session.globals.lookup_type("pt").unwrap();
        let mut w = Walker::new(&mut session, "main");
        for (name, ty) in [
            ("i", Type::int()),
            ("f", Type::float()),
            ("s", Type::string()),
            ("b", Type::bool()),
            ("p", pt),
            ("A", Type::array(Type::int(), Type::float())),
            ("M", Type::array(Type::string(), Type::int())),
        ] {
            w.bind_var(Var::new(name, ty, Alloc::Stack, DefKind::LocalUser), (0..0).into())
                .unwrap();
        }
        check(&mut w);
    }

    fn ty(w: &Walker<'_, '_>, src: &str) -> String {
        w.expr_type(&expr(src)).unwrap().to_string()
    }

    fn err(w: &Walker<'_, '_>, src: &str) -> String {
        w.expr_type(&expr(src)).unwrap_err().to_string()
    }

    #[test]
    fn literals_and_arithmetic() {
        with_walker(|w| {
            assert_eq!(ty(w, "1"), "int|float");
            assert_eq!(ty(w, "1 + 2"), "int|float");
            assert_eq!(ty(w, "i + 2"), "int");
            assert_eq!(ty(w, "f * 2"), "float");
            assert_eq!(ty(w, "f / 2.0"), "float");
            assert_eq!(ty(w, "-3"), "int|float");
            assert_eq!(ty(w, "s + \"x\""), "string");
            assert_eq!(ty(w, "i < 3 && b"), "boolean");
        });
    }

    #[test]
    fn operator_mismatch() {
        with_walker(|w| {
            let msg = err(w, "s - 1");
            assert!(msg.contains("Operator - not supported for operand types string and int|float"), "{}", msg);
            assert!(err(w, "i %% f").contains("E0306"));
            assert!(err(w, "!i").contains("Operator ! not supported"));
        });
    }

    #[test]
    fn indexing_and_fields() {
        with_walker(|w| {
            assert_eq!(ty(w, "A[0]"), "float");
            assert_eq!(ty(w, "M[\"k\"]"), "int");
            assert_eq!(ty(w, "p.ys[1]"), "float");
            assert!(err(w, "M[1]").contains("Array key type mismatch. Expected: string Actual: int|float"));
            assert!(err(w, "i[0]").contains("Cannot index into non-array type int"));
            assert!(err(w, "p.z").contains("Type pt has no field z"));
        });
    }

    #[test]
    fn array_literals_pick_common_alternative() {
        with_walker(|w| {
            assert_eq!(ty(w, "[1, 2]"), "int[]");
            assert_eq!(ty(w, "[1, 2.5]"), "float[]");
            assert_eq!(ty(w, "[]"), "?[]");
            assert!(err(w, "[1, \"a\"]").contains("incompatible types"));
        });
    }

    #[test]
    fn polymorphic_call_binds_parameter() {
        with_walker(|w| {
            assert_eq!(ty(w, "first(A)"), "float");
            assert_eq!(ty(w, "first([\"a\"])"), "string");
            let ExprKind::Call { name, args } = expr("first(A)").kind else {
                panic!()
            };
            let sig = w.resolve_call(&name, &args).unwrap();
            assert_eq!(sig.inputs, vec![Type::array(Type::int(), Type::float())]);
        });
    }

    #[test]
    fn call_errors() {
        with_walker(|w| {
            assert!(err(w, "nothing(1)").contains("Unknown function nothing"));
            assert!(err(w, "two(1)").contains("expects 2 input arguments but was given 1"));
            assert!(err(w, "two(1, s)").contains("Argument 2 of two has type string but int was expected"));
            assert!(err(w, "noop()").contains("has 0 outputs and cannot be used as an expression"));
        });
    }

    #[test]
    fn literal_arguments_take_formal_type() {
        with_walker(|w| {
            let ExprKind::Call { name, args } = expr("two(1, i)").kind else {
                panic!()
            };
            let sig = w.resolve_call(&name, &args).unwrap();
            assert_eq!(sig.inputs, vec![Type::int(), Type::int()]);
        });
    }

    #[test]
    fn assignment_compatibility() {
        with_walker(|w| {
            let span = (0..0).into();
            assert!(w.check_assignment("f", &Type::float(), &Type::int_literal(), span).is_ok());
            let msg = w
                .check_assignment("i", &Type::int(), &Type::float(), span)
                .unwrap_err()
                .to_string();
            assert!(msg.contains("Cannot assign to i: LVal has type int but RVal has type float"), "{}", msg);
        });
    }

    #[test]
    fn preferred_operand_type() {
        with_walker(|w| {
            let ExprKind::Binary { op, lhs, rhs } = expr("1 + 2").kind else {
                panic!()
            };
            let t = w.type_binary(op, &lhs, &rhs, Some(PrimType::Float)).unwrap();
            assert_eq!(t.op, Opcode::PlusFloat);
            assert_eq!(t.result, Type::float());
            let t = w.type_binary(op, &lhs, &rhs, None).unwrap();
            assert_eq!(t.op, Opcode::PlusInt);
        });
    }
}
