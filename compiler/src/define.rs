// define.rs — Definition registrar
//
// Runs in the definitions pass. Registers composite, builtin and app
// function signatures, struct types, sub-types and aliases, and global
// constants; applies function annotations to the semantics registry; and
// emits the definition-level instructions (package requirements, builtin
// and struct definitions, globals).
//
// Preconditions: types used in a signature are defined earlier in load order.
// Postconditions: every successfully defined function has a `FunctionRecord`
//   in the global scope with its properties set.
// Failure modes: `CompileError::User` with E02xx (definitions), E0300 (global
//   constant type mismatch) and E05xx (annotations).
// Side effects: emits definition instructions to the backend.

use std::collections::{BTreeSet, HashSet};

use log::debug;

use crate::ast::{
    Annotation, AppDecl, ArrayDim, BuiltinDecl, Declaration, Expr, ExprKind, FormalArg,
    FunctionDecl, Ident, NewTypeDecl, Span, StructTypeDecl,
};
use crate::diag::{codes, Diagnostic, WalkResult};
use crate::ir::{Arg, Instr, Opcode, TaskMode};
use crate::loader::Session;
use crate::scope::{Alloc, DefKind, FnProp, FunctionRecord, Var};
use crate::semantics::{Intrinsic, OpTemplate, SpecialFunction, WrapperSpec};
use crate::types::{FunctionType, PrimType, StructField, StructType, Type};

/// Resolved signature of a function declaration.
#[derive(Debug, Clone)]
pub(crate) struct Signature {
    pub outputs: Vec<Var>,
    pub inputs: Vec<Var>,
    pub ty: FunctionType,
}

const FUNCTION_ANNOTATIONS: &str = "assertion, pure, commutative, copy, minmax, par";

impl<'b> Session<'b> {
    // ── Types ──

    /// Resolve `name` followed by array dimensions. The first dimension is
    /// the outermost array.
    pub(crate) fn resolve_type(
        &self,
        name: &Ident,
        dims: &[ArrayDim],
        type_params: &[Ident],
    ) -> WalkResult<Type> {
        let mut ty = if type_params.iter().any(|p| p.name == name.name) {
            Type::TypeVar(name.name.clone())
        } else {
            self.globals.lookup_type(&name.name).ok_or_else(|| {
                Diagnostic::error(codes::E0201, name.span, format!("Unknown type {}", name.name))
            })?
        };
        for dim in dims.iter().rev() {
            let key = match &dim.key {
                None => Type::int(),
                Some(k) => {
                    let kt = self.globals.lookup_type(&k.name).ok_or_else(|| {
                        Diagnostic::error(codes::E0201, k.span, format!("Unknown type {}", k.name))
                    })?;
                    if !(kt.is_int() || kt.is_string()) {
                        return Err(Diagnostic::error(
                            codes::E0201,
                            k.span,
                            format!("Array key type must be int or string, not {}", kt),
                        )
                        .into());
                    }
                    kt
                }
            };
            ty = Type::array(key, ty);
        }
        Ok(ty)
    }

    /// Resolve formal argument lists into typed variables.
    pub(crate) fn signature(
        &self,
        function: &str,
        outputs: &[FormalArg],
        inputs: &[FormalArg],
        type_params: &[Ident],
    ) -> WalkResult<Signature> {
        let mut seen = HashSet::new();
        let mut resolve = |args: &[FormalArg], kind: DefKind| -> WalkResult<Vec<Var>> {
            let mut vars = Vec::with_capacity(args.len());
            for arg in args {
                if !seen.insert(arg.name.name.clone()) {
                    return Err(Diagnostic::error(
                        codes::E0200,
                        arg.name.span,
                        format!(
                            "Argument {} is defined twice in function {}",
                            arg.name.name, function
                        ),
                    )
                    .into());
                }
                let ty = self.resolve_type(&arg.type_name, &arg.dims, type_params)?;
                vars.push(Var::new(arg.name.name.clone(), ty, Alloc::Stack, kind));
            }
            Ok(vars)
        };
        let output_vars = resolve(outputs, DefKind::OutArg)?;
        let input_vars = resolve(inputs, DefKind::InArg)?;

        if let Some(bad) = outputs.iter().find(|a| a.varargs) {
            return Err(Diagnostic::error(
                codes::E0202,
                bad.span,
                format!("Output argument {} of {} cannot be variadic", bad.name.name, function),
            )
            .into());
        }
        let last = inputs.len().saturating_sub(1);
        if let Some((_, bad)) = inputs.iter().enumerate().find(|(i, a)| a.varargs && *i != last) {
            return Err(Diagnostic::error(
                codes::E0202,
                bad.span,
                format!("Only the last input of {} may be variadic", function),
            )
            .into());
        }

        let ty = FunctionType {
            inputs: input_vars.iter().map(|v| v.ty.clone()).collect(),
            outputs: output_vars.iter().map(|v| v.ty.clone()).collect(),
            varargs: inputs.last().is_some_and(|a| a.varargs),
            type_params: type_params.iter().map(|p| p.name.clone()).collect(),
        };
        Ok(Signature {
            outputs: output_vars,
            inputs: input_vars,
            ty,
        })
    }

    fn register(&mut self, record: FunctionRecord) -> WalkResult<()> {
        let name = record.name.clone();
        let span = record.span;
        self.globals.define_function(record).map_err(|existing| {
            Diagnostic::error(
                codes::E0200,
                span,
                format!("Function {} is already defined", name),
            )
            .with_related(existing.span, "previous definition")
        })?;
        Ok(())
    }

    // ── Functions ──

    pub(crate) fn define_function(&mut self, decl: &FunctionDecl, span: Span) -> WalkResult<()> {
        let name = decl.name.name.as_str();
        debug!("define function: {}", name);
        if let Some(p) = decl.type_params.first() {
            return Err(Diagnostic::error(
                codes::E0202,
                p.span,
                "Cannot provide type parameters for composite functions",
            )
            .into());
        }
        let sig = self.signature(name, &decl.outputs, &decl.inputs, &[])?;
        if sig.ty.varargs {
            return Err(Diagnostic::error(
                codes::E0202,
                decl.name.span,
                "Composite function cannot have variable-length argument lists",
            )
            .into());
        }
        if let Some(poly) = sig.ty.inputs.iter().find(|t| t.is_polymorphic()) {
            return Err(Diagnostic::error(
                codes::E0202,
                decl.name.span,
                format!(
                    "Composite functions cannot have polymorphic input argument types, such as: {}",
                    poly
                ),
            )
            .into());
        }
        if name == self.settings.main_function
            && (!sig.inputs.is_empty() || !sig.outputs.is_empty())
        {
            return Err(Diagnostic::error(
                codes::E0202,
                decl.name.span,
                format!("{}() is not allowed to have input or output arguments", name),
            )
            .into());
        }

        let mut props = BTreeSet::from([FnProp::Composite]);
        for ann in &decl.annotations {
            if ann.value.is_some() {
                return Err(Diagnostic::error(
                    codes::E0500,
                    ann.span,
                    format!("Annotation @{} on function definition does not take a value", ann.key.name),
                )
                .into());
            }
            if ann.key.name == "sync" {
                props.insert(FnProp::Sync);
            } else {
                self.register_function_annotation(name, &ann.key, &mut props)?;
            }
        }

        self.register(FunctionRecord {
            name: name.to_string(),
            ty: sig.ty,
            props,
            module: self.current_module.clone(),
            span,
        })
    }

    /// Apply a valueless annotation shared by composite and builtin functions.
    fn register_function_annotation(
        &mut self,
        function: &str,
        key: &Ident,
        props: &mut BTreeSet<FnProp>,
    ) -> WalkResult<()> {
        match key.name.as_str() {
            "assertion" => self.semantics.add_assert_variant(function),
            "pure" => self.semantics.add_pure(function),
            "commutative" => self.semantics.add_commutative(function),
            "copy" => self.semantics.add_copy(function),
            "minmax" => self.semantics.add_minmax(function),
            "par" => {
                props.insert(FnProp::Parallel);
            }
            other => {
                return Err(Diagnostic::error(
                    codes::E0500,
                    key.span,
                    format!("Invalid annotation @{} for function {}", other, function),
                )
                .with_hint(format!("valid annotations: {}", FUNCTION_ANNOTATIONS))
                .into())
            }
        }
        Ok(())
    }

    pub(crate) fn define_builtin_function(&mut self, decl: &BuiltinDecl, span: Span) -> WalkResult<()> {
        let name = decl.name.name.as_str();
        let sig = self.signature(name, &decl.outputs, &decl.inputs, &decl.type_params)?;
        debug!("builtin: {} {}", name, Type::Function(sig.ty.clone()));

        self.emit(Instr::RequirePackage {
            package: decl.package.clone(),
            version: decl.version.clone(),
        });

        if let Some((text, tspan)) = &decl.inline_template {
            let in_names = sig.inputs.iter().map(|v| v.name.clone()).collect();
            let out_names = sig.outputs.iter().map(|v| v.name.clone()).collect();
            let template = OpTemplate::parse(text, in_names, out_names).map_err(|e| {
                Diagnostic::error(
                    codes::E0206,
                    *tspan,
                    format!("Invalid inline template for {}: {}", name, e),
                )
            })?;
            self.semantics.add_inline_template(name, template);
        }

        let mut props = BTreeSet::new();
        for ann in &decl.annotations {
            self.builtin_annotation(name, ann, &mut props)?;
        }

        let task_mode = self.semantics.task_mode(name);
        let targetable = !task_mode.is_local();
        if targetable {
            props.insert(FnProp::Targetable);
        }

        match &decl.symbol {
            Some(symbol) => {
                props.insert(FnProp::Builtin);
                self.emit(Instr::DefineBuiltin {
                    name: name.to_string(),
                    ty: sig.ty.clone(),
                    package: decl.package.clone(),
                    symbol: symbol.clone(),
                    version: decl.version.clone(),
                });
            }
            None => {
                if !self.semantics.has_local_version(name) {
                    return Err(Diagnostic::error(
                        codes::E0203,
                        decl.name.span,
                        format!(
                            "Must provide an implementation symbol or inline template for builtin {}",
                            name
                        ),
                    )
                    .into());
                }
                props.insert(FnProp::WrappedBuiltin);
                props.insert(FnProp::Sync);
                let parallel = props.contains(&FnProp::Parallel);
                if parallel && task_mode != TaskMode::Worker {
                    return Err(Diagnostic::error(
                        codes::E0503,
                        decl.name.span,
                        "Parallel tasks must execute on workers",
                    )
                    .into());
                }
                self.semantics.save_wrapper(
                    name,
                    WrapperSpec {
                        task_mode,
                        parallel,
                        targetable,
                    },
                );
            }
        }

        self.register(FunctionRecord {
            name: name.to_string(),
            ty: sig.ty,
            props,
            module: self.current_module.clone(),
            span,
        })
    }

    fn builtin_annotation(
        &mut self,
        function: &str,
        ann: &Annotation,
        props: &mut BTreeSet<FnProp>,
    ) -> WalkResult<()> {
        let Some(value) = &ann.value else {
            return self.register_function_annotation(function, &ann.key, props);
        };
        match ann.key.name.as_str() {
            "builtin_op" => {
                let op: Opcode = value.parse().map_err(|_| {
                    Diagnostic::error(codes::E0501, ann.span, format!("Unknown builtin op {}", value))
                })?;
                self.semantics.add_local_equivalent(function, op);
            }
            "intrinsic" => {
                let intrinsic: Intrinsic = value.to_ascii_lowercase().parse().map_err(|_| {
                    Diagnostic::error(
                        codes::E0500,
                        ann.span,
                        format!(
                            "Invalid intrinsic name: {}. Expected one of: {}",
                            value,
                            Intrinsic::valid_names()
                        ),
                    )
                })?;
                self.semantics.add_intrinsic(function, intrinsic);
            }
            "implements" => {
                let special: SpecialFunction = value.parse().map_err(|_| {
                    let valid: Vec<&str> = SpecialFunction::ALL.iter().map(|s| s.name()).collect();
                    Diagnostic::error(
                        codes::E0500,
                        ann.span,
                        format!(
                            "\"{}\" is not the name of a specially handled function. Valid options are: {}",
                            value,
                            valid.join(", ")
                        ),
                    )
                })?;
                self.semantics.add_special_impl(special, function);
            }
            "dispatch" => {
                let mode: TaskMode = value.parse().map_err(|_| {
                    Diagnostic::error(
                        codes::E0502,
                        ann.span,
                        format!(
                            "Unknown dispatch mode {}. Valid options are: {}",
                            value,
                            TaskMode::valid_names()
                        ),
                    )
                })?;
                self.semantics.set_task_mode(function, mode);
            }
            other => {
                return Err(Diagnostic::error(
                    codes::E0500,
                    ann.span,
                    format!("Invalid annotation @{}={} for builtin function {}", other, value, function),
                )
                .with_hint("valued annotations: builtin_op, intrinsic, implements, dispatch")
                .into())
            }
        }
        Ok(())
    }

    pub(crate) fn define_app_function(&mut self, decl: &AppDecl, span: Span) -> WalkResult<()> {
        let name = decl.name.name.as_str();
        debug!("define app function: {}", name);
        let sig = self.signature(name, &decl.outputs, &decl.inputs, &[])?;
        self.register(FunctionRecord {
            name: name.to_string(),
            ty: sig.ty,
            props: BTreeSet::from([FnProp::App, FnProp::Sync, FnProp::Targetable]),
            module: self.current_module.clone(),
            span,
        })
    }

    // ── Types ──

    pub(crate) fn define_struct_type(&mut self, decl: &StructTypeDecl, _span: Span) -> WalkResult<()> {
        let name = &decl.name.name;
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(decl.fields.len());
        for field in &decl.fields {
            let ty = self.resolve_type(&field.type_name, &field.dims, &[])?;
            if !seen.insert(field.name.name.as_str()) {
                return Err(Diagnostic::error(
                    codes::E0204,
                    field.name.span,
                    format!("Field {} is defined twice in type {}", field.name.name, name),
                )
                .into());
            }
            fields.push(StructField {
                name: field.name.name.clone(),
                ty,
            });
        }
        let st = StructType {
            name: name.clone(),
            fields,
        };
        self.define_named_type(&decl.name, Type::Struct(st.clone()))?;
        debug!("defined new type called {}", name);
        self.emit(Instr::DefineStruct { ty: st });
        Ok(())
    }

    pub(crate) fn define_new_type(&mut self, decl: &NewTypeDecl, _span: Span) -> WalkResult<()> {
        let base = self.resolve_type(&decl.base, &decl.dims, &[])?;
        let ty = if decl.alias_only {
            base
        } else {
            Type::SubType {
                name: decl.name.name.clone(),
                base: Box::new(base),
            }
        };
        self.define_named_type(&decl.name, ty)
    }

    fn define_named_type(&mut self, name: &Ident, ty: Type) -> WalkResult<()> {
        self.globals.define_type(&name.name, ty).map_err(|_| {
            Diagnostic::error(
                codes::E0200,
                name.span,
                format!("Type {} is already defined", name.name),
            )
            .into()
        })
    }

    // ── Global constants ──

    pub(crate) fn define_global_const(&mut self, decl: &Declaration, span: Span) -> WalkResult<()> {
        let [v] = decl.vars.as_slice() else {
            return Err(Diagnostic::error(
                codes::E0205,
                span,
                "A global constant declaration must declare exactly one variable",
            )
            .into());
        };
        if v.mapping.is_some() {
            return Err(Diagnostic::error(codes::E0205, v.span, "Can't have mapped global constant").into());
        }
        let ty = self.resolve_type(&decl.type_name, &v.dims, &[])?;
        let Some(init) = &v.init else {
            return Err(Diagnostic::error(
                codes::E0205,
                v.span,
                format!("Global constant {} must be given a value", v.name.name),
            )
            .into());
        };

        let non_literal = || {
            Diagnostic::error(
                codes::E0205,
                init.span,
                "Don't support non-literal expressions for global constants",
            )
        };
        let value_ty = literal_type(init).ok_or_else(non_literal)?;
        if !value_ty.assignable_to(&ty) {
            return Err(Diagnostic::error(
                codes::E0300,
                init.span,
                format!(
                    "Trying to assign expression of type {} to global constant {} which has type {}",
                    value_ty, v.name.name, ty
                ),
            )
            .into());
        }
        let value = match ty.prim() {
            Some(PrimType::Bool) => init.bool_literal().map(Arg::Bool),
            Some(PrimType::Int) => init.int_literal().map(Arg::Int),
            Some(PrimType::Float) => init
                .float_literal()
                .or_else(|| init.int_literal().map(|i| i as f64))
                .map(Arg::Float),
            Some(PrimType::String) => init.string_literal().map(|s| Arg::Str(s.to_string())),
            _ => {
                return Err(Diagnostic::error(
                    codes::E0205,
                    v.span,
                    format!("Global constant {} has unsupported type {}", v.name.name, ty),
                )
                .into())
            }
        }
        .ok_or_else(non_literal)?;

        let var = Var::new(v.name.name.clone(), ty, Alloc::GlobalConst, DefKind::GlobalConst);
        self.globals.define_constant(var).map_err(|_| {
            Diagnostic::error(
                codes::E0200,
                v.name.span,
                format!("Global constant {} is already defined", v.name.name),
            )
        })?;
        self.emit(Instr::AddGlobal {
            name: v.name.name.clone(),
            value,
        });
        Ok(())
    }
}

/// Type of a literal expression (looking through unary minus), or `None`.
fn literal_type(e: &Expr) -> Option<Type> {
    if e.int_literal().is_some() {
        return Some(Type::int_literal());
    }
    if e.float_literal().is_some() {
        return Some(Type::float());
    }
    match &e.kind {
        ExprKind::StringLit(_) => Some(Type::string()),
        ExprKind::BoolLit(_) => Some(Type::bool()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::ir::IrBuffer;
    use crate::loader::LoadedModule;
    use crate::pass::FrontendPass;
    use std::rc::Rc;

    fn settings() -> Settings {
        Settings {
            implicit_imports: Vec::new(),
            ..Settings::default()
        }
    }

    /// Run only the definitions pass over `src`.
    fn define(src: &str) -> (WalkResult<()>, IrBuffer, Vec<(String, BTreeSet<FnProp>)>) {
        let mut buf = IrBuffer::new();
        let mut records = Vec::new();
        let result = {
            let mut session = Session::new(settings(), &mut buf);
            let main = Rc::new(LoadedModule::main("t.weft", src).unwrap());
            let r = session.run_pass(&main, FrontendPass::Definitions);
            for name in session.globals.function_names() {
                let f = session.globals.lookup_function(name).unwrap();
                records.push((name.to_string(), f.props.clone()));
            }
            r
        };
        (result, buf, records)
    }

    fn err_message(src: &str) -> String {
        define(src).0.unwrap_err().to_string()
    }

    #[test]
    fn global_constant_literal() {
        let (r, buf, _) = define("global const int x = 3;");
        r.unwrap();
        assert_eq!(buf.render(), "global x = 3\n");
    }

    #[test]
    fn global_constant_int_widens_to_float() {
        let (r, buf, _) = define("global const float f = 2;");
        r.unwrap();
        assert_eq!(buf.render(), "global f = 2.0\n");
    }

    #[test]
    fn global_constant_rejects_expressions() {
        let msg = err_message("global const int x = 1 + 2;");
        assert!(msg.contains("Don't support non-literal expressions for global constants"));
    }

    #[test]
    fn global_constant_type_mismatch() {
        let msg = err_message("global const int x = \"s\";");
        assert!(msg.contains("global constant x which has type int"), "{}", msg);
    }

    #[test]
    fn struct_fields_must_be_unique() {
        let msg = err_message("type pt { int x; float x; }");
        assert!(msg.contains("Field x is defined twice in type pt"));
    }

    #[test]
    fn struct_definition_is_emitted() {
        let (r, buf, _) = define("type pt { int x; string tags[]; }");
        r.unwrap();
        assert_eq!(buf.render(), "struct pt { int x; string[] tags }\n");
    }

    #[test]
    fn builtin_with_symbol() {
        let (r, buf, records) = define(
            "@pure @builtin_op=PLUS_INT (int o) plus (int a, int b) \"weft\" \"1.0\" \"plus_impl\";",
        );
        r.unwrap();
        assert_eq!(
            buf.render(),
            "require weft 1.0\nbuiltin plus = weft::plus_impl 1.0\n"
        );
        let (_, props) = &records[0];
        assert!(props.contains(&FnProp::Builtin));
        assert!(props.contains(&FnProp::Targetable));
    }

    #[test]
    fn template_only_builtin_is_wrapped() {
        let (r, _, records) =
            define("@dispatch=LOCAL (int o) twice (int i) \"weft\" \"1.0\" [\"set <<o>> [expr 2*<<i>>]\"];");
        r.unwrap();
        let (_, props) = &records[0];
        assert!(props.contains(&FnProp::WrappedBuiltin));
        assert!(props.contains(&FnProp::Sync));
        assert!(!props.contains(&FnProp::Targetable));
    }

    #[test]
    fn builtin_needs_an_implementation() {
        let msg = err_message("(int o) f (int i) \"weft\" \"1.0\";");
        assert!(msg.contains("Must provide an implementation symbol or inline template"));
    }

    #[test]
    fn parallel_wrapped_builtin_must_run_on_workers() {
        let msg = err_message("@par (int o) f (int i) \"weft\" \"1.0\" [\"<<o>> <<i>>\"];");
        assert!(msg.contains("Parallel tasks must execute on workers"));
    }

    #[test]
    fn unknown_dispatch_mode_lists_valid_modes() {
        let msg = err_message("@dispatch=GPU (int o) f (int i) \"weft\" \"1.0\" \"f\";");
        assert!(msg.contains("Unknown dispatch mode GPU"));
        assert!(msg.contains("WORKER"));
    }

    #[test]
    fn unknown_builtin_op() {
        let msg = err_message("@builtin_op=FROB (int o) f (int i) \"weft\" \"1.0\" \"f\";");
        assert!(msg.contains("Unknown builtin op FROB"));
    }

    #[test]
    fn main_takes_no_arguments() {
        let msg = err_message("(int o) main (int i) { o = i; }");
        assert!(msg.contains("main() is not allowed to have input or output arguments"));
    }

    #[test]
    fn composite_rejects_varargs() {
        let msg = err_message("(int o) f (int... xs) { }");
        assert!(msg.contains("variable-length argument lists"));
    }

    #[test]
    fn duplicate_function() {
        let msg = err_message("(int o) f () { } (int o) f () { }");
        assert!(msg.contains("Function f is already defined"));
    }

    #[test]
    fn sync_annotation_sets_property() {
        let (r, _, records) = define("@sync (int o) f () { o = 1; }");
        r.unwrap();
        assert!(records[0].1.contains(&FnProp::Sync));
        assert!(records[0].1.contains(&FnProp::Composite));
    }

    #[test]
    fn app_is_sync_and_targetable() {
        let (r, _, records) = define("app (file o) cp (file i) { \"cp\" @i @o; }");
        r.unwrap();
        let props = &records[0].1;
        assert!(props.contains(&FnProp::App));
        assert!(props.contains(&FnProp::Sync));
        assert!(props.contains(&FnProp::Targetable));
    }

    #[test]
    fn string_keyed_arrays_resolve() {
        let (r, _, _) = define("type table int[string];");
        r.unwrap();
        let msg = err_message("type bad int[float];");
        assert!(msg.contains("Array key type must be int or string"));
    }
}
