// app.rs — App function lowering
//
// An app function runs an external command. Its body becomes a worker
// task that waits for every input and for the filenames of every file on
// the command line, then runs the command with local values and closes the
// outputs from the local results.
//
// Preconditions: the app was registered by the definitions pass.
// Postconditions: the function body contains exactly one dispatched task.
// Failure modes: E0500 (annotations), E0600-E0603 (outputs, redirects,
//   command-line arguments). Unused outputs produce W0600.
// Side effects: emits instructions; records warnings on the session.

use std::collections::{HashMap, HashSet};

use log::{debug, error, info};

use crate::ast::{AppArg, AppBody, AppDecl, Expr, ExprKind, RedirectKind};
use crate::diag::{codes, CompileError, Diagnostic, WalkResult};
use crate::ir::{Arg, Instr, Redirects, TaskMode, TaskPropKey, TaskProps, WaitMode, WaitSpec};
use crate::loader::Session;
use crate::scope::{Alloc, DefKind, Var};
use crate::types::Type;
use crate::walker::Walker;

/// Side-effect flags passed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AppFlags {
    has_side_effects: bool,
    deterministic: bool,
}

/// A command-line word: a file (passed by filename) or a value.
#[derive(Debug, Clone)]
enum CmdArg {
    File(Var),
    Value(Var),
}

impl<'b> Session<'b> {
    pub(crate) fn compile_app_function(&mut self, decl: &AppDecl) -> WalkResult<()> {
        let name = decl.name.name.as_str();
        info!("compiling app function {}", name);
        let flags = app_flags(decl)?;
        let sig = self.signature(name, &decl.outputs, &decl.inputs, &[])?;
        self.check_app_outputs(decl, &sig.outputs)?;

        // The caller's target rank is passed implicitly.
        let location = Var::new("__location", Type::int(), Alloc::Local, DefKind::InArg);
        let mut inputs = sig.inputs.clone();
        inputs.push(location.clone());
        let mut props = TaskProps::new();
        props.insert(TaskPropKey::Location, Arg::Var(location));

        let mut w = Walker::new(self, name);
        for arg in sig.outputs.iter().chain(&sig.inputs) {
            w.bind_var(arg.clone(), decl.name.span)?;
        }
        let start = Instr::StartFunction {
            name: name.to_string(),
            outputs: sig.outputs.clone(),
            inputs,
            mode: TaskMode::Sync,
        };
        w.construct(start, Instr::EndFunction, |w| {
            w.app_body(&decl.body, &sig.outputs, &sig.inputs, props, flags)
        })?;
        debug!("compiled app function {}", name);
        Ok(())
    }

    /// Outputs must be files or void, and should appear on the command line.
    fn check_app_outputs(&mut self, decl: &AppDecl, outputs: &[Var]) -> WalkResult<()> {
        let mut problems = Vec::new();
        for out in outputs {
            if !(out.ty.is_file() || out.ty.is_void()) {
                let msg = format!("Output argument {} has type {}; app outputs must be file or void", out.name, out.ty);
                error!("{}: {}", decl.name.name, msg);
                problems.push(msg);
            }
        }
        if !problems.is_empty() {
            return Err(Diagnostic::error(
                codes::E0600,
                decl.name.span,
                format!(
                    "Compilation failed due to type error in definition of function {}",
                    decl.name.name
                ),
            )
            .with_hint(problems.join("; "))
            .into());
        }

        let referenced = command_line_names(&decl.body);
        for out in outputs {
            if !out.ty.is_void() && !referenced.contains(&out.name) {
                self.warn(Diagnostic::warning(
                    codes::W0600,
                    decl.name.span,
                    format!(
                        "Output argument {} is not referenced in app command line",
                        out.name
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn app_flags(decl: &AppDecl) -> WalkResult<AppFlags> {
    let mut flags = AppFlags {
        has_side_effects: true,
        deterministic: false,
    };
    for ann in &decl.annotations {
        match (ann.key.name.as_str(), &ann.value) {
            ("pure", None) => {
                flags.has_side_effects = false;
                flags.deterministic = true;
            }
            ("sideeffectfree", None) => flags.has_side_effects = false,
            ("deterministic", None) => flags.deterministic = true,
            (key, _) => {
                return Err(Diagnostic::error(
                    codes::E0500,
                    ann.span,
                    format!("Invalid annotation @{} for app function {}", key, decl.name.name),
                )
                .with_hint("valid: pure, sideeffectfree, deterministic")
                .into())
            }
        }
    }
    Ok(flags)
}

/// Variable names mentioned in arguments and redirects.
fn command_line_names(body: &AppBody) -> HashSet<String> {
    let mut names = HashSet::new();
    for arg in &body.args {
        match arg {
            AppArg::Filename(id) => {
                names.insert(id.name.clone());
            }
            AppArg::Expr(e) => expr_names(e, &mut names),
        }
    }
    for r in &body.redirects {
        expr_names(&r.target, &mut names);
    }
    names
}

fn expr_names(e: &Expr, out: &mut HashSet<String>) {
    match &e.kind {
        ExprKind::Var(name) => {
            out.insert(name.clone());
        }
        ExprKind::Call { args, .. } | ExprKind::ArrayLit(args) => {
            args.iter().for_each(|a| expr_names(a, out));
        }
        ExprKind::Index { base, index } => {
            expr_names(base, out);
            expr_names(index, out);
        }
        ExprKind::Field { base, .. } => expr_names(base, out),
        ExprKind::Unary { operand, .. } => expr_names(operand, out),
        ExprKind::Binary { lhs, rhs, .. } => {
            expr_names(lhs, out);
            expr_names(rhs, out);
        }
        ExprKind::IntLit(_) | ExprKind::FloatLit(_) | ExprKind::StringLit(_) | ExprKind::BoolLit(_) => {}
    }
}

impl<'s, 'b> Walker<'s, 'b> {
    fn app_body(
        &mut self,
        body: &AppBody,
        outputs: &[Var],
        inputs: &[Var],
        props: TaskProps,
        flags: AppFlags,
    ) -> WalkResult<()> {
        let args = body
            .args
            .iter()
            .map(|a| self.command_arg(a))
            .collect::<WalkResult<Vec<_>>>()?;
        let redirects = self.redirects(body)?;

        // One filename alias per file, in order of first appearance.
        let mut filenames: HashMap<String, Var> = HashMap::new();
        let mut wait_vars: Vec<Var> = Vec::new();
        let files = args
            .iter()
            .chain(redirects.iter().map(|(_, a)| a))
            .filter_map(|a| match a {
                CmdArg::File(f) => Some(f.clone()),
                CmdArg::Value(_) => None,
            })
            .chain(outputs.iter().filter(|o| o.ty.is_file()).cloned())
            .collect::<Vec<_>>();
        for file in files {
            if filenames.contains_key(&file.name) {
                continue;
            }
            let output = file.def_kind == DefKind::OutArg;
            let fname = self.create_alias(Type::string());
            self.emit(Instr::GetFileName {
                dst: fname.clone(),
                file: file.clone(),
                init_unmapped: output,
            });
            push_unique(&mut wait_vars, fname.clone());
            if !output {
                push_unique(&mut wait_vars, file.clone());
            }
            filenames.insert(file.name.clone(), fname);
        }
        for arg in &args {
            if let CmdArg::Value(v) = arg {
                push_unique(&mut wait_vars, v.clone());
            }
        }

        let spec = WaitSpec {
            name: self.names.construct_name("app-leaf"),
            wait_vars,
            keep_open: Vec::new(),
            mode: WaitMode::TaskDispatch,
            explicit: false,
            deep: true,
            task_mode: TaskMode::Worker,
            props,
        };
        self.construct(Instr::StartWait { spec }, Instr::EndWait, |w| {
            let mut fetched: HashMap<String, Var> = HashMap::new();
            let mut local_arg = |w: &mut Self, arg: &CmdArg| -> WalkResult<Arg> {
                match arg {
                    CmdArg::File(f) => w.filename_value(f, &filenames, &mut fetched).map(Arg::Var),
                    CmdArg::Value(v) if v.ty.is_array() => Ok(Arg::Var(v.clone())),
                    CmdArg::Value(v) => Ok(Arg::Var(w.fetch_value_of(v))),
                }
            };
            let mut cmd_args = Vec::with_capacity(args.len());
            for a in &args {
                cmd_args.push(local_arg(w, a)?);
            }
            let mut local_redirects = Redirects::default();
            for (kind, a) in &redirects {
                let value = local_arg(w, a)?;
                match kind {
                    RedirectKind::Stdin => local_redirects.stdin = Some(value),
                    RedirectKind::Stdout => local_redirects.stdout = Some(value),
                    RedirectKind::Stderr => local_redirects.stderr = Some(value),
                }
            }

            let in_files = inputs
                .iter()
                .filter(|i| i.ty.is_file())
                .map(|i| w.fetch_value_of(i))
                .collect::<Vec<_>>();

            let mut locals = Vec::with_capacity(outputs.len());
            let mut out_files = Vec::new();
            for out in outputs {
                let local = w.create_value_of(out);
                if out.ty.is_file() {
                    let filename = w.filename_value(out, &filenames, &mut fetched)?;
                    w.emit(Instr::InitLocalOutFile {
                        local: local.clone(),
                        filename: Arg::Var(filename),
                        future: out.clone(),
                    });
                    out_files.push(local.clone());
                }
                locals.push(local);
            }

            w.emit(Instr::RunExternal {
                command: body.command.clone(),
                args: cmd_args,
                in_files,
                out_files,
                redirects: local_redirects,
                has_side_effects: flags.has_side_effects,
                deterministic: flags.deterministic,
            });

            for (out, local) in outputs.iter().zip(locals) {
                w.emit(Instr::Assign {
                    dst: out.clone(),
                    src: Arg::Var(local.clone()),
                });
                if out.ty.is_file() && !out.is_mapped() {
                    w.emit(Instr::DecrLocalFileRef { file: local });
                }
            }
            Ok(())
        })
    }

    fn command_arg(&mut self, arg: &AppArg) -> WalkResult<CmdArg> {
        match arg {
            AppArg::Filename(id) => {
                let var = self.require_var(&id.name, id.span)?;
                if !var.ty.is_file() {
                    return Err(Diagnostic::error(
                        codes::E0603,
                        id.span,
                        format!("Variable {} is not a file, cannot use @ prefix for app", id.name),
                    )
                    .into());
                }
                Ok(CmdArg::File(var))
            }
            AppArg::Expr(e) => {
                let ty = self.expr_type(e)?;
                let base = ty.array_elem().filter(|_| ty.is_array()).unwrap_or(&ty);
                if !base.is_app_arg() {
                    return Err(Diagnostic::error(
                        codes::E0603,
                        e.span,
                        format!("Cannot convert type {} to app command line arg", ty),
                    )
                    .into());
                }
                let var = self.eval(e, &ty)?;
                if var.ty.is_file() {
                    Ok(CmdArg::File(var))
                } else {
                    Ok(CmdArg::Value(var))
                }
            }
        }
    }

    fn redirects(&mut self, body: &AppBody) -> WalkResult<Vec<(RedirectKind, CmdArg)>> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(body.redirects.len());
        for r in &body.redirects {
            if !seen.insert(r.kind) {
                return Err(Diagnostic::error(
                    codes::E0602,
                    r.span,
                    format!("Specified redirection {} more than once", r.kind.as_str()),
                )
                .into());
            }
            let ty = self.expr_type(&r.target)?;
            if !ty.is_file() {
                return Err(Diagnostic::error(
                    codes::E0601,
                    r.target.span,
                    format!("Invalid type for app redirection, must be file: {}", ty),
                )
                .into());
            }
            let var = self.eval(&r.target, &ty)?;
            out.push((r.kind, CmdArg::File(var)));
        }
        Ok(out)
    }

    /// Local value of the filename of `file`, retrieved once per task.
    fn filename_value(
        &mut self,
        file: &Var,
        filenames: &HashMap<String, Var>,
        fetched: &mut HashMap<String, Var>,
    ) -> WalkResult<Var> {
        if let Some(v) = fetched.get(&file.name) {
            return Ok(v.clone());
        }
        let alias = filenames.get(&file.name).ok_or_else(|| {
            CompileError::internal(format!("no filename loaded for {}", file.name))
        })?;
        let value = Var::new(
            self.names.temp_for("fname", &file.name),
            Type::string(),
            Alloc::Local,
            DefKind::LocalCompiler,
        );
        self.emit(Instr::Declare { var: value.clone() });
        self.emit(Instr::Retrieve {
            dst: value.clone(),
            src: alias.clone(),
        });
        fetched.insert(file.name.clone(), value.clone());
        Ok(value)
    }
}

fn push_unique(vars: &mut Vec<Var>, var: Var) {
    if !vars.iter().any(|v| v.name == var.name) {
        vars.push(var);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::diag::{codes, WalkResult};
    use crate::ir::{check_balanced, IrBuffer};
    use crate::loader::{LoadedModule, Session};

    fn compile(src: &str) -> WalkResult<(String, Vec<String>)> {
        let mut buf = IrBuffer::new();
        let warnings;
        {
            let settings = Settings {
                implicit_imports: Vec::new(),
                ..Settings::default()
            };
            let mut session = Session::new(settings, &mut buf);
            session.walk(LoadedModule::main("t.weft", format!("{}\nmain {{ }}", src))?)?;
            warnings = session.warnings.iter().map(|w| w.to_string()).collect();
        }
        check_balanced(&buf.instrs).unwrap();
        Ok((buf.render(), warnings))
    }

    fn error(src: &str) -> String {
        compile(src).unwrap_err().to_string()
    }

    #[test]
    fn copy_app_waits_for_input_and_filenames() {
        let (ir, warnings) = compile(r#"app (file o) cp (file i) { "cp" @i @o; }"#).unwrap();
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert!(ir.contains("function cp (file o) <- (file i, int __location) SYNC"), "{}", ir);
        assert!(ir.contains("__alias0 := filename(i)\n"), "{}", ir);
        assert!(ir.contains("__alias1 := filename(o) init-unmapped"), "{}", ir);
        assert!(
            ir.contains("wait cp-app-leaf0 (__alias0, i, __alias1) dispatch WORKER deep Location=__location"),
            "{}",
            ir
        );
        assert!(ir.contains("init_local_out_file __v5_o __fname3_o for o"), "{}", ir);
        assert!(ir.contains("run \"cp\" [__fname2_i, __fname3_o] in (__v4_i) out (__v5_o)"), "{}", ir);
        assert!(ir.contains("o := __v5_o"), "{}", ir);
        assert!(ir.contains("decr_local_file_ref __v5_o"), "{}", ir);
    }

    #[test]
    fn values_and_redirects() {
        let (ir, _) = compile(r#"@pure app (file o) gen (int n, string s) { "gen" n s @stdout=o; }"#).unwrap();
        assert!(ir.contains("wait gen-app-leaf0 (__alias0, n, s)"), "{}", ir);
        assert!(ir.contains("stdout=__fname"), "{}", ir);
        assert!(ir.contains(" pure deterministic"), "{}", ir);
    }

    #[test]
    fn unreferenced_output_warns() {
        let (_, warnings) = compile(r#"app (file o) touch () { "touch"; }"#).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Output argument o is not referenced in app command line"));
    }

    #[test]
    fn non_file_output_is_an_error() {
        let err = compile(r#"app (int o) bad () { "bad"; }"#).unwrap_err();
        assert_eq!(err.diagnostic().unwrap().code, Some(codes::E0600));
        assert!(err.to_string().contains("Compilation failed due to type error in definition of function bad"));
    }

    #[test]
    fn redirect_errors() {
        assert!(error(r#"app (file o) r (string s) { "r" @stdin=s @stdout=o; }"#)
            .contains("Invalid type for app redirection, must be file: string"));
        assert!(error(r#"app (file o, file e) r () { "r" @stdout=o @stdout=e; }"#)
            .contains("Specified redirection stdout more than once"));
        assert!(error(r#"app (file o) r (file a, file b) { "r" @o @stdin=a @stdin=b; }"#)
            .contains("Specified redirection stdin more than once"));
    }

    #[test]
    fn filename_prefix_requires_file() {
        assert!(error(r#"app (file o) r (int n) { "r" @n @o; }"#)
            .contains("Variable n is not a file, cannot use @ prefix for app"));
    }

    #[test]
    fn invalid_annotation() {
        assert!(error(r#"@fast app (file o) r () { "r" @o; }"#).contains("Invalid annotation @fast for app function r"));
    }
}
