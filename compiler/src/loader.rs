// loader.rs — Compilation session and two-pass module loader
//
// A `Session` owns everything shared across modules: settings, the global
// scope, the builtin semantics registry, the loaded-module table and the
// backend being driven. `walk` runs the definitions pass over the whole
// import graph, checks the entry point, then runs the compile pass.
//
// Preconditions: the main module has been parsed.
// Postconditions: on success every loaded module has been defined once and
//   compiled once, in import order starting from the implicit imports.
// Failure modes: unresolvable imports (E0100), unreadable or unparsable
//   modules, definition and lowering errors, missing entry point (E0103).
// Side effects: reads imported module files; emits instructions to the
//   backend.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, info, trace, warn};

use crate::ast::{ImportDecl, ModulePath, Program, Span, TopLevel, TopLevelKind};
use crate::config::Settings;
use crate::diag::{codes, CompileError, Diagnostic, LineMap, Origin, WalkResult};
use crate::ir::{Backend, Instr};
use crate::pass::{required_passes, FrontendPass};
use crate::scope::{FnProp, GlobalScope};
use crate::semantics::Semantics;

// ── Modules ────────────────────────────────────────────────────────────────

/// Where a module lives and what it is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Dotted, search-path independent name. Empty for the main module.
    pub canonical: String,
    pub path: PathBuf,
}

/// A parsed module.
#[derive(Debug)]
pub struct LoadedModule {
    pub info: ModuleInfo,
    pub source: String,
    pub program: Program,
    lines: LineMap,
}

impl LoadedModule {
    /// Parse `source`. Syntax errors are reported all at once.
    pub fn parse(info: ModuleInfo, source: String) -> WalkResult<LoadedModule> {
        let lines = LineMap::new(&source);
        let result = crate::parser::parse(&source);
        let path = info.path.display().to_string();
        if !result.errors.is_empty() {
            let errors = result
                .errors
                .iter()
                .map(|e| {
                    let (line, col) = lines.location(e.span().start);
                    format!("{}:{}: {}", line, col, e)
                })
                .collect();
            return Err(CompileError::Syntax { path, errors });
        }
        let program = result.program.ok_or_else(|| CompileError::Syntax {
            path,
            errors: vec!["parser produced no output".to_string()],
        })?;
        Ok(LoadedModule {
            info,
            source,
            program,
            lines,
        })
    }

    /// Read and parse the file named by `info`.
    pub fn read(info: ModuleInfo) -> WalkResult<LoadedModule> {
        let source = std::fs::read_to_string(&info.path).map_err(|source| CompileError::Io {
            path: info.path.display().to_string(),
            source,
        })?;
        LoadedModule::parse(info, source)
    }

    /// Parse the main module from in-memory text.
    pub fn main(path: impl Into<PathBuf>, source: impl Into<String>) -> WalkResult<LoadedModule> {
        LoadedModule::parse(
            ModuleInfo {
                canonical: String::new(),
                path: path.into(),
            },
            source.into(),
        )
    }

    pub fn origin(&self, span: Span) -> Origin {
        let (line, column) = self.lines.location(span.start);
        Origin {
            module: self.info.path.display().to_string(),
            line,
            column,
        }
    }

    fn display_name(&self) -> &str {
        if self.info.canonical.is_empty() {
            "<main>"
        } else {
            &self.info.canonical
        }
    }
}

// ── Session ────────────────────────────────────────────────────────────────

/// State threaded through both passes of one compilation.
pub struct Session<'b> {
    pub settings: Settings,
    pub globals: GlobalScope,
    pub semantics: Semantics,
    /// Non-fatal diagnostics, in the order raised.
    pub warnings: Vec<Diagnostic>,
    /// Canonical name of the module whose items are being processed.
    pub(crate) current_module: String,
    modules: HashMap<String, Rc<LoadedModule>>,
    load_order: Vec<Rc<LoadedModule>>,
    compiled: HashSet<String>,
    /// Template-only builtins whose wrapper has been defined.
    pub(crate) wrappers_defined: HashSet<String>,
    backend: &'b mut dyn Backend,
}

impl<'b> Session<'b> {
    pub fn new(settings: Settings, backend: &'b mut dyn Backend) -> Self {
        Session {
            settings,
            globals: GlobalScope::default(),
            semantics: Semantics::new(),
            warnings: Vec::new(),
            current_module: String::new(),
            modules: HashMap::new(),
            load_order: Vec::new(),
            compiled: HashSet::new(),
            wrappers_defined: HashSet::new(),
            backend,
        }
    }

    pub fn emit(&mut self, instr: Instr) {
        trace!("emit {}", instr);
        self.backend.emit(instr);
    }

    /// Record a non-fatal diagnostic.
    pub fn warn(&mut self, diag: Diagnostic) {
        warn!("{}", diag);
        self.warnings.push(diag);
    }

    /// Modules in the order the definitions pass first reached them.
    pub fn loaded_modules(&self) -> impl Iterator<Item = &LoadedModule> {
        self.load_order.iter().map(|m| m.as_ref())
    }

    pub fn is_loaded(&self, canonical: &str) -> bool {
        self.modules.contains_key(canonical)
    }

    pub fn is_compiled(&self, canonical: &str) -> bool {
        self.compiled.contains(canonical)
    }

    /// Run every pass over the program rooted at `main`. The entry point
    /// is checked once all definitions are registered.
    pub fn walk(&mut self, main: LoadedModule) -> WalkResult<()> {
        let main = Rc::new(main);
        for pass in required_passes(FrontendPass::Compile) {
            self.run_pass(&main, pass)?;
            if pass == FrontendPass::Definitions {
                self.check_entry_point()
                    .map_err(|e| e.in_origin(|s| main.origin(s)))?;
            }
        }
        Ok(())
    }

    /// Run one pass: implicit imports first, then the main module, with
    /// imports followed depth-first.
    pub fn run_pass(&mut self, main: &Rc<LoadedModule>, pass: FrontendPass) -> WalkResult<()> {
        info!("pass {}: starting", pass);
        for name in self.settings.implicit_imports.clone() {
            let segments: Vec<String> = name.split('.').map(str::to_string).collect();
            let module_info = self
                .locate_module(&segments, Span::from(0..0))
                .map_err(|e| e.in_origin(|s| main.origin(s)))?;
            self.load_module(module_info, pass)?;
        }
        match pass {
            FrontendPass::Definitions => {
                if !self.is_loaded(&main.info.canonical) {
                    self.define_module(main.clone())?;
                }
            }
            FrontendPass::Compile => self.compile_module(main.clone())?,
        }
        info!("pass {}: done", pass);
        Ok(())
    }

    /// Load a module for `pass`. Idempotent per canonical name and pass.
    pub fn load_module(&mut self, module_info: ModuleInfo, pass: FrontendPass) -> WalkResult<()> {
        match pass {
            FrontendPass::Definitions => {
                if self.is_loaded(&module_info.canonical) {
                    debug!("module {} already defined", module_info.canonical);
                    return Ok(());
                }
                let module = Rc::new(LoadedModule::read(module_info)?);
                self.define_module(module)
            }
            FrontendPass::Compile => {
                let module = self
                    .modules
                    .get(&module_info.canonical)
                    .cloned()
                    .ok_or_else(|| {
                        CompileError::internal(format!(
                            "module {} reached in compile pass but never defined",
                            module_info.canonical
                        ))
                    })?;
                self.compile_module(module)
            }
        }
    }

    fn define_module(&mut self, module: Rc<LoadedModule>) -> WalkResult<()> {
        debug!("defining module {}", module.display_name());
        self.modules
            .insert(module.info.canonical.clone(), module.clone());
        self.load_order.push(module.clone());
        let outer = std::mem::replace(&mut self.current_module, module.info.canonical.clone());
        let result = module
            .program
            .items
            .iter()
            .try_for_each(|item| self.define_item(item))
            .map_err(|e| e.in_origin(|s| module.origin(s)));
        self.current_module = outer;
        result?;
        debug!("defined module {}", module.display_name());
        Ok(())
    }

    fn define_item(&mut self, item: &TopLevel) -> WalkResult<()> {
        match &item.kind {
            TopLevelKind::Import(import) => {
                let module_info = self.resolve_import(import, item.span)?;
                self.load_module(module_info, FrontendPass::Definitions)
            }
            TopLevelKind::Function(f) => self.define_function(f, item.span),
            TopLevelKind::Builtin(b) => self.define_builtin_function(b, item.span),
            TopLevelKind::App(a) => self.define_app_function(a, item.span),
            TopLevelKind::StructType(s) => self.define_struct_type(s, item.span),
            TopLevelKind::NewType(t) => self.define_new_type(t, item.span),
            TopLevelKind::GlobalConst(d) => self.define_global_const(d, item.span),
        }
    }

    fn compile_module(&mut self, module: Rc<LoadedModule>) -> WalkResult<()> {
        if !self.compiled.insert(module.info.canonical.clone()) {
            debug!("module {} already compiled", module.display_name());
            return Ok(());
        }
        debug!("compiling module {}", module.display_name());
        for item in &module.program.items {
            self.compile_item(item)
                .map_err(|e| e.in_origin(|s| module.origin(s)))?;
        }
        debug!("compiled module {}", module.display_name());
        Ok(())
    }

    fn compile_item(&mut self, item: &TopLevel) -> WalkResult<()> {
        match &item.kind {
            TopLevelKind::Import(import) => {
                let module_info = self.resolve_import(import, item.span)?;
                self.load_module(module_info, FrontendPass::Compile)
            }
            TopLevelKind::Function(f) => self.compile_function(f),
            TopLevelKind::App(a) => self.compile_app_function(a),
            TopLevelKind::Builtin(_)
            | TopLevelKind::StructType(_)
            | TopLevelKind::NewType(_)
            | TopLevelKind::GlobalConst(_) => Ok(()),
        }
    }

    // ── Module search ──

    fn resolve_import(&self, import: &ImportDecl, span: Span) -> WalkResult<ModuleInfo> {
        let segments: Vec<String> = match &import.path {
            ModulePath::Dotted(ids) => ids.iter().map(|i| i.name.clone()).collect(),
            ModulePath::Literal(text, _) => text
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        };
        if segments.is_empty() {
            return Err(Diagnostic::error(codes::E0100, span, "Empty module path in import").into());
        }
        self.locate_module(&segments, span)
    }

    /// Find the file for a module path by trying each search directory in
    /// order. Empty search entries are skipped.
    pub fn locate_module(&self, segments: &[String], span: Span) -> WalkResult<ModuleInfo> {
        let canonical = segments.join(".");
        let Some((last, dirs)) = segments.split_last() else {
            return Err(CompileError::internal("empty module path"));
        };
        let file_name = format!("{}.{}", last, self.settings.file_extension);
        for root in &self.settings.module_path {
            if root.as_os_str().is_empty() {
                continue;
            }
            let mut candidate = root.clone();
            candidate.extend(dirs);
            candidate.push(&file_name);
            trace!("module {}: trying {}", canonical, candidate.display());
            if candidate.is_file() {
                debug!("module {} resolved to {}", canonical, candidate.display());
                return Ok(ModuleInfo {
                    canonical,
                    path: candidate,
                });
            }
        }
        let tried: Vec<String> = self
            .settings
            .module_path
            .iter()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.display().to_string())
            .collect();
        Err(Diagnostic::error(
            codes::E0100,
            span,
            format!(
                "Could not find module {} in search path: [{}]",
                canonical,
                tried.join(", ")
            ),
        )
        .into())
    }

    // ── Entry point ──

    fn check_entry_point(&self) -> WalkResult<()> {
        let name = &self.settings.main_function;
        match self.globals.lookup_function(name) {
            Some(f) if f.has(FnProp::Composite) => Ok(()),
            _ => Err(Diagnostic::error(
                codes::E0103,
                Span::from(0..0),
                format!("No composite {} function was defined in the script", name),
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrBuffer;

    fn settings_for(dir: &std::path::Path) -> Settings {
        Settings {
            module_path: vec![PathBuf::new(), dir.to_path_buf()],
            implicit_imports: Vec::new(),
            ..Settings::default()
        }
    }

    #[test]
    fn locate_module_appends_segments_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg").join("util.weft"), "").unwrap();
        let mut buf = IrBuffer::new();
        let session = Session::new(settings_for(dir.path()), &mut buf);
        let info = session
            .locate_module(&["pkg".to_string(), "util".to_string()], Span::from(0..0))
            .unwrap();
        assert_eq!(info.canonical, "pkg.util");
        assert!(info.path.ends_with("pkg/util.weft"));
    }

    #[test]
    fn missing_module_names_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = IrBuffer::new();
        let session = Session::new(settings_for(dir.path()), &mut buf);
        let err = session
            .locate_module(&["nope".to_string()], Span::from(0..0))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Could not find module nope in search path: ["), "{}", msg);
        assert!(msg.contains(&dir.path().display().to_string()));
        assert_eq!(err.diagnostic().unwrap().code, Some(codes::E0100));
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = LoadedModule::main("bad.weft", "main {\n  int x = ;\n}").unwrap_err();
        let CompileError::Syntax { path, errors } = err else {
            panic!("expected syntax error");
        };
        assert_eq!(path, "bad.weft");
        assert!(errors[0].starts_with("2:"), "{:?}", errors);
    }

    #[test]
    fn block_comments_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = IrBuffer::new();
        let mut session = Session::new(settings_for(dir.path()), &mut buf);
        let src = "/** module doc\n * with a * inside */\nmain { /* empty */ }";
        session.walk(LoadedModule::main("c.weft", src).unwrap()).unwrap();
        drop(session);
        assert!(buf.render().contains("function main"), "{}", buf.render());
    }

    #[test]
    fn missing_entry_point_is_rejected_before_lowering() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = IrBuffer::new();
        let mut session = Session::new(settings_for(dir.path()), &mut buf);
        let main = LoadedModule::main("m.weft", "(int o) f (int i) { o = i; }").unwrap();
        let err = session.walk(main).unwrap_err();
        assert!(err
            .to_string()
            .contains("No composite main function was defined in the script"));
        drop(session);
        assert!(buf.instrs.is_empty());
    }
}
