// scope.rs — Variables, function records and lexical scopes
//
// `GlobalScope` holds program-wide definitions (types, functions, global
// constants). `LocalScope` is a stack of frames for one function body;
// lookups walk frames innermost-first and fall back to globals.
//
// Preconditions: none.
// Postconditions: within a function, a name is declared at most once across
//   all live frames.
// Failure modes: duplicate declarations return `Err(existing)`.
// Side effects: none.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::ast::Span;
use crate::types::{FunctionType, Type};

// ── Variables ──

/// Storage class of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Alloc {
    /// Future allocated in the function's frame.
    Stack,
    /// Points at storage owned by another variable.
    Alias,
    GlobalConst,
    /// Compiler temporary future.
    Temp,
    /// Immediate local value (not a future).
    Local,
}

/// Who introduced the variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DefKind {
    LocalUser,
    InArg,
    OutArg,
    LocalCompiler,
    GlobalConst,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Var {
    pub name: String,
    pub ty: Type,
    pub alloc: Alloc,
    pub def_kind: DefKind,
    /// Name of the variable holding the mapped filename, if any.
    pub mapping: Option<String>,
}

impl Var {
    pub fn new(name: impl Into<String>, ty: Type, alloc: Alloc, def_kind: DefKind) -> Var {
        Var {
            name: name.into(),
            ty,
            alloc,
            def_kind,
            mapping: None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

// ── Functions ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FnProp {
    Composite,
    Builtin,
    WrappedBuiltin,
    App,
    Sync,
    Parallel,
    Targetable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionRecord {
    pub name: String,
    pub ty: FunctionType,
    pub props: BTreeSet<FnProp>,
    /// Canonical name of the defining module.
    pub module: String,
    #[serde(skip)]
    pub span: Span,
}

impl FunctionRecord {
    pub fn has(&self, prop: FnProp) -> bool {
        self.props.contains(&prop)
    }
}

// ── Global scope ──

#[derive(Debug, Default)]
pub struct GlobalScope {
    types: HashMap<String, Type>,
    functions: HashMap<String, FunctionRecord>,
    constants: HashMap<String, Var>,
}

impl GlobalScope {
    pub fn lookup_type(&self, name: &str) -> Option<Type> {
        Type::from_name(name).or_else(|| self.types.get(name).cloned())
    }

    pub fn define_type(&mut self, name: &str, ty: Type) -> Result<(), ()> {
        if Type::from_name(name).is_some() || self.types.contains_key(name) {
            return Err(());
        }
        self.types.insert(name.to_string(), ty);
        Ok(())
    }

    pub fn lookup_function(&self, name: &str) -> Option<&FunctionRecord> {
        self.functions.get(name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut FunctionRecord> {
        self.functions.get_mut(name)
    }

    /// Register a function. Returns the existing record on a name clash.
    pub fn define_function(&mut self, record: FunctionRecord) -> Result<(), &FunctionRecord> {
        if self.functions.contains_key(&record.name) {
            return Err(&self.functions[&record.name]);
        }
        self.functions.insert(record.name.clone(), record);
        Ok(())
    }

    pub fn lookup_constant(&self, name: &str) -> Option<&Var> {
        self.constants.get(name)
    }

    pub fn define_constant(&mut self, var: Var) -> Result<(), ()> {
        if self.constants.contains_key(&var.name) {
            return Err(());
        }
        self.constants.insert(var.name.clone(), var);
        Ok(())
    }

    /// All function names, sorted.
    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

// ── Local scope ──

#[derive(Debug, Default)]
struct Frame {
    vars: Vec<Var>,
}

/// Frames of one function body.
#[derive(Debug, Default)]
pub struct LocalScope {
    frames: Vec<Frame>,
}

impl LocalScope {
    pub fn new() -> Self {
        LocalScope {
            frames: vec![Frame::default()],
        }
    }

    pub fn push(&mut self) {
        self.frames.push(Frame::default());
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn lookup(&self, name: &str) -> Option<&Var> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.vars.iter().find(|v| v.name == name))
    }

    /// Declare in the innermost frame. Fails if any live frame already has it.
    pub fn declare(&mut self, var: Var) -> Result<(), Var> {
        if let Some(existing) = self.lookup(&var.name) {
            return Err(existing.clone());
        }
        match self.frames.last_mut() {
            Some(frame) => frame.vars.push(var),
            None => self.frames.push(Frame { vars: vec![var] }),
        }
        Ok(())
    }

    /// Every visible variable, outermost first.
    pub fn visible(&self) -> impl Iterator<Item = &Var> {
        self.frames.iter().flat_map(|f| f.vars.iter())
    }
}
