// ir.rs — Backend instruction stream
//
// The lowering passes drive a `Backend` by emitting `Instr`s in program
// order. Start/end instructions form properly nested constructs; the
// `check_balanced` verifier enforces that. `IrBuffer` is the in-memory
// backend used by the CLI and tests; it renders indented text or JSON.
//
// Preconditions: none.
// Postconditions: `IrBuffer::render` emits one line per instruction.
// Failure modes: `check_balanced` reports the first mismatched construct.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::scope::Var;
use crate::semantics::{OpTemplate, WrapperSpec};
use crate::types::{FunctionType, StructType, Type};

// ── Operands ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Arg {
    Var(Var),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Arg {
    pub fn is_int_literal(&self) -> bool {
        matches!(self, Arg::Int(_))
    }
}

impl From<Var> for Arg {
    fn from(v: Var) -> Self {
        Arg::Var(v)
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Var(v) => write!(f, "{}", v.name),
            Arg::Int(i) => write!(f, "{}", i),
            Arg::Float(x) => write!(f, "{:?}", x),
            Arg::Str(s) => write!(f, "{:?}", s),
            Arg::Bool(b) => write!(f, "{}", b),
        }
    }
}

// ── Modes ────────────────────────────────────────────────────────────────

/// Whether a wait only blocks or also dispatches its body as a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitMode {
    WaitOnly,
    TaskDispatch,
}

/// Where a task or function body executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskMode {
    Local,
    LocalControl,
    Control,
    Worker,
    Sync,
}

impl TaskMode {
    pub const ALL: &'static [TaskMode] = &[
        TaskMode::Local,
        TaskMode::LocalControl,
        TaskMode::Control,
        TaskMode::Worker,
        TaskMode::Sync,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskMode::Local => "LOCAL",
            TaskMode::LocalControl => "LOCAL_CONTROL",
            TaskMode::Control => "CONTROL",
            TaskMode::Worker => "WORKER",
            TaskMode::Sync => "SYNC",
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, TaskMode::Local | TaskMode::LocalControl | TaskMode::Sync)
    }

    /// Comma-separated names accepted by `from_str`.
    pub fn valid_names() -> String {
        let mut names: Vec<&str> = TaskMode::ALL.iter().map(|m| m.name()).collect();
        names.push("LEAF");
        names.join(", ")
    }
}

impl FromStr for TaskMode {
    type Err = ();

    /// `LEAF` is accepted as a synonym for `WORKER`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        if upper == "LEAF" {
            return Ok(TaskMode::Worker);
        }
        TaskMode::ALL
            .iter()
            .copied()
            .find(|m| m.name() == upper)
            .ok_or(())
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TaskPropKey {
    Location,
    Priority,
    Parallelism,
}

pub type TaskProps = BTreeMap<TaskPropKey, Arg>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateMode {
    Min,
    Incr,
    Scale,
}

impl UpdateMode {
    pub fn from_name(s: &str) -> Option<UpdateMode> {
        match s {
            "min" => Some(UpdateMode::Min),
            "incr" => Some(UpdateMode::Incr),
            "scale" => Some(UpdateMode::Scale),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UpdateMode::Min => "min",
            UpdateMode::Incr => "incr",
            UpdateMode::Scale => "scale",
        }
    }
}

/// Operations the backend implements directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Opcode {
    PlusInt,
    MinusInt,
    MultInt,
    DivInt,
    ModInt,
    NegateInt,
    PowInt,
    PlusFloat,
    MinusFloat,
    MultFloat,
    DivFloat,
    NegateFloat,
    PowFloat,
    EqInt,
    NeqInt,
    LtInt,
    LteInt,
    GtInt,
    GteInt,
    EqFloat,
    NeqFloat,
    LtFloat,
    LteFloat,
    GtFloat,
    GteFloat,
    EqString,
    NeqString,
    Strcat,
    EqBool,
    NeqBool,
    And,
    Or,
    Not,
    IntToFloat,
    IntToString,
    FloatToString,
    ParseInt,
    ParseFloat,
    MaxInt,
    MinInt,
    MaxFloat,
    MinFloat,
    AbsInt,
    AbsFloat,
    Sqrt,
    CopyInt,
    CopyFloat,
    CopyString,
    CopyBool,
    CopyBlob,
    CopyVoid,
}

impl Opcode {
    pub const ALL: &'static [Opcode] = &[
        Opcode::PlusInt,
        Opcode::MinusInt,
        Opcode::MultInt,
        Opcode::DivInt,
        Opcode::ModInt,
        Opcode::NegateInt,
        Opcode::PowInt,
        Opcode::PlusFloat,
        Opcode::MinusFloat,
        Opcode::MultFloat,
        Opcode::DivFloat,
        Opcode::NegateFloat,
        Opcode::PowFloat,
        Opcode::EqInt,
        Opcode::NeqInt,
        Opcode::LtInt,
        Opcode::LteInt,
        Opcode::GtInt,
        Opcode::GteInt,
        Opcode::EqFloat,
        Opcode::NeqFloat,
        Opcode::LtFloat,
        Opcode::LteFloat,
        Opcode::GtFloat,
        Opcode::GteFloat,
        Opcode::EqString,
        Opcode::NeqString,
        Opcode::Strcat,
        Opcode::EqBool,
        Opcode::NeqBool,
        Opcode::And,
        Opcode::Or,
        Opcode::Not,
        Opcode::IntToFloat,
        Opcode::IntToString,
        Opcode::FloatToString,
        Opcode::ParseInt,
        Opcode::ParseFloat,
        Opcode::MaxInt,
        Opcode::MinInt,
        Opcode::MaxFloat,
        Opcode::MinFloat,
        Opcode::AbsInt,
        Opcode::AbsFloat,
        Opcode::Sqrt,
        Opcode::CopyInt,
        Opcode::CopyFloat,
        Opcode::CopyString,
        Opcode::CopyBool,
        Opcode::CopyBlob,
        Opcode::CopyVoid,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Opcode::PlusInt => "PLUS_INT",
            Opcode::MinusInt => "MINUS_INT",
            Opcode::MultInt => "MULT_INT",
            Opcode::DivInt => "DIV_INT",
            Opcode::ModInt => "MOD_INT",
            Opcode::NegateInt => "NEGATE_INT",
            Opcode::PowInt => "POW_INT",
            Opcode::PlusFloat => "PLUS_FLOAT",
            Opcode::MinusFloat => "MINUS_FLOAT",
            Opcode::MultFloat => "MULT_FLOAT",
            Opcode::DivFloat => "DIV_FLOAT",
            Opcode::NegateFloat => "NEGATE_FLOAT",
            Opcode::PowFloat => "POW_FLOAT",
            Opcode::EqInt => "EQ_INT",
            Opcode::NeqInt => "NEQ_INT",
            Opcode::LtInt => "LT_INT",
            Opcode::LteInt => "LTE_INT",
            Opcode::GtInt => "GT_INT",
            Opcode::GteInt => "GTE_INT",
            Opcode::EqFloat => "EQ_FLOAT",
            Opcode::NeqFloat => "NEQ_FLOAT",
            Opcode::LtFloat => "LT_FLOAT",
            Opcode::LteFloat => "LTE_FLOAT",
            Opcode::GtFloat => "GT_FLOAT",
            Opcode::GteFloat => "GTE_FLOAT",
            Opcode::EqString => "EQ_STRING",
            Opcode::NeqString => "NEQ_STRING",
            Opcode::Strcat => "STRCAT",
            Opcode::EqBool => "EQ_BOOL",
            Opcode::NeqBool => "NEQ_BOOL",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Not => "NOT",
            Opcode::IntToFloat => "INT_TO_FLOAT",
            Opcode::IntToString => "INT_TO_STRING",
            Opcode::FloatToString => "FLOAT_TO_STRING",
            Opcode::ParseInt => "PARSE_INT",
            Opcode::ParseFloat => "PARSE_FLOAT",
            Opcode::MaxInt => "MAX_INT",
            Opcode::MinInt => "MIN_INT",
            Opcode::MaxFloat => "MAX_FLOAT",
            Opcode::MinFloat => "MIN_FLOAT",
            Opcode::AbsInt => "ABS_INT",
            Opcode::AbsFloat => "ABS_FLOAT",
            Opcode::Sqrt => "SQRT",
            Opcode::CopyInt => "COPY_INT",
            Opcode::CopyFloat => "COPY_FLOAT",
            Opcode::CopyString => "COPY_STRING",
            Opcode::CopyBool => "COPY_BOOL",
            Opcode::CopyBlob => "COPY_BLOB",
            Opcode::CopyVoid => "COPY_VOID",
        }
    }

    /// Copy operation for a future of the given type.
    pub fn copy_for(ty: &Type) -> Option<Opcode> {
        use crate::types::PrimType;
        match ty.prim()? {
            PrimType::Int => Some(Opcode::CopyInt),
            PrimType::Float => Some(Opcode::CopyFloat),
            PrimType::String => Some(Opcode::CopyString),
            PrimType::Bool => Some(Opcode::CopyBool),
            PrimType::Blob => Some(Opcode::CopyBlob),
            PrimType::Void => Some(Opcode::CopyVoid),
            PrimType::File => None,
        }
    }
}

impl FromStr for Opcode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Opcode::ALL.iter().copied().find(|op| op.name() == s).ok_or(())
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ── Construct payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitSpec {
    pub name: String,
    pub wait_vars: Vec<Var>,
    /// Variables that may still be written inside the body.
    pub keep_open: Vec<Var>,
    pub mode: WaitMode,
    pub explicit: bool,
    pub deep: bool,
    pub task_mode: TaskMode,
    pub props: TaskProps,
}

impl WaitSpec {
    /// Explicit, shallow, wait-only construct with no task properties.
    pub fn wait_only(name: String, wait_vars: Vec<Var>, task_mode: TaskMode) -> WaitSpec {
        WaitSpec {
            name,
            wait_vars,
            keep_open: Vec::new(),
            mode: WaitMode::WaitOnly,
            explicit: true,
            deep: false,
            task_mode,
            props: TaskProps::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopHints {
    pub split_degree: u32,
    pub leaf_degree: u32,
    pub unroll: u32,
}

impl Default for LoopHints {
    fn default() -> Self {
        LoopHints {
            split_degree: 16,
            leaf_degree: 1,
            unroll: 1,
        }
    }
}

/// Reference/value combination of an array insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InsertKind {
    /// Value member into array.
    Insert,
    /// Reference member into array.
    DerefInsert,
    /// Value member into array reference.
    RefInsert,
    /// Reference member into array reference.
    RefDerefInsert,
}

impl InsertKind {
    pub fn select(array_is_ref: bool, member_is_ref: bool) -> InsertKind {
        match (array_is_ref, member_is_ref) {
            (false, false) => InsertKind::Insert,
            (false, true) => InsertKind::DerefInsert,
            (true, false) => InsertKind::RefInsert,
            (true, true) => InsertKind::RefDerefInsert,
        }
    }

    fn stem(self) -> &'static str {
        match self {
            InsertKind::Insert => "array_insert",
            InsertKind::DerefInsert => "array_deref_insert",
            InsertKind::RefInsert => "array_ref_insert",
            InsertKind::RefDerefInsert => "array_ref_deref_insert",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Redirects<T> {
    pub stdin: Option<T>,
    pub stdout: Option<T>,
    pub stderr: Option<T>,
}

impl<T> Default for Redirects<T> {
    fn default() -> Self {
        Redirects {
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }
}

// ── Instructions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "instr", rename_all = "snake_case")]
pub enum Instr {
    RequirePackage {
        package: String,
        version: String,
    },
    DefineStruct {
        ty: StructType,
    },
    AddGlobal {
        name: String,
        value: Arg,
    },
    DefineBuiltin {
        name: String,
        ty: FunctionType,
        package: String,
        symbol: String,
        version: String,
    },
    /// Wrapper task for a template-only builtin, defined before its first call.
    DefineWrapper {
        name: String,
        ty: FunctionType,
        template: OpTemplate,
        spec: WrapperSpec,
    },
    StartFunction {
        name: String,
        outputs: Vec<Var>,
        inputs: Vec<Var>,
        mode: TaskMode,
    },
    EndFunction,
    Declare {
        var: Var,
    },
    StartNestedBlock,
    EndNestedBlock,
    StartIf {
        cond: Arg,
        has_else: bool,
    },
    StartElse,
    EndIf,
    StartSwitch {
        value: Arg,
        labels: Vec<i64>,
        has_default: bool,
    },
    EndCase,
    EndSwitch,
    StartWait {
        spec: WaitSpec,
    },
    EndWait,
    StartRangeLoop {
        name: String,
        member: Var,
        counter: Option<Var>,
        start: Arg,
        end: Arg,
        step: Arg,
        hints: LoopHints,
    },
    EndRangeLoop,
    StartForeachLoop {
        name: String,
        array: Var,
        member: Var,
        counter: Option<Var>,
        hints: LoopHints,
        array_closed: bool,
    },
    EndForeachLoop,
    StartLoop {
        name: String,
        loop_vars: Vec<Var>,
        defined_here: Vec<bool>,
        init_vals: Vec<Var>,
        blocking: Vec<bool>,
    },
    LoopContinue {
        new_vals: Vec<Var>,
        blocking: Vec<bool>,
    },
    LoopBreak,
    EndLoop,
    /// Close a future with a value.
    Assign {
        dst: Var,
        src: Arg,
    },
    /// Read a closed future into a local value.
    Retrieve {
        dst: Var,
        src: Var,
    },
    MakeAlias {
        dst: Var,
        src: Var,
    },
    StructLookup {
        dst: Var,
        src: Var,
        field: String,
    },
    ArrayLookup {
        dst: Var,
        array: Var,
        index: Arg,
    },
    ArrayInsert {
        kind: InsertKind,
        array: Var,
        index: Arg,
        member: Var,
        /// Outermost enclosing array, for reference forms.
        outer: Option<Var>,
    },
    ArrayCreateNested {
        dst: Var,
        array: Var,
        index: Arg,
        outer: Option<Var>,
    },
    ArrayBuild {
        dst: Var,
        members: Vec<Var>,
    },
    AssignReference {
        dst: Var,
        src: Var,
    },
    Dereference {
        dst: Var,
        src: Var,
    },
    RetrieveRef {
        dst: Var,
        src: Var,
    },
    AsyncOp {
        op: Opcode,
        out: Var,
        args: Vec<Arg>,
    },
    CallFunction {
        name: String,
        outputs: Vec<Var>,
        inputs: Vec<Var>,
        mode: TaskMode,
        props: TaskProps,
    },
    InitUpdateable {
        var: Var,
        value: Arg,
    },
    Update {
        var: Var,
        mode: UpdateMode,
        value: Var,
    },
    GetFileName {
        dst: Var,
        file: Var,
        init_unmapped: bool,
    },
    InitLocalOutFile {
        local: Var,
        filename: Arg,
        future: Var,
    },
    DecrLocalFileRef {
        file: Var,
    },
    RunExternal {
        command: String,
        args: Vec<Arg>,
        in_files: Vec<Var>,
        out_files: Vec<Var>,
        redirects: Redirects<Arg>,
        has_side_effects: bool,
        deterministic: bool,
    },
}

/// Kinds of nested constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Construct {
    Function,
    Block,
    If,
    Switch,
    Wait,
    RangeLoop,
    ForeachLoop,
    Loop,
}

impl Instr {
    pub fn opens(&self) -> Option<Construct> {
        match self {
            Instr::StartFunction { .. } => Some(Construct::Function),
            Instr::StartNestedBlock => Some(Construct::Block),
            Instr::StartIf { .. } => Some(Construct::If),
            Instr::StartSwitch { .. } => Some(Construct::Switch),
            Instr::StartWait { .. } => Some(Construct::Wait),
            Instr::StartRangeLoop { .. } => Some(Construct::RangeLoop),
            Instr::StartForeachLoop { .. } => Some(Construct::ForeachLoop),
            Instr::StartLoop { .. } => Some(Construct::Loop),
            _ => None,
        }
    }

    pub fn closes(&self) -> Option<Construct> {
        match self {
            Instr::EndFunction => Some(Construct::Function),
            Instr::EndNestedBlock => Some(Construct::Block),
            Instr::EndIf => Some(Construct::If),
            Instr::EndSwitch => Some(Construct::Switch),
            Instr::EndWait => Some(Construct::Wait),
            Instr::EndRangeLoop => Some(Construct::RangeLoop),
            Instr::EndForeachLoop => Some(Construct::ForeachLoop),
            Instr::EndLoop => Some(Construct::Loop),
            _ => None,
        }
    }

    /// Separators that sit at their construct's own indentation level.
    fn is_separator(&self) -> bool {
        matches!(self, Instr::StartElse | Instr::EndCase)
    }
}

// ── Display ──────────────────────────────────────────────────────────────

fn names(vars: &[Var]) -> String {
    vars.iter()
        .map(|v| v.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn typed_names(vars: &[Var]) -> String {
    vars.iter()
        .map(|v| format!("{} {}", v.ty, v.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn args(values: &[Arg]) -> String {
    values
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn flags(values: &[bool]) -> String {
    values
        .iter()
        .map(|b| if *b { "1" } else { "0" })
        .collect()
}

fn alloc_name(var: &Var) -> &'static str {
    use crate::scope::Alloc;
    match var.alloc {
        Alloc::Stack => "stack",
        Alloc::Alias => "alias",
        Alloc::GlobalConst => "global",
        Alloc::Temp => "temp",
        Alloc::Local => "local",
    }
}

fn index_form(index: &Arg) -> &'static str {
    if index.is_int_literal() {
        "imm"
    } else {
        "future"
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::RequirePackage { package, version } => {
                write!(f, "require {} {}", package, version)
            }
            Instr::DefineStruct { ty } => {
                write!(f, "struct {} {{", ty.name)?;
                for (i, field) in ty.fields.iter().enumerate() {
                    let sep = if i == 0 { " " } else { "; " };
                    write!(f, "{}{} {}", sep, field.ty, field.name)?;
                }
                write!(f, " }}")
            }
            Instr::AddGlobal { name, value } => write!(f, "global {} = {}", name, value),
            Instr::DefineBuiltin {
                name,
                package,
                symbol,
                version,
                ..
            } => write!(f, "builtin {} = {}::{} {}", name, package, symbol, version),
            Instr::DefineWrapper {
                name,
                ty,
                template,
                spec,
            } => {
                write!(
                    f,
                    "wrapper {} {} {}",
                    name,
                    Type::Function(ty.clone()),
                    spec.task_mode
                )?;
                if spec.parallel {
                    write!(f, " parallel")?;
                }
                if spec.targetable {
                    write!(f, " targetable")?;
                }
                write!(f, " = {}", template)
            }
            Instr::StartFunction {
                name,
                outputs,
                inputs,
                mode,
            } => write!(
                f,
                "function {} ({}) <- ({}) {}",
                name,
                typed_names(outputs),
                typed_names(inputs),
                mode
            ),
            Instr::EndFunction => write!(f, "end function"),
            Instr::Declare { var } => {
                write!(f, "declare {} {} {}", alloc_name(var), var.ty, var.name)?;
                if let Some(m) = &var.mapping {
                    write!(f, " <{}>", m)?;
                }
                Ok(())
            }
            Instr::StartNestedBlock => write!(f, "block"),
            Instr::EndNestedBlock => write!(f, "end block"),
            Instr::StartIf { cond, .. } => write!(f, "if {}", cond),
            Instr::StartElse => write!(f, "else"),
            Instr::EndIf => write!(f, "end if"),
            Instr::StartSwitch {
                value,
                labels,
                has_default,
            } => {
                let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
                write!(f, "switch {} [{}]", value, labels.join(", "))?;
                if *has_default {
                    write!(f, " default")?;
                }
                Ok(())
            }
            Instr::EndCase => write!(f, "end case"),
            Instr::EndSwitch => write!(f, "end switch"),
            Instr::StartWait { spec } => {
                write!(f, "wait {} ({})", spec.name, names(&spec.wait_vars))?;
                match spec.mode {
                    WaitMode::WaitOnly => write!(f, " wait-only")?,
                    WaitMode::TaskDispatch => write!(f, " dispatch")?,
                }
                write!(f, " {}", spec.task_mode)?;
                if spec.deep {
                    write!(f, " deep")?;
                }
                if !spec.keep_open.is_empty() {
                    write!(f, " keep-open ({})", names(&spec.keep_open))?;
                }
                for (k, v) in &spec.props {
                    write!(f, " {:?}={}", k, v)?;
                }
                Ok(())
            }
            Instr::EndWait => write!(f, "end wait"),
            Instr::StartRangeLoop {
                name,
                member,
                counter,
                start,
                end,
                step,
                hints,
            } => {
                write!(f, "range {} {}", name, member.name)?;
                if let Some(c) = counter {
                    write!(f, ", {}", c.name)?;
                }
                write!(
                    f,
                    " = {}..{} step {} split={} leaf={}",
                    start, end, step, hints.split_degree, hints.leaf_degree
                )?;
                if hints.unroll > 1 {
                    write!(f, " unroll={}", hints.unroll)?;
                }
                Ok(())
            }
            Instr::EndRangeLoop => write!(f, "end range"),
            Instr::StartForeachLoop {
                name,
                array,
                member,
                counter,
                hints,
                ..
            } => {
                write!(f, "foreach {} {}", name, member.name)?;
                if let Some(c) = counter {
                    write!(f, ", {}", c.name)?;
                }
                write!(
                    f,
                    " in {} split={} leaf={}",
                    array.name, hints.split_degree, hints.leaf_degree
                )
            }
            Instr::EndForeachLoop => write!(f, "end foreach"),
            Instr::StartLoop {
                name,
                loop_vars,
                defined_here,
                init_vals,
                blocking,
            } => write!(
                f,
                "loop {} ({}) = ({}) defined={} blocking={}",
                name,
                names(loop_vars),
                names(init_vals),
                flags(defined_here),
                flags(blocking)
            ),
            Instr::LoopContinue { new_vals, .. } => write!(f, "continue ({})", names(new_vals)),
            Instr::LoopBreak => write!(f, "break"),
            Instr::EndLoop => write!(f, "end loop"),
            Instr::Assign { dst, src } => write!(f, "{} := {}", dst.name, src),
            Instr::Retrieve { dst, src } => write!(f, "{} <- {}", dst.name, src.name),
            Instr::MakeAlias { dst, src } => write!(f, "{} alias {}", dst.name, src.name),
            Instr::StructLookup { dst, src, field } => {
                write!(f, "{} alias {}.{}", dst.name, src.name, field)
            }
            Instr::ArrayLookup { dst, array, index } => {
                write!(f, "{} lookup {}[{}]", dst.name, array.name, index)
            }
            Instr::ArrayInsert {
                kind,
                array,
                index,
                member,
                outer,
            } => {
                write!(
                    f,
                    "{}_{} {}[{}] <- {}",
                    kind.stem(),
                    index_form(index),
                    array.name,
                    index,
                    member.name
                )?;
                if let Some(o) = outer {
                    write!(f, " outer {}", o.name)?;
                }
                Ok(())
            }
            Instr::ArrayCreateNested {
                dst,
                array,
                index,
                outer,
            } => {
                let stem = if array.ty.is_ref() {
                    "array_ref_create_nested"
                } else {
                    "array_create_nested"
                };
                write!(
                    f,
                    "{} := {}_{} {}[{}]",
                    dst.name,
                    stem,
                    index_form(index),
                    array.name,
                    index
                )?;
                if let Some(o) = outer {
                    write!(f, " outer {}", o.name)?;
                }
                Ok(())
            }
            Instr::ArrayBuild { dst, members } => {
                write!(f, "{} := [{}]", dst.name, names(members))
            }
            Instr::AssignReference { dst, src } => write!(f, "{} := &{}", dst.name, src.name),
            Instr::Dereference { dst, src } => write!(f, "{} := *{}", dst.name, src.name),
            Instr::RetrieveRef { dst, src } => write!(f, "{} <- *{}", dst.name, src.name),
            Instr::AsyncOp { op, out, args: a } => {
                write!(f, "{} := {}({})", out.name, op, args(a))
            }
            Instr::CallFunction {
                name,
                outputs,
                inputs,
                mode,
                ..
            } => write!(
                f,
                "call {} ({}) <- ({}) {}",
                name,
                names(outputs),
                names(inputs),
                mode
            ),
            Instr::InitUpdateable { var, value } => {
                write!(f, "init_updateable {} = {}", var.name, value)
            }
            Instr::Update { var, mode, value } => {
                write!(f, "update {} {} {}", var.name, mode.name(), value.name)
            }
            Instr::GetFileName {
                dst,
                file,
                init_unmapped,
            } => {
                write!(f, "{} := filename({})", dst.name, file.name)?;
                if *init_unmapped {
                    write!(f, " init-unmapped")?;
                }
                Ok(())
            }
            Instr::InitLocalOutFile {
                local,
                filename,
                future,
            } => write!(
                f,
                "init_local_out_file {} {} for {}",
                local.name, filename, future.name
            ),
            Instr::DecrLocalFileRef { file } => write!(f, "decr_local_file_ref {}", file.name),
            Instr::RunExternal {
                command,
                args: a,
                in_files,
                out_files,
                redirects,
                has_side_effects,
                deterministic,
            } => {
                write!(
                    f,
                    "run {:?} [{}] in ({}) out ({})",
                    command,
                    args(a),
                    names(in_files),
                    names(out_files)
                )?;
                for (label, r) in [
                    ("stdin", &redirects.stdin),
                    ("stdout", &redirects.stdout),
                    ("stderr", &redirects.stderr),
                ] {
                    if let Some(r) = r {
                        write!(f, " {}={}", label, r)?;
                    }
                }
                if !*has_side_effects {
                    write!(f, " pure")?;
                }
                if *deterministic {
                    write!(f, " deterministic")?;
                }
                Ok(())
            }
        }
    }
}

// ── Backend ──────────────────────────────────────────────────────────────

/// Consumer of the lowered instruction stream.
pub trait Backend {
    fn emit(&mut self, instr: Instr);
}

/// In-memory backend collecting every instruction.
#[derive(Debug, Default, Serialize)]
pub struct IrBuffer {
    pub instrs: Vec<Instr>,
}

impl Backend for IrBuffer {
    fn emit(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }
}

impl IrBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indented text, one instruction per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut depth = 0usize;
        for instr in &self.instrs {
            if instr.closes().is_some() {
                depth = depth.saturating_sub(1);
            }
            let indent = if instr.is_separator() {
                depth.saturating_sub(1)
            } else {
                depth
            };
            out.push_str(&"  ".repeat(indent));
            out.push_str(&instr.to_string());
            out.push('\n');
            if instr.opens().is_some() {
                depth += 1;
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// ── Balance check ────────────────────────────────────────────────────────

/// Verify that every start has a matching end in LIFO order, that `else`
/// and `end case` appear only directly inside their construct, and that
/// loop control appears only inside a loop.
pub fn check_balanced(instrs: &[Instr]) -> Result<(), String> {
    let mut stack: Vec<(Construct, bool)> = Vec::new();
    for (i, instr) in instrs.iter().enumerate() {
        if let Some(c) = instr.opens() {
            stack.push((c, false));
            continue;
        }
        if let Some(c) = instr.closes() {
            match stack.pop() {
                Some((open, _)) if open == c => continue,
                Some((open, _)) => {
                    return Err(format!(
                        "instruction {}: `{}` closes {:?} but {:?} is open",
                        i, instr, c, open
                    ))
                }
                None => return Err(format!("instruction {}: `{}` with nothing open", i, instr)),
            }
        }
        match instr {
            Instr::StartElse => match stack.last_mut() {
                Some((Construct::If, seen_else)) if !*seen_else => *seen_else = true,
                _ => return Err(format!("instruction {}: misplaced else", i)),
            },
            Instr::EndCase => {
                if !matches!(stack.last(), Some((Construct::Switch, _))) {
                    return Err(format!("instruction {}: end case outside switch", i));
                }
            }
            Instr::LoopContinue { .. } | Instr::LoopBreak => {
                let in_loop = stack
                    .iter()
                    .rev()
                    .take_while(|(c, _)| *c != Construct::Function)
                    .any(|(c, _)| *c == Construct::Loop);
                if !in_loop {
                    return Err(format!("instruction {}: `{}` outside loop", i, instr));
                }
            }
            _ => {}
        }
    }
    match stack.last() {
        None => Ok(()),
        Some((c, _)) => Err(format!("unclosed {:?} at end of stream", c)),
    }
}
