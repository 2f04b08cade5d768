// AST node types for Weft .weft source files.
//
// One closed sum type per grammar category (top-level definition, statement,
// expression, redirect target). Every node carries a `SimpleSpan` for error
// reporting in the definition and lowering passes.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

/// Span covering `a` through `b`.
pub fn join(a: Span, b: Span) -> Span {
    (a.start..b.end).into()
}

// ── Root ──

/// A complete Weft module: a sequence of top-level definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub items: Vec<TopLevel>,
    pub span: Span,
}

/// A top-level definition with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct TopLevel {
    pub kind: TopLevelKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopLevelKind {
    Import(ImportDecl),
    Function(FunctionDecl),
    Builtin(BuiltinDecl),
    App(AppDecl),
    StructType(StructTypeDecl),
    NewType(NewTypeDecl),
    GlobalConst(Declaration),
}

// ── import 'a.b.c' | import "a/b/c" ──

#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub path: ModulePath,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModulePath {
    /// `import pkg.module;`
    Dotted(Vec<Ident>),
    /// `import "pkg/module";`
    Literal(String, Span),
}

// ── Annotations: '@' IDENT ('=' value)? ──

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub key: Ident,
    pub value: Option<String>,
    pub span: Span,
}

// ── Types in declarations ──

/// One `[]` / `[keytype]` suffix on a declared name or type.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDim {
    /// `None` means the default integer key.
    pub key: Option<Ident>,
    pub span: Span,
}

/// A formal argument: `type name[]*` or `type... name`.
#[derive(Debug, Clone, PartialEq)]
pub struct FormalArg {
    pub type_name: Ident,
    pub name: Ident,
    pub dims: Vec<ArrayDim>,
    pub varargs: bool,
    pub span: Span,
}

// ── Functions ──

/// `(outs) name (ins) { body }`, or the `main { body }` shorthand.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub annotations: Vec<Annotation>,
    pub name: Ident,
    pub type_params: Vec<Ident>,
    pub outputs: Vec<FormalArg>,
    pub inputs: Vec<FormalArg>,
    pub body: Block,
}

/// `(outs) name <T>? (ins) "pkg" "version" ("symbol")? (["template"])? ;`
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinDecl {
    pub annotations: Vec<Annotation>,
    pub name: Ident,
    pub type_params: Vec<Ident>,
    pub outputs: Vec<FormalArg>,
    pub inputs: Vec<FormalArg>,
    pub package: String,
    pub version: String,
    pub symbol: Option<String>,
    pub inline_template: Option<(String, Span)>,
}

/// `app (outs) name (ins) { "cmd" args redirects ; }`
#[derive(Debug, Clone, PartialEq)]
pub struct AppDecl {
    pub annotations: Vec<Annotation>,
    pub name: Ident,
    pub outputs: Vec<FormalArg>,
    pub inputs: Vec<FormalArg>,
    pub body: AppBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppBody {
    pub command: String,
    pub command_span: Span,
    pub args: Vec<AppArg>,
    pub redirects: Vec<Redirect>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppArg {
    /// A value expression placed on the command line.
    Expr(Expr),
    /// `@name`: filename of a file variable.
    Filename(Ident),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectKind {
    Stdin,
    Stdout,
    Stderr,
}

impl RedirectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RedirectKind::Stdin => "stdin",
            RedirectKind::Stdout => "stdout",
            RedirectKind::Stderr => "stderr",
        }
    }
}

/// `@stdout=expr`
#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub target: Expr,
    pub span: Span,
}

// ── Type definitions ──

/// `type name { fields }`
#[derive(Debug, Clone, PartialEq)]
pub struct StructTypeDecl {
    pub name: Ident,
    pub fields: Vec<StructFieldDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructFieldDecl {
    pub type_name: Ident,
    pub name: Ident,
    pub dims: Vec<ArrayDim>,
    pub span: Span,
}

/// `type name base[]*;` (new sub-type) or `typedef name base[]*;` (alias).
#[derive(Debug, Clone, PartialEq)]
pub struct NewTypeDecl {
    pub name: Ident,
    pub base: Ident,
    pub dims: Vec<ArrayDim>,
    pub alias_only: bool,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Block(Block),
    If(IfStmt),
    Switch(SwitchStmt),
    Foreach(ForeachStmt),
    For(ForStmt),
    Iterate(IterateStmt),
    Wait(WaitStmt),
    Chain(ChainStmt),
    Declaration(Declaration),
    Assign(Assignment),
    Expr(Expr),
    Update(UpdateStmt),
}

impl StmtKind {
    /// Syntactic kind name used in diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            StmtKind::Block(_) => "block",
            StmtKind::If(_) => "if statement",
            StmtKind::Switch(_) => "switch statement",
            StmtKind::Foreach(_) => "foreach loop",
            StmtKind::For(_) => "for loop",
            StmtKind::Iterate(_) => "iterate loop",
            StmtKind::Wait(_) => "wait statement",
            StmtKind::Chain(_) => "statement chain",
            StmtKind::Declaration(_) => "declaration",
            StmtKind::Assign(_) => "assignment",
            StmtKind::Expr(_) => "expression statement",
            StmtKind::Update(_) => "update statement",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub cond: Expr,
    pub then_block: Block,
    pub else_block: Option<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchStmt {
    pub scrutinee: Expr,
    pub cases: Vec<SwitchCase>,
    pub default: Option<Block>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub label: i64,
    pub body: Block,
    pub span: Span,
}

/// `@ann* foreach member(, counter)? in source { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct ForeachStmt {
    pub annotations: Vec<Annotation>,
    pub member: Ident,
    pub counter: Option<Ident>,
    pub source: ForeachSource,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForeachSource {
    /// `[start:end(:step)?]`
    Range {
        start: Expr,
        end: Expr,
        step: Option<Expr>,
    },
    Array(Expr),
}

/// `for (init; cond; update) { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct ForStmt {
    pub annotations: Vec<Annotation>,
    pub init: Vec<ForInit>,
    pub cond: Expr,
    pub updates: Vec<ForUpdate>,
    pub body: Block,
}

/// `int i = 0` declares a loop-local variable; `i = 0` reuses an outer one.
#[derive(Debug, Clone, PartialEq)]
pub struct ForInit {
    pub type_name: Option<Ident>,
    pub name: Ident,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForUpdate {
    pub name: Ident,
    pub value: Expr,
    pub span: Span,
}

/// `iterate var { body } until (cond);`
#[derive(Debug, Clone, PartialEq)]
pub struct IterateStmt {
    pub var: Ident,
    pub body: Block,
    pub until: Expr,
}

/// `wait deep? (exprs) { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct WaitStmt {
    pub exprs: Vec<Expr>,
    pub deep: bool,
    pub body: Block,
}

/// `s1 => s2 => last`, flattened into a list of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStmt {
    pub stages: Vec<Stmt>,
    pub last: Box<Stmt>,
}

/// `type name<mapping>? dims (= init)?, ...`
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub type_name: Ident,
    pub vars: Vec<VarDeclarator>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDeclarator {
    pub name: Ident,
    pub dims: Vec<ArrayDim>,
    pub mapping: Option<Expr>,
    pub init: Option<Expr>,
    pub span: Span,
}

/// `lv1, lv2 = e1, e2;` or `lv1, lv2 = f(...);`
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub targets: Vec<LValueExpr>,
    pub values: Vec<Expr>,
}

/// Assignment target: root name plus field/index path.
#[derive(Debug, Clone, PartialEq)]
pub struct LValueExpr {
    pub root: Ident,
    pub path: Vec<PathStep>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathStep {
    Field(Ident),
    Index(Expr),
}

/// `target <mode> := value;`
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub target: Ident,
    pub mode: Ident,
    pub value: Expr,
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    BoolLit(bool),
    Var(String),
    Call {
        name: Ident,
        args: Vec<Expr>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Field {
        base: Box<Expr>,
        field: Ident,
    },
    ArrayLit(Vec<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Integer literal value, looking through unary minus.
    pub fn int_literal(&self) -> Option<i64> {
        match &self.kind {
            ExprKind::IntLit(v) => Some(*v),
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => operand.int_literal().map(|v| -v),
            _ => None,
        }
    }

    pub fn float_literal(&self) -> Option<f64> {
        match &self.kind {
            ExprKind::FloatLit(v) => Some(*v),
            ExprKind::Unary {
                op: UnaryOp::Neg,
                operand,
            } => operand.float_literal().map(|v| -v),
            _ => None,
        }
    }

    pub fn string_literal(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::StringLit(s) => Some(s),
            _ => None,
        }
    }

    pub fn bool_literal(&self) -> Option<bool> {
        match &self.kind {
            ExprKind::BoolLit(b) => Some(*b),
            _ => None,
        }
    }

    /// Name of a bare variable reference.
    pub fn var_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Var(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::IntDiv => "%/",
            BinaryOp::Mod => "%%",
            BinaryOp::Pow => "**",
        }
    }
}

// ── Identifier ──

/// An identifier with its source text and span.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}
