// wfc — Weft Frontend Compiler
//
// Library root. The frontend loads a program's modules in two passes and
// lowers every function and app body to the wait/task IR in `ir`.

pub mod app;
pub mod ast;
pub mod config;
pub mod deadlock;
pub mod define;
pub mod diag;
pub mod expr;
pub mod id;
pub mod ir;
pub mod lexer;
pub mod loader;
pub mod lvalue;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod scope;
pub mod semantics;
pub mod typecheck;
pub mod types;
pub mod usage;
pub mod walker;
