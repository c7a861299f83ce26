//! Frontend module - AST, symbols, semantic analysis

pub mod ast;
pub mod symbol;
pub mod semantic;
pub mod flow;
