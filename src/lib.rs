//! og compiler core
//!
//! Semantic analysis and code generation for the og language: the type
//! checker, the flow graph checker, the frame size calculator and the
//! postfix writer, driven over an arena syntax tree produced by the front
//! end.

pub mod backend;
pub mod driver;
pub mod frontend;
pub mod middle;
pub mod types;
pub mod utils;

pub use driver::{check, compile, CodegenConfig, Compilation};
pub use utils::{Error, Result};
