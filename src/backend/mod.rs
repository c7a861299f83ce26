//! Backend module - Postfix code generation

pub mod postfix;
pub mod writer;

pub use postfix::{Emitter, Instr, PostfixBuffer};
pub use writer::PostfixWriter;
