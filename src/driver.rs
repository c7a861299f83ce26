//! Compilation pipeline
//!
//! `check` runs the analysis passes; `compile` continues through frame
//! layout and postfix generation. The first error from any pass ends the
//! run and nothing is produced.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::backend::{PostfixBuffer, PostfixWriter};
use crate::frontend::ast::{Ast, TypeTable};
use crate::frontend::semantic;
use crate::frontend::symbol::SymbolTable;
use crate::middle::FrameLayout;
use crate::utils::Result;

/// Code generation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenConfig {
    /// Source-level name of the program entry function
    pub entry_point: String,
    /// Linker-visible symbol the entry function is emitted as
    pub entry_symbol: String,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        Self {
            entry_point: "og".to_string(),
            entry_symbol: "_main".to_string(),
        }
    }
}

/// Output of a successful compilation
#[derive(Debug, Clone, Default)]
pub struct Compilation {
    pub listing: PostfixBuffer,
    pub frames: Vec<FrameLayout>,
}

/// Type and flow check a unit
pub fn check(ast: &Ast) -> Result<(TypeTable, SymbolTable)> {
    ast.validate()?;
    semantic::check(ast)
}

/// Check a unit and generate its postfix code
pub fn compile(ast: &Ast, config: &CodegenConfig) -> Result<Compilation> {
    let (types, symbols) = check(ast)?;
    let mut listing = PostfixBuffer::new();
    let frames = PostfixWriter::new(ast, &types, symbols, config, &mut listing).write_program()?;
    debug!(
        "compiled {} nodes into {} instructions",
        ast.len(),
        listing.instructions().len()
    );
    Ok(Compilation { listing, frames })
}
