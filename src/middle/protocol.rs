//! Tuple-address protocol shared by the frame calculator and the writer
//!
//! A consumer asks each operand for either its flattened value or the
//! address of its storage (`EvalMode`). Whether a node needs an unshared
//! frame slot to honour that request depends only on its kind, its type
//! and the mode, and both passes ask this module rather than deciding on
//! their own. The writer additionally reports what it produced
//! (`Produced`) so a mismatch surfaces as an internal error.

use crate::frontend::ast::{Ast, NodeId, NodeKind, TypeTable};
use crate::types::WORD_SIZE;
use crate::utils::Result;

/// What a consumer wants from an operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// the value, tuples flattened onto the stack
    Value,
    /// the address of the value's storage
    Address,
}

/// What an operand actually left on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Produced {
    Value,
    Address,
}

/// Mode in which `parent`, itself evaluated in `mode`, evaluates `child`
pub fn child_mode(parent: &NodeKind, child: NodeId, mode: EvalMode) -> EvalMode {
    match parent {
        NodeKind::TupleIndex { .. } | NodeKind::Rvalue { .. } | NodeKind::AddressOf { .. } => {
            EvalMode::Address
        }
        NodeKind::Assignment { lvalue, .. } if *lvalue == child => EvalMode::Address,
        NodeKind::Tuple { elements } if elements.len() == 1 => mode,
        _ => EvalMode::Value,
    }
}

/// Bytes of unshared frame storage `id` needs when evaluated in `mode`.
///
/// - a tuple literal whose address is wanted is built in its own slot
/// - a tuple-typed rvalue whose value is wanted pins the source address
///   in a word-sized slot while its components are loaded
pub fn temp_charge(ast: &Ast, types: &TypeTable, id: NodeId, mode: EvalMode) -> Result<Option<u32>> {
    let charge = match (ast.kind(id), mode) {
        (NodeKind::Tuple { elements }, EvalMode::Address) if elements.len() > 1 => {
            let ty = types.expect(id)?;
            ty.is_struct().then(|| ty.size())
        }
        (NodeKind::Rvalue { .. }, EvalMode::Value) => types.expect(id)?.is_struct().then_some(WORD_SIZE),
        _ => None,
    };
    Ok(charge)
}

/// Slot a `for` loop needs to keep the tested component of a tuple
/// condition while the rest of the tuple is discarded
pub fn loop_condition_charge(types: &TypeTable, condition: Option<NodeId>) -> Result<Option<u32>> {
    match condition {
        Some(condition) => Ok(types.expect(condition)?.is_struct().then_some(WORD_SIZE)),
        None => Ok(None),
    }
}
