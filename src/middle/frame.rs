//! Frame Size Calculator
//!
//! Walks a typed function body without emitting anything and works out
//! how much stack the function needs below its frame pointer:
//!
//! ```text
//!   fp ->  +------------------------+
//!          | locals                 |  local_size
//!          +------------------------+
//!          | call temporary         |  call_temp_size
//!          +------------------------+
//!          | return temporary       |  return_temp_size
//!          +------------------------+
//!          | unshared temporaries   |  one per charged node
//!          +------------------------+
//! ```

use log::debug;
use serde::Serialize;

use crate::frontend::ast::{Ast, NodeId, NodeKind, TypeTable};
use crate::middle::protocol::{self, EvalMode};
use crate::types::WORD_SIZE;
use crate::utils::{Error, Result};

/// Storage reserved for one node's transient value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnsharedTemp {
    pub node: NodeId,
    pub size: u32,
    /// Offset from the frame pointer (negative)
    pub offset: i32,
}

/// Stack layout of one function
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameLayout {
    pub function: String,
    pub local_size: u32,
    pub call_temp_size: u32,
    pub return_temp_size: u32,
    pub unshared: Vec<UnsharedTemp>,
}

impl FrameLayout {
    pub fn temp_size(&self) -> u32 {
        self.call_temp_size + self.return_temp_size + self.unshared.iter().map(|t| t.size).sum::<u32>()
    }

    /// Bytes requested by the function prologue
    pub fn frame_size(&self) -> u32 {
        self.local_size + self.temp_size()
    }

    /// Where a callee returning a tuple writes its result
    pub fn call_temp_offset(&self) -> i32 {
        -((self.local_size + self.call_temp_size) as i32)
    }

    /// Where this function keeps its hidden result pointer
    pub fn return_temp_offset(&self) -> i32 {
        -((self.local_size + self.call_temp_size + self.return_temp_size) as i32)
    }

    pub fn temp_offset(&self, node: NodeId) -> Option<i32> {
        self.unshared.iter().find(|t| t.node == node).map(|t| t.offset)
    }

    fn assign_offsets(&mut self, charges: Vec<(NodeId, u32)>) {
        let mut cursor = self.return_temp_offset();
        self.unshared = charges
            .into_iter()
            .map(|(node, size)| {
                cursor -= size as i32;
                UnsharedTemp { node, size, offset: cursor }
            })
            .collect();
    }
}

pub struct FrameCalculator<'a> {
    ast: &'a Ast,
    types: &'a TypeTable,
    local_size: u32,
    call_temp_size: u32,
    charges: Vec<(NodeId, u32)>,
}

impl<'a> FrameCalculator<'a> {
    pub fn new(ast: &'a Ast, types: &'a TypeTable) -> Self {
        Self {
            ast,
            types,
            local_size: 0,
            call_temp_size: 0,
            charges: Vec::new(),
        }
    }

    /// Layout of the function defined at `function`
    pub fn calculate(mut self, function: NodeId) -> Result<FrameLayout> {
        let (name, body) = match self.ast.kind(function) {
            NodeKind::FunctionDefinition { name, body, .. } => (name.clone(), *body),
            other => return Err(Error::internal(format!("frame of {:?}", other))),
        };
        let return_type = self.types.expect(function)?;

        self.statement(body)?;

        let mut layout = FrameLayout {
            function: name,
            local_size: self.local_size,
            call_temp_size: self.call_temp_size,
            return_temp_size: if return_type.is_struct() { WORD_SIZE } else { 0 },
            unshared: Vec::new(),
        };
        layout.assign_offsets(self.charges);
        debug!(
            "frame '{}': locals {} + temps {} = {}",
            layout.function,
            layout.local_size,
            layout.temp_size(),
            layout.frame_size()
        );
        Ok(layout)
    }

    fn charge(&mut self, node: NodeId, size: u32) {
        self.charges.push((node, size));
    }

    fn declaration(&mut self, id: NodeId) -> Result<()> {
        self.local_size += self.types.expect(id)?.size();
        if let NodeKind::VariableDeclaration { initializer: Some(init), .. } = self.ast.kind(id) {
            self.expr(*init, EvalMode::Value)?;
        }
        Ok(())
    }

    fn statement(&mut self, id: NodeId) -> Result<()> {
        match self.ast.kind(id) {
            NodeKind::Block { declarations, instructions } => {
                for &declaration in declarations {
                    self.declaration(declaration)?;
                }
                for &instruction in instructions {
                    self.statement(instruction)?;
                }
            }
            NodeKind::Evaluation { expression } => self.expr(*expression, EvalMode::Value)?,
            NodeKind::Write { arguments, .. } => {
                for &argument in arguments {
                    self.expr(argument, EvalMode::Value)?;
                }
            }
            NodeKind::If { condition, then_block } => {
                self.expr(*condition, EvalMode::Value)?;
                self.statement(*then_block)?;
            }
            NodeKind::IfElse { condition, then_block, else_block } => {
                self.expr(*condition, EvalMode::Value)?;
                self.statement(*then_block)?;
                self.statement(*else_block)?;
            }
            NodeKind::For { initializers, condition, increments, body } => {
                for &initializer in initializers {
                    if matches!(self.ast.kind(initializer), NodeKind::VariableDeclaration { .. }) {
                        self.declaration(initializer)?;
                    } else {
                        self.expr(initializer, EvalMode::Value)?;
                    }
                }
                if let Some(condition) = condition {
                    self.expr(*condition, EvalMode::Value)?;
                }
                if let Some(size) = protocol::loop_condition_charge(self.types, *condition)? {
                    self.charge(id, size);
                }
                for &increment in increments {
                    self.expr(increment, EvalMode::Value)?;
                }
                self.statement(*body)?;
            }
            NodeKind::Return { value: Some(value) } => self.expr(*value, EvalMode::Value)?,
            NodeKind::Return { value: None } | NodeKind::Break | NodeKind::Continue => {}
            other => return Err(Error::internal(format!("frame walk reached {:?}", other))),
        }
        Ok(())
    }

    fn expr(&mut self, id: NodeId, mode: EvalMode) -> Result<()> {
        if let Some(size) = protocol::temp_charge(self.ast, self.types, id, mode)? {
            self.charge(id, size);
        }

        let kind = self.ast.kind(id);
        match kind {
            // the operand is never evaluated
            NodeKind::Sizeof { .. } => return Ok(()),
            NodeKind::FunctionCall { .. } => {
                let ty = self.types.expect(id)?;
                if ty.is_struct() {
                    self.call_temp_size = self.call_temp_size.max(ty.size());
                }
            }
            _ => {}
        }

        for child in kind.children() {
            self.expr(child, protocol::child_mode(kind, child, mode))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{AstBuilder, Qualifier};
    use crate::frontend::semantic;
    use crate::types::Type;
    use pretty_assertions::assert_eq;

    fn layout_of(b: AstBuilder, root: NodeId, function: NodeId) -> FrameLayout {
        let ast = b.finish(root).unwrap();
        let (types, _) = semantic::check(&ast).unwrap();
        FrameCalculator::new(&ast, &types).calculate(function).unwrap()
    }

    #[test]
    fn test_locals_and_struct_return() {
        let mut b = AstBuilder::new();
        let one = b.int(1);
        let two = b.double(2.0);
        let pair = b.tuple(vec![one, two]);
        let t = b.declare(Qualifier::Private, Type::Unspec, &["t"], Some(pair));
        let i = b.declare(Qualifier::Private, Type::Int, &["i"], None);
        let read = b.read("t");
        let ret = b.ret(Some(read));
        let body = b.block(vec![t, i], vec![ret]);
        let f = b.function(Qualifier::Private, Type::Unspec, "f", vec![], body);
        let root = b.program(vec![f]);

        let layout = layout_of(b, root, f);
        assert_eq!(layout.local_size, 16);
        assert_eq!(layout.return_temp_size, 4);
        assert_eq!(layout.return_temp_offset(), -20);
        // `return t` loads t through a pinned address
        assert_eq!(layout.unshared, vec![UnsharedTemp { node: read, size: 4, offset: -24 }]);
        assert_eq!(layout.frame_size(), 24);
    }

    #[test]
    fn test_call_temp_is_a_high_water_mark() {
        let mut b = AstBuilder::new();
        let zero = b.int(0);
        let five = b.int(5);
        let pair = b.tuple(vec![zero, five]);
        let ret = b.ret(Some(pair));
        let body = b.block(vec![], vec![ret]);
        let small = b.function(Qualifier::Private, Type::Unspec, "small", vec![], body);

        let (x, y, z) = (b.int(1), b.int(2), b.int(3));
        let triple = b.tuple(vec![x, y, z]);
        let ret = b.ret(Some(triple));
        let body = b.block(vec![], vec![ret]);
        let big = b.function(Qualifier::Private, Type::Unspec, "big", vec![], body);

        let c1 = b.call("small", vec![]);
        let e1 = b.eval(c1);
        let c2 = b.call("big", vec![]);
        let e2 = b.eval(c2);
        let zero = b.int(0);
        let ret = b.ret(Some(zero));
        let body = b.block(vec![], vec![e1, e2, ret]);
        let main = b.function(Qualifier::Public, Type::Int, "og", vec![], body);
        let root = b.program(vec![small, big, main]);

        let layout = layout_of(b, root, main);
        assert_eq!(layout.call_temp_size, 12);
        assert_eq!(layout.call_temp_offset(), -12);
        assert_eq!(layout.frame_size(), 12);
    }

    #[test]
    fn test_indexed_tuple_literal_and_sizeof() {
        let mut b = AstBuilder::new();
        let one = b.int(1);
        let two = b.double(2.0);
        let pair = b.tuple(vec![one, two]);
        let second = b.tuple_index(pair, 2);
        let value = b.rvalue(second);
        let x = b.declare(Qualifier::Private, Type::Double, &["x"], Some(value));
        let three = b.int(3);
        let four = b.int(4);
        let unused = b.tuple(vec![three, four]);
        let first = b.tuple_index(unused, 1);
        let size = b.size_of(first);
        let ret = b.ret(Some(size));
        let body = b.block(vec![x], vec![ret]);
        let main = b.function(Qualifier::Public, Type::Int, "og", vec![], body);
        let root = b.program(vec![main]);

        let layout = layout_of(b, root, main);
        assert_eq!(layout.unshared, vec![UnsharedTemp { node: pair, size: 12, offset: -20 }]);
        assert_eq!(layout.frame_size(), 8 + 12);
    }
}
