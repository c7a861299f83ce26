//! Flow Graph Checker
//!
//! Runs once per function definition, after its body has been typed.
//! Rejects code following a `return`/`break`/`continue` in the same block,
//! `break`/`continue` outside loops, and non-void functions that can fall
//! off the end of their body.

use log::trace;

use crate::frontend::ast::{Ast, NodeId, NodeKind};
use crate::types::Type;
use crate::utils::{Error, Result};

pub struct FlowChecker<'a> {
    ast: &'a Ast,
    /// every path through the last statement returned
    returning: bool,
    /// every path through the last statement left the block
    jumping: bool,
    loop_depth: u32,
}

impl<'a> FlowChecker<'a> {
    pub fn new(ast: &'a Ast) -> Self {
        Self {
            ast,
            returning: false,
            jumping: false,
            loop_depth: 0,
        }
    }

    /// Check the definition `function`, whose final return type is `return_type`
    pub fn check_function(&mut self, function: NodeId, return_type: &Type) -> Result<()> {
        let (name, body) = match self.ast.kind(function) {
            NodeKind::FunctionDefinition { name, body, .. } => (name, *body),
            other => return Err(Error::internal(format!("flow check of {:?}", other))),
        };

        self.reset();
        self.loop_depth = 0;
        self.statement(body)?;

        trace!("flow: '{}' returning={}", name, self.returning);
        if *return_type != Type::Void && !self.returning {
            return Err(Error::flow_error(
                self.ast.span(function),
                format!("function '{}' does not always return a value", name),
            ));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.returning = false;
        self.jumping = false;
    }

    fn sequence(&mut self, statements: &[NodeId]) -> Result<()> {
        self.reset();
        for &statement in statements {
            if self.returning {
                return Err(Error::flow_error(
                    self.ast.span(statement),
                    "return must be the last instruction in a block",
                ));
            }
            if self.jumping {
                return Err(Error::flow_error(
                    self.ast.span(statement),
                    "break/continue must be the last instruction in a block",
                ));
            }
            self.statement(statement)?;
        }
        Ok(())
    }

    fn statement(&mut self, id: NodeId) -> Result<()> {
        match self.ast.kind(id) {
            NodeKind::Block { instructions, .. } => self.sequence(instructions)?,
            NodeKind::Return { .. } => {
                self.returning = true;
                self.jumping = true;
            }
            NodeKind::Break | NodeKind::Continue => {
                if self.loop_depth == 0 {
                    let keyword = if matches!(self.ast.kind(id), NodeKind::Break) { "break" } else { "continue" };
                    return Err(Error::flow_error(
                        self.ast.span(id),
                        format!("'{}' outside of a loop", keyword),
                    ));
                }
                self.jumping = true;
            }
            NodeKind::If { then_block, .. } => {
                self.statement(*then_block)?;
                self.reset();
            }
            NodeKind::IfElse { then_block, else_block, .. } => {
                self.statement(*then_block)?;
                let (returning, jumping) = (self.returning, self.jumping);
                self.reset();
                self.statement(*else_block)?;
                self.returning &= returning;
                self.jumping &= jumping;
            }
            NodeKind::For { body, .. } => {
                self.loop_depth += 1;
                self.reset();
                let result = self.statement(*body);
                self.loop_depth -= 1;
                result?;
                self.reset();
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{AstBuilder, BinaryOp, Qualifier};

    /// `int f(int c) { <body> }`, body built by `build`
    fn check(build: impl FnOnce(&mut AstBuilder) -> Vec<NodeId>) -> Result<()> {
        let mut b = AstBuilder::new();
        let arg = b.arg(Type::Int, "c");
        let instructions = build(&mut b);
        let body = b.block(vec![], instructions);
        let f = b.function(Qualifier::Private, Type::Int, "f", vec![arg], body);
        let root = b.program(vec![f]);
        let ast = b.finish(root)?;
        FlowChecker::new(&ast).check_function(f, &Type::Int)
    }

    fn ret(b: &mut AstBuilder, value: i32) -> NodeId {
        let v = b.int(value);
        b.ret(Some(v))
    }

    #[test]
    fn test_if_without_else_does_not_return() {
        let err = check(|b| {
            let c = b.read("c");
            let r = ret(b, 1);
            vec![b.if_then(c, r)]
        })
        .unwrap_err();
        assert!(err.to_string().contains("does not always return"));
    }

    #[test]
    fn test_if_else_returning_on_both_branches() {
        check(|b| {
            let c = b.read("c");
            let one = ret(b, 1);
            let two = ret(b, 2);
            vec![b.if_else(c, one, two)]
        })
        .unwrap();
    }

    #[test]
    fn test_statement_after_break_rejected() {
        let err = check(|b| {
            let brk = b.brk();
            let x = b.var("c");
            let one = b.int(1);
            let assign = b.assign(x, one);
            let eval = b.eval(assign);
            let body = b.block(vec![], vec![brk, eval]);
            let lp = b.for_loop(vec![], None, vec![], body);
            let r = ret(b, 0);
            vec![lp, r]
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "break/continue must be the last instruction in a block");
    }

    #[test]
    fn test_conditional_break_accepted() {
        check(|b| {
            let c = b.read("c");
            let brk = b.brk();
            let cond = b.if_then(c, brk);
            let body = b.block(vec![], vec![cond]);
            let lp = b.for_loop(vec![], None, vec![], body);
            let r = ret(b, 0);
            vec![lp, r]
        })
        .unwrap();
    }

    #[test]
    fn test_loop_never_guarantees_return() {
        let err = check(|b| {
            let r = ret(b, 1);
            let body = b.block(vec![], vec![r]);
            vec![b.for_loop(vec![], None, vec![], body)]
        })
        .unwrap_err();
        assert!(matches!(err, Error::Flow { .. }));
    }

    #[test]
    fn test_continue_outside_loop() {
        let err = check(|b| {
            let c = b.cont();
            let r = ret(b, 0);
            let inner = b.block(vec![], vec![c]);
            vec![inner, r]
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "'continue' outside of a loop");
    }

    #[test]
    fn test_code_after_return_rejected() {
        let err = check(|b| {
            let r = ret(b, 0);
            let l = b.read("c");
            let one = b.int(1);
            let sum = b.binary(BinaryOp::Add, l, one);
            let e = b.eval(sum);
            vec![r, e]
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "return must be the last instruction in a block");
    }
}
