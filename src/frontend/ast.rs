//! Abstract Syntax Tree definitions for og
//!
//! The tree is stored as an arena: every node lives in `Ast::nodes` and
//! refers to its children by `NodeId`. Children are always allocated
//! before their parent, so a child's id is smaller than its parent's and
//! the ids double as stable keys for the side tables built by the passes
//! (types, frame temporaries).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Type;
use crate::utils::{Error, Result, Span};

/// Index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Declaration visibility/linkage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qualifier {
    /// exported
    Public,
    /// internal (no qualifier in the source)
    #[default]
    Private,
    /// `require`: declared here, defined elsewhere
    #[serde(rename = "require")]
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Ge,
    Gt,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

/// A node: its shape plus the line it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub line: u32,
    pub kind: NodeKind,
}

impl Node {
    pub fn span(&self) -> Span {
        Span::new(self.line)
    }
}

/// Every node kind the parser can produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeKind {
    // ==================== Declarations ====================
    Program {
        declarations: Vec<NodeId>,
    },
    /// `[qualifier] type id[, id...] [= initializer]`
    VariableDeclaration {
        #[serde(default)]
        qualifier: Qualifier,
        var_type: Type,
        identifiers: Vec<String>,
        #[serde(default)]
        initializer: Option<NodeId>,
    },
    FunctionDeclaration {
        #[serde(default)]
        qualifier: Qualifier,
        return_type: Type,
        name: String,
        #[serde(default)]
        arguments: Vec<NodeId>,
    },
    FunctionDefinition {
        #[serde(default)]
        qualifier: Qualifier,
        return_type: Type,
        name: String,
        #[serde(default)]
        arguments: Vec<NodeId>,
        body: NodeId,
    },

    // ==================== Statements ====================
    Block {
        #[serde(default)]
        declarations: Vec<NodeId>,
        #[serde(default)]
        instructions: Vec<NodeId>,
    },
    Evaluation {
        expression: NodeId,
    },
    /// `write` / `writeln`
    Write {
        arguments: Vec<NodeId>,
        #[serde(default)]
        newline: bool,
    },
    If {
        condition: NodeId,
        then_block: NodeId,
    },
    IfElse {
        condition: NodeId,
        then_block: NodeId,
        else_block: NodeId,
    },
    For {
        #[serde(default)]
        initializers: Vec<NodeId>,
        #[serde(default)]
        condition: Option<NodeId>,
        #[serde(default)]
        increments: Vec<NodeId>,
        body: NodeId,
    },
    Break,
    Continue,
    Return {
        #[serde(default)]
        value: Option<NodeId>,
    },

    // ==================== Expressions ====================
    Integer {
        value: i32,
    },
    Double {
        value: f64,
    },
    #[serde(rename = "string")]
    Str {
        value: String,
    },
    Nullptr,
    Variable {
        name: String,
    },
    PointerIndex {
        base: NodeId,
        index: NodeId,
    },
    /// `base@index`, 1-based
    TupleIndex {
        base: NodeId,
        index: i32,
    },
    Rvalue {
        lvalue: NodeId,
    },
    Assignment {
        lvalue: NodeId,
        rvalue: NodeId,
    },
    Unary {
        op: UnaryOp,
        argument: NodeId,
    },
    Binary {
        op: BinaryOp,
        left: NodeId,
        right: NodeId,
    },
    AddressOf {
        lvalue: NodeId,
    },
    /// `[count]`: stack allocation of `count` elements
    StackAlloc {
        count: NodeId,
    },
    /// `input`
    Input,
    Sizeof {
        expression: NodeId,
    },
    Tuple {
        elements: Vec<NodeId>,
    },
    FunctionCall {
        name: String,
        #[serde(default)]
        arguments: Vec<NodeId>,
    },
}

impl NodeKind {
    /// Direct children in evaluation order
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Self::Program { declarations } => declarations.clone(),
            Self::VariableDeclaration { initializer, .. } => initializer.iter().copied().collect(),
            Self::FunctionDeclaration { arguments, .. } => arguments.clone(),
            Self::FunctionDefinition { arguments, body, .. } => {
                arguments.iter().copied().chain(std::iter::once(*body)).collect()
            }
            Self::Block { declarations, instructions } => {
                declarations.iter().chain(instructions).copied().collect()
            }
            Self::Evaluation { expression } => vec![*expression],
            Self::Write { arguments, .. } => arguments.clone(),
            Self::If { condition, then_block } => vec![*condition, *then_block],
            Self::IfElse { condition, then_block, else_block } => {
                vec![*condition, *then_block, *else_block]
            }
            Self::For { initializers, condition, increments, body } => initializers
                .iter()
                .chain(condition.iter())
                .chain(increments)
                .chain(std::iter::once(body))
                .copied()
                .collect(),
            Self::Return { value } => value.iter().copied().collect(),
            Self::PointerIndex { base, index } => vec![*base, *index],
            Self::TupleIndex { base, .. } => vec![*base],
            Self::Rvalue { lvalue } | Self::AddressOf { lvalue } => vec![*lvalue],
            Self::Assignment { lvalue, rvalue } => vec![*lvalue, *rvalue],
            Self::Unary { argument, .. } => vec![*argument],
            Self::Binary { left, right, .. } => vec![*left, *right],
            Self::StackAlloc { count } => vec![*count],
            Self::Sizeof { expression } => vec![*expression],
            Self::Tuple { elements } => elements.clone(),
            Self::FunctionCall { arguments, .. } => arguments.clone(),
            Self::Break
            | Self::Continue
            | Self::Integer { .. }
            | Self::Double { .. }
            | Self::Str { .. }
            | Self::Nullptr
            | Self::Variable { .. }
            | Self::Input => Vec::new(),
        }
    }

    pub fn is_lvalue(&self) -> bool {
        matches!(self, Self::Variable { .. } | Self::PointerIndex { .. } | Self::TupleIndex { .. })
    }

    pub fn is_declaration(&self) -> bool {
        matches!(
            self,
            Self::VariableDeclaration { .. }
                | Self::FunctionDeclaration { .. }
                | Self::FunctionDefinition { .. }
        )
    }

    pub fn is_expression(&self) -> bool {
        matches!(
            self,
            Self::Integer { .. }
                | Self::Double { .. }
                | Self::Str { .. }
                | Self::Nullptr
                | Self::Variable { .. }
                | Self::PointerIndex { .. }
                | Self::TupleIndex { .. }
                | Self::Rvalue { .. }
                | Self::Assignment { .. }
                | Self::Unary { .. }
                | Self::Binary { .. }
                | Self::AddressOf { .. }
                | Self::StackAlloc { .. }
                | Self::Input
                | Self::Sizeof { .. }
                | Self::Tuple { .. }
                | Self::FunctionCall { .. }
        )
    }

    pub fn is_statement(&self) -> bool {
        matches!(
            self,
            Self::Block { .. }
                | Self::Evaluation { .. }
                | Self::Write { .. }
                | Self::If { .. }
                | Self::IfElse { .. }
                | Self::For { .. }
                | Self::Break
                | Self::Continue
                | Self::Return { .. }
        )
    }

    /// Compile-time literal, the only thing a global may be initialized with
    pub fn is_literal(&self, ast: &Ast) -> bool {
        match self {
            Self::Integer { .. } | Self::Double { .. } | Self::Str { .. } | Self::Nullptr => true,
            Self::Tuple { elements } => elements.iter().all(|e| ast.kind(*e).is_literal(ast)),
            _ => false,
        }
    }
}

/// A complete compilation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ast {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Ast {
    /// Build from raw parts, rejecting malformed trees
    pub fn new(nodes: Vec<Node>, root: NodeId) -> Result<Self> {
        let ast = Self { nodes, root };
        ast.validate()?;
        Ok(ast)
    }

    /// Parse the JSON form written by the front end
    pub fn from_json(text: &str) -> Result<Self> {
        let ast: Ast = serde_json::from_str(text).map_err(|e| Error::Ast(e.to_string()))?;
        ast.validate()?;
        Ok(ast)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Ast(e.to_string()))
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.node(id).kind
    }

    pub fn span(&self, id: NodeId) -> Span {
        self.node(id).span()
    }

    /// Top-level declarations of the program
    pub fn declarations(&self) -> &[NodeId] {
        match self.kind(self.root) {
            NodeKind::Program { declarations } => declarations,
            _ => &[],
        }
    }

    /// Structural checks every pass relies on
    pub fn validate(&self) -> Result<()> {
        if self.root.index() >= self.nodes.len() {
            return Err(Error::Ast(format!("root {} is not a node", self.root)));
        }
        if !matches!(self.kind(self.root), NodeKind::Program { .. }) {
            return Err(Error::Ast(format!("root {} is not a program", self.root)));
        }

        let mut parents = vec![0u32; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            for child in node.kind.children() {
                if child.index() >= index {
                    return Err(Error::Ast(format!(
                        "node #{} refers to {} which is not allocated before it",
                        index, child
                    )));
                }
                parents[child.index()] += 1;
                if parents[child.index()] > 1 {
                    return Err(Error::Ast(format!("node {} has more than one parent", child)));
                }
            }
            self.validate_positions(NodeId(index as u32), &node.kind)?;
        }
        Ok(())
    }

    fn validate_positions(&self, id: NodeId, kind: &NodeKind) -> Result<()> {
        let expect = |child: NodeId, ok: bool, what: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(Error::Ast(format!("{} expects {} at {}", id, what, child)))
            }
        };
        let is = |child: NodeId, f: fn(&NodeKind) -> bool| f(self.kind(child));
        // a bare lvalue denotes storage; reading it needs an explicit rvalue
        let value = |child: NodeId| {
            let k = self.kind(child);
            k.is_expression() && !k.is_lvalue()
        };

        match kind {
            NodeKind::Program { declarations } => {
                for d in declarations {
                    expect(*d, is(*d, NodeKind::is_declaration), "a declaration")?;
                }
            }
            NodeKind::FunctionDeclaration { arguments, .. } => {
                for a in arguments {
                    expect(*a, matches!(self.kind(*a), NodeKind::VariableDeclaration { .. }), "an argument")?;
                }
            }
            NodeKind::FunctionDefinition { arguments, body, .. } => {
                for a in arguments {
                    expect(*a, matches!(self.kind(*a), NodeKind::VariableDeclaration { .. }), "an argument")?;
                }
                expect(*body, matches!(self.kind(*body), NodeKind::Block { .. }), "a block")?;
            }
            NodeKind::VariableDeclaration { identifiers, initializer, .. } => {
                if identifiers.is_empty() {
                    return Err(Error::Ast(format!("{} declares no identifiers", id)));
                }
                if let Some(init) = initializer {
                    expect(*init, value(*init), "a value")?;
                }
            }
            NodeKind::Block { declarations, instructions } => {
                for d in declarations {
                    expect(*d, matches!(self.kind(*d), NodeKind::VariableDeclaration { .. }), "a variable declaration")?;
                }
                for i in instructions {
                    expect(*i, is(*i, NodeKind::is_statement), "a statement")?;
                }
            }
            NodeKind::If { condition, then_block } => {
                expect(*condition, value(*condition), "a value")?;
                expect(*then_block, is(*then_block, NodeKind::is_statement), "a statement")?;
            }
            NodeKind::IfElse { condition, then_block, else_block } => {
                expect(*condition, value(*condition), "a value")?;
                expect(*then_block, is(*then_block, NodeKind::is_statement), "a statement")?;
                expect(*else_block, is(*else_block, NodeKind::is_statement), "a statement")?;
            }
            NodeKind::For { initializers, condition, increments, body } => {
                for i in initializers {
                    let k = self.kind(*i);
                    expect(*i, value(*i) || matches!(k, NodeKind::VariableDeclaration { .. }), "an initializer")?;
                }
                if let Some(c) = condition {
                    expect(*c, value(*c), "a value")?;
                }
                for i in increments {
                    expect(*i, value(*i), "a value")?;
                }
                expect(*body, is(*body, NodeKind::is_statement), "a statement")?;
            }
            NodeKind::Rvalue { lvalue } | NodeKind::AddressOf { lvalue } => {
                expect(*lvalue, is(*lvalue, NodeKind::is_lvalue), "an lvalue")?;
            }
            NodeKind::Assignment { lvalue, rvalue } => {
                expect(*lvalue, is(*lvalue, NodeKind::is_lvalue), "an lvalue")?;
                expect(*rvalue, value(*rvalue), "a value")?;
            }
            // operands whose storage is used, never their value
            NodeKind::TupleIndex { base, .. } => {
                expect(*base, is(*base, NodeKind::is_expression), "an expression")?;
            }
            NodeKind::Sizeof { expression } => {
                expect(*expression, is(*expression, NodeKind::is_expression), "an expression")?;
            }
            _ => {
                let children = kind.children();
                if kind.is_expression() || matches!(kind, NodeKind::Evaluation { .. } | NodeKind::Write { .. } | NodeKind::Return { .. }) {
                    for c in children {
                        expect(c, value(c), "a value")?;
                    }
                }
            }
        }
        Ok(())
    }
}

// ==================== Builder ====================

/// Incremental arena construction, children first.
///
/// Used by front ends and by tests; `finish` validates the result.
#[derive(Debug, Default)]
pub struct AstBuilder {
    nodes: Vec<Node>,
    line: u32,
}

impl AstBuilder {
    pub fn new() -> Self {
        Self { nodes: Vec::new(), line: 1 }
    }

    /// Line number attached to nodes pushed from now on
    pub fn at(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    pub fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { line: self.line, kind });
        id
    }

    pub fn finish(self, root: NodeId) -> Result<Ast> {
        Ast::new(self.nodes, root)
    }

    pub fn program(&mut self, declarations: Vec<NodeId>) -> NodeId {
        self.push(NodeKind::Program { declarations })
    }

    // --- literals and names ---

    pub fn int(&mut self, value: i32) -> NodeId {
        self.push(NodeKind::Integer { value })
    }

    pub fn double(&mut self, value: f64) -> NodeId {
        self.push(NodeKind::Double { value })
    }

    pub fn string(&mut self, value: &str) -> NodeId {
        self.push(NodeKind::Str { value: value.to_string() })
    }

    pub fn nullptr(&mut self) -> NodeId {
        self.push(NodeKind::Nullptr)
    }

    pub fn var(&mut self, name: &str) -> NodeId {
        self.push(NodeKind::Variable { name: name.to_string() })
    }

    pub fn rvalue(&mut self, lvalue: NodeId) -> NodeId {
        self.push(NodeKind::Rvalue { lvalue })
    }

    /// Value of a named variable: `rvalue(var(name))`
    pub fn read(&mut self, name: &str) -> NodeId {
        let lvalue = self.var(name);
        self.rvalue(lvalue)
    }

    // --- expressions ---

    pub fn assign(&mut self, lvalue: NodeId, rvalue: NodeId) -> NodeId {
        self.push(NodeKind::Assignment { lvalue, rvalue })
    }

    pub fn unary(&mut self, op: UnaryOp, argument: NodeId) -> NodeId {
        self.push(NodeKind::Unary { op, argument })
    }

    pub fn binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        self.push(NodeKind::Binary { op, left, right })
    }

    pub fn tuple(&mut self, elements: Vec<NodeId>) -> NodeId {
        self.push(NodeKind::Tuple { elements })
    }

    pub fn tuple_index(&mut self, base: NodeId, index: i32) -> NodeId {
        self.push(NodeKind::TupleIndex { base, index })
    }

    pub fn pointer_index(&mut self, base: NodeId, index: NodeId) -> NodeId {
        self.push(NodeKind::PointerIndex { base, index })
    }

    pub fn address_of(&mut self, lvalue: NodeId) -> NodeId {
        self.push(NodeKind::AddressOf { lvalue })
    }

    pub fn stack_alloc(&mut self, count: NodeId) -> NodeId {
        self.push(NodeKind::StackAlloc { count })
    }

    pub fn input(&mut self) -> NodeId {
        self.push(NodeKind::Input)
    }

    pub fn size_of(&mut self, expression: NodeId) -> NodeId {
        self.push(NodeKind::Sizeof { expression })
    }

    pub fn call(&mut self, name: &str, arguments: Vec<NodeId>) -> NodeId {
        self.push(NodeKind::FunctionCall { name: name.to_string(), arguments })
    }

    // --- statements ---

    pub fn eval(&mut self, expression: NodeId) -> NodeId {
        self.push(NodeKind::Evaluation { expression })
    }

    pub fn write(&mut self, arguments: Vec<NodeId>, newline: bool) -> NodeId {
        self.push(NodeKind::Write { arguments, newline })
    }

    pub fn block(&mut self, declarations: Vec<NodeId>, instructions: Vec<NodeId>) -> NodeId {
        self.push(NodeKind::Block { declarations, instructions })
    }

    pub fn if_then(&mut self, condition: NodeId, then_block: NodeId) -> NodeId {
        self.push(NodeKind::If { condition, then_block })
    }

    pub fn if_else(&mut self, condition: NodeId, then_block: NodeId, else_block: NodeId) -> NodeId {
        self.push(NodeKind::IfElse { condition, then_block, else_block })
    }

    pub fn for_loop(
        &mut self,
        initializers: Vec<NodeId>,
        condition: Option<NodeId>,
        increments: Vec<NodeId>,
        body: NodeId,
    ) -> NodeId {
        self.push(NodeKind::For { initializers, condition, increments, body })
    }

    pub fn brk(&mut self) -> NodeId {
        self.push(NodeKind::Break)
    }

    pub fn cont(&mut self) -> NodeId {
        self.push(NodeKind::Continue)
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        self.push(NodeKind::Return { value })
    }

    // --- declarations ---

    pub fn declare(
        &mut self,
        qualifier: Qualifier,
        var_type: Type,
        identifiers: &[&str],
        initializer: Option<NodeId>,
    ) -> NodeId {
        self.push(NodeKind::VariableDeclaration {
            qualifier,
            var_type,
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            initializer,
        })
    }

    /// Function argument: `type name`
    pub fn arg(&mut self, var_type: Type, name: &str) -> NodeId {
        self.declare(Qualifier::Private, var_type, &[name], None)
    }

    pub fn function_decl(
        &mut self,
        qualifier: Qualifier,
        return_type: Type,
        name: &str,
        arguments: Vec<NodeId>,
    ) -> NodeId {
        self.push(NodeKind::FunctionDeclaration {
            qualifier,
            return_type,
            name: name.to_string(),
            arguments,
        })
    }

    pub fn function(
        &mut self,
        qualifier: Qualifier,
        return_type: Type,
        name: &str,
        arguments: Vec<NodeId>,
        body: NodeId,
    ) -> NodeId {
        self.push(NodeKind::FunctionDefinition {
            qualifier,
            return_type,
            name: name.to_string(),
            arguments,
            body,
        })
    }
}

// ==================== Type annotations ====================

/// Per-node type slot, filled by the type checker.
///
/// A slot holding a concrete type (anything but `auto`) is final: the
/// checker skips nodes whose slot is already concrete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeTable {
    types: Vec<Option<Type>>,
}

impl TypeTable {
    pub fn new(ast: &Ast) -> Self {
        Self { types: vec![None; ast.len()] }
    }

    pub fn get(&self, id: NodeId) -> Option<&Type> {
        self.types.get(id.index()).and_then(Option::as_ref)
    }

    /// Slot holds a concrete type
    pub fn is_typed(&self, id: NodeId) -> bool {
        matches!(self.get(id), Some(t) if *t != Type::Unspec)
    }

    pub fn set(&mut self, id: NodeId, ty: Type) {
        if id.index() >= self.types.len() {
            self.types.resize(id.index() + 1, None);
        }
        self.types[id.index()] = Some(ty);
    }

    /// Type of a node every later pass expects to be checked already
    pub fn expect(&self, id: NodeId) -> Result<&Type> {
        self.get(id)
            .ok_or_else(|| Error::internal(format!("node {} reached code generation untyped", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tiny_program() -> Ast {
        let mut b = AstBuilder::new();
        let zero = b.int(0);
        let ret = b.ret(Some(zero));
        let body = b.block(vec![], vec![ret]);
        let main = b.function(Qualifier::Public, Type::Int, "og", vec![], body);
        let root = b.program(vec![main]);
        b.finish(root).unwrap()
    }

    #[test]
    fn test_builder_allocates_children_first() {
        let ast = tiny_program();
        assert_eq!(ast.len(), 5);
        assert_eq!(ast.declarations(), &[NodeId(3)]);
        assert!(matches!(ast.kind(NodeId(0)), NodeKind::Integer { value: 0 }));
    }

    #[test]
    fn test_json_roundtrip_preserves_tree() {
        let ast = tiny_program();
        let json = ast.to_json().unwrap();
        assert!(json.contains("\"node\": \"function_definition\""));
        assert_eq!(Ast::from_json(&json).unwrap(), ast);
    }

    #[test]
    fn test_reads_front_end_json() {
        let json = r#"{
            "nodes": [
                {"line": 1, "kind": {"node": "integer", "value": 7}},
                {"line": 1, "kind": {"node": "variable_declaration", "qualifier": "require",
                                     "var_type": "int", "identifiers": ["x"]}},
                {"line": 2, "kind": {"node": "variable_declaration", "var_type": {"pointer": "double"},
                                     "identifiers": ["p"]}},
                {"line": 3, "kind": {"node": "variable_declaration", "var_type": "auto",
                                     "identifiers": ["n"], "initializer": 0}},
                {"kind": {"node": "program", "declarations": [1, 2, 3]}}
            ],
            "root": 4
        }"#;
        let ast = Ast::from_json(json).unwrap();
        match ast.kind(NodeId(2)) {
            NodeKind::VariableDeclaration { var_type, qualifier, .. } => {
                assert_eq!(var_type, &Type::pointer(Type::Double));
                assert_eq!(qualifier, &Qualifier::Private);
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert!(matches!(
            ast.kind(NodeId(1)),
            NodeKind::VariableDeclaration { qualifier: Qualifier::External, .. }
        ));
    }

    #[test]
    fn test_rejects_forward_references() {
        let nodes = vec![
            Node { line: 1, kind: NodeKind::Evaluation { expression: NodeId(1) } },
            Node { line: 1, kind: NodeKind::Integer { value: 1 } },
            Node { line: 1, kind: NodeKind::Program { declarations: vec![] } },
        ];
        assert!(matches!(Ast::new(nodes, NodeId(2)), Err(Error::Ast(_))));
    }

    #[test]
    fn test_rejects_shared_children() {
        let mut b = AstBuilder::new();
        let one = b.int(1);
        b.binary(BinaryOp::Add, one, one);
        let root = b.program(vec![]);
        assert!(matches!(b.finish(root), Err(Error::Ast(_))));
    }

    #[test]
    fn test_rejects_rvalue_of_non_lvalue() {
        let mut b = AstBuilder::new();
        let one = b.int(1);
        b.rvalue(one);
        let root = b.program(vec![]);
        assert!(matches!(b.finish(root), Err(Error::Ast(_))));
    }

    #[test]
    fn test_rejects_bare_lvalue_as_value() {
        // x + 1 with x not wrapped in an rvalue
        let mut b = AstBuilder::new();
        let x = b.var("x");
        let one = b.int(1);
        b.binary(BinaryOp::Add, x, one);
        let root = b.program(vec![]);
        assert!(matches!(b.finish(root), Err(Error::Ast(_))));

        let mut b = AstBuilder::new();
        let p = b.var("p");
        let zero = b.int(0);
        b.pointer_index(p, zero);
        let root = b.program(vec![]);
        assert!(matches!(b.finish(root), Err(Error::Ast(_))));

        let mut b = AstBuilder::new();
        let x = b.var("x");
        let ret = b.ret(Some(x));
        let body = b.block(vec![], vec![ret]);
        let f = b.function(Qualifier::Private, Type::Int, "f", vec![], body);
        let root = b.program(vec![f]);
        assert!(matches!(b.finish(root), Err(Error::Ast(_))));
    }

    #[test]
    fn test_storage_operands_accept_bare_lvalues() {
        let mut b = AstBuilder::new();
        let t = b.var("t");
        let first = b.tuple_index(t, 1);
        let read = b.rvalue(first);
        let x = b.var("x");
        let size = b.size_of(x);
        let sum = b.binary(BinaryOp::Add, read, size);
        let eval = b.eval(sum);
        let body = b.block(vec![], vec![eval]);
        let f = b.function(Qualifier::Private, Type::Void, "f", vec![], body);
        let root = b.program(vec![f]);
        assert!(b.finish(root).is_ok());
    }

    #[test]
    fn test_type_table_tracks_concrete_slots() {
        let ast = tiny_program();
        let mut types = TypeTable::new(&ast);
        assert!(!types.is_typed(NodeId(0)));
        types.set(NodeId(0), Type::Unspec);
        assert!(!types.is_typed(NodeId(0)));
        types.set(NodeId(0), Type::Int);
        assert!(types.is_typed(NodeId(0)));
        assert!(types.expect(NodeId(1)).is_err());
    }
}
