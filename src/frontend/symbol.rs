//! Symbols and the scoped symbol table
//!
//! Symbols live in a flat arena and are referred to by `SymbolId`; a scope
//! only holds name bindings. Leaving a scope drops its bindings, the symbol
//! data stays addressable for as long as the table does.

use std::collections::HashMap;

use crate::frontend::ast::Qualifier;
use crate::types::Type;
use crate::utils::{Result, Span};

// ==================== Symbol ====================

/// Index of a symbol in the table's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(usize);

/// A declared variable or function
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub qualifier: Qualifier,
    /// Variable type, or the return type of a function
    pub ty: Type,
    /// Parameter types; present only for functions
    pub params: Option<Vec<Type>>,
    /// Frame offset; 0 means the symbol is global
    pub offset: i32,
    /// Function has a body, or variable has been initialized
    pub defined: bool,
    /// Declared as `auto`; never changes after creation
    pub is_auto: bool,
    pub span: Span,
}

impl Symbol {
    pub fn variable(name: impl Into<String>, qualifier: Qualifier, ty: Type, span: Span) -> Self {
        let is_auto = ty == Type::Unspec;
        Self {
            name: name.into(),
            qualifier,
            ty,
            params: None,
            offset: 0,
            defined: false,
            is_auto,
            span,
        }
    }

    pub fn function(
        name: impl Into<String>,
        qualifier: Qualifier,
        return_type: Type,
        params: Vec<Type>,
        span: Span,
    ) -> Self {
        let is_auto = return_type == Type::Unspec;
        Self {
            name: name.into(),
            qualifier,
            ty: return_type,
            params: Some(params),
            offset: 0,
            defined: false,
            is_auto,
            span,
        }
    }

    pub fn is_function(&self) -> bool {
        self.params.is_some()
    }

    pub fn is_global(&self) -> bool {
        self.offset == 0
    }

    /// Parameter types as one tuple, the shape calls are checked against
    pub fn param_tuple(&self) -> Type {
        Type::Struct(self.params.clone().unwrap_or_default())
    }

    pub fn params(&self) -> &[Type] {
        self.params.as_deref().unwrap_or(&[])
    }
}

// ==================== Symbol Table ====================

/// Unique identifier for a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

#[derive(Debug, Clone)]
struct Scope {
    parent: Option<ScopeId>,
    symbols: HashMap<String, SymbolId>,
}

/// Symbol table with nested scopes
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    scopes: Vec<Scope>,
    current: ScopeId,
}

impl SymbolTable {
    pub fn new() -> Self {
        let global = Scope {
            parent: None,
            symbols: HashMap::new(),
        };
        Self {
            symbols: Vec::new(),
            scopes: vec![global],
            current: ScopeId(0),
        }
    }

    /// Enter a new scope
    pub fn enter_scope(&mut self) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            parent: Some(self.current),
            symbols: HashMap::new(),
        });
        self.current = id;
        id
    }

    /// Exit the current scope
    pub fn exit_scope(&mut self) {
        if let Some(parent) = self.scopes[self.current.0].parent {
            self.current = parent;
        }
    }

    pub fn is_global_scope(&self) -> bool {
        self.scopes[self.current.0].parent.is_none()
    }

    /// Bind a symbol in the current scope, shadowing outer bindings
    pub fn define(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        let name = symbol.name.clone();
        self.symbols.push(symbol);
        self.scopes[self.current.0].symbols.insert(name, id);
        id
    }

    /// Look up a symbol, searching from current scope upward
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        let mut scope_id = Some(self.current);
        while let Some(id) = scope_id {
            if let Some(symbol) = self.scopes[id.0].symbols.get(name) {
                return Some(*symbol);
            }
            scope_id = self.scopes[id.0].parent;
        }
        None
    }

    /// Look up a symbol only in the current scope
    pub fn lookup_local(&self, name: &str) -> Option<SymbolId> {
        self.scopes[self.current.0].symbols.get(name).copied()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    /// Every symbol bound at global scope
    pub fn globals(&self) -> impl Iterator<Item = &Symbol> {
        self.scopes[0].symbols.values().map(|id| &self.symbols[id.0])
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A pass that owns a symbol table and brackets work in scopes.
///
/// `in_scope` exits the scope on every path out of `f`, errors included.
pub trait Scoped {
    fn symbols(&mut self) -> &mut SymbolTable;

    fn in_scope<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T>
    where
        Self: Sized,
    {
        self.symbols().enter_scope();
        let result = f(self);
        self.symbols().exit_scope();
        result
    }
}
