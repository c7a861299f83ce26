//! Semantic Analysis for og
//!
//! Performs:
//! - Symbol resolution (scopes, declarations, redeclarations)
//! - Type checking of every expression
//! - `auto` inference for variables and function return types
//! - Flow checking of each function definition
//!
//! Types are written into a `TypeTable`. A node whose slot already holds a
//! concrete type is not checked again, so running the checker twice over
//! the same table leaves it unchanged.

use log::{debug, trace};

use crate::frontend::ast::{Ast, BinaryOp, NodeId, NodeKind, Qualifier, TypeTable, UnaryOp};
use crate::frontend::flow::FlowChecker;
use crate::frontend::symbol::{Scoped, Symbol, SymbolId, SymbolTable};
use crate::types::{compatible, CompatOptions, Type};
use crate::utils::{Error, Result};

// ==================== Type Checker ====================

pub struct TypeChecker<'a> {
    ast: &'a Ast,
    types: &'a mut TypeTable,
    symbols: SymbolTable,
    /// Function whose body is being checked
    function: Option<SymbolId>,
    /// Calls from an `auto` function to itself, with the return type each saw
    self_calls: Vec<(NodeId, Type)>,
}

impl<'a> Scoped for TypeChecker<'a> {
    fn symbols(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }
}

impl<'a> TypeChecker<'a> {
    pub fn new(ast: &'a Ast, types: &'a mut TypeTable) -> Self {
        Self {
            ast,
            types,
            symbols: SymbolTable::new(),
            function: None,
            self_calls: Vec::new(),
        }
    }

    /// Symbols declared at global scope once checking is done
    pub fn into_symbols(self) -> SymbolTable {
        self.symbols
    }

    /// Check the whole program; the first error aborts
    pub fn check_program(&mut self) -> Result<()> {
        for &declaration in self.ast.declarations() {
            match self.ast.kind(declaration) {
                NodeKind::VariableDeclaration { .. } => self.variable_declaration(declaration)?,
                NodeKind::FunctionDeclaration { .. } => {
                    self.function_signature(declaration, false)?;
                }
                NodeKind::FunctionDefinition { .. } => self.function_definition(declaration)?,
                other => {
                    return Err(Error::internal(format!("{:?} at program level", other)));
                }
            }
        }
        Ok(())
    }

    fn error(&self, id: NodeId, message: impl Into<String>) -> Error {
        Error::type_error(self.ast.span(id), message)
    }

    // ==================== Functions ====================

    /// Declare (or re-declare) a function and type its arguments
    fn function_signature(&mut self, id: NodeId, defining: bool) -> Result<SymbolId> {
        let (qualifier, return_type, name, arguments) = match self.ast.kind(id) {
            NodeKind::FunctionDeclaration { qualifier, return_type, name, arguments }
            | NodeKind::FunctionDefinition { qualifier, return_type, name, arguments, .. } => {
                (*qualifier, return_type, name, arguments)
            }
            other => return Err(Error::internal(format!("{:?} is not a function", other))),
        };

        if defining && qualifier == Qualifier::External {
            return Err(self.error(id, format!("function '{}' is declared 'require' and cannot be defined", name)));
        }
        if *return_type != Type::Unspec && return_type.contains_unspec() {
            return Err(self.error(id, format!("function '{}' has a partially inferred return type", name)));
        }

        let mut params = Vec::with_capacity(arguments.len());
        for &argument in arguments {
            let ty = self.argument_type(name, argument)?;
            self.types.set(argument, ty.clone());
            params.push(ty);
        }

        let symbol = match self.symbols.lookup_local(name) {
            Some(existing) => {
                let prior = self.symbols.get(existing);
                if !prior.is_function() {
                    return Err(self.error(id, format!("'{}' redeclared as a function", name)));
                }
                let same_type = if prior.is_auto {
                    *return_type == Type::Unspec
                } else {
                    prior.ty == *return_type
                };
                if !same_type || prior.params() != params.as_slice() || prior.qualifier != qualifier {
                    return Err(self.error(id, format!("conflicting declarations for '{}'", name)));
                }
                if defining && prior.defined {
                    return Err(self.error(id, format!("function '{}' redefined", name)));
                }
                existing
            }
            None => self.symbols.define(Symbol::function(
                name.clone(),
                qualifier,
                return_type.clone(),
                params,
                self.ast.span(id),
            )),
        };

        let current = self.symbols.get(symbol).ty.clone();
        self.types.set(id, current);
        Ok(symbol)
    }

    fn argument_type(&self, function: &str, argument: NodeId) -> Result<Type> {
        match self.ast.kind(argument) {
            NodeKind::VariableDeclaration { var_type, identifiers, initializer, .. } => {
                let name = identifiers.join(", ");
                if identifiers.len() != 1 || initializer.is_some() {
                    return Err(self.error(argument, format!("malformed argument '{}' of '{}'", name, function)));
                }
                if var_type.contains_unspec() {
                    return Err(self.error(argument, format!("argument '{}' of '{}' must have a known type", name, function)));
                }
                if var_type.is_struct() || *var_type == Type::Void {
                    return Err(self.error(argument, format!("argument '{}' of '{}' cannot have type {}", name, function, var_type)));
                }
                Ok(var_type.clone())
            }
            other => Err(Error::internal(format!("{:?} as a function argument", other))),
        }
    }

    fn function_definition(&mut self, id: NodeId) -> Result<()> {
        let symbol = self.function_signature(id, true)?;
        self.symbols.get_mut(symbol).defined = true;

        let (name, arguments, body) = match self.ast.kind(id) {
            NodeKind::FunctionDefinition { name, arguments, body, .. } => (name, arguments, *body),
            _ => return Err(Error::internal("function definition changed shape")),
        };

        let enclosing = self.function.replace(symbol);
        let result = self.in_scope(|checker| {
            for &argument in arguments {
                checker.declare_argument(argument)?;
            }
            checker.block(body)
        });
        self.function = enclosing;
        let self_calls = std::mem::take(&mut self.self_calls);
        result?;

        let return_type = self.symbols.get(symbol).ty.clone();
        if return_type == Type::Unspec {
            return Err(self.error(id, format!("cannot infer the return type of '{}'", name)));
        }
        // a call typed before a later return widened the result reads the wrong width
        if let Some((call, _)) = self_calls.iter().find(|(_, seen)| *seen != return_type) {
            return Err(self.error(*call, format!("return type of '{}' changed after it was used", name)));
        }
        self.types.set(id, return_type.clone());
        debug!("checked '{}': returns {}", name, return_type);

        FlowChecker::new(self.ast).check_function(id, &return_type)
    }

    fn declare_argument(&mut self, argument: NodeId) -> Result<()> {
        if let NodeKind::VariableDeclaration { identifiers, .. } = self.ast.kind(argument) {
            let ty = self.types.expect(argument)?.clone();
            for name in identifiers {
                if self.symbols.lookup_local(name).is_some() {
                    return Err(self.error(argument, format!("argument '{}' redeclared", name)));
                }
                let mut symbol = Symbol::variable(name.clone(), Qualifier::Private, ty.clone(), self.ast.span(argument));
                symbol.defined = true;
                self.symbols.define(symbol);
            }
        }
        Ok(())
    }

    // ==================== Declarations ====================

    fn variable_declaration(&mut self, id: NodeId) -> Result<()> {
        let (qualifier, var_type, identifiers, initializer) = match self.ast.kind(id) {
            NodeKind::VariableDeclaration { qualifier, var_type, identifiers, initializer } => {
                (*qualifier, var_type, identifiers, *initializer)
            }
            other => return Err(Error::internal(format!("{:?} is not a variable declaration", other))),
        };
        let names = identifiers.join(", ");
        let global = self.symbols.is_global_scope();

        if qualifier == Qualifier::External && initializer.is_some() {
            return Err(self.error(id, format!("'{}' is declared 'require' and cannot be initialized", names)));
        }
        if qualifier == Qualifier::External && var_type.contains_unspec() {
            return Err(self.error(id, format!("'{}' is declared 'require' and needs a known type", names)));
        }
        if !global && qualifier != Qualifier::Private {
            return Err(self.error(id, format!("local variable '{}' cannot be public or required", names)));
        }
        if *var_type == Type::Void {
            return Err(self.error(id, format!("variable '{}' cannot be void", names)));
        }
        if *var_type != Type::Unspec && var_type.contains_unspec() {
            return Err(self.error(id, format!("variable '{}' has a partially inferred type", names)));
        }
        if identifiers.len() > 1 && *var_type != Type::Unspec {
            return Err(self.error(id, format!("declaring '{}' together requires 'auto'", names)));
        }
        if *var_type == Type::Unspec && initializer.is_none() {
            return Err(self.error(id, format!("'auto' variable '{}' needs an initializer", names)));
        }

        let declared = match initializer {
            None => var_type.clone(),
            Some(init) => {
                if global && !self.ast.kind(init).is_literal(self.ast) {
                    return Err(self.error(init, format!("global '{}' must be initialized with a literal", names)));
                }
                self.expr(init)?;
                self.back_patch(init, var_type);
                let value = self.types.expect(init)?.clone();
                if identifiers.len() == 1 {
                    compatible(var_type, &value, CompatOptions::INITIALIZER).ok_or_else(|| {
                        self.error(id, format!("cannot initialize '{}' of type {} with a value of type {}", names, var_type, value))
                    })?
                } else {
                    match &value {
                        Type::Struct(components) if components.len() == identifiers.len() => value.clone(),
                        _ => {
                            return Err(self.error(
                                id,
                                format!("cannot destructure a value of type {} into {} variables", value, identifiers.len()),
                            ))
                        }
                    }
                }
            }
        };

        if declared.contains_unspec() {
            return Err(self.error(id, format!("cannot infer the type of '{}'", names)));
        }
        if declared == Type::Void {
            return Err(self.error(id, format!("variable '{}' cannot hold a void value", names)));
        }

        for (index, name) in identifiers.iter().enumerate() {
            if self.symbols.lookup_local(name).is_some() {
                return Err(self.error(id, format!("'{}' redeclared", name)));
            }
            let ty = if identifiers.len() == 1 {
                declared.clone()
            } else {
                declared.components()[index].clone()
            };
            trace!("declare '{}': {}", name, ty);
            let mut symbol = Symbol::variable(name.clone(), qualifier, ty, self.ast.span(id));
            symbol.is_auto = *var_type == Type::Unspec;
            symbol.defined = initializer.is_some();
            self.symbols.define(symbol);
        }

        self.types.set(id, declared);
        Ok(())
    }

    /// Fix types that only the destination can decide
    fn back_patch(&mut self, id: NodeId, target: &Type) {
        match self.ast.kind(id) {
            NodeKind::Input if *target == Type::Double => self.types.set(id, Type::Double),
            NodeKind::StackAlloc { .. } if target.is_pointer() => {
                if self.types.get(id).map_or(true, Type::contains_unspec) {
                    self.types.set(id, target.clone());
                }
            }
            _ => {}
        }
    }

    // ==================== Statements ====================

    fn block(&mut self, id: NodeId) -> Result<()> {
        let (declarations, instructions) = match self.ast.kind(id) {
            NodeKind::Block { declarations, instructions } => (declarations, instructions),
            other => return Err(Error::internal(format!("{:?} is not a block", other))),
        };
        self.in_scope(|checker| {
            for &declaration in declarations {
                checker.variable_declaration(declaration)?;
            }
            for &instruction in instructions {
                checker.statement(instruction)?;
            }
            Ok(())
        })
    }

    fn statement(&mut self, id: NodeId) -> Result<()> {
        match self.ast.kind(id) {
            NodeKind::Block { .. } => self.block(id),
            NodeKind::Evaluation { expression } => {
                self.concrete_expr(*expression)?;
                Ok(())
            }
            NodeKind::Write { arguments, .. } => {
                for &argument in arguments {
                    let ty = self.concrete_expr(argument)?;
                    if !printable(&ty) {
                        return Err(self.error(argument, format!("cannot write a value of type {}", ty)));
                    }
                }
                Ok(())
            }
            NodeKind::If { condition, then_block } => {
                self.condition(*condition)?;
                self.statement(*then_block)
            }
            NodeKind::IfElse { condition, then_block, else_block } => {
                self.condition(*condition)?;
                self.statement(*then_block)?;
                self.statement(*else_block)
            }
            NodeKind::For { initializers, condition, increments, body } => self.in_scope(|checker| {
                for &initializer in initializers {
                    if matches!(checker.ast.kind(initializer), NodeKind::VariableDeclaration { .. }) {
                        checker.variable_declaration(initializer)?;
                    } else {
                        checker.concrete_expr(initializer)?;
                    }
                }
                if let Some(condition) = *condition {
                    let ty = checker.concrete_expr(condition)?;
                    let tested = ty.components().last().cloned().unwrap_or(Type::Void);
                    if tested != Type::Int {
                        return Err(checker.error(condition, format!("loop condition of type {} is not an integer", ty)));
                    }
                }
                for &increment in increments {
                    checker.concrete_expr(increment)?;
                }
                checker.statement(*body)
            }),
            NodeKind::Break | NodeKind::Continue => Ok(()),
            NodeKind::Return { value } => self.return_statement(id, *value),
            other => Err(Error::internal(format!("{:?} is not a statement", other))),
        }
    }

    fn condition(&mut self, id: NodeId) -> Result<()> {
        let ty = self.concrete_expr(id)?;
        if ty != Type::Int {
            return Err(self.error(id, format!("condition of type {} is not an integer", ty)));
        }
        Ok(())
    }

    fn return_statement(&mut self, id: NodeId, value: Option<NodeId>) -> Result<()> {
        let function = self
            .function
            .ok_or_else(|| self.error(id, "return outside of a function"))?;
        let (name, current, is_auto) = {
            let symbol = self.symbols.get(function);
            (symbol.name.clone(), symbol.ty.clone(), symbol.is_auto)
        };

        let value = match value {
            None if current == Type::Void => return Ok(()),
            None => return Err(self.error(id, format!("function '{}' must return a value", name))),
            Some(_) if current == Type::Void => {
                return Err(self.error(id, format!("void function '{}' cannot return a value", name)))
            }
            Some(value) => value,
        };

        self.expr(value)?;
        self.back_patch(value, &current);
        let ty = self.types.expect(value)?.clone();
        if ty == Type::Void || ty.contains_unspec() {
            return Err(self.error(value, format!("cannot return a value of type {}", ty)));
        }

        if is_auto {
            let unified = compatible(&current, &ty, CompatOptions::GENERALIZE).ok_or_else(|| {
                self.error(value, format!("return of type {} conflicts with earlier returns of type {} in '{}'", ty, current, name))
            })?;
            trace!("'{}' return type refined to {}", name, unified);
            self.symbols.get_mut(function).ty = unified;
        } else if compatible(&current, &ty, CompatOptions::ASSIGNMENT).is_none() {
            return Err(self.error(value, format!("cannot return {} from '{}' returning {}", ty, name, current)));
        }
        Ok(())
    }

    // ==================== Expressions ====================

    /// Type of an expression that must not depend on its consumer
    fn concrete_expr(&mut self, id: NodeId) -> Result<Type> {
        let ty = self.expr(id)?;
        if ty.contains_unspec() {
            return Err(self.error(id, "cannot infer the element type of this allocation"));
        }
        Ok(ty)
    }

    fn expr(&mut self, id: NodeId) -> Result<Type> {
        if self.types.is_typed(id) {
            return self.types.expect(id).cloned();
        }
        let ty = self.expr_kind(id)?;
        self.types.set(id, ty.clone());
        Ok(ty)
    }

    fn expr_kind(&mut self, id: NodeId) -> Result<Type> {
        let ty = match self.ast.kind(id) {
            NodeKind::Integer { .. } => Type::Int,
            NodeKind::Double { .. } => Type::Double,
            NodeKind::Str { .. } => Type::String,
            NodeKind::Nullptr => Type::generic_pointer(),
            NodeKind::Input => Type::Int,

            NodeKind::Variable { name } => {
                let symbol = self
                    .symbols
                    .lookup(name)
                    .ok_or_else(|| self.error(id, format!("undeclared variable '{}'", name)))?;
                let symbol = self.symbols.get(symbol);
                if symbol.is_function() {
                    return Err(self.error(id, format!("function '{}' used as a variable", name)));
                }
                symbol.ty.clone()
            }

            NodeKind::PointerIndex { base, index } => {
                let base_ty = self.concrete_expr(*base)?;
                let element = match base_ty.referenced() {
                    Some(element) if *element != Type::Void => element.clone(),
                    _ => return Err(self.error(*base, format!("cannot index a value of type {}", base_ty))),
                };
                let index_ty = self.concrete_expr(*index)?;
                if index_ty != Type::Int {
                    return Err(self.error(*index, format!("pointer index of type {} is not an integer", index_ty)));
                }
                element
            }

            NodeKind::TupleIndex { base, index } => {
                let base_ty = self.concrete_expr(*base)?;
                let components = match &base_ty {
                    Type::Struct(components) => components,
                    _ => return Err(self.error(*base, format!("cannot take component {} of a value of type {}", index, base_ty))),
                };
                if *index < 1 || *index as usize > components.len() {
                    return Err(self.error(id, format!("tuple index {} out of range for type {}", index, base_ty)));
                }
                components[*index as usize - 1].clone()
            }

            NodeKind::Rvalue { lvalue } => self.expr(*lvalue)?,

            NodeKind::Assignment { lvalue, rvalue } => {
                let target = self.concrete_expr(*lvalue)?;
                self.expr(*rvalue)?;
                self.back_patch(*rvalue, &target);
                let value = self.types.expect(*rvalue)?.clone();
                if target.is_struct() || value.is_struct() {
                    return Err(self.error(id, "tuple assignment is not supported"));
                }
                compatible(&target, &value, CompatOptions::ASSIGNMENT)
                    .ok_or_else(|| self.error(id, format!("cannot assign a value of type {} to a {} location", value, target)))?;
                target
            }

            NodeKind::Unary { op, argument } => {
                let ty = self.concrete_expr(*argument)?;
                let ok = match op {
                    UnaryOp::Neg | UnaryOp::Identity => ty.is_numeric(),
                    UnaryOp::Not => ty == Type::Int,
                };
                if !ok {
                    return Err(self.error(id, format!("wrong type {} for unary operator", ty)));
                }
                ty
            }

            NodeKind::Binary { op, left, right } => {
                let l = self.concrete_expr(*left)?;
                let r = self.concrete_expr(*right)?;
                self.binary(id, *op, &l, &r)?
            }

            NodeKind::AddressOf { lvalue } => Type::pointer(self.concrete_expr(*lvalue)?),

            NodeKind::StackAlloc { count } => {
                let ty = self.concrete_expr(*count)?;
                if ty != Type::Int {
                    return Err(self.error(*count, format!("allocation size of type {} is not an integer", ty)));
                }
                // element type comes from the destination
                Type::pointer(Type::Unspec)
            }

            NodeKind::Sizeof { expression } => {
                self.expr(*expression)?;
                Type::Int
            }

            NodeKind::Tuple { elements } => {
                let mut components = Vec::with_capacity(elements.len());
                for &element in elements {
                    let ty = self.concrete_expr(element)?;
                    if ty == Type::Void {
                        return Err(self.error(element, "void value in a tuple"));
                    }
                    components.push(ty);
                }
                match components.len() {
                    0 => return Err(self.error(id, "empty tuple")),
                    1 => components.remove(0),
                    _ => Type::Struct(components),
                }
            }

            NodeKind::FunctionCall { name, arguments } => self.call(id, name, arguments)?,

            other => return Err(Error::internal(format!("{:?} is not an expression", other))),
        };
        Ok(ty)
    }

    fn binary(&self, id: NodeId, op: BinaryOp, l: &Type, r: &Type) -> Result<Type> {
        let mismatch = || self.error(id, format!("wrong types {} and {} for operator '{}'", l, r, op.symbol()));
        let numeric = || {
            if l.is_numeric() && r.is_numeric() {
                compatible(l, r, CompatOptions::DEFAULT).ok_or_else(mismatch)
            } else {
                Err(mismatch())
            }
        };

        match op {
            BinaryOp::Add => match (l, r) {
                (Type::Pointer(_), Type::Int) => Ok(l.clone()),
                _ => numeric(),
            },
            BinaryOp::Sub => match (l, r) {
                (Type::Pointer(_), Type::Int) => Ok(l.clone()),
                (Type::Pointer(_), Type::Pointer(_)) => compatible(l, r, CompatOptions::ASSIGNMENT)
                    .map(|_| Type::Int)
                    .ok_or_else(mismatch),
                _ => numeric(),
            },
            BinaryOp::Mul | BinaryOp::Div => numeric(),
            BinaryOp::Mod | BinaryOp::And | BinaryOp::Or => match (l, r) {
                (Type::Int, Type::Int) => Ok(Type::Int),
                _ => Err(mismatch()),
            },
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Ge | BinaryOp::Gt => numeric().map(|_| Type::Int),
            BinaryOp::Eq | BinaryOp::Ne => {
                if l.is_pointer() && r.is_pointer() {
                    compatible(l, r, CompatOptions::ASSIGNMENT)
                        .map(|_| Type::Int)
                        .ok_or_else(mismatch)
                } else {
                    numeric().map(|_| Type::Int)
                }
            }
        }
    }

    fn call(&mut self, id: NodeId, name: &str, arguments: &[NodeId]) -> Result<Type> {
        let function = self
            .symbols
            .lookup(name)
            .ok_or_else(|| self.error(id, format!("undeclared function '{}'", name)))?;
        let (params, return_type, param_tuple, is_auto) = {
            let symbol = self.symbols.get(function);
            if !symbol.is_function() {
                return Err(self.error(id, format!("'{}' is not a function", name)));
            }
            (symbol.params().to_vec(), symbol.ty.clone(), symbol.param_tuple(), symbol.is_auto)
        };

        if params.len() != arguments.len() {
            return Err(self.error(
                id,
                format!("wrong number of arguments in call to '{}': expected {}, got {}", name, params.len(), arguments.len()),
            ));
        }

        let mut actuals = Vec::with_capacity(arguments.len());
        for (&argument, param) in arguments.iter().zip(&params) {
            self.expr(argument)?;
            self.back_patch(argument, param);
            actuals.push(self.types.expect(argument)?.clone());
        }
        let actuals = Type::Struct(actuals);
        if compatible(&param_tuple, &actuals, CompatOptions::ASSIGNMENT).is_none() {
            return Err(self.error(
                id,
                format!("arguments {} do not match the parameters {} of '{}'", actuals, param_tuple, name),
            ));
        }

        if return_type == Type::Unspec {
            return Err(self.error(id, format!("function '{}' does not have a known return type", name)));
        }
        if is_auto && self.function == Some(function) {
            self.self_calls.push((id, return_type.clone()));
        }
        Ok(return_type)
    }
}

/// Something `write` knows how to print
fn printable(ty: &Type) -> bool {
    match ty {
        Type::Int | Type::Double | Type::String => true,
        Type::Struct(components) => components.iter().all(printable),
        _ => false,
    }
}

/// Type-check `ast`, filling a fresh type table
pub fn check(ast: &Ast) -> Result<(TypeTable, SymbolTable)> {
    let mut types = TypeTable::new(ast);
    let mut checker = TypeChecker::new(ast, &mut types);
    checker.check_program()?;
    let symbols = checker.into_symbols();
    Ok((types, symbols))
}
