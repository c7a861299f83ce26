//! Postfix Writer
//!
//! Translates a typed program into postfix instructions, one function at a
//! time. Each function's frame comes from the `FrameCalculator`; every
//! unshared slot the calculator charged must be used here and nothing else,
//! which is checked when the function ends.
//!
//! Tuple values are laid out with component 1 at the lowest address. On the
//! stack a flattened tuple is pushed last component first, so component 1
//! ends up on top and the stack image equals the memory image.

use std::collections::{BTreeSet, HashMap};

use log::{debug, trace};

use crate::backend::postfix::{Emitter, Instr, SymbolKind};
use crate::driver::CodegenConfig;
use crate::frontend::ast::{Ast, BinaryOp, NodeId, NodeKind, Qualifier, TypeTable, UnaryOp};
use crate::frontend::symbol::{Scoped, Symbol, SymbolTable};
use crate::middle::frame::{FrameCalculator, FrameLayout};
use crate::middle::protocol::{self, EvalMode, Produced};
use crate::types::{Type, WORD_SIZE};
use crate::utils::{Error, Result};

/// Offset of the first argument from the frame pointer
const ARGUMENTS_OFFSET: i32 = 8;

/// Where a value is stored to or loaded from
#[derive(Debug, Clone)]
enum Base {
    /// frame pointer + offset
    Frame(i32),
    /// the address held in a frame slot
    Pinned(i32),
    /// the address of an lvalue, evaluated on use
    Lvalue(NodeId),
}

#[derive(Debug, Clone)]
struct LoopLabels {
    increment: String,
    end: String,
}

struct FunctionContext {
    return_type: Type,
    frame: FrameLayout,
    /// Next free local offset, growing downwards
    local_cursor: i32,
}

pub struct PostfixWriter<'a, E: Emitter> {
    ast: &'a Ast,
    types: &'a TypeTable,
    config: &'a CodegenConfig,
    out: &'a mut E,
    symbols: SymbolTable,
    function: Option<FunctionContext>,
    labels: u32,
    loops: Vec<LoopLabels>,
    /// Runtime helpers and external symbols referenced so far
    externs: BTreeSet<String>,
    /// Unshared slots used by the current function
    consulted: BTreeSet<NodeId>,
    string_labels: HashMap<NodeId, String>,
    frames: Vec<FrameLayout>,
}

impl<'a, E: Emitter> Scoped for PostfixWriter<'a, E> {
    fn symbols(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }
}

impl<'a, E: Emitter> PostfixWriter<'a, E> {
    /// `symbols` is the global scope left behind by the type checker
    pub fn new(
        ast: &'a Ast,
        types: &'a TypeTable,
        symbols: SymbolTable,
        config: &'a CodegenConfig,
        out: &'a mut E,
    ) -> Self {
        Self {
            ast,
            types,
            config,
            out,
            symbols,
            function: None,
            labels: 0,
            loops: Vec::new(),
            externs: BTreeSet::new(),
            consulted: BTreeSet::new(),
            string_labels: HashMap::new(),
            frames: Vec::new(),
        }
    }

    /// Emit the whole unit; returns the frame of every function written
    pub fn write_program(mut self) -> Result<Vec<FrameLayout>> {
        let ast = self.ast;
        for &declaration in ast.declarations() {
            match ast.kind(declaration) {
                NodeKind::VariableDeclaration { .. } => self.global_variable(declaration)?,
                NodeKind::FunctionDeclaration { .. } => {}
                NodeKind::FunctionDefinition { .. } => self.function_definition(declaration)?,
                other => return Err(Error::internal(format!("{:?} at program level", other))),
            }
        }

        let mut externs = std::mem::take(&mut self.externs);
        for symbol in self.symbols.globals() {
            let undefined_function = symbol.is_function() && !symbol.defined;
            if undefined_function || symbol.qualifier == Qualifier::External {
                externs.insert(self.label_of(symbol));
            }
        }
        for name in externs {
            self.emit(Instr::Extern(name));
        }
        Ok(self.frames)
    }

    // ==================== Helpers ====================

    fn emit(&mut self, instr: Instr) {
        self.out.emit(instr);
    }

    fn new_label(&mut self) -> String {
        self.labels += 1;
        format!("_L{}", self.labels)
    }

    /// Linker-visible name of a global symbol
    fn label_of(&self, symbol: &Symbol) -> String {
        if !symbol.is_function() {
            symbol.name.clone()
        } else if symbol.name == self.config.entry_point {
            self.config.entry_symbol.clone()
        } else if symbol.name == self.config.entry_symbol {
            format!(".{}", symbol.name)
        } else {
            symbol.name.clone()
        }
    }

    fn context(&self) -> Result<&FunctionContext> {
        self.function
            .as_ref()
            .ok_or_else(|| Error::internal("function code outside of a function"))
    }

    fn type_of(&self, id: NodeId) -> Result<Type> {
        self.types.expect(id).cloned()
    }

    fn call_helper(&mut self, name: &str) {
        self.externs.insert(name.to_string());
        self.emit(Instr::Call(name.to_string()));
    }

    fn trash(&mut self, bytes: u32) {
        if bytes > 0 {
            self.emit(Instr::Trash(bytes));
        }
    }

    fn add_offset(&mut self, offset: u32) {
        if offset > 0 {
            self.emit(Instr::Int(offset as i32));
            self.emit(Instr::Add);
        }
    }

    /// Offset of the unshared slot charged for `id`
    fn temp_slot(&mut self, id: NodeId) -> Result<i32> {
        let offset = self
            .context()?
            .frame
            .temp_offset(id)
            .ok_or_else(|| Error::internal(format!("no temporary reserved for node {}", id)))?;
        self.consulted.insert(id);
        Ok(offset)
    }

    // ==================== Store / Load ====================

    fn push_address(&mut self, base: &Base, offset: u32) -> Result<()> {
        match base {
            Base::Frame(at) => self.emit(Instr::Local(at + offset as i32)),
            Base::Pinned(slot) => {
                self.emit(Instr::Local(*slot));
                self.emit(Instr::LdInt);
                self.add_offset(offset);
            }
            Base::Lvalue(lvalue) => {
                if offset != 0 {
                    return Err(Error::internal("component store through an lvalue"));
                }
                self.address(*lvalue)?;
            }
        }
        Ok(())
    }

    /// Store the flattened `source` value on top of the stack into `base`
    /// as a `target`, widening int leaves bound to double leaves
    fn store(&mut self, target: &Type, source: &Type, base: &Base, offset: u32) -> Result<()> {
        match (target, source) {
            (Type::Struct(targets), _) if targets.len() == 1 => self.store(&targets[0], source, base, offset),
            (_, Type::Struct(sources)) if sources.len() == 1 => self.store(target, &sources[0], base, offset),
            (Type::Struct(targets), Type::Struct(sources)) if targets.len() == sources.len() => {
                let mut at = offset;
                for (t, s) in targets.iter().zip(sources) {
                    self.store(t, s, base, at)?;
                    at += t.size();
                }
                Ok(())
            }
            (Type::Struct(_), _) | (_, Type::Struct(_)) => {
                Err(Error::internal(format!("cannot store {} as {}", source, target)))
            }
            (Type::Double, _) => {
                if *source == Type::Int {
                    self.emit(Instr::I2D);
                }
                self.push_address(base, offset)?;
                self.emit(Instr::StDouble);
                Ok(())
            }
            _ => {
                self.push_address(base, offset)?;
                self.emit(Instr::StInt);
                Ok(())
            }
        }
    }

    /// Push the value of type `ty` stored at `base`, flattened
    fn load(&mut self, ty: &Type, base: &Base) -> Result<()> {
        for (leaf, offset) in ty.leaf_offsets().into_iter().rev() {
            self.push_address(base, offset)?;
            self.emit(if *leaf == Type::Double { Instr::LdDouble } else { Instr::LdInt });
        }
        Ok(())
    }

    // ==================== Globals ====================

    fn global_variable(&mut self, id: NodeId) -> Result<()> {
        let ast = self.ast;
        let (qualifier, identifiers, initializer) = match ast.kind(id) {
            NodeKind::VariableDeclaration { qualifier, identifiers, initializer, .. } => {
                (*qualifier, identifiers, *initializer)
            }
            other => return Err(Error::internal(format!("{:?} is not a variable declaration", other))),
        };
        if qualifier == Qualifier::External {
            return Ok(());
        }

        let ty = self.type_of(id)?;
        let values = match initializer {
            None => vec![None; identifiers.len()],
            Some(init) if identifiers.len() == 1 => vec![Some(init)],
            Some(init) => literal_elements(ast, init)?.into_iter().map(Some).collect(),
        };
        if values.len() != identifiers.len() {
            return Err(Error::internal(format!("cannot destructure the initializer of {}", id)));
        }

        for (index, (name, value)) in identifiers.iter().zip(values).enumerate() {
            let component = if identifiers.len() == 1 { ty.clone() } else { ty.components()[index].clone() };
            trace!("global '{}': {}", name, component);
            match value {
                None => {
                    self.emit(Instr::Bss);
                    self.emit(Instr::Align);
                    if qualifier == Qualifier::Public {
                        self.emit(Instr::Global(name.clone(), SymbolKind::Obj));
                    }
                    self.emit(Instr::Label(name.clone()));
                    self.emit(Instr::SAlloc(component.size()));
                }
                Some(value) => {
                    self.static_strings(value)?;
                    self.emit(Instr::Data);
                    self.emit(Instr::Align);
                    if qualifier == Qualifier::Public {
                        self.emit(Instr::Global(name.clone(), SymbolKind::Obj));
                    }
                    self.emit(Instr::Label(name.clone()));
                    self.static_data(value, &component)?;
                }
            }
        }
        Ok(())
    }

    /// Emit the string literals of a static initializer ahead of it
    fn static_strings(&mut self, id: NodeId) -> Result<()> {
        let ast = self.ast;
        match ast.kind(id) {
            NodeKind::Str { value } => {
                let label = self.new_label();
                self.emit(Instr::Rodata);
                self.emit(Instr::Align);
                self.emit(Instr::Label(label.clone()));
                self.emit(Instr::SString(value.clone()));
                self.string_labels.insert(id, label);
            }
            NodeKind::Tuple { elements } => {
                for &element in elements {
                    self.static_strings(element)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Static image of a literal, components in forward order
    fn static_data(&mut self, id: NodeId, target: &Type) -> Result<()> {
        let ast = self.ast;
        match ast.kind(id) {
            NodeKind::Integer { value } if *target == Type::Double => self.emit(Instr::SDouble(*value as f64)),
            NodeKind::Integer { value } => self.emit(Instr::SInt(*value)),
            NodeKind::Double { value } => self.emit(Instr::SDouble(*value)),
            NodeKind::Nullptr => self.emit(Instr::SInt(0)),
            NodeKind::Str { .. } => {
                let label = self
                    .string_labels
                    .remove(&id)
                    .ok_or_else(|| Error::internal(format!("string {} was not emitted", id)))?;
                self.emit(Instr::SAddr(label));
            }
            NodeKind::Tuple { elements } if elements.len() == 1 => self.static_data(elements[0], target)?,
            NodeKind::Tuple { elements } => {
                let components = target.components();
                if components.len() != elements.len() {
                    return Err(Error::internal(format!("tuple {} does not match {}", id, target)));
                }
                for (&element, component) in elements.iter().zip(components) {
                    self.static_data(element, component)?;
                }
            }
            other => return Err(Error::internal(format!("{:?} in a static initializer", other))),
        }
        Ok(())
    }

    // ==================== Functions ====================

    fn function_definition(&mut self, id: NodeId) -> Result<()> {
        let ast = self.ast;
        let (qualifier, name, arguments, body) = match ast.kind(id) {
            NodeKind::FunctionDefinition { qualifier, name, arguments, body, .. } => {
                (*qualifier, name, arguments, *body)
            }
            other => return Err(Error::internal(format!("{:?} is not a function definition", other))),
        };
        let return_type = self.type_of(id)?;
        let frame = FrameCalculator::new(ast, self.types).calculate(id)?;

        let symbol = self
            .symbols
            .lookup(name)
            .ok_or_else(|| Error::internal(format!("function '{}' was never declared", name)))?;
        let label = self.label_of(self.symbols.get(symbol));

        self.emit(Instr::Text);
        self.emit(Instr::Align);
        if qualifier == Qualifier::Public {
            self.emit(Instr::Global(label.clone(), SymbolKind::Func));
        }
        self.emit(Instr::Label(label));
        self.emit(Instr::Enter(frame.frame_size()));

        self.function = Some(FunctionContext {
            return_type: return_type.clone(),
            frame,
            local_cursor: 0,
        });
        let result = self.in_scope(|writer| {
            let mut offset = ARGUMENTS_OFFSET;
            if return_type.is_struct() {
                offset += WORD_SIZE as i32;
            }
            for &argument in arguments {
                offset = writer.declare_argument(argument, offset)?;
            }
            writer.block(body)?;
            if return_type == Type::Void {
                writer.emit(Instr::Leave);
                writer.emit(Instr::Ret);
            }
            Ok(())
        });
        let context = self.function.take();
        result?;

        let frame = context
            .map(|c| c.frame)
            .ok_or_else(|| Error::internal("function context lost"))?;
        let charged: BTreeSet<NodeId> = frame.unshared.iter().map(|t| t.node).collect();
        let consulted = std::mem::take(&mut self.consulted);
        if charged != consulted {
            return Err(Error::internal(format!(
                "frame of '{}' reserves temporaries for {:?} but code uses {:?}",
                name, charged, consulted
            )));
        }
        debug!("wrote '{}' with a {}-byte frame", name, frame.frame_size());
        self.frames.push(frame);
        Ok(())
    }

    /// Bind an argument at `offset`; returns the next argument's offset
    fn declare_argument(&mut self, argument: NodeId, offset: i32) -> Result<i32> {
        let ast = self.ast;
        let ty = self.type_of(argument)?;
        if let NodeKind::VariableDeclaration { identifiers, .. } = ast.kind(argument) {
            for name in identifiers {
                let mut symbol = Symbol::variable(name.clone(), Qualifier::Private, ty.clone(), ast.span(argument));
                symbol.offset = offset;
                symbol.defined = true;
                self.symbols.define(symbol);
            }
        }
        Ok(offset + ty.size() as i32)
    }

    fn local_declaration(&mut self, id: NodeId) -> Result<()> {
        let ast = self.ast;
        let (identifiers, initializer) = match ast.kind(id) {
            NodeKind::VariableDeclaration { identifiers, initializer, .. } => (identifiers, *initializer),
            other => return Err(Error::internal(format!("{:?} is not a variable declaration", other))),
        };
        let ty = self.type_of(id)?;
        let offset = {
            let context = self
                .function
                .as_mut()
                .ok_or_else(|| Error::internal("local declaration outside of a function"))?;
            context.local_cursor -= ty.size() as i32;
            context.local_cursor
        };

        if let Some(init) = initializer {
            self.value(init)?;
            let source = self.type_of(init)?;
            self.store(&ty, &source, &Base::Frame(offset), 0)?;
        }

        for (index, name) in identifiers.iter().enumerate() {
            let (component, at) = if identifiers.len() == 1 {
                (ty.clone(), 0)
            } else {
                (ty.components()[index].clone(), ty.component_offset(index + 1).unwrap_or(0))
            };
            trace!("local '{}': {} at {}", name, component, offset + at as i32);
            let mut symbol = Symbol::variable(name.clone(), Qualifier::Private, component, ast.span(id));
            symbol.offset = offset + at as i32;
            symbol.defined = true;
            self.symbols.define(symbol);
        }
        Ok(())
    }

    // ==================== Statements ====================

    fn block(&mut self, id: NodeId) -> Result<()> {
        let ast = self.ast;
        let (declarations, instructions) = match ast.kind(id) {
            NodeKind::Block { declarations, instructions } => (declarations, instructions),
            other => return Err(Error::internal(format!("{:?} is not a block", other))),
        };
        self.in_scope(|writer| {
            for &declaration in declarations {
                writer.local_declaration(declaration)?;
            }
            for &instruction in instructions {
                writer.statement(instruction)?;
            }
            Ok(())
        })
    }

    fn statement(&mut self, id: NodeId) -> Result<()> {
        let ast = self.ast;
        match ast.kind(id) {
            NodeKind::Block { .. } => self.block(id)?,
            NodeKind::Evaluation { expression } => {
                self.value(*expression)?;
                let size = self.type_of(*expression)?.size();
                self.trash(size);
            }
            NodeKind::Write { arguments, newline } => {
                for &argument in arguments {
                    self.value(argument)?;
                    let ty = self.type_of(argument)?;
                    for leaf in ty.leaves() {
                        let (helper, size) = match leaf {
                            Type::Double => ("printd", leaf.size()),
                            Type::String => ("prints", leaf.size()),
                            _ => ("printi", leaf.size()),
                        };
                        self.call_helper(helper);
                        self.trash(size);
                    }
                }
                if *newline {
                    self.call_helper("println");
                }
            }
            NodeKind::If { condition, then_block } => {
                let end = self.new_label();
                self.value(*condition)?;
                self.emit(Instr::Jz(end.clone()));
                self.statement(*then_block)?;
                self.emit(Instr::Label(end));
            }
            NodeKind::IfElse { condition, then_block, else_block } => {
                let otherwise = self.new_label();
                let end = self.new_label();
                self.value(*condition)?;
                self.emit(Instr::Jz(otherwise.clone()));
                self.statement(*then_block)?;
                self.emit(Instr::Jmp(end.clone()));
                self.emit(Instr::Label(otherwise));
                self.statement(*else_block)?;
                self.emit(Instr::Label(end));
            }
            NodeKind::For { initializers, condition, increments, body } => {
                self.for_loop(id, initializers, *condition, increments, *body)?
            }
            NodeKind::Break => {
                let end = self
                    .loops
                    .last()
                    .map(|l| l.end.clone())
                    .ok_or_else(|| Error::internal("'break' outside of a loop"))?;
                self.emit(Instr::Jmp(end));
            }
            NodeKind::Continue => {
                let increment = self
                    .loops
                    .last()
                    .map(|l| l.increment.clone())
                    .ok_or_else(|| Error::internal("'continue' outside of a loop"))?;
                self.emit(Instr::Jmp(increment));
            }
            NodeKind::Return { value } => self.return_statement(*value)?,
            other => return Err(Error::internal(format!("{:?} is not a statement", other))),
        }
        Ok(())
    }

    fn for_loop(
        &mut self,
        id: NodeId,
        initializers: &[NodeId],
        condition: Option<NodeId>,
        increments: &[NodeId],
        body: NodeId,
    ) -> Result<()> {
        self.in_scope(|writer| {
            for &initializer in initializers {
                let ast = writer.ast;
                if matches!(ast.kind(initializer), NodeKind::VariableDeclaration { .. }) {
                    writer.local_declaration(initializer)?;
                } else {
                    writer.value(initializer)?;
                    let size = writer.type_of(initializer)?.size();
                    writer.trash(size);
                }
            }

            let top = writer.new_label();
            let labels = LoopLabels {
                increment: writer.new_label(),
                end: writer.new_label(),
            };
            writer.emit(Instr::Label(top.clone()));
            if let Some(condition) = condition {
                writer.value(condition)?;
                if protocol::loop_condition_charge(writer.types, Some(condition))?.is_some() {
                    // keep the last component, drop the rest of the tuple
                    let size = writer.type_of(condition)?.size();
                    let slot = writer.temp_slot(id)?;
                    writer.emit(Instr::Sp);
                    writer.emit(Instr::Int((size - WORD_SIZE) as i32));
                    writer.emit(Instr::Add);
                    writer.emit(Instr::LdInt);
                    writer.emit(Instr::Local(slot));
                    writer.emit(Instr::StInt);
                    writer.emit(Instr::Trash(size));
                    writer.emit(Instr::Local(slot));
                    writer.emit(Instr::LdInt);
                }
                writer.emit(Instr::Jz(labels.end.clone()));
            }

            writer.loops.push(labels.clone());
            let result = writer.statement(body);
            writer.loops.pop();
            result?;

            writer.emit(Instr::Label(labels.increment));
            for &increment in increments {
                writer.value(increment)?;
                let size = writer.type_of(increment)?.size();
                writer.trash(size);
            }
            writer.emit(Instr::Jmp(top));
            writer.emit(Instr::Label(labels.end));
            Ok(())
        })
    }

    fn return_statement(&mut self, value: Option<NodeId>) -> Result<()> {
        if let Some(value) = value {
            let return_type = self.context()?.return_type.clone();
            let source = self.type_of(value)?;
            match &return_type {
                Type::Struct(_) => {
                    let slot = self.context()?.frame.return_temp_offset();
                    self.emit(Instr::Local(ARGUMENTS_OFFSET));
                    self.emit(Instr::LdInt);
                    self.emit(Instr::Local(slot));
                    self.emit(Instr::StInt);
                    self.value(value)?;
                    self.store(&return_type, &source, &Base::Pinned(slot), 0)?;
                }
                Type::Double => {
                    self.value(value)?;
                    if source == Type::Int {
                        self.emit(Instr::I2D);
                    }
                    self.emit(Instr::StFval64);
                }
                _ => {
                    self.value(value)?;
                    self.emit(Instr::StFval32);
                }
            }
        }
        self.emit(Instr::Leave);
        self.emit(Instr::Ret);
        Ok(())
    }

    // ==================== Expressions ====================

    fn value(&mut self, id: NodeId) -> Result<()> {
        match self.expr(id, EvalMode::Value)? {
            Produced::Value => Ok(()),
            Produced::Address => Err(Error::internal(format!("node {} produced an address for a value", id))),
        }
    }

    fn address(&mut self, id: NodeId) -> Result<()> {
        match self.expr(id, EvalMode::Address)? {
            Produced::Address => Ok(()),
            Produced::Value => Err(Error::internal(format!("node {} produced a value for an address", id))),
        }
    }

    fn expr(&mut self, id: NodeId, mode: EvalMode) -> Result<Produced> {
        let ast = self.ast;
        let slot = match protocol::temp_charge(ast, self.types, id, mode)? {
            Some(_) => Some(self.temp_slot(id)?),
            None => None,
        };
        let ty = self.type_of(id)?;

        match ast.kind(id) {
            NodeKind::Integer { value } => self.emit(Instr::Int(*value)),
            NodeKind::Double { value } => self.emit(Instr::Double(*value)),
            NodeKind::Str { value } => {
                let label = self.new_label();
                self.emit(Instr::Rodata);
                self.emit(Instr::Align);
                self.emit(Instr::Label(label.clone()));
                self.emit(Instr::SString(value.clone()));
                self.emit(Instr::Text);
                self.emit(Instr::Addr(label));
            }
            NodeKind::Nullptr => self.emit(Instr::Int(0)),
            NodeKind::Input => {
                if ty == Type::Double {
                    self.call_helper("readd");
                    self.emit(Instr::LdFval64);
                } else {
                    self.call_helper("readi");
                    self.emit(Instr::LdFval32);
                }
            }

            NodeKind::Variable { name } => {
                let symbol = self
                    .symbols
                    .lookup(name)
                    .ok_or_else(|| Error::internal(format!("'{}' has no storage", name)))?;
                let symbol = self.symbols.get(symbol);
                let instr = if symbol.is_global() {
                    Instr::Addr(self.label_of(symbol))
                } else {
                    Instr::Local(symbol.offset)
                };
                self.emit(instr);
                return Ok(Produced::Address);
            }
            NodeKind::PointerIndex { base, index } => {
                let step = self.type_of(*base)?.pointer_step();
                self.value(*base)?;
                self.value(*index)?;
                self.emit(Instr::Int(step as i32));
                self.emit(Instr::Mul);
                self.emit(Instr::Add);
                return Ok(Produced::Address);
            }
            NodeKind::TupleIndex { base, index } => {
                let offset = self
                    .type_of(*base)?
                    .component_offset(*index as usize)
                    .ok_or_else(|| Error::internal(format!("bad component {} of node {}", index, base)))?;
                self.address(*base)?;
                self.add_offset(offset);
                return Ok(Produced::Address);
            }

            NodeKind::Rvalue { lvalue } => {
                self.address(*lvalue)?;
                match (&ty, mode) {
                    (Type::Struct(_), EvalMode::Address) => return Ok(Produced::Address),
                    (Type::Struct(_), EvalMode::Value) => {
                        let slot = slot.ok_or_else(|| Error::internal(format!("rvalue {} has no pin slot", id)))?;
                        self.emit(Instr::Local(slot));
                        self.emit(Instr::StInt);
                        self.load(&ty, &Base::Pinned(slot))?;
                    }
                    (Type::Double, _) => self.emit(Instr::LdDouble),
                    _ => self.emit(Instr::LdInt),
                }
            }

            NodeKind::Assignment { lvalue, rvalue } => {
                self.value(*rvalue)?;
                if ty == Type::Double && self.type_of(*rvalue)? == Type::Int {
                    self.emit(Instr::I2D);
                }
                self.emit(if ty == Type::Double { Instr::Dup64 } else { Instr::Dup32 });
                self.store(&ty, &ty, &Base::Lvalue(*lvalue), 0)?;
            }

            NodeKind::Unary { op, argument } => {
                self.value(*argument)?;
                match op {
                    UnaryOp::Neg if ty == Type::Double => self.emit(Instr::DNeg),
                    UnaryOp::Neg => self.emit(Instr::Neg),
                    UnaryOp::Identity => {}
                    UnaryOp::Not => {
                        self.emit(Instr::Int(0));
                        self.emit(Instr::Eq);
                    }
                }
            }
            NodeKind::Binary { op, left, right } => self.binary(*op, *left, *right, &ty)?,

            NodeKind::AddressOf { lvalue } => self.address(*lvalue)?,
            NodeKind::StackAlloc { count } => {
                self.value(*count)?;
                self.emit(Instr::Int(ty.pointer_step() as i32));
                self.emit(Instr::Mul);
                self.emit(Instr::Alloc);
                self.emit(Instr::Sp);
            }
            NodeKind::Sizeof { expression } => {
                let size = self.type_of(*expression)?.size();
                self.emit(Instr::Int(size as i32));
            }

            NodeKind::Tuple { elements } if elements.len() == 1 => return self.expr(elements[0], mode),
            NodeKind::Tuple { elements } => match slot {
                Some(slot) => {
                    for (index, &element) in elements.iter().enumerate() {
                        self.value(element)?;
                        let source = self.type_of(element)?;
                        let target = ty.components()[index].clone();
                        let at = ty.component_offset(index + 1).unwrap_or(0);
                        self.store(&target, &source, &Base::Frame(slot), at)?;
                    }
                    self.emit(Instr::Local(slot));
                    return Ok(Produced::Address);
                }
                None => {
                    for &element in elements.iter().rev() {
                        self.value(element)?;
                    }
                }
            },

            NodeKind::FunctionCall { name, arguments } => return self.call(name, arguments, &ty, mode),

            other => return Err(Error::internal(format!("{:?} is not an expression", other))),
        }
        Ok(Produced::Value)
    }

    /// Evaluate both operands, widening ints when `wide` is double
    fn operands(&mut self, left: NodeId, right: NodeId, wide: &Type) -> Result<()> {
        for operand in [left, right] {
            self.value(operand)?;
            if *wide == Type::Double && self.type_of(operand)? == Type::Int {
                self.emit(Instr::I2D);
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId, ty: &Type) -> Result<()> {
        let lt = self.type_of(left)?;
        let rt = self.type_of(right)?;

        match op {
            BinaryOp::And | BinaryOp::Or => {
                let end = self.new_label();
                self.value(left)?;
                self.emit(Instr::Dup32);
                self.emit(if op == BinaryOp::And { Instr::Jz(end.clone()) } else { Instr::Jnz(end.clone()) });
                self.value(right)?;
                self.emit(if op == BinaryOp::And { Instr::And } else { Instr::Or });
                self.emit(Instr::Label(end));
            }
            BinaryOp::Add | BinaryOp::Sub if lt.is_pointer() || rt.is_pointer() => {
                self.pointer_arithmetic(op, left, right, &lt, &rt)?
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                self.operands(left, right, ty)?;
                let double = *ty == Type::Double;
                self.emit(match op {
                    BinaryOp::Add if double => Instr::DAdd,
                    BinaryOp::Sub if double => Instr::DSub,
                    BinaryOp::Mul if double => Instr::DMul,
                    BinaryOp::Div if double => Instr::DDiv,
                    BinaryOp::Add => Instr::Add,
                    BinaryOp::Sub => Instr::Sub,
                    BinaryOp::Mul => Instr::Mul,
                    BinaryOp::Div => Instr::Div,
                    _ => Instr::Mod,
                });
            }
            _ => {
                let wide = if lt == Type::Double || rt == Type::Double { Type::Double } else { Type::Int };
                self.operands(left, right, &wide)?;
                if wide == Type::Double {
                    self.emit(Instr::DCmp);
                    self.emit(Instr::Int(0));
                }
                self.emit(match op {
                    BinaryOp::Lt => Instr::Lt,
                    BinaryOp::Le => Instr::Le,
                    BinaryOp::Ge => Instr::Ge,
                    BinaryOp::Gt => Instr::Gt,
                    BinaryOp::Eq => Instr::Eq,
                    _ => Instr::Ne,
                });
            }
        }
        Ok(())
    }

    fn pointer_arithmetic(&mut self, op: BinaryOp, left: NodeId, right: NodeId, lt: &Type, rt: &Type) -> Result<()> {
        match (lt.is_pointer(), rt.is_pointer()) {
            (true, true) => {
                self.value(left)?;
                self.value(right)?;
                self.emit(Instr::Sub);
            }
            (true, false) => {
                self.value(left)?;
                self.value(right)?;
                self.emit(Instr::Int(lt.pointer_step() as i32));
                self.emit(Instr::Mul);
                self.emit(if op == BinaryOp::Add { Instr::Add } else { Instr::Sub });
            }
            _ => {
                return Err(Error::internal(format!("pointer arithmetic on {} and {}", lt, rt)));
            }
        }
        Ok(())
    }

    fn call(&mut self, name: &str, arguments: &[NodeId], ty: &Type, mode: EvalMode) -> Result<Produced> {
        let symbol = self
            .symbols
            .lookup(name)
            .ok_or_else(|| Error::internal(format!("call to unknown function '{}'", name)))?;
        let (label, params) = {
            let symbol = self.symbols.get(symbol);
            (self.label_of(symbol), symbol.params().to_vec())
        };

        let mut bytes = 0;
        for (&argument, param) in arguments.iter().zip(&params).rev() {
            self.value(argument)?;
            if *param == Type::Double && self.type_of(argument)? == Type::Int {
                self.emit(Instr::I2D);
            }
            bytes += param.size();
        }
        let result = if ty.is_struct() {
            let offset = self.context()?.frame.call_temp_offset();
            self.emit(Instr::Local(offset));
            bytes += WORD_SIZE;
            Some(offset)
        } else {
            None
        };

        self.emit(Instr::Call(label));
        self.trash(bytes);

        match (ty, result) {
            (Type::Void, _) => {}
            (Type::Double, _) => self.emit(Instr::LdFval64),
            (Type::Struct(_), Some(offset)) => match mode {
                EvalMode::Address => {
                    self.emit(Instr::Local(offset));
                    return Ok(Produced::Address);
                }
                EvalMode::Value => self.load(ty, &Base::Frame(offset))?,
            },
            _ => self.emit(Instr::LdFval32),
        }
        Ok(Produced::Value)
    }
}

/// Elements of a literal tuple, looking through single-element wrappers
fn literal_elements(ast: &Ast, id: NodeId) -> Result<Vec<NodeId>> {
    match ast.kind(id) {
        NodeKind::Tuple { elements } if elements.len() == 1 => literal_elements(ast, elements[0]),
        NodeKind::Tuple { elements } => Ok(elements.clone()),
        other => Err(Error::internal(format!("{:?} is not a literal tuple", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::postfix::PostfixBuffer;
    use crate::frontend::ast::AstBuilder;
    use crate::frontend::semantic;
    use pretty_assertions::assert_eq;

    fn generate(b: AstBuilder, root: NodeId, config: &CodegenConfig) -> Result<(Vec<String>, Vec<FrameLayout>)> {
        let ast = b.finish(root)?;
        let (types, symbols) = semantic::check(&ast)?;
        let mut buffer = PostfixBuffer::new();
        let frames = PostfixWriter::new(&ast, &types, symbols, config, &mut buffer).write_program()?;
        Ok((buffer.instructions().iter().map(ToString::to_string).collect(), frames))
    }

    fn lines(expected: &[&str]) -> Vec<String> {
        expected.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_write_tuple_local() {
        // func main(): int { auto t = 1, 2.0; write t; return 0; }
        let mut b = AstBuilder::new();
        let one = b.int(1);
        let two = b.double(2.0);
        let pair = b.tuple(vec![one, two]);
        let t = b.declare(Qualifier::Private, Type::Unspec, &["t"], Some(pair));
        let read = b.read("t");
        let write = b.write(vec![read], false);
        let zero = b.int(0);
        let ret = b.ret(Some(zero));
        let body = b.block(vec![t], vec![write, ret]);
        let main = b.function(Qualifier::Public, Type::Int, "main", vec![], body);
        let root = b.program(vec![main]);

        let config = CodegenConfig { entry_point: "main".into(), ..CodegenConfig::default() };
        let (listing, frames) = generate(b, root, &config).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "TEXT", "ALIGN", "GLOBAL _main, FUNC", "LABEL _main", "ENTER 16",
                // t = 1, 2.0
                "DOUBLE 2.0", "INT 1", "LOCAL -12", "STINT", "LOCAL -8", "STDOUBLE",
                // write t
                "LOCAL -12", "LOCAL -16", "STINT",
                "LOCAL -16", "LDINT", "INT 4", "ADD", "LDDOUBLE",
                "LOCAL -16", "LDINT", "LDINT",
                "CALL printi", "TRASH 4", "CALL printd", "TRASH 8",
                // return 0
                "INT 0", "STFVAL32", "LEAVE", "RET",
                "EXTERN printd", "EXTERN printi",
            ])
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].local_size, 12);
        assert_eq!(frames[0].frame_size(), 16);
    }

    #[test]
    fn test_struct_return_and_call() {
        let mut b = AstBuilder::new();
        let one = b.int(1);
        let two = b.int(2);
        let pair = b.tuple(vec![one, two]);
        let ret = b.ret(Some(pair));
        let body = b.block(vec![], vec![ret]);
        let make = b.function(Qualifier::Private, Type::Unspec, "pair", vec![], body);

        let call = b.call("pair", vec![]);
        let p = b.declare(Qualifier::Private, Type::Unspec, &["p"], Some(call));
        let var = b.var("p");
        let second = b.tuple_index(var, 2);
        let value = b.rvalue(second);
        let ret = b.ret(Some(value));
        let body = b.block(vec![p], vec![ret]);
        let main = b.function(Qualifier::Public, Type::Int, "og", vec![], body);
        let root = b.program(vec![make, main]);

        let (listing, frames) = generate(b, root, &CodegenConfig::default()).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "TEXT", "ALIGN", "LABEL pair", "ENTER 4",
                "LOCAL 8", "LDINT", "LOCAL -4", "STINT",
                "INT 2", "INT 1",
                "LOCAL -4", "LDINT", "STINT",
                "LOCAL -4", "LDINT", "INT 4", "ADD", "STINT",
                "LEAVE", "RET",
                "TEXT", "ALIGN", "GLOBAL _main, FUNC", "LABEL _main", "ENTER 16",
                "LOCAL -16", "CALL pair", "TRASH 4",
                "LOCAL -12", "LDINT", "LOCAL -16", "LDINT",
                "LOCAL -8", "STINT", "LOCAL -4", "STINT",
                "LOCAL -8", "INT 4", "ADD", "LDINT", "STFVAL32",
                "LEAVE", "RET",
            ])
        );
        assert_eq!(frames[0].return_temp_size, 4);
        assert_eq!(frames[1].call_temp_size, 8);
    }

    #[test]
    fn test_globals_and_externs() {
        let mut b = AstBuilder::new();
        let one = b.int(1);
        let hi = b.string("hi");
        let pair = b.tuple(vec![one, hi]);
        let ns = b.declare(Qualifier::Public, Type::Unspec, &["n", "s"], Some(pair));
        let three = b.int(3);
        let d = b.declare(Qualifier::Private, Type::Double, &["d"], Some(three));
        let h = b.declare(Qualifier::Private, Type::Double, &["h"], None);
        let ext = b.declare(Qualifier::External, Type::Int, &["ext"], None);

        let read = b.read("ext");
        let write = b.write(vec![read], true);
        let zero = b.int(0);
        let ret = b.ret(Some(zero));
        let body = b.block(vec![], vec![write, ret]);
        let main = b.function(Qualifier::Public, Type::Int, "og", vec![], body);
        let root = b.program(vec![ns, d, h, ext, main]);

        let (listing, _) = generate(b, root, &CodegenConfig::default()).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "DATA", "ALIGN", "GLOBAL n, OBJ", "LABEL n", "SINT 1",
                "RODATA", "ALIGN", "LABEL _L1", "SSTRING \"hi\"",
                "DATA", "ALIGN", "GLOBAL s, OBJ", "LABEL s", "SADDR _L1",
                "DATA", "ALIGN", "LABEL d", "SDOUBLE 3.0",
                "BSS", "ALIGN", "LABEL h", "SALLOC 8",
                "TEXT", "ALIGN", "GLOBAL _main, FUNC", "LABEL _main", "ENTER 0",
                "ADDR ext", "LDINT", "CALL printi", "TRASH 4", "CALL println",
                "INT 0", "STFVAL32", "LEAVE", "RET",
                "EXTERN ext", "EXTERN printi", "EXTERN println",
            ])
        );
    }

    #[test]
    fn test_entry_symbol_collision_and_undefined_function() {
        let mut b = AstBuilder::new();
        let decl = b.function_decl(Qualifier::Public, Type::Void, "ext_fn", vec![]);
        let body = b.block(vec![], vec![]);
        let clash = b.function(Qualifier::Private, Type::Void, "_main", vec![], body);
        let call = b.call("ext_fn", vec![]);
        let eval = b.eval(call);
        let zero = b.int(0);
        let ret = b.ret(Some(zero));
        let body = b.block(vec![], vec![eval, ret]);
        let main = b.function(Qualifier::Public, Type::Int, "og", vec![], body);
        let root = b.program(vec![decl, clash, main]);

        let (listing, _) = generate(b, root, &CodegenConfig::default()).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "TEXT", "ALIGN", "LABEL ._main", "ENTER 0", "LEAVE", "RET",
                "TEXT", "ALIGN", "GLOBAL _main, FUNC", "LABEL _main", "ENTER 0",
                "CALL ext_fn", "INT 0", "STFVAL32", "LEAVE", "RET",
                "EXTERN ext_fn",
            ])
        );
    }

    #[test]
    fn test_short_circuit_and_widening() {
        let mut b = AstBuilder::new();
        let x = b.arg(Type::Int, "x");
        let y = b.arg(Type::Double, "y");
        let rx = b.read("x");
        let zero = b.int(0);
        let positive = b.binary(BinaryOp::Gt, rx, zero);
        let ry = b.read("y");
        let rx = b.read("x");
        let bigger = b.binary(BinaryOp::Lt, rx, ry);
        let both = b.binary(BinaryOp::And, positive, bigger);
        let ret = b.ret(Some(both));
        let body = b.block(vec![], vec![ret]);
        let f = b.function(Qualifier::Private, Type::Int, "f", vec![x, y], body);
        let root = b.program(vec![f]);

        let (listing, _) = generate(b, root, &CodegenConfig::default()).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "TEXT", "ALIGN", "LABEL f", "ENTER 0",
                "LOCAL 8", "LDINT", "INT 0", "GT", "DUP32", "JZ _L1",
                "LOCAL 8", "LDINT", "I2D", "LOCAL 12", "LDDOUBLE", "DCMP", "INT 0", "LT",
                "AND", "LABEL _L1",
                "STFVAL32", "LEAVE", "RET",
            ])
        );
    }

    #[test]
    fn test_loop_labels_for_break_and_continue() {
        let mut b = AstBuilder::new();
        let zero = b.int(0);
        let i = b.declare(Qualifier::Private, Type::Int, &["i"], Some(zero));
        let ri = b.read("i");
        let ten = b.int(10);
        let cond = b.binary(BinaryOp::Lt, ri, ten);
        let lhs = b.var("i");
        let ri = b.read("i");
        let one = b.int(1);
        let next = b.binary(BinaryOp::Add, ri, one);
        let step = b.assign(lhs, next);
        let ri = b.read("i");
        let five = b.int(5);
        let done = b.binary(BinaryOp::Eq, ri, five);
        let brk = b.brk();
        let then = b.block(vec![], vec![brk]);
        let cont = b.cont();
        let otherwise = b.block(vec![], vec![cont]);
        let branch = b.if_else(done, then, otherwise);
        let body = b.block(vec![], vec![branch]);
        let lp = b.for_loop(vec![i], Some(cond), vec![step], body);
        let fbody = b.block(vec![], vec![lp]);
        let f = b.function(Qualifier::Private, Type::Void, "f", vec![], fbody);
        let root = b.program(vec![f]);

        let (listing, frames) = generate(b, root, &CodegenConfig::default()).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "TEXT", "ALIGN", "LABEL f", "ENTER 4",
                "INT 0", "LOCAL -4", "STINT",
                "LABEL _L1",
                "LOCAL -4", "LDINT", "INT 10", "LT", "JZ _L3",
                "LOCAL -4", "LDINT", "INT 5", "EQ", "JZ _L4",
                "JMP _L3", "JMP _L5",
                "LABEL _L4", "JMP _L2", "LABEL _L5",
                "LABEL _L2",
                "LOCAL -4", "LDINT", "INT 1", "ADD", "DUP32", "LOCAL -4", "STINT", "TRASH 4",
                "JMP _L1", "LABEL _L3",
                "LEAVE", "RET",
            ])
        );
        assert_eq!(frames[0].local_size, 4);
    }

    #[test]
    fn test_pointer_scaling_allocation_and_input() {
        // double *p = [3]; double d = input; double *q = p + 2; q[1] = d;
        let mut b = AstBuilder::new();
        let three = b.int(3);
        let alloc = b.stack_alloc(three);
        let p = b.declare(Qualifier::Private, Type::pointer(Type::Double), &["p"], Some(alloc));
        let input = b.input();
        let d = b.declare(Qualifier::Private, Type::Double, &["d"], Some(input));
        let rp = b.read("p");
        let two = b.int(2);
        let moved = b.binary(BinaryOp::Add, rp, two);
        let q = b.declare(Qualifier::Private, Type::pointer(Type::Double), &["q"], Some(moved));
        let rq = b.read("q");
        let one = b.int(1);
        let slot = b.pointer_index(rq, one);
        let rd = b.read("d");
        let store = b.assign(slot, rd);
        let eval = b.eval(store);
        let zero = b.int(0);
        let ret = b.ret(Some(zero));
        let body = b.block(vec![p, d, q], vec![eval, ret]);
        let main = b.function(Qualifier::Public, Type::Int, "og", vec![], body);
        let root = b.program(vec![main]);

        let (listing, frames) = generate(b, root, &CodegenConfig::default()).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "TEXT", "ALIGN", "GLOBAL _main, FUNC", "LABEL _main", "ENTER 16",
                "INT 3", "INT 8", "MUL", "ALLOC", "SP", "LOCAL -4", "STINT",
                // input read as a double, no widening
                "CALL readd", "LDFVAL64", "LOCAL -12", "STDOUBLE",
                "LOCAL -4", "LDINT", "INT 2", "INT 8", "MUL", "ADD", "LOCAL -16", "STINT",
                "LOCAL -12", "LDDOUBLE", "DUP64",
                "LOCAL -16", "LDINT", "INT 1", "INT 8", "MUL", "ADD", "STDOUBLE", "TRASH 8",
                "INT 0", "STFVAL32", "LEAVE", "RET",
                "EXTERN readd",
            ])
        );
        assert_eq!(frames[0].local_size, 16);
    }

    #[test]
    fn test_call_arguments_pushed_last_first() {
        let mut b = AstBuilder::new();
        let a = b.arg(Type::Int, "a");
        let x = b.arg(Type::Double, "x");
        let rx = b.read("x");
        let ret = b.ret(Some(rx));
        let body = b.block(vec![], vec![ret]);
        let f = b.function(Qualifier::Private, Type::Double, "f", vec![a, x], body);

        let one = b.int(1);
        let two = b.int(2);
        let call = b.call("f", vec![one, two]);
        let eval = b.eval(call);
        let zero = b.int(0);
        let ret = b.ret(Some(zero));
        let body = b.block(vec![], vec![eval, ret]);
        let main = b.function(Qualifier::Public, Type::Int, "og", vec![], body);
        let root = b.program(vec![f, main]);

        let (listing, _) = generate(b, root, &CodegenConfig::default()).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "TEXT", "ALIGN", "LABEL f", "ENTER 0",
                "LOCAL 12", "LDDOUBLE", "STFVAL64", "LEAVE", "RET",
                "TEXT", "ALIGN", "GLOBAL _main, FUNC", "LABEL _main", "ENTER 0",
                "INT 2", "I2D", "INT 1", "CALL f", "TRASH 12", "LDFVAL64", "TRASH 8",
                "INT 0", "STFVAL32", "LEAVE", "RET",
            ])
        );
    }

    #[test]
    fn test_tuple_loop_condition_tests_last_component() {
        // for (; 1, 0; ) break;
        let mut b = AstBuilder::new();
        let one = b.int(1);
        let zero = b.int(0);
        let cond = b.tuple(vec![one, zero]);
        let brk = b.brk();
        let body = b.block(vec![], vec![brk]);
        let lp = b.for_loop(vec![], Some(cond), vec![], body);
        let fbody = b.block(vec![], vec![lp]);
        let f = b.function(Qualifier::Private, Type::Void, "f", vec![], fbody);
        let root = b.program(vec![f]);

        let (listing, frames) = generate(b, root, &CodegenConfig::default()).unwrap();
        assert_eq!(
            listing,
            lines(&[
                "TEXT", "ALIGN", "LABEL f", "ENTER 4",
                "LABEL _L1",
                "INT 0", "INT 1",
                "SP", "INT 4", "ADD", "LDINT", "LOCAL -4", "STINT",
                "TRASH 8", "LOCAL -4", "LDINT", "JZ _L3",
                "JMP _L3",
                "LABEL _L2", "JMP _L1", "LABEL _L3",
                "LEAVE", "RET",
            ])
        );
        assert_eq!(frames[0].temp_offset(lp), Some(-4));
    }
}
