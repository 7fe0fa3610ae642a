use log::{debug, trace};

use crate::compiler::ast::{
    AstKind, AstNode, BinaryOp, InitializerKind, UnaryOp,
};
use crate::compiler::const_eval::{self, Environment};
use crate::compiler::const_pool::ConstPool;
use crate::compiler::error::CompilerError;
use crate::compiler::symbol_table::{
    ScopeId, StorageKind, SymbolEntry, SymbolKind, SymbolTable,
};
use crate::compiler::type_table::{TypeId, TypeKind, TypeTable};
use crate::tac::{
    Block, Instruction, Label, Operand, Purity, TacData, TacFunction,
    TacProgram, TacSection, TacOp, TempId,
};
use crate::values::Value;

/// Lowers the resolved tree into sections of data entries and
/// basic-block functions. Top-level statements of the root module
/// become the entry function unless the source already defines `main`.
pub struct TacEmitter<'a> {
    symbols: &'a SymbolTable,
    types: &'a TypeTable,
    pool: &'a ConstPool,
    // per-function state
    next_temp: TempId,
    next_label: Label,
    blocks: Vec<Block>,
    current: Vec<Instruction>,
    current_label: Label,
    impure: bool,
    calls: Vec<String>,
}

pub fn emit_program(
    main: &AstNode,
    symbols: &SymbolTable,
    types: &TypeTable,
    pool: &ConstPool,
) -> Result<TacProgram, CompilerError> {
    let mut emitter = TacEmitter {
        symbols,
        types,
        pool,
        next_temp: 0,
        next_label: 0,
        blocks: Vec::new(),
        current: Vec::new(),
        current_label: 0,
        impure: false,
        calls: Vec::new(),
    };
    emitter.program(main)
}

impl<'a> TacEmitter<'a> {
    fn program(
        &mut self,
        main: &AstNode,
    ) -> Result<TacProgram, CompilerError> {
        let mut program = TacProgram::default();
        let AstKind::Main { modules } = &main.kind else {
            return Ok(program);
        };
        let mut banks = Vec::new();
        for (index, module) in modules.iter().enumerate() {
            let AstKind::Module { name, decls } = &module.kind else {
                continue;
            };
            let mut section = TacSection {
                index: index as u32,
                name: name.clone(),
                annotation: None,
                data: Vec::new(),
                functions: Vec::new(),
            };
            let mut entry_stmts: Vec<&AstNode> = Vec::new();
            let mut has_main = false;
            for decl in decls {
                match &decl.kind {
                    AstKind::Fn { name: fn_name, .. } => {
                        has_main = has_main || fn_name == "main";
                        section.functions.push(self.function(decl)?);
                    }
                    AstKind::VarDecl { .. }
                    | AstKind::VarInit { .. }
                    | AstKind::ConstDecl { .. } => {
                        if let Some(runtime_init) =
                            self.global(decl, &mut section.data)
                        {
                            entry_stmts.push(runtime_init);
                        }
                    }
                    AstKind::Bank { annotation, decls } => {
                        banks.push((
                            name.clone(),
                            decl.scope,
                            annotation.clone(),
                            decls,
                        ));
                    }
                    AstKind::TypeDecl { .. }
                    | AstKind::EnumDecl { .. }
                    | AstKind::Ext { .. }
                    | AstKind::Import { .. } => {}
                    _ => entry_stmts.push(decl),
                }
            }
            if index == 0 && !has_main {
                let entry = self.entry_function(
                    name.clone(),
                    module.scope,
                    &entry_stmts,
                )?;
                section.functions.push(entry);
            } else if !entry_stmts.is_empty() {
                // Runtime global initialisers only have somewhere to
                // run when this module provides the entry flow.
                return Err(CompilerError::UnsupportedOperation(
                    "global initialisers that run at startup cannot be \
                     combined with an explicit 'main' function"
                        .into(),
                ));
            }
            program.sections.push(section);
        }

        for (module, scope, annotation, decls) in banks {
            let bank = self.symbols.scope(scope).bank;
            let mut section = TacSection {
                index: program.sections.len() as u32,
                name: format!("{module}_bank{bank}"),
                annotation: Some(annotation),
                data: Vec::new(),
                functions: Vec::new(),
            };
            for decl in decls {
                match &decl.kind {
                    AstKind::Fn { .. } => {
                        section.functions.push(self.function(decl)?);
                    }
                    AstKind::VarDecl { .. }
                    | AstKind::VarInit { .. }
                    | AstKind::ConstDecl { .. } => {
                        self.global(decl, &mut section.data);
                    }
                    _ => {}
                }
            }
            program.sections.push(section);
        }
        debug!(
            "lowered {} sections to three-address form",
            program.sections.len()
        );
        Ok(program)
    }

    /// Registers a module-level declaration as a data entry. Returns
    /// the declaration again when its initialiser needs to run at
    /// startup rather than fold into the image.
    fn global<'n>(
        &mut self,
        node: &'n AstNode,
        data: &mut Vec<TacData>,
    ) -> Option<&'n AstNode> {
        let (name, constant, init) = match &node.kind {
            AstKind::VarDecl { name, .. } => (name, false, None),
            AstKind::VarInit { name, expr, .. } => {
                (name, false, Some(expr.as_ref()))
            }
            AstKind::ConstDecl { name, expr, .. } => {
                (name, true, Some(expr.as_ref()))
            }
            _ => return None,
        };
        let entry = self.symbols.get(node.scope, name)?;
        let value = init.and_then(|expr| {
            const_eval::evaluate(
                expr,
                &Environment::new(),
                self.pool,
                self.symbols,
            )
            .ok()
        });
        let needs_runtime_init = !constant && init.is_some() && value.is_none();
        data.push(TacData {
            module: self.symbols.module_name_from(entry.scope),
            name: name.clone(),
            type_id: entry.type_id,
            size: self.types.get(entry.type_id).byte_size,
            element_count: entry.element_count,
            constant,
            value,
        });
        if needs_runtime_init { Some(node) } else { None }
    }

    fn begin_function(&mut self) {
        self.next_temp = 0;
        self.next_label = 0;
        self.blocks = Vec::new();
        self.current = Vec::new();
        self.current_label = 0;
        self.impure = false;
        self.calls = Vec::new();
        self.current_label = self.new_label();
    }

    fn finish_function(
        &mut self,
        name: String,
        scope: ScopeId,
    ) -> TacFunction {
        self.seal(None);
        let blocks = std::mem::take(&mut self.blocks);
        TacFunction {
            module: self.symbols.module_name_from(scope),
            name,
            bank: self.symbols.scope(scope).bank,
            scope,
            purity: if self.impure {
                Purity::Impure
            } else {
                Purity::Unknown
            },
            used: false,
            blocks,
            calls: std::mem::take(&mut self.calls),
        }
    }

    fn function(
        &mut self,
        node: &AstNode,
    ) -> Result<TacFunction, CompilerError> {
        let AstKind::Fn { name, body, .. } = &node.kind else {
            return Err(CompilerError::UnsupportedOperation(
                "expected a function".into(),
            ));
        };
        trace!("lowering fn {name}");
        self.begin_function();
        self.stmt(body)?;
        Ok(self.finish_function(name.clone(), node.scope))
    }

    fn entry_function(
        &mut self,
        module: String,
        scope: ScopeId,
        stmts: &[&AstNode],
    ) -> Result<TacFunction, CompilerError> {
        trace!("lowering entry flow for module {module}");
        self.begin_function();
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(self.finish_function("main".to_owned(), scope))
    }

    // ==< Block building >==

    fn new_label(&mut self) -> Label {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    fn new_temp(&mut self) -> Operand {
        let temp = self.next_temp;
        self.next_temp += 1;
        Operand::Temporary(temp)
    }

    fn push(&mut self, instruction: Instruction) {
        self.current.push(instruction);
    }

    fn seal(&mut self, branch: Option<Label>) {
        let instructions = std::mem::take(&mut self.current);
        self.blocks.push(Block {
            label: self.current_label,
            instructions,
            branch_target: branch,
            purity: Purity::Unknown,
            reachable: true,
        });
    }

    /// Ends the current block with a branching instruction; the
    /// following instructions fall into a fresh anonymous block.
    fn terminate(&mut self, instruction: Instruction, branch: Label) {
        self.push(instruction);
        self.seal(Some(branch));
        self.current_label = self.new_label();
    }

    /// Ends the current block and continues at the given label.
    fn start_block(&mut self, label: Label) {
        self.seal(None);
        self.current_label = label;
    }

    // ==< Statements >==

    fn stmt(&mut self, node: &AstNode) -> Result<(), CompilerError> {
        match &node.kind {
            AstKind::Error => {
                self.push(Instruction::Error);
                Ok(())
            }
            AstKind::Block { decls } => {
                for decl in decls {
                    self.stmt(decl)?;
                }
                Ok(())
            }
            AstKind::VarDecl { name, .. } => {
                self.lower_var_decl(node, name, None)
            }
            AstKind::VarInit { name, expr, .. } => {
                self.lower_var_decl(node, name, Some(expr.as_ref()))
            }
            // Constants fold into their uses; no code.
            AstKind::ConstDecl { .. } => Ok(()),
            AstKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let cond = self.expr(condition)?;
                let else_label = self.new_label();
                self.terminate(
                    Instruction::IfFalse {
                        cond,
                        target: else_label,
                    },
                    else_label,
                );
                self.stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    let end_label = self.new_label();
                    self.terminate(
                        Instruction::Goto { target: end_label },
                        end_label,
                    );
                    self.start_block(else_label);
                    self.stmt(else_branch)?;
                    self.start_block(end_label);
                } else {
                    self.start_block(else_label);
                }
                Ok(())
            }
            AstKind::While { condition, body } => {
                let head = self.new_label();
                let exit = self.new_label();
                self.start_block(head);
                let cond = self.expr(condition)?;
                self.terminate(
                    Instruction::IfFalse { cond, target: exit },
                    exit,
                );
                self.stmt(body)?;
                self.terminate(Instruction::Goto { target: head }, head);
                self.start_block(exit);
                Ok(())
            }
            AstKind::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                if let Some(initializer) = initializer {
                    self.stmt(initializer)?;
                }
                let head = self.new_label();
                let exit = self.new_label();
                self.start_block(head);
                if let Some(condition) = condition {
                    let cond = self.expr(condition)?;
                    self.terminate(
                        Instruction::IfFalse { cond, target: exit },
                        exit,
                    );
                }
                self.stmt(body)?;
                if let Some(increment) = increment {
                    self.expr(increment)?;
                }
                self.terminate(Instruction::Goto { target: head }, head);
                self.start_block(exit);
                Ok(())
            }
            AstKind::Return { value } | AstKind::Exit { value } => {
                let value = match value {
                    Some(expr) => self.expr(expr)?,
                    None => Operand::None,
                };
                let after = self.new_label();
                self.push(Instruction::Return { value });
                self.seal(None);
                self.current_label = after;
                Ok(())
            }
            AstKind::Asm { strings } => {
                self.impure = true;
                self.push(Instruction::Asm {
                    lines: strings.clone(),
                });
                Ok(())
            }
            AstKind::Assignment { lvalue, expr } => {
                self.assignment(lvalue, expr)?;
                Ok(())
            }
            // Reserved in the data model; nothing produces it.
            AstKind::DoWhile { .. } => Ok(()),
            AstKind::TypeDecl { .. }
            | AstKind::EnumDecl { .. }
            | AstKind::Ext { .. }
            | AstKind::Import { .. }
            | AstKind::Fn { .. }
            | AstKind::Bank { .. }
            | AstKind::Module { .. }
            | AstKind::Main { .. } => Ok(()),
            _ => {
                self.expr(node)?;
                Ok(())
            }
        }
    }

    fn lower_var_decl(
        &mut self,
        node: &AstNode,
        name: &str,
        init: Option<&AstNode>,
    ) -> Result<(), CompilerError> {
        let Some(entry) = self.symbols.get(node.scope, name) else {
            self.push(Instruction::Error);
            return Ok(());
        };
        let dest = self.variable_operand(&entry);
        let is_array = self.types.kind(entry.type_id) == TypeKind::Array;
        let is_static = entry.storage == StorageKind::Static;

        if is_array && !is_static {
            let total = self.array_byte_size(entry.type_id);
            self.push(Instruction::Init {
                dest: dest.clone(),
                value: Operand::Literal(Value::LitNum(total)),
            });
        }

        match init {
            None => {
                if !is_array && !is_static {
                    let default =
                        self.pool.get(crate::compiler::const_pool::ZERO_U8_INDEX);
                    self.push(Instruction::Init {
                        dest,
                        value: Operand::Literal(default.value.clone()),
                    });
                }
                Ok(())
            }
            Some(expr) => match &expr.kind {
                AstKind::Initializer { assignments, kind } => self
                    .lower_initializer(&entry, dest, assignments, *kind),
                _ => {
                    let value = self.expr(expr)?;
                    self.push(Instruction::Init { dest, value });
                    Ok(())
                }
            },
        }
    }

    fn lower_initializer(
        &mut self,
        entry: &SymbolEntry,
        dest: Operand,
        assignments: &[AstNode],
        kind: InitializerKind,
    ) -> Result<(), CompilerError> {
        match kind {
            InitializerKind::Array => {
                let element = self
                    .types
                    .get_parent(entry.type_id)
                    .unwrap_or(entry.type_id);
                let stride =
                    self.types.get(element).byte_size.max(1) as i64;
                for (i, item) in assignments.iter().enumerate() {
                    let base = self.array_base(entry, &dest);
                    let addr = self.offset_address(base, i as i64 * stride);
                    let value = self.expr(item)?;
                    self.push(Instruction::Store { addr, value });
                }
                Ok(())
            }
            InitializerKind::Record => {
                for assignment in assignments {
                    let AstKind::Param { name, value } = &assignment.kind
                    else {
                        continue;
                    };
                    let offset =
                        self.field_offset(entry.type_id, name).unwrap_or(0);
                    let base = self.new_temp();
                    self.push(Instruction::Copy {
                        dest: base.clone(),
                        op: TacOp::Ref,
                        lhs: dest.clone(),
                        rhs: Operand::None,
                    });
                    let addr = self.offset_address(base, offset);
                    let value = self.expr(value)?;
                    self.push(Instruction::Store { addr, value });
                }
                Ok(())
            }
        }
    }

    fn assignment(
        &mut self,
        lvalue: &AstNode,
        expr: &AstNode,
    ) -> Result<Operand, CompilerError> {
        match &lvalue.kind {
            AstKind::Lvalue { name, .. }
            | AstKind::Identifier { name, .. } => {
                let Some(entry) = self.symbols.get(lvalue.scope, name)
                else {
                    self.push(Instruction::Error);
                    return Ok(Operand::None);
                };
                if matches!(
                    entry.storage,
                    StorageKind::Static | StorageKind::External
                ) {
                    self.impure = true;
                }
                let value = self.expr(expr)?;
                let dest = self.variable_operand(&entry);
                self.push(Instruction::Copy {
                    dest: dest.clone(),
                    op: TacOp::None,
                    lhs: value,
                    rhs: Operand::None,
                });
                Ok(dest)
            }
            _ => {
                let addr = match self.address_of(lvalue)? {
                    Some(addr) => addr,
                    None => {
                        self.push(Instruction::Error);
                        return Ok(Operand::None);
                    }
                };
                let value = self.expr(expr)?;
                self.push(Instruction::Store { addr, value });
                Ok(Operand::None)
            }
        }
    }

    // ==< Expressions >==

    fn expr(&mut self, node: &AstNode) -> Result<Operand, CompilerError> {
        match &node.kind {
            AstKind::Error => {
                self.push(Instruction::Error);
                Ok(Operand::None)
            }
            AstKind::Literal { index } => {
                Ok(Operand::Literal(self.pool.get(*index).value.clone()))
            }
            AstKind::Identifier { name, .. }
            | AstKind::Lvalue { name, .. } => {
                let Some(entry) = self.symbols.get(node.scope, name) else {
                    self.push(Instruction::Error);
                    return Ok(Operand::None);
                };
                if entry.kind == SymbolKind::Constant
                    && let Some(index) = entry.constant_index
                {
                    return Ok(Operand::Literal(
                        self.pool.get(index).value.clone(),
                    ));
                }
                Ok(self.variable_operand(&entry))
            }
            AstKind::Unary { op, expr } => match op {
                UnaryOp::Neg => self.unary(TacOp::Neg, expr),
                UnaryOp::Not => self.unary(TacOp::Not, expr),
                UnaryOp::BitNot => self.unary(TacOp::BitNot, expr),
                UnaryOp::Ref => {
                    if let Some(addr) = self.address_of(expr)? {
                        Ok(addr)
                    } else {
                        self.unary(TacOp::Ref, expr)
                    }
                }
                UnaryOp::Deref => self.unary(TacOp::Deref, expr),
            },
            AstKind::Binary { op, left, right } => match op {
                BinaryOp::And | BinaryOp::Or => {
                    self.short_circuit(*op, left, right)
                }
                _ => {
                    let lhs = self.expr(left)?;
                    let rhs = self.expr(right)?;
                    let dest = self.new_temp();
                    self.push(Instruction::Copy {
                        dest: dest.clone(),
                        op: binary_op(*op),
                        lhs,
                        rhs,
                    });
                    Ok(dest)
                }
            },
            AstKind::Subscript { left, index } => {
                let base = self.expr(left)?;
                let idx = self.scaled_index(left, index)?;
                let dest = self.new_temp();
                self.push(Instruction::Copy {
                    dest: dest.clone(),
                    op: TacOp::IndexRead,
                    lhs: base,
                    rhs: idx,
                });
                Ok(dest)
            }
            AstKind::Dot { .. } => {
                let addr = match self.address_of(node)? {
                    Some(addr) => addr,
                    None => {
                        self.push(Instruction::Error);
                        return Ok(Operand::None);
                    }
                };
                let dest = self.new_temp();
                self.push(Instruction::Copy {
                    dest: dest.clone(),
                    op: TacOp::Deref,
                    lhs: addr,
                    rhs: Operand::None,
                });
                Ok(dest)
            }
            AstKind::Cast { expr, .. } => self.expr(expr),
            AstKind::Call { callee, args } => {
                if let AstKind::Identifier { name, .. } = &callee.kind {
                    match self.symbols.get(callee.scope, name) {
                        Some(entry)
                            if entry.kind == SymbolKind::Function =>
                        {
                            self.calls.push(name.clone());
                        }
                        _ => self.impure = true,
                    }
                } else {
                    self.impure = true;
                }
                let callee_op = self.expr(callee)?;
                let mut arg_ops = Vec::with_capacity(args.len());
                for arg in args {
                    arg_ops.push(self.expr(arg)?);
                }
                let dest = self.new_temp();
                self.push(Instruction::Call {
                    dest: dest.clone(),
                    callee: callee_op,
                    args: arg_ops,
                });
                Ok(dest)
            }
            AstKind::Assignment { lvalue, expr } => {
                self.assignment(lvalue, expr)
            }
            AstKind::Initializer { .. } => {
                self.push(Instruction::Error);
                Ok(Operand::None)
            }
            AstKind::Param { value, .. } => self.expr(value),
            _ => {
                self.push(Instruction::Error);
                Ok(Operand::None)
            }
        }
    }

    fn unary(
        &mut self,
        op: TacOp,
        expr: &AstNode,
    ) -> Result<Operand, CompilerError> {
        let operand = self.expr(expr)?;
        let dest = self.new_temp();
        self.push(Instruction::Copy {
            dest: dest.clone(),
            op,
            lhs: operand,
            rhs: Operand::None,
        });
        Ok(dest)
    }

    /// Lowers `&&`/`||` to control flow; the right operand only runs
    /// when the left does not already decide the result. Both arms
    /// write the same result temporary.
    fn short_circuit(
        &mut self,
        op: BinaryOp,
        left: &AstNode,
        right: &AstNode,
    ) -> Result<Operand, CompilerError> {
        let result = self.new_temp();
        let short = self.new_label();
        let end = self.new_label();
        let cond = self.expr(left)?;
        let (instruction, short_value) = match op {
            BinaryOp::And => (
                Instruction::IfFalse {
                    cond,
                    target: short,
                },
                Value::Bool(false),
            ),
            _ => (
                Instruction::IfTrue {
                    cond,
                    target: short,
                },
                Value::Bool(true),
            ),
        };
        self.terminate(instruction, short);
        let rhs = self.expr(right)?;
        self.push(Instruction::Copy {
            dest: result.clone(),
            op: TacOp::None,
            lhs: rhs,
            rhs: Operand::None,
        });
        self.terminate(Instruction::Goto { target: end }, end);
        self.start_block(short);
        self.push(Instruction::Copy {
            dest: result.clone(),
            op: TacOp::None,
            lhs: Operand::Literal(short_value),
            rhs: Operand::None,
        });
        self.start_block(end);
        Ok(result)
    }

    /// Address of an assignable place, when one exists.
    fn address_of(
        &mut self,
        node: &AstNode,
    ) -> Result<Option<Operand>, CompilerError> {
        match &node.kind {
            AstKind::Identifier { name, .. }
            | AstKind::Lvalue { name, .. } => {
                let Some(entry) = self.symbols.get(node.scope, name) else {
                    return Ok(None);
                };
                let var = self.variable_operand(&entry);
                let dest = self.new_temp();
                self.push(Instruction::Copy {
                    dest: dest.clone(),
                    op: TacOp::Ref,
                    lhs: var,
                    rhs: Operand::None,
                });
                Ok(Some(dest))
            }
            AstKind::Dot { left, field } => {
                let base = if self.types.kind(left.type_id)
                    == TypeKind::Pointer
                {
                    self.expr(left)?
                } else {
                    match self.address_of(left)? {
                        Some(base) => base,
                        None => return Ok(None),
                    }
                };
                let record = if self.types.kind(left.type_id)
                    == TypeKind::Pointer
                {
                    self.types.get_parent(left.type_id).unwrap_or(0)
                } else {
                    left.type_id
                };
                let offset = self.field_offset(record, field).unwrap_or(0);
                Ok(Some(self.offset_address(base, offset)))
            }
            AstKind::Subscript { left, index } => {
                let base = self.expr(left)?;
                let idx = self.scaled_index(left, index)?;
                let dest = self.new_temp();
                self.push(Instruction::Copy {
                    dest: dest.clone(),
                    op: TacOp::IndexAddr,
                    lhs: base,
                    rhs: idx,
                });
                Ok(Some(dest))
            }
            AstKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => Ok(Some(self.expr(expr)?)),
            _ => Ok(None),
        }
    }

    /// Index operand scaled to the element width in bytes.
    fn scaled_index(
        &mut self,
        base: &AstNode,
        index: &AstNode,
    ) -> Result<Operand, CompilerError> {
        let element = self
            .types
            .get_parent(base.type_id)
            .unwrap_or(base.type_id);
        let stride = self.types.get(element).byte_size.max(1) as i64;
        let idx = self.expr(index)?;
        if stride == 1 {
            return Ok(idx);
        }
        if let Operand::Literal(value) = &idx
            && let Some(n) = value.as_number()
        {
            return Ok(Operand::Literal(Value::LitNum(n * stride)));
        }
        let dest = self.new_temp();
        self.push(Instruction::Copy {
            dest: dest.clone(),
            op: TacOp::Mul,
            lhs: idx,
            rhs: Operand::Literal(Value::LitNum(stride)),
        });
        Ok(dest)
    }

    fn offset_address(&mut self, base: Operand, offset: i64) -> Operand {
        if offset == 0 {
            return base;
        }
        let dest = self.new_temp();
        self.push(Instruction::Copy {
            dest: dest.clone(),
            op: TacOp::Add,
            lhs: base,
            rhs: Operand::Literal(Value::LitNum(offset)),
        });
        dest
    }

    /// For a local array the slot holds a pointer to the storage; for
    /// a static one the symbol's address is the storage.
    fn array_base(&mut self, entry: &SymbolEntry, dest: &Operand) -> Operand {
        let base = self.new_temp();
        let op = if entry.storage == StorageKind::Static {
            TacOp::Ref
        } else {
            TacOp::None
        };
        self.push(Instruction::Copy {
            dest: base.clone(),
            op,
            lhs: dest.clone(),
            rhs: Operand::None,
        });
        base
    }

    fn variable_operand(&self, entry: &SymbolEntry) -> Operand {
        Operand::Variable {
            scope: entry.scope,
            module: self.symbols.module_name_from(entry.scope),
            name: entry.name.clone(),
            index: entry.ordinal,
            type_id: entry.type_id,
        }
    }

    fn field_offset(&self, record: TypeId, field: &str) -> Option<i64> {
        let entry = self.types.get(record);
        let mut offset = 0i64;
        for f in &entry.fields {
            if f.name.as_deref() == Some(field) {
                return Some(offset);
            }
            let size = self.types.get(f.type_id).byte_size;
            offset += (size * f.element_count.max(1)) as i64;
        }
        None
    }

    fn array_byte_size(&self, type_id: TypeId) -> i64 {
        let entry = self.types.get(type_id);
        match entry.fields.first() {
            Some(element) => {
                let element_size =
                    self.types.get(element.type_id).byte_size.max(1);
                (element_size * element.element_count.max(1)) as i64
            }
            None => entry.byte_size as i64,
        }
    }
}

fn binary_op(op: BinaryOp) -> TacOp {
    match op {
        BinaryOp::Add => TacOp::Add,
        BinaryOp::Sub => TacOp::Sub,
        BinaryOp::Mul => TacOp::Mul,
        BinaryOp::Div => TacOp::Div,
        BinaryOp::Mod => TacOp::Mod,
        BinaryOp::BitAnd => TacOp::BitAnd,
        BinaryOp::BitOr => TacOp::BitOr,
        BinaryOp::BitXor => TacOp::BitXor,
        BinaryOp::ShiftLeft => TacOp::ShiftLeft,
        BinaryOp::ShiftRight => TacOp::ShiftRight,
        BinaryOp::Greater => TacOp::Greater,
        BinaryOp::Less => TacOp::Less,
        BinaryOp::GreaterEqual => TacOp::GreaterEqual,
        BinaryOp::LessEqual => TacOp::LessEqual,
        BinaryOp::Equal => TacOp::Equal,
        BinaryOp::NotEqual => TacOp::NotEqual,
        // Short-circuit forms lower to control flow before this point.
        BinaryOp::And | BinaryOp::Or => TacOp::None,
    }
}
