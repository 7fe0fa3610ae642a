pub mod apple_arm64;

use std::collections::HashMap;

use log::debug;

use crate::compiler::const_pool::{ConstIndex, ConstPool};
use crate::compiler::error::CompilerError;
use crate::compiler::symbol_table::{ScopeKind, SymbolEntry, SymbolTable};
use crate::compiler::type_table::{TypeId, TypeTable};
use crate::tac::{
    Instruction, Label, Operand, TacData, TacFunction, TacProgram, TacOp,
    TempId,
};
use crate::values::Value;

pub type Reg = usize;

/// The machine-specific half of the code generator. One implementation
/// per target; the TAC walker in this module drives it. Every `gen_*`
/// family call appends text to `out` and moves values through a small
/// scratch-register pool owned by the implementation.
pub trait Platform {
    fn key(&self) -> &'static str;
    fn init(&mut self);
    /// Sanity check at the end of a compilation; fails when scratch
    /// registers leaked.
    fn complete(&mut self) -> Result<(), CompilerError>;
    /// Stack-slot footprint of one value of this type, used for frame
    /// allocation. Distinct from the type table's semantic byte size.
    fn size_of(&self, types: &TypeTable, type_id: TypeId) -> u32;

    fn free_register(&mut self, reg: Reg) -> Result<(), CompilerError>;
    fn free_all_registers(&mut self);

    fn preamble(&mut self, out: &mut String, pool: &ConstPool);
    fn simple_exit(&mut self, out: &mut String);
    fn exit(&mut self, out: &mut String, reg: Reg);

    fn function_prologue(&mut self, out: &mut String, name: &str, frame: u32);
    fn function_epilogue(&mut self, out: &mut String, name: &str);
    fn gen_return(
        &mut self,
        out: &mut String,
        name: &str,
        reg: Option<Reg>,
    ) -> Result<(), CompilerError>;
    fn call(
        &mut self,
        out: &mut String,
        callable: Reg,
        args: &[Reg],
    ) -> Result<Reg, CompilerError>;

    fn label_create(&mut self) -> Label;
    fn label(&mut self, out: &mut String, label: Label);
    fn jump(&mut self, out: &mut String, label: Label);
    fn cmp_jump_zero(
        &mut self,
        out: &mut String,
        reg: Reg,
        label: Label,
    ) -> Result<(), CompilerError>;
    fn cmp_jump_not_zero(
        &mut self,
        out: &mut String,
        reg: Reg,
        label: Label,
    ) -> Result<(), CompilerError>;

    fn load_immediate(
        &mut self,
        out: &mut String,
        value: i64,
    ) -> Result<Reg, CompilerError>;
    fn move_register(&mut self, out: &mut String, dest: Reg, src: Reg);
    fn load_identifier(
        &mut self,
        out: &mut String,
        entry: &SymbolEntry,
        symbols: &SymbolTable,
        types: &TypeTable,
    ) -> Result<Reg, CompilerError>;
    fn load_identifier_addr(
        &mut self,
        out: &mut String,
        entry: &SymbolEntry,
        symbols: &SymbolTable,
    ) -> Result<Reg, CompilerError>;
    fn load_string(
        &mut self,
        out: &mut String,
        index: ConstIndex,
    ) -> Result<Reg, CompilerError>;
    fn init_symbol(
        &mut self,
        out: &mut String,
        entry: &SymbolEntry,
        symbols: &SymbolTable,
        value: Reg,
    ) -> Result<Reg, CompilerError>;
    fn assign(
        &mut self,
        out: &mut String,
        addr: Reg,
        value: Reg,
    ) -> Result<Reg, CompilerError>;
    fn raw(&mut self, out: &mut String, line: &str);
    fn alloc_stack(&mut self, out: &mut String, size: Reg) -> Reg;

    fn add(&mut self, out: &mut String, l: Reg, r: Reg)
    -> Result<Reg, CompilerError>;
    fn sub(&mut self, out: &mut String, l: Reg, r: Reg)
    -> Result<Reg, CompilerError>;
    fn mul(&mut self, out: &mut String, l: Reg, r: Reg)
    -> Result<Reg, CompilerError>;
    fn div(&mut self, out: &mut String, l: Reg, r: Reg)
    -> Result<Reg, CompilerError>;
    fn modulo(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn shift_left(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn shift_right(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn bit_and(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn bit_or(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn bit_xor(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn bit_not(&mut self, out: &mut String, reg: Reg) -> Reg;
    fn neg(&mut self, out: &mut String, reg: Reg) -> Reg;
    fn logical_not(&mut self, out: &mut String, reg: Reg) -> Reg;

    fn less(&mut self, out: &mut String, l: Reg, r: Reg)
    -> Result<Reg, CompilerError>;
    fn greater(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn less_equal(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn greater_equal(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn equal(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;
    fn not_equal(
        &mut self,
        out: &mut String,
        l: Reg,
        r: Reg,
    ) -> Result<Reg, CompilerError>;

    fn gen_ref(&mut self, out: &mut String, reg: Reg) -> Reg;
    fn deref(&mut self, out: &mut String, reg: Reg) -> Reg;
    fn index_addr(&mut self, out: &mut String, base: Reg, index: Reg)
    -> Reg;
    fn index_read(&mut self, out: &mut String, base: Reg, index: Reg)
    -> Reg;

    fn emit_data(
        &mut self,
        out: &mut String,
        data: &TacData,
        types: &TypeTable,
        pool: &ConstPool,
    );
}

pub fn get_platform(name: &str) -> Option<Box<dyn Platform>> {
    match name {
        "apple_arm64" => Some(Box::new(apple_arm64::AppleArm64::new())),
        _ => None,
    }
}

/// Walks the TAC program and drives the platform, mapping temporaries
/// onto the scratch pool as they are defined and consumed.
pub fn generate(
    program: &TacProgram,
    platform: &mut dyn Platform,
    symbols: &SymbolTable,
    types: &TypeTable,
    pool: &ConstPool,
) -> Result<String, CompilerError> {
    let mut out = String::new();
    platform.init();
    platform.preamble(&mut out, pool);
    platform.simple_exit(&mut out);

    for section in &program.sections {
        out.push_str(&format!("\n// section {}", section.name));
        if let Some(annotation) = &section.annotation {
            out.push_str(&format!(" ({annotation})"));
        }
        out.push('\n');
        for function in &section.functions {
            gen_function(
                &mut out, function, platform, symbols, types, pool,
            )?;
        }
    }

    let has_storage = program
        .sections
        .iter()
        .flat_map(|s| s.data.iter())
        .any(|d| !d.constant);
    if has_storage {
        out.push_str("\n.data\n");
        for section in &program.sections {
            for data in &section.data {
                platform.emit_data(&mut out, data, types, pool);
            }
        }
        out.push_str(".text\n");
    }

    platform.complete()?;
    out.push('\n');
    Ok(out)
}

fn gen_function(
    out: &mut String,
    function: &TacFunction,
    platform: &mut dyn Platform,
    symbols: &SymbolTable,
    types: &TypeTable,
    pool: &ConstPool,
) -> Result<(), CompilerError> {
    debug!(
        "codegen fn {} (purity {:?}, used {})",
        function.name, function.purity, function.used
    );
    platform.free_all_registers();
    let scope = symbols.scope(function.scope);
    // The entry flow hangs off the module scope, whose allocation
    // lives in the nested counters rather than its own total.
    let base = if scope.kind == ScopeKind::Module {
        scope.table_size + scope.nested_size
    } else {
        scope.table_allocation_size
    };
    let frame = base.div_ceil(16) * 16;
    platform.function_prologue(out, &function.name, frame);

    let mut walker = Walker {
        platform,
        symbols,
        types,
        pool,
        temps: HashMap::new(),
        labels: HashMap::new(),
        uses: count_uses(function),
        name: &function.name,
    };
    for block in &function.blocks {
        let label = walker.global_label(block.label);
        walker.platform.label(out, label);
        for instruction in &block.instructions {
            walker.instruction(out, instruction)?;
        }
    }
    walker.platform.function_epilogue(out, &function.name);
    Ok(())
}

fn count_uses(function: &TacFunction) -> HashMap<TempId, u32> {
    let mut uses: HashMap<TempId, u32> = HashMap::new();
    let mut count = |operand: &Operand| {
        if let Operand::Temporary(t) = operand {
            *uses.entry(*t).or_insert(0) += 1;
        }
    };
    for block in &function.blocks {
        for instruction in &block.instructions {
            match instruction {
                Instruction::Init { value, .. } => count(value),
                Instruction::Copy { lhs, rhs, .. } => {
                    count(lhs);
                    count(rhs);
                }
                Instruction::Store { addr, value } => {
                    count(addr);
                    count(value);
                }
                Instruction::Phi { lhs, rhs, .. } => {
                    count(lhs);
                    count(rhs);
                }
                Instruction::IfFalse { cond, .. }
                | Instruction::IfTrue { cond, .. } => count(cond),
                Instruction::Call { callee, args, .. } => {
                    count(callee);
                    for arg in args {
                        count(arg);
                    }
                }
                Instruction::Return { value } => count(value),
                Instruction::Goto { .. }
                | Instruction::Asm { .. }
                | Instruction::Error => {}
            }
        }
    }
    uses
}

struct Walker<'a> {
    platform: &'a mut dyn Platform,
    symbols: &'a SymbolTable,
    types: &'a TypeTable,
    pool: &'a ConstPool,
    temps: HashMap<TempId, Reg>,
    labels: HashMap<Label, Label>,
    uses: HashMap<TempId, u32>,
    name: &'a str,
}

impl<'a> Walker<'a> {
    fn global_label(&mut self, local: Label) -> Label {
        if let Some(&label) = self.labels.get(&local) {
            return label;
        }
        let label = self.platform.label_create();
        self.labels.insert(local, label);
        label
    }

    fn entry_for(
        &self,
        operand: &Operand,
    ) -> Result<SymbolEntry, CompilerError> {
        let Operand::Variable { scope, name, .. } = operand else {
            return Err(CompilerError::UnsupportedOperation(
                "expected a symbol operand".into(),
            ));
        };
        self.symbols.get(*scope, name).ok_or_else(|| {
            CompilerError::UnsupportedOperation(format!(
                "unresolved symbol '{name}'"
            ))
        })
    }

    fn operand_reg(
        &mut self,
        out: &mut String,
        operand: &Operand,
    ) -> Result<Reg, CompilerError> {
        match operand {
            Operand::Literal(value) => match value {
                Value::Str(id) => {
                    let index =
                        self.pool.string_const_index(*id).ok_or_else(
                            || {
                                CompilerError::UnsupportedOperation(
                                    "string literal without a pool entry"
                                        .into(),
                                )
                            },
                        )?;
                    self.platform.load_string(out, index)
                }
                other => {
                    let n = other.as_number().ok_or_else(|| {
                        CompilerError::UnsupportedOperation(format!(
                            "literal {other} has no register form"
                        ))
                    })?;
                    self.platform.load_immediate(out, n)
                }
            },
            Operand::Variable { .. } => {
                let entry = self.entry_for(operand)?;
                self.platform.load_identifier(
                    out,
                    &entry,
                    self.symbols,
                    self.types,
                )
            }
            Operand::Temporary(t) => {
                self.temps.remove(t).ok_or_else(|| {
                    CompilerError::UnsupportedOperation(format!(
                        "temporary t{t} read before being written"
                    ))
                })
            }
            Operand::None | Operand::Label(_) => {
                Err(CompilerError::UnsupportedOperation(
                    "operand has no register form".into(),
                ))
            }
        }
    }

    fn assign_dest(
        &mut self,
        out: &mut String,
        dest: &Operand,
        reg: Reg,
    ) -> Result<(), CompilerError> {
        match dest {
            Operand::Temporary(t) => {
                if let Some(&existing) = self.temps.get(t) {
                    // A second write to the same temporary (both arms
                    // of a short-circuit) lands in the first register.
                    self.platform.move_register(out, existing, reg);
                    self.platform.free_register(reg)?;
                } else if self.uses.get(t).copied().unwrap_or(0) == 0 {
                    self.platform.free_register(reg)?;
                } else {
                    self.temps.insert(*t, reg);
                }
                Ok(())
            }
            Operand::Variable { .. } => {
                let entry = self.entry_for(dest)?;
                self.platform.init_symbol(out, &entry, self.symbols, reg)?;
                self.platform.free_register(reg)?;
                Ok(())
            }
            Operand::None => self.platform.free_register(reg),
            _ => Err(CompilerError::UnsupportedOperation(
                "unsupported destination operand".into(),
            )),
        }
    }

    fn instruction(
        &mut self,
        out: &mut String,
        instruction: &Instruction,
    ) -> Result<(), CompilerError> {
        match instruction {
            Instruction::Init { dest, value } => {
                let entry = self.entry_for(dest)?;
                let is_array = self.types.kind(entry.type_id)
                    == crate::compiler::type_table::TypeKind::Array;
                let reg = self.operand_reg(out, value)?;
                let reg = if is_array {
                    self.platform.alloc_stack(out, reg)
                } else {
                    reg
                };
                self.platform.init_symbol(out, &entry, self.symbols, reg)?;
                self.platform.free_register(reg)
            }
            Instruction::Copy { dest, op, lhs, rhs } => {
                let reg = self.copy_value(out, *op, lhs, rhs)?;
                self.assign_dest(out, dest, reg)
            }
            Instruction::Store { addr, value } => {
                let addr_reg = self.operand_reg(out, addr)?;
                let value_reg = self.operand_reg(out, value)?;
                let reg = self.platform.assign(out, addr_reg, value_reg)?;
                self.platform.free_register(reg)
            }
            Instruction::Phi { .. } => {
                Err(CompilerError::UnsupportedOperation(
                    "phi is reserved and never emitted".into(),
                ))
            }
            Instruction::IfFalse { cond, target } => {
                let reg = self.operand_reg(out, cond)?;
                let label = self.global_label(*target);
                self.platform.cmp_jump_zero(out, reg, label)
            }
            Instruction::IfTrue { cond, target } => {
                let reg = self.operand_reg(out, cond)?;
                let label = self.global_label(*target);
                self.platform.cmp_jump_not_zero(out, reg, label)
            }
            Instruction::Goto { target } => {
                let label = self.global_label(*target);
                self.platform.jump(out, label);
                Ok(())
            }
            Instruction::Call { dest, callee, args } => {
                let callee_reg = self.operand_reg(out, callee)?;
                let mut arg_regs = Vec::with_capacity(args.len());
                for arg in args {
                    arg_regs.push(self.operand_reg(out, arg)?);
                }
                let reg =
                    self.platform.call(out, callee_reg, &arg_regs)?;
                self.assign_dest(out, dest, reg)
            }
            Instruction::Return { value } => {
                let reg = match value {
                    Operand::None => None,
                    other => Some(self.operand_reg(out, other)?),
                };
                self.platform.gen_return(out, self.name, reg)
            }
            Instruction::Asm { lines } => {
                for line in lines {
                    self.platform.raw(out, line);
                }
                Ok(())
            }
            Instruction::Error => Err(CompilerError::UnsupportedOperation(
                "error instruction reached the back end".into(),
            )),
        }
    }

    fn copy_value(
        &mut self,
        out: &mut String,
        op: TacOp,
        lhs: &Operand,
        rhs: &Operand,
    ) -> Result<Reg, CompilerError> {
        match op {
            TacOp::None => self.operand_reg(out, lhs),
            TacOp::Neg => {
                let reg = self.operand_reg(out, lhs)?;
                Ok(self.platform.neg(out, reg))
            }
            TacOp::Not => {
                let reg = self.operand_reg(out, lhs)?;
                Ok(self.platform.logical_not(out, reg))
            }
            TacOp::BitNot => {
                let reg = self.operand_reg(out, lhs)?;
                Ok(self.platform.bit_not(out, reg))
            }
            TacOp::Ref => match lhs {
                Operand::Variable { .. } => {
                    let entry = self.entry_for(lhs)?;
                    self.platform.load_identifier_addr(
                        out,
                        &entry,
                        self.symbols,
                    )
                }
                _ => {
                    let reg = self.operand_reg(out, lhs)?;
                    Ok(self.platform.gen_ref(out, reg))
                }
            },
            TacOp::Deref => {
                let reg = self.operand_reg(out, lhs)?;
                Ok(self.platform.deref(out, reg))
            }
            TacOp::IndexAddr => {
                let base = self.operand_reg(out, lhs)?;
                let index = self.operand_reg(out, rhs)?;
                Ok(self.platform.index_addr(out, base, index))
            }
            TacOp::IndexRead => {
                let base = self.operand_reg(out, lhs)?;
                let index = self.operand_reg(out, rhs)?;
                Ok(self.platform.index_read(out, base, index))
            }
            _ => {
                let l = self.operand_reg(out, lhs)?;
                let r = self.operand_reg(out, rhs)?;
                match op {
                    TacOp::Add => self.platform.add(out, l, r),
                    TacOp::Sub => self.platform.sub(out, l, r),
                    TacOp::Mul => self.platform.mul(out, l, r),
                    TacOp::Div => self.platform.div(out, l, r),
                    TacOp::Mod => self.platform.modulo(out, l, r),
                    TacOp::ShiftLeft => self.platform.shift_left(out, l, r),
                    TacOp::ShiftRight => {
                        self.platform.shift_right(out, l, r)
                    }
                    TacOp::BitAnd => self.platform.bit_and(out, l, r),
                    TacOp::BitOr => self.platform.bit_or(out, l, r),
                    TacOp::BitXor => self.platform.bit_xor(out, l, r),
                    TacOp::Greater => self.platform.greater(out, l, r),
                    TacOp::Less => self.platform.less(out, l, r),
                    TacOp::GreaterEqual => {
                        self.platform.greater_equal(out, l, r)
                    }
                    TacOp::LessEqual => self.platform.less_equal(out, l, r),
                    TacOp::Equal => self.platform.equal(out, l, r),
                    TacOp::NotEqual => self.platform.not_equal(out, l, r),
                    _ => Err(CompilerError::UnsupportedOperation(format!(
                        "unexpected operator {}",
                        op.as_ref()
                    ))),
                }
            }
        }
    }
}
