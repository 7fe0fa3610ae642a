pub mod emit;

use std::collections::HashMap;

use strum_macros::AsRefStr;

use crate::compiler::symbol_table::ScopeId;
use crate::compiler::type_table::TypeId;
use crate::values::Value;

pub type Label = u32;
pub type TempId = u32;

/// A TAC operand: nothing, a folded literal, a named symbol reference,
/// a virtual register or a branch label.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Literal(Value),
    Variable {
        scope: ScopeId,
        module: Option<String>,
        name: String,
        index: u32,
        type_id: TypeId,
    },
    Temporary(TempId),
    Label(Label),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum TacOp {
    None,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    ShiftLeft,
    ShiftRight,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
    Equal,
    NotEqual,
    Ref,
    Deref,
    IndexAddr,
    IndexRead,
}

/// One three-address instruction. Labels are implicit: every block
/// carries its own. `phi` is reserved and never emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Init {
        dest: Operand,
        value: Operand,
    },
    Copy {
        dest: Operand,
        op: TacOp,
        lhs: Operand,
        rhs: Operand,
    },
    Store {
        addr: Operand,
        value: Operand,
    },
    Phi {
        dest: Operand,
        lhs: Operand,
        rhs: Operand,
    },
    IfFalse {
        cond: Operand,
        target: Label,
    },
    IfTrue {
        cond: Operand,
        target: Label,
    },
    Goto {
        target: Label,
    },
    Call {
        dest: Operand,
        callee: Operand,
        args: Vec<Operand>,
    },
    Return {
        value: Operand,
    },
    Asm {
        lines: Vec<String>,
    },
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purity {
    Unknown,
    Pure,
    Impure,
}

/// A straight-line run of instructions. Fall-through goes to the next
/// block in the function's vector; at most one explicit branch target.
#[derive(Debug, Clone)]
pub struct Block {
    pub label: Label,
    pub instructions: Vec<Instruction>,
    pub branch_target: Option<Label>,
    pub purity: Purity,
    pub reachable: bool,
}

#[derive(Debug, Clone)]
pub struct TacFunction {
    pub module: Option<String>,
    pub name: String,
    pub bank: u32,
    pub scope: ScopeId,
    pub purity: Purity,
    pub used: bool,
    pub blocks: Vec<Block>,
    /// Names of functions this one calls, for the purity fixpoint.
    pub calls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TacData {
    pub module: Option<String>,
    pub name: String,
    pub type_id: TypeId,
    pub size: u32,
    pub element_count: u32,
    pub constant: bool,
    pub value: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TacSection {
    pub index: u32,
    pub name: String,
    pub annotation: Option<String>,
    pub data: Vec<TacData>,
    pub functions: Vec<TacFunction>,
}

#[derive(Debug, Clone, Default)]
pub struct TacProgram {
    pub sections: Vec<TacSection>,
}

impl TacProgram {
    pub fn functions(&self) -> impl Iterator<Item = &TacFunction> {
        self.sections.iter().flat_map(|s| s.functions.iter())
    }
}

/// Call-graph fixpoint: a function stays pure only while everything it
/// calls is pure. Unknown callees (externals) poison their callers;
/// call cycles among otherwise-pure functions settle as pure.
pub fn resolve_purity(program: &mut TacProgram) {
    let mut purity: HashMap<String, Purity> = program
        .functions()
        .map(|f| (f.name.clone(), f.purity))
        .collect();

    loop {
        let mut changed = false;
        for function in program.functions() {
            let current = purity[&function.name];
            if current != Purity::Unknown {
                continue;
            }
            let mut next = Purity::Pure;
            for callee in &function.calls {
                match purity.get(callee) {
                    Some(Purity::Impure) | None => {
                        next = Purity::Impure;
                        break;
                    }
                    Some(Purity::Unknown) => next = Purity::Unknown,
                    Some(Purity::Pure) => {}
                }
            }
            if next != current && next != Purity::Unknown {
                purity.insert(function.name.clone(), next);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for section in &mut program.sections {
        for function in &mut section.functions {
            let resolved = purity[&function.name];
            function.purity = match resolved {
                Purity::Unknown => Purity::Pure,
                other => other,
            };
            for block in &mut function.blocks {
                block.purity = function.purity;
            }
        }
    }
}

/// Marks functions reachable through the call graph from the entry.
pub fn mark_used(program: &mut TacProgram, entry: &str) {
    let calls: HashMap<String, Vec<String>> = program
        .functions()
        .map(|f| (f.name.clone(), f.calls.clone()))
        .collect();
    let mut used: Vec<String> = vec![entry.to_owned()];
    let mut stack = vec![entry.to_owned()];
    while let Some(name) = stack.pop() {
        for callee in calls.get(&name).into_iter().flatten() {
            if !used.contains(callee) {
                used.push(callee.clone());
                stack.push(callee.clone());
            }
        }
    }
    for section in &mut program.sections {
        for function in &mut section.functions {
            function.used = used.contains(&function.name);
        }
    }
}

/// Dead-code elimination on blocks: drops whole blocks no control
/// flow can reach, then forwards references through empty fall-through
/// blocks and deletes them.
pub fn clean_blocks(function: &mut TacFunction) {
    if function.blocks.is_empty() {
        return;
    }

    let index_of: HashMap<Label, usize> = function
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.label, i))
        .collect();
    let mut reachable = vec![false; function.blocks.len()];
    let mut stack = vec![0usize];
    while let Some(i) = stack.pop() {
        if reachable[i] {
            continue;
        }
        reachable[i] = true;
        let block = &function.blocks[i];
        if let Some(target) = block.branch_target
            && let Some(&t) = index_of.get(&target)
        {
            stack.push(t);
        }
        let falls_through = !matches!(
            block.instructions.last(),
            Some(Instruction::Goto { .. }) | Some(Instruction::Return { .. })
        );
        if falls_through && i + 1 < function.blocks.len() {
            stack.push(i + 1);
        }
    }
    for (block, flag) in function.blocks.iter_mut().zip(reachable.iter()) {
        block.reachable = *flag;
    }
    function.blocks.retain(|b| b.reachable);

    // Forward empty fall-through blocks into their successor.
    let mut forward: HashMap<Label, Label> = HashMap::new();
    for window in function.blocks.windows(2) {
        let (block, next) = (&window[0], &window[1]);
        if block.instructions.is_empty() && block.branch_target.is_none() {
            forward.insert(block.label, next.label);
        }
    }
    let resolve = |mut label: Label| {
        let mut hops = 0;
        while let Some(&next) = forward.get(&label) {
            label = next;
            hops += 1;
            if hops > forward.len() {
                break;
            }
        }
        label
    };
    let forwarded: Vec<Label> = forward.keys().copied().collect();
    for block in &mut function.blocks {
        if let Some(target) = block.branch_target {
            block.branch_target = Some(resolve(target));
        }
        for instruction in &mut block.instructions {
            match instruction {
                Instruction::IfFalse { target, .. }
                | Instruction::IfTrue { target, .. }
                | Instruction::Goto { target } => {
                    *target = resolve(*target);
                }
                _ => {}
            }
        }
    }
    let keep_first = function.blocks.first().map(|b| b.label);
    function.blocks.retain(|b| {
        Some(b.label) == keep_first || !forwarded.contains(&b.label)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(label: Label, instructions: Vec<Instruction>) -> Block {
        Block {
            label,
            instructions,
            branch_target: None,
            purity: Purity::Unknown,
            reachable: true,
        }
    }

    fn function(blocks: Vec<Block>) -> TacFunction {
        TacFunction {
            module: None,
            name: "f".into(),
            bank: 0,
            scope: 0,
            purity: Purity::Unknown,
            used: false,
            blocks,
            calls: Vec::new(),
        }
    }

    #[test]
    fn unreachable_blocks_are_dropped() {
        let mut f = function(vec![
            block(
                0,
                vec![Instruction::Return {
                    value: Operand::None,
                }],
            ),
            block(1, vec![Instruction::Error]),
        ]);
        clean_blocks(&mut f);
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.blocks[0].label, 0);
    }

    #[test]
    fn empty_blocks_forward_their_label() {
        let mut f = function(vec![
            block(0, vec![Instruction::Goto { target: 1 }]),
            block(1, vec![]),
            block(
                2,
                vec![Instruction::Return {
                    value: Operand::None,
                }],
            ),
        ]);
        f.blocks[0].branch_target = Some(1);
        clean_blocks(&mut f);
        assert_eq!(f.blocks.len(), 2);
        assert!(matches!(
            f.blocks[0].instructions[0],
            Instruction::Goto { target: 2 }
        ));
    }

    #[test]
    fn purity_propagates_through_the_call_graph() {
        let mut program = TacProgram {
            sections: vec![TacSection {
                index: 0,
                name: "main".into(),
                annotation: None,
                data: Vec::new(),
                functions: vec![
                    TacFunction {
                        module: None,
                        name: "pure_leaf".into(),
                        bank: 0,
                        scope: 0,
                        purity: Purity::Unknown,
                        used: false,
                        blocks: Vec::new(),
                        calls: Vec::new(),
                    },
                    TacFunction {
                        module: None,
                        name: "caller".into(),
                        bank: 0,
                        scope: 0,
                        purity: Purity::Unknown,
                        used: false,
                        blocks: Vec::new(),
                        calls: vec!["pure_leaf".into()],
                    },
                    TacFunction {
                        module: None,
                        name: "tainted".into(),
                        bank: 0,
                        scope: 0,
                        purity: Purity::Impure,
                        used: false,
                        blocks: Vec::new(),
                        calls: Vec::new(),
                    },
                    TacFunction {
                        module: None,
                        name: "taint_caller".into(),
                        bank: 0,
                        scope: 0,
                        purity: Purity::Unknown,
                        used: false,
                        blocks: Vec::new(),
                        calls: vec!["tainted".into()],
                    },
                ],
            }],
        };
        resolve_purity(&mut program);
        let purity: HashMap<String, Purity> = program
            .functions()
            .map(|f| (f.name.clone(), f.purity))
            .collect();
        assert_eq!(purity["pure_leaf"], Purity::Pure);
        assert_eq!(purity["caller"], Purity::Pure);
        assert_eq!(purity["tainted"], Purity::Impure);
        assert_eq!(purity["taint_caller"], Purity::Impure);
    }
}
