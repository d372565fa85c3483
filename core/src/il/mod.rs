// il/mod.rs - Function intermediate representation
//
// A function is a flat vector of instructions; basic blocks are index ranges
// over it. Branch targets are instruction indices. The same types carry both
// the plain form (registers by name) and the SSA form (registers by name and
// version), parameterised over the register type.

pub mod ssa;

use std::fmt;

use crate::image::Architecture;

/// Register in the plain form
pub type Register = String;

/// Value expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr<R = Register> {
    Const(u64),
    ConstPtr(u64),
    Reg(R),
    Load { address: Box<Expr<R>>, size: u8 },
    Add(Box<Expr<R>>, Box<Expr<R>>),
    Sub(Box<Expr<R>>, Box<Expr<R>>),
    And(Box<Expr<R>>, Box<Expr<R>>),
    /// Lifted from something the lifter could not express
    Unimplemented,
}

impl Expr<Register> {
    pub fn reg(name: &str) -> Self {
        Expr::Reg(name.to_string())
    }
}

impl<R> Expr<R> {
    pub fn load(address: Expr<R>, size: u8) -> Self {
        Expr::Load {
            address: Box::new(address),
            size,
        }
    }

    /// Rebuild the expression with every register passed through `f`.
    pub fn map_registers<S>(&self, f: &mut impl FnMut(&R) -> S) -> Expr<S> {
        match self {
            Expr::Const(v) => Expr::Const(*v),
            Expr::ConstPtr(v) => Expr::ConstPtr(*v),
            Expr::Reg(r) => Expr::Reg(f(r)),
            Expr::Load { address, size } => Expr::Load {
                address: Box::new(address.map_registers(f)),
                size: *size,
            },
            Expr::Add(a, b) => Expr::Add(Box::new(a.map_registers(f)), Box::new(b.map_registers(f))),
            Expr::Sub(a, b) => Expr::Sub(Box::new(a.map_registers(f)), Box::new(b.map_registers(f))),
            Expr::And(a, b) => Expr::And(Box::new(a.map_registers(f)), Box::new(b.map_registers(f))),
            Expr::Unimplemented => Expr::Unimplemented,
        }
    }

    pub fn as_reg(&self) -> Option<&R> {
        match self {
            Expr::Reg(r) => Some(r),
            _ => None,
        }
    }
}

/// Intrinsic operations the rewrite engine can introduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// Materialise a constant string literal from its character data.
    CfStr,
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intrinsic::CfStr => f.write_str("CFSTR"),
        }
    }
}

/// IR instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<R = Register> {
    // Data movement
    SetReg { dest: R, size: u8, src: Expr<R> },
    Store { address: Expr<R>, size: u8, src: Expr<R> },

    // Calls
    Call { outputs: Vec<R>, dest: Expr<R>, args: Vec<Expr<R>> },
    TailCall { dest: Expr<R>, args: Vec<Expr<R>> },
    Intrinsic { outputs: Vec<R>, intrinsic: Intrinsic, params: Vec<Expr<R>> },

    // Control flow
    /// Indirect jump out of the function
    Jump { dest: Expr<R> },
    Goto { target: usize },
    If { condition: Expr<R>, then_target: usize, else_target: usize },
    Ret { dest: Expr<R> },

    Nop,
}

impl<R> Instruction<R> {
    /// Does this instruction end a basic block?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Goto { .. }
                | Instruction::If { .. }
                | Instruction::Ret { .. }
                | Instruction::Jump { .. }
                | Instruction::TailCall { .. }
        )
    }

    /// Instruction indices this instruction branches to inside the function.
    pub fn branch_targets(&self) -> Vec<usize> {
        match self {
            Instruction::Goto { target } => vec![*target],
            Instruction::If {
                then_target,
                else_target,
                ..
            } => vec![*then_target, *else_target],
            _ => Vec::new(),
        }
    }

    /// Does control continue with the next instruction?
    pub fn falls_through(&self) -> bool {
        !self.is_terminator()
    }

    /// Registers written by the instruction.
    pub fn defined_registers(&self) -> Vec<&R> {
        match self {
            Instruction::SetReg { dest, .. } => vec![dest],
            Instruction::Call { outputs, .. } | Instruction::Intrinsic { outputs, .. } => {
                outputs.iter().collect()
            }
            _ => Vec::new(),
        }
    }

    /// Destination of a call, tail call or indirect jump.
    pub fn control_target(&self) -> Option<&Expr<R>> {
        match self {
            Instruction::Call { dest, .. }
            | Instruction::TailCall { dest, .. }
            | Instruction::Jump { dest } => Some(dest),
            _ => None,
        }
    }
}

/// A basic block: instructions `start..end` of its function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub end: usize,
    /// Successor block indices
    pub successors: Vec<usize>,
}

impl Block {
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end
    }

    /// Index of the final instruction
    pub fn last(&self) -> usize {
        self.end - 1
    }
}

/// Split an instruction vector into basic blocks.
pub fn build_blocks<R>(instructions: &[Instruction<R>]) -> Vec<Block> {
    if instructions.is_empty() {
        return Vec::new();
    }

    // Phase 1: leaders
    let mut leaders = vec![false; instructions.len()];
    leaders[0] = true;
    for (idx, inst) in instructions.iter().enumerate() {
        for target in inst.branch_targets() {
            if target < instructions.len() {
                leaders[target] = true;
            }
        }
        if inst.is_terminator() && idx + 1 < instructions.len() {
            leaders[idx + 1] = true;
        }
    }

    // Phase 2: ranges
    let starts: Vec<usize> = (0..instructions.len()).filter(|&i| leaders[i]).collect();
    let mut block_of = vec![0usize; instructions.len()];
    let mut blocks: Vec<Block> = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(instructions.len());
        block_of[start..end].iter_mut().for_each(|b| *b = n);
        blocks.push(Block {
            start,
            end,
            successors: Vec::new(),
        });
    }

    // Phase 3: edges
    for n in 0..blocks.len() {
        let last = &instructions[blocks[n].last()];
        let mut successors: Vec<usize> = last
            .branch_targets()
            .into_iter()
            .filter(|&t| t < instructions.len())
            .map(|t| block_of[t])
            .collect();
        if last.falls_through() && n + 1 < blocks.len() {
            successors.push(n + 1);
        }
        successors.dedup();
        blocks[n].successors = successors;
    }

    blocks
}

/// A lifted function in plain (non-SSA) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Entry address
    pub address: u64,
    pub architecture: Architecture,
    pub instructions: Vec<Instruction>,
}

impl Function {
    pub fn new(address: u64, architecture: Architecture, instructions: Vec<Instruction>) -> Self {
        Self {
            address,
            architecture,
            instructions,
        }
    }

    pub fn blocks(&self) -> Vec<Block> {
        build_blocks(&self.instructions)
    }
}

impl<R: fmt::Display> fmt::Display for Expr<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{:#x}", v),
            Expr::ConstPtr(v) => write!(f, "&{:#x}", v),
            Expr::Reg(r) => write!(f, "{}", r),
            Expr::Load { address, size } => write!(f, "[{}].{}", address, size),
            Expr::Add(a, b) => write!(f, "{} + {}", a, b),
            Expr::Sub(a, b) => write!(f, "{} - {}", a, b),
            Expr::And(a, b) => write!(f, "{} & {}", a, b),
            Expr::Unimplemented => f.write_str("unimplemented"),
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl<R: fmt::Display> fmt::Display for Instruction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::SetReg { dest, src, .. } => write!(f, "{} = {}", dest, src),
            Instruction::Store { address, size, src } => write!(f, "[{}].{} = {}", address, size, src),
            Instruction::Call { outputs, dest, args } => {
                if !outputs.is_empty() {
                    write_list(f, outputs)?;
                    f.write_str(" = ")?;
                }
                write!(f, "call({}", dest)?;
                if !args.is_empty() {
                    f.write_str(", ")?;
                    write_list(f, args)?;
                }
                f.write_str(")")
            }
            Instruction::TailCall { dest, args } => {
                write!(f, "tailcall({}", dest)?;
                if !args.is_empty() {
                    f.write_str(", ")?;
                    write_list(f, args)?;
                }
                f.write_str(")")
            }
            Instruction::Intrinsic {
                outputs,
                intrinsic,
                params,
            } => {
                if !outputs.is_empty() {
                    write_list(f, outputs)?;
                    f.write_str(" = ")?;
                }
                write!(f, "{}(", intrinsic)?;
                write_list(f, params)?;
                f.write_str(")")
            }
            Instruction::Jump { dest } => write!(f, "jump({})", dest),
            Instruction::Goto { target } => write!(f, "goto {}", target),
            Instruction::If {
                condition,
                then_target,
                else_target,
            } => write!(f, "if ({}) then {} else {}", condition, then_target, else_target),
            Instruction::Ret { dest } => write!(f, "return {}", dest),
            Instruction::Nop => f.write_str("nop"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function {:#x} ({}):", self.address, self.architecture)?;
        for (idx, inst) in self.instructions.iter().enumerate() {
            writeln!(f, "  {:>4}: {}", idx, inst)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line_is_one_block() {
        let insts: Vec<Instruction> = vec![
            Instruction::SetReg {
                dest: "x0".into(),
                size: 8,
                src: Expr::Const(1),
            },
            Instruction::Ret {
                dest: Expr::reg("x30"),
            },
        ];
        let blocks = build_blocks(&insts);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].end, 2);
        assert!(blocks[0].successors.is_empty());
    }

    #[test]
    fn test_diamond_blocks() {
        let insts: Vec<Instruction> = vec![
            Instruction::If {
                condition: Expr::reg("x0"),
                then_target: 1,
                else_target: 3,
            },
            Instruction::SetReg {
                dest: "x1".into(),
                size: 8,
                src: Expr::Const(1),
            },
            Instruction::Goto { target: 4 },
            Instruction::SetReg {
                dest: "x1".into(),
                size: 8,
                src: Expr::Const(2),
            },
            Instruction::Ret {
                dest: Expr::reg("x30"),
            },
        ];
        let blocks = build_blocks(&insts);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].successors, vec![1, 2]);
        assert_eq!(blocks[1].successors, vec![3]);
        assert_eq!(blocks[2].successors, vec![3]);
        assert!(blocks[3].successors.is_empty());
    }

    #[test]
    fn test_display() {
        let inst: Instruction = Instruction::Call {
            outputs: vec!["x0".into()],
            dest: Expr::ConstPtr(0x1000),
            args: vec![Expr::reg("x0"), Expr::reg("x1")],
        };
        assert_eq!(inst.to_string(), "x0 = call(&0x1000, x0, x1)");
        let load: Expr = Expr::load(Expr::reg("sp"), 8);
        assert_eq!(load.to_string(), "[sp].8");
    }
}
