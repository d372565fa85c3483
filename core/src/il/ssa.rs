// il/ssa.rs - SSA form and constant value propagation
//
// Builds SSA from a plain function: dominators (Cooper-Harvey-Kennedy),
// dominance frontiers, phi placement, renaming over the dominator tree.
// Register values are then propagated to a fixpoint so call destinations and
// selector arguments can be read off as constants.
//
// SSA instruction `i` always corresponds to plain instruction `i`; phis live
// in a side table per block.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use super::{build_blocks, Block, Expr, Function, Instruction, Register};

/// A register at one SSA version. Version 0 is the value on entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SsaRegister {
    pub name: Register,
    pub version: u32,
}

impl SsaRegister {
    pub fn new(name: impl Into<Register>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for SsaRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.version)
    }
}

/// Phi node at the head of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phi {
    pub dest: SsaRegister,
    /// (predecessor block, incoming version)
    pub sources: Vec<(usize, SsaRegister)>,
}

/// What dataflow knows about a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterValue {
    Undetermined,
    Constant(u64),
    ConstantPointer(u64),
    /// Loaded from a pointer slot bound to an import; carries the slot address.
    ImportedAddress(u64),
}

impl RegisterValue {
    /// The value as an integer, if it is a known constant.
    pub fn constant(&self) -> Option<u64> {
        match self {
            RegisterValue::Constant(v) | RegisterValue::ConstantPointer(v) => Some(*v),
            _ => None,
        }
    }

    fn is_pointer(&self) -> bool {
        matches!(self, RegisterValue::ConstantPointer(_))
    }
}

/// Read-only knowledge about memory that dataflow can rely on.
pub trait MemoryOracle {
    /// Value of a load from `address` if that memory never changes.
    fn constant_load(&self, address: u64, size: u8) -> Option<u64>;

    /// Is `address` a pointer slot bound to an imported symbol?
    fn is_import_slot(&self, address: u64) -> bool;
}

/// Memory about which nothing is known.
pub struct NoMemory;

impl MemoryOracle for NoMemory {
    fn constant_load(&self, _address: u64, _size: u8) -> Option<u64> {
        None
    }

    fn is_import_slot(&self, _address: u64) -> bool {
        false
    }
}

/// A function in SSA form with propagated register values.
#[derive(Debug, Clone)]
pub struct SsaFunction {
    pub blocks: Vec<Block>,
    pub instructions: Vec<Instruction<SsaRegister>>,
    /// Phis per block
    pub phis: Vec<Vec<Phi>>,
    /// Immediate dominator per block; `None` when unreachable
    pub idom: Vec<Option<usize>>,
    values: HashMap<SsaRegister, RegisterValue>,
}

impl SsaFunction {
    /// Build SSA for `function`, using `memory` to fold constant loads.
    pub fn build(function: &Function, memory: &dyn MemoryOracle) -> Self {
        let blocks = build_blocks(&function.instructions);
        let preds = predecessors(&blocks);
        let rpo = reverse_postorder(&blocks);
        let idom = immediate_dominators(&blocks, &preds, &rpo);
        let frontiers = dominance_frontiers(&blocks, &preds, &idom);

        let mut renamer = Renamer::new(function, &blocks, &idom, &frontiers);
        renamer.run();
        let (instructions, phis) = renamer.finish();

        let mut ssa = SsaFunction {
            blocks,
            instructions,
            phis,
            idom,
            values: HashMap::new(),
        };
        ssa.propagate(memory);
        ssa
    }

    /// Plain-form index of an SSA instruction.
    pub fn non_ssa_index(&self, ssa_index: usize) -> usize {
        ssa_index
    }

    pub fn block_of(&self, index: usize) -> Option<usize> {
        self.blocks.iter().position(|b| b.contains(index))
    }

    /// Propagated value of a register.
    pub fn value(&self, register: &SsaRegister) -> RegisterValue {
        if register.version == 0 {
            return RegisterValue::Undetermined;
        }
        self.values
            .get(register)
            .copied()
            .unwrap_or(RegisterValue::Undetermined)
    }

    /// Value of an expression under the propagated register values.
    pub fn evaluate(&self, expr: &Expr<SsaRegister>, memory: &dyn MemoryOracle) -> RegisterValue {
        evaluate(expr, &|r: &SsaRegister| Some(self.value(r)), memory)
            .unwrap_or(RegisterValue::Undetermined)
    }

    fn propagate(&mut self, memory: &dyn MemoryOracle) {
        // Values only move from unknown to known to undetermined, so this
        // settles; the cap guards against malformed input.
        let limit = 4 * (self.instructions.len() + self.phis.iter().map(Vec::len).sum::<usize>()) + 8;

        for _ in 0..limit {
            let mut changed = false;

            for block in 0..self.blocks.len() {
                for phi in &self.phis[block] {
                    let incoming: Vec<RegisterValue> = phi
                        .sources
                        .iter()
                        .filter_map(|(_, src)| lookup(&self.values, src))
                        .collect();
                    let Some(first) = incoming.first().copied() else {
                        continue;
                    };
                    let merged = if incoming.iter().all(|v| *v == first) {
                        first
                    } else {
                        RegisterValue::Undetermined
                    };
                    changed |= update(&mut self.values, &phi.dest, merged);
                }

                let range = self.blocks[block].start..self.blocks[block].end;
                for inst in &self.instructions[range] {
                    match inst {
                        Instruction::SetReg { dest, src, .. } => {
                            let values = &self.values;
                            let computed = evaluate(src, &|r: &SsaRegister| lookup(values, r), memory);
                            if let Some(v) = computed {
                                changed |= update(&mut self.values, dest, v);
                            }
                        }
                        Instruction::Call { outputs, .. } | Instruction::Intrinsic { outputs, .. } => {
                            for out in outputs {
                                changed |= update(&mut self.values, out, RegisterValue::Undetermined);
                            }
                        }
                        _ => {}
                    }
                }
            }

            if !changed {
                break;
            }
        }
    }
}

impl fmt::Display for SsaFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, block) in self.blocks.iter().enumerate() {
            writeln!(f, "block {} -> {:?}:", n, block.successors)?;
            for phi in &self.phis[n] {
                write!(f, "        {} = phi(", phi.dest)?;
                for (i, (pred, src)) in phi.sources.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}@{}", src, pred)?;
                }
                writeln!(f, ")")?;
            }
            for idx in block.start..block.end {
                writeln!(f, "  {:>4}: {}", idx, self.instructions[idx])?;
            }
        }
        Ok(())
    }
}

fn lookup(values: &HashMap<SsaRegister, RegisterValue>, register: &SsaRegister) -> Option<RegisterValue> {
    if register.version == 0 {
        Some(RegisterValue::Undetermined)
    } else {
        values.get(register).copied()
    }
}

fn update(values: &mut HashMap<SsaRegister, RegisterValue>, register: &SsaRegister, value: RegisterValue) -> bool {
    match values.get(register) {
        Some(old) if *old == value => false,
        // Never climb back from undetermined
        Some(RegisterValue::Undetermined) => false,
        _ => {
            values.insert(register.clone(), value);
            true
        }
    }
}

/// Evaluate an expression. `None` means a register it depends on has not
/// been computed yet.
fn evaluate(
    expr: &Expr<SsaRegister>,
    lookup: &dyn Fn(&SsaRegister) -> Option<RegisterValue>,
    memory: &dyn MemoryOracle,
) -> Option<RegisterValue> {
    let value = match expr {
        Expr::Const(v) => RegisterValue::Constant(*v),
        Expr::ConstPtr(v) => RegisterValue::ConstantPointer(*v),
        Expr::Reg(r) => lookup(r)?,
        Expr::Load { address, size } => match evaluate(address, lookup, memory)?.constant() {
            Some(a) if memory.is_import_slot(a) => RegisterValue::ImportedAddress(a),
            Some(a) => memory
                .constant_load(a, *size)
                .map(RegisterValue::ConstantPointer)
                .unwrap_or(RegisterValue::Undetermined),
            None => RegisterValue::Undetermined,
        },
        Expr::Add(a, b) => arithmetic(evaluate(a, lookup, memory)?, evaluate(b, lookup, memory)?, u64::wrapping_add),
        Expr::Sub(a, b) => arithmetic(evaluate(a, lookup, memory)?, evaluate(b, lookup, memory)?, u64::wrapping_sub),
        Expr::And(a, b) => {
            match (evaluate(a, lookup, memory)?.constant(), evaluate(b, lookup, memory)?.constant()) {
                (Some(x), Some(y)) => RegisterValue::Constant(x & y),
                _ => RegisterValue::Undetermined,
            }
        }
        Expr::Unimplemented => RegisterValue::Undetermined,
    };
    Some(value)
}

fn arithmetic(a: RegisterValue, b: RegisterValue, op: fn(u64, u64) -> u64) -> RegisterValue {
    match (a.constant(), b.constant()) {
        (Some(x), Some(y)) if a.is_pointer() || b.is_pointer() => RegisterValue::ConstantPointer(op(x, y)),
        (Some(x), Some(y)) => RegisterValue::Constant(op(x, y)),
        _ => RegisterValue::Undetermined,
    }
}

fn predecessors(blocks: &[Block]) -> Vec<Vec<usize>> {
    let mut preds = vec![Vec::new(); blocks.len()];
    for (n, block) in blocks.iter().enumerate() {
        for &succ in &block.successors {
            if !preds[succ].contains(&n) {
                preds[succ].push(n);
            }
        }
    }
    preds
}

fn reverse_postorder(blocks: &[Block]) -> Vec<usize> {
    if blocks.is_empty() {
        return Vec::new();
    }
    let mut visited = vec![false; blocks.len()];
    let mut postorder = Vec::with_capacity(blocks.len());
    // (block, next successor to visit)
    let mut stack = vec![(0usize, 0usize)];
    visited[0] = true;

    while let Some((block, next)) = stack.pop() {
        if let Some(&succ) = blocks[block].successors.get(next) {
            stack.push((block, next + 1));
            if !visited[succ] {
                visited[succ] = true;
                stack.push((succ, 0));
            }
        } else {
            postorder.push(block);
        }
    }

    postorder.reverse();
    postorder
}

fn immediate_dominators(blocks: &[Block], preds: &[Vec<usize>], rpo: &[usize]) -> Vec<Option<usize>> {
    let mut idom: Vec<Option<usize>> = vec![None; blocks.len()];
    let Some(&entry) = rpo.first() else {
        return idom;
    };
    let mut order = vec![usize::MAX; blocks.len()];
    for (pos, &b) in rpo.iter().enumerate() {
        order[b] = pos;
    }
    idom[entry] = Some(entry);

    let intersect = |idom: &[Option<usize>], mut a: usize, mut b: usize| -> usize {
        while a != b {
            while order[a] > order[b] {
                a = idom[a].unwrap_or(entry);
            }
            while order[b] > order[a] {
                b = idom[b].unwrap_or(entry);
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &rpo[1..] {
            let mut processed = preds[b].iter().copied().filter(|&p| idom[p].is_some());
            let Some(first) = processed.next() else {
                continue;
            };
            let new_idom = processed.fold(first, |acc, p| intersect(&idom, p, acc));
            if idom[b] != Some(new_idom) {
                idom[b] = Some(new_idom);
                changed = true;
            }
        }
    }

    // The entry dominates itself only for the purposes of the walk above
    idom[entry] = None;
    idom
}

fn dominance_frontiers(blocks: &[Block], preds: &[Vec<usize>], idom: &[Option<usize>]) -> Vec<BTreeSet<usize>> {
    let reachable = |b: usize| b == 0 || idom[b].is_some();
    let mut frontiers = vec![BTreeSet::new(); blocks.len()];

    for b in 0..blocks.len() {
        let reachable_preds: Vec<usize> = preds[b].iter().copied().filter(|&p| reachable(p)).collect();
        if !reachable(b) || reachable_preds.len() < 2 {
            continue;
        }
        for p in reachable_preds {
            let mut runner = Some(p);
            while let Some(r) = runner {
                if Some(r) == idom[b] {
                    break;
                }
                frontiers[r].insert(b);
                runner = idom[r];
            }
        }
    }
    frontiers
}

/// Renaming state for one SSA construction.
struct Renamer<'a> {
    function: &'a Function,
    blocks: &'a [Block],
    children: Vec<Vec<usize>>,
    counters: HashMap<Register, u32>,
    stacks: HashMap<Register, Vec<u32>>,
    phis: Vec<Vec<Phi>>,
    instructions: Vec<Option<Instruction<SsaRegister>>>,
    visited: Vec<bool>,
    reachable: Vec<bool>,
}

impl<'a> Renamer<'a> {
    fn new(
        function: &'a Function,
        blocks: &'a [Block],
        idom: &[Option<usize>],
        frontiers: &[BTreeSet<usize>],
    ) -> Self {
        let reachable = (0..blocks.len()).map(|b| b == 0 || idom[b].is_some()).collect();
        let mut children = vec![Vec::new(); blocks.len()];
        for (b, dom) in idom.iter().enumerate() {
            if let Some(d) = dom {
                children[*d].push(b);
            }
        }

        // Phi placement over iterated dominance frontiers
        let mut def_blocks: BTreeMap<&Register, BTreeSet<usize>> = BTreeMap::new();
        for (n, block) in blocks.iter().enumerate() {
            for inst in &function.instructions[block.start..block.end] {
                for reg in inst.defined_registers() {
                    def_blocks.entry(reg).or_default().insert(n);
                }
            }
        }
        let mut phis: Vec<Vec<Phi>> = vec![Vec::new(); blocks.len()];
        for (reg, defs) in def_blocks {
            let mut placed = BTreeSet::new();
            let mut work: Vec<usize> = defs.iter().copied().collect();
            while let Some(b) = work.pop() {
                for &f in &frontiers[b] {
                    if placed.insert(f) {
                        phis[f].push(Phi {
                            dest: SsaRegister::new(reg.clone(), 0),
                            sources: Vec::new(),
                        });
                        if !defs.contains(&f) {
                            work.push(f);
                        }
                    }
                }
            }
        }

        Self {
            function,
            blocks,
            children,
            counters: HashMap::new(),
            stacks: HashMap::new(),
            phis,
            instructions: vec![None; function.instructions.len()],
            visited: vec![false; blocks.len()],
            reachable,
        }
    }

    fn run(&mut self) {
        if self.blocks.is_empty() {
            return;
        }
        self.rename_from(0);
        // Unreachable code still gets an SSA counterpart
        for b in 0..self.blocks.len() {
            if !self.visited[b] {
                self.rename_from(b);
            }
        }
    }

    fn finish(self) -> (Vec<Instruction<SsaRegister>>, Vec<Vec<Phi>>) {
        let instructions = self
            .instructions
            .into_iter()
            .map(|i| i.unwrap_or(Instruction::Nop))
            .collect();
        (instructions, self.phis)
    }

    fn current(&self, name: &Register) -> SsaRegister {
        let version = self
            .stacks
            .get(name)
            .and_then(|s| s.last().copied())
            .unwrap_or(0);
        SsaRegister::new(name.clone(), version)
    }

    fn define(&mut self, name: &Register, defined: &mut Vec<Register>) -> SsaRegister {
        let counter = self.counters.entry(name.clone()).or_insert(0);
        *counter += 1;
        let version = *counter;
        self.stacks.entry(name.clone()).or_default().push(version);
        defined.push(name.clone());
        SsaRegister::new(name.clone(), version)
    }

    fn rename_expr(&self, expr: &Expr) -> Expr<SsaRegister> {
        expr.map_registers(&mut |r| self.current(r))
    }

    fn rename_exprs(&self, exprs: &[Expr]) -> Vec<Expr<SsaRegister>> {
        exprs.iter().map(|e| self.rename_expr(e)).collect()
    }

    fn rename_instruction(&mut self, inst: &Instruction, defined: &mut Vec<Register>) -> Instruction<SsaRegister> {
        match inst {
            Instruction::SetReg { dest, size, src } => {
                let src = self.rename_expr(src);
                Instruction::SetReg {
                    dest: self.define(dest, defined),
                    size: *size,
                    src,
                }
            }
            Instruction::Store { address, size, src } => Instruction::Store {
                address: self.rename_expr(address),
                size: *size,
                src: self.rename_expr(src),
            },
            Instruction::Call { outputs, dest, args } => {
                let dest = self.rename_expr(dest);
                let args = self.rename_exprs(args);
                let outputs = outputs.iter().map(|r| self.define(r, defined)).collect();
                Instruction::Call { outputs, dest, args }
            }
            Instruction::TailCall { dest, args } => Instruction::TailCall {
                dest: self.rename_expr(dest),
                args: self.rename_exprs(args),
            },
            Instruction::Intrinsic {
                outputs,
                intrinsic,
                params,
            } => {
                let params = self.rename_exprs(params);
                let outputs = outputs.iter().map(|r| self.define(r, defined)).collect();
                Instruction::Intrinsic {
                    outputs,
                    intrinsic: *intrinsic,
                    params,
                }
            }
            Instruction::Jump { dest } => Instruction::Jump {
                dest: self.rename_expr(dest),
            },
            Instruction::Goto { target } => Instruction::Goto { target: *target },
            Instruction::If {
                condition,
                then_target,
                else_target,
            } => Instruction::If {
                condition: self.rename_expr(condition),
                then_target: *then_target,
                else_target: *else_target,
            },
            Instruction::Ret { dest } => Instruction::Ret {
                dest: self.rename_expr(dest),
            },
            Instruction::Nop => Instruction::Nop,
        }
    }

    /// Walk the dominator subtree under `root` with an explicit stack, so
    /// deep trees do not grow the thread stack.
    fn rename_from(&mut self, root: usize) {
        let mut stack = vec![Step::Enter(root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(block) => {
                    if self.visited[block] {
                        continue;
                    }
                    let defined = self.rename_block(block);
                    stack.push(Step::Exit(defined));
                    for &child in self.children[block].iter().rev() {
                        if !self.visited[child] {
                            stack.push(Step::Enter(child));
                        }
                    }
                }
                Step::Exit(defined) => {
                    for name in defined.into_iter().rev() {
                        if let Some(versions) = self.stacks.get_mut(&name) {
                            versions.pop();
                        }
                    }
                }
            }
        }
    }

    /// Rename one block and feed its successors' phis. Returns the names
    /// defined here, to be popped once the block's subtree is done.
    fn rename_block(&mut self, block: usize) -> Vec<Register> {
        self.visited[block] = true;
        let mut defined: Vec<Register> = Vec::new();

        // Phi definitions come first
        for i in 0..self.phis[block].len() {
            let name = self.phis[block][i].dest.name.clone();
            self.phis[block][i].dest = self.define(&name, &mut defined);
        }

        let range = self.blocks[block].start..self.blocks[block].end;
        let function = self.function;
        for idx in range {
            let renamed = self.rename_instruction(&function.instructions[idx], &mut defined);
            self.instructions[idx] = Some(renamed);
        }

        // Unreachable code never flows into a phi
        if !self.reachable[block] {
            return defined;
        }
        let blocks = self.blocks;
        for &succ in &blocks[block].successors {
            for i in 0..self.phis[succ].len() {
                let source = self.current(&self.phis[succ][i].dest.name);
                self.phis[succ][i].sources.push((block, source));
            }
        }

        defined
    }
}

enum Step {
    Enter(usize),
    Exit(Vec<Register>),
}
