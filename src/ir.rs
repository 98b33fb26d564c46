//! Intermediate representation for one translation unit.
//!
//! A [`Function`] is a control-flow graph of basic blocks in SSA form. Every
//! virtual register has exactly one definition (an instruction result or a
//! phi); merge points carry phis that name, per predecessor, the contributing
//! operand. Use lists are kept per virtual register and drive liveness.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl VReg {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    I64,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(VReg),
    Const(u64),
}

impl Operand {
    pub fn reg(self) -> Option<VReg> {
        match self {
            Operand::Reg(v) => Some(v),
            Operand::Const(_) => None,
        }
    }

    pub fn constant(self) -> Option<u64> {
        match self {
            Operand::Reg(_) => None,
            Operand::Const(c) => Some(c),
        }
    }
}

impl From<VReg> for Operand {
    fn from(v: VReg) -> Self {
        Operand::Reg(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCond {
    Eq,
    Ne,
    Ult,
    Uge,
    Slt,
    Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    /// `(address, log2 size) -> value`
    ReadMemory,
    /// `(address, value, log2 size)`
    WriteMemory,
}

impl Helper {
    pub fn returns_value(self) -> bool {
        matches!(self, Helper::ReadMemory)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Copy,
    Add,
    Sub,
    Mul,
    /// Unsigned division; division by zero yields zero.
    UDiv,
    /// Signed division; division by zero yields zero, `MIN / -1` yields `MIN`.
    SDiv,
    And,
    Or,
    Xor,
    Shl,
    Lshr,
    Ashr,
    Rotr,
    Not,
    /// Sign-extend from the given bit width.
    Sext(u8),
    /// Produces 1 or 0.
    Icmp(IntCond),
    /// `args[0] != 0 ? args[1] : args[2]`
    Select,
    /// Load of the destination's type from the execution context.
    LoadContext(i32),
    StoreContext(i32),
    Call(Helper),
    FAdd,
    FSub,
    FMul,
    FDiv,
    /// Reinterpret integer bits as a double.
    BitsToFloat,
    /// Reinterpret a double as integer bits.
    FloatToBits,
    /// Store `args[0]` into a spill slot.
    Spill(u32),
    /// Load a spill slot into the destination.
    Reload(u32),
}

impl Op {
    pub fn is_call(self) -> bool {
        matches!(self, Op::Call(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub op: Op,
    pub dst: Option<VReg>,
    pub args: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub dst: VReg,
    pub sources: Vec<(BlockId, Operand)>,
}

impl Phi {
    pub fn source(&self, pred: BlockId) -> Option<Operand> {
        self.sources
            .iter()
            .find(|(b, _)| *b == pred)
            .map(|(_, op)| *op)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Placeholder while the block is under construction.
    Pending,
    Jump(BlockId),
    Branch {
        cond: Operand,
        taken: BlockId,
        not_taken: BlockId,
    },
    /// Leave the translated function; the operand is the next guest PC.
    Return(Operand),
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match *self {
            Terminator::Pending | Terminator::Return(_) => vec![],
            Terminator::Jump(b) => vec![b],
            Terminator::Branch {
                taken, not_taken, ..
            } => {
                if taken == not_taken {
                    vec![taken]
                } else {
                    vec![taken, not_taken]
                }
            }
        }
    }

    pub fn operands(&self) -> Vec<Operand> {
        match *self {
            Terminator::Branch { cond, .. } => vec![cond],
            Terminator::Return(op) => vec![op],
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub phis: Vec<Phi>,
    pub insts: Vec<Inst>,
    pub term: Terminator,
    pub preds: Vec<BlockId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseSite {
    Phi { block: BlockId, index: usize },
    Inst { block: BlockId, index: usize },
    Terminator { block: BlockId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefSite {
    Phi { block: BlockId, index: usize },
    Inst { block: BlockId, index: usize },
}

#[derive(Debug, Clone, Default)]
pub struct Function {
    pub blocks: Vec<BasicBlock>,
    types: Vec<Type>,
    uses: Vec<Vec<UseSite>>,
}

impl Function {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn new_vreg(&mut self, ty: Type) -> VReg {
        self.types.push(ty);
        self.uses.push(vec![]);
        VReg(self.types.len() as u32 - 1)
    }

    pub fn vreg_type(&self, v: VReg) -> Type {
        self.types[v.index()]
    }

    pub fn vreg_count(&self) -> usize {
        self.types.len()
    }

    pub fn create_block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock {
            phis: vec![],
            insts: vec![],
            term: Terminator::Pending,
            preds: vec![],
        });
        BlockId(self.blocks.len() as u32 - 1)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn push(&mut self, block: BlockId, op: Op, dst: Option<VReg>, args: Vec<Operand>) {
        let index = self.blocks[block.index()].insts.len();
        for arg in &args {
            if let Operand::Reg(v) = arg {
                self.uses[v.index()].push(UseSite::Inst { block, index });
            }
        }
        self.blocks[block.index()].insts.push(Inst { op, dst, args });
    }

    pub fn push_phi(&mut self, block: BlockId, dst: VReg) -> usize {
        let phis = &mut self.blocks[block.index()].phis;
        phis.push(Phi {
            dst,
            sources: vec![],
        });
        phis.len() - 1
    }

    pub fn add_phi_source(&mut self, block: BlockId, index: usize, pred: BlockId, op: Operand) {
        if let Operand::Reg(v) = op {
            self.uses[v.index()].push(UseSite::Phi { block, index });
        }
        self.blocks[block.index()].phis[index]
            .sources
            .push((pred, op));
    }

    pub fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        for op in term.operands() {
            if let Operand::Reg(v) = op {
                self.uses[v.index()].push(UseSite::Terminator { block });
            }
        }
        self.blocks[block.index()].term = term;
    }

    pub fn uses(&self, v: VReg) -> &[UseSite] {
        &self.uses[v.index()]
    }

    /// Rebuilds use lists and predecessor lists from scratch.
    pub fn rebuild(&mut self) {
        self.uses = self.collect_uses();
        for block in &mut self.blocks {
            block.preds.clear();
        }
        for id in 0..self.blocks.len() {
            for succ in self.blocks[id].term.successors() {
                self.blocks[succ.index()].preds.push(BlockId(id as u32));
            }
        }
    }

    fn collect_uses(&self) -> Vec<Vec<UseSite>> {
        let mut uses = vec![vec![]; self.types.len()];
        for (b, block) in self.blocks.iter().enumerate() {
            let block_id = BlockId(b as u32);
            for (index, phi) in block.phis.iter().enumerate() {
                for (_, op) in &phi.sources {
                    if let Operand::Reg(v) = op {
                        uses[v.index()].push(UseSite::Phi {
                            block: block_id,
                            index,
                        });
                    }
                }
            }
            for (index, inst) in block.insts.iter().enumerate() {
                for op in &inst.args {
                    if let Operand::Reg(v) = op {
                        uses[v.index()].push(UseSite::Inst {
                            block: block_id,
                            index,
                        });
                    }
                }
            }
            for op in block.term.operands() {
                if let Operand::Reg(v) = op {
                    uses[v.index()].push(UseSite::Terminator { block: block_id });
                }
            }
        }
        uses
    }

    /// Checks that the recorded use lists match the operands actually present.
    pub fn uses_consistent(&self) -> bool {
        let actual = self.collect_uses();
        actual.len() == self.uses.len()
            && actual.iter().zip(&self.uses).all(|(a, b)| {
                let mut a = a.clone();
                let mut b = b.clone();
                a.sort_by_key(site_key);
                b.sort_by_key(site_key);
                a == b
            })
    }

    pub fn definitions(&self) -> Vec<Option<DefSite>> {
        let mut defs = vec![None; self.types.len()];
        for (b, block) in self.blocks.iter().enumerate() {
            let block_id = BlockId(b as u32);
            for (index, phi) in block.phis.iter().enumerate() {
                defs[phi.dst.index()] = Some(DefSite::Phi {
                    block: block_id,
                    index,
                });
            }
            for (index, inst) in block.insts.iter().enumerate() {
                if let Some(dst) = inst.dst {
                    defs[dst.index()] = Some(DefSite::Inst {
                        block: block_id,
                        index,
                    });
                }
            }
        }
        defs
    }

    /// Blocks reachable from the entry, in reverse postorder.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![(self.entry(), 0usize)];
        visited[0] = true;

        while let Some((block, next)) = stack.pop() {
            let succs = self.block(block).term.successors();
            if next < succs.len() {
                stack.push((block, next + 1));
                let succ = succs[next];
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                order.push(block);
            }
        }

        order.reverse();
        order
    }
}

fn site_key(site: &UseSite) -> (u32, u8, usize) {
    match *site {
        UseSite::Phi { block, index } => (block.0, 0, index),
        UseSite::Inst { block, index } => (block.0, 1, index),
        UseSite::Terminator { block } => (block.0, 2, 0),
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(v) => write!(f, "v{}", v.0),
            Operand::Const(c) => write!(f, "{c:#x}"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (b, block) in self.blocks.iter().enumerate() {
            let preds = block
                .preds
                .iter()
                .map(|p| format!("b{}", p.0))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "b{b}: ; preds: [{preds}]")?;
            for phi in &block.phis {
                let sources = phi
                    .sources
                    .iter()
                    .map(|(p, op)| format!("b{}: {op}", p.0))
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(f, "    v{} = phi [{sources}]", phi.dst.0)?;
            }
            for inst in &block.insts {
                let args = inst
                    .args
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                match inst.dst {
                    Some(dst) => writeln!(f, "    v{} = {:?} {args}", dst.0, inst.op)?,
                    None => writeln!(f, "    {:?} {args}", inst.op)?,
                }
            }
            match &block.term {
                Terminator::Pending => writeln!(f, "    <pending>")?,
                Terminator::Jump(t) => writeln!(f, "    jump b{}", t.0)?,
                Terminator::Branch {
                    cond,
                    taken,
                    not_taken,
                } => writeln!(f, "    branch {cond}, b{}, b{}", taken.0, not_taken.0)?,
                Terminator::Return(op) => writeln!(f, "    return {op}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Function {
        let mut func = Function::new();
        let entry = func.create_block();
        let left = func.create_block();
        let right = func.create_block();
        let join = func.create_block();

        let a = func.new_vreg(Type::I64);
        func.push(entry, Op::Copy, Some(a), vec![Operand::Const(1)]);
        func.set_terminator(
            entry,
            Terminator::Branch {
                cond: a.into(),
                taken: left,
                not_taken: right,
            },
        );

        let b = func.new_vreg(Type::I64);
        func.push(left, Op::Add, Some(b), vec![a.into(), Operand::Const(2)]);
        func.set_terminator(left, Terminator::Jump(join));
        func.set_terminator(right, Terminator::Jump(join));

        let c = func.new_vreg(Type::I64);
        let phi = func.push_phi(join, c);
        func.add_phi_source(join, phi, left, b.into());
        func.add_phi_source(join, phi, right, a.into());
        func.set_terminator(join, Terminator::Return(c.into()));
        func.rebuild();
        func
    }

    #[test]
    fn test_use_lists_track_every_operand() {
        let func = diamond();
        assert!(func.uses_consistent());
        assert_eq!(func.uses(VReg(0)).len(), 3);
        assert_eq!(func.uses(VReg(1)), &[UseSite::Phi {
            block: BlockId(3),
            index: 0
        }]);
        assert_eq!(func.uses(VReg(2)), &[UseSite::Terminator { block: BlockId(3) }]);
    }

    #[test]
    fn test_predecessors_and_order() {
        let func = diamond();
        assert_eq!(func.block(BlockId(3)).preds, vec![BlockId(1), BlockId(2)]);
        let rpo = func.reverse_postorder();
        assert_eq!(rpo.first(), Some(&BlockId(0)));
        assert_eq!(rpo.last(), Some(&BlockId(3)));
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn test_definitions() {
        let func = diamond();
        let defs = func.definitions();
        assert_eq!(
            defs[2],
            Some(DefSite::Phi {
                block: BlockId(3),
                index: 0
            })
        );
        assert_eq!(
            defs[1],
            Some(DefSite::Inst {
                block: BlockId(1),
                index: 0
            })
        );
    }
}
