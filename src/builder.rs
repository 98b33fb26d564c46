//! Guest code regions and their lowering to IR.
//!
//! A [`Region`] is the set of guest basic blocks reachable from an entry
//! address through direct branches inside a bounded window. [`build`] turns a
//! region into an SSA [`Function`]: guest registers live in virtual registers
//! between a prologue that loads them from the execution context and exits
//! that store back what the region may have changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::context::{ExitCode, NativeContext};
use crate::decoder::{
    decode, AddSubOp, BranchRegKind, CondSelectOp, Condition, DecodedInstruction, FpOp, LogicOp,
    MoveWideOp, Opcode, ShiftType,
};
use crate::ir::{BlockId, Function, Helper, IntCond, Op, Operand, Terminator, Type};

pub const DEFAULT_MAX_INSTRUCTIONS: usize = 256;

#[derive(Debug, Clone)]
pub struct GuestBlock {
    pub start: u64,
    pub insns: Vec<DecodedInstruction>,
}

impl GuestBlock {
    fn last(&self) -> Option<&DecodedInstruction> {
        self.insns.last()
    }

    pub fn end(&self) -> u64 {
        self.start.wrapping_add(4 * self.insns.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct Region {
    pub entry: u64,
    pub blocks: BTreeMap<u64, GuestBlock>,
}

impl Region {
    /// Decodes the blocks reachable from `entry`. `fetch` returns `None` for
    /// addresses that cannot be read; the region then ends there. An empty
    /// region means the entry itself could not be fetched.
    pub fn discover(
        entry: u64,
        max_instructions: usize,
        mut fetch: impl FnMut(u64) -> Option<u32>,
    ) -> Self {
        let window = entry..entry.saturating_add(4 * max_instructions as u64);
        let mut decoded = BTreeMap::<u64, DecodedInstruction>::new();
        let mut starts = BTreeSet::new();
        let mut work = vec![entry];

        while let Some(start) = work.pop() {
            starts.insert(start);
            let mut pc = start;
            while decoded.len() < max_instructions
                && window.contains(&pc)
                && !decoded.contains_key(&pc)
            {
                let Some(word) = fetch(pc) else { break };
                let insn = decode(pc, word);
                decoded.insert(pc, insn);

                match insn.opcode {
                    Opcode::Branch { link: false, .. } => {
                        work.extend(insn.branch_target().filter(|t| window.contains(t)));
                    }
                    Opcode::BranchCond { .. } | Opcode::CompareBranch { .. } => {
                        work.extend(insn.branch_target().filter(|t| window.contains(t)));
                        work.push(insn.next_address());
                    }
                    _ => {}
                }
                if insn.ends_block() {
                    break;
                }
                pc = insn.next_address();
            }
        }

        let mut blocks = BTreeMap::<u64, GuestBlock>::new();
        let mut current: Option<GuestBlock> = None;
        for (&pc, &insn) in &decoded {
            let continues = current.as_ref().is_some_and(|block| {
                block.end() == pc
                    && !starts.contains(&pc)
                    && !block.last().is_some_and(|last| last.ends_block())
            });
            if !continues {
                if let Some(block) = current.take() {
                    blocks.insert(block.start, block);
                }
                current = Some(GuestBlock {
                    start: pc,
                    insns: vec![],
                });
            }
            if let Some(block) = current.as_mut() {
                block.insns.push(insn);
            }
        }
        if let Some(block) = current {
            blocks.insert(block.start, block);
        }

        Self { entry, blocks }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.insns.len()).sum()
    }

    /// Guest bytes from the entry to the end of the furthest block.
    pub fn guest_size(&self) -> u64 {
        self.blocks
            .values()
            .map(|b| b.start - self.entry + 4 * b.insns.len() as u64)
            .max()
            .unwrap_or(0)
    }

    pub fn instructions(&self) -> impl Iterator<Item = &DecodedInstruction> {
        self.blocks.values().flat_map(|b| &b.insns)
    }

    /// In-region successors of a block, without duplicates.
    pub fn successors(&self, block: &GuestBlock) -> Vec<u64> {
        let Some(last) = block.last() else {
            return vec![];
        };
        let mut targets = match last.opcode {
            Opcode::Branch { link: false, .. } => last.branch_target().into_iter().collect(),
            Opcode::BranchCond { .. } | Opcode::CompareBranch { .. } => {
                let mut t = last.branch_target().into_iter().collect::<Vec<_>>();
                t.push(last.next_address());
                t
            }
            _ if last.ends_block() => vec![],
            _ => vec![last.next_address()],
        };
        targets.retain(|t| self.blocks.contains_key(t));
        targets.dedup();
        targets
    }

    pub fn reverse_postorder(&self) -> Vec<u64> {
        let mut visited = BTreeSet::new();
        let mut order = vec![];
        let mut stack = vec![(self.entry, 0usize)];
        if !self.blocks.contains_key(&self.entry) {
            return order;
        }
        visited.insert(self.entry);

        while let Some((addr, next)) = stack.pop() {
            let succs = self
                .blocks
                .get(&addr)
                .map(|b| self.successors(b))
                .unwrap_or_default();
            if next < succs.len() {
                stack.push((addr, next + 1));
                if visited.insert(succs[next]) {
                    stack.push((succs[next], 0));
                }
            } else {
                order.push(addr);
            }
        }
        order.reverse();
        order
    }
}

// Guest state elements carried in virtual registers.
const STATE_LEN: usize = 97;
const NZCV: usize = 32;

fn d_lo(r: u8) -> usize {
    33 + r as usize
}

fn d_hi(r: u8) -> usize {
    65 + r as usize
}

fn state_type(e: usize) -> Type {
    if (33..65).contains(&e) {
        Type::F64
    } else {
        Type::I64
    }
}

fn state_offset(e: usize) -> i32 {
    match e {
        0..=31 => NativeContext::x_offset(e),
        NZCV => NativeContext::nzcv_offset(),
        33..=64 => NativeContext::v_offset(e - 33),
        _ => NativeContext::v_offset(e - 65) + 8,
    }
}

/// Which guest state a region reads and writes.
pub struct Analysis {
    pub read: [bool; STATE_LEN],
    pub write: [bool; STATE_LEN],
}

impl Analysis {
    pub fn new(region: &Region) -> Self {
        let mut anal = Self {
            read: [false; STATE_LEN],
            write: [false; STATE_LEN],
        };
        for insn in region.instructions() {
            anal.record(insn);
        }
        anal
    }

    pub fn tracked(&self, e: usize) -> bool {
        self.read[e] || self.write[e]
    }

    fn x(&mut self, r: u8, sp: bool) {
        if r != 31 || sp {
            self.read[r as usize] = true;
        }
    }

    fn set_x(&mut self, r: u8, sp: bool) {
        if r != 31 || sp {
            self.write[r as usize] = true;
        }
    }

    fn set_d(&mut self, r: u8) {
        self.write[d_lo(r)] = true;
        self.write[d_hi(r)] = true;
    }

    fn record(&mut self, insn: &DecodedInstruction) {
        match insn.opcode {
            Opcode::AddSubImm {
                set_flags, rd, rn, ..
            } => {
                self.x(rn, true);
                self.set_x(rd, !set_flags);
                self.write[NZCV] |= set_flags;
            }
            Opcode::LogicalImm { op, rd, rn, .. } => {
                self.x(rn, false);
                self.set_x(rd, op != LogicOp::Ands);
                self.write[NZCV] |= op == LogicOp::Ands;
            }
            Opcode::MoveWide { op, rd, .. } => {
                if op == MoveWideOp::Movk {
                    self.x(rd, false);
                }
                self.set_x(rd, false);
            }
            Opcode::Adr { rd, .. } => self.set_x(rd, false),
            Opcode::LogicalReg { op, rd, rn, rm, .. } => {
                self.x(rn, false);
                self.x(rm, false);
                self.set_x(rd, false);
                self.write[NZCV] |= op == LogicOp::Ands;
            }
            Opcode::AddSubReg {
                set_flags,
                rd,
                rn,
                rm,
                ..
            } => {
                self.x(rn, false);
                self.x(rm, false);
                self.set_x(rd, false);
                self.write[NZCV] |= set_flags;
            }
            Opcode::MulAdd { rd, rn, rm, ra, .. } => {
                self.x(rn, false);
                self.x(rm, false);
                self.x(ra, false);
                self.set_x(rd, false);
            }
            Opcode::Div { rd, rn, rm, .. } | Opcode::ShiftReg { rd, rn, rm, .. } => {
                self.x(rn, false);
                self.x(rm, false);
                self.set_x(rd, false);
            }
            Opcode::CondSelect { rd, rn, rm, .. } => {
                self.x(rn, false);
                self.x(rm, false);
                self.read[NZCV] = true;
                self.set_x(rd, false);
            }
            Opcode::Branch { link, .. } => {
                if link {
                    self.set_x(30, false);
                }
            }
            Opcode::BranchCond { .. } => self.read[NZCV] = true,
            Opcode::CompareBranch { rt, .. } => self.x(rt, false),
            Opcode::BranchReg { kind, rn } => {
                self.x(rn, false);
                if kind == BranchRegKind::Blr {
                    self.set_x(30, false);
                }
            }
            Opcode::LoadStore { load, rt, rn, .. } => {
                self.x(rn, true);
                if load {
                    self.set_x(rt, false);
                } else {
                    self.x(rt, false);
                }
            }
            Opcode::FpArith { rd, rn, rm, .. } => {
                self.read[d_lo(rn)] = true;
                self.read[d_lo(rm)] = true;
                self.set_d(rd);
            }
            Opcode::FmovToFp { rd, rn } => {
                self.x(rn, false);
                self.set_d(rd);
            }
            Opcode::FmovFromFp { rd, rn } => {
                self.read[d_lo(rn)] = true;
                self.set_x(rd, false);
            }
            Opcode::Svc(_) | Opcode::Brk(_) | Opcode::Nop | Opcode::Undefined => {}
        }
    }
}

/// Control flow out of one guest instruction.
enum Flow {
    Next,
    Jump(u64),
    Cond(Operand, u64, u64),
    Exit(Operand),
}

struct IrBuilder<'a> {
    region: &'a Region,
    anal: Analysis,
    func: Function,
    block: BlockId,
    state: Vec<Operand>,
    heads: HashMap<u64, BlockId>,
}

pub fn build(region: &Region) -> Function {
    let mut builder = IrBuilder {
        region,
        anal: Analysis::new(region),
        func: Function::new(),
        block: BlockId(0),
        state: vec![Operand::Const(0); STATE_LEN],
        heads: HashMap::new(),
    };
    builder.build();
    builder.func.rebuild();
    builder.func
}

fn sext(value: u64, bits: u8) -> u64 {
    let shift = 64 - bits as u32;
    (((value << shift) as i64) >> shift) as u64
}

fn compare(cond: IntCond, a: u64, b: u64) -> bool {
    match cond {
        IntCond::Eq => a == b,
        IntCond::Ne => a != b,
        IntCond::Ult => a < b,
        IntCond::Uge => a >= b,
        IntCond::Slt => (a as i64) < (b as i64),
        IntCond::Sge => (a as i64) >= (b as i64),
    }
}

/// Evaluates an integer op whose operands are all constants.
pub fn fold(op: Op, args: &[Operand]) -> Option<u64> {
    let c = args
        .iter()
        .map(|a| a.constant())
        .collect::<Option<Vec<_>>>()?;
    Some(match op {
        Op::Copy => c[0],
        Op::Add => c[0].wrapping_add(c[1]),
        Op::Sub => c[0].wrapping_sub(c[1]),
        Op::Mul => c[0].wrapping_mul(c[1]),
        Op::UDiv => c[0].checked_div(c[1]).unwrap_or(0),
        Op::SDiv => {
            let (a, b) = (c[0] as i64, c[1] as i64);
            if b == 0 {
                0
            } else {
                a.wrapping_div(b) as u64
            }
        }
        Op::And => c[0] & c[1],
        Op::Or => c[0] | c[1],
        Op::Xor => c[0] ^ c[1],
        Op::Shl => c[0].wrapping_shl(c[1] as u32),
        Op::Lshr => c[0].wrapping_shr(c[1] as u32),
        Op::Ashr => (c[0] as i64).wrapping_shr(c[1] as u32) as u64,
        Op::Rotr => c[0].rotate_right((c[1] & 63) as u32),
        Op::Not => !c[0],
        Op::Sext(bits) => sext(c[0], bits),
        Op::Icmp(cond) => compare(cond, c[0], c[1]) as u64,
        Op::Select => {
            if c[0] != 0 {
                c[1]
            } else {
                c[2]
            }
        }
        _ => return None,
    })
}

impl IrBuilder<'_> {
    fn emit(&mut self, op: Op, args: Vec<Operand>) -> Operand {
        if let Some(value) = fold(op, &args) {
            return Operand::Const(value);
        }
        match (op, args.as_slice()) {
            (Op::Add | Op::Or | Op::Xor, [Operand::Const(0), x])
            | (Op::Add | Op::Sub | Op::Or | Op::Xor | Op::Shl | Op::Lshr, [x, Operand::Const(0)]) => {
                return *x
            }
            _ => {}
        }
        self.emit_typed(op, args, Type::I64)
    }

    fn emit_typed(&mut self, op: Op, args: Vec<Operand>, ty: Type) -> Operand {
        let dst = self.func.new_vreg(ty);
        self.func.push(self.block, op, Some(dst), args);
        Operand::Reg(dst)
    }

    fn emit_void(&mut self, op: Op, args: Vec<Operand>) {
        self.func.push(self.block, op, None, args);
    }

    fn binary(&mut self, op: Op, a: Operand, b: Operand) -> Operand {
        self.emit(op, vec![a, b])
    }

    fn x(&self, r: u8, sp: bool) -> Operand {
        if r == 31 && !sp {
            Operand::Const(0)
        } else {
            self.state[r as usize]
        }
    }

    fn set_x(&mut self, r: u8, value: Operand, sp: bool, sf: bool) {
        if r == 31 && !sp {
            return;
        }
        let value = self.truncate(value, sf);
        self.state[r as usize] = value;
    }

    fn d(&self, r: u8) -> Operand {
        self.state[d_lo(r)]
    }

    fn set_d(&mut self, r: u8, value: Operand) {
        self.state[d_lo(r)] = value;
        self.state[d_hi(r)] = Operand::Const(0);
    }

    fn truncate(&mut self, value: Operand, sf: bool) -> Operand {
        if sf {
            value
        } else {
            self.binary(Op::And, value, Operand::Const(0xffff_ffff))
        }
    }

    fn sign_bit(&mut self, value: Operand, sf: bool) -> Operand {
        let top = if sf { 63 } else { 31 };
        let bit = self.binary(Op::Lshr, value, Operand::Const(top));
        self.binary(Op::And, bit, Operand::Const(1))
    }

    /// Packs flags as `N<<31 | Z<<30 | C<<29 | V<<28` from a result that is
    /// already truncated to the operation width.
    fn set_flags(&mut self, result: Operand, carry: Operand, overflow: Operand, sf: bool) {
        let n = self.sign_bit(result, sf);
        let z = self.binary(Op::Icmp(IntCond::Eq), result, Operand::Const(0));
        let mut nzcv = Operand::Const(0);
        for (bit, shift) in [(n, 31), (z, 30), (carry, 29), (overflow, 28)] {
            let placed = self.binary(Op::Shl, bit, Operand::Const(shift));
            nzcv = self.binary(Op::Or, nzcv, placed);
        }
        self.state[NZCV] = nzcv;
    }

    fn add_sub(
        &mut self,
        op: AddSubOp,
        set_flags: bool,
        sf: bool,
        n: Operand,
        m: Operand,
    ) -> Operand {
        let n = self.truncate(n, sf);
        let m = self.truncate(m, sf);
        let result = match op {
            AddSubOp::Add => self.binary(Op::Add, n, m),
            AddSubOp::Sub => self.binary(Op::Sub, n, m),
        };
        let result = self.truncate(result, sf);

        if set_flags {
            let (carry, overflow) = match op {
                AddSubOp::Add => {
                    let carry = self.binary(Op::Icmp(IntCond::Ult), result, n);
                    let a = self.binary(Op::Xor, n, result);
                    let b = self.binary(Op::Xor, m, result);
                    (carry, self.binary(Op::And, a, b))
                }
                AddSubOp::Sub => {
                    let carry = self.binary(Op::Icmp(IntCond::Uge), n, m);
                    let a = self.binary(Op::Xor, n, m);
                    let b = self.binary(Op::Xor, n, result);
                    (carry, self.binary(Op::And, a, b))
                }
            };
            let overflow = self.sign_bit(overflow, sf);
            self.set_flags(result, carry, overflow, sf);
        }
        result
    }

    fn logical(&mut self, op: LogicOp, sf: bool, n: Operand, m: Operand) -> Operand {
        let result = match op {
            LogicOp::And | LogicOp::Ands => self.binary(Op::And, n, m),
            LogicOp::Orr => self.binary(Op::Or, n, m),
            LogicOp::Eor => self.binary(Op::Xor, n, m),
        };
        let result = self.truncate(result, sf);
        if op == LogicOp::Ands {
            let zero = Operand::Const(0);
            self.set_flags(result, zero, zero, sf);
        }
        result
    }

    /// Shifts `value` by `amount` within the operation width. The result
    /// is truncated to the width.
    fn shift(&mut self, shift: ShiftType, sf: bool, value: Operand, amount: Operand) -> Operand {
        let width = if sf { 64 } else { 32 };
        let amount = self.binary(Op::And, amount, Operand::Const(width - 1));
        let value = self.truncate(value, sf);
        let result = match (shift, sf) {
            (ShiftType::Lsl, _) => self.binary(Op::Shl, value, amount),
            (ShiftType::Lsr, _) => self.binary(Op::Lshr, value, amount),
            (ShiftType::Asr, true) => self.binary(Op::Ashr, value, amount),
            (ShiftType::Asr, false) => {
                let wide = self.emit(Op::Sext(32), vec![value]);
                self.binary(Op::Ashr, wide, amount)
            }
            (ShiftType::Ror, true) => self.binary(Op::Rotr, value, amount),
            (ShiftType::Ror, false) => {
                let low = self.binary(Op::Lshr, value, amount);
                let back = self.binary(Op::Sub, Operand::Const(32), amount);
                let back = self.binary(Op::And, back, Operand::Const(31));
                let high = self.binary(Op::Shl, value, back);
                self.binary(Op::Or, low, high)
            }
        };
        self.truncate(result, sf)
    }

    fn condition(&mut self, cond: Condition) -> Operand {
        let flags = self.state[NZCV];
        let flag = |b: &mut Self, shift: u64| {
            let bit = b.binary(Op::Lshr, flags, Operand::Const(shift));
            b.binary(Op::And, bit, Operand::Const(1))
        };
        let one = Operand::Const(1);
        let base = match cond.bits() >> 1 {
            0 => flag(self, 30),
            1 => flag(self, 29),
            2 => flag(self, 31),
            3 => flag(self, 28),
            4 => {
                let c = flag(self, 29);
                let z = flag(self, 30);
                let not_z = self.binary(Op::Xor, z, one);
                self.binary(Op::And, c, not_z)
            }
            5 | 6 => {
                let n = flag(self, 31);
                let v = flag(self, 28);
                let differ = self.binary(Op::Xor, n, v);
                let ge = self.binary(Op::Xor, differ, one);
                if cond.bits() >> 1 == 5 {
                    ge
                } else {
                    let z = flag(self, 30);
                    let not_z = self.binary(Op::Xor, z, one);
                    self.binary(Op::And, not_z, ge)
                }
            }
            _ => return one,
        };
        if cond.bits() & 1 == 1 {
            self.binary(Op::Xor, base, one)
        } else {
            base
        }
    }

    fn store_state(&mut self) {
        for e in 0..STATE_LEN {
            if self.anal.write[e] {
                let value = self.state[e];
                self.emit_void(Op::StoreContext(state_offset(e)), vec![value]);
            }
        }
    }

    fn exit(&mut self, next_pc: Operand) {
        self.store_state();
        self.func
            .set_terminator(self.block, Terminator::Return(next_pc));
    }

    fn raise(&mut self, code: ExitCode, info: u64) {
        self.emit_void(
            Op::StoreContext(NativeContext::exit_reason_offset()),
            vec![Operand::Const(code as u64)],
        );
        self.emit_void(
            Op::StoreContext(NativeContext::exit_info_offset()),
            vec![Operand::Const(info)],
        );
    }

    /// Leaves through a fresh block if a helper call flagged an exit.
    fn check_fault(&mut self, address: u64) {
        let status = self.emit_typed(
            Op::LoadContext(NativeContext::exit_reason_offset()),
            vec![],
            Type::I64,
        );
        let fault = self.func.create_block();
        let cont = self.func.create_block();
        self.func.set_terminator(
            self.block,
            Terminator::Branch {
                cond: status,
                taken: fault,
                not_taken: cont,
            },
        );
        self.block = fault;
        self.exit(Operand::Const(address));
        self.block = cont;
    }

    fn translate(&mut self, insn: &DecodedInstruction) -> Flow {
        let pc = insn.address;
        match insn.opcode {
            Opcode::AddSubImm {
                op,
                set_flags,
                sf,
                rd,
                rn,
                imm,
                ..
            } => {
                let n = self.x(rn, true);
                let result = self.add_sub(op, set_flags, sf, n, Operand::Const(imm));
                self.set_x(rd, result, !set_flags, sf);
            }
            Opcode::LogicalImm {
                op,
                sf,
                rd,
                rn,
                imm,
            } => {
                let n = self.x(rn, false);
                let result = self.logical(op, sf, n, Operand::Const(imm));
                self.set_x(rd, result, op != LogicOp::Ands, sf);
            }
            Opcode::MoveWide {
                op,
                sf,
                rd,
                imm16,
                shift,
            } => {
                let placed = (imm16 as u64) << shift;
                let result = match op {
                    MoveWideOp::Movz => Operand::Const(placed),
                    MoveWideOp::Movn => Operand::Const(!placed),
                    MoveWideOp::Movk => {
                        let old = self.x(rd, false);
                        let kept = self.binary(Op::And, old, Operand::Const(!(0xffff << shift)));
                        self.binary(Op::Or, kept, Operand::Const(placed))
                    }
                };
                self.set_x(rd, result, false, sf);
            }
            Opcode::Adr { page, rd, offset } => {
                let base = if page { pc & !0xfff } else { pc };
                self.set_x(rd, Operand::Const(base.wrapping_add(offset as u64)), false, true);
            }
            Opcode::LogicalReg {
                op,
                invert,
                sf,
                rd,
                rn,
                rm,
                shift,
                amount,
            } => {
                let m = self.x(rm, false);
                let m = self.shift(shift, sf, m, Operand::Const(amount as u64));
                let m = if invert {
                    self.emit(Op::Not, vec![m])
                } else {
                    m
                };
                let n = self.x(rn, false);
                let result = self.logical(op, sf, n, m);
                self.set_x(rd, result, false, sf);
            }
            Opcode::AddSubReg {
                op,
                set_flags,
                sf,
                rd,
                rn,
                rm,
                shift,
                amount,
            } => {
                let m = self.x(rm, false);
                let m = self.shift(shift, sf, m, Operand::Const(amount as u64));
                let n = self.x(rn, false);
                let result = self.add_sub(op, set_flags, sf, n, m);
                self.set_x(rd, result, false, sf);
            }
            Opcode::MulAdd {
                sub,
                sf,
                rd,
                rn,
                rm,
                ra,
            } => {
                let (n, m, a) = (self.x(rn, false), self.x(rm, false), self.x(ra, false));
                let product = self.binary(Op::Mul, n, m);
                let result = if sub {
                    self.binary(Op::Sub, a, product)
                } else {
                    self.binary(Op::Add, a, product)
                };
                self.set_x(rd, result, false, sf);
            }
            Opcode::Div {
                signed,
                sf,
                rd,
                rn,
                rm,
            } => {
                let (n, m) = (self.x(rn, false), self.x(rm, false));
                let result = match (signed, sf) {
                    (false, _) => {
                        let n = self.truncate(n, sf);
                        let m = self.truncate(m, sf);
                        self.binary(Op::UDiv, n, m)
                    }
                    (true, true) => self.binary(Op::SDiv, n, m),
                    (true, false) => {
                        let n = self.emit(Op::Sext(32), vec![n]);
                        let m = self.emit(Op::Sext(32), vec![m]);
                        self.binary(Op::SDiv, n, m)
                    }
                };
                self.set_x(rd, result, false, sf);
            }
            Opcode::ShiftReg {
                shift,
                sf,
                rd,
                rn,
                rm,
            } => {
                let (n, m) = (self.x(rn, false), self.x(rm, false));
                let result = self.shift(shift, sf, n, m);
                self.set_x(rd, result, false, sf);
            }
            Opcode::CondSelect {
                op,
                sf,
                rd,
                rn,
                rm,
                cond,
            } => {
                let taken = self.condition(cond);
                let (n, m) = (self.x(rn, false), self.x(rm, false));
                let alternative = match op {
                    CondSelectOp::Csel => m,
                    CondSelectOp::Csinc => self.binary(Op::Add, m, Operand::Const(1)),
                    CondSelectOp::Csinv => self.emit(Op::Not, vec![m]),
                    CondSelectOp::Csneg => self.binary(Op::Sub, Operand::Const(0), m),
                };
                let result = self.emit(Op::Select, vec![taken, n, alternative]);
                self.set_x(rd, result, false, sf);
            }
            Opcode::Branch { link, .. } => {
                let target = insn.branch_target().unwrap_or(pc);
                if link {
                    self.set_x(30, Operand::Const(pc.wrapping_add(4)), false, true);
                    return Flow::Exit(Operand::Const(target));
                }
                return Flow::Jump(target);
            }
            Opcode::BranchCond { cond, .. } => {
                let taken = self.condition(cond);
                let target = insn.branch_target().unwrap_or(pc);
                return Flow::Cond(taken, target, pc.wrapping_add(4));
            }
            Opcode::CompareBranch {
                nonzero, sf, rt, ..
            } => {
                let value = self.x(rt, false);
                let value = self.truncate(value, sf);
                let cond = if nonzero { IntCond::Ne } else { IntCond::Eq };
                let taken = self.binary(Op::Icmp(cond), value, Operand::Const(0));
                let target = insn.branch_target().unwrap_or(pc);
                return Flow::Cond(taken, target, pc.wrapping_add(4));
            }
            Opcode::BranchReg { kind, rn } => {
                let target = self.x(rn, false);
                if kind == BranchRegKind::Blr {
                    self.set_x(30, Operand::Const(pc.wrapping_add(4)), false, true);
                }
                return Flow::Exit(target);
            }
            Opcode::LoadStore {
                load,
                size,
                rt,
                rn,
                offset,
            } => {
                let base = self.x(rn, true);
                let address = self.binary(Op::Add, base, Operand::Const(offset));
                let size_arg = Operand::Const(size as u64);
                if load {
                    let value = self.emit_typed(
                        Op::Call(Helper::ReadMemory),
                        vec![address, size_arg],
                        Type::I64,
                    );
                    self.check_fault(pc);
                    self.set_x(rt, value, false, true);
                } else {
                    let value = self.x(rt, false);
                    self.emit_void(Op::Call(Helper::WriteMemory), vec![address, value, size_arg]);
                    self.check_fault(pc);
                }
            }
            Opcode::FpArith { op, rd, rn, rm } => {
                let op = match op {
                    FpOp::Add => Op::FAdd,
                    FpOp::Sub => Op::FSub,
                    FpOp::Mul => Op::FMul,
                    FpOp::Div => Op::FDiv,
                };
                let (n, m) = (self.d(rn), self.d(rm));
                let result = self.emit_typed(op, vec![n, m], Type::F64);
                self.set_d(rd, result);
            }
            Opcode::FmovToFp { rd, rn } => {
                let bits = self.x(rn, false);
                let value = self.emit_typed(Op::BitsToFloat, vec![bits], Type::F64);
                self.set_d(rd, value);
            }
            Opcode::FmovFromFp { rd, rn } => {
                let value = self.d(rn);
                let bits = self.emit_typed(Op::FloatToBits, vec![value], Type::I64);
                self.set_x(rd, bits, false, true);
            }
            Opcode::Svc(imm) => {
                self.raise(ExitCode::Supervisor, imm as u64);
                return Flow::Exit(Operand::Const(pc.wrapping_add(4)));
            }
            Opcode::Brk(imm) => {
                self.raise(ExitCode::Breakpoint, imm as u64);
                return Flow::Exit(Operand::Const(pc));
            }
            Opcode::Undefined => {
                self.raise(ExitCode::Undefined, insn.word as u64);
                return Flow::Exit(Operand::Const(pc));
            }
            Opcode::Nop => {}
        }
        Flow::Next
    }

    /// IR block for a control transfer to `target`: the block's head when
    /// it is in the region, otherwise a new exit block.
    fn target_block(&mut self, target: u64) -> BlockId {
        if let Some(&head) = self.heads.get(&target) {
            return head;
        }
        let current = self.block;
        let stub = self.func.create_block();
        self.block = stub;
        self.exit(Operand::Const(target));
        self.block = current;
        stub
    }

    /// Terminates the current block. `Next` falls through to `fallthrough`.
    fn finish(&mut self, flow: Flow, fallthrough: u64) {
        match flow {
            Flow::Next => self.finish(Flow::Jump(fallthrough), fallthrough),
            Flow::Jump(target) => {
                if let Some(&head) = self.heads.get(&target) {
                    self.func.set_terminator(self.block, Terminator::Jump(head));
                } else {
                    self.exit(Operand::Const(target));
                }
            }
            Flow::Cond(cond, taken, not_taken) => {
                let taken = self.target_block(taken);
                let not_taken = self.target_block(not_taken);
                let term = if taken == not_taken {
                    Terminator::Jump(taken)
                } else {
                    Terminator::Branch {
                        cond,
                        taken,
                        not_taken,
                    }
                };
                self.func.set_terminator(self.block, term);
            }
            Flow::Exit(next_pc) => self.exit(next_pc),
        }
    }

    fn build(&mut self) {
        let prologue = self.func.create_block();
        self.block = prologue;
        for e in 0..STATE_LEN {
            if self.anal.tracked(e) {
                self.state[e] =
                    self.emit_typed(Op::LoadContext(state_offset(e)), vec![], state_type(e));
            }
        }
        let prologue_state = self.state.clone();

        let region = self.region;
        let order = region.reverse_postorder();
        let rank = order
            .iter()
            .enumerate()
            .map(|(i, &addr)| (addr, i))
            .collect::<HashMap<_, _>>();

        let mut preds = HashMap::<u64, Vec<u64>>::new();
        for &addr in &order {
            if let Some(block) = region.blocks.get(&addr) {
                for succ in region.successors(block) {
                    preds.entry(succ).or_default().push(addr);
                }
            }
        }

        for &addr in &order {
            let head = self.func.create_block();
            self.heads.insert(addr, head);
        }
        let Some(&entry_head) = self.heads.get(&region.entry) else {
            // Nothing decodable: hand the entry back to the dispatcher.
            self.func
                .set_terminator(prologue, Terminator::Return(Operand::Const(region.entry)));
            return;
        };
        self.func.set_terminator(prologue, Terminator::Jump(entry_head));

        // Blocks entered from more than one place get a phi per tracked
        // state element.
        let mut phis = HashMap::<u64, Vec<(usize, usize)>>::new();
        for &addr in &order {
            let incoming = preds.get(&addr).map_or(0, |p| p.len()) + (addr == region.entry) as usize;
            let single_forward = incoming == 1
                && (addr == region.entry
                    || preds[&addr].iter().all(|p| rank[p] < rank[&addr]));
            if single_forward {
                continue;
            }
            let head = self.heads[&addr];
            let mut list = vec![];
            for e in 0..STATE_LEN {
                if self.anal.tracked(e) {
                    let dst = self.func.new_vreg(state_type(e));
                    list.push((e, self.func.push_phi(head, dst)));
                }
            }
            phis.insert(addr, list);
        }

        let mut exits = HashMap::<u64, (BlockId, Vec<Operand>)>::new();
        for &addr in &order {
            let Some(block) = region.blocks.get(&addr) else {
                continue;
            };
            let head = self.heads[&addr];

            self.state = match phis.get(&addr) {
                Some(list) => {
                    let mut state = prologue_state.clone();
                    for &(e, index) in list {
                        state[e] = Operand::Reg(self.func.block(head).phis[index].dst);
                    }
                    state
                }
                None if addr == region.entry => prologue_state.clone(),
                None => preds[&addr]
                    .first()
                    .and_then(|p| exits.get(p))
                    .map(|(_, state)| state.clone())
                    .unwrap_or_else(|| prologue_state.clone()),
            };
            self.block = head;

            let mut flow = Flow::Next;
            for insn in &block.insns {
                flow = self.translate(insn);
            }
            self.finish(flow, block.end());
            exits.insert(addr, (self.block, self.state.clone()));
        }

        for (addr, list) in &phis {
            let head = self.heads[addr];
            let mut incoming = preds
                .get(addr)
                .into_iter()
                .flatten()
                .filter_map(|p| exits.get(p).cloned())
                .collect::<Vec<_>>();
            if *addr == region.entry {
                incoming.push((prologue, prologue_state.clone()));
            }
            for (tail, state) in incoming {
                for &(e, index) in list {
                    self.func.add_phi_source(head, index, tail, state[e]);
                }
            }
        }
    }
}
