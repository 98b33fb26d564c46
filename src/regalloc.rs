//! Linear-scan register allocation over the SSA IR.
//!
//! Live ranges are approximated by one interval per virtual register (the hull
//! of its definition, its uses and the blocks it is live through). Intervals
//! that cross a helper call may only live in callee-saved registers; when no
//! suitable register is free the interval that ends furthest away is moved to
//! a spill slot. Spilled values are then materialized with explicit
//! `Spill`/`Reload` instructions through reserved scratch registers.

use std::collections::HashSet;

use crate::ir::{BlockId, DefSite, Function, Inst, Op, Operand, Terminator, Type, UseSite, VReg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    General,
    Vector,
}

impl RegisterType {
    pub fn of(ty: Type) -> Self {
        match ty {
            Type::I64 => RegisterType::General,
            Type::F64 => RegisterType::Vector,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Largest number of register operands a single instruction reads; that many
/// scratch registers must exist per register type.
pub const MAX_OPERANDS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMasks {
    pub available: u64,
    pub caller_saved: u64,
    pub callee_saved: u64,
    pub count: u32,
}

impl RegisterMasks {
    pub const fn new(available: u64, caller_saved: u64, callee_saved: u64, count: u32) -> Self {
        let masks = Self {
            available,
            caller_saved,
            callee_saved,
            count,
        };
        assert!(masks.scratch().count_ones() >= MAX_OPERANDS);
        assert!(available & !(caller_saved | callee_saved) == 0);
        masks
    }

    /// Saveable registers withheld from allocation, used to stage spilled
    /// operands.
    pub const fn scratch(&self) -> u64 {
        (self.caller_saved | self.callee_saved) & !self.available
    }

    fn nth_scratch(&self, n: u32) -> u8 {
        let mut mask = self.scratch();
        for _ in 0..n {
            mask &= mask - 1;
        }
        mask.trailing_zeros() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRegisters {
    pub general: RegisterMasks,
    pub vector: RegisterMasks,
}

impl HostRegisters {
    // System V: rsp and rbp are never handed out, r9-r11 and xmm13-xmm15 are
    // scratch.
    #[cfg(target_arch = "x86_64")]
    pub const HOST: Self = Self {
        general: RegisterMasks::new(0xf1cf, 0x0fc7, 0xf008, 16),
        vector: RegisterMasks::new(0x1fff, 0xffff, 0, 16),
    };

    // AAPCS64: x18, fp, lr and sp are reserved, x15-x17 and v29-v31 are
    // scratch. Only the low halves of v8-v15 are preserved, which covers the
    // scalar doubles kept in vector registers.
    #[cfg(not(target_arch = "x86_64"))]
    pub const HOST: Self = Self {
        general: RegisterMasks::new(0x1ff8_7fff, 0x3_ffff, 0x1ff8_0000, 32),
        vector: RegisterMasks::new(0x1fff_ffff, 0xffff_00ff, 0xff00, 32),
    };

    pub fn masks(&self, ty: RegisterType) -> &RegisterMasks {
        match ty {
            RegisterType::General => &self.general,
            RegisterType::Vector => &self.vector,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysReg {
    pub ty: RegisterType,
    pub index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The value is never live (dead code or unreachable block).
    Unassigned,
    Register(PhysReg),
    Spill(u32),
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub locations: Vec<Location>,
    pub spill_slots: u32,
    pub spill_stores: usize,
    pub reloads: usize,
    used: [u64; 2],
}

impl Allocation {
    pub fn location(&self, v: VReg) -> Location {
        self.locations[v.index()]
    }

    pub fn used_registers(&self, ty: RegisterType) -> u64 {
        self.used[ty.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub vreg: VReg,
    pub start: u32,
    pub end: u32,
}

impl Interval {
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Instruction numbering and live intervals of a function.
///
/// Every block gets a header slot (phi definitions), one slot per
/// instruction and one for the terminator. Slot `i` reads its operands at
/// position `2i` and writes its result at `2i + 1`.
pub struct Liveness {
    pub order: Vec<BlockId>,
    header: Vec<u32>,
    terminator: Vec<u32>,
    pub intervals: Vec<Option<Interval>>,
    pub calls: Vec<u32>,
}

impl Liveness {
    pub fn compute(func: &Function) -> Self {
        let order = func.reverse_postorder();
        let mut reachable = vec![false; func.blocks.len()];
        let mut header = vec![0; func.blocks.len()];
        let mut terminator = vec![0; func.blocks.len()];
        let mut calls = vec![];

        let mut slot = 0u32;
        for &b in &order {
            reachable[b.index()] = true;
            header[b.index()] = slot;
            slot += 1;
            for inst in &func.block(b).insts {
                if inst.op.is_call() {
                    calls.push(2 * slot);
                }
                slot += 1;
            }
            terminator[b.index()] = slot;
            slot += 1;
        }

        let mut live = Self {
            order,
            header,
            terminator,
            intervals: vec![None; func.vreg_count()],
            calls,
        };

        let defs = func.definitions();
        for v in 0..func.vreg_count() {
            let vreg = VReg(v as u32);
            let Some(def) = defs[v] else { continue };
            let (def_block, def_pos) = match def {
                DefSite::Phi { block, .. } => (block, 2 * live.header[block.index()] + 1),
                DefSite::Inst { block, index } => {
                    (block, 2 * (live.header[block.index()] + 1 + index as u32) + 1)
                }
            };
            if !reachable[def_block.index()] {
                continue;
            }

            let mut interval = Interval {
                vreg,
                start: def_pos,
                end: def_pos,
            };
            let mut live_in = HashSet::new();

            for &site in func.uses(vreg) {
                match site {
                    UseSite::Inst { block, index } => {
                        if !reachable[block.index()] {
                            continue;
                        }
                        let pos = 2 * (live.header[block.index()] + 1 + index as u32);
                        live.extend(&mut interval, pos);
                        if block != def_block {
                            live.mark_live_in(func, &reachable, &mut interval, &mut live_in, block, def_block);
                        }
                    }
                    UseSite::Terminator { block } => {
                        if !reachable[block.index()] {
                            continue;
                        }
                        live.extend(&mut interval, 2 * live.terminator[block.index()]);
                        if block != def_block {
                            live.mark_live_in(func, &reachable, &mut interval, &mut live_in, block, def_block);
                        }
                    }
                    UseSite::Phi { block, index } => {
                        let phi = &func.block(block).phis[index];
                        for &(pred, op) in &phi.sources {
                            if op != Operand::Reg(vreg) || !reachable[pred.index()] {
                                continue;
                            }
                            live.extend(&mut interval, 2 * live.terminator[pred.index()] + 1);
                            if pred != def_block {
                                live.mark_live_in(func, &reachable, &mut interval, &mut live_in, pred, def_block);
                            }
                        }
                    }
                }
            }

            live.intervals[v] = Some(interval);
        }

        live
    }

    fn extend(&self, interval: &mut Interval, pos: u32) {
        interval.start = interval.start.min(pos);
        interval.end = interval.end.max(pos);
    }

    fn mark_live_in(
        &self,
        func: &Function,
        reachable: &[bool],
        interval: &mut Interval,
        live_in: &mut HashSet<BlockId>,
        block: BlockId,
        def_block: BlockId,
    ) {
        let mut work = vec![block];
        while let Some(b) = work.pop() {
            if b == def_block || !live_in.insert(b) {
                continue;
            }
            self.extend(interval, 2 * self.header[b.index()]);
            for &pred in &func.block(b).preds {
                if !reachable[pred.index()] {
                    continue;
                }
                self.extend(interval, 2 * self.terminator[pred.index()] + 1);
                work.push(pred);
            }
        }
    }

    pub fn crosses_call(&self, interval: &Interval) -> bool {
        self.calls
            .iter()
            .any(|&call| interval.start < call && interval.end > call + 1)
    }
}

pub fn allocate(func: &mut Function, regs: &HostRegisters) -> Allocation {
    let liveness = Liveness::compute(func);
    let mut allocation = linear_scan(func, &liveness, regs);
    insert_spill_code(func, &mut allocation, regs);
    allocation
}

fn linear_scan(func: &Function, liveness: &Liveness, regs: &HostRegisters) -> Allocation {
    let mut intervals = liveness
        .intervals
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>();
    intervals.sort_by_key(|i| (i.start, i.vreg));

    let mut locations = vec![Location::Unassigned; func.vreg_count()];
    let mut free = [regs.general.available, regs.vector.available];
    let mut used = [0u64; 2];
    let mut active: Vec<(Interval, PhysReg)> = vec![];

    // Intervals held by each spill slot. A slot is shared only by values
    // whose intervals are disjoint.
    let mut slots: Vec<Vec<Interval>> = vec![];

    let spill = |interval: Interval,
                 locations: &mut Vec<Location>,
                 slots: &mut Vec<Vec<Interval>>| {
        let slot = match slots
            .iter()
            .position(|held| held.iter().all(|other| !other.overlaps(&interval)))
        {
            Some(slot) => slot,
            None => {
                slots.push(vec![]);
                slots.len() - 1
            }
        };
        slots[slot].push(interval);
        locations[interval.vreg.index()] = Location::Spill(slot as u32);
    };

    for current in intervals {
        active.retain(|(interval, reg)| {
            if interval.end < current.start {
                free[reg.ty.index()] |= 1 << reg.index;
                false
            } else {
                true
            }
        });

        let ty = RegisterType::of(func.vreg_type(current.vreg));
        let masks = regs.masks(ty);
        let crosses = liveness.crosses_call(&current);
        let allowed = if crosses {
            masks.available & masks.callee_saved
        } else {
            masks.available
        };

        let candidates = free[ty.index()] & allowed;
        if candidates != 0 {
            // Values that do not survive a call stay in caller-saved registers
            // so callee-saved ones remain for values that do.
            let preferred = if crosses {
                candidates
            } else {
                candidates & masks.caller_saved
            };
            let pick = if preferred != 0 { preferred } else { candidates };
            let reg = PhysReg {
                ty,
                index: pick.trailing_zeros() as u8,
            };
            free[ty.index()] &= !(1 << reg.index);
            used[ty.index()] |= 1 << reg.index;
            locations[current.vreg.index()] = Location::Register(reg);
            active.push((current, reg));
            continue;
        }

        let victim = active
            .iter()
            .enumerate()
            .filter(|(_, (_, reg))| reg.ty == ty && allowed & (1 << reg.index) != 0)
            .max_by_key(|(_, (interval, _))| (interval.end, interval.vreg))
            .map(|(i, _)| i);

        match victim {
            Some(i) if active[i].0.end > current.end => {
                let (victim, reg) = active.swap_remove(i);
                spill(victim, &mut locations, &mut slots);
                locations[current.vreg.index()] = Location::Register(reg);
                active.push((current, reg));
            }
            _ => spill(current, &mut locations, &mut slots),
        }
    }

    Allocation {
        locations,
        spill_slots: slots.len() as u32,
        spill_stores: 0,
        reloads: 0,
        used,
    }
}

fn insert_spill_code(func: &mut Function, allocation: &mut Allocation, regs: &HostRegisters) {
    for b in 0..func.blocks.len() {
        let block = BlockId(b as u32);
        let old = std::mem::take(&mut func.block_mut(block).insts);
        let mut insts = Vec::with_capacity(old.len());

        for mut inst in old {
            let mut staged = Stager::default();
            for arg in &mut inst.args {
                *arg = staged.reload(func, allocation, regs, &mut insts, *arg);
            }

            match inst.dst.map(|dst| (dst, allocation.location(dst))) {
                Some((dst, Location::Spill(slot))) => {
                    let ty = func.vreg_type(dst);
                    let temp = func.new_vreg(ty);
                    let masks = regs.masks(RegisterType::of(ty));
                    allocation.locations.push(Location::Register(PhysReg {
                        ty: RegisterType::of(ty),
                        index: masks.nth_scratch(0),
                    }));
                    inst.dst = Some(temp);
                    insts.push(inst);
                    insts.push(Inst {
                        op: Op::Spill(slot),
                        dst: None,
                        args: vec![Operand::Reg(temp)],
                    });
                    allocation.spill_stores += 1;
                }
                _ => insts.push(inst),
            }
        }

        let mut term = func.block(block).term.clone();
        let mut staged = Stager::default();
        let operands = term.operands();
        if operands.iter().any(|op| is_spilled(allocation, *op)) {
            let mut rewritten = vec![];
            for op in operands {
                rewritten.push(staged.reload(func, allocation, regs, &mut insts, op));
            }
            term = match term {
                Terminator::Branch {
                    taken, not_taken, ..
                } => Terminator::Branch {
                    cond: rewritten[0],
                    taken,
                    not_taken,
                },
                Terminator::Return(_) => Terminator::Return(rewritten[0]),
                other => other,
            };
        }

        let data = func.block_mut(block);
        data.insts = insts;
        data.term = term;
    }

    func.rebuild();
}

fn is_spilled(allocation: &Allocation, op: Operand) -> bool {
    matches!(op, Operand::Reg(v) if matches!(allocation.location(v), Location::Spill(_)))
}

/// Hands out scratch registers for the spilled operands of one instruction.
#[derive(Default)]
struct Stager {
    taken: [u32; 2],
    reloaded: Vec<(VReg, VReg)>,
}

impl Stager {
    fn reload(
        &mut self,
        func: &mut Function,
        allocation: &mut Allocation,
        regs: &HostRegisters,
        insts: &mut Vec<Inst>,
        op: Operand,
    ) -> Operand {
        let Operand::Reg(v) = op else { return op };
        let Location::Spill(slot) = allocation.location(v) else {
            return op;
        };
        if let Some(&(_, temp)) = self.reloaded.iter().find(|(orig, _)| *orig == v) {
            return Operand::Reg(temp);
        }

        let ty = func.vreg_type(v);
        let rt = RegisterType::of(ty);
        let temp = func.new_vreg(ty);
        allocation.locations.push(Location::Register(PhysReg {
            ty: rt,
            index: regs.masks(rt).nth_scratch(self.taken[rt.index()]),
        }));
        self.taken[rt.index()] += 1;
        self.reloaded.push((v, temp));

        insts.push(Inst {
            op: Op::Reload(slot),
            dst: Some(temp),
            args: vec![],
        });
        allocation.reloads += 1;
        Operand::Reg(temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Helper, IntCond};

    fn masks_with(available: u32) -> HostRegisters {
        // 16 registers: the low `available` are allocatable, 13..16 are
        // scratch, 8..13 callee-saved.
        let avail = (1u64 << available) - 1;
        let general = RegisterMasks::new(avail, 0xe0ff, 0x1f00, 16);
        HostRegisters {
            general,
            vector: RegisterMasks::new(0xff, 0xffff, 0, 16),
        }
    }

    /// `n` values defined up front and all consumed by one final sum.
    fn overlapping(n: usize) -> Function {
        let mut func = Function::new();
        let entry = func.create_block();
        let vals = (0..n)
            .map(|i| {
                let v = func.new_vreg(Type::I64);
                func.push(entry, Op::Copy, Some(v), vec![Operand::Const(i as u64)]);
                v
            })
            .collect::<Vec<_>>();
        let mut acc = vals[0];
        for &v in &vals[1..] {
            let sum = func.new_vreg(Type::I64);
            func.push(entry, Op::Add, Some(sum), vec![acc.into(), v.into()]);
            acc = sum;
        }
        func.set_terminator(entry, Terminator::Return(acc.into()));
        func.rebuild();
        func
    }

    fn assert_no_conflicts(func: &Function, allocation: &Allocation) {
        let liveness = Liveness::compute(func);
        let intervals = liveness.intervals.iter().flatten().collect::<Vec<_>>();
        for (i, a) in intervals.iter().enumerate() {
            for b in &intervals[i + 1..] {
                if !a.overlaps(b) {
                    continue;
                }
                if let (Location::Register(ra), Location::Register(rb)) =
                    (allocation.location(a.vreg), allocation.location(b.vreg))
                {
                    assert_ne!(ra, rb, "v{} and v{} share {ra:?}", a.vreg.0, b.vreg.0);
                }
            }
        }
    }

    #[test]
    fn test_spills_exactly_the_excess() {
        for (n, m) in [(6, 4), (10, 3), (8, 8), (12, 1)] {
            let mut func = overlapping(n);
            let regs = masks_with(m);
            let allocation = allocate(&mut func, &regs);

            let spills = func
                .blocks
                .iter()
                .flat_map(|b| &b.insts)
                .filter(|i| matches!(i.op, Op::Spill(_)))
                .count();

            // All n inputs are live when the last one is defined.
            assert_eq!(spills, n.saturating_sub(m as usize), "n={n} m={m}");
            assert_eq!(allocation.spill_stores, spills);
            assert!(func.uses_consistent());
            assert_no_conflicts(&func, &allocation);
        }
    }

    fn assert_disjoint_slots(func: &Function, allocation: &Allocation) {
        let liveness = Liveness::compute(func);
        let intervals = liveness.intervals.iter().flatten().collect::<Vec<_>>();
        for (i, a) in intervals.iter().enumerate() {
            for b in &intervals[i + 1..] {
                if let (Location::Spill(sa), Location::Spill(sb)) =
                    (allocation.location(a.vreg), allocation.location(b.vreg))
                {
                    assert!(
                        sa != sb || !a.overlaps(b),
                        "{a:?} and {b:?} share slot {sa}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_evicted_value_does_not_reuse_overlapping_slot() {
        // `a` is spilled on definition and dies before `r` starts. `v` is
        // evicted later by `c` but was already live while `a` held its slot.
        let mut func = Function::new();
        let entry = func.create_block();
        let value = |func: &mut Function, c: u64| {
            let v = func.new_vreg(Type::I64);
            func.push(entry, Op::Copy, Some(v), vec![Operand::Const(c)]);
            v
        };
        let consume = |func: &mut Function, v: VReg| {
            func.push(entry, Op::StoreContext(0), None, vec![v.into()]);
        };

        let p = value(&mut func, 0);
        let q = value(&mut func, 1);
        let a = value(&mut func, 2);
        consume(&mut func, p);
        let v = value(&mut func, 3);
        consume(&mut func, q);
        consume(&mut func, a);
        let r = value(&mut func, 4);
        let c = value(&mut func, 5);
        consume(&mut func, c);
        consume(&mut func, r);
        consume(&mut func, v);
        func.set_terminator(entry, Terminator::Return(Operand::Const(0)));
        func.rebuild();

        let liveness = Liveness::compute(&func);
        let allocation = linear_scan(&func, &liveness, &masks_with(2));
        assert!(matches!(allocation.location(a), Location::Spill(_)));
        assert!(matches!(allocation.location(v), Location::Spill(_)));
        assert_ne!(allocation.location(a), allocation.location(v));
        assert_eq!(allocation.spill_slots, 2);
        assert_disjoint_slots(&func, &allocation);
    }

    #[test]
    fn test_spill_slots_under_pressure_are_disjoint() {
        for (n, m) in [(6, 2), (12, 3), (20, 1)] {
            let func = overlapping(n);
            let liveness = Liveness::compute(&func);
            let allocation = linear_scan(&func, &liveness, &masks_with(m));
            assert_disjoint_slots(&func, &allocation);
        }
    }

    #[test]
    fn test_spill_precedes_reload() {
        let mut func = overlapping(5);
        let allocation = allocate(&mut func, &masks_with(2));
        let insts = &func.blocks[0].insts;
        for (i, inst) in insts.iter().enumerate() {
            if let Op::Reload(slot) = inst.op {
                assert!(insts[..i]
                    .iter()
                    .any(|earlier| earlier.op == Op::Spill(slot)));
            }
        }
        assert!(allocation.reloads > 0);
        assert!(allocation.spill_slots >= 1);
    }

    #[test]
    fn test_values_live_across_calls_use_callee_saved() {
        let mut func = Function::new();
        let entry = func.create_block();
        let a = func.new_vreg(Type::I64);
        let loaded = func.new_vreg(Type::I64);
        let sum = func.new_vreg(Type::I64);
        func.push(entry, Op::Copy, Some(a), vec![Operand::Const(7)]);
        func.push(
            entry,
            Op::Call(Helper::ReadMemory),
            Some(loaded),
            vec![Operand::Const(0x1000), Operand::Const(3)],
        );
        func.push(entry, Op::Add, Some(sum), vec![a.into(), loaded.into()]);
        func.set_terminator(entry, Terminator::Return(sum.into()));
        func.rebuild();

        let regs = masks_with(13);
        let allocation = allocate(&mut func, &regs);

        match allocation.location(a) {
            Location::Register(reg) => {
                assert_ne!(regs.general.callee_saved & (1 << reg.index), 0)
            }
            other => panic!("unexpected {other:?}"),
        }
        match allocation.location(loaded) {
            Location::Register(reg) => {
                assert_ne!(regs.general.caller_saved & (1 << reg.index), 0)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_call_crossing_spills_without_callee_saved() {
        let mut func = Function::new();
        let entry = func.create_block();
        let a = func.new_vreg(Type::F64);
        let loaded = func.new_vreg(Type::I64);
        let out = func.new_vreg(Type::I64);
        func.push(entry, Op::BitsToFloat, Some(a), vec![Operand::Const(0)]);
        func.push(
            entry,
            Op::Call(Helper::ReadMemory),
            Some(loaded),
            vec![Operand::Const(0), Operand::Const(3)],
        );
        func.push(entry, Op::FloatToBits, Some(out), vec![a.into()]);
        func.set_terminator(entry, Terminator::Return(out.into()));
        func.rebuild();

        let allocation = allocate(&mut func, &masks_with(8));
        assert_eq!(allocation.location(a), Location::Spill(0));
        assert_eq!(allocation.spill_stores, 1);
    }

    #[test]
    fn test_loop_carried_values_do_not_collide() {
        let mut func = Function::new();
        let entry = func.create_block();
        let header = func.create_block();
        let exit = func.create_block();

        let init = func.new_vreg(Type::I64);
        let limit = func.new_vreg(Type::I64);
        func.push(entry, Op::Copy, Some(init), vec![Operand::Const(0)]);
        func.push(entry, Op::Copy, Some(limit), vec![Operand::Const(10)]);
        func.set_terminator(entry, Terminator::Jump(header));

        let counter = func.new_vreg(Type::I64);
        let next = func.new_vreg(Type::I64);
        let done = func.new_vreg(Type::I64);
        let phi = func.push_phi(header, counter);
        func.push(header, Op::Add, Some(next), vec![counter.into(), Operand::Const(1)]);
        func.push(
            header,
            Op::Icmp(IntCond::Eq),
            Some(done),
            vec![next.into(), limit.into()],
        );
        func.set_terminator(
            header,
            Terminator::Branch {
                cond: done.into(),
                taken: exit,
                not_taken: header,
            },
        );
        func.add_phi_source(header, phi, entry, init.into());
        func.add_phi_source(header, phi, header, next.into());
        func.set_terminator(exit, Terminator::Return(next.into()));
        func.rebuild();

        let liveness = Liveness::compute(&func);
        let limit_interval = liveness.intervals[limit.index()].unwrap();
        let done_interval = liveness.intervals[done.index()].unwrap();
        // Live around the back edge, past the branch that reads `done`.
        assert!(limit_interval.end > done_interval.end);

        let allocation = allocate(&mut func, &masks_with(8));
        assert_no_conflicts(&func, &allocation);
    }

    #[test]
    fn test_host_masks_have_scratch() {
        for masks in [HostRegisters::HOST.general, HostRegisters::HOST.vector] {
            assert!(masks.scratch().count_ones() >= MAX_OPERANDS);
            assert_eq!(masks.available & masks.scratch(), 0);
            assert!(masks.count <= 64);
        }
    }
}
