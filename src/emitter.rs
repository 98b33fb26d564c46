//! Lowers allocated IR to host machine code with Cranelift.
//!
//! Every host register the allocator hands out becomes one Cranelift
//! variable, so values that share a register share a variable. Spill slots
//! and guest state live in the [`NativeContext`] passed as the only argument.

use cranelift::codegen::control::ControlPlane;
use cranelift::codegen::ir::SigRef;
use cranelift::codegen::{self, isa::OwnedTargetIsa};
use cranelift::prelude::*;
use log::{log_enabled, Level};

use crate::context::{NativeContext, SPILL_SLOTS};
use crate::error::{JitError, JitResult};
use crate::ir::{self, BlockId, Function, Helper, IntCond, Op, Operand, Terminator};
use crate::regalloc::{Allocation, Location, PhysReg, RegisterType};

// Vector registers are numbered after this many general variables.
const VECTOR_VARIABLE_BASE: u32 = 64;
const VARIABLES_PER_CLASS: u32 = 64;

fn variable(reg: PhysReg) -> Variable {
    match reg.ty {
        RegisterType::General => Variable::from_u32(reg.index as u32),
        RegisterType::Vector => Variable::from_u32(VECTOR_VARIABLE_BASE + reg.index as u32),
    }
}

fn clif_type(ty: ir::Type) -> Type {
    match ty {
        ir::Type::I64 => types::I64,
        ir::Type::F64 => types::F64,
    }
}

fn int_cc(cond: IntCond) -> IntCC {
    match cond {
        IntCond::Eq => IntCC::Equal,
        IntCond::Ne => IntCC::NotEqual,
        IntCond::Ult => IntCC::UnsignedLessThan,
        IntCond::Uge => IntCC::UnsignedGreaterThanOrEqual,
        IntCond::Slt => IntCC::SignedLessThan,
        IntCond::Sge => IntCC::SignedGreaterThanOrEqual,
    }
}

fn codegen_error(reason: impl ToString) -> JitError {
    JitError::Codegen {
        reason: reason.to_string(),
    }
}

/// Shared by every translating thread. Each [`Emitter::emit`] call builds
/// in its own Cranelift context.
pub struct Emitter {
    isa: OwnedTargetIsa,
}

impl Emitter {
    pub fn new() -> JitResult<Self> {
        let mut flag_builder = settings::builder();
        for (name, value) in [
            ("opt_level", "speed"),
            ("preserve_frame_pointers", "true"),
            ("unwind_info", "false"),
        ] {
            flag_builder.set(name, value).map_err(codegen_error)?;
        }
        let isa = cranelift_native::builder()
            .map_err(codegen_error)?
            .finish(settings::Flags::new(flag_builder))
            .map_err(codegen_error)?;
        log::info!("*** JIT target ISA: {}", isa.triple());

        Ok(Self { isa })
    }

    pub fn target(&self) -> String {
        self.isa.triple().to_string()
    }

    /// Compiles `func` into position-independent machine code with the
    /// [`crate::context::EntryPoint`] signature.
    pub fn emit(&self, func: &Function, allocation: &Allocation) -> JitResult<Vec<u8>> {
        if allocation.spill_slots as usize > SPILL_SLOTS {
            return Err(JitError::SpillAreaExhausted {
                slots: allocation.spill_slots as usize,
            });
        }

        let mut ctx = codegen::Context::new();
        let mut builder_ctx = FunctionBuilderContext::new();
        let pointer = self.isa.pointer_type();
        let call_conv = self.isa.default_call_conv();
        ctx.func.signature.call_conv = call_conv;
        ctx.func.signature.params.push(AbiParam::new(pointer));
        ctx.func.signature.returns.push(AbiParam::new(types::I64));

        Lowering::lower(
            FunctionBuilder::new(&mut ctx.func, &mut builder_ctx),
            func,
            allocation,
            pointer,
            call_conv,
        )?;

        if log_enabled!(Level::Trace) {
            log::trace!("*** Cranelift IR:\n{}", ctx.func.display());
        }
        ctx.set_disasm(log_enabled!(Level::Debug));

        let compiled = ctx
            .compile(&*self.isa, &mut ControlPlane::default())
            .map_err(|e| codegen_error(e.inner))?;

        if !compiled.buffer.relocs().is_empty() {
            return Err(codegen_error("generated code needs relocation"));
        }
        if let Some(vcode) = compiled.vcode.as_ref() {
            log::debug!("*** Generated Assembly:");
            log::debug!("{vcode}");
        }
        Ok(compiled.code_buffer().to_vec())
    }
}

struct Lowering<'a, 'b> {
    builder: FunctionBuilder<'b>,
    func: &'a Function,
    allocation: &'a Allocation,
    pointer: Type,
    ctx: Value,
    blocks: Vec<Option<Block>>,
    read_sig: SigRef,
    write_sig: SigRef,
}

impl<'a, 'b> Lowering<'a, 'b> {
    fn lower(
        mut builder: FunctionBuilder<'b>,
        func: &'a Function,
        allocation: &'a Allocation,
        pointer: Type,
        call_conv: isa::CallConv,
    ) -> JitResult<()> {
        for index in 0..VARIABLES_PER_CLASS {
            builder.declare_var(Variable::from_u32(index), types::I64);
            builder.declare_var(Variable::from_u32(VECTOR_VARIABLE_BASE + index), types::F64);
        }

        let read_sig = builder.import_signature(Signature {
            params: vec![
                AbiParam::new(pointer),
                AbiParam::new(types::I64),
                AbiParam::new(types::I64),
            ],
            returns: vec![AbiParam::new(types::I64)],
            call_conv,
        });
        let write_sig = builder.import_signature(Signature {
            params: vec![
                AbiParam::new(pointer),
                AbiParam::new(types::I64),
                AbiParam::new(types::I64),
                AbiParam::new(types::I64),
            ],
            returns: vec![],
            call_conv,
        });

        let order = func.reverse_postorder();
        let mut blocks = vec![None; func.blocks.len()];
        for &id in &order {
            blocks[id.index()] = Some(builder.create_block());
        }
        let entry = blocks[func.entry().index()].ok_or_else(|| codegen_error("no entry block"))?;
        builder.append_block_params_for_function_params(entry);
        let ctx = builder.block_params(entry)[0];

        let mut lowering = Lowering {
            builder,
            func,
            allocation,
            pointer,
            ctx,
            blocks,
            read_sig,
            write_sig,
        };
        for id in order {
            lowering.block(id)?;
        }

        lowering.builder.seal_all_blocks();
        lowering.builder.finalize();
        Ok(())
    }

    fn clif_block(&self, id: BlockId) -> JitResult<Block> {
        self.blocks[id.index()].ok_or_else(|| codegen_error(format!("b{} is unreachable", id.0)))
    }

    fn constant(&mut self, value: u64, ty: ir::Type) -> Value {
        match ty {
            ir::Type::I64 => self.builder.ins().iconst(types::I64, value as i64),
            ir::Type::F64 => self.builder.ins().f64const(f64::from_bits(value)),
        }
    }

    /// Reads an operand. Constants take the type `ty`.
    fn read(&mut self, op: Operand, ty: ir::Type) -> JitResult<Value> {
        let v = match op {
            Operand::Const(c) => return Ok(self.constant(c, ty)),
            Operand::Reg(v) => v,
        };
        match self.allocation.location(v) {
            Location::Register(reg) => Ok(self.builder.use_var(variable(reg))),
            Location::Spill(slot) => Ok(self.builder.ins().load(
                clif_type(self.func.vreg_type(v)),
                MemFlags::trusted(),
                self.ctx,
                NativeContext::spill_offset(slot),
            )),
            Location::Unassigned => Err(codegen_error(format!("{op} has no location"))),
        }
    }

    fn write(&mut self, dst: ir::VReg, value: Value) {
        match self.allocation.location(dst) {
            Location::Register(reg) => self.builder.def_var(variable(reg), value),
            Location::Spill(slot) => {
                self.builder.ins().store(
                    MemFlags::trusted(),
                    value,
                    self.ctx,
                    NativeContext::spill_offset(slot),
                );
            }
            // Never read.
            Location::Unassigned => {}
        }
    }

    fn operand_type(&self, op: Operand, default: ir::Type) -> ir::Type {
        match op {
            Operand::Reg(v) => self.func.vreg_type(v),
            Operand::Const(_) => default,
        }
    }

    fn helper(&mut self, offset: i32) -> Value {
        let table = self.builder.ins().load(
            self.pointer,
            MemFlags::trusted(),
            self.ctx,
            NativeContext::helpers_offset(),
        );
        self.builder
            .ins()
            .load(self.pointer, MemFlags::trusted(), table, offset)
    }

    fn guarded_div(&mut self, signed: bool, n: Value, m: Value) -> Value {
        let zero = self.builder.ins().iconst(types::I64, 0);
        let one = self.builder.ins().iconst(types::I64, 1);
        let by_zero = self.builder.ins().icmp_imm(IntCC::Equal, m, 0);
        if !signed {
            let divisor = self.builder.ins().select(by_zero, one, m);
            let q = self.builder.ins().udiv(n, divisor);
            return self.builder.ins().select(by_zero, zero, q);
        }
        let by_minus_one = self.builder.ins().icmp_imm(IntCC::Equal, m, -1);
        let is_min = self.builder.ins().icmp_imm(IntCC::Equal, n, i64::MIN);
        let overflow = self.builder.ins().band(by_minus_one, is_min);
        let trapping = self.builder.ins().bor(by_zero, overflow);
        let divisor = self.builder.ins().select(trapping, one, m);
        let q = self.builder.ins().sdiv(n, divisor);
        let q = self.builder.ins().select(overflow, n, q);
        self.builder.ins().select(by_zero, zero, q)
    }

    fn inst(&mut self, inst: &ir::Inst) -> JitResult<()> {
        use ir::Type::{F64, I64};

        let dst_type = inst.dst.map_or(I64, |dst| self.func.vreg_type(dst));
        let float_args = matches!(
            inst.op,
            Op::FAdd | Op::FSub | Op::FMul | Op::FDiv | Op::FloatToBits
        );
        let mut args = Vec::with_capacity(inst.args.len());
        for (i, &arg) in inst.args.iter().enumerate() {
            let default = if float_args {
                F64
            } else if inst.op == Op::Copy || (inst.op == Op::Select && i > 0) {
                dst_type
            } else {
                I64
            };
            let ty = self.operand_type(arg, default);
            args.push(self.read(arg, ty)?);
        }

        let ctx = self.ctx;
        let flags = MemFlags::trusted();
        let value = match inst.op {
            Op::Copy => Some(args[0]),
            Op::Add => Some(self.builder.ins().iadd(args[0], args[1])),
            Op::Sub => Some(self.builder.ins().isub(args[0], args[1])),
            Op::Mul => Some(self.builder.ins().imul(args[0], args[1])),
            Op::UDiv => Some(self.guarded_div(false, args[0], args[1])),
            Op::SDiv => Some(self.guarded_div(true, args[0], args[1])),
            Op::And => Some(self.builder.ins().band(args[0], args[1])),
            Op::Or => Some(self.builder.ins().bor(args[0], args[1])),
            Op::Xor => Some(self.builder.ins().bxor(args[0], args[1])),
            Op::Shl => Some(self.builder.ins().ishl(args[0], args[1])),
            Op::Lshr => Some(self.builder.ins().ushr(args[0], args[1])),
            Op::Ashr => Some(self.builder.ins().sshr(args[0], args[1])),
            Op::Rotr => Some(self.builder.ins().rotr(args[0], args[1])),
            Op::Not => Some(self.builder.ins().bnot(args[0])),
            Op::Sext(bits) if bits >= 64 => Some(args[0]),
            Op::Sext(bits) => {
                let shift = 64 - bits as i64;
                let high = self.builder.ins().ishl_imm(args[0], shift);
                Some(self.builder.ins().sshr_imm(high, shift))
            }
            Op::Icmp(cond) => {
                let flag = self.builder.ins().icmp(int_cc(cond), args[0], args[1]);
                Some(self.builder.ins().uextend(types::I64, flag))
            }
            Op::Select => {
                let cond = self.builder.ins().icmp_imm(IntCC::NotEqual, args[0], 0);
                Some(self.builder.ins().select(cond, args[1], args[2]))
            }
            Op::LoadContext(offset) => {
                Some(self.builder.ins().load(clif_type(dst_type), flags, ctx, offset))
            }
            Op::StoreContext(offset) => {
                self.builder.ins().store(flags, args[0], ctx, offset);
                None
            }
            Op::Reload(slot) => Some(self.builder.ins().load(
                clif_type(dst_type),
                flags,
                ctx,
                NativeContext::spill_offset(slot),
            )),
            Op::Spill(slot) => {
                self.builder
                    .ins()
                    .store(flags, args[0], ctx, NativeContext::spill_offset(slot));
                None
            }
            Op::Call(Helper::ReadMemory) => {
                let callee = self.helper(NativeContext::read_memory_offset());
                let call = self
                    .builder
                    .ins()
                    .call_indirect(self.read_sig, callee, &[ctx, args[0], args[1]]);
                Some(self.builder.inst_results(call)[0])
            }
            Op::Call(Helper::WriteMemory) => {
                let callee = self.helper(NativeContext::write_memory_offset());
                self.builder.ins().call_indirect(
                    self.write_sig,
                    callee,
                    &[ctx, args[0], args[1], args[2]],
                );
                None
            }
            Op::FAdd => Some(self.builder.ins().fadd(args[0], args[1])),
            Op::FSub => Some(self.builder.ins().fsub(args[0], args[1])),
            Op::FMul => Some(self.builder.ins().fmul(args[0], args[1])),
            Op::FDiv => Some(self.builder.ins().fdiv(args[0], args[1])),
            Op::BitsToFloat => Some(self.builder.ins().bitcast(types::F64, MemFlags::new(), args[0])),
            Op::FloatToBits => Some(self.builder.ins().bitcast(types::I64, MemFlags::new(), args[0])),
        };

        if let (Some(dst), Some(value)) = (inst.dst, value) {
            self.write(dst, value);
        }
        Ok(())
    }

    /// Parallel copy into the phis of `succ` along the edge from `pred`.
    fn phi_moves(&mut self, pred: BlockId, succ: BlockId) -> JitResult<()> {
        let func = self.func;
        let phis = &func.block(succ).phis;
        let mut values = Vec::with_capacity(phis.len());
        for phi in phis {
            let source = phi
                .source(pred)
                .ok_or_else(|| codegen_error(format!("phi in b{} has no source for b{}", succ.0, pred.0)))?;
            let ty = func.vreg_type(phi.dst);
            values.push((phi.dst, self.read(source, ty)?));
        }
        for (dst, value) in values {
            self.write(dst, value);
        }
        Ok(())
    }

    /// Target for a branch edge. Edges into blocks with phis get their own
    /// block holding the moves.
    fn edge(&mut self, succ: BlockId) -> JitResult<(Block, Option<Block>)> {
        if self.func.block(succ).phis.is_empty() {
            Ok((self.clif_block(succ)?, None))
        } else {
            let edge = self.builder.create_block();
            Ok((edge, Some(edge)))
        }
    }

    fn block(&mut self, id: BlockId) -> JitResult<()> {
        let block = self.clif_block(id)?;
        self.builder.switch_to_block(block);

        let func = self.func;
        let data = func.block(id);
        for inst in &data.insts {
            self.inst(inst)?;
        }

        match data.term {
            Terminator::Jump(succ) => {
                self.phi_moves(id, succ)?;
                let target = self.clif_block(succ)?;
                self.builder.ins().jump(target, &[]);
            }
            Terminator::Branch {
                cond,
                taken,
                not_taken,
            } => {
                let cond = self.read(cond, ir::Type::I64)?;
                let (taken_target, taken_edge) = self.edge(taken)?;
                let (not_taken_target, not_taken_edge) = self.edge(not_taken)?;
                self.builder
                    .ins()
                    .brif(cond, taken_target, &[], not_taken_target, &[]);

                for (edge, succ) in [(taken_edge, taken), (not_taken_edge, not_taken)] {
                    if let Some(edge) = edge {
                        self.builder.switch_to_block(edge);
                        self.phi_moves(id, succ)?;
                        let target = self.clif_block(succ)?;
                        self.builder.ins().jump(target, &[]);
                    }
                }
            }
            Terminator::Return(next_pc) => {
                let next_pc = self.read(next_pc, ir::Type::I64)?;
                self.builder.ins().return_(&[next_pc]);
            }
            Terminator::Pending => {
                return Err(codegen_error(format!("b{} has no terminator", id.0)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{EntryPoint, ExitCode};
    use crate::memory::{JitMemory, ProtectionMode};
    use crate::regalloc::{allocate, HostRegisters};

    fn run(mut func: Function, ctx: &mut NativeContext) -> u64 {
        func.rebuild();
        let allocation = allocate(&mut func, &HostRegisters::HOST);
        let code = Emitter::new().unwrap().emit(&func, &allocation).unwrap();
        let memory = JitMemory::new(1 << 20, ProtectionMode::default()).unwrap();
        let installed = memory.install(&code).unwrap();
        let entry: EntryPoint = unsafe { std::mem::transmute(installed.as_ptr()) };
        unsafe { entry(ctx) }
    }

    #[test]
    fn test_arithmetic_and_return() {
        let mut func = Function::new();
        let b = func.create_block();
        let x0 = func.new_vreg(ir::Type::I64);
        func.push(b, Op::LoadContext(NativeContext::x_offset(0)), Some(x0), vec![]);
        let sum = func.new_vreg(ir::Type::I64);
        func.push(b, Op::Add, Some(sum), vec![x0.into(), Operand::Const(40)]);
        func.push(b, Op::StoreContext(NativeContext::x_offset(1)), None, vec![sum.into()]);
        func.set_terminator(b, Terminator::Return(sum.into()));

        let mut ctx = NativeContext::default();
        ctx.x[0] = 2;
        assert_eq!(run(func, &mut ctx), 42);
        assert_eq!(ctx.x[1], 42);
    }

    #[test]
    fn test_guarded_division() {
        let mut func = Function::new();
        let b = func.create_block();
        let n = func.new_vreg(ir::Type::I64);
        let m = func.new_vreg(ir::Type::I64);
        func.push(b, Op::LoadContext(NativeContext::x_offset(0)), Some(n), vec![]);
        func.push(b, Op::LoadContext(NativeContext::x_offset(1)), Some(m), vec![]);
        let q = func.new_vreg(ir::Type::I64);
        func.push(b, Op::SDiv, Some(q), vec![n.into(), m.into()]);
        let u = func.new_vreg(ir::Type::I64);
        func.push(b, Op::UDiv, Some(u), vec![n.into(), m.into()]);
        func.push(b, Op::StoreContext(NativeContext::x_offset(2)), None, vec![q.into()]);
        func.push(b, Op::StoreContext(NativeContext::x_offset(3)), None, vec![u.into()]);
        func.set_terminator(b, Terminator::Return(Operand::Const(0)));

        for (n, m, q, u) in [
            (7u64, 0u64, 0u64, 0u64),
            (i64::MIN as u64, -1i64 as u64, i64::MIN as u64, 0),
            (-9i64 as u64, 2, -4i64 as u64, (-9i64 as u64) / 2),
        ] {
            let mut ctx = NativeContext::default();
            ctx.x[0] = n;
            ctx.x[1] = m;
            run(func.clone(), &mut ctx);
            assert_eq!((ctx.x[2], ctx.x[3]), (q, u), "{n:#x} / {m:#x}");
        }
    }

    #[test]
    fn test_loop_with_phis() {
        // sum = 0; for i in (1..=10).rev() { sum += i }
        let mut func = Function::new();
        let entry = func.create_block();
        let head = func.create_block();
        let exit = func.create_block();
        let i = func.new_vreg(ir::Type::I64);
        let sum = func.new_vreg(ir::Type::I64);
        let i_phi = func.push_phi(head, i);
        let sum_phi = func.push_phi(head, sum);
        func.set_terminator(entry, Terminator::Jump(head));
        func.add_phi_source(head, i_phi, entry, Operand::Const(10));
        func.add_phi_source(head, sum_phi, entry, Operand::Const(0));

        let next_sum = func.new_vreg(ir::Type::I64);
        func.push(head, Op::Add, Some(next_sum), vec![sum.into(), i.into()]);
        let next_i = func.new_vreg(ir::Type::I64);
        func.push(head, Op::Sub, Some(next_i), vec![i.into(), Operand::Const(1)]);
        func.add_phi_source(head, i_phi, head, next_i.into());
        func.add_phi_source(head, sum_phi, head, next_sum.into());
        func.set_terminator(
            head,
            Terminator::Branch {
                cond: next_i.into(),
                taken: head,
                not_taken: exit,
            },
        );
        func.set_terminator(exit, Terminator::Return(next_sum.into()));

        assert_eq!(run(func, &mut NativeContext::default()), 55);
    }

    #[test]
    fn test_helper_call_faults() {
        let memory = crate::guest::GuestMemory::new(0, 0x1000);
        let mut func = Function::new();
        let b = func.create_block();
        let value = func.new_vreg(ir::Type::I64);
        func.push(
            b,
            Op::Call(Helper::ReadMemory),
            Some(value),
            vec![Operand::Const(0x2000), Operand::Const(3)],
        );
        func.set_terminator(b, Terminator::Return(value.into()));

        let mut ctx = NativeContext {
            runtime: &memory as *const _ as *const std::ffi::c_void,
            ..Default::default()
        };
        assert_eq!(run(func, &mut ctx), 0);
        assert_eq!(ctx.exit_reason, ExitCode::DataAbort as u64);
        assert_eq!(ctx.exit_info, 0x2000);
    }

    #[test]
    fn test_threads_emit_concurrently() {
        fn shared<T: Send + Sync>(_: &T) {}

        let emitter = Emitter::new().unwrap();
        shared(&emitter);
        let memory = JitMemory::new(1 << 20, ProtectionMode::default()).unwrap();
        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let (emitter, memory) = (&emitter, &memory);
                scope.spawn(move || {
                    let mut func = Function::new();
                    let b = func.create_block();
                    let x0 = func.new_vreg(ir::Type::I64);
                    func.push(b, Op::LoadContext(NativeContext::x_offset(0)), Some(x0), vec![]);
                    let sum = func.new_vreg(ir::Type::I64);
                    func.push(b, Op::Add, Some(sum), vec![x0.into(), Operand::Const(t)]);
                    func.set_terminator(b, Terminator::Return(sum.into()));
                    func.rebuild();
                    let allocation = allocate(&mut func, &HostRegisters::HOST);

                    let code = emitter.emit(&func, &allocation).unwrap();
                    let installed = memory.install(&code).unwrap();
                    let entry: EntryPoint = unsafe { std::mem::transmute(installed.as_ptr()) };
                    let mut ctx = NativeContext::default();
                    ctx.x[0] = 100;
                    assert_eq!(unsafe { entry(&mut ctx) }, 100 + t);
                });
            }
        });
    }

    #[test]
    fn test_spill_area_limit() {
        let mut func = Function::new();
        let b = func.create_block();
        func.set_terminator(b, Terminator::Return(Operand::Const(0)));
        let mut allocation = allocate(&mut func, &HostRegisters::HOST);
        allocation.spill_slots = SPILL_SLOTS as u32 + 1;
        assert!(matches!(
            Emitter::new().unwrap().emit(&func, &allocation),
            Err(JitError::SpillAreaExhausted { .. })
        ));
    }
}
