use std::sync::Arc;

use a64jit::decoder::{AddSubOp, Condition, FpOp};
use a64jit::encode::*;
use a64jit::*;

const BASE: u64 = 0x40_0000;
const DATA: u64 = BASE + 0x8000;

fn setup(code: &[u32]) -> (Arc<GuestMemory>, JitContext) {
    let memory = Arc::new(GuestMemory::new(BASE, 0x10000));
    memory.load(BASE, &assemble(code)).unwrap();
    memory.map(DATA, 0x1000).unwrap();
    let jit = JitContext::new(
        Arc::clone(&memory),
        JitConfig {
            jit_memory_size: 8 << 20,
            ..Default::default()
        },
    )
    .unwrap();
    (memory, jit)
}

#[test]
fn test_five_add_immediates() {
    let (_memory, jit) = setup(&[
        add_imm(0, 0, 1),
        add_imm(1, 0, 2),
        add_imm(2, 1, 3),
        sub_imm(3, 2, 4),
        add_imm(4, 3, 4095),
        svc(0),
    ]);
    let mut ctx = jit.create_execution_context();
    ctx.set_x(0, 10);
    ctx.set_x(5, 0xdead);

    assert_eq!(jit.execute(&mut ctx, BASE).unwrap(), ExitReason::Supervisor(0));
    assert_eq!(
        (0..6).map(|i| ctx.x(i)).collect::<Vec<_>>(),
        vec![11, 13, 16, 12, 4107, 0xdead]
    );
    assert_eq!(ctx.pc(), BASE + 24);
}

#[test]
fn test_counted_loop() {
    // sum = 0; for i in (1..=100).rev() { sum += i }
    let (_memory, jit) = setup(&[
        movz(0, 0, 0),
        movz(1, 100, 0),
        add_reg(0, 0, 1),
        sub_imm(1, 1, 1),
        cbnz(true, 1, -8),
        svc(1),
    ]);
    let mut ctx = jit.create_execution_context();
    assert_eq!(jit.execute(&mut ctx, BASE).unwrap(), ExitReason::Supervisor(1));
    assert_eq!(ctx.x(0), 5050);
    assert_eq!(ctx.x(1), 0);
    assert_eq!(jit.stats().translations, 1);
}

#[test]
fn test_flags_drive_conditional_branch() {
    // x0 = 10!
    let (_memory, jit) = setup(&[
        movz(0, 1, 0),
        movz(1, 1, 0),
        mul(0, 0, 1),
        add_imm(1, 1, 1),
        cmp_imm(1, 11),
        b_cond(Condition::Ne, -12),
        cset(2, Condition::Eq),
        cset(3, Condition::Lt),
        svc(0),
    ]);
    let mut ctx = jit.create_execution_context();
    jit.execute(&mut ctx, BASE).unwrap();
    assert_eq!(ctx.x(0), 3_628_800);
    assert_eq!(ctx.x(2), 1);
    assert_eq!(ctx.x(3), 0);
    // Z and C set by the final compare of equal values.
    assert_eq!(ctx.nzcv(), 0x6000_0000);
}

#[test]
fn test_signed_compare_and_overflow() {
    let (_memory, jit) = setup(&[
        cmp_reg(0, 1),
        cset(2, Condition::Lt),
        cset(3, Condition::Cc),
        cset(4, Condition::Vs),
        svc(0),
    ]);
    let mut ctx = jit.create_execution_context();
    // i64::MIN - 1 overflows, yet MIN < 1 still holds.
    ctx.set_x(0, i64::MIN as u64);
    ctx.set_x(1, 1);
    jit.execute(&mut ctx, BASE).unwrap();
    assert_eq!((ctx.x(2), ctx.x(3), ctx.x(4)), (1, 0, 1));
}

#[test]
fn test_32_bit_forms_zero_extend() {
    let (_memory, jit) = setup(&[
        add_sub_imm(false, AddSubOp::Add, false, 0, 1, 0, 1),
        div(false, true, 3, 2, 4),
        div(true, false, 5, 2, 6),
        svc(0),
    ]);
    let mut ctx = jit.create_execution_context();
    ctx.set_x(0, 0x1_ffff_ffff);
    ctx.set_x(2, (-20i32) as u32 as u64);
    ctx.set_x(4, 3);
    ctx.set_x(6, 0);
    jit.execute(&mut ctx, BASE).unwrap();
    assert_eq!(ctx.x(1), 0);
    assert_eq!(ctx.x(3), (-6i32) as u32 as u64);
    assert_eq!(ctx.x(5), 0);
}

#[test]
fn test_loads_and_stores() {
    let (memory, jit) = setup(&[
        str(0, 1, 8),
        ldr(2, 1, 8),
        add_imm(2, 2, 1),
        str(2, 1, 16),
        load_store(true, 0, 3, 1, 8),
        load_store(false, 2, 0, 1, 32),
        svc(0),
    ]);
    let mut ctx = jit.create_execution_context();
    ctx.set_x(0, 0x1122_3344_5566_7788);
    ctx.set_x(1, DATA);
    jit.execute(&mut ctx, BASE).unwrap();

    assert_eq!(ctx.x(2), 0x1122_3344_5566_7789);
    assert_eq!(ctx.x(3), 0x88);
    assert_eq!(memory.read_sized(DATA + 16, 3).unwrap(), 0x1122_3344_5566_7789);
    assert_eq!(memory.read_sized(DATA + 32, 3).unwrap(), 0x5566_7788);
}

#[test]
fn test_stack_pointer_base() {
    let (memory, jit) = setup(&[
        sub_imm(31, 31, 16),
        str(0, 31, 0),
        ldr(1, 31, 0),
        svc(0),
    ]);
    let mut ctx = jit.create_execution_context();
    ctx.set_sp(DATA + 0x100);
    ctx.set_x(0, 77);
    jit.execute(&mut ctx, BASE).unwrap();
    assert_eq!(ctx.sp(), DATA + 0xf0);
    assert_eq!(ctx.x(1), 77);
    assert_eq!(memory.read_sized(DATA + 0xf0, 3).unwrap(), 77);
}

#[test]
fn test_data_abort_reports_faulting_instruction() {
    let (_memory, jit) = setup(&[movz(5, 7, 0), ldr(0, 1, 0), movz(5, 9, 0), svc(0)]);
    let mut ctx = jit.create_execution_context();
    ctx.set_x(1, BASE + 0x20000);
    assert_eq!(
        jit.execute(&mut ctx, BASE).unwrap(),
        ExitReason::DataAbort {
            address: BASE + 0x20000
        }
    );
    assert_eq!(ctx.pc(), BASE + 4);
    assert_eq!(ctx.x(5), 7);
}

#[test]
fn test_undefined_instruction_traps() {
    let (_memory, jit) = setup(&[add_imm(0, 0, 1), 0, add_imm(0, 0, 1)]);
    let mut ctx = jit.create_execution_context();
    assert_eq!(
        jit.execute(&mut ctx, BASE).unwrap(),
        ExitReason::Undefined {
            address: BASE + 4,
            word: 0
        }
    );
    assert_eq!(ctx.x(0), 1);
}

#[test]
fn test_breakpoint_leaves_pc_on_instruction() {
    let (_memory, jit) = setup(&[brk(0x42)]);
    let mut ctx = jit.create_execution_context();
    assert_eq!(jit.execute(&mut ctx, BASE).unwrap(), ExitReason::Breakpoint(0x42));
    assert_eq!(ctx.pc(), BASE);
}

#[test]
fn test_call_and_return() {
    let (_memory, jit) = setup(&[
        bl(12),
        add_imm(0, 0, 100),
        svc(3),
        add_imm(0, 0, 5),
        ret(30),
    ]);
    let mut ctx = jit.create_execution_context();
    assert_eq!(jit.execute(&mut ctx, BASE).unwrap(), ExitReason::Supervisor(3));
    assert_eq!(ctx.x(0), 105);
    assert_eq!(ctx.x(30), BASE + 4);
    assert_eq!(jit.stats().translations, 3);
}

#[test]
fn test_floating_point() {
    let (_memory, jit) = setup(&[
        fmov_to_fp(0, 0),
        fmov_to_fp(1, 1),
        fp_arith(FpOp::Add, 2, 0, 1),
        fp_arith(FpOp::Mul, 3, 2, 1),
        fp_arith(FpOp::Div, 4, 3, 0),
        fmov_from_fp(5, 3),
        svc(0),
    ]);
    let mut ctx = jit.create_execution_context();
    ctx.set_x(0, 1.5f64.to_bits());
    ctx.set_x(1, 2.25f64.to_bits());
    jit.execute(&mut ctx, BASE).unwrap();
    assert_eq!(ctx.d(2), 3.75);
    assert_eq!(ctx.d(3), 8.4375);
    assert_eq!(ctx.d(4), 5.625);
    assert_eq!(ctx.x(5), 8.4375f64.to_bits());
    assert_eq!(ctx.native().v[3][1], 0);
}

#[test]
fn test_register_pressure_spills() {
    let mut code = (0..29u8)
        .map(|r| add_imm(r, r, r as u32 + 1))
        .collect::<Vec<_>>();
    // Keep every value live across the adds below.
    code.extend((0..28u8).map(|r| add_reg(28, 28, r)));
    code.push(svc(0));
    let (_memory, jit) = setup(&code);

    let mut ctx = jit.create_execution_context();
    for r in 0..29 {
        ctx.set_x(r, 1000 * r as u64);
    }
    jit.execute(&mut ctx, BASE).unwrap();

    let mut expected_sum = 28_000 + 29;
    for r in 0..28 {
        let value = 1000 * r as u64 + r as u64 + 1;
        assert_eq!(ctx.x(r), value, "x{r}");
        expected_sum += value;
    }
    assert_eq!(ctx.x(28), expected_sum);
}

#[test]
fn test_unmap_invalidates_translation() {
    let (memory, jit) = setup(&[movz(0, 1, 0), svc(0)]);
    let mut ctx = jit.create_execution_context();
    jit.execute(&mut ctx, BASE).unwrap();
    assert_eq!(ctx.x(0), 1);

    memory.unmap(BASE, GUEST_PAGE_SIZE).unwrap();
    assert!(jit.cache().is_empty());
    assert_eq!(
        jit.execute(&mut ctx, BASE).unwrap(),
        ExitReason::PrefetchAbort { address: BASE }
    );

    memory.load(BASE, &assemble(&[movz(0, 2, 0), svc(0)])).unwrap();
    jit.execute(&mut ctx, BASE).unwrap();
    assert_eq!(ctx.x(0), 2);
    assert_eq!(jit.stats().translations, 2);
}

#[test]
fn test_guest_store_into_code_retranslates() {
    let target = BASE + GUEST_PAGE_SIZE;
    let patch = (svc(0) as u64) << 32 | movz(0, 2, 0) as u64;
    let (memory, jit) = setup(&[str(2, 3, 0), svc(9)]);
    memory
        .load(target, &assemble(&[movz(0, 1, 0), svc(0)]))
        .unwrap();

    let mut ctx = jit.create_execution_context();
    jit.execute(&mut ctx, target).unwrap();
    assert_eq!(ctx.x(0), 1);

    ctx.set_x(2, patch);
    ctx.set_x(3, target);
    assert_eq!(jit.execute(&mut ctx, BASE).unwrap(), ExitReason::Supervisor(9));
    assert!(jit.cache().get(target).is_none());

    jit.execute(&mut ctx, target).unwrap();
    assert_eq!(ctx.x(0), 2);
}

#[test]
fn test_invalidation_is_range_precise() {
    let far = BASE + 4 * GUEST_PAGE_SIZE;
    let (memory, jit) = setup(&[movz(0, 1, 0), svc(0)]);
    memory.load(far, &assemble(&[movz(1, 1, 0), svc(0)])).unwrap();

    let mut ctx = jit.create_execution_context();
    jit.execute(&mut ctx, BASE).unwrap();
    jit.execute(&mut ctx, far).unwrap();
    assert_eq!(jit.cache().len(), 2);

    assert_eq!(jit.invalidate_region(far, 8), 1);
    assert!(jit.cache().lookup(far).is_none());
    assert!(jit.cache().lookup(BASE).is_some());
}

#[test]
fn test_sparse_32_bit_table() {
    let memory = Arc::new(GuestMemory::new(0x1000, 0x1000));
    memory
        .load(0x1000, &assemble(&[add_imm(0, 0, 1), svc(0)]))
        .unwrap();
    let jit = JitContext::create(Arc::clone(&memory), false, true).unwrap();
    let mut ctx = jit.create_execution_context();
    jit.execute(&mut ctx, 0x1000).unwrap();
    assert_eq!(ctx.x(0), 1);
    assert_eq!(jit.cache().table().address_bits(), 32);
    assert_eq!(
        jit.execute(&mut ctx, 1 << 40).unwrap(),
        ExitReason::PrefetchAbort { address: 1 << 40 }
    );
}

#[test]
fn test_code_in_last_page() {
    let page = 0xffff_ffff_ffff_f000;
    let memory = Arc::new(GuestMemory::new(page, 0x1000));
    memory
        .load(page + 0xff8, &assemble(&[add_imm(0, 0, 2), svc(3)]))
        .unwrap();
    let jit = JitContext::create(Arc::clone(&memory), true, false).unwrap();
    let mut ctx = jit.create_execution_context();

    assert_eq!(
        jit.execute(&mut ctx, page + 0xff8).unwrap(),
        ExitReason::Supervisor(3)
    );
    assert_eq!(ctx.x(0), 2);
    // The next pc wraps around.
    assert_eq!(ctx.pc(), 0);
}
