use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use a64jit::encode::*;
use a64jit::*;

const BASE: u64 = 0x10_0000;

/// x0 = 1 + 2 + ... + x1, for x1 > 0
fn summing_loop() -> Vec<u32> {
    vec![
        movz(0, 0, 0),
        add_reg(0, 0, 1),
        sub_imm(1, 1, 1),
        cbnz(true, 1, -8),
        svc(0),
    ]
}

fn setup() -> (Arc<GuestMemory>, Arc<JitContext>) {
    let memory = Arc::new(GuestMemory::new(BASE, 0x4000));
    memory.load(BASE, &assemble(&summing_loop())).unwrap();
    let jit = JitContext::new(
        Arc::clone(&memory),
        JitConfig {
            jit_memory_size: 16 << 20,
            ..Default::default()
        },
    )
    .unwrap();
    (memory, Arc::new(jit))
}

#[test]
fn test_threads_share_translations() {
    let (_memory, jit) = setup();
    let handles = (0..8u64)
        .map(|t| {
            let jit = Arc::clone(&jit);
            thread::spawn(move || {
                let mut ctx = jit.create_execution_context();
                for i in 0..50u64 {
                    let n = t * 100 + i + 1;
                    ctx.set_x(1, n);
                    assert_eq!(jit.execute(&mut ctx, BASE).unwrap(), ExitReason::Supervisor(0));
                    assert_eq!(ctx.x(0), n * (n + 1) / 2);
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = jit.stats();
    // Racing misses may translate the same region more than once.
    assert!(stats.translations >= 1 && stats.translations <= 8);
    assert_eq!(stats.hits + stats.misses, 8 * 50);
}

#[test]
fn test_execution_survives_invalidation() {
    let (_memory, jit) = setup();
    let done = Arc::new(AtomicBool::new(false));

    let invalidator = {
        let jit = Arc::clone(&jit);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut removed = 0;
            while !done.load(Ordering::Acquire) {
                removed += jit.invalidate_region(BASE, 4);
                thread::yield_now();
            }
            removed
        })
    };

    let runners = (0..4)
        .map(|_| {
            let jit = Arc::clone(&jit);
            thread::spawn(move || {
                let mut ctx = jit.create_execution_context();
                for _ in 0..200 {
                    ctx.set_x(1, 20_000);
                    jit.execute(&mut ctx, BASE).unwrap();
                    assert_eq!(ctx.x(0), 20_000 * 20_001 / 2);
                }
            })
        })
        .collect::<Vec<_>>();
    for runner in runners {
        runner.join().unwrap();
    }
    done.store(true, Ordering::Release);
    invalidator.join().unwrap();

    // Everything retired is released once no context is pinned.
    jit.cache().reclaimer().collect();
    assert_eq!(jit.cache().reclaimer().pending(), 0);
    assert!(jit.stats().translations >= 1);
}

#[test]
fn test_interrupt_from_another_thread() {
    let memory = Arc::new(GuestMemory::new(BASE, 0x1000));
    // bl . leaves the translated code on every iteration.
    memory.load(BASE, &assemble(&[bl(0)])).unwrap();
    let jit = Arc::new(JitContext::create(Arc::clone(&memory), true, false).unwrap());
    let mut ctx = jit.create_execution_context();
    let interrupt = ctx.interrupt_handle();

    let runner = {
        let jit = Arc::clone(&jit);
        thread::spawn(move || {
            let exit = jit.execute(&mut ctx, BASE).unwrap();
            (exit, ctx.pc())
        })
    };
    thread::sleep(std::time::Duration::from_millis(20));
    interrupt.store(true, Ordering::Release);
    assert_eq!(runner.join().unwrap(), (ExitReason::Interrupted, BASE));
}

#[test]
fn test_code_rewritten_during_translation_is_not_kept() {
    let memory = Arc::new(GuestMemory::new(BASE, 0x4000));
    let mut program = vec![movz(0, 10, 0)];
    program.extend((0..200).map(|_| add_imm(1, 1, 1)));
    program.push(svc(0));
    memory.load(BASE, &assemble(&program)).unwrap();
    let jit = Arc::new(JitContext::create(Arc::clone(&memory), true, false).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let runners = (0..3)
        .map(|_| {
            let jit = Arc::clone(&jit);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut ctx = jit.create_execution_context();
                while !done.load(Ordering::Acquire) {
                    assert_eq!(jit.execute(&mut ctx, BASE).unwrap(), ExitReason::Supervisor(0));
                }
            })
        })
        .collect::<Vec<_>>();

    for i in 0..200u16 {
        memory.write(BASE, &movz(0, 10 + i, 0).to_le_bytes()).unwrap();
        thread::yield_now();
    }
    memory.write(BASE, &movz(0, 7, 0).to_le_bytes()).unwrap();
    done.store(true, Ordering::Release);
    for runner in runners {
        runner.join().unwrap();
    }

    let mut ctx = jit.create_execution_context();
    assert_eq!(jit.execute(&mut ctx, BASE).unwrap(), ExitReason::Supervisor(0));
    assert_eq!(ctx.x(0), 7);
}
