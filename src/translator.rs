//! The dispatcher and the translation pipeline behind it.
//!
//! [`JitContext`] owns everything shared between guest threads: the
//! translation cache, JIT memory and the code generator. Each guest thread
//! runs through its own [`ExecutionContext`].

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::{log_enabled, Level};

use crate::builder::{self, Region, DEFAULT_MAX_INSTRUCTIONS};
use crate::cache::{Participant, TranslatedFunction, TranslationCache};
use crate::context::{EntryPoint, ExitCode, ExitReason, NativeContext, SP};
use crate::emitter::Emitter;
use crate::error::{JitError, JitResult};
use crate::guest::{GuestMemory, MemoryEvent};
use crate::memory::{JitCode, JitMemory, ProtectionMode};
use crate::regalloc::{self, HostRegisters};
use crate::stack;
use crate::table;

#[derive(Debug, Clone)]
pub struct JitConfig {
    pub is_64_bit: bool,
    /// Use the sparse address table layout.
    pub low_power: bool,
    pub max_instructions: usize,
    pub jit_memory_size: usize,
    pub protection: ProtectionMode,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            is_64_bit: true,
            low_power: false,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            jit_memory_size: 64 << 20,
            protection: ProtectionMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub translations: u64,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub functions: usize,
    pub jit_bytes: usize,
    pub pending_reclaim: usize,
}

#[derive(Default)]
struct Counters {
    translations: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Guest register state and dispatch bookkeeping for one guest thread.
pub struct ExecutionContext {
    native: Box<NativeContext>,
    pc: u64,
    participant: Participant,
    interrupt: Arc<AtomicBool>,
}

// The raw pointers inside `NativeContext` refer to process-wide data.
unsafe impl Send for ExecutionContext {}

impl ExecutionContext {
    pub fn x(&self, index: usize) -> u64 {
        self.native.x[index]
    }

    pub fn set_x(&mut self, index: usize, value: u64) {
        self.native.x[index] = value;
    }

    pub fn sp(&self) -> u64 {
        self.native.x[SP]
    }

    pub fn set_sp(&mut self, value: u64) {
        self.native.x[SP] = value;
    }

    pub fn nzcv(&self) -> u64 {
        self.native.nzcv
    }

    pub fn set_nzcv(&mut self, value: u64) {
        self.native.nzcv = value;
    }

    pub fn d(&self, index: usize) -> f64 {
        f64::from_bits(self.native.v[index][0])
    }

    pub fn set_d(&mut self, index: usize, value: f64) {
        self.native.v[index] = [value.to_bits(), 0];
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// Setting the returned flag makes [`JitContext::execute`] return
    /// [`ExitReason::Interrupted`] at the next dispatch.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn native(&self) -> &NativeContext {
        &self.native
    }
}

pub struct JitContext {
    config: JitConfig,
    memory: Arc<GuestMemory>,
    cache: Arc<TranslationCache>,
    jit_memory: Arc<JitMemory>,
    emitter: Emitter,
    counters: Arc<Counters>,
}

impl JitContext {
    pub fn create(memory: Arc<GuestMemory>, is_64_bit: bool, low_power: bool) -> JitResult<Self> {
        Self::new(
            memory,
            JitConfig {
                is_64_bit,
                low_power,
                ..Default::default()
            },
        )
    }

    pub fn new(memory: Arc<GuestMemory>, config: JitConfig) -> JitResult<Self> {
        let levels = table::preset(config.is_64_bit, config.low_power);
        let cache = Arc::new(TranslationCache::new(
            levels,
            4 * config.max_instructions as u64,
        ));
        let jit_memory = JitMemory::new(config.jit_memory_size, config.protection)?;
        let counters = Arc::new(Counters::default());

        let weak_cache: Weak<TranslationCache> = Arc::downgrade(&cache);
        let weak_counters: Weak<Counters> = Arc::downgrade(&counters);
        memory.subscribe(move |event| {
            let Some(cache) = weak_cache.upgrade() else {
                return;
            };
            let removed = match event {
                MemoryEvent::Unmapped { address, size } => cache.invalidate(address, size),
                MemoryEvent::Written { address, size } => cache.invalidate_written(address, size),
            };
            if let Some(counters) = weak_counters.upgrade() {
                Counters::bump(&counters.invalidations, removed as u64);
            }
        });

        log::info!(
            "*** JIT context: {}-bit guest, {} address table, {} instructions per region",
            if config.is_64_bit { 64 } else { 32 },
            if config.low_power { "sparse" } else { "dense" },
            config.max_instructions
        );

        Ok(Self {
            config,
            memory,
            cache,
            jit_memory,
            emitter: Emitter::new()?,
            counters,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    /// Start and size of the host range holding generated code.
    pub fn code_region(&self) -> (u64, u64) {
        let (start, size) = self.jit_memory.region();
        (start as u64, size as u64)
    }

    pub fn create_execution_context(&self) -> ExecutionContext {
        ExecutionContext {
            native: Box::default(),
            pc: 0,
            participant: self.cache.reclaimer().register(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs guest code from `address` until the guest raises an exit.
    pub fn execute(&self, ctx: &mut ExecutionContext, address: u64) -> JitResult<ExitReason> {
        ctx.pc = address;
        let result = self.dispatch(ctx);
        ctx.participant.unpin();
        result
    }

    fn dispatch(&self, ctx: &mut ExecutionContext) -> JitResult<ExitReason> {
        let runtime = Arc::as_ptr(&self.memory) as *const c_void;
        loop {
            ctx.participant.pin(self.cache.reclaimer());
            if ctx.interrupt.swap(false, Ordering::AcqRel) {
                return Ok(ExitReason::Interrupted);
            }

            let pc = ctx.pc;
            let entry = match self.cache.lookup(pc) {
                Some(entry) => {
                    Counters::bump(&self.counters.hits, 1);
                    entry
                }
                None => {
                    Counters::bump(&self.counters.misses, 1);
                    match self.translate(pc, &ctx.participant)? {
                        Some(entry) => entry,
                        None => return Ok(ExitReason::PrefetchAbort { address: pc }),
                    }
                }
            };

            ctx.native.runtime = runtime;
            ctx.native.exit_reason = ExitCode::None as u64;
            let next = unsafe { entry(&mut *ctx.native) };
            ctx.pc = next;

            let info = ctx.native.exit_info;
            match ExitCode::from_raw(ctx.native.exit_reason) {
                Some(ExitCode::None) | None => {}
                Some(ExitCode::Supervisor) => return Ok(ExitReason::Supervisor(info as u16)),
                Some(ExitCode::Breakpoint) => return Ok(ExitReason::Breakpoint(info as u16)),
                Some(ExitCode::Undefined) => {
                    return Ok(ExitReason::Undefined {
                        address: next,
                        word: info as u32,
                    })
                }
                Some(ExitCode::DataAbort) => return Ok(ExitReason::DataAbort { address: info }),
            }
        }
    }

    fn fetchable(&self, pc: u64) -> bool {
        let bits = self.cache.table().address_bits();
        pc % 4 == 0 && (bits >= 64 || pc >> bits == 0)
    }

    /// Translates the region at `pc` and publishes it. `None` means the
    /// entry instruction cannot be fetched.
    fn translate(&self, pc: u64, participant: &Participant) -> JitResult<Option<EntryPoint>> {
        if !self.fetchable(pc) {
            return Ok(None);
        }
        loop {
            // Registered before the guest code is read.
            let pending = self.cache.begin(pc);
            let region = Region::discover(pc, self.config.max_instructions, |addr| {
                self.memory.read_u32(addr).ok()
            });
            if region.is_empty() {
                return Ok(None);
            }
            let installed = self.compile(pc, &region, participant)?;

            let function = TranslatedFunction::new(
                pc,
                region.guest_size(),
                region.instruction_count(),
                installed,
            );
            if let Some(function) = self.cache.publish(function, pending)? {
                Counters::bump(&self.counters.translations, 1);
                log::debug!("translated {function:?}");
                return Ok(Some(function.entry()));
            }
        }
    }

    fn compile(&self, pc: u64, region: &Region, participant: &Participant) -> JitResult<JitCode> {
        if log_enabled!(Level::Info) {
            log::info!(
                "*** JIT compiling region at pc={pc:#x} ({} blocks, {} insts)",
                region.blocks.len(),
                region.instruction_count()
            );
            for block in region.blocks.values() {
                let words = block.insns.iter().map(|i| i.word).collect::<Vec<_>>();
                for line in crate::disasm::disasm(block.start, &words) {
                    log::info!("    {line}");
                }
                log::info!("");
            }
        }

        let mut func = builder::build(region);
        let allocation = regalloc::allocate(&mut func, &HostRegisters::HOST);
        if log_enabled!(Level::Trace) {
            log::trace!("*** IR after allocation:\n{func}");
        }
        log::debug!(
            "allocated {} vregs: {} spill slots, {} spill stores, {} reloads",
            func.vreg_count(),
            allocation.spill_slots,
            allocation.spill_stores,
            allocation.reloads
        );

        let code = self.emitter.emit(&func, &allocation)?;
        match self.jit_memory.install(&code) {
            Err(JitError::OutOfMemory { .. }) => {
                // Recovery policy: drop every translation and retry once.
                log::warn!("JIT memory exhausted, flushing the translation cache");
                let removed = self.cache.invalidate(0, u64::MAX);
                Counters::bump(&self.counters.invalidations, removed as u64);
                participant.unpin();
                self.cache.reclaimer().collect();
                participant.pin(self.cache.reclaimer());
                self.jit_memory.install(&code)
            }
            result => result,
        }
    }

    /// Drops every translation overlapping `[address, address + size)`.
    pub fn invalidate_region(&self, address: u64, size: u64) -> usize {
        let removed = self.cache.invalidate(address, size);
        Counters::bump(&self.counters.invalidations, removed as u64);
        removed
    }

    /// Guest entry addresses of the translated functions on the host call
    /// stack starting at `fp`, innermost first. Frames whose host return
    /// address lies in a code region but not in a live translation are
    /// skipped.
    ///
    /// # Safety
    ///
    /// See [`stack::FrameWalker::new`].
    pub unsafe fn get_call_stack(
        &self,
        fp: u64,
        code_region_start: u64,
        code_region_size: u64,
        code_region2_start: u64,
        code_region2_size: u64,
    ) -> Vec<u64> {
        stack::get_call_stack(
            fp,
            code_region_start,
            code_region_size,
            code_region2_start,
            code_region2_size,
        )
        .into_iter()
        .filter_map(|host| self.cache.guest_address_of(host))
        .collect()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            translations: self.counters.translations.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            functions: self.cache.len(),
            jit_bytes: self.jit_memory.bytes_in_use(),
            pending_reclaim: self.cache.reclaimer().pending(),
        }
    }
}

impl Drop for JitContext {
    fn drop(&mut self) {
        if log_enabled!(Level::Info) {
            let stats = self.stats();
            log::info!("*** JIT stats:");
            log::info!("    translations:  {}", stats.translations);
            log::info!("    lookups:       {} hits, {} misses", stats.hits, stats.misses);
            log::info!("    invalidations: {}", stats.invalidations);
            log::info!("    functions:     {}", stats.functions);
            log::info!("    JIT bytes:     {}", stats.jit_bytes);
        }
    }
}
