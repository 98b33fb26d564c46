//! State shared between the dispatcher and generated code.

use std::ffi::c_void;
use std::mem::offset_of;

use crate::error::MemoryError;
use crate::guest::GuestMemory;

pub const SPILL_SLOTS: usize = 1024;

/// Index of the stack pointer in [`NativeContext::x`].
pub const SP: usize = 31;

/// Entry point of a translated function. Returns the next guest PC.
pub type EntryPoint = unsafe extern "C" fn(*mut NativeContext) -> u64;

/// Host functions callable from generated code.
#[repr(C)]
pub struct HelperTable {
    pub read_memory: unsafe extern "C" fn(*mut NativeContext, u64, u64) -> u64,
    pub write_memory: unsafe extern "C" fn(*mut NativeContext, u64, u64, u64),
}

pub static HELPERS: HelperTable = HelperTable {
    read_memory,
    write_memory,
};

#[repr(C)]
pub struct NativeContext {
    pub x: [u64; 32],
    pub nzcv: u64,
    /// Low half holds the scalar double; scalar writes clear the high half.
    pub v: [[u64; 2]; 32],
    pub exit_reason: u64,
    pub exit_info: u64,
    pub spill: [u64; SPILL_SLOTS],
    pub helpers: *const HelperTable,
    pub runtime: *const c_void,
}

impl Default for NativeContext {
    fn default() -> Self {
        Self {
            x: [0; 32],
            nzcv: 0,
            v: [[0; 2]; 32],
            exit_reason: 0,
            exit_info: 0,
            spill: [0; SPILL_SLOTS],
            helpers: &HELPERS,
            runtime: std::ptr::null(),
        }
    }
}

impl NativeContext {
    pub fn x_offset(index: usize) -> i32 {
        (offset_of!(NativeContext, x) + index * 8) as i32
    }

    pub fn nzcv_offset() -> i32 {
        offset_of!(NativeContext, nzcv) as i32
    }

    pub fn v_offset(index: usize) -> i32 {
        (offset_of!(NativeContext, v) + index * 16) as i32
    }

    pub fn exit_reason_offset() -> i32 {
        offset_of!(NativeContext, exit_reason) as i32
    }

    pub fn exit_info_offset() -> i32 {
        offset_of!(NativeContext, exit_info) as i32
    }

    pub fn spill_offset(slot: u32) -> i32 {
        (offset_of!(NativeContext, spill) + slot as usize * 8) as i32
    }

    pub fn helpers_offset() -> i32 {
        offset_of!(NativeContext, helpers) as i32
    }

    pub fn read_memory_offset() -> i32 {
        offset_of!(HelperTable, read_memory) as i32
    }

    pub fn write_memory_offset() -> i32 {
        offset_of!(HelperTable, write_memory) as i32
    }
}

/// Values of [`NativeContext::exit_reason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ExitCode {
    None = 0,
    Supervisor = 1,
    Breakpoint = 2,
    Undefined = 3,
    DataAbort = 4,
}

impl ExitCode {
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => ExitCode::None,
            1 => ExitCode::Supervisor,
            2 => ExitCode::Breakpoint,
            3 => ExitCode::Undefined,
            4 => ExitCode::DataAbort,
            _ => return None,
        })
    }
}

/// Why guest execution returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Supervisor(u16),
    Breakpoint(u16),
    Undefined { address: u64, word: u32 },
    DataAbort { address: u64 },
    PrefetchAbort { address: u64 },
    Interrupted,
}

fn fault(ctx: &mut NativeContext, error: MemoryError) {
    let address = match error {
        MemoryError::Unmapped { address, .. } | MemoryError::OutOfRange { address, .. } => address,
    };
    log::trace!("guest data abort at {address:#x}");
    ctx.exit_reason = ExitCode::DataAbort as u64;
    ctx.exit_info = address;
}

unsafe extern "C" fn read_memory(ctx: *mut NativeContext, address: u64, log2_size: u64) -> u64 {
    let ctx = &mut *ctx;
    let memory = &*(ctx.runtime as *const GuestMemory);
    match memory.read_sized(address, log2_size as u32) {
        Ok(value) => value,
        Err(e) => {
            fault(ctx, e);
            0
        }
    }
}

unsafe extern "C" fn write_memory(ctx: *mut NativeContext, address: u64, value: u64, log2_size: u64) {
    let ctx = &mut *ctx;
    let memory = &*(ctx.runtime as *const GuestMemory);
    if let Err(e) = memory.write_sized(address, value, log2_size as u32) {
        fault(ctx, e);
    }
}
