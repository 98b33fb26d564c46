pub mod builder;
pub mod cache;
pub mod context;
pub mod decoder;
pub mod disasm;
pub mod emitter;
pub mod encode;
pub mod error;
pub mod guest;
pub mod ir;
pub mod memory;
pub mod regalloc;
pub mod stack;
pub mod table;
pub mod translator;

pub use context::{ExitReason, NativeContext};
pub use error::{JitError, JitResult, MemoryError};
pub use guest::{GuestMemory, MemoryEvent, GUEST_PAGE_SIZE};
pub use memory::ProtectionMode;
pub use translator::{ExecutionContext, JitConfig, JitContext, Stats};
