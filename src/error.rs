use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("guest address {address:#x} (+{size:#x}) is not mapped")]
    Unmapped { address: u64, size: u64 },

    #[error("guest range {address:#x} (+{size:#x}) is outside the address space")]
    OutOfRange { address: u64, size: u64 },
}

#[derive(Error, Debug)]
pub enum JitError {
    #[error("failed to reserve {size:#x} bytes of JIT memory")]
    ReserveFailed { size: usize },

    #[error("JIT memory exhausted: {requested:#x} bytes requested, {available:#x} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("failed to change protection of JIT memory at offset {offset:#x} (+{size:#x})")]
    ProtectionFailed { offset: usize, size: usize },

    #[error("code generation failed: {reason}")]
    Codegen { reason: String },

    #[error("spill area exhausted: {slots} slots needed")]
    SpillAreaExhausted { slots: usize },

    #[error("guest address {address:#x} is outside the {bits}-bit address space")]
    AddressOutOfRange { address: u64, bits: u32 },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type JitResult<T> = Result<T, JitError>;
