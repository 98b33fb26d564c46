//! Guest physical memory as seen by translated code.
//!
//! A flat byte array covering `[base, base + size)` with per-page mapping
//! state. Unmapping and writing notify subscribers, which is how the
//! translator learns that code it compiled may be stale.

use std::sync::RwLock;

use crate::error::MemoryError;

pub const GUEST_PAGE_SIZE: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEvent {
    Unmapped { address: u64, size: u64 },
    Written { address: u64, size: u64 },
}

type Listener = Box<dyn Fn(MemoryEvent) + Send + Sync>;

struct Inner {
    bytes: Vec<u8>,
    mapped: Vec<bool>,
}

pub struct GuestMemory {
    base: u64,
    size: u64,
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<Listener>>,
}

impl GuestMemory {
    /// `base` and `size` are rounded out to whole pages. Nothing is mapped
    /// initially.
    pub fn new(base: u64, size: u64) -> Self {
        let base = base & !(GUEST_PAGE_SIZE - 1);
        let size = size.div_ceil(GUEST_PAGE_SIZE) * GUEST_PAGE_SIZE;
        Self {
            base,
            size,
            inner: RwLock::new(Inner {
                bytes: vec![0; size as usize],
                mapped: vec![false; (size / GUEST_PAGE_SIZE) as usize],
            }),
            listeners: RwLock::new(vec![]),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn subscribe(&self, listener: impl Fn(MemoryEvent) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Box::new(listener));
        }
    }

    fn notify(&self, event: MemoryEvent) {
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }

    fn offset(&self, address: u64, size: u64) -> Result<usize, MemoryError> {
        address
            .checked_sub(self.base)
            .filter(|off| off.checked_add(size).is_some_and(|end| end <= self.size))
            .map(|off| off as usize)
            .ok_or(MemoryError::OutOfRange { address, size })
    }

    fn pages(&self, offset: usize, size: u64) -> std::ops::Range<usize> {
        let first = offset / GUEST_PAGE_SIZE as usize;
        let last = (offset as u64 + size).div_ceil(GUEST_PAGE_SIZE) as usize;
        first..last
    }

    pub fn map(&self, address: u64, size: u64) -> Result<(), MemoryError> {
        let offset = self.offset(address, size)?;
        let pages = self.pages(offset, size);
        let mut inner = self.inner.write().map_err(|_| MemoryError::Unmapped { address, size })?;
        inner.mapped[pages].fill(true);
        Ok(())
    }

    pub fn unmap(&self, address: u64, size: u64) -> Result<(), MemoryError> {
        let offset = self.offset(address, size)?;
        let pages = self.pages(offset, size);
        {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| MemoryError::Unmapped { address, size })?;
            let start = pages.start * GUEST_PAGE_SIZE as usize;
            let end = pages.end * GUEST_PAGE_SIZE as usize;
            inner.mapped[pages].fill(false);
            inner.bytes[start..end].fill(0);
        }
        log::debug!("guest unmap {address:#x} (+{size:#x})");
        self.notify(MemoryEvent::Unmapped { address, size });
        Ok(())
    }

    pub fn is_mapped(&self, address: u64, size: u64) -> bool {
        let Ok(offset) = self.offset(address, size) else {
            return false;
        };
        let pages = self.pages(offset, size.max(1));
        self.inner
            .read()
            .is_ok_and(|inner| inner.mapped[pages].iter().all(|&m| m))
    }

    fn check_mapped(inner: &Inner, pages: std::ops::Range<usize>, address: u64, size: u64) -> Result<(), MemoryError> {
        if inner.mapped[pages].iter().all(|&m| m) {
            Ok(())
        } else {
            Err(MemoryError::Unmapped { address, size })
        }
    }

    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let size = buf.len() as u64;
        let offset = self.offset(address, size)?;
        let inner = self.inner.read().map_err(|_| MemoryError::Unmapped { address, size })?;
        Self::check_mapped(&inner, self.pages(offset, size), address, size)?;
        buf.copy_from_slice(&inner.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    pub fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let size = data.len() as u64;
        let offset = self.offset(address, size)?;
        {
            let mut inner = self
                .inner
                .write()
                .map_err(|_| MemoryError::Unmapped { address, size })?;
            Self::check_mapped(&inner, self.pages(offset, size), address, size)?;
            inner.bytes[offset..offset + data.len()].copy_from_slice(data);
        }
        self.notify(MemoryEvent::Written { address, size });
        Ok(())
    }

    /// Maps the pages covering `data` and copies it in.
    pub fn load(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.map(address, data.len() as u64)?;
        self.write(address, data)
    }

    pub fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Little-endian load of `1 << log2_size` bytes, zero-extended.
    pub fn read_sized(&self, address: u64, log2_size: u32) -> Result<u64, MemoryError> {
        let mut buf = [0; 8];
        self.read(address, &mut buf[..1 << log2_size])?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_sized(&self, address: u64, value: u64, log2_size: u32) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes()[..1 << log2_size])
    }
}
