//! Host memory that holds generated code.
//!
//! A [`MemoryBlock`] reserves a range of address space up front and changes
//! protection of page ranges inside it. [`JitMemory`] carves page-granular
//! allocations out of one block, so every function owns whole pages and the
//! write-xor-execute discipline can be kept per function.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::error::{JitError, JitResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectionMode {
    /// Code pages are writable while being filled and read-execute afterwards.
    #[default]
    WriteXorExecute,
    /// Code pages stay read-write-execute, for hosts that cannot toggle
    /// protection cheaply.
    ReadWriteExecute,
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A reserved, initially inaccessible range of host address space.
pub struct MemoryBlock {
    ptr: NonNull<u8>,
    size: usize,
}

unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    pub fn reserve(size: usize) -> JitResult<Self> {
        let page = page_size();
        let size = size.div_ceil(page) * page;
        if size == 0 {
            return Err(JitError::ReserveFailed { size });
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::ReserveFailed { size });
        }

        NonNull::new(ptr as *mut u8)
            .map(|ptr| Self { ptr, size })
            .ok_or(JitError::ReserveFailed { size })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        address >= start && address < start + self.size
    }

    /// Backs the range with zeroed, writable pages.
    pub fn commit(&self, offset: usize, size: usize) -> JitResult<()> {
        self.protect(offset, size, libc::PROT_READ | libc::PROT_WRITE)
    }

    pub fn map_as_rw(&self, offset: usize, size: usize) -> JitResult<()> {
        self.protect(offset, size, libc::PROT_READ | libc::PROT_WRITE)
    }

    pub fn map_as_rx(&self, offset: usize, size: usize) -> JitResult<()> {
        self.protect(offset, size, libc::PROT_READ | libc::PROT_EXEC)
    }

    pub fn map_as_rwx(&self, offset: usize, size: usize) -> JitResult<()> {
        self.protect(
            offset,
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )
    }

    /// Returns the pages to the OS and makes the range inaccessible again.
    /// A later commit sees zeroed memory.
    pub fn decommit(&self, offset: usize, size: usize) -> JitResult<()> {
        self.check_range(offset, size)?;
        let rc = unsafe {
            libc::madvise(
                self.ptr.as_ptr().add(offset) as *mut libc::c_void,
                size,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            return Err(JitError::ProtectionFailed { offset, size });
        }
        self.protect(offset, size, libc::PROT_NONE)
    }

    fn check_range(&self, offset: usize, size: usize) -> JitResult<()> {
        let page = page_size();
        if offset % page != 0 || size % page != 0 || offset.saturating_add(size) > self.size {
            return Err(JitError::ProtectionFailed { offset, size });
        }
        Ok(())
    }

    fn protect(&self, offset: usize, size: usize, prot: libc::c_int) -> JitResult<()> {
        self.check_range(offset, size)?;
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().add(offset) as *mut libc::c_void,
                size,
                prot,
            )
        };
        if rc != 0 {
            log::warn!(
                "mprotect({offset:#x}, {size:#x}) failed: {}",
                std::io::Error::last_os_error()
            );
            return Err(JitError::ProtectionFailed { offset, size });
        }
        Ok(())
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
fn flush_icache(ptr: *const u8, len: usize) {
    extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe {
        __clear_cache(
            ptr as *mut libc::c_char,
            ptr.add(len) as *mut libc::c_char,
        );
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
fn flush_icache(ptr: *const u8, len: usize) {
    extern "C" {
        fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
    }
    unsafe { sys_icache_invalidate(ptr as *mut libc::c_void, len) }
}

// Coherent instruction caches.
#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_ptr: *const u8, _len: usize) {}

/// Page allocator. `free` maps a power-of-two size class (in pages) to the
/// offsets of free chunks of that class.
struct Allocator {
    next: usize,
    free: BTreeMap<usize, Vec<usize>>,
    in_use: usize,
}

impl Allocator {
    /// Takes a free chunk of `class` pages, splitting a larger one if needed.
    fn take(&mut self, class: usize, page: usize) -> Option<usize> {
        let larger = *self
            .free
            .range(class..)
            .find(|(_, list)| !list.is_empty())?
            .0;
        let offset = self.free.get_mut(&larger)?.pop()?;
        let mut half = larger;
        while half > class {
            half /= 2;
            self.free
                .entry(half)
                .or_default()
                .push(offset + half * page);
        }
        Some(offset)
    }

    /// Returns a chunk. Chunks at the end of the used range move `next` back.
    fn give_back(&mut self, offset: usize, class: usize, page: usize) {
        if self.in_use == 0 {
            self.free.clear();
            self.next = 0;
            return;
        }
        if offset + class * page != self.next {
            self.free.entry(class).or_default().push(offset);
            return;
        }
        self.next = offset;
        while let Some((class, index)) = self.free.iter().find_map(|(&class, list)| {
            list.iter()
                .position(|&o| o + class * page == self.next)
                .map(|index| (class, index))
        }) {
            if let Some(list) = self.free.get_mut(&class) {
                self.next = list.swap_remove(index);
            }
        }
        self.free.retain(|_, list| !list.is_empty());
    }
}

/// Executable-code arena with size-class free lists.
pub struct JitMemory {
    block: MemoryBlock,
    mode: ProtectionMode,
    page: usize,
    inner: Mutex<Allocator>,
}

impl JitMemory {
    pub fn new(size: usize, mode: ProtectionMode) -> JitResult<Arc<Self>> {
        let block = MemoryBlock::reserve(size)?;
        log::debug!(
            "reserved {:#x} bytes of JIT memory at {:p} ({mode:?})",
            block.size(),
            block.as_ptr()
        );
        Ok(Arc::new(Self {
            block,
            mode,
            page: page_size(),
            inner: Mutex::new(Allocator {
                next: 0,
                free: BTreeMap::new(),
                in_use: 0,
            }),
        }))
    }

    pub fn mode(&self) -> ProtectionMode {
        self.mode
    }

    /// Start and size of the reserved range.
    pub fn region(&self) -> (usize, usize) {
        (self.block.as_ptr() as usize, self.block.size())
    }

    pub fn contains(&self, address: usize) -> bool {
        self.block.contains(address)
    }

    pub fn bytes_in_use(&self) -> usize {
        self.inner.lock().map(|a| a.in_use).unwrap_or(0)
    }

    fn size_class(&self, len: usize) -> usize {
        len.max(1).div_ceil(self.page).next_power_of_two()
    }

    /// Copies `code` into fresh pages and makes them executable. The
    /// returned handle is ready to call once this returns.
    pub fn install(self: &Arc<Self>, code: &[u8]) -> JitResult<JitCode> {
        let class = self.size_class(code.len());
        let size = class * self.page;

        let mut inner = self.inner.lock().map_err(|_| JitError::OutOfMemory {
            requested: size,
            available: 0,
        })?;

        let offset = match inner.take(class, self.page) {
            Some(offset) => offset,
            None => {
                let available = self.block.size() - inner.next;
                if size > available {
                    return Err(JitError::OutOfMemory {
                        requested: size,
                        available,
                    });
                }
                inner.next += size;
                inner.next - size
            }
        };

        let result = self.fill(offset, size, code);
        if let Err(e) = result {
            let _ = self.block.decommit(offset, size);
            inner.give_back(offset, class, self.page);
            return Err(e);
        }
        inner.in_use += size;
        drop(inner);

        Ok(JitCode {
            memory: Arc::clone(self),
            offset,
            size,
            len: code.len(),
        })
    }

    fn fill(&self, offset: usize, size: usize, code: &[u8]) -> JitResult<()> {
        match self.mode {
            ProtectionMode::WriteXorExecute => self.block.commit(offset, size)?,
            ProtectionMode::ReadWriteExecute => self.block.map_as_rwx(offset, size)?,
        }
        unsafe {
            let dst = self.block.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(code.as_ptr(), dst, code.len());
        }
        if self.mode == ProtectionMode::WriteXorExecute {
            self.block.map_as_rx(offset, size)?;
        }
        flush_icache(unsafe { self.block.as_ptr().add(offset) }, code.len());
        Ok(())
    }

    fn release(&self, offset: usize, size: usize) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Err(e) = self.block.decommit(offset, size) {
            // The pages stay mapped executable; leak them rather than reuse.
            log::warn!("failed to release JIT code at {offset:#x}: {e}");
            return;
        }
        inner.in_use -= size;
        inner.give_back(offset, size / self.page, self.page);
    }
}

/// Pages holding one compiled function. Released back to the arena on drop.
pub struct JitCode {
    memory: Arc<JitMemory>,
    offset: usize,
    size: usize,
    len: usize,
}

impl JitCode {
    pub fn as_ptr(&self) -> *const u8 {
        unsafe { self.memory.block.as_ptr().add(self.offset) }
    }

    /// Bytes of generated code.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of JIT memory held, including page padding.
    pub fn footprint(&self) -> usize {
        self.size
    }
}

impl Drop for JitCode {
    fn drop(&mut self) {
        self.memory.release(self.offset, self.size);
    }
}

impl std::fmt::Debug for JitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCode")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}
