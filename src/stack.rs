//! Frame-pointer walking across generated code.
//!
//! Generated code keeps frame pointers, so every frame starts with the saved
//! caller frame pointer followed by the return address. The walk only
//! continues while return addresses land inside known code regions.

#[cfg(target_arch = "aarch64")]
pub const CALL_INSTRUCTION_LENGTH: u64 = 4;
#[cfg(not(target_arch = "aarch64"))]
pub const CALL_INSTRUCTION_LENGTH: u64 = 1;

/// Upper bound on frames visited in one walk.
pub const MAX_FRAMES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeRegion {
    pub start: u64,
    pub size: u64,
}

impl CodeRegion {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address - self.start < self.size
    }
}

pub struct FrameWalker {
    fp: u64,
    regions: [CodeRegion; 2],
    depth: usize,
}

impl FrameWalker {
    /// # Safety
    ///
    /// Every frame pointer reachable from `fp` whose return address lies in
    /// `regions` must point to two readable `u64` words.
    pub unsafe fn new(fp: u64, regions: [CodeRegion; 2]) -> Self {
        Self {
            fp,
            regions,
            depth: 0,
        }
    }
}

impl Iterator for FrameWalker {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.fp == 0 || self.fp % 8 != 0 || self.depth >= MAX_FRAMES {
            return None;
        }

        let frame = self.fp as *const u64;
        let (caller_fp, return_address) = unsafe { (frame.read(), frame.add(1).read()) };
        if !self.regions.iter().any(|r| r.contains(return_address)) {
            self.fp = 0;
            return None;
        }

        // Frames live on a downward-growing stack, so callers sit higher.
        self.fp = if caller_fp > self.fp { caller_fp } else { 0 };
        self.depth += 1;
        Some(return_address - CALL_INSTRUCTION_LENGTH)
    }
}

/// Call-site addresses of the frames starting at `fp`, innermost first.
///
/// # Safety
///
/// See [`FrameWalker::new`].
pub unsafe fn get_call_stack(
    fp: u64,
    code_region_start: u64,
    code_region_size: u64,
    code_region2_start: u64,
    code_region2_size: u64,
) -> Vec<u64> {
    FrameWalker::new(
        fp,
        [
            CodeRegion::new(code_region_start, code_region_size),
            CodeRegion::new(code_region2_start, code_region2_size),
        ],
    )
    .collect()
}
