//! Multi-level lookup table from guest addresses to host entry points.
//!
//! Lookups are lock-free. Intermediate nodes are materialized on first
//! install with a compare-and-swap; leaves are published with release stores
//! and read with acquire loads, so a reader that sees an entry also sees the
//! finished code behind it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::{JitError, JitResult};

/// One level of the table: `length` address bits starting at bit `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTableLevel {
    pub index: u32,
    pub length: u32,
}

impl AddressTableLevel {
    pub const fn new(index: u32, length: u32) -> Self {
        Self { index, length }
    }

    pub fn entries(&self) -> usize {
        1 << self.length
    }

    pub fn slot(&self, address: u64) -> usize {
        ((address >> self.index) & ((1u64 << self.length) - 1)) as usize
    }
}

const fn level(index: u32, length: u32) -> AddressTableLevel {
    AddressTableLevel::new(index, length)
}

pub const LEVELS_64_DENSE: &[AddressTableLevel] = &[
    level(48, 16),
    level(36, 12),
    level(24, 12),
    level(12, 12),
    level(0, 12),
];

pub const LEVELS_64_SPARSE: &[AddressTableLevel] = &[
    level(56, 8),
    level(48, 8),
    level(40, 8),
    level(32, 8),
    level(24, 8),
    level(16, 8),
    level(8, 8),
    level(0, 8),
];

pub const LEVELS_32_DENSE: &[AddressTableLevel] = &[level(20, 12), level(10, 10), level(0, 10)];

pub const LEVELS_32_SPARSE: &[AddressTableLevel] =
    &[level(24, 8), level(16, 8), level(8, 8), level(0, 8)];

pub fn preset(is_64_bit: bool, low_power: bool) -> &'static [AddressTableLevel] {
    match (is_64_bit, low_power) {
        (true, false) => LEVELS_64_DENSE,
        (true, true) => LEVELS_64_SPARSE,
        (false, false) => LEVELS_32_DENSE,
        (false, true) => LEVELS_32_SPARSE,
    }
}

enum Node {
    Branch(Box<[AtomicPtr<Node>]>),
    Leaf(Box<[AtomicUsize]>),
}

impl Node {
    fn new(levels: &[AddressTableLevel], depth: usize) -> Self {
        let n = levels[depth].entries();
        if depth + 1 == levels.len() {
            Node::Leaf((0..n).map(|_| AtomicUsize::new(0)).collect())
        } else {
            Node::Branch((0..n).map(|_| AtomicPtr::new(ptr::null_mut())).collect())
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Node::Branch(children) = self {
            for child in children.iter() {
                let p = child.load(Ordering::Acquire);
                if !p.is_null() {
                    drop(unsafe { Box::from_raw(p) });
                }
            }
        }
    }
}

/// Leaf value meaning "not translated".
pub const UNTRANSLATED: usize = 0;

pub struct AddressTable {
    levels: &'static [AddressTableLevel],
    bits: u32,
    root: Node,
    nodes: AtomicUsize,
}

impl AddressTable {
    pub fn new(levels: &'static [AddressTableLevel]) -> Self {
        let bits = levels.iter().map(|l| l.length).sum();
        debug_assert!(levels.last().map(|l| l.index) == Some(0));
        Self {
            levels,
            bits,
            root: Node::new(levels, 0),
            nodes: AtomicUsize::new(1),
        }
    }

    pub fn levels(&self) -> &'static [AddressTableLevel] {
        self.levels
    }

    pub fn address_bits(&self) -> u32 {
        self.bits
    }

    /// Number of node arrays allocated so far, the root included.
    pub fn allocated_nodes(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    fn in_range(&self, address: u64) -> bool {
        self.bits >= 64 || address >> self.bits == 0
    }

    fn leaf(&self, address: u64, create: bool) -> Option<&AtomicUsize> {
        if !self.in_range(address) {
            return None;
        }

        let mut node = &self.root;
        for (depth, level) in self.levels.iter().enumerate() {
            let slot = level.slot(address);
            match node {
                Node::Leaf(entries) => return Some(&entries[slot]),
                Node::Branch(children) => {
                    let child = &children[slot];
                    let mut p = child.load(Ordering::Acquire);
                    if p.is_null() {
                        if !create {
                            return None;
                        }
                        let fresh = Box::into_raw(Box::new(Node::new(self.levels, depth + 1)));
                        match child.compare_exchange(
                            ptr::null_mut(),
                            fresh,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                self.nodes.fetch_add(1, Ordering::Relaxed);
                                p = fresh;
                            }
                            Err(winner) => {
                                drop(unsafe { Box::from_raw(fresh) });
                                p = winner;
                            }
                        }
                    }
                    node = unsafe { &*p };
                }
            }
        }
        None
    }

    /// Host entry point installed for `address`, if any.
    pub fn lookup(&self, address: u64) -> Option<usize> {
        self.leaf(address, false)
            .map(|entry| entry.load(Ordering::Acquire))
            .filter(|&value| value != UNTRANSLATED)
    }

    /// Publishes `value` for `address` and returns what it replaced.
    pub fn install(&self, address: u64, value: usize) -> JitResult<usize> {
        let entry = self
            .leaf(address, true)
            .ok_or(JitError::AddressOutOfRange {
                address,
                bits: self.bits,
            })?;
        Ok(entry.swap(value, Ordering::AcqRel))
    }

    /// Clears the entry for `address` if it still holds `expected`.
    pub fn reset(&self, address: u64, expected: usize) -> bool {
        self.leaf(address, false).is_some_and(|entry| {
            entry
                .compare_exchange(expected, UNTRANSLATED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }
}
