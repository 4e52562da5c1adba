// Common test utilities for integration tests
//
// Shared allocator fixtures and drop tracking used across the
// integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use bedrock_mem::allocator::{Heap, RawAllocator};

/// Counts protocol calls on top of a private heap.
#[derive(Default)]
pub struct CountingAllocator {
    pub heap: Heap,
    pub allocations: Cell<usize>,
    pub resizes: Cell<usize>,
    pub frees: Cell<usize>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_bytes(&self) -> usize {
        self.heap.stats().live_bytes
    }
}

unsafe impl RawAllocator for CountingAllocator {
    unsafe fn allocate(
        &self,
        new_size: usize,
        old: Option<NonNull<u8>>,
        old_size: usize,
    ) -> Option<NonNull<u8>> {
        match (old, new_size) {
            (None, 0) => {}
            (None, _) => self.allocations.set(self.allocations.get() + 1),
            (Some(_), 0) => self.frees.set(self.frees.get() + 1),
            (Some(_), _) => self.resizes.set(self.resizes.get() + 1),
        }
        unsafe { self.heap.allocate(new_size, old, old_size) }
    }
}

/// Increments a shared counter when dropped.
#[derive(Debug, Clone)]
pub struct DropCounter {
    drops: Rc<Cell<usize>>,
}

impl DropCounter {
    pub fn new(drops: &Rc<Cell<usize>>) -> Self {
        Self {
            drops: Rc::clone(drops),
        }
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}
