//! Block-chained allocator with stable addresses.
//!
//! A [`Pool`] hands out memory from fixed-size blocks. When the current
//! block cannot fit a request, a new block is chained on. Nothing is ever
//! moved or freed individually, so every pointer stays valid until the
//! pool is destroyed.
//!
//! The first block is a bare `block_size` buffer owned by the pool
//! itself. Later blocks are a single allocation holding a small header
//! (link and fill level) followed by the payload.
//!
//! ```
//! use bedrock_mem::pool::Pool;
//!
//! let pool = Pool::with_block_size(64);
//! let a = pool.alloc(1u64);
//! let b = pool.alloc_str("a string long enough that it cannot share the first block with a");
//! assert_eq!(*a, 1);
//! assert!(b.starts_with("a string"));
//! assert_eq!(pool.block_count(), 2);
//! ```

use std::cell::Cell;
use std::mem;
use std::ptr::{self, NonNull};

use bedrock_log::{debug, trace};

use crate::allocator::{ALLOC_ALIGN, Allocator, RawAllocator, align_up, array_bytes};
use crate::error::{MemError, Result};
use crate::fatal::fatal;

/// Link and fill level of a chained block, stored in front of its payload.
struct BlockHeader {
    next: Cell<Option<NonNull<BlockHeader>>>,
    used: Cell<usize>,
}

/// Payload offset inside a chained block.
const HEADER_SIZE: usize = align_up(mem::size_of::<BlockHeader>(), ALLOC_ALIGN);

/// A chain of fixed-size blocks.
pub struct Pool<'a> {
    allocator: Allocator<'a>,
    block_size: usize,
    /// Payload of the first block, `None` until initialized.
    first: Option<NonNull<u8>>,
    first_used: Cell<usize>,
    first_next: Cell<Option<NonNull<BlockHeader>>>,
    /// Block new allocations come from; `None` means the first block.
    current: Cell<Option<NonNull<BlockHeader>>>,
    block_count: Cell<usize>,
}

impl Pool<'static> {
    /// Creates an empty pool with no blocks and the unset allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocator: Allocator::UNSET,
            block_size: 0,
            first: None,
            first_used: Cell::new(0),
            first_next: Cell::new(None),
            current: Cell::new(None),
            block_count: Cell::new(0),
        }
    }

    /// Creates a pool of `block_size` blocks from the default allocator.
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        Self::new_in(block_size, Allocator::UNSET)
    }
}

impl Default for Pool<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Pool<'a> {
    /// Creates a pool of `block_size` blocks taken from `allocator`.
    #[must_use]
    pub fn new_in(block_size: usize, allocator: Allocator<'a>) -> Self {
        let mut pool = Self {
            allocator,
            block_size: 0,
            first: None,
            first_used: Cell::new(0),
            first_next: Cell::new(None),
            current: Cell::new(None),
            block_count: Cell::new(0),
        };
        pool.init(block_size, allocator);
        pool
    }

    /// (Re)initializes the pool and allocates its first block.
    ///
    /// Blocks of a previous configuration are released first.
    pub fn init(&mut self, block_size: usize, allocator: Allocator<'a>) {
        self.destroy();
        self.allocator = allocator;
        self.block_size = block_size;
        self.first = allocator.allocate(block_size);
        if self.first.is_some() {
            self.block_count.set(1);
        }
        debug!("pool initialized with {block_size} byte blocks");
    }

    /// Frees every block, the first one included. Calling it twice is harmless.
    pub fn destroy(&mut self) {
        let mut next = self.first_next.take();
        while let Some(block) = next {
            // SAFETY: chained blocks stay alive until this loop frees them.
            next = unsafe { block.as_ref() }.next.get();
            // SAFETY: the block was allocated with HEADER_SIZE + block_size bytes.
            unsafe {
                self.allocator
                    .deallocate(Some(block.cast()), HEADER_SIZE + self.block_size);
            }
        }
        if let Some(first) = self.first.take() {
            // SAFETY: the first block was allocated with block_size bytes.
            unsafe { self.allocator.deallocate(Some(first), self.block_size) };
            debug!("pool destroyed ({} blocks)", self.block_count.get());
        }
        self.first_used.set(0);
        self.current.set(None);
        self.block_count.set(0);
    }

    /// Returns a handle that allocates from this pool.
    #[must_use]
    pub fn as_allocator(&self) -> Allocator<'_> {
        Allocator::new(self)
    }

    /// Size of every block's payload.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks allocated so far.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.block_count.get()
    }

    /// Allocates `size` zeroed bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// - [`MemError::InvalidAlignment`] if `alignment` is not a power of two.
    /// - [`MemError::BlockTooSmall`] if the request, including the padding
    ///   needed for `alignment`, does not fit in an empty block.
    pub fn try_allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(MemError::InvalidAlignment { alignment });
        }
        let Some(first) = self.first else {
            return Err(MemError::BlockTooSmall {
                requested: size,
                block_size: self.block_size,
            });
        };
        if size > self.block_size {
            return Err(MemError::BlockTooSmall {
                requested: size,
                block_size: self.block_size,
            });
        }

        let (data, used) = match self.current.get() {
            // SAFETY: chained blocks live until `destroy`.
            Some(block) => unsafe { (Self::payload(block), &block.as_ref().used) },
            None => (first, &self.first_used),
        };
        if let Some(ptr) = self.bump(data, used, size, alignment) {
            return Ok(ptr);
        }

        // Fresh payloads start ALLOC_ALIGN-aligned.
        let fresh_padding = alignment.saturating_sub(ALLOC_ALIGN);
        if fresh_padding + size > self.block_size {
            return Err(MemError::BlockTooSmall {
                requested: fresh_padding + size,
                block_size: self.block_size,
            });
        }

        let block = self.chain_block();
        // SAFETY: `chain_block` returns a live block.
        let used = unsafe { &block.as_ref().used };
        let data = Self::payload(block);
        self.bump(data, used, size, alignment).ok_or(MemError::BlockTooSmall {
            requested: padding(data, alignment) + size,
            block_size: self.block_size,
        })
    }

    /// Allocates `size` zeroed bytes aligned to `alignment`.
    ///
    /// Requests that cannot fit in a block are fatal.
    #[must_use]
    pub fn allocate(&self, size: usize, alignment: usize) -> NonNull<u8> {
        match self.try_allocate(size, alignment) {
            Ok(ptr) => ptr,
            Err(err) => fatal(&err.to_string()),
        }
    }

    /// Moves `value` into the pool. The value is never dropped.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> &mut T {
        let ptr = self
            .allocate(array_bytes::<T>(1), mem::align_of::<T>())
            .cast::<T>();
        // SAFETY: fresh, aligned for T and sized for one T.
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Copies `s` into the pool.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_str(&self, s: &str) -> &mut str {
        let ptr = self.allocate(s.len(), 1);
        // SAFETY: fresh allocation of `s.len()` bytes, disjoint from `s`;
        // the copied bytes are valid UTF-8.
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
            std::str::from_utf8_unchecked_mut(std::slice::from_raw_parts_mut(
                ptr.as_ptr(),
                s.len(),
            ))
        }
    }

    fn bump(
        &self,
        data: NonNull<u8>,
        used: &Cell<usize>,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<u8>> {
        let base = data.as_ptr().addr();
        let start = align_up(base + used.get(), alignment) - base;
        if start + size > self.block_size {
            return None;
        }
        used.set(start + size);
        // SAFETY: start + size <= block_size, inside the payload.
        Some(unsafe { data.add(start) })
    }

    /// Allocates a block and makes it current.
    fn chain_block(&self) -> NonNull<BlockHeader> {
        let Some(raw) = self.allocator.allocate(HEADER_SIZE + self.block_size) else {
            fatal("Could not allocate pool block.");
        };
        let block = raw.cast::<BlockHeader>();
        // SAFETY: fresh allocation, aligned to ALLOC_ALIGN and large enough
        // for the header.
        unsafe {
            block.as_ptr().write(BlockHeader {
                next: Cell::new(None),
                used: Cell::new(0),
            });
        }

        match self.current.get() {
            // SAFETY: the current block is alive.
            Some(current) => unsafe { current.as_ref() }.next.set(Some(block)),
            None => self.first_next.set(Some(block)),
        }
        self.current.set(Some(block));
        self.block_count.set(self.block_count.get() + 1);
        trace!("pool chained block {}", self.block_count.get());
        block
    }

    fn payload(block: NonNull<BlockHeader>) -> NonNull<u8> {
        // SAFETY: every chained block is HEADER_SIZE + block_size bytes.
        unsafe { block.cast::<u8>().add(HEADER_SIZE) }
    }
}

fn padding(data: NonNull<u8>, alignment: usize) -> usize {
    let base = data.as_ptr().addr();
    align_up(base, alignment) - base
}

impl Drop for Pool<'_> {
    fn drop(&mut self) {
        self.destroy();
    }
}

// SAFETY: allocations are ALLOC_ALIGN-aligned, zeroed (blocks come zeroed
// from the backing allocator and bytes are never handed out twice) and
// never move; resizing copies into a fresh allocation.
unsafe impl RawAllocator for Pool<'_> {
    unsafe fn allocate(
        &self,
        new_size: usize,
        old: Option<NonNull<u8>>,
        old_size: usize,
    ) -> Option<NonNull<u8>> {
        match (old, new_size) {
            (_, 0) => None,
            (None, size) => Some(Pool::allocate(self, size, ALLOC_ALIGN)),
            (Some(old), size) => {
                let fresh = Pool::allocate(self, size, ALLOC_ALIGN);
                // SAFETY: `old` is readable for `old_size` bytes; `fresh`
                // is a disjoint allocation of `size` bytes.
                unsafe {
                    ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), old_size.min(size));
                }
                Some(fresh)
            }
        }
    }
}

impl std::fmt::Debug for Pool<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count.get())
            .field("allocator", &self.allocator)
            .finish()
    }
}
