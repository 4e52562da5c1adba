//! Fixed-capacity bump allocator with mark/rewind scoping.
//!
//! An [`Arena`] owns one contiguous buffer obtained from its backing
//! allocator and a `used` cursor that only moves forward, except:
//!
//! - the most recent allocation can grow or shrink in place,
//! - [`Arena::rewind`] moves the cursor back to an earlier [`ArenaMark`],
//!   reclaiming everything allocated since in one step.
//!
//! The arena never grows its buffer. Running out of space is fatal
//! (or an [`MemError::ArenaFull`] through [`Arena::try_allocate_bytes`]).
//!
//! # Architecture
//!
//! - [`Arena`]: the buffer, cursor and last-allocation record
//! - [`ArenaMark`]: a saved cursor position
//! - [`ArenaStats`]: usage counters, including the high-water mark
//!
//! # Examples
//!
//! ```
//! use bedrock_mem::arena::Arena;
//!
//! let mut arena = Arena::with_capacity(4096);
//!
//! let value = arena.alloc(42u32);
//! assert_eq!(*value, 42);
//!
//! let mark = arena.mark();
//! arena.alloc_str("scratch text");
//! arena.rewind(mark);
//! assert_eq!(arena.used(), mark.offset());
//! ```
//!
//! ## Containers inside an arena
//!
//! ```
//! use bedrock_mem::arena::Arena;
//! use bedrock_mem::list::List;
//!
//! let arena = Arena::with_capacity(4096);
//! let mut list = List::new_in(arena.as_allocator());
//! list.append(1u32);
//! list.append(2);
//! assert_eq!(list.as_slice(), &[1, 2]);
//! ```

use std::cell::Cell;
use std::ptr::{self, NonNull};

use bedrock_log::{debug, trace};

use crate::allocator::{ALLOC_ALIGN, Allocator, RawAllocator, align_up, array_bytes};
use crate::error::{MemError, Result};
use crate::fatal::fatal;

/// A saved arena cursor, produced by [`Arena::mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaMark(usize);

impl ArenaMark {
    /// The start of the buffer.
    pub const START: ArenaMark = ArenaMark(0);

    /// The cursor offset in bytes.
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// Arena usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes currently in use, including alignment padding.
    pub used: usize,
    /// Size of the buffer in bytes.
    pub capacity: usize,
    /// Largest `used` value seen since the buffer was allocated.
    pub high_water: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LastAllocation {
    offset: usize,
    size: usize,
}

/// A bump allocator over one fixed buffer.
///
/// Allocation goes through `&self`, so an arena can back several
/// containers at once through [`Arena::as_allocator`]. Rewinding and
/// resetting need `&mut self`, which the borrow checker only grants once
/// every such container is gone.
pub struct Arena<'a> {
    /// Allocator that owns `memory`.
    allocator: Allocator<'a>,
    /// Start of the buffer, `None` until initialized.
    memory: Option<NonNull<u8>>,
    /// Buffer size in bytes.
    capacity: usize,
    /// Bump cursor, `0 <= used <= capacity`.
    used: Cell<usize>,
    /// The only allocation that may be resized in place.
    last: Cell<Option<LastAllocation>>,
    high_water: Cell<usize>,
}

impl Arena<'static> {
    /// Creates an empty arena with no buffer and the unset allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocator: Allocator::UNSET,
            memory: None,
            capacity: 0,
            used: Cell::new(0),
            last: Cell::new(None),
            high_water: Cell::new(0),
        }
    }

    /// Creates an arena of `capacity` bytes from the default allocator.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new_in(capacity, Allocator::UNSET)
    }
}

impl Default for Arena<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Arena<'a> {
    /// Creates an arena of `capacity` bytes taken from `allocator`.
    #[must_use]
    pub fn new_in(capacity: usize, allocator: Allocator<'a>) -> Self {
        let mut arena = Self {
            allocator,
            memory: None,
            capacity: 0,
            used: Cell::new(0),
            last: Cell::new(None),
            high_water: Cell::new(0),
        };
        arena.init(capacity, allocator);
        arena
    }

    /// (Re)initializes the arena with a fresh buffer of `capacity` bytes.
    ///
    /// Any previous buffer is released to the allocator that provided it
    /// before `allocator` is bound.
    pub fn init(&mut self, capacity: usize, allocator: Allocator<'a>) {
        self.destroy();
        self.allocator = allocator;
        self.memory = allocator.allocate(capacity);
        self.capacity = capacity;
        debug!("arena initialized with {capacity} bytes");
    }

    /// Releases the buffer and resets every field. Calling it twice is harmless.
    pub fn destroy(&mut self) {
        if let Some(memory) = self.memory.take() {
            // SAFETY: `memory` was allocated by `self.allocator` with `capacity` bytes.
            unsafe { self.allocator.deallocate(Some(memory), self.capacity) };
            debug!(
                "arena destroyed ({} of {} bytes at peak)",
                self.high_water.get(),
                self.capacity
            );
        }
        self.capacity = 0;
        self.used.set(0);
        self.last.set(None);
        self.high_water.set(0);
    }

    /// Returns a handle that allocates from this arena.
    #[must_use]
    pub fn as_allocator(&self) -> Allocator<'_> {
        Allocator::new(self)
    }

    /// Returns the allocator the buffer came from.
    #[must_use]
    pub fn backing_allocator(&self) -> Allocator<'a> {
        self.allocator
    }

    /// Bytes in use, including alignment padding.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.get()
    }

    /// Buffer size in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes left before the arena is full, ignoring padding.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.used.get()
    }

    /// Returns usage counters.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            used: self.used.get(),
            capacity: self.capacity,
            high_water: self.high_water.get(),
        }
    }

    /// Bump-allocates `size` zeroed bytes aligned to [`ALLOC_ALIGN`].
    ///
    /// # Errors
    ///
    /// Returns [`MemError::ArenaFull`] if the request does not fit.
    pub fn try_allocate_bytes(&self, size: usize) -> Result<NonNull<u8>> {
        let used = self.used.get();
        let start = align_up(used, ALLOC_ALIGN);
        let available = self.capacity.saturating_sub(start);
        let Some(memory) = self.memory else {
            return Err(MemError::ArenaFull {
                requested: size,
                available: 0,
            });
        };
        if size > available {
            return Err(MemError::ArenaFull {
                requested: size,
                available,
            });
        }

        // SAFETY: start + size <= capacity, inside the buffer.
        let ptr = unsafe { memory.add(start) };
        // SAFETY: the range is inside the buffer and not handed out to
        // anyone else; it may hold stale bytes from before a rewind.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };

        self.set_used(start + size);
        self.last.set(Some(LastAllocation {
            offset: start,
            size,
        }));
        trace!("arena allocated {size} bytes at offset {start}");
        Ok(ptr)
    }

    /// Bump-allocates `size` zeroed bytes. Running out of space is fatal.
    #[must_use]
    pub fn allocate_bytes(&self, size: usize) -> NonNull<u8> {
        match self.try_allocate_bytes(size) {
            Ok(ptr) => ptr,
            Err(_) => fatal("Could not allocate from arena."),
        }
    }

    /// Resizes an allocation made from this arena.
    ///
    /// If `old` is the most recent allocation the cursor moves by the
    /// size difference and `old` is returned. Otherwise a fresh block is
    /// allocated and the common prefix copied; the old block stays
    /// occupied until the arena is rewound. A zero `size` frees.
    ///
    /// # Safety
    ///
    /// `old` must be a live allocation of `old_size` bytes from this arena.
    pub unsafe fn reallocate_bytes(
        &self,
        size: usize,
        old: NonNull<u8>,
        old_size: usize,
    ) -> Option<NonNull<u8>> {
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free_bytes(old, old_size) };
            return None;
        }

        if let Some(offset) = self.last_offset(old, old_size) {
            if offset + size > self.capacity {
                fatal("Could not allocate from arena.");
            }
            if size > old_size {
                // SAFETY: the grown tail lies inside the buffer, past the
                // end of the live allocation.
                unsafe { ptr::write_bytes(old.as_ptr().add(old_size), 0, size - old_size) };
            }
            self.set_used(offset + size);
            self.last.set(Some(LastAllocation { offset, size }));
            trace!("arena resized last allocation in place to {size} bytes");
            return Some(old);
        }

        let fresh = self.allocate_bytes(size);
        // SAFETY: `old` is readable for `old_size` bytes and `fresh` is a
        // new, disjoint allocation of `size` bytes.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), old_size.min(size));
        }
        Some(fresh)
    }

    /// Frees `old` if it is the most recent allocation; otherwise does nothing.
    ///
    /// # Safety
    ///
    /// `old` must not be used after this call.
    pub unsafe fn free_bytes(&self, old: NonNull<u8>, old_size: usize) {
        if let Some(offset) = self.last_offset(old, old_size) {
            self.used.set(offset);
            self.last.set(None);
        }
    }

    /// Returns the current cursor.
    #[must_use]
    pub fn mark(&self) -> ArenaMark {
        ArenaMark(self.used.get())
    }

    /// Moves the cursor back to `mark`, reclaiming everything allocated since.
    pub fn rewind(&mut self, mark: ArenaMark) {
        // SAFETY: `&mut self` proves no borrow of arena memory is alive.
        unsafe { self.rewind_unchecked(mark) }
    }

    /// Reclaims the whole buffer.
    pub fn reset(&mut self) {
        self.rewind(ArenaMark::START);
    }

    /// Rewinds through a shared reference.
    ///
    /// # Safety
    ///
    /// Nothing allocated after `mark` may be used afterwards.
    pub(crate) unsafe fn rewind_unchecked(&self, mark: ArenaMark) {
        debug_assert!(mark.0 <= self.capacity, "arena mark beyond capacity");
        self.used.set(mark.0.min(self.capacity));
        self.last.set(None);
    }

    /// Runs `f` and rewinds to the entry cursor afterwards, on every exit path.
    ///
    /// ```
    /// use bedrock_mem::arena::Arena;
    ///
    /// let mut arena = Arena::with_capacity(1024);
    /// let len = arena.scope(|arena| arena.alloc_str("temporary").len());
    /// assert_eq!(len, 9);
    /// assert_eq!(arena.used(), 0);
    /// ```
    pub fn scope<R>(&mut self, f: impl FnOnce(&Arena<'a>) -> R) -> R {
        struct Rewind<'s, 'a> {
            arena: &'s Arena<'a>,
            mark: ArenaMark,
        }

        impl Drop for Rewind<'_, '_> {
            fn drop(&mut self) {
                // SAFETY: `R` cannot borrow from the closure argument, so
                // nothing allocated inside the scope outlives it.
                unsafe { self.arena.rewind_unchecked(self.mark) };
            }
        }

        let guard = Rewind {
            mark: self.mark(),
            arena: self,
        };
        f(guard.arena)
    }

    /// Moves `value` into the arena.
    ///
    /// The value is never dropped; its memory is reclaimed by rewinding.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> &mut T {
        let ptr = self.allocate_bytes(array_bytes::<T>(1)).cast::<T>();
        // SAFETY: the block is fresh, aligned to ALLOC_ALIGN >= align_of::<T>()
        // and large enough for a T.
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Copies `values` into the arena.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_copy<T: Copy>(&self, values: &[T]) -> &mut [T] {
        let ptr = self.allocate_bytes(array_bytes::<T>(values.len())).cast::<T>();
        // SAFETY: fresh, aligned, sized for `values.len()` elements, and
        // disjoint from `values`.
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), ptr.as_ptr(), values.len());
            std::slice::from_raw_parts_mut(ptr.as_ptr(), values.len())
        }
    }

    /// Copies `s` into the arena.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_str(&self, s: &str) -> &mut str {
        let bytes = self.alloc_slice_copy(s.as_bytes());
        // SAFETY: the bytes were copied from a `str`.
        unsafe { std::str::from_utf8_unchecked_mut(bytes) }
    }

    fn set_used(&self, used: usize) {
        self.used.set(used);
        if used > self.high_water.get() {
            self.high_water.set(used);
        }
    }

    /// Offset of `old` if it is the live last allocation of `old_size` bytes.
    fn last_offset(&self, old: NonNull<u8>, old_size: usize) -> Option<usize> {
        let memory = self.memory?;
        let last = self.last.get()?;
        let offset = old.as_ptr().addr().checked_sub(memory.as_ptr().addr())?;
        (offset == last.offset && last.size == old_size && offset + old_size == self.used.get())
            .then_some(offset)
    }
}

impl Drop for Arena<'_> {
    fn drop(&mut self) {
        self.destroy();
    }
}

// SAFETY: fresh blocks are zeroed and aligned to ALLOC_ALIGN relative to
// a buffer that is itself ALLOC_ALIGN-aligned; the cursor never hands out
// a byte twice until a rewind.
unsafe impl RawAllocator for Arena<'_> {
    unsafe fn allocate(
        &self,
        new_size: usize,
        old: Option<NonNull<u8>>,
        old_size: usize,
    ) -> Option<NonNull<u8>> {
        match old {
            // SAFETY: forwarded caller contract.
            Some(old) => unsafe { self.reallocate_bytes(new_size, old, old_size) },
            None if new_size == 0 => None,
            None => Some(self.allocate_bytes(new_size)),
        }
    }
}

impl std::fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("used", &self.used.get())
            .field("capacity", &self.capacity)
            .field("allocator", &self.allocator)
            .finish()
    }
}
