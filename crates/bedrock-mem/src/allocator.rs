//! The allocator protocol every container in this crate is built on.
//!
//! An allocator is a single dispatch function over opaque state, the
//! [`RawAllocator`] trait. One call handles all three operations,
//! selected by the `(old, new_size)` combination:
//!
//! | `old`   | `new_size` | effect                                          |
//! |---------|------------|-------------------------------------------------|
//! | `None`  | `> 0`      | allocate `new_size` zeroed bytes                |
//! | `Some`  | `> 0`      | resize, keeping the shorter prefix; may move    |
//! | `Some`  | `0`        | free                                            |
//! | `None`  | `0`        | nothing                                         |
//!
//! [`Allocator`] is the handle passed to constructors. It is `Copy`,
//! borrows the allocator it names, and may be left unset, in which case
//! it resolves to the process default (see [`crate::global`]).
//!
//! # Example
//!
//! ```
//! use bedrock_mem::allocator::{Allocator, HEAP};
//!
//! let heap = Allocator::new(&HEAP);
//! let ptr = heap.allocate(64).unwrap();
//! unsafe {
//!     assert_eq!(*ptr.as_ptr(), 0);
//!     heap.deallocate(Some(ptr), 64);
//! }
//! ```

use std::alloc::{self, Layout};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::MemError;
use crate::fatal::fatal;
use crate::global;

/// Alignment guaranteed by every allocator for every allocation.
pub const ALLOC_ALIGN: usize = 16;

/// A memory allocator with the single-function calling convention.
///
/// # Safety
///
/// Implementors must return pointers aligned to [`ALLOC_ALIGN`] and valid
/// for `new_size` bytes until they are resized or freed. Fresh
/// allocations are zero-filled. A resize preserves the first
/// `min(old_size, new_size)` bytes. Distinct live allocations never
/// overlap.
pub unsafe trait RawAllocator {
    /// Allocates, resizes or frees, depending on `old` and `new_size`.
    ///
    /// Returns `None` after a free, for the `(None, 0)` no-op, and when
    /// memory is exhausted.
    ///
    /// # Safety
    ///
    /// `old`, when present, must be a live allocation made by this
    /// allocator whose current size is `old_size`.
    unsafe fn allocate(
        &self,
        new_size: usize,
        old: Option<NonNull<u8>>,
        old_size: usize,
    ) -> Option<NonNull<u8>>;
}

/// A handle naming an allocator, or nothing.
///
/// The unset handle ([`Allocator::UNSET`], also `Default`) resolves to the
/// process default allocator each time it is used.
#[derive(Clone, Copy, Default)]
pub struct Allocator<'a> {
    inner: Option<&'a dyn RawAllocator>,
}

impl<'a> Allocator<'a> {
    /// The unset handle.
    pub const UNSET: Allocator<'static> = Allocator { inner: None };

    /// Creates a handle bound to `raw`.
    #[must_use]
    pub fn new<A: RawAllocator>(raw: &'a A) -> Self {
        Self { inner: Some(raw) }
    }

    /// Returns true if this handle names no allocator.
    #[must_use]
    pub fn is_unset(self) -> bool {
        self.inner.is_none()
    }

    /// Returns the allocator this handle stands for.
    #[must_use]
    pub fn resolve(self) -> &'a dyn RawAllocator {
        match self.inner {
            Some(raw) => raw,
            None => global::default_allocator(),
        }
    }

    /// Returns true if both handles resolve to the same allocator.
    ///
    /// An unset handle and an explicit handle to the default allocator
    /// compare equal.
    #[must_use]
    pub fn same_as(self, other: Allocator<'_>) -> bool {
        ptr::addr_eq(
            self.resolve() as *const dyn RawAllocator,
            other.resolve() as *const dyn RawAllocator,
        )
    }

    /// Allocates `bytes` zeroed bytes.
    ///
    /// Returns `None` for a zero-byte request. Exhausted memory is fatal.
    #[must_use]
    pub fn allocate(self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        // SAFETY: no old allocation is passed.
        let ptr = unsafe { self.resolve().allocate(bytes, None, 0) };
        if ptr.is_none() {
            fatal(&MemError::OutOfMemory { requested: bytes }.to_string());
        }
        ptr
    }

    /// Resizes `old` from `old_bytes` to `bytes`.
    ///
    /// Resizing to zero frees and returns `None`. Exhausted memory is fatal.
    ///
    /// # Safety
    ///
    /// `old` must be a live allocation of `old_bytes` bytes from the
    /// allocator this handle resolves to.
    pub unsafe fn reallocate(
        self,
        bytes: usize,
        old: Option<NonNull<u8>>,
        old_bytes: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        let ptr = unsafe { self.resolve().allocate(bytes, old, old_bytes) };
        if bytes > 0 && ptr.is_none() {
            fatal(&MemError::OutOfMemory { requested: bytes }.to_string());
        }
        ptr
    }

    /// Frees `ptr`. A `None` pointer is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of `old_bytes` bytes from the
    /// allocator this handle resolves to.
    pub unsafe fn deallocate(self, ptr: Option<NonNull<u8>>, old_bytes: usize) {
        if ptr.is_some() {
            // SAFETY: forwarded caller contract.
            unsafe {
                self.resolve().allocate(0, ptr, old_bytes);
            }
        }
    }

    /// Allocates room for `count` values of `T`.
    ///
    /// Zero-sized requests return a dangling pointer and allocate nothing.
    #[must_use]
    pub fn allocate_array<T>(self, count: usize) -> NonNull<T> {
        match self.allocate(array_bytes::<T>(count)) {
            Some(ptr) => ptr.cast(),
            None => NonNull::dangling(),
        }
    }

    /// Resizes an array from `old_count` to `new_count` values of `T`.
    ///
    /// # Safety
    ///
    /// `old` must come from [`Allocator::allocate_array`] or
    /// [`Allocator::reallocate_array`] on the same allocator with
    /// `old_count` elements.
    pub unsafe fn reallocate_array<T>(
        self,
        old: NonNull<T>,
        old_count: usize,
        new_count: usize,
    ) -> NonNull<T> {
        let old_bytes = array_bytes::<T>(old_count);
        let new_bytes = array_bytes::<T>(new_count);
        let old = (old_bytes > 0).then_some(old.cast::<u8>());
        // SAFETY: forwarded caller contract; a zero-byte array was never allocated.
        match unsafe { self.reallocate(new_bytes, old, old_bytes) } {
            Some(ptr) => ptr.cast(),
            None => NonNull::dangling(),
        }
    }

    /// Frees an array of `count` values of `T`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Allocator::reallocate_array`].
    pub unsafe fn deallocate_array<T>(self, ptr: NonNull<T>, count: usize) {
        let bytes = array_bytes::<T>(count);
        if bytes > 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.deallocate(Some(ptr.cast()), bytes) }
        }
    }
}

impl<'a, A: RawAllocator> From<&'a A> for Allocator<'a> {
    fn from(raw: &'a A) -> Self {
        Allocator::new(raw)
    }
}

impl fmt::Debug for Allocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Some(raw) => write!(f, "Allocator({:p})", raw as *const dyn RawAllocator),
            None => f.write_str("Allocator(unset)"),
        }
    }
}

/// Byte size of `count` values of `T`, dying on overflow.
#[inline]
pub(crate) fn array_bytes<T>(count: usize) -> usize {
    const {
        assert!(
            mem::align_of::<T>() <= ALLOC_ALIGN,
            "element alignment exceeds ALLOC_ALIGN"
        );
    }
    match mem::size_of::<T>().checked_mul(count) {
        Some(bytes) if bytes <= isize::MAX as usize => bytes,
        _ => fatal("Allocation size overflow."),
    }
}

/// Rounds `addr` up to a multiple of `align` (a power of two).
#[inline]
pub(crate) const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Live-allocation counters of a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes currently allocated.
    pub live_bytes: usize,
    /// Allocations not yet freed.
    pub live_allocations: usize,
}

/// The process heap, through `std::alloc`.
///
/// Keeps counters of live memory so leaks show up in [`Heap::stats`].
pub struct Heap {
    live_bytes: AtomicUsize,
    live_allocations: AtomicUsize,
}

/// The heap allocator used when no default has been configured.
pub static HEAP: Heap = Heap::new();

impl Heap {
    /// Creates a heap allocator with zeroed counters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            live_bytes: AtomicUsize::new(0),
            live_allocations: AtomicUsize::new(0),
        }
    }

    /// Returns the live-allocation counters.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            live_allocations: self.live_allocations.load(Ordering::Relaxed),
        }
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, ALLOC_ALIGN).ok()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: every layout uses ALLOC_ALIGN; `alloc_zeroed` zero-fills fresh
// memory and `realloc` keeps the common prefix.
unsafe impl RawAllocator for Heap {
    unsafe fn allocate(
        &self,
        new_size: usize,
        old: Option<NonNull<u8>>,
        old_size: usize,
    ) -> Option<NonNull<u8>> {
        let old = old.filter(|_| old_size > 0);
        match (old, new_size) {
            (None, 0) => None,
            (None, size) => {
                let layout = Self::layout(size)?;
                // SAFETY: layout has a non-zero size.
                let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
                self.live_bytes.fetch_add(size, Ordering::Relaxed);
                self.live_allocations.fetch_add(1, Ordering::Relaxed);
                Some(ptr)
            }
            (Some(ptr), 0) => {
                let layout = Self::layout(old_size)?;
                // SAFETY: the caller guarantees `ptr` was allocated here
                // with `old_size` bytes, hence with this layout.
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                self.live_bytes.fetch_sub(old_size, Ordering::Relaxed);
                self.live_allocations.fetch_sub(1, Ordering::Relaxed);
                None
            }
            (Some(ptr), size) => {
                let layout = Self::layout(old_size)?;
                Self::layout(size)?;
                // SAFETY: same allocation contract as above; the new size
                // is non-zero and forms a valid layout.
                let new = NonNull::new(unsafe { alloc::realloc(ptr.as_ptr(), layout, size) })?;
                self.live_bytes.fetch_add(size, Ordering::Relaxed);
                self.live_bytes.fetch_sub(old_size, Ordering::Relaxed);
                Some(new)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocation_is_zeroed_and_aligned() {
        let heap = Heap::new();
        let ptr = unsafe { heap.allocate(100, None, 0) }.unwrap();
        assert_eq!(ptr.as_ptr().addr() % ALLOC_ALIGN, 0);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { heap.allocate(0, Some(ptr), 100) };
    }

    #[test]
    fn test_heap_resize_preserves_prefix() {
        let heap = Heap::new();
        let ptr = unsafe { heap.allocate(8, None, 0) }.unwrap();
        unsafe {
            ptr::copy_nonoverlapping(b"bedrock!".as_ptr(), ptr.as_ptr(), 8);
        }
        let grown = unsafe { heap.allocate(4096, Some(ptr), 8) }.unwrap();
        let prefix = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 8) };
        assert_eq!(prefix, b"bedrock!");

        let shrunk = unsafe { heap.allocate(3, Some(grown), 4096) }.unwrap();
        let prefix = unsafe { std::slice::from_raw_parts(shrunk.as_ptr(), 3) };
        assert_eq!(prefix, b"bed");
        unsafe { heap.allocate(0, Some(shrunk), 3) };
    }

    #[test]
    fn test_heap_null_zero_is_noop() {
        let heap = Heap::new();
        assert!(unsafe { heap.allocate(0, None, 0) }.is_none());
        assert_eq!(heap.stats().live_allocations, 0);
    }

    #[test]
    fn test_heap_stats_track_live_memory() {
        let heap = Heap::new();
        let a = unsafe { heap.allocate(32, None, 0) }.unwrap();
        let b = unsafe { heap.allocate(64, None, 0) }.unwrap();
        assert_eq!(
            heap.stats(),
            HeapStats {
                live_bytes: 96,
                live_allocations: 2
            }
        );

        let b = unsafe { heap.allocate(128, Some(b), 64) }.unwrap();
        assert_eq!(heap.stats().live_bytes, 160);

        unsafe {
            heap.allocate(0, Some(a), 32);
            heap.allocate(0, Some(b), 128);
        }
        assert_eq!(heap.stats(), HeapStats { live_bytes: 0, live_allocations: 0 });
    }

    #[test]
    fn test_handle_identity() {
        let a = Heap::new();
        let b = Heap::new();
        assert!(Allocator::new(&a).same_as(Allocator::new(&a)));
        assert!(!Allocator::new(&a).same_as(Allocator::new(&b)));
        let explicit_default = Allocator {
            inner: Some(global::default_allocator()),
        };
        assert!(Allocator::UNSET.same_as(explicit_default));
    }

    #[test]
    fn test_unset_handle_resolves_to_default() {
        let handle = Allocator::default();
        assert!(handle.is_unset());
        let ptr = handle.allocate(16).unwrap();
        unsafe { handle.deallocate(Some(ptr), 16) };
    }

    #[test]
    fn test_zero_byte_requests_allocate_nothing() {
        let heap = Heap::new();
        let handle = Allocator::new(&heap);
        assert!(handle.allocate(0).is_none());
        let array: NonNull<u64> = handle.allocate_array(0);
        assert_eq!(array, NonNull::dangling());
        unsafe { handle.deallocate_array(array, 0) };
        assert_eq!(heap.stats().live_allocations, 0);
    }

    #[test]
    fn test_array_round_trip() {
        let heap = Heap::new();
        let handle = Allocator::new(&heap);
        let array: NonNull<u32> = handle.allocate_array(4);
        unsafe {
            for i in 0..4 {
                array.as_ptr().add(i).write(i as u32 * 10);
            }
            let array = handle.reallocate_array(array, 4, 8);
            assert_eq!(*array.as_ptr().add(3), 30);
            handle.deallocate_array(array, 8);
        }
        assert_eq!(heap.stats().live_bytes, 0);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 8), 24);
    }

    #[test]
    #[should_panic(expected = "Allocation size overflow.")]
    fn test_array_size_overflow_is_fatal() {
        let _ = array_bytes::<u64>(usize::MAX / 2);
    }
}
