//! Process-wide and thread-local allocator state.
//!
//! - The **default allocator** backs every unset [`Allocator`] handle. It
//!   is [`HEAP`] unless [`set_default_allocator`] (or [`init`]) installs
//!   another one before the first allocation.
//! - **Temporary storage** is one [`Arena`] per thread, created on first
//!   use with the configured capacity. Scratch work takes a [`TempScope`]
//!   (or [`with_temp_storage`]); everything allocated through the scope is
//!   reclaimed when the scope ends.
//!
//! Each thread's temporary arena is leaked: it lives until the process
//! exits, so every thread that touches temporary storage keeps
//! [`temp_storage_size`] bytes for good. Short-lived threads in a pool
//! should keep that cost in mind.
//!
//! ```
//! use bedrock_mem::global::with_temp_storage;
//! use bedrock_mem::list::List;
//!
//! let total = with_temp_storage(|scope| {
//!     let mut squares = List::new_in(scope.allocator());
//!     for i in 0..10u64 {
//!         squares.append(i * i);
//!     }
//!     squares.iter().sum::<u64>()
//! });
//! assert_eq!(total, 285);
//! ```

use std::cell::{Cell, OnceCell};
use std::fmt;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use bedrock_log::debug;

use crate::allocator::{Allocator, HEAP, RawAllocator};
use crate::arena::{Arena, ArenaMark};
use crate::error::{MemError, Result};
use crate::fatal::fatal;

/// Capacity of each thread's temporary storage unless configured otherwise.
pub const DEFAULT_TEMP_STORAGE_SIZE: usize = 32 * 1024;

static DEFAULT_ALLOCATOR: OnceLock<&'static (dyn RawAllocator + Sync)> = OnceLock::new();
static TEMP_STORAGE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_TEMP_STORAGE_SIZE);

/// Installs the process default allocator.
///
/// # Errors
///
/// Returns [`MemError::DefaultAllocatorLocked`] if a default was already
/// installed or already handed out by [`default_allocator`].
pub fn set_default_allocator<A: RawAllocator + Sync>(raw: &'static A) -> Result<()> {
    DEFAULT_ALLOCATOR
        .set(raw)
        .map_err(|_| MemError::DefaultAllocatorLocked)
}

/// Returns the process default allocator, locking in [`HEAP`] if none was set.
#[must_use]
pub fn default_allocator() -> &'static dyn RawAllocator {
    *DEFAULT_ALLOCATOR.get_or_init(|| &HEAP)
}

/// Process start-up configuration.
#[derive(Clone, Copy)]
pub struct MemConfig {
    /// Capacity of each thread's temporary storage arena.
    pub temp_storage_size: usize,
    /// Replacement for the heap as the process default allocator.
    pub default_allocator: Option<&'static (dyn RawAllocator + Sync)>,
}

impl MemConfig {
    /// Sets the temporary storage capacity.
    #[must_use]
    pub fn with_temp_storage_size(mut self, size: usize) -> Self {
        self.temp_storage_size = size;
        self
    }

    /// Sets the default allocator.
    #[must_use]
    pub fn with_default_allocator<A: RawAllocator + Sync>(mut self, raw: &'static A) -> Self {
        self.default_allocator = Some(raw);
        self
    }
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            temp_storage_size: DEFAULT_TEMP_STORAGE_SIZE,
            default_allocator: None,
        }
    }
}

impl fmt::Debug for MemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemConfig")
            .field("temp_storage_size", &self.temp_storage_size)
            .field("default_allocator", &self.default_allocator.is_some())
            .finish()
    }
}

/// Applies `config`. Call once at start-up, before any allocation.
///
/// Threads whose temporary storage already exists keep their capacity.
///
/// # Errors
///
/// Returns [`MemError::DefaultAllocatorLocked`] if `config` names a default
/// allocator and the default is already fixed.
pub fn init(config: MemConfig) -> Result<()> {
    TEMP_STORAGE_SIZE.store(config.temp_storage_size, Ordering::Relaxed);
    if let Some(raw) = config.default_allocator {
        DEFAULT_ALLOCATOR
            .set(raw)
            .map_err(|_| MemError::DefaultAllocatorLocked)?;
    }
    debug!("memory configured: {config:?}");
    Ok(())
}

/// Capacity new thread-local arenas are created with.
#[must_use]
pub fn temp_storage_size() -> usize {
    TEMP_STORAGE_SIZE.load(Ordering::Relaxed)
}

struct ThreadScratch {
    arena: OnceCell<&'static Arena<'static>>,
    depth: Cell<usize>,
}

thread_local! {
    static SCRATCH: ThreadScratch = const {
        ThreadScratch {
            arena: OnceCell::new(),
            depth: Cell::new(0),
        }
    };
}

/// The calling thread's arena. It lives for the rest of the process.
fn scratch_arena() -> &'static Arena<'static> {
    SCRATCH.with(|scratch| {
        *scratch.arena.get_or_init(|| {
            let size = temp_storage_size();
            debug!(
                "creating {size} bytes of temporary storage for {:?}",
                std::thread::current().id()
            );
            Box::leak(Box::new(Arena::with_capacity(size)))
        })
    })
}

fn scope_depth() -> usize {
    SCRATCH.with(|scratch| scratch.depth.get())
}

fn set_scope_depth(depth: usize) {
    SCRATCH.with(|scratch| scratch.depth.set(depth));
}

/// Returns the current cursor of this thread's temporary storage.
#[must_use]
pub fn temp_storage_mark() -> ArenaMark {
    scratch_arena().mark()
}

/// Rewinds this thread's temporary storage to `mark`.
///
/// # Safety
///
/// Nothing allocated from temporary storage after `mark` may be used
/// afterwards, and no [`TempScope`] entered after `mark` may still be alive.
pub unsafe fn temp_storage_rewind(mark: ArenaMark) {
    // SAFETY: forwarded caller contract.
    unsafe { scratch_arena().rewind_unchecked(mark) }
}

/// Reclaims all of this thread's temporary storage.
///
/// # Safety
///
/// No temporary allocation may be used afterwards and no [`TempScope`]
/// may be alive.
pub unsafe fn reset_temp_storage() {
    // SAFETY: forwarded caller contract.
    unsafe { temp_storage_rewind(ArenaMark::START) }
}

/// Returns an unscoped handle to this thread's temporary storage.
///
/// # Safety
///
/// Allocations made through the handle must not be used after a rewind
/// that precedes them, including the rewind of any [`TempScope`] that is
/// alive when they are made. Prefer [`TempScope::allocator`].
#[must_use]
pub unsafe fn temp_allocator() -> Allocator<'static> {
    Allocator::new(scratch_arena())
}

/// A region of this thread's temporary storage.
///
/// Entering records the arena cursor; dropping the scope rewinds to it.
/// Scopes nest and must be released in reverse order of entry. While an
/// inner scope is alive, any use of an outer scope's allocator is fatal.
pub struct TempScope {
    arena: &'static Arena<'static>,
    mark: ArenaMark,
    depth: usize,
}

impl TempScope {
    /// Enters a new innermost scope.
    #[must_use]
    pub fn enter() -> Self {
        let arena = scratch_arena();
        let depth = scope_depth() + 1;
        set_scope_depth(depth);
        Self {
            arena,
            mark: arena.mark(),
            depth,
        }
    }

    /// Returns a handle that allocates in this scope.
    #[must_use]
    pub fn allocator(&self) -> Allocator<'_> {
        Allocator::new(self)
    }

    /// Nesting depth of this scope; the outermost scope is 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Cursor the scope rewinds to.
    #[must_use]
    pub fn mark(&self) -> ArenaMark {
        self.mark
    }

    /// Bytes allocated in this scope and any scope nested inside it.
    #[must_use]
    pub fn used(&self) -> usize {
        self.arena.used() - self.mark.offset()
    }
}

// SAFETY: forwards to the thread arena; only the innermost scope may
// allocate or free, so the cursor never moves below a live inner scope's
// mark.
unsafe impl RawAllocator for TempScope {
    unsafe fn allocate(
        &self,
        new_size: usize,
        old: Option<NonNull<u8>>,
        old_size: usize,
    ) -> Option<NonNull<u8>> {
        if scope_depth() != self.depth {
            // Frees through an outer scope are dropped; the memory comes
            // back when that scope ends.
            if new_size == 0 {
                return None;
            }
            fatal("Temporary storage used through an outer scope.");
        }
        // SAFETY: forwarded caller contract.
        unsafe { RawAllocator::allocate(self.arena, new_size, old, old_size) }
    }
}

impl Drop for TempScope {
    fn drop(&mut self) {
        if scope_depth() != self.depth {
            fatal("Temporary storage scopes released out of order.");
        }
        // SAFETY: allocations through this scope borrow it, so they are
        // gone; inner scopes were released first.
        unsafe { self.arena.rewind_unchecked(self.mark) };
        set_scope_depth(self.depth - 1);
    }
}

impl fmt::Debug for TempScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempScope")
            .field("depth", &self.depth)
            .field("mark", &self.mark)
            .finish()
    }
}

/// Runs `f` inside a fresh [`TempScope`].
pub fn with_temp_storage<R>(f: impl FnOnce(&TempScope) -> R) -> R {
    let scope = TempScope::enter();
    f(&scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::List;

    #[test]
    fn test_default_allocator_locks_on_first_use() {
        let first = default_allocator();
        assert!(std::ptr::addr_eq(first, default_allocator()));
        assert_eq!(
            set_default_allocator(&HEAP),
            Err(MemError::DefaultAllocatorLocked)
        );
    }

    #[test]
    fn test_scope_rewinds_on_drop() {
        let before = temp_storage_mark();
        {
            let scope = TempScope::enter();
            let ptr = scope.allocator().allocate(100);
            assert!(ptr.is_some());
            assert!(scope.used() >= 100);
        }
        assert_eq!(temp_storage_mark(), before);
    }

    #[test]
    fn test_nested_scopes() {
        let outer = TempScope::enter();
        let mut outer_list = List::new_in(outer.allocator());
        outer_list.append(1u32);

        {
            let inner = TempScope::enter();
            assert_eq!(inner.depth(), outer.depth() + 1);
            let mut inner_list = List::new_in(inner.allocator());
            inner_list.append_slice(&[2u32, 3, 4]);
            assert_eq!(inner_list.len(), 3);
        }

        outer_list.append(5);
        assert_eq!(outer_list.as_slice(), &[1, 5]);
    }

    #[test]
    #[should_panic(expected = "Temporary storage used through an outer scope.")]
    fn test_outer_scope_use_is_fatal() {
        let outer = TempScope::enter();
        let _inner = TempScope::enter();
        let _ = outer.allocator().allocate(8);
    }

    #[test]
    fn test_outer_scope_free_inside_inner_scope() {
        let outer = TempScope::enter();
        let mut names = List::new_in(outer.allocator());
        names.append(1u32);

        let inner = TempScope::enter();
        let mark = temp_storage_mark();
        // The old list is freed through the outer scope.
        names = List::new_in(outer.allocator());
        assert_eq!(temp_storage_mark(), mark);
        assert_eq!(inner.used(), 0);
        drop(inner);

        names.append(2);
        assert_eq!(names.as_slice(), &[2]);
    }

    #[test]
    #[should_panic(expected = "Temporary storage scopes released out of order.")]
    fn test_out_of_order_release_is_fatal() {
        let outer = TempScope::enter();
        let inner = TempScope::enter();
        drop(outer);
        drop(inner);
    }

    #[test]
    fn test_with_temp_storage_returns_value() {
        let joined = with_temp_storage(|scope| {
            let mut bytes = List::new_in(scope.allocator());
            bytes.append_slice(b"scratch");
            String::from_utf8_lossy(&bytes).into_owned()
        });
        assert_eq!(joined, "scratch");
    }

    #[test]
    fn test_manual_mark_and_rewind() {
        let mark = temp_storage_mark();
        let handle = unsafe { temp_allocator() };
        let _ = handle.allocate(64);
        assert!(temp_storage_mark() > mark);
        unsafe { temp_storage_rewind(mark) };
        assert_eq!(temp_storage_mark(), mark);
    }

    #[test]
    fn test_reset_temp_storage() {
        let handle = unsafe { temp_allocator() };
        let _ = handle.allocate(32);
        unsafe { reset_temp_storage() };
        assert_eq!(temp_storage_mark().offset(), 0);
    }

    #[test]
    fn test_config_defaults() {
        let config = MemConfig::default();
        assert_eq!(config.temp_storage_size, DEFAULT_TEMP_STORAGE_SIZE);
        assert!(config.default_allocator.is_none());

        let config = config.with_temp_storage_size(1024).with_default_allocator(&HEAP);
        assert_eq!(config.temp_storage_size, 1024);
        assert!(config.default_allocator.is_some());
    }
}
