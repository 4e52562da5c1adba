//! Growable contiguous list backed by any [`Allocator`].
//!
//! [`List`] is the substrate's `Vec`: a buffer, a length and a capacity,
//! with every byte obtained through the allocator protocol. Because growth
//! goes through the resize path, a list living in an [`Arena`] grows in
//! place while it is the arena's most recent allocation.
//!
//! Indices are `isize`. Negative values count from the end (`-1` is the
//! last element) for indexing, insertion and removal alike.
//!
//! ```
//! use bedrock_mem::list::List;
//!
//! let mut list = List::new();
//! list.append_slice(&[1, 2, 3, 4]);
//! assert_eq!(list[-1], 4);
//!
//! list.insert(0, 0);
//! assert_eq!(list.stable_remove(-2), Some(3));
//! assert_eq!(list.as_slice(), &[0, 1, 2, 4]);
//! ```
//!
//! [`Arena`]: crate::arena::Arena

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut, Index, IndexMut};
use std::ptr::{self, NonNull};
use std::slice;

use crate::allocator::Allocator;
use crate::fatal::{bounds_check, fatal};

/// A growable array.
pub struct List<'a, T> {
    data: NonNull<T>,
    len: usize,
    cap: usize,
    allocator: Allocator<'a>,
    _marker: PhantomData<T>,
}

impl<T> List<'static, T> {
    /// Creates an empty list on the default allocator. Allocates nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: NonNull::dangling(),
            len: 0,
            cap: 0,
            allocator: Allocator::UNSET,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for List<'static, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T> List<'a, T> {
    const IS_ZST: bool = mem::size_of::<T>() == 0;

    /// Creates an empty list bound to `allocator`. Allocates nothing.
    #[must_use]
    pub fn new_in(allocator: Allocator<'a>) -> Self {
        Self {
            data: NonNull::dangling(),
            len: 0,
            cap: 0,
            allocator,
            _marker: PhantomData,
        }
    }

    /// Creates an empty list with room for `capacity` elements.
    #[must_use]
    pub fn with_capacity_in(capacity: usize, allocator: Allocator<'a>) -> Self {
        let mut list = Self::new_in(allocator);
        list.set_capacity(capacity);
        list
    }

    /// Creates a list of `len` default values.
    #[must_use]
    pub fn prealloc(len: usize, allocator: Allocator<'a>) -> Self
    where
        T: Default,
    {
        let mut list = Self::with_capacity_in(len, allocator);
        for _ in 0..len {
            list.append_default();
        }
        list
    }

    /// Creates a list holding clones of `values`.
    #[must_use]
    pub fn from_slice_in(values: &[T], allocator: Allocator<'a>) -> Self
    where
        T: Clone,
    {
        let mut list = Self::with_capacity_in(values.len(), allocator);
        list.append_slice(values);
        list
    }

    /// Empties the list and resizes its buffer to exactly `capacity`.
    ///
    /// If `allocator` differs from the bound one, the old buffer is freed
    /// under the old allocator before rebinding.
    pub fn init(&mut self, capacity: usize, allocator: Allocator<'a>) {
        if !self.allocator.same_as(allocator) {
            self.destroy();
        }
        self.allocator = allocator;
        self.clear();
        self.set_capacity(capacity);
    }

    /// Drops every element and frees the buffer. Calling it twice is harmless.
    pub fn destroy(&mut self) {
        self.clear();
        self.set_capacity(0);
    }

    /// Drops every element, keeping the buffer.
    pub fn clear(&mut self) {
        let len = self.len;
        self.len = 0;
        // SAFETY: the first `len` elements were initialized and are no
        // longer reachable through the list.
        unsafe { ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.data.as_ptr(), len)) };
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the buffer can hold without growing.
    #[must_use]
    pub fn capacity(&self) -> usize {
        if Self::IS_ZST { usize::MAX } else { self.cap }
    }

    /// The allocator this list is bound to.
    #[must_use]
    pub fn allocator(&self) -> Allocator<'a> {
        self.allocator
    }

    /// The elements as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: `data` is valid for `len` initialized elements (or dangling
        // and aligned with `len == 0` or a zero-sized `T`).
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// The elements as a mutable slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as in `as_slice`, with unique access through `&mut self`.
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    /// Makes room for `additional` more elements.
    ///
    /// The buffer grows to `max(len * 2, len + additional)`.
    pub fn ensure_space(&mut self, additional: usize) {
        let Some(needed) = self.len.checked_add(additional) else {
            fatal("List capacity overflow.");
        };
        if needed <= self.capacity() {
            return;
        }
        self.set_capacity(needed.max(self.len * 2));
    }

    /// Shrinks the buffer to exactly `len` elements.
    pub fn shrink(&mut self) {
        self.set_capacity(self.len);
    }

    /// Appends `value`, returning a reference to it in place.
    pub fn append(&mut self, value: T) -> &mut T {
        self.ensure_space(1);
        // SAFETY: capacity > len after `ensure_space`.
        unsafe {
            let slot = self.data.as_ptr().add(self.len);
            slot.write(value);
            self.len += 1;
            &mut *slot
        }
    }

    /// Appends `T::default()`.
    pub fn append_default(&mut self) -> &mut T
    where
        T: Default,
    {
        self.append(T::default())
    }

    /// Appends clones of `values`, returning the new elements.
    pub fn append_slice(&mut self, values: &[T]) -> &mut [T]
    where
        T: Clone,
    {
        let start = self.len;
        self.ensure_space(values.len());
        for value in values {
            // SAFETY: room for `values.len()` elements was reserved; `len`
            // grows with each write so a panicking clone leaks nothing
            // half-initialized.
            unsafe { self.data.as_ptr().add(self.len).write(value.clone()) };
            self.len += 1;
        }
        &mut self.as_mut_slice()[start..]
    }

    /// Inserts `value` at `index`, shifting later elements up.
    ///
    /// `index` may equal `len` (append) or be negative.
    pub fn insert(&mut self, index: isize, value: T) {
        let index = self.checked_index(index, self.len as isize, "List insertion out of bounds");
        self.ensure_space(1);
        // SAFETY: index <= len < capacity; the tail moves one slot up
        // inside the buffer and the vacated slot is overwritten.
        unsafe {
            let slot = self.data.as_ptr().add(index);
            ptr::copy(slot, slot.add(1), self.len - index);
            slot.write(value);
        }
        self.len += 1;
    }

    /// Inserts clones of `values` at `index`.
    pub fn insert_slice(&mut self, index: isize, values: &[T])
    where
        T: Clone,
    {
        let index = self.checked_index(index, self.len as isize, "List insertion out of bounds");
        let count = values.len();
        self.ensure_space(count);
        let len = self.len;
        // The tail is hidden while the gap is filled, so a panicking
        // clone leaks it instead of exposing the gap.
        self.len = index;
        // SAFETY: len + count <= capacity.
        unsafe {
            let gap = self.data.as_ptr().add(index);
            ptr::copy(gap, gap.add(count), len - index);
            for (offset, value) in values.iter().enumerate() {
                gap.add(offset).write(value.clone());
            }
        }
        self.len = len + count;
    }

    /// Removes and returns the last element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: the element at the old `len - 1` is initialized and now
        // outside the list.
        Some(unsafe { self.data.as_ptr().add(self.len).read() })
    }

    /// Removes the element at `index` by moving the last element into its
    /// place. Order is not preserved. Returns `None` on an empty list.
    pub fn remove(&mut self, index: isize) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let index = self.checked_index(index, self.len as isize - 1, "List removal out of bounds");
        let last = self.len - 1;
        self.as_mut_slice().swap(index, last);
        self.pop()
    }

    /// Removes the element at `index`, shifting later elements down.
    /// Returns `None` on an empty list.
    pub fn stable_remove(&mut self, index: isize) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let index = self.checked_index(index, self.len as isize - 1, "List removal out of bounds");
        // SAFETY: index < len; the element is read out before the tail
        // is moved over its slot.
        unsafe {
            let slot = self.data.as_ptr().add(index);
            let value = slot.read();
            ptr::copy(slot.add(1), slot, self.len - index - 1);
            self.len -= 1;
            Some(value)
        }
    }

    /// Drops `count` elements starting at `index`, shifting later elements down.
    pub fn stable_remove_range(&mut self, index: isize, count: usize) {
        let index = self.checked_index(index, self.len as isize, "List removal out of bounds");
        let end = index.saturating_add(count);
        bounds_check(
            0,
            self.len as isize,
            isize::try_from(end).unwrap_or(isize::MAX),
            "List removal out of bounds",
        );
        let len = self.len;
        self.len = index;
        // SAFETY: index + count <= len. The removed range is dropped, then
        // the tail moves down over it.
        unsafe {
            let start = self.data.as_ptr().add(index);
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(start, count));
            ptr::copy(start.add(count), start, len - end);
        }
        self.len = len - count;
    }

    /// Moves the element at `index` to the front, shifting the ones before it up.
    pub fn move_to_front(&mut self, index: isize) {
        let index = self.checked_index(index, self.len as isize - 1, "List indexing out of bounds");
        self.as_mut_slice()[..=index].rotate_right(1);
    }

    /// Replaces the contents with clones of `values`.
    pub fn copy_from(&mut self, values: &[T])
    where
        T: Clone,
    {
        self.clear();
        self.append_slice(values);
    }

    /// Deep-copies the list into `allocator`.
    #[must_use]
    pub fn clone_in<'b>(&self, allocator: Allocator<'b>) -> List<'b, T>
    where
        T: Clone,
    {
        List::from_slice_in(self.as_slice(), allocator)
    }

    /// Resolves a possibly negative index and checks `0 <= index <= high`.
    #[track_caller]
    fn checked_index(&self, index: isize, high: isize, msg: &str) -> usize {
        let index = if index < 0 {
            index.wrapping_add(self.len as isize)
        } else {
            index
        };
        bounds_check(0, high, index, msg);
        index as usize
    }

    /// Reallocates the buffer to hold exactly `capacity` elements.
    fn set_capacity(&mut self, capacity: usize) {
        if Self::IS_ZST || capacity == self.cap {
            return;
        }
        debug_assert!(capacity >= self.len);
        // SAFETY: `data` holds `cap` elements from `self.allocator` (or is
        // dangling with `cap == 0`, which the array helpers never free).
        self.data = unsafe { self.allocator.reallocate_array(self.data, self.cap, capacity) };
        self.cap = capacity;
    }
}

impl<T> Drop for List<'_, T> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<T> Deref for List<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for List<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T> AsRef<[T]> for List<'_, T> {
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> Index<isize> for List<'_, T> {
    type Output = T;

    #[track_caller]
    fn index(&self, index: isize) -> &T {
        let index = self.checked_index(index, self.len as isize - 1, "List indexing out of bounds");
        &self.as_slice()[index]
    }
}

impl<T> IndexMut<isize> for List<'_, T> {
    #[track_caller]
    fn index_mut(&mut self, index: isize) -> &mut T {
        let index = self.checked_index(index, self.len as isize - 1, "List indexing out of bounds");
        &mut self.as_mut_slice()[index]
    }
}

impl<T: Clone> Clone for List<'_, T> {
    fn clone(&self) -> Self {
        self.clone_in(self.allocator)
    }
}

impl<T: fmt::Debug> fmt::Debug for List<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: PartialEq> PartialEq<List<'_, T>> for List<'_, T> {
    fn eq(&self, other: &List<'_, T>) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Eq> Eq for List<'_, T> {}

impl<T: PartialEq> PartialEq<[T]> for List<'_, T> {
    fn eq(&self, other: &[T]) -> bool {
        self.as_slice() == other
    }
}

impl<T> Extend<T> for List<'_, T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        self.ensure_space(iter.size_hint().0);
        for value in iter {
            self.append(value);
        }
    }
}

impl<T> FromIterator<T> for List<'static, T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut list = List::new();
        list.extend(iter);
        list
    }
}

impl<'l, T> IntoIterator for &'l List<'_, T> {
    type Item = &'l T;
    type IntoIter = slice::Iter<'l, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'l, T> IntoIterator for &'l mut List<'_, T> {
    type Item = &'l mut T;
    type IntoIter = slice::IterMut<'l, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Heap;
    use crate::arena::Arena;
    use std::rc::Rc;

    #[test]
    fn test_append_and_index() {
        let mut list = List::new();
        for i in 0..10 {
            list.append(i);
        }
        assert_eq!(list.len(), 10);
        assert_eq!(list[0], 0);
        assert_eq!(list[9], 9);
        assert_eq!(list[-1], 9);
        assert_eq!(list[-10], 0);
    }

    #[test]
    fn test_growth_doubles() {
        let mut list = List::new();
        list.append(1u32);
        assert_eq!(list.capacity(), 1);
        list.append(2);
        assert_eq!(list.capacity(), 2);
        list.append(3);
        assert_eq!(list.capacity(), 4);
        list.append_slice(&[0; 10]);
        assert_eq!(list.capacity(), 13);
        assert!(list.len() <= list.capacity());
    }

    #[test]
    fn test_append_returns_slot() {
        let mut list = List::new();
        *list.append(1) += 10;
        *list.append_default() = 5;
        assert_eq!(list.as_slice(), &[11, 5]);
    }

    #[test]
    fn test_insert() {
        let mut list = List::from_slice_in(&[1, 2, 4], Allocator::UNSET);
        list.insert(2, 3);
        list.insert(0, 0);
        list.insert(5, 5);
        list.insert(-1, 42);
        assert_eq!(list.as_slice(), &[0, 1, 2, 3, 4, 42, 5]);
    }

    #[test]
    fn test_insert_slice() {
        let mut list = List::from_slice_in(&[1, 5], Allocator::UNSET);
        list.insert_slice(1, &[2, 3, 4]);
        assert_eq!(list.as_slice(), &[1, 2, 3, 4, 5]);
        list.insert_slice(5, &[6]);
        list.insert_slice(0, &[]);
        assert_eq!(list.as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_unstable_remove() {
        let mut list = List::from_slice_in(&[10, 20, 30, 40], Allocator::UNSET);
        assert_eq!(list.remove(0), Some(10));
        assert_eq!(list.as_slice(), &[40, 20, 30]);
        assert_eq!(list.remove(-1), Some(30));
        assert_eq!(list.as_slice(), &[40, 20]);
    }

    #[test]
    fn test_remove_from_empty() {
        let mut list: List<'_, u8> = List::new();
        assert_eq!(list.remove(0), None);
        assert_eq!(list.stable_remove(0), None);
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn test_stable_remove() {
        let mut list = List::from_slice_in(&[10, 20, 30, 40], Allocator::UNSET);
        assert_eq!(list.stable_remove(1), Some(20));
        assert_eq!(list.as_slice(), &[10, 30, 40]);
        assert_eq!(list.stable_remove(-1), Some(40));
        assert_eq!(list.as_slice(), &[10, 30]);
    }

    #[test]
    fn test_stable_remove_range() {
        let mut list: List<'_, u32> = (0..10).collect();
        list.stable_remove_range(2, 3);
        assert_eq!(list.as_slice(), &[0, 1, 5, 6, 7, 8, 9]);
        list.stable_remove_range(-2, 2);
        assert_eq!(list.as_slice(), &[0, 1, 5, 6, 7]);
        list.stable_remove_range(5, 0);
        assert_eq!(list.len(), 5);
    }

    #[test]
    #[should_panic(expected = "List removal out of bounds")]
    fn test_stable_remove_range_past_end() {
        let mut list: List<'_, u32> = (0..4).collect();
        list.stable_remove_range(2, 3);
    }

    #[test]
    fn test_move_to_front() {
        let mut list = List::from_slice_in(&['a', 'b', 'c', 'd'], Allocator::UNSET);
        list.move_to_front(2);
        assert_eq!(list.as_slice(), &['c', 'a', 'b', 'd']);
        list.move_to_front(-1);
        assert_eq!(list.as_slice(), &['d', 'c', 'a', 'b']);
    }

    #[test]
    #[should_panic(expected = "List indexing out of bounds")]
    fn test_index_out_of_bounds() {
        let list = List::from_slice_in(&[1, 2, 3], Allocator::UNSET);
        let _ = list[3];
    }

    #[test]
    #[should_panic(expected = "List indexing out of bounds")]
    fn test_negative_index_out_of_bounds() {
        let list = List::from_slice_in(&[1, 2, 3], Allocator::UNSET);
        let _ = list[-4];
    }

    #[test]
    #[should_panic(expected = "List insertion out of bounds")]
    fn test_insert_out_of_bounds() {
        let mut list = List::from_slice_in(&[1, 2, 3], Allocator::UNSET);
        list.insert(4, 0);
    }

    #[test]
    fn test_shrink_and_ensure_space() {
        let mut list = List::with_capacity_in(64, Allocator::UNSET);
        list.append_slice(&[1u8, 2, 3]);
        list.shrink();
        assert_eq!(list.capacity(), 3);
        list.ensure_space(10);
        assert!(list.capacity() >= 13);
        assert_eq!(list.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_prealloc() {
        let list: List<'_, u16> = List::prealloc(5, Allocator::UNSET);
        assert_eq!(list.as_slice(), &[0; 5]);
        assert_eq!(list.capacity(), 5);
    }

    #[test]
    fn test_copy_from_and_clone_in() {
        let heap = Heap::new();
        let mut list = List::new_in(Allocator::new(&heap));
        list.append_slice(&[9, 9]);
        list.copy_from(&[1, 2, 3]);
        assert_eq!(list.as_slice(), &[1, 2, 3]);

        let arena = Arena::with_capacity(256);
        let copy = list.clone_in(arena.as_allocator());
        assert_eq!(copy, list);
        assert!(copy.allocator().same_as(arena.as_allocator()));
    }

    #[test]
    fn test_init_with_other_allocator_frees_old_buffer() {
        let first = Heap::new();
        let second = Heap::new();
        let mut list = List::with_capacity_in(16, Allocator::new(&first));
        list.append(1u64);
        assert_eq!(first.stats().live_allocations, 1);

        list.init(8, Allocator::new(&second));
        assert!(list.is_empty());
        assert_eq!(list.capacity(), 8);
        assert_eq!(first.stats().live_allocations, 0);
        assert_eq!(second.stats().live_allocations, 1);
    }

    #[test]
    fn test_destroy_drops_elements() {
        let tracker = Rc::new(());
        let mut list = List::new();
        for _ in 0..5 {
            list.append(Rc::clone(&tracker));
        }
        assert_eq!(Rc::strong_count(&tracker), 6);

        list.stable_remove_range(0, 2);
        assert_eq!(Rc::strong_count(&tracker), 4);

        list.destroy();
        assert_eq!(Rc::strong_count(&tracker), 1);
        assert_eq!(list.capacity(), 0);
        list.destroy();
    }

    #[test]
    fn test_heap_is_released_on_drop() {
        let heap = Heap::new();
        {
            let mut list = List::new_in(Allocator::new(&heap));
            list.extend(0..100u32);
            assert!(heap.stats().live_bytes >= 400);
        }
        assert_eq!(heap.stats().live_bytes, 0);
    }

    #[test]
    fn test_grows_in_place_inside_arena() {
        let arena = Arena::with_capacity(1024);
        let mut list = List::new_in(arena.as_allocator());
        list.append(0u8);
        let start = list.as_ptr();
        for i in 1..100u8 {
            list.append(i);
        }
        assert_eq!(list.as_ptr(), start);
        assert_eq!(arena.used(), list.capacity());
    }

    #[test]
    fn test_zero_sized_elements() {
        let mut list = List::new();
        for _ in 0..1000 {
            list.append(());
        }
        assert_eq!(list.len(), 1000);
        assert_eq!(list.capacity(), usize::MAX);
        assert_eq!(list.pop(), Some(()));
    }

    #[test]
    fn test_iteration_and_debug() {
        let mut list: List<'_, i32> = [3, 1, 2].into_iter().collect();
        for value in &mut list {
            *value *= 2;
        }
        let collected: Vec<i32> = (&list).into_iter().copied().collect();
        assert_eq!(collected, vec![6, 2, 4]);
        list.sort_unstable();
        assert_eq!(format!("{list:?}"), "[2, 4, 6]");
    }
}
