//! Fixed-capacity byte buffer.
//!
//! A [`MemoryBuffer`] is a staging area for bytes on their way in or out:
//! producers write into [`MemoryBuffer::unfilled_mut`] and
//! [`MemoryBuffer::commit`] what they wrote, consumers read
//! [`MemoryBuffer::filled`] and [`MemoryBuffer::consume`] what they used.
//! The buffer never grows; writes past the capacity are short.
//!
//! ```
//! use std::io::{Read, Write};
//! use bedrock_mem::buffer::MemoryBuffer;
//!
//! let mut buffer = MemoryBuffer::with_capacity(8);
//! assert_eq!(buffer.write(b"hello world").unwrap(), 8);
//!
//! let mut out = [0u8; 5];
//! buffer.read_exact(&mut out).unwrap();
//! assert_eq!(&out, b"hello");
//! assert_eq!(buffer.filled(), b" wo");
//! ```

use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::slice;

use crate::allocator::Allocator;
use crate::fatal::fatal;

/// A byte buffer of fixed capacity.
pub struct MemoryBuffer<'a> {
    allocator: Allocator<'a>,
    data: Option<NonNull<u8>>,
    len: usize,
    cap: usize,
}

impl MemoryBuffer<'static> {
    /// Creates a buffer with no storage.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocator: Allocator::UNSET,
            data: None,
            len: 0,
            cap: 0,
        }
    }

    /// Creates a buffer of `capacity` bytes from the default allocator.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new_in(capacity, Allocator::UNSET)
    }
}

impl Default for MemoryBuffer<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> MemoryBuffer<'a> {
    /// Creates a buffer of `capacity` bytes taken from `allocator`.
    #[must_use]
    pub fn new_in(capacity: usize, allocator: Allocator<'a>) -> Self {
        let mut buffer = Self {
            allocator,
            data: None,
            len: 0,
            cap: 0,
        };
        buffer.init(capacity, allocator);
        buffer
    }

    /// Replaces the storage with an empty buffer of `capacity` bytes.
    pub fn init(&mut self, capacity: usize, allocator: Allocator<'a>) {
        self.destroy();
        self.allocator = allocator;
        self.data = allocator.allocate(capacity);
        self.cap = capacity;
    }

    /// Frees the storage. Calling it twice is harmless.
    pub fn destroy(&mut self) {
        if let Some(data) = self.data.take() {
            // SAFETY: `data` holds `cap` bytes from `self.allocator`.
            unsafe { self.allocator.deallocate(Some(data), self.cap) };
        }
        self.len = 0;
        self.cap = 0;
    }

    /// Bytes written and not yet consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no bytes are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Bytes that can still be written.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.cap - self.len
    }

    /// Returns true if no more bytes fit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.cap
    }

    /// The written bytes.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.storage()[..self.len]
    }

    /// The written bytes, mutably.
    #[must_use]
    pub fn filled_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.storage_mut()[..len]
    }

    /// The free tail, to be written into and then [`commit`](Self::commit)ted.
    #[must_use]
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.storage_mut()[len..]
    }

    /// Marks `count` bytes of the free tail as written.
    pub fn commit(&mut self, count: usize) {
        if count > self.remaining() {
            fatal("Memory buffer commit past capacity.");
        }
        self.len += count;
    }

    /// Drops `count` bytes from the front, moving the rest down.
    pub fn consume(&mut self, count: usize) {
        if count > self.len {
            fatal("Memory buffer consume past end.");
        }
        let len = self.len;
        self.storage_mut().copy_within(count..len, 0);
        self.len -= count;
    }

    /// Forgets every pending byte.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Copies as much of `bytes` as fits and returns the count.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.remaining());
        self.unfilled_mut()[..count].copy_from_slice(&bytes[..count]);
        self.len += count;
        count
    }

    fn storage(&self) -> &[u8] {
        match self.data {
            // SAFETY: `data` holds `cap` initialized (zeroed or written) bytes.
            Some(data) => unsafe { slice::from_raw_parts(data.as_ptr(), self.cap) },
            None => &[],
        }
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        match self.data {
            // SAFETY: as in `storage`, with unique access.
            Some(data) => unsafe { slice::from_raw_parts_mut(data.as_ptr(), self.cap) },
            None => &mut [],
        }
    }
}

impl Drop for MemoryBuffer<'_> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl io::Write for MemoryBuffer<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.push(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for MemoryBuffer<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.len);
        buf[..count].copy_from_slice(&self.filled()[..count]);
        self.consume(count);
        Ok(count)
    }
}

impl fmt::Debug for MemoryBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("len", &self.len)
            .field("capacity", &self.cap)
            .finish()
    }
}
