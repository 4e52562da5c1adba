//! Block-chained byte accumulator.
//!
//! [`StringBuilder`] appends into fixed [`BLOCK_SIZE`] blocks taken from
//! its allocator, so building a large string never copies what was
//! already written. [`StringBuilder::to_list_in`] produces one contiguous
//! copy at the end; [`StringBuilder::write_to`] streams the blocks.
//!
//! ```
//! use std::fmt::Write;
//! use bedrock_mem::builder::StringBuilder;
//!
//! let mut builder = StringBuilder::new();
//! builder.append_str("x = ");
//! write!(builder, "{}", 42).unwrap();
//! builder.append_byte(b'\n');
//!
//! assert_eq!(builder.len(), 7);
//! assert_eq!(builder.contiguous(), Some(&b"x = 42\n"[..]));
//! ```

use std::fmt;
use std::io;
use std::ptr::NonNull;

use bedrock_log::trace;

use crate::allocator::Allocator;
use crate::list::List;

/// Payload bytes per block.
pub const BLOCK_SIZE: usize = 4 * 1024;

struct Block {
    next: Option<NonNull<Block>>,
    used: usize,
    bytes: [u8; BLOCK_SIZE],
}

/// An append-only byte sink made of chained blocks.
pub struct StringBuilder<'a> {
    allocator: Allocator<'a>,
    first: Option<NonNull<Block>>,
    current: Option<NonNull<Block>>,
    len: usize,
    block_count: usize,
}

impl StringBuilder<'static> {
    /// Creates an empty builder on the default allocator. Allocates nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocator: Allocator::UNSET,
            first: None,
            current: None,
            len: 0,
            block_count: 0,
        }
    }
}

impl Default for StringBuilder<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> StringBuilder<'a> {
    /// Creates an empty builder whose blocks come from `allocator`.
    #[must_use]
    pub fn new_in(allocator: Allocator<'a>) -> Self {
        Self {
            allocator,
            first: None,
            current: None,
            len: 0,
            block_count: 0,
        }
    }

    /// Total bytes appended.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of blocks allocated.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Appends one byte.
    pub fn append_byte(&mut self, byte: u8) {
        self.append_raw(&[byte]);
    }

    /// Appends the bytes of `s`.
    pub fn append_str(&mut self, s: &str) {
        self.append_raw(s.as_bytes());
    }

    /// Appends `bytes`, spilling into further blocks as needed.
    pub fn append_raw(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let block = self.writable_block();
            let used = block.used;
            let count = bytes.len().min(BLOCK_SIZE - used);
            block.bytes[used..used + count].copy_from_slice(&bytes[..count]);
            block.used += count;
            self.len += count;
            bytes = &bytes[count..];
        }
    }

    /// Empties the builder, keeping its blocks for reuse.
    pub fn reset(&mut self) {
        let mut next = self.first;
        while let Some(mut block) = next {
            // SAFETY: blocks stay allocated until `destroy`; `&mut self`
            // gives exclusive access.
            let block = unsafe { block.as_mut() };
            block.used = 0;
            next = block.next;
        }
        self.current = self.first;
        self.len = 0;
    }

    /// Frees every block. Calling it twice is harmless.
    pub fn destroy(&mut self) {
        let mut next = self.first.take();
        while let Some(block) = next {
            // SAFETY: the block is alive until freed below.
            next = unsafe { block.as_ref() }.next;
            // SAFETY: allocated as a one-element array of blocks.
            unsafe { self.allocator.deallocate_array(block, 1) };
        }
        self.current = None;
        self.len = 0;
        self.block_count = 0;
    }

    /// Iterates over the written part of each block, in order.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            next: self.first,
            _builder: std::marker::PhantomData,
        }
    }

    /// Returns everything written if it all sits in the first block.
    #[must_use]
    pub fn contiguous(&self) -> Option<&[u8]> {
        let mut chunks = self.chunks();
        let first = chunks.next().unwrap_or(&[]);
        (first.len() == self.len).then_some(first)
    }

    /// Copies everything written into one list.
    #[must_use]
    pub fn to_list_in<'b>(&self, allocator: Allocator<'b>) -> List<'b, u8> {
        let mut list = List::with_capacity_in(self.len, allocator);
        for chunk in self.chunks() {
            list.append_slice(chunk);
        }
        list
    }

    /// Streams everything written into `writer`.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by `writer`.
    pub fn write_to<W: io::Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        for chunk in self.chunks() {
            writer.write_all(chunk)?;
        }
        Ok(())
    }

    /// The block with free space, chaining a new one when the current is full.
    fn writable_block(&mut self) -> &mut Block {
        let current = match self.current {
            // SAFETY: blocks stay allocated until `destroy`.
            Some(block) if unsafe { block.as_ref() }.used < BLOCK_SIZE => block,
            Some(mut full) => {
                // SAFETY: as above, with exclusive access through `&mut self`.
                let full = unsafe { full.as_mut() };
                let next = match full.next {
                    Some(mut reused) => {
                        // SAFETY: as above.
                        unsafe { reused.as_mut() }.used = 0;
                        reused
                    }
                    None => {
                        let fresh = self.allocate_block();
                        full.next = Some(fresh);
                        fresh
                    }
                };
                self.current = Some(next);
                next
            }
            None => {
                let fresh = self.allocate_block();
                self.first = Some(fresh);
                self.current = Some(fresh);
                fresh
            }
        };
        // SAFETY: exclusive access through `&mut self`.
        unsafe { &mut *current.as_ptr() }
    }

    fn allocate_block(&mut self) -> NonNull<Block> {
        self.block_count += 1;
        trace!("string builder allocating block {}", self.block_count);
        // Zeroed memory is a valid empty block: no next, nothing used.
        self.allocator.allocate_array::<Block>(1)
    }
}

impl Drop for StringBuilder<'_> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Write for StringBuilder<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append_str(s);
        Ok(())
    }
}

impl io::Write for StringBuilder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append_raw(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for StringBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringBuilder")
            .field("len", &self.len)
            .field("block_count", &self.block_count)
            .finish()
    }
}

/// Iterator over the filled parts of a [`StringBuilder`]'s blocks.
pub struct Chunks<'b> {
    next: Option<NonNull<Block>>,
    _builder: std::marker::PhantomData<&'b Block>,
}

impl<'b> Iterator for Chunks<'b> {
    type Item = &'b [u8];

    fn next(&mut self) -> Option<&'b [u8]> {
        loop {
            // SAFETY: the builder is borrowed for 'b, so its blocks are
            // alive and not written to.
            let block = unsafe { self.next?.as_ref() };
            self.next = block.next;
            if block.used > 0 {
                return Some(&block.bytes[..block.used]);
            }
        }
    }
}
