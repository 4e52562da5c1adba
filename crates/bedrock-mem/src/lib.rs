//! `bedrock-mem`: memory ownership and containers for the bedrock substrate
//!
//! Every container in this crate gets its memory through one allocator
//! protocol, so any of them can live on the heap, inside an arena, or in a
//! pool, chosen at construction time:
//!
//! - **Allocator protocol** ([`allocator`]): the single-function
//!   [`RawAllocator`] contract and the copyable [`Allocator`] handle
//! - **Arena** ([`arena`]): fixed-buffer bump allocation with mark/rewind
//! - **Pool** ([`pool`]): chained blocks with stable addresses
//! - **List** ([`list`]): growable array with negative indexing
//! - **Hash table** ([`table`]): open addressing with double hashing
//! - **Memory buffer** ([`buffer`]): fixed-capacity byte staging area
//! - **String builder** ([`builder`]): block-chained byte accumulator
//! - **Global state** ([`global`]): default allocator and per-thread
//!   temporary storage
//!
//! # Failure model
//!
//! Conditions that leave no sane state (a full arena, an oversized pool
//! request, an out-of-bounds index, a stale table slot) are fatal: they
//! are logged and the process stops (see [`fatal`]). The `try_` methods and
//! start-up configuration report [`MemError`] instead.
//!
//! # Example
//!
//! ```rust
//! use bedrock_mem::{Arena, HashTable, List};
//!
//! let arena = Arena::with_capacity(16 * 1024);
//!
//! let mut words = List::new_in(arena.as_allocator());
//! words.append_slice(&["to", "be", "or", "not", "to", "be"]);
//!
//! let mut counts: HashTable<'_, &str, u32> = HashTable::new_in(arena.as_allocator());
//! for word in words.iter() {
//!     *counts.upsert(*word) += 1;
//! }
//! assert_eq!(counts.find("to"), Some(&2));
//! assert_eq!(counts.find("not"), Some(&1));
//! ```

pub mod allocator;
pub mod arena;
pub mod buffer;
pub mod builder;
pub mod error;
pub mod fatal;
pub mod global;
pub mod list;
pub mod pool;
pub mod table;

// Re-export commonly used types
pub use allocator::{ALLOC_ALIGN, Allocator, HEAP, Heap, RawAllocator};
pub use arena::{Arena, ArenaMark};
pub use buffer::MemoryBuffer;
pub use builder::StringBuilder;
pub use error::{MemError, Result};
pub use global::{
    MemConfig, TempScope, default_allocator, init, set_default_allocator, with_temp_storage,
};
pub use list::List;
pub use pool::Pool;
pub use table::{HashTable, Probe, SlotIndex};
