//! Error types for `bedrock-mem`.
//!
//! Most allocator failures are fatal (see [`crate::fatal`]). The variants
//! here cover the paths that hand the decision back to the caller: the
//! `try_` allocation methods and process start-up configuration.

use std::fmt;

/// Recoverable memory errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemError {
    /// The backing allocator returned no memory.
    OutOfMemory {
        /// The requested allocation size.
        requested: usize,
    },

    /// An arena cannot fit the requested allocation.
    ArenaFull {
        /// The requested allocation size.
        requested: usize,
        /// Bytes left in the arena after alignment padding.
        available: usize,
    },

    /// A pool allocation does not fit in a single block.
    BlockTooSmall {
        /// The requested allocation size plus alignment padding.
        requested: usize,
        /// The pool's block size.
        block_size: usize,
    },

    /// Alignment is zero or not a power of two.
    InvalidAlignment {
        /// The requested alignment.
        alignment: usize,
    },

    /// The process default allocator was already set or already used.
    DefaultAllocatorLocked,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {requested} bytes")
            }
            MemError::ArenaFull {
                requested,
                available,
            } => {
                write!(
                    f,
                    "Arena full: requested {requested} bytes, available {available} bytes"
                )
            }
            MemError::BlockTooSmall {
                requested,
                block_size,
            } => {
                write!(
                    f,
                    "Pool allocation of {requested} bytes exceeds block size {block_size}"
                )
            }
            MemError::InvalidAlignment { alignment } => {
                write!(
                    f,
                    "Invalid alignment: {alignment} is not a power of two"
                )
            }
            MemError::DefaultAllocatorLocked => {
                write!(f, "Default allocator is already in use")
            }
        }
    }
}

impl std::error::Error for MemError {}

/// Result type for fallible memory operations.
pub type Result<T> = std::result::Result<T, MemError>;
