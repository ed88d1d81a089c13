//! Allocator error kinds.
//!
//! Every fallible public operation reports its failure through
//! [`AllocError`]. Recoverable no-fit conditions on the unlocked core
//! return `None` instead; the facade translates them to
//! [`AllocError::HeapExhausted`] so callers get a single result channel.

use thiserror::Error;

/// The reason an allocator operation failed.
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Mapping anonymous memory for the heap failed.
    #[error("mapping {size} bytes for the heap failed (errno {errno})")]
    MmapFailed {
        /// Requested mapping size in bytes.
        size: usize,
        /// `errno` reported by the OS.
        errno: i32,
    },

    /// Unmapping the heap region failed.
    #[error("unmapping the heap region failed (errno {errno})")]
    MunmapFailed {
        /// `errno` reported by the OS.
        errno: i32,
    },

    /// A pool region does not start on an `ALIGN_SIZE` boundary.
    #[error("pool region at {addr:#x} is not aligned to {align} bytes")]
    PoolMisaligned {
        /// Base address of the rejected region.
        addr: usize,
        /// Required alignment in bytes.
        align: usize,
    },

    /// A pool region is too small or too large to manage.
    #[error("pool of {bytes} bytes is outside the supported range {min}..={max}")]
    PoolSizeOutOfRange {
        /// Usable bytes after the pool overhead was subtracted.
        bytes: usize,
        /// Smallest manageable pool size.
        min: usize,
        /// Largest manageable pool size.
        max: usize,
    },

    /// The block behind a freed pointer is already on a free list.
    #[error("block is already marked free (double free)")]
    BlockAlreadyFreed,

    /// A payload pointer handed back to the allocator is not one it issued.
    #[error("payload pointer {addr:#x} is not aligned to {align} bytes")]
    BlockNotAligned {
        /// The offending pointer value.
        addr: usize,
        /// Required payload alignment in bytes.
        align: usize,
    },

    /// The alignment argument of an aligned allocation is not a power of two.
    #[error("alignment {align} is not a power of two")]
    AlignNotPowerOfTwo {
        /// The rejected alignment.
        align: usize,
    },

    /// No free block can satisfy the request.
    #[error("no free block can satisfy a request of {requested} bytes")]
    HeapExhausted {
        /// The requested payload size in bytes.
        requested: usize,
    },

    /// Initialising the heap mutex failed.
    #[error("initialising the heap mutex failed (errno {errno})")]
    MutexInit {
        /// `errno` reported by the OS.
        errno: i32,
    },

    /// Acquiring the heap mutex failed; the heap state is untouched.
    #[error("locking the heap mutex failed (errno {errno})")]
    MutexLock {
        /// `errno` reported by the OS.
        errno: i32,
    },

    /// Releasing the heap mutex failed.
    #[error("unlocking the heap mutex failed (errno {errno})")]
    MutexUnlock {
        /// `errno` reported by the OS.
        errno: i32,
    },
}
