//! This crate implements a dynamic memory allocator for fixed heaps based
//! on the TLSF (Two-Level Segregated Fit) algorithm¹.
//!
//!  - **Allocation and deallocation complete in constant time**, independent
//!    of the number of free blocks or the heap size, which makes the
//!    allocator suitable for real-time use.
//!
//!  - **The memory pools are provided by the application**: a static
//!    buffer, an arena carved from another allocator, or (with the `std`
//!    feature) an anonymous mapping owned by [`Heap`].
//!
//!  - **One word of overhead per allocation.** A used block's bookkeeping
//!    overlaps the tail of the block before it.
//!
//!  - **The core supports `#![no_std]`.** Only the OS-backed [`Heap`]
//!    facade needs `std`.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new
//! dynamic memory allocator for real-time systems," *Proceedings. 16th
//! Euromicro Conference on Real-Time Systems*, 2004.</sub>
//!
//! # Examples
//!
//! ## `Heap`: an OS-backed, thread-safe heap
//!
#![cfg_attr(all(feature = "std", unix), doc = "```rust")]
#![cfg_attr(not(all(feature = "std", unix)), doc = "```rust,ignore")]
//! use tlsf_heap::Heap;
//!
//! let heap = Heap::new(64 * 1024).unwrap();
//!
//! let p = heap.malloc(40).unwrap().unwrap();
//! unsafe {
//!     core::ptr::write_bytes(p.as_ptr(), 0xab, 40);
//!     heap.free(p.as_ptr()).unwrap();
//! }
//! assert_eq!(heap.check().unwrap(), 0);
//! ```
//!
//! ## `Tlsf`: the core on a caller-provided region
//!
//! ```rust
//! use core::{mem::MaybeUninit, ptr::NonNull};
//! use tlsf_heap::Tlsf;
//!
//! #[repr(align(16))]
//! struct Arena([MaybeUninit<u8>; 65536]);
//! let mut arena = Arena([MaybeUninit::uninit(); 65536]);
//!
//! let base = NonNull::new(arena.0.as_mut_ptr().cast::<u8>()).unwrap();
//! // Safety: the arena outlives the controller and is used through it only
//! let (mut ctl, _pool) = unsafe { Tlsf::construct_with_pool(base, 65536) }.unwrap();
//! let tlsf = unsafe { ctl.as_mut() };
//!
//! let p1 = tlsf.allocate(8).unwrap();
//! let p2 = tlsf.allocate(8).unwrap();
//! assert_ne!(p1, p2);
//! unsafe {
//!     tlsf.deallocate(p1).unwrap();
//!     tlsf.deallocate(p2).unwrap();
//! }
//! ```
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod block;
mod error;
mod tlsf;
mod utils;

pub use self::{
    block::{ALIGN_SIZE, BLOCK_SIZE_MIN},
    error::AllocError,
    tlsf::{block_size, check_pool, walk_pool, Pool, Tlsf, BLOCK_SIZE_MAX},
};

cfg_if::cfg_if! {
    if #[cfg(all(feature = "std", unix))] {
        mod heap;
        pub use self::heap::{Heap, MemorySource, MmapSource};
    }
}

#[cfg(any(test, feature = "std"))]
extern crate std;
