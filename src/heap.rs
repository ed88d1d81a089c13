//! The OS-backed heap: a [`Tlsf`] controller living inside an anonymous
//! mapping, wrapped in a recursive mutex.
//!
//! This is the surface most callers want. The controller in [`crate::tlsf`]
//! is single-writer and works on caller-provided regions; [`Heap`] owns the
//! backing region, serialises all operations, and reports failures as
//! [`AllocError`] values instead of bare `None`s.

use core::{
    alloc::{GlobalAlloc, Layout},
    ops,
    ptr::{self, NonNull},
};

use crate::{
    block::ALIGN_SIZE,
    error::AllocError,
    tlsf::{self, Pool, Tlsf},
};

mod unix;
use self::unix as os;

pub use self::unix::MmapSource;

/// A provider of raw backing memory for a [`Heap`].
///
/// # Safety
///
/// An implementation must hand out regions that are valid for reads and
/// writes for the returned length, aligned to at least
/// [`MemorySource::min_align`] bytes, and exclusively owned by the caller
/// until released.
pub unsafe trait MemorySource {
    /// Obtain a region of at least `min_bytes` bytes. The returned slice
    /// pointer carries the actual length, which may be larger.
    ///
    /// # Safety
    ///
    /// `min_bytes` must be non-zero.
    unsafe fn acquire(&mut self, min_bytes: usize) -> Result<NonNull<[u8]>, AllocError>;

    /// Release a previously acquired region.
    ///
    /// # Safety
    ///
    /// `region` must be exactly a value returned by
    /// [`MemorySource::acquire`] on this source, with no outstanding
    /// references into it.
    unsafe fn release(&mut self, region: NonNull<[u8]>) -> Result<(), AllocError>;

    /// The alignment every acquired region is guaranteed to have.
    fn min_align(&self) -> usize;
}

/// A TLSF-managed heap on an OS-provided memory region.
///
/// All public operations lock an internal recursive mutex, so a `Heap` can
/// be shared between threads. Dropping the heap releases the whole region;
/// by then every pointer into it is dead.
pub struct Heap<S: MemorySource = MmapSource> {
    mutex: os::Mutex,
    tlsf: NonNull<Tlsf>,
    pool: Pool,
    region: NonNull<[u8]>,
    source: S,
}

// Safety: the controller and every block it references live in the region
//         exclusively owned by this value, and all access is serialised by
//         `mutex`.
unsafe impl<S: MemorySource + Send> Send for Heap<S> {}
unsafe impl<S: MemorySource + Send> Sync for Heap<S> {}

impl Heap<MmapSource> {
    /// Create a heap backed by an anonymous private mapping of at least
    /// `heap_size` bytes (rounded up to whole pages).
    ///
    /// The controller is constructed at the start of the mapping and the
    /// remainder becomes the initial pool.
    pub fn new(heap_size: usize) -> Result<Self, AllocError> {
        Self::with_source(MmapSource::new(), heap_size)
    }
}

impl<S: MemorySource> Heap<S> {
    /// Create a heap on a region acquired from `source`.
    pub fn with_source(mut source: S, heap_size: usize) -> Result<Self, AllocError> {
        let mutex = os::Mutex::new()?;

        // Safety: a zero-sized heap is rejected below by the pool size
        //         check, so over-asking by a page here is harmless
        let region = unsafe { source.acquire(heap_size.max(1))? };
        let base = region.cast::<u8>();
        let len = region.len();

        // Safety: the region was just acquired, is exclusively ours, and
        //         outlives the controller because we release it only on drop
        match unsafe { Tlsf::construct_with_pool(base, len) } {
            Ok((tlsf, pool)) => Ok(Self {
                mutex,
                tlsf,
                pool,
                region,
                source,
            }),
            Err(err) => {
                // Safety: nothing points into the region yet
                if let Err(release_err) = unsafe { source.release(region) } {
                    log::error!("releasing a rejected heap region failed: {}", release_err);
                }
                Err(err)
            }
        }
    }

    /// Acquire the mutex and hand out the controller behind it.
    fn lock(&self) -> Result<HeapGuard<'_, S>, AllocError> {
        self.mutex.lock()?;
        Ok(HeapGuard(self))
    }

    /// Allocate `size` bytes.
    ///
    /// `Ok(None)` for a zero-size request; `HeapExhausted` when no free
    /// block fits.
    pub fn malloc(&self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let mut tlsf = self.lock()?;
        match tlsf.allocate(size) {
            Some(p) => Ok(Some(p)),
            None if size == 0 => Ok(None),
            None => Err(AllocError::HeapExhausted { requested: size }),
        }
    }

    /// Allocate a zero-initialised array of `count` elements of `size`
    /// bytes each.
    pub fn calloc(&self, count: usize, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        let bytes = count
            .checked_mul(size)
            .ok_or(AllocError::HeapExhausted {
                requested: usize::MAX,
            })?;
        match self.malloc(bytes)? {
            Some(p) => {
                // Safety: the block holds at least `bytes` payload bytes
                unsafe { ptr::write_bytes(p.as_ptr(), 0, bytes) };
                Ok(Some(p))
            }
            None => Ok(None),
        }
    }

    /// Allocate `size` bytes whose address is a multiple of `align`.
    ///
    /// `align` must be a power of two.
    pub fn memalign(&self, align: usize, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::AlignNotPowerOfTwo { align });
        }
        let mut tlsf = self.lock()?;
        match tlsf.allocate_aligned(align, size) {
            Some(p) => Ok(Some(p)),
            None if size == 0 => Ok(None),
            None => Err(AllocError::HeapExhausted { requested: size }),
        }
    }

    /// Free an allocation. A null pointer is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr`, when non-null, must be a payload pointer obtained from this
    /// heap and not freed since.
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), AllocError> {
        let ptr = match NonNull::new(ptr) {
            Some(p) => p,
            None => return Ok(()),
        };
        let addr = ptr.as_ptr() as usize;
        if addr % ALIGN_SIZE != 0 {
            return Err(AllocError::BlockNotAligned {
                addr,
                align: ALIGN_SIZE,
            });
        }
        let mut tlsf = self.lock()?;
        tlsf.deallocate(ptr)
    }

    /// Resize an allocation.
    ///
    /// A null `ptr` behaves like [`Heap::malloc`]; a zero `size` frees and
    /// returns `Ok(None)`. On `HeapExhausted` the original allocation is
    /// left untouched.
    ///
    /// # Safety
    ///
    /// `ptr`, when non-null, must be a live payload pointer obtained from
    /// this heap.
    pub unsafe fn realloc(
        &self,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        match (NonNull::new(ptr), size) {
            (Some(p), 0) => {
                self.free(p.as_ptr())?;
                Ok(None)
            }
            (None, _) => self.malloc(size),
            (Some(p), _) => {
                let mut tlsf = self.lock()?;
                match tlsf.reallocate(p, size) {
                    Some(np) => Ok(Some(np)),
                    None => Err(AllocError::HeapExhausted { requested: size }),
                }
            }
        }
    }

    /// The internal block size behind an allocation, bookkeeping included.
    /// Zero for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr`, when non-null, must be a live payload pointer obtained from
    /// this heap.
    pub unsafe fn block_size(&self, ptr: *mut u8) -> usize {
        match NonNull::new(ptr) {
            Some(p) => tlsf::block_size(p),
            None => 0,
        }
    }

    /// The pool created from the backing region at construction.
    pub fn pool(&self) -> Pool {
        self.pool
    }

    /// Register an additional caller-provided pool region.
    ///
    /// # Safety
    ///
    /// Same contract as [`Tlsf::add_pool`], and the region must outlive
    /// this heap.
    pub unsafe fn add_pool(&self, mem: NonNull<u8>, bytes: usize) -> Result<Pool, AllocError> {
        let mut tlsf = self.lock()?;
        tlsf.add_pool(mem, bytes)
    }

    /// Unregister a pool previously added with [`Heap::add_pool`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Tlsf::remove_pool`].
    pub unsafe fn remove_pool(&self, pool: Pool) -> Result<(), AllocError> {
        let mut tlsf = self.lock()?;
        tlsf.remove_pool(pool);
        Ok(())
    }

    /// Run the free-list/bitmap consistency check. Zero means consistent.
    pub fn check(&self) -> Result<i32, AllocError> {
        Ok(self.lock()?.check())
    }

    /// Run the physical-consistency check over the primary pool. Zero
    /// means consistent.
    pub fn check_pool(&self) -> Result<i32, AllocError> {
        let _guard = self.lock()?;
        // Safety: the guard serialises against mutation during the walk
        Ok(unsafe { tlsf::check_pool(self.pool) })
    }

    /// Walk the physical blocks of the primary pool.
    pub fn walk(&self, walker: impl FnMut(NonNull<u8>, usize, bool)) -> Result<(), AllocError> {
        let _guard = self.lock()?;
        // Safety: the guard serialises against mutation during the walk
        unsafe { tlsf::walk_pool(self.pool, walker) };
        Ok(())
    }

    /// Report every block of the primary pool through the logger.
    pub fn dump(&self) -> Result<(), AllocError> {
        self.walk(|payload, size, used| {
            log::debug!(
                "\t{:p} {} size: {:#x}",
                payload,
                if used { "used" } else { "free" },
                size
            );
        })
    }
}

impl<S: MemorySource> Drop for Heap<S> {
    fn drop(&mut self) {
        // `&mut self` proves no thread is inside the lock, so the region
        // can go before the mutex (which is destroyed by its own drop).
        if let Err(err) = unsafe { self.source.release(self.region) } {
            log::error!("releasing the heap region failed: {}", err);
        }
    }
}

struct HeapGuard<'a, S: MemorySource>(&'a Heap<S>);

impl<S: MemorySource> ops::Deref for HeapGuard<'_, S> {
    type Target = Tlsf;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: protected by the mutex
        unsafe { self.0.tlsf.as_ref() }
    }
}

impl<S: MemorySource> ops::DerefMut for HeapGuard<'_, S> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: protected by the mutex
        unsafe { &mut *self.0.tlsf.as_ptr() }
    }
}

impl<S: MemorySource> Drop for HeapGuard<'_, S> {
    #[inline]
    fn drop(&mut self) {
        if let Err(err) = self.0.mutex.unlock() {
            log::error!("{}", err);
        }
    }
}

// Safety: the layout-directed dispatch below preserves the alignment the
//         allocation was made with, which is what `dealloc` relies on.
unsafe impl<S: MemorySource> GlobalAlloc for Heap<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = if layout.align() <= ALIGN_SIZE {
            self.malloc(layout.size())
        } else {
            self.memalign(layout.align(), layout.size())
        };
        match result {
            Ok(Some(p)) => p.as_ptr(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(err) = self.free(ptr) {
            log::error!("dealloc: {}", err);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGN_SIZE {
            match self.realloc(ptr, new_size) {
                Ok(Some(p)) => p.as_ptr(),
                _ => ptr::null_mut(),
            }
        } else {
            // Resizing in place cannot preserve an over-aligned payload if
            // the block has to move, so relocate explicitly.
            match self.memalign(layout.align(), new_size) {
                Ok(Some(new_ptr)) => {
                    ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), layout.size().min(new_size));
                    if let Err(err) = self.free(ptr) {
                        log::error!("realloc: {}", err);
                    }
                    new_ptr.as_ptr()
                }
                _ => ptr::null_mut(),
            }
        }
    }
}
