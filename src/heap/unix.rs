//! OS bindings for the heap facade: the recursive mutex and the
//! anonymous-mapping memory source.

use core::{cell::UnsafeCell, mem::MaybeUninit, ptr, ptr::NonNull};

use std::boxed::Box;

use super::MemorySource;
use crate::error::AllocError;

/// A recursive process mutex.
///
/// `pthread_mutex_t` is address-sensitive once initialised, so it lives in
/// a heap allocation of its own instead of inline in the `Heap` value.
/// Recursion matters: reallocation re-enters the public entry points.
pub(super) struct Mutex {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// Safety: pthread mutexes are made for cross-thread use.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub(super) fn new() -> Result<Self, AllocError> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));

        // Safety: `attr` is initialised before use and destroyed after;
        //         the mutex cell address is stable inside the box
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
            if rc != 0 {
                return Err(AllocError::MutexInit { errno: rc });
            }
            let mut attr = attr.assume_init();
            libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_RECURSIVE);
            let rc = libc::pthread_mutex_init(inner.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(AllocError::MutexInit { errno: rc });
            }
        }

        Ok(Self { inner })
    }

    pub(super) fn lock(&self) -> Result<(), AllocError> {
        // Safety: the mutex is initialised for the whole life of `self`
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if rc != 0 {
            return Err(AllocError::MutexLock { errno: rc });
        }
        Ok(())
    }

    pub(super) fn unlock(&self) -> Result<(), AllocError> {
        // Safety: the mutex is initialised for the whole life of `self`
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if rc != 0 {
            return Err(AllocError::MutexUnlock { errno: rc });
        }
        Ok(())
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        // Safety: `&mut self` means nobody holds the lock
        unsafe { libc::pthread_mutex_destroy(self.inner.get()) };
    }
}

/// [`MemorySource`] backed by anonymous private mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapSource;

impl MmapSource {
    pub fn new() -> Self {
        Self
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// Safety: mmap returns page-aligned regions exclusively owned by the
//         process, valid until munmap.
unsafe impl MemorySource for MmapSource {
    unsafe fn acquire(&mut self, min_bytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        let page_m1 = self.min_align() - 1;
        let len = min_bytes
            .checked_add(page_m1)
            .ok_or(AllocError::MmapFailed {
                size: min_bytes,
                errno: libc::ENOMEM,
            })?
            & !page_m1;

        let addr = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if addr == libc::MAP_FAILED {
            return Err(AllocError::MmapFailed {
                size: len,
                errno: last_errno(),
            });
        }

        Ok(NonNull::new_unchecked(ptr::slice_from_raw_parts_mut(
            addr as *mut u8,
            len,
        )))
    }

    unsafe fn release(&mut self, region: NonNull<[u8]>) -> Result<(), AllocError> {
        if libc::munmap(region.as_ptr() as *mut libc::c_void, region.len()) != 0 {
            return Err(AllocError::MunmapFailed {
                errno: last_errno(),
            });
        }
        Ok(())
    }

    fn min_align(&self) -> usize {
        // Safety: sysconf is always safe to call
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        (page.max(0) as usize).max(4096)
    }
}
