#![cfg(unix)]

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use tlsf_heap::{AllocError, Heap, ALIGN_SIZE, BLOCK_SIZE_MAX};

const HEAP_SIZE: usize = 160_000;

fn heap() -> Heap {
    let _ = env_logger::builder().is_test(true).try_init();
    Heap::new(HEAP_SIZE).unwrap()
}

#[test]
fn linear_allocate_and_free() {
    let heap = heap();

    let a1 = heap.malloc(24).unwrap().unwrap();
    let a2 = heap.malloc(24).unwrap().unwrap();
    assert_ne!(a1, a2);
    assert_eq!(a1.as_ptr() as usize % ALIGN_SIZE, 0);
    assert_eq!(a2.as_ptr() as usize % ALIGN_SIZE, 0);

    unsafe {
        heap.free(a1.as_ptr()).unwrap();
        heap.free(a2.as_ptr()).unwrap();
    }

    assert_eq!(heap.check().unwrap(), 0);
    assert_eq!(heap.check_pool().unwrap(), 0);

    // Back to a single free block spanning the whole pool.
    let mut free_blocks = 0;
    heap.walk(|_, _, used| {
        if !used {
            free_blocks += 1;
        }
    })
    .unwrap();
    assert_eq!(free_blocks, 1);
}

#[test]
fn coalescing_restores_one_free_block() {
    let heap = heap();

    let a = heap.malloc(64).unwrap().unwrap();
    let b = heap.malloc(64).unwrap().unwrap();
    let c = heap.malloc(64).unwrap().unwrap();

    unsafe {
        heap.free(b.as_ptr()).unwrap();
        heap.free(a.as_ptr()).unwrap();
        heap.free(c.as_ptr()).unwrap();
    }
    assert_eq!(heap.check().unwrap(), 0);

    let mut free_blocks = 0;
    heap.walk(|_, _, used| {
        if !used {
            free_blocks += 1;
        }
    })
    .unwrap();
    assert_eq!(free_blocks, 1);
}

#[test]
fn boundary_behaviors() {
    let heap = heap();

    // Null and zero edge cases.
    assert_eq!(heap.malloc(0).unwrap(), None);
    unsafe {
        assert_eq!(heap.realloc(ptr::null_mut(), 0).unwrap(), None);
        heap.free(ptr::null_mut()).unwrap();
    }

    // Oversize requests are exhaustion, not a panic.
    assert_eq!(
        heap.malloc(BLOCK_SIZE_MAX + 1),
        Err(AllocError::HeapExhausted {
            requested: BLOCK_SIZE_MAX + 1
        })
    );
    assert_eq!(
        heap.malloc(HEAP_SIZE * 2),
        Err(AllocError::HeapExhausted {
            requested: HEAP_SIZE * 2
        })
    );

    // Bad alignment argument.
    assert_eq!(
        heap.memalign(3, 64),
        Err(AllocError::AlignNotPowerOfTwo { align: 3 })
    );

    // Double free.
    let p = heap.malloc(32).unwrap().unwrap();
    unsafe {
        heap.free(p.as_ptr()).unwrap();
        assert_eq!(heap.free(p.as_ptr()), Err(AllocError::BlockAlreadyFreed));
    }

    // A pointer the allocator never issued.
    let q = heap.malloc(32).unwrap().unwrap();
    unsafe {
        assert!(matches!(
            heap.free(q.as_ptr().add(1)),
            Err(AllocError::BlockNotAligned { .. })
        ));
        heap.free(q.as_ptr()).unwrap();
    }

    assert_eq!(heap.check().unwrap(), 0);
}

#[test]
fn memalign_gap_is_returned_to_the_pool() {
    let heap = heap();

    let p = heap.memalign(256, 100).unwrap().unwrap();
    assert_eq!(p.as_ptr() as usize % 256, 0);
    unsafe {
        assert!(heap.block_size(p.as_ptr()) >= 100);
        heap.free(p.as_ptr()).unwrap();
    }

    assert_eq!(heap.check().unwrap(), 0);
    assert_eq!(heap.check_pool().unwrap(), 0);

    let mut free_blocks = 0;
    heap.walk(|_, _, used| {
        if !used {
            free_blocks += 1;
        }
    })
    .unwrap();
    assert_eq!(free_blocks, 1);
}

#[test]
fn realloc_preserves_contents() {
    let heap = heap();

    let p = heap.malloc(64).unwrap().unwrap();
    // The guard blocks in-place growth.
    let guard = heap.malloc(64).unwrap().unwrap();

    unsafe {
        for i in 0..48 {
            p.as_ptr().add(i).write(i as u8 ^ 0xa5);
        }

        let q = heap.realloc(p.as_ptr(), 48).unwrap().unwrap();
        assert_eq!(q, p);

        let r = heap.realloc(p.as_ptr(), 4096).unwrap().unwrap();
        assert_ne!(r, p);
        for i in 0..48 {
            assert_eq!(r.as_ptr().add(i).read(), i as u8 ^ 0xa5);
        }

        heap.free(r.as_ptr()).unwrap();
        heap.free(guard.as_ptr()).unwrap();
    }
    assert_eq!(heap.check().unwrap(), 0);
}

#[test]
fn realloc_of_null_allocates() {
    let heap = heap();

    let p = unsafe { heap.realloc(ptr::null_mut(), 128) }.unwrap().unwrap();
    unsafe {
        assert!(heap.block_size(p.as_ptr()) >= 128);
        // Zero size frees.
        assert_eq!(heap.realloc(p.as_ptr(), 0).unwrap(), None);
    }
    assert_eq!(heap.check().unwrap(), 0);
}

#[test]
fn calloc_zeroes_the_payload() {
    let heap = heap();

    let p = heap.calloc(16, 32).unwrap().unwrap();
    unsafe {
        for i in 0..16 * 32 {
            assert_eq!(p.as_ptr().add(i).read(), 0);
        }
        heap.free(p.as_ptr()).unwrap();
    }

    assert_eq!(
        heap.calloc(usize::MAX, 2),
        Err(AllocError::HeapExhausted {
            requested: usize::MAX
        })
    );
}

#[test]
fn walk_sees_every_allocation() {
    let heap = heap();

    let ptrs: Vec<_> = (0..5)
        .map(|i| heap.malloc(32 * (i + 1)).unwrap().unwrap())
        .collect();

    let mut used_blocks = 0;
    heap.walk(|_, _, used| {
        if used {
            used_blocks += 1;
        }
    })
    .unwrap();
    assert_eq!(used_blocks, 5);

    heap.dump().unwrap();

    for p in ptrs {
        unsafe { heap.free(p.as_ptr()).unwrap() };
    }
    assert_eq!(heap.check().unwrap(), 0);
}

#[test]
fn global_alloc_adapter() {
    let heap = heap();

    unsafe {
        let layout = Layout::from_size_align(100, 64).unwrap();
        let p = heap.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);

        for i in 0..100 {
            p.add(i).write(i as u8);
        }

        // An over-aligned realloc goes through relocate-and-copy. The
        // fully-qualified call picks the trait method over the inherent
        // two-argument `Heap::realloc`.
        let q = GlobalAlloc::realloc(&heap, p, layout, 8192);
        assert!(!q.is_null());
        assert_eq!(q as usize % 64, 0);
        for i in 0..100 {
            assert_eq!(q.add(i).read(), i as u8);
        }

        heap.dealloc(q, Layout::from_size_align(8192, 64).unwrap());
    }
    assert_eq!(heap.check().unwrap(), 0);
}

#[test]
fn threads_share_one_heap() {
    let heap = heap();

    std::thread::scope(|scope| {
        for t in 0..4usize {
            let heap = &heap;
            scope.spawn(move || {
                let mut ptrs = Vec::new();
                for i in 0..100usize {
                    let size = 16 + (t * 31 + i * 7) % 512;
                    if let Ok(Some(p)) = heap.malloc(size) {
                        unsafe { p.as_ptr().write(t as u8) };
                        ptrs.push(p);
                    }
                }
                for p in ptrs {
                    unsafe { heap.free(p.as_ptr()).unwrap() };
                }
            });
        }
    });

    assert_eq!(heap.check().unwrap(), 0);
    assert_eq!(heap.check_pool().unwrap(), 0);

    let mut free_blocks = 0;
    heap.walk(|_, _, used| {
        if !used {
            free_blocks += 1;
        }
    })
    .unwrap();
    assert_eq!(free_blocks, 1);
}
