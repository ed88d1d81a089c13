//! The TLSF allocator core: the free-list controller and the allocation
//! engine built on it.

use core::{mem, ptr, ptr::NonNull};

use crate::{
    block::{
        self, BlockHdr, FreeBlockHdr, ALIGN_SIZE, ALIGN_SIZE_LOG2, BLOCK_HDR_FREE_BIT,
        BLOCK_HDR_OVERHEAD, BLOCK_HDR_PREV_FREE_BIT, BLOCK_SIZE_MIN,
    },
    error::AllocError,
    utils::{align_down, align_ptr, align_up, ffs},
};

pub(crate) mod map;
use map::{mapping_insert, mapping_search};

/// log2 of the number of second-level classes per first-level class.
pub(crate) const SL_INDEX_COUNT_LOG2: usize = 5;

/// Number of second-level classes per first-level class.
pub(crate) const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

/// log2 of the largest supported block size.
#[cfg(target_pointer_width = "64")]
pub(crate) const FL_INDEX_MAX: usize = 32;
#[cfg(target_pointer_width = "32")]
pub(crate) const FL_INDEX_MAX: usize = 30;

/// First-level shift: sizes below `1 << FL_INDEX_SHIFT` all map to `fl = 0`.
pub(crate) const FL_INDEX_SHIFT: usize = SL_INDEX_COUNT_LOG2 + ALIGN_SIZE_LOG2 as usize;

/// Number of first-level classes.
pub(crate) const FL_INDEX_COUNT: usize = FL_INDEX_MAX - FL_INDEX_SHIFT + 1;

/// Below this size all blocks share the first first-level class and are
/// binned linearly.
pub(crate) const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

/// Largest manageable block size.
pub const BLOCK_SIZE_MAX: usize = 1 << FL_INDEX_MAX;

// The linear small-block bins must be exactly ALIGN_SIZE wide, and both
// bitmaps must fit their index ranges in a u32.
const _: () = assert!(ALIGN_SIZE == SMALL_BLOCK_SIZE / SL_INDEX_COUNT);
const _: () = assert!(SL_INDEX_COUNT <= u32::BITS as usize);
const _: () = assert!(FL_INDEX_COUNT <= u32::BITS as usize);

/// A memory pool registered with a [`Tlsf`] controller.
///
/// The handle wraps the base address of the region that was passed to
/// [`Tlsf::add_pool`]; the region stays exclusively owned by the controller
/// until [`Tlsf::remove_pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool(NonNull<u8>);

impl Pool {
    /// The base address of the pool region.
    #[inline]
    pub fn base(self) -> NonNull<u8> {
        self.0
    }
}

#[cfg_attr(feature = "doc_cfg", svgbobdoc::transform)]
/// The TLSF controller: two levels of bitmaps over an array of segregated
/// free lists.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///  First level
///                 ,-----+-----+-----+-----+-----+-----,
///  fl_bitmap: u32 | ... |  0  |  1  |  0  |  0  |  0  |
///                 '-----+-----+--+--+-----+-----+-----'
///                                |
///  Second Level                  v
///                 ,-----+-----+-----+-----+-----+-----,
///  "sl_bitmap[i]" | ... |  0  |  0  |  1  |  0  |  0  |
///                 '-----+-----+--+--+-----+-----+-----'
///                                |
///  Free lists                    v
///                 ,---------,  ,---------,  ,--------------,
///  "blocks[i][j]" | free    |  | free    |  | "block_null" |
///          o------+-> next o+--+-> next o+--+-> self       |
///                 |   prev  |  |   prev  |  |    self      |
///                 '---------'  '---------'  '--------------'
/// ```
/// </center>
///
/// Every list is doubly linked and terminated by the shared `block_null`
/// sentinel, which points at itself; an empty list is one whose head *is*
/// the sentinel, so the splice paths never branch on null.
///
/// The controller is constructed **in place** at the start of a backing
/// region (see [`Tlsf::construct`]) and never moves, which keeps the
/// self-referential sentinel valid for its whole life.
#[repr(C)]
pub struct Tlsf {
    /// Terminator of every free list; never handed out to callers.
    block_null: FreeBlockHdr,
    /// Bit `i` is set iff some list in first-level class `i` is non-empty.
    fl_bitmap: u32,
    /// Bit `j` of entry `i` is set iff list `(i, j)` is non-empty.
    sl_bitmap: [u32; FL_INDEX_COUNT],
    /// Head of each free list; the sentinel when empty.
    blocks: [[NonNull<FreeBlockHdr>; SL_INDEX_COUNT]; FL_INDEX_COUNT],
}

/// Round a request up to the aligned internal minimum.
///
/// Returns `None` for zero-size requests and for sizes whose aligned form
/// would reach [`BLOCK_SIZE_MAX`] (those would run off the end of the
/// second-level bitmap).
fn adjust_request_size(size: usize, align: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    let aligned = size.checked_add(align - 1)? & !(align - 1);
    if aligned >= BLOCK_SIZE_MAX {
        None
    } else {
        Some(aligned.max(BLOCK_SIZE_MIN))
    }
}

impl Tlsf {
    /// Bytes the controller occupies at the start of its backing region.
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Bytes of a region consumed by pool bookkeeping: the first block's
    /// overhead word plus the zero-size terminator block.
    #[inline]
    pub const fn pool_overhead() -> usize {
        2 * BLOCK_HDR_OVERHEAD
    }

    /// Bookkeeping bytes consumed by each allocation.
    #[inline]
    pub const fn alloc_overhead() -> usize {
        BLOCK_HDR_OVERHEAD
    }

    /// The free-list sentinel's address.
    #[inline]
    fn block_null(&self) -> NonNull<FreeBlockHdr> {
        NonNull::from(&self.block_null)
    }

    /// Construct a controller in place at the start of `mem`.
    ///
    /// All list heads point at the sentinel and both bitmap levels are
    /// zero; the controller manages no memory until [`Tlsf::add_pool`].
    ///
    /// # Safety
    ///
    /// `mem` must be valid for reads and writes for [`Tlsf::SIZE`] bytes
    /// and stay valid (and pinned) for as long as the returned controller
    /// is used.
    pub unsafe fn construct(mem: NonNull<u8>) -> Result<NonNull<Tlsf>, AllocError> {
        let addr = mem.as_ptr() as usize;
        if addr % ALIGN_SIZE != 0 {
            return Err(AllocError::PoolMisaligned {
                addr,
                align: ALIGN_SIZE,
            });
        }

        let ctl: NonNull<Tlsf> = mem.cast();
        let p = ctl.as_ptr();

        let null_block: NonNull<FreeBlockHdr> =
            NonNull::new_unchecked(ptr::addr_of_mut!((*p).block_null));
        ptr::addr_of_mut!((*p).block_null.common.prev_phys).write(None);
        block::write_size_word(null_block.cast(), 0);
        ptr::addr_of_mut!((*p).block_null.next_free).write(null_block);
        ptr::addr_of_mut!((*p).block_null.prev_free).write(null_block);

        ptr::addr_of_mut!((*p).fl_bitmap).write(0);
        for i in 0..FL_INDEX_COUNT {
            ptr::addr_of_mut!((*p).sl_bitmap[i]).write(0);
            for j in 0..SL_INDEX_COUNT {
                ptr::addr_of_mut!((*p).blocks[i][j]).write(null_block);
            }
        }

        Ok(ctl)
    }

    /// Construct a controller at the start of `mem` and register the rest
    /// of the region as its first pool.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for reads and writes for `bytes` bytes and stay
    /// valid (and pinned) for as long as the returned controller is used.
    pub unsafe fn construct_with_pool(
        mem: NonNull<u8>,
        bytes: usize,
    ) -> Result<(NonNull<Tlsf>, Pool), AllocError> {
        let mut ctl = Self::construct(mem)?;
        let ctl_size = align_up(Self::SIZE, ALIGN_SIZE);
        let pool_bytes = bytes
            .checked_sub(ctl_size)
            .ok_or(AllocError::PoolSizeOutOfRange {
                bytes: 0,
                min: BLOCK_SIZE_MIN,
                max: BLOCK_SIZE_MAX,
            })?;
        let pool_mem = NonNull::new_unchecked(mem.as_ptr().add(ctl_size));
        let pool = ctl.as_mut().add_pool(pool_mem, pool_bytes)?;
        Ok((ctl, pool))
    }

    /// Register `bytes` bytes at `mem` as a new pool.
    ///
    /// The region becomes one large free block followed by a zero-size
    /// terminator. The first block starts one overhead word *before* `mem`
    /// so that its `prev_phys` slot falls outside the managed range.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for reads and writes for `bytes` bytes, must not
    /// overlap any other pool, and must stay valid until the pool is
    /// removed or the controller is abandoned.
    pub unsafe fn add_pool(&mut self, mem: NonNull<u8>, bytes: usize) -> Result<Pool, AllocError> {
        let addr = mem.as_ptr() as usize;
        if addr % ALIGN_SIZE != 0 {
            log::error!(
                "add_pool: region {:#x} must be aligned to {} bytes",
                addr,
                ALIGN_SIZE
            );
            return Err(AllocError::PoolMisaligned {
                addr,
                align: ALIGN_SIZE,
            });
        }

        let pool_bytes = align_down(bytes.saturating_sub(Self::pool_overhead()), ALIGN_SIZE);
        if pool_bytes < BLOCK_SIZE_MIN || pool_bytes > BLOCK_SIZE_MAX {
            log::error!(
                "add_pool: {} usable bytes outside {}..={}",
                pool_bytes,
                BLOCK_SIZE_MIN,
                BLOCK_SIZE_MAX
            );
            return Err(AllocError::PoolSizeOutOfRange {
                bytes: pool_bytes,
                min: BLOCK_SIZE_MIN,
                max: BLOCK_SIZE_MAX,
            });
        }

        let block = block::offset_to_block(mem.as_ptr(), -(BLOCK_HDR_OVERHEAD as isize));
        block::write_size_word(block, pool_bytes | BLOCK_HDR_FREE_BIT);
        self.block_insert(block);

        // The terminator: zero size, used, preceded by the free block.
        let next = block::link_next(block);
        block::write_size_word(next, BLOCK_HDR_PREV_FREE_BIT);

        Ok(Pool(mem))
    }

    /// Unregister a pool.
    ///
    /// # Safety
    ///
    /// `pool` must have been returned by [`Tlsf::add_pool`] on this
    /// controller, and every allocation in it must already be freed.
    pub unsafe fn remove_pool(&mut self, pool: Pool) {
        let block = block::offset_to_block(pool.0.as_ptr(), -(BLOCK_HDR_OVERHEAD as isize));
        debug_assert!(block.as_ref().is_free(), "pool still has live allocations");
        {
            let next = block::next_phys(block);
            debug_assert!(!next.as_ref().is_free(), "pool terminator must be used");
            debug_assert!(next.as_ref().is_last(), "pool terminator size must be zero");
        }
        let (fl, sl) = mapping_insert(block.as_ref().size());
        self.remove_free_block(block, fl, sl);
    }

    /// Attempt to allocate `size` bytes.
    ///
    /// Returns the payload address, aligned to [`ALIGN_SIZE`], or `None`
    /// when the request is zero-sized, too large to represent, or no free
    /// block fits. Completes in constant time.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let adjust = adjust_request_size(size, ALIGN_SIZE)?;
        let block = self.locate_free(adjust);
        // Safety: `block` came out of our own free lists just now
        unsafe { self.prepare_used(block, adjust) }
    }

    /// Attempt to allocate `size` bytes whose payload address is a
    /// multiple of `align`.
    ///
    /// When `align` exceeds [`ALIGN_SIZE`], the request is padded so that
    /// a misaligned placement can be fixed by trimming a leading free
    /// block off the front and returning it to the pool. The previous
    /// physical block is in use at that point, so the gap cannot be merged
    /// backwards; it must become a whole block, which is why the padding
    /// reserves a full header (`gap_minimum`) in addition to `align`.
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());

        let adjust = adjust_request_size(size, ALIGN_SIZE)?;
        let gap_minimum = mem::size_of::<FreeBlockHdr>();

        let aligned_size = if align > ALIGN_SIZE {
            adjust_request_size(adjust.checked_add(align)?.checked_add(gap_minimum)?, align)?
        } else {
            adjust
        };

        let mut block = self.locate_free(aligned_size)?;

        // Safety: `block` is a live free block we just unlinked
        unsafe {
            let payload = block::to_payload(block).as_ptr() as usize;
            let mut aligned = align_ptr(payload, align);
            let mut gap = aligned - payload;

            // A non-empty gap must fit a whole header; skip to the next
            // aligned boundary when it does not.
            if gap != 0 && gap < gap_minimum {
                let gap_remain = gap_minimum - gap;
                let offset = gap_remain.max(align);
                aligned = align_ptr(aligned + offset, align);
                gap = aligned - payload;
            }

            if gap != 0 {
                debug_assert!(gap >= gap_minimum, "gap size too small");
                block = self.trim_free_leading(block, gap);
            }

            self.prepare_used(Some(block), adjust)
        }
    }

    /// Return an allocation to the pool, coalescing with free physical
    /// neighbors.
    ///
    /// Completes in constant time.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload pointer obtained from this controller and
    /// not freed since. (Freeing twice is *detected* and reported, but
    /// only as long as the block has not been handed out again.)
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let block = block::from_payload(ptr);
        if block.as_ref().is_free() {
            return Err(AllocError::BlockAlreadyFreed);
        }
        block::mark_as_free(block);
        let block = self.merge_prev(block);
        let block = self.merge_next(block);
        self.block_insert(block);
        Ok(())
    }

    /// Grow or shrink an allocation, in place when the block itself or its
    /// free successor offers enough room, otherwise by allocate-copy-free.
    ///
    /// Returns `None` when the request cannot be satisfied; the original
    /// allocation is retained in that case.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer obtained from this controller,
    /// and `size` must be non-zero (the zero-size-frees convention lives
    /// in the facade).
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size != 0);

        let block = block::from_payload(ptr);
        let next = block::next_phys(block);
        let cursize = block.as_ref().size();
        let combined = cursize + next.as_ref().size() + BLOCK_HDR_OVERHEAD;
        let adjust = adjust_request_size(size, ALIGN_SIZE)?;

        debug_assert!(!block.as_ref().is_free(), "block already marked as free");

        if adjust > cursize && (!next.as_ref().is_free() || adjust > combined) {
            // The successor cannot provide the growth; move the payload.
            let p = self.allocate(size)?;
            ptr::copy_nonoverlapping(ptr.as_ptr(), p.as_ptr(), cursize.min(size));
            let freed = self.deallocate(ptr);
            debug_assert!(freed.is_ok());
            Some(p)
        } else {
            if adjust > cursize {
                self.merge_next(block);
                block::mark_as_used(block);
            }
            self.trim_used(block, adjust);
            Some(ptr)
        }
    }

    /// Find, unlink and return a free block of at least `size` bytes.
    fn locate_free(&mut self, size: usize) -> Option<NonNull<BlockHdr>> {
        if size == 0 {
            return None;
        }

        let (mut fl, mut sl) = mapping_search(size);

        // The search mapping rounds the size up, so for near-maximum sizes
        // it can produce a first-level index one past the end. The
        // second-level index is computed modulo SL_INDEX_COUNT and is
        // always in range.
        if fl >= FL_INDEX_COUNT {
            return None;
        }

        let block = self.search_suitable_block(&mut fl, &mut sl)?;
        // Safety: the block sits on free list (fl, sl) of this controller
        unsafe {
            debug_assert!(block.as_ref().size() >= size);
            self.remove_free_block(block, fl, sl);
        }
        Some(block)
    }

    /// Good-fit bitmap search starting at class `(fl, sl)`.
    ///
    /// On success `fl`/`sl` are updated to the class the block was found
    /// in. Returns `None` when every class at or above the requested one
    /// is empty (heap exhausted).
    fn search_suitable_block(&self, fl: &mut usize, sl: &mut usize) -> Option<NonNull<BlockHdr>> {
        let mut sl_map = self.sl_bitmap[*fl] & (!0u32 << *sl);
        if sl_map == 0 {
            // Nothing left in this first-level class; take the lowest
            // non-empty class above it.
            let fl_map = self.fl_bitmap & (!0u32 << (*fl + 1));
            if fl_map == 0 {
                return None;
            }

            *fl = ffs(fl_map) as usize;
            sl_map = self.sl_bitmap[*fl];
            debug_assert!(sl_map != 0, "second level bitmap is empty");
        }
        *sl = ffs(sl_map) as usize;

        Some(self.blocks[*fl][*sl].cast())
    }

    /// Splice a block out of free list `(fl, sl)`.
    ///
    /// # Safety
    ///
    /// `block` must currently be on free list `(fl, sl)` of this
    /// controller.
    unsafe fn remove_free_block(&mut self, block: NonNull<BlockHdr>, fl: usize, sl: usize) {
        let block = block.cast::<FreeBlockHdr>();
        let prev = (*block.as_ptr()).prev_free;
        let next = (*block.as_ptr()).next_free;
        (*next.as_ptr()).prev_free = prev;
        (*prev.as_ptr()).next_free = next;

        if self.blocks[fl][sl] == block {
            self.blocks[fl][sl] = next;

            if next == self.block_null() {
                self.sl_bitmap[fl] &= !(1u32 << sl);

                if self.sl_bitmap[fl] == 0 {
                    self.fl_bitmap &= !(1u32 << fl);
                }
            }
        }
    }

    /// Push a block onto the head of free list `(fl, sl)`.
    ///
    /// # Safety
    ///
    /// `block` must be a live free block owned by this controller and not
    /// currently on any free list.
    unsafe fn insert_free_block(&mut self, block: NonNull<BlockHdr>, fl: usize, sl: usize) {
        let current = self.blocks[fl][sl];
        let block = block.cast::<FreeBlockHdr>();
        (*block.as_ptr()).next_free = current;
        (*block.as_ptr()).prev_free = self.block_null();
        (*current.as_ptr()).prev_free = block;

        debug_assert!(
            block::to_payload(block.cast()).as_ptr() as usize % ALIGN_SIZE == 0,
            "block not aligned properly"
        );

        self.blocks[fl][sl] = block;
        self.fl_bitmap |= 1u32 << fl;
        self.sl_bitmap[fl] |= 1u32 << sl;
    }

    /// Remove a block from the free list its size maps to.
    ///
    /// # Safety
    ///
    /// `block` must be on the free list corresponding to its size.
    unsafe fn block_remove(&mut self, block: NonNull<BlockHdr>) {
        let (fl, sl) = mapping_insert(block.as_ref().size());
        self.remove_free_block(block, fl, sl);
    }

    /// Insert a block into the free list its size maps to.
    ///
    /// # Safety
    ///
    /// `block` must be a live free block owned by this controller and not
    /// currently on any free list.
    unsafe fn block_insert(&mut self, block: NonNull<BlockHdr>) {
        let (fl, sl) = mapping_insert(block.as_ref().size());
        self.insert_free_block(block, fl, sl);
    }

    /// Merge a just-freed block with its physical predecessor if that one
    /// is free.
    ///
    /// # Safety
    ///
    /// `block` must be a live block header owned by this controller.
    unsafe fn merge_prev(&mut self, mut block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        if block.as_ref().is_prev_free() {
            let prev = block::prev_phys(block);
            debug_assert!(
                prev.as_ref().is_free(),
                "prev block is not free though marked as such"
            );
            self.block_remove(prev);
            block = block::absorb(prev, block);
        }
        block
    }

    /// Merge a just-freed block with its physical successor if that one is
    /// free.
    ///
    /// # Safety
    ///
    /// `block` must be a live, non-last block header owned by this
    /// controller.
    unsafe fn merge_next(&mut self, mut block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        let next = block::next_phys(block);
        if next.as_ref().is_free() {
            debug_assert!(!block.as_ref().is_last(), "previous block can't be last");
            self.block_remove(next);
            block = block::absorb(block, next);
        }
        block
    }

    /// Trim trailing space off a free block, returning the rest to the
    /// pool.
    ///
    /// # Safety
    ///
    /// `block` must be a live free block (not on any list) owned by this
    /// controller.
    unsafe fn trim_free(&mut self, block: NonNull<BlockHdr>, size: usize) {
        debug_assert!(block.as_ref().is_free(), "block must be free");
        if block::can_split(block, size) {
            let mut remaining = block::split(block, size);
            block::link_next(block);
            remaining.as_mut().set_prev_free();
            self.block_insert(remaining);
        }
    }

    /// Trim trailing space off a used block, returning the rest to the
    /// pool (coalescing it forward if the successor is free).
    ///
    /// # Safety
    ///
    /// `block` must be a live used block owned by this controller.
    unsafe fn trim_used(&mut self, block: NonNull<BlockHdr>, size: usize) {
        debug_assert!(!block.as_ref().is_free(), "block must be used");
        if block::can_split(block, size) {
            let mut remaining = block::split(block, size);
            remaining.as_mut().set_prev_used();

            let remaining = self.merge_next(remaining);
            self.block_insert(remaining);
        }
    }

    /// Trim `size` leading bytes off a free block, returning the leading
    /// part to the pool and keeping the tail. Used by aligned allocation.
    ///
    /// # Safety
    ///
    /// `block` must be a live free block (not on any list) owned by this
    /// controller.
    unsafe fn trim_free_leading(
        &mut self,
        block: NonNull<BlockHdr>,
        size: usize,
    ) -> NonNull<BlockHdr> {
        let mut remaining = block;
        if block::can_split(block, size) {
            // The tail is the block we keep.
            remaining = block::split(block, size - BLOCK_HDR_OVERHEAD);
            remaining.as_mut().set_prev_free();

            block::link_next(block);
            self.block_insert(block);
        }
        remaining
    }

    /// Trim a located block to `size` and hand its payload out.
    ///
    /// # Safety
    ///
    /// `block`, if present, must be a live free block (not on any list)
    /// owned by this controller.
    unsafe fn prepare_used(
        &mut self,
        block: Option<NonNull<BlockHdr>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let block = block?;
        debug_assert!(size != 0, "size must be non-zero");
        self.trim_free(block, size);
        block::mark_as_used(block);
        Some(block::to_payload(block))
    }

    /// Verify the free lists and both bitmap levels against each other and
    /// against the free blocks they reach.
    ///
    /// Returns zero when consistent; each violated invariant decrements
    /// the result by one and is reported through the logger.
    pub fn check(&self) -> i32 {
        let mut status = 0;

        macro_rules! insist {
            ($cond:expr, $msg:expr) => {
                if !$cond {
                    log::error!("heap check: {}", $msg);
                    status -= 1;
                }
            };
        }

        for i in 0..FL_INDEX_COUNT {
            for j in 0..SL_INDEX_COUNT {
                let fl_map = self.fl_bitmap & (1u32 << i);
                let sl_list = self.sl_bitmap[i];
                let sl_map = sl_list & (1u32 << j);
                let mut block = self.blocks[i][j];

                // The two levels must agree.
                if fl_map == 0 {
                    insist!(sl_map == 0, "second-level map must be null");
                }

                if sl_map == 0 {
                    insist!(block == self.block_null(), "block list must be null");
                    continue;
                }

                insist!(sl_list != 0, "no free blocks in second-level map");
                insist!(block != self.block_null(), "block should not be null");

                while block != self.block_null() {
                    // Safety: list membership implies these are live free
                    //         blocks in pools we own
                    unsafe {
                        let hdr = &block.as_ref().common;
                        insist!(hdr.is_free(), "block should be free");
                        insist!(!hdr.is_prev_free(), "blocks should have coalesced");
                        let next = block::next_phys(block.cast());
                        insist!(!next.as_ref().is_free(), "blocks should have coalesced");
                        insist!(next.as_ref().is_prev_free(), "block should be free");
                        insist!(hdr.size() >= BLOCK_SIZE_MIN, "block not minimum size");

                        let (fl, sl) = mapping_insert(hdr.size());
                        insist!(fl == i && sl == j, "block size indexed in wrong list");
                        block = block.as_ref().next_free;
                    }
                }
            }
        }

        status
    }
}

/// The internal size of the block behind a payload pointer, bookkeeping
/// word included. At least as large as the size that was requested.
///
/// # Safety
///
/// `ptr` must be a live payload pointer obtained from a [`Tlsf`]
/// controller.
pub unsafe fn block_size(ptr: NonNull<u8>) -> usize {
    block::from_payload(ptr).as_ref().size()
}

/// Walk the physical blocks of a pool in address order, reporting each
/// block's payload address, size, and whether it is in use.
///
/// # Safety
///
/// `pool` must be registered with a live controller, and no allocation or
/// deallocation may happen during the walk.
pub unsafe fn walk_pool(pool: Pool, mut walker: impl FnMut(NonNull<u8>, usize, bool)) {
    let mut block = block::offset_to_block(pool.base().as_ptr(), -(BLOCK_HDR_OVERHEAD as isize));
    while !block.as_ref().is_last() {
        walker(
            block::to_payload(block),
            block.as_ref().size(),
            !block.as_ref().is_free(),
        );
        block = block::next_phys(block);
    }
}

/// Verify that the blocks of a pool are physically consistent: the
/// free/prev-free flags of neighboring blocks alternate correctly and the
/// reported sizes line up.
///
/// Returns zero when consistent; each violation decrements the result.
///
/// # Safety
///
/// Same contract as [`walk_pool`].
pub unsafe fn check_pool(pool: Pool) -> i32 {
    let mut prev_free = false;
    let mut status = 0;

    walk_pool(pool, |payload, size, _used| {
        // Safety: the walker only sees live block payloads
        let hdr = unsafe { block::from_payload(payload).as_ref() };

        if hdr.is_prev_free() != prev_free {
            log::error!("pool check: prev status incorrect");
            status -= 1;
        }
        if hdr.size() != size {
            log::error!("pool check: block size incorrect");
            status -= 1;
        }

        prev_free = hdr.is_free();
    });

    status
}
