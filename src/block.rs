//! Block headers and the physical block list.
//!
//! Every block in a pool is prefixed by a [`BlockHdr`]. The header is a sum
//! type keyed on the *free* bit of the size word:
//!
//!  - While the block is **free**, the header is really a [`FreeBlockHdr`]:
//!    the two list links after the common part are live, and the
//!    `prev_phys` field of the *next* physical block points back at this
//!    block.
//!
//!  - While the block is **used**, only the size word is live. The list
//!    link slots belong to the user payload, and the `prev_phys` slot of
//!    the next physical block is the tail of this block's payload. The
//!    per-allocation overhead is therefore a single word.
//!
//! All pointer arithmetic on raw pool bytes is confined to this module;
//! the rest of the crate trades in `NonNull<BlockHdr>` handles and payload
//! pointers obtained from [`to_payload`]/[`from_payload`].

use core::{hint::unreachable_unchecked, mem, ptr::NonNull};

/// Payload alignment guaranteed by the allocator, in bytes.
///
/// One machine word: the payload begins one overhead word past an
/// `ALIGN_SIZE`-aligned block start, so any larger value would leave every
/// payload misaligned by construction.
pub const ALIGN_SIZE: usize = mem::size_of::<usize>();

pub(crate) const ALIGN_SIZE_LOG2: u32 = ALIGN_SIZE.trailing_zeros();

/// Bit 0 of the size word: this block is free.
pub(crate) const BLOCK_HDR_FREE_BIT: usize = 1 << 0;
/// Bit 1 of the size word: the physical predecessor is free.
pub(crate) const BLOCK_HDR_PREV_FREE_BIT: usize = 1 << 1;

/// Per-allocation overhead: the size word.
pub(crate) const BLOCK_HDR_OVERHEAD: usize = mem::size_of::<usize>();

/// Offset from the header start to the payload.
pub(crate) const BLOCK_START_OFFSET: usize = mem::size_of::<BlockHdr>();

/// Smallest representable block size. The `prev_phys` field overlaps the
/// preceding block's payload, so it does not count.
pub const BLOCK_SIZE_MIN: usize =
    mem::size_of::<FreeBlockHdr>() - mem::size_of::<Option<NonNull<BlockHdr>>>();

// The size word stores flags in its low bits, so real sizes must leave
// them clear.
const _: () = assert!(BLOCK_SIZE_MIN & (BLOCK_HDR_FREE_BIT | BLOCK_HDR_PREV_FREE_BIT) == 0);
const _: () = assert!(BLOCK_SIZE_MIN % ALIGN_SIZE == 0);
const _: () = assert!(BLOCK_START_OFFSET == 2 * mem::size_of::<usize>());
const _: () = assert!(mem::size_of::<FreeBlockHdr>() == BLOCK_SIZE_MIN + BLOCK_HDR_OVERHEAD);

/// The common header of a pool block.
///
/// Never constructed by value; headers are materialised in place over pool
/// bytes and accessed through `NonNull<BlockHdr>`.
#[repr(C)]
pub(crate) struct BlockHdr {
    /// Back-reference to the immediately preceding physical block.
    ///
    /// Meaningful only while [`BlockHdr::is_prev_free`] holds; otherwise
    /// the slot is the tail of the preceding block's payload. The `Option`
    /// keeps every bit pattern the payload can leave here a valid value,
    /// so a header reference is sound even while the slot holds user data.
    pub(crate) prev_phys: Option<NonNull<BlockHdr>>,
    /// Block size in bytes including the overhead word, with
    /// [`BLOCK_HDR_FREE_BIT`] and [`BLOCK_HDR_PREV_FREE_BIT`] packed into
    /// the low bits.
    size: usize,
}

/// The header of a free block: the common part plus the free-list links.
///
/// A used block's header is just [`BlockHdr`]; the link slots below are
/// payload then. Conversions go through `NonNull::cast`, guarded by the
/// free bit.
#[repr(C)]
pub(crate) struct FreeBlockHdr {
    pub(crate) common: BlockHdr,
    /// Free-list forward link; the list sentinel terminates it.
    pub(crate) next_free: NonNull<FreeBlockHdr>,
    /// Free-list backward link.
    pub(crate) prev_free: NonNull<FreeBlockHdr>,
}

impl BlockHdr {
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size & !(BLOCK_HDR_FREE_BIT | BLOCK_HDR_PREV_FREE_BIT)
    }

    /// Replace the stored size, preserving the flag bits.
    #[inline]
    pub(crate) fn set_size(&mut self, size: usize) {
        debug_assert!(size & (BLOCK_HDR_FREE_BIT | BLOCK_HDR_PREV_FREE_BIT) == 0);
        self.size = size | (self.size & (BLOCK_HDR_FREE_BIT | BLOCK_HDR_PREV_FREE_BIT));
    }

    /// A zero size marks the terminating block of a pool.
    #[inline]
    pub(crate) fn is_last(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.size & BLOCK_HDR_FREE_BIT != 0
    }

    #[inline]
    pub(crate) fn set_free(&mut self) {
        self.size |= BLOCK_HDR_FREE_BIT;
    }

    #[inline]
    pub(crate) fn set_used(&mut self) {
        self.size &= !BLOCK_HDR_FREE_BIT;
    }

    #[inline]
    pub(crate) fn is_prev_free(&self) -> bool {
        self.size & BLOCK_HDR_PREV_FREE_BIT != 0
    }

    #[inline]
    pub(crate) fn set_prev_free(&mut self) {
        self.size |= BLOCK_HDR_PREV_FREE_BIT;
    }

    #[inline]
    pub(crate) fn set_prev_used(&mut self) {
        self.size &= !BLOCK_HDR_PREV_FREE_BIT;
    }
}

/// Overwrite the whole size word, flags included.
///
/// This is the only way to put a header on bytes that never held one
/// (pool creation, the freshly exposed half of a split); everything else
/// goes through the flag-preserving accessors.
///
/// # Safety
///
/// `block` must point at writable pool memory with room for a size word.
#[inline]
pub(crate) unsafe fn write_size_word(block: NonNull<BlockHdr>, word: usize) {
    core::ptr::addr_of_mut!((*block.as_ptr()).size).write(word);
}

/// Recover the block header from a payload pointer.
///
/// # Safety
///
/// `ptr` must be a payload pointer previously produced by [`to_payload`].
#[inline]
pub(crate) unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
    NonNull::new_unchecked(ptr.as_ptr().sub(BLOCK_START_OFFSET)).cast()
}

/// The payload address of a block.
#[inline]
pub(crate) fn to_payload(block: NonNull<BlockHdr>) -> NonNull<u8> {
    // Safety: offsetting a valid block header by the payload offset stays
    //         within the same pool region
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_START_OFFSET)) }
}

/// Reinterpret `ptr + offset` as a block header address.
///
/// # Safety
///
/// The offset address must lie within (or one overhead word before) a pool
/// region.
#[inline]
pub(crate) unsafe fn offset_to_block(ptr: *mut u8, offset: isize) -> NonNull<BlockHdr> {
    NonNull::new_unchecked(ptr.offset(offset)).cast()
}

/// The next physical block.
///
/// # Safety
///
/// `block` must not be the last block of its pool.
#[inline]
pub(crate) unsafe fn next_phys(block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    debug_assert!(!block.as_ref().is_last());
    offset_to_block(
        to_payload(block).as_ptr(),
        (block.as_ref().size() - BLOCK_HDR_OVERHEAD) as isize,
    )
}

/// The previous physical block, through the back-reference.
///
/// # Safety
///
/// The physical predecessor must exist and be free (`is_prev_free`);
/// otherwise the back-reference slot holds payload bytes.
#[inline]
pub(crate) unsafe fn prev_phys(block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    debug_assert!(block.as_ref().is_prev_free());
    // `link_next` stores the back-reference before the flag is ever set.
    block
        .as_ref()
        .prev_phys
        .unwrap_or_else(|| unreachable_unchecked())
}

/// Store the back-reference in the next physical block and return it.
///
/// # Safety
///
/// `block` must not be the last block of its pool, and its size must
/// already describe its final extent.
#[inline]
pub(crate) unsafe fn link_next(block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    let next = next_phys(block);
    core::ptr::addr_of_mut!((*next.as_ptr()).prev_phys).write(Some(block));
    next
}

/// Flag `block` as free and publish the back-reference to its neighbor.
///
/// # Safety
///
/// `block` must not be the last block of its pool.
#[inline]
pub(crate) unsafe fn mark_as_free(mut block: NonNull<BlockHdr>) {
    let mut next = link_next(block);
    next.as_mut().set_prev_free();
    block.as_mut().set_free();
}

/// Flag `block` as used and retract the neighbor's prev-free bit.
///
/// # Safety
///
/// `block` must not be the last block of its pool.
#[inline]
pub(crate) unsafe fn mark_as_used(mut block: NonNull<BlockHdr>) {
    let mut next = next_phys(block);
    next.as_mut().set_prev_used();
    block.as_mut().set_used();
}

/// Whether `block` can be split into a `size`-byte block plus a remainder
/// that still fits a whole free-block header.
///
/// # Safety
///
/// `block` must point at a live block header.
#[inline]
pub(crate) unsafe fn can_split(block: NonNull<BlockHdr>, size: usize) -> bool {
    block.as_ref().size() >= mem::size_of::<FreeBlockHdr>() + size
}

/// Carve the tail of `block` off as a new free block.
///
/// `block` keeps the first `size` bytes; the remainder becomes a free
/// block whose header overlaps `block`'s former payload tail.
///
/// # Safety
///
/// `can_split(block, size)` must hold, `size` must be a multiple of
/// [`ALIGN_SIZE`], and `block` must not be the last block of its pool.
pub(crate) unsafe fn split(mut block: NonNull<BlockHdr>, size: usize) -> NonNull<BlockHdr> {
    let remaining = offset_to_block(
        to_payload(block).as_ptr(),
        (size - BLOCK_HDR_OVERHEAD) as isize,
    );
    let remain_size = block.as_ref().size() - (size + BLOCK_HDR_OVERHEAD);

    debug_assert!(
        to_payload(remaining).as_ptr() as usize % ALIGN_SIZE == 0,
        "remaining block payload not aligned"
    );
    debug_assert!(remain_size >= BLOCK_SIZE_MIN, "invalid split size");

    // A fresh header: the remainder's size slot holds old payload bytes,
    // so the flag bits must be written outright, not preserved.
    write_size_word(remaining, remain_size);
    block.as_mut().set_size(size);
    mark_as_free(remaining);
    remaining
}

/// Merge `block` into `prev`, which must be its physical predecessor.
///
/// `prev`'s flags are untouched; the back-reference of the block after
/// `block` is rewritten to `prev`.
///
/// # Safety
///
/// `prev` and `block` must be physically adjacent live headers, and
/// `block` must not be the last block of its pool.
#[inline]
pub(crate) unsafe fn absorb(prev: NonNull<BlockHdr>, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    debug_assert!(!prev.as_ref().is_last());
    // Raw add keeps prev's flag bits intact.
    (*prev.as_ptr()).size += block.as_ref().size() + BLOCK_HDR_OVERHEAD;
    link_next(prev);
    prev
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_constants() {
        assert_eq!(BLOCK_START_OFFSET, 2 * mem::size_of::<usize>());
        assert_eq!(BLOCK_SIZE_MIN, 3 * mem::size_of::<usize>());
        assert_eq!(BLOCK_HDR_OVERHEAD, mem::size_of::<usize>());
        assert_eq!(mem::size_of::<FreeBlockHdr>(), 4 * mem::size_of::<usize>());
    }

    #[test]
    fn size_word_flags() {
        let mut hdr = [0usize; 2];
        let block = NonNull::new(hdr.as_mut_ptr()).unwrap().cast::<BlockHdr>();
        unsafe {
            write_size_word(block, 64);
            let b = &mut *block.as_ptr();
            assert_eq!(b.size(), 64);
            assert!(!b.is_free());
            assert!(!b.is_prev_free());

            b.set_free();
            b.set_prev_free();
            assert_eq!(b.size(), 64);
            assert!(b.is_free());
            assert!(b.is_prev_free());

            b.set_size(128);
            assert_eq!(b.size(), 128);
            assert!(b.is_free());
            assert!(b.is_prev_free());

            b.set_used();
            b.set_prev_used();
            assert_eq!(b.size(), 128);
            assert!(!b.is_free());
            assert!(!b.is_prev_free());
        }
    }

    #[test]
    fn payload_round_trip() {
        let mut hdr = [0usize; 2];
        let block = NonNull::new(hdr.as_mut_ptr()).unwrap().cast::<BlockHdr>();
        let payload = to_payload(block);
        assert_eq!(
            payload.as_ptr() as usize - block.as_ptr() as usize,
            BLOCK_START_OFFSET
        );
        assert_eq!(unsafe { from_payload(payload) }, block);
    }
}
