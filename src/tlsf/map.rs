//! Size to free-list mapping. The core of `mapping_insert` and
//! `mapping_search`.

use super::{FL_INDEX_SHIFT, SL_INDEX_COUNT, SL_INDEX_COUNT_LOG2, SMALL_BLOCK_SIZE};
use crate::utils::fls_sizet;

/// Map a block size to the `(fl, sl)` class that stores blocks of exactly
/// this size range.
///
/// Sizes below [`SMALL_BLOCK_SIZE`] share `fl = 0` and are binned linearly;
/// larger sizes use the position of their most significant bit for `fl`
/// and the next [`SL_INDEX_COUNT_LOG2`] bits for `sl`.
#[inline]
pub(crate) fn mapping_insert(size: usize) -> (usize, usize) {
    if size < SMALL_BLOCK_SIZE {
        (0, size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT))
    } else {
        let fl = fls_sizet(size) as usize;
        // Shift the size so the bit below the leading 1 lands at sl[SLI-1],
        // then strip the leading 1.
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ (1 << SL_INDEX_COUNT_LOG2);
        (fl - (FL_INDEX_SHIFT - 1), sl)
    }
}

/// Map a requested size to the first class whose every member is at least
/// as large (good fit).
///
/// Rounding the size up to the next sub-class boundary before
/// [`mapping_insert`] guarantees the head of the returned list satisfies
/// the request without scanning.
#[inline]
pub(crate) fn mapping_search(mut size: usize) -> (usize, usize) {
    if size >= SMALL_BLOCK_SIZE {
        let round = (1 << (fls_sizet(size) as usize - SL_INDEX_COUNT_LOG2)) - 1;
        size += round;
    }
    mapping_insert(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ALIGN_SIZE;

    /// Smallest size that maps into class `(fl, sl)`.
    fn class_min_size(fl: usize, sl: usize) -> usize {
        if fl == 0 {
            sl * (SMALL_BLOCK_SIZE / SL_INDEX_COUNT)
        } else {
            let base = SMALL_BLOCK_SIZE << (fl - 1);
            base + sl * (base / SL_INDEX_COUNT)
        }
    }

    #[test]
    fn insert_small_sizes() {
        assert_eq!(mapping_insert(0), (0, 0));
        assert_eq!(mapping_insert(ALIGN_SIZE), (0, 1));
        assert_eq!(
            mapping_insert(SMALL_BLOCK_SIZE - ALIGN_SIZE),
            (0, SL_INDEX_COUNT - 1)
        );
    }

    #[test]
    fn insert_class_boundaries() {
        assert_eq!(mapping_insert(SMALL_BLOCK_SIZE), (1, 0));
        assert_eq!(mapping_insert(SMALL_BLOCK_SIZE * 2), (2, 0));
        assert_eq!(mapping_insert(SMALL_BLOCK_SIZE * 4), (3, 0));
        assert_eq!(
            mapping_insert(SMALL_BLOCK_SIZE + SMALL_BLOCK_SIZE / SL_INDEX_COUNT),
            (1, 1)
        );
    }

    #[test]
    fn insert_brackets_every_size() {
        let mut size = ALIGN_SIZE;
        while size < SMALL_BLOCK_SIZE * 64 {
            let (fl, sl) = mapping_insert(size);
            let lo = class_min_size(fl, sl);
            let hi = if sl + 1 < SL_INDEX_COUNT {
                class_min_size(fl, sl + 1)
            } else {
                class_min_size(fl + 1, 0)
            };
            assert!(
                lo <= size && size < hi,
                "{} mapped to ({}, {}) = [{}, {})",
                size,
                fl,
                sl,
                lo,
                hi
            );
            size += ALIGN_SIZE;
        }
    }

    #[test]
    fn search_rounds_up() {
        // An exact class boundary stays put; anything past it moves to the
        // next class so the first list member is guaranteed to fit.
        assert_eq!(mapping_search(SMALL_BLOCK_SIZE), (1, 0));
        assert_eq!(mapping_search(SMALL_BLOCK_SIZE + 1), (1, 1));
        assert_eq!(
            mapping_search(SMALL_BLOCK_SIZE + SMALL_BLOCK_SIZE / SL_INDEX_COUNT),
            (1, 1)
        );

        let mut size = ALIGN_SIZE;
        while size < SMALL_BLOCK_SIZE * 64 {
            let (fl, sl) = mapping_search(size);
            assert!(
                class_min_size(fl, sl) >= size,
                "search({}) returned ({}, {}) with min {}",
                size,
                fl,
                sl,
                class_min_size(fl, sl)
            );
            size += ALIGN_SIZE;
        }
    }

    #[test]
    fn search_below_small_block_is_exact() {
        // Small sizes are already binned at ALIGN_SIZE granularity; the
        // adjusted request size is a multiple of it, so no rounding is
        // needed.
        assert_eq!(mapping_search(ALIGN_SIZE * 3), mapping_insert(ALIGN_SIZE * 3));
    }
}
