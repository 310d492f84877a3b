//! Out-of-sync block map.
//!
//! One bit per 4 KiB region of the device: 0 = in sync with the peer,
//! 1 = the peer's copy must be updated. Drives the quick-resync path.
//!
//! Device block sizes may be smaller than the 4 KiB map granularity; a
//! one-entry coalescing cache collects in-sync notifications for the
//! sub-blocks of a region and only clears the bit once every sub-block has
//! been rewritten with no out-of-sync event in between.

use std::sync::Mutex;

use tracing::warn;

/// log2 of the map granularity (4 KiB per bit).
pub const BM_BLOCK_SHIFT: u32 = 12;
pub const BM_BLOCK_SIZE: u64 = 1 << BM_BLOCK_SHIFT;

/// Sentinel returned by the cursor when no out-of-sync block remains.
pub const SCAN_DONE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    InSync,
    OutOfSync,
}

struct Inner {
    bits: Vec<u64>,
    len_bits: u64,
    /// Coalescing cache: region currently accumulating sub-block writes.
    sb_bitnr: u64,
    sb_mask: u64,
    /// Scan cursor: current region and next sub-block within it.
    gb_bitnr: u64,
    gb_snr: u64,
}

pub struct Bitmap {
    inner: Mutex<Inner>,
}

impl Bitmap {
    /// Allocate a map for a device of `size_kib`; `None` for an empty device.
    pub fn new(size_kib: u64) -> Option<Self> {
        if size_kib == 0 {
            return None;
        }
        let len_bits = size_kib.div_ceil(BM_BLOCK_SIZE >> 10);
        let words = len_bits.div_ceil(64) as usize;
        Some(Self {
            inner: Mutex::new(Inner {
                bits: vec![0; words],
                len_bits,
                sb_bitnr: 0,
                sb_mask: 0,
                gb_bitnr: 0,
                gb_snr: 0,
            }),
        })
    }

    /// Record the replication status of one device block.
    ///
    /// `block_shift` is log2 of the current device block size and must not
    /// exceed the map granularity.
    pub fn set_block_status(&self, block_nr: u64, block_shift: u32, status: BlockStatus) {
        debug_assert!((9..=BM_BLOCK_SHIFT).contains(&block_shift));
        let cb = BM_BLOCK_SHIFT - block_shift;
        let bitnr = block_nr >> cb;

        let mut inner = self.inner.lock().expect("bitmap lock poisoned");

        match status {
            BlockStatus::InSync if cb > 0 => {
                if inner.sb_bitnr == bitnr {
                    inner.sb_mask |= 1u64 << (block_nr & ((1 << cb) - 1));
                    if inner.sb_mask != (1u64 << (1 << cb)) - 1 {
                        return;
                    }
                } else {
                    inner.sb_bitnr = bitnr;
                    inner.sb_mask = 1u64 << (block_nr & ((1 << cb) - 1));
                    return;
                }
            }
            BlockStatus::OutOfSync if cb > 0 => {
                // A dirtied sub-block voids the accumulated in-sync evidence.
                if inner.sb_bitnr == bitnr {
                    inner.sb_mask = 0;
                }
            }
            _ => {}
        }

        if bitnr >= inner.len_bits {
            warn!(block_nr, bitnr, "bitmap too small for block");
            return;
        }
        let word = (bitnr >> 6) as usize;
        let mask = 1u64 << (bitnr & 63);
        match status {
            BlockStatus::InSync => inner.bits[word] &= !mask,
            BlockStatus::OutOfSync => inner.bits[word] |= mask,
        }
    }

    /// Next out-of-sync device block under the scan cursor, or [`SCAN_DONE`].
    ///
    /// Each set map bit expands to all of its sub-blocks at the current
    /// device block size.
    pub fn next_out_of_sync(&self, block_shift: u32) -> u64 {
        let cb = BM_BLOCK_SHIFT - block_shift;
        let mut inner = self.inner.lock().expect("bitmap lock poisoned");

        if inner.gb_snr >= 1 << cb {
            let nw = inner.bits.len();
            let start_w = (inner.gb_bitnr >> 6) as usize;
            let mut found = false;
            for wnr in start_w..nw {
                if inner.bits[wnr] == 0 {
                    continue;
                }
                let from = if wnr == start_w {
                    (inner.gb_bitnr & 63) as i32
                } else {
                    -1
                };
                let Some(bnr) = next_bit_in_word(inner.bits[wnr], from) else {
                    continue;
                };
                let bitnr = ((wnr as u64) << 6) + bnr as u64;
                if bitnr >= inner.len_bits {
                    break;
                }
                inner.gb_bitnr = bitnr;
                inner.gb_snr = 0;
                found = true;
                break;
            }
            if !found {
                return SCAN_DONE;
            }
        }

        let rv = (inner.gb_bitnr << cb) + inner.gb_snr;
        inner.gb_snr += 1;
        rv
    }

    /// Rewind the scan cursor to the start of the map.
    pub fn reset_cursor(&self, block_shift: u32) {
        let cb = BM_BLOCK_SHIFT - block_shift;
        let mut inner = self.inner.lock().expect("bitmap lock poisoned");
        inner.gb_bitnr = 0;
        // Emit region 0 directly when dirty; the search only looks past the
        // cursor position.
        inner.gb_snr = if inner.bits.first().is_some_and(|w| w & 1 != 0) {
            0
        } else {
            1 << cb
        };
    }

    /// Number of out-of-sync 4 KiB regions.
    pub fn dirty_regions(&self) -> u64 {
        let inner = self.inner.lock().expect("bitmap lock poisoned");
        inner.bits.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Whether the map region holding `block_nr` is out of sync.
    pub fn is_out_of_sync(&self, block_nr: u64, block_shift: u32) -> bool {
        let bitnr = block_nr >> (BM_BLOCK_SHIFT - block_shift);
        let inner = self.inner.lock().expect("bitmap lock poisoned");
        if bitnr >= inner.len_bits {
            return false;
        }
        inner.bits[(bitnr >> 6) as usize] & (1u64 << (bitnr & 63)) != 0
    }
}

/// Position of the lowest set bit strictly above `nr`, or `None`.
/// `nr == -1` scans the whole word.
fn next_bit_in_word(word: u64, nr: i32) -> Option<i32> {
    if nr >= 63 {
        return None;
    }
    let mut nr = nr + 1;
    let mut w = word >> nr;
    while w & 1 == 0 {
        if nr == 63 {
            return None;
        }
        w >>= 1;
        nr += 1;
    }
    Some(nr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_bit_skips_current_position() {
        assert_eq!(next_bit_in_word(0b1001, -1), Some(0));
        assert_eq!(next_bit_in_word(0b1001, 0), Some(3));
        assert_eq!(next_bit_in_word(0b1001, 3), None);
        assert_eq!(next_bit_in_word(1 << 63, 62), Some(63));
        assert_eq!(next_bit_in_word(0, -1), None);
    }

    #[test]
    fn full_block_writes_toggle_directly() {
        let bm = Bitmap::new(64).expect("non-empty");
        bm.set_block_status(3, BM_BLOCK_SHIFT, BlockStatus::OutOfSync);
        assert!(bm.is_out_of_sync(3, BM_BLOCK_SHIFT));
        bm.set_block_status(3, BM_BLOCK_SHIFT, BlockStatus::InSync);
        assert!(!bm.is_out_of_sync(3, BM_BLOCK_SHIFT));
    }
}
