use muninn_mirror_lib::bitmap::{Bitmap, BlockStatus, SCAN_DONE, BM_BLOCK_SHIFT};

/// 1 KiB device blocks: four sub-blocks per 4 KiB map region.
const SMALL_SHIFT: u32 = 10;

#[test]
fn sub_block_writes_coalesce_before_clearing() {
    let bm = Bitmap::new(256).expect("non-empty map");
    bm.set_block_status(0, BM_BLOCK_SHIFT, BlockStatus::OutOfSync);
    assert!(bm.is_out_of_sync(0, BM_BLOCK_SHIFT));

    // Three of four 1 KiB sub-blocks rewritten: region must stay dirty.
    for sub in 0..3u64 {
        bm.set_block_status(sub, SMALL_SHIFT, BlockStatus::InSync);
        assert!(bm.is_out_of_sync(0, SMALL_SHIFT), "cleared after sub-block {sub}");
    }
    // The fourth completes the region.
    bm.set_block_status(3, SMALL_SHIFT, BlockStatus::InSync);
    assert!(!bm.is_out_of_sync(0, SMALL_SHIFT));
}

#[test]
fn intervening_dirty_write_voids_the_coalescing() {
    let bm = Bitmap::new(256).expect("non-empty map");
    bm.set_block_status(0, BM_BLOCK_SHIFT, BlockStatus::OutOfSync);

    bm.set_block_status(0, SMALL_SHIFT, BlockStatus::InSync);
    bm.set_block_status(1, SMALL_SHIFT, BlockStatus::InSync);
    // A dirtying write in the middle of the region.
    bm.set_block_status(2, SMALL_SHIFT, BlockStatus::OutOfSync);
    bm.set_block_status(2, SMALL_SHIFT, BlockStatus::InSync);
    bm.set_block_status(3, SMALL_SHIFT, BlockStatus::InSync);

    // The early sub-blocks' evidence was voided; region stays dirty.
    assert!(bm.is_out_of_sync(0, SMALL_SHIFT));

    // A clean full pass clears it.
    for sub in 0..4u64 {
        bm.set_block_status(sub, SMALL_SHIFT, BlockStatus::InSync);
    }
    assert!(!bm.is_out_of_sync(0, SMALL_SHIFT));
}

#[test]
fn cursor_yields_every_dirty_block_once() {
    let bm = Bitmap::new(4096).expect("non-empty map");
    // Regions 0, 5, 64 and 1000 dirty (region == 4 KiB block here).
    for region in [0u64, 5, 64, 1000] {
        bm.set_block_status(region, BM_BLOCK_SHIFT, BlockStatus::OutOfSync);
    }

    bm.reset_cursor(BM_BLOCK_SHIFT);
    let mut seen = Vec::new();
    loop {
        match bm.next_out_of_sync(BM_BLOCK_SHIFT) {
            SCAN_DONE => break,
            block => seen.push(block),
        }
    }
    assert_eq!(seen, vec![0, 5, 64, 1000]);
}

#[test]
fn cursor_expands_regions_into_sub_blocks() {
    let bm = Bitmap::new(64).expect("non-empty map");
    bm.set_block_status(1, BM_BLOCK_SHIFT, BlockStatus::OutOfSync);

    bm.reset_cursor(SMALL_SHIFT);
    let mut seen = Vec::new();
    loop {
        match bm.next_out_of_sync(SMALL_SHIFT) {
            SCAN_DONE => break,
            block => seen.push(block),
        }
    }
    // Region 1 at 1 KiB granularity is blocks 4..8.
    assert_eq!(seen, vec![4, 5, 6, 7]);
}

#[test]
fn reset_rewinds_a_finished_cursor() {
    let bm = Bitmap::new(64).expect("non-empty map");
    bm.set_block_status(2, BM_BLOCK_SHIFT, BlockStatus::OutOfSync);

    bm.reset_cursor(BM_BLOCK_SHIFT);
    assert_eq!(bm.next_out_of_sync(BM_BLOCK_SHIFT), 2);
    assert_eq!(bm.next_out_of_sync(BM_BLOCK_SHIFT), SCAN_DONE);

    bm.reset_cursor(BM_BLOCK_SHIFT);
    assert_eq!(bm.next_out_of_sync(BM_BLOCK_SHIFT), 2);
}

#[test]
fn dirty_region_count_tracks_set_bits() {
    let bm = Bitmap::new(1024).expect("non-empty map");
    assert_eq!(bm.dirty_regions(), 0);
    for region in 0..10u64 {
        bm.set_block_status(region, BM_BLOCK_SHIFT, BlockStatus::OutOfSync);
    }
    assert_eq!(bm.dirty_regions(), 10);
    bm.set_block_status(4, BM_BLOCK_SHIFT, BlockStatus::InSync);
    assert_eq!(bm.dirty_regions(), 9);
}

#[test]
fn empty_device_has_no_map() {
    assert!(Bitmap::new(0).is_none());
}
