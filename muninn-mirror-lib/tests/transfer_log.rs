use muninn_mirror_lib::tlog::{TransferLog, UnackedWrite};

#[test]
fn barriers_delimit_dependence_scans() {
    let tl = TransferLog::new(32);
    tl.add(1, 0);
    tl.add(2, 8);
    assert!(tl.dependence(0));
    assert!(tl.dependence(8));
    assert!(!tl.dependence(16));

    tl.add_barrier();
    // The scan stops at the barrier; earlier epochs no longer count.
    assert!(!tl.dependence(0));

    tl.add(3, 0);
    assert!(tl.dependence(0));
    assert!(!tl.dependence(8));
}

#[test]
fn release_consumes_exactly_one_epoch() {
    let tl = TransferLog::new(32);
    tl.add(1, 0);
    tl.add(2, 8);
    let b1 = tl.add_barrier();
    tl.add(3, 16);
    let b2 = tl.add_barrier();

    tl.release(b1, 2);
    // The second epoch is still scannable.
    assert!(tl.dependence(16) || !tl.is_empty());

    tl.release(b2, 1);
    // Only the consumed barrier sentinel remains.
    assert!(!tl.dependence(0));
    assert!(!tl.dependence(16));
}

#[test]
fn release_with_wrong_size_still_releases() {
    let tl = TransferLog::new(32);
    tl.add(1, 0);
    let b1 = tl.add_barrier();
    // Mismatching set size is a logged protocol anomaly, not a failure.
    tl.release(b1, 5);
    assert!(!tl.dependence(0));
}

#[test]
fn barrier_numbers_are_monotonic_and_nonzero() {
    let tl = TransferLog::new(64);
    let mut last = 0u32;
    for _ in 0..10 {
        let nr = tl.add_barrier();
        assert!(nr > last);
        assert_ne!(nr, 0);
        last = nr;
    }
}

#[test]
fn drain_returns_unacked_writes_in_order() {
    let tl = TransferLog::new(32);
    tl.add(1, 0);
    tl.add(2, 8);
    tl.add_barrier();
    tl.add(3, 16);

    let drained = tl.drain_clear();
    assert_eq!(
        drained,
        vec![
            UnackedWrite { block_id: 1, sector: 0 },
            UnackedWrite { block_id: 2, sector: 8 },
            UnackedWrite { block_id: 3, sector: 16 },
        ]
    );
    assert!(tl.is_empty());
    assert!(!tl.dependence(0));
}

#[test]
fn ring_wraps_around_capacity() {
    let tl = TransferLog::new(8);
    for round in 0..10u64 {
        tl.add(round + 1, round * 8);
        let nr = tl.add_barrier();
        tl.release(nr, 1);
    }
    // After many wrap-arounds the log still scans correctly.
    tl.add(99, 800);
    assert!(tl.dependence(800));
}
