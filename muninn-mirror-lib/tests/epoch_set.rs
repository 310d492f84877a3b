use std::sync::Arc;
use std::time::Duration;

use muninn_mirror_lib::epoch::{EpochSet, SyncLog, SyncSlot, SYNC_LOG_SLOTS};

#[tokio::test]
async fn drain_waits_for_every_write() {
    let epoch = Arc::new(EpochSet::new());
    let (t1, _) = epoch.push(0, 1).await;
    let (t2, size) = epoch.push(8, 2).await;
    assert_eq!(size, 2);

    epoch.mark_done(t1).await;

    // The barrier drain must hang until the second write lands.
    let pending = {
        let epoch = Arc::clone(&epoch);
        tokio::spawn(async move { epoch.drain().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    epoch.mark_done(t2).await;
    let (size, acks) = pending.await.expect("drain");
    assert_eq!(size, 2);
    assert_eq!(acks, vec![(0, 1), (8, 2)]);
    assert_eq!(epoch.len().await, 0);
}

#[tokio::test]
async fn harvested_acks_are_not_owed_twice() {
    let epoch = EpochSet::new();
    let (t1, _) = epoch.push(0, 1).await;
    let (t2, _) = epoch.push(8, 2).await;

    epoch.mark_done(t1).await;
    assert_eq!(epoch.harvest_acked().await, vec![(0, 1)]);
    // Nothing new completed; nothing to harvest.
    assert!(epoch.harvest_acked().await.is_empty());

    epoch.mark_done(t2).await;
    let (size, acks) = epoch.drain().await;
    assert_eq!(size, 2);
    // Only the un-harvested entry is still owed at the barrier.
    assert_eq!(acks, vec![(8, 2)]);
}

#[tokio::test]
async fn drain_of_an_empty_epoch_is_immediate() {
    let epoch = EpochSet::new();
    let (size, acks) = epoch.drain().await;
    assert_eq!(size, 0);
    assert!(acks.is_empty());
}

#[tokio::test]
async fn stale_completion_cannot_touch_the_next_epoch() {
    let epoch = EpochSet::new();
    let (old, _) = epoch.push(0, 1).await;
    epoch.clear().await;

    let (fresh, _) = epoch.push(16, 3).await;
    // The pre-clear token lands nowhere.
    epoch.mark_done(old).await;
    assert!(epoch.harvest_acked().await.is_empty());

    epoch.mark_done(fresh).await;
    assert_eq!(epoch.harvest_acked().await, vec![(16, 3)]);
}

#[tokio::test]
async fn sync_log_emits_acks_in_completion_order() {
    let log = SyncLog::new();
    let a = match log.insert(10).await {
        SyncSlot::Stored(t) => t,
        other => panic!("unexpected {other:?}"),
    };
    let b = match log.insert(20).await {
        SyncSlot::Stored(t) => t,
        other => panic!("unexpected {other:?}"),
    };

    // Completion order is b before a; the acks follow completions, not
    // arrivals.
    log.mark_done(b).await;
    assert_eq!(log.harvest().await, vec![20]);
    log.mark_done(a).await;
    assert_eq!(log.harvest().await, vec![10]);
    assert!(log.harvest().await.is_empty());
}

#[tokio::test]
async fn full_sync_log_evicts_a_completed_entry() {
    let log = SyncLog::new();
    let mut tokens = Vec::new();
    for block in 0..SYNC_LOG_SLOTS as u64 {
        match log.insert(block).await {
            SyncSlot::Stored(t) => tokens.push(t),
            other => panic!("unexpected {other:?}"),
        }
    }

    // Everything in flight: one more is an overflow.
    assert!(matches!(log.insert(999).await, SyncSlot::Overflow));

    // Once one write completed, its slot is reused and its ack handed out.
    log.mark_done(tokens[3]).await;
    match log.insert(1000).await {
        SyncSlot::Replaced { acked_block_nr, .. } => assert_eq!(acked_block_nr, 3),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn cleared_sync_log_ignores_stale_tokens() {
    let log = SyncLog::new();
    let old = match log.insert(5).await {
        SyncSlot::Stored(t) => t,
        other => panic!("unexpected {other:?}"),
    };
    log.clear().await;

    let _fresh = match log.insert(6).await {
        SyncSlot::Stored(t) => t,
        other => panic!("unexpected {other:?}"),
    };
    log.mark_done(old).await;
    assert!(log.harvest().await.is_empty());
}
