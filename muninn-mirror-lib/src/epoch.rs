//! Secondary-side bookkeeping for received writes.
//!
//! The epoch set holds every application write of the wire epoch currently
//! open; a Barrier drains it (waits for the local writes, settles the
//! outstanding acks) before the barrier ack goes out. The sync log is a
//! small fixed-size set of in-flight *resync* writes, so their acks can be
//! emitted in local completion order instead of arrival order.

use tokio::sync::{Mutex, Notify};
use tracing::error;

/// Capacity of the sync log.
pub const SYNC_LOG_SLOTS: usize = 80;

#[derive(Debug, Clone, Copy)]
struct EpochEntry {
    block_nr: u64,
    /// The Primary's request handle; zeroed once its ack went out.
    block_id: u64,
    done: bool,
}

pub struct EpochSet {
    entries: Mutex<EpochState>,
    completed: Notify,
}

struct EpochState {
    entries: Vec<EpochEntry>,
    /// Bumped whenever the set empties, so a completion racing a clear
    /// cannot touch a slot the next epoch reused.
    generation: u64,
}

/// Handle for reporting a slot's local write completion.
#[derive(Debug, Clone, Copy)]
pub struct EpochToken {
    generation: u64,
    slot: usize,
}

/// An ack owed to the peer: `(block_nr, block_id)`.
pub type PendingAck = (u64, u64);

impl EpochSet {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(EpochState { entries: Vec::new(), generation: 0 }),
            completed: Notify::new(),
        }
    }

    /// Append a freshly received write; returns its completion token and
    /// the new epoch size.
    pub async fn push(&self, block_nr: u64, block_id: u64) -> (EpochToken, usize) {
        let mut st = self.entries.lock().await;
        st.entries.push(EpochEntry {
            block_nr,
            block_id,
            done: false,
        });
        let token = EpochToken {
            generation: st.generation,
            slot: st.entries.len() - 1,
        };
        (token, st.entries.len())
    }

    /// Record local write completion for a slot.
    pub async fn mark_done(&self, token: EpochToken) {
        let mut st = self.entries.lock().await;
        if st.generation == token.generation {
            if let Some(e) = st.entries.get_mut(token.slot) {
                e.done = true;
            }
        }
        drop(st);
        self.completed.notify_waiters();
    }

    /// Completed entries whose ack has not been sent yet; marks them acked.
    pub async fn harvest_acked(&self) -> Vec<PendingAck> {
        let mut st = self.entries.lock().await;
        let mut acks = Vec::new();
        for e in st.entries.iter_mut() {
            if e.done && e.block_id != 0 {
                acks.push((e.block_nr, e.block_id));
                e.block_id = 0;
            }
        }
        acks
    }

    /// Wait for every write of the epoch to hit the lower device, then empty
    /// the set. Returns the epoch size and the acks still owed.
    pub async fn drain(&self) -> (usize, Vec<PendingAck>) {
        loop {
            let notified = self.completed.notified();
            {
                let mut st = self.entries.lock().await;
                if st.entries.iter().all(|e| e.done) {
                    let size = st.entries.len();
                    let acks = st
                        .entries
                        .iter()
                        .filter(|e| e.block_id != 0)
                        .map(|e| (e.block_nr, e.block_id))
                        .collect();
                    st.entries.clear();
                    st.generation += 1;
                    return (size, acks);
                }
            }
            notified.await;
        }
    }

    /// Throw the epoch away on disconnect; in-flight lower-device writes
    /// keep running but nothing will be acknowledged.
    pub async fn clear(&self) -> usize {
        let mut st = self.entries.lock().await;
        let dropped = st.entries.len();
        st.entries.clear();
        st.generation += 1;
        self.completed.notify_waiters();
        dropped
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.entries.len()
    }
}

impl Default for EpochSet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct SyncEntry {
    block_nr: u64,
    done: bool,
}

/// Handle for reporting a resync write's local completion.
#[derive(Debug, Clone, Copy)]
pub struct SyncToken {
    generation: u64,
    slot: usize,
}

/// Outcome of inserting a resync write into the sync log.
#[derive(Debug, Clone, Copy)]
pub enum SyncSlot {
    /// Tracked.
    Stored(SyncToken),
    /// Tracked after evicting a completed entry whose ack the caller must
    /// emit now.
    Replaced {
        token: SyncToken,
        acked_block_nr: u64,
    },
    /// No room; the write proceeds untracked and its ack is dropped, so the
    /// peer will resync the block again.
    Overflow,
}

pub struct SyncLog {
    slots: Mutex<SyncState>,
}

struct SyncState {
    slots: Vec<Option<SyncEntry>>,
    generation: u64,
}

impl SyncLog {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(SyncState {
                slots: vec![None; SYNC_LOG_SLOTS],
                generation: 0,
            }),
        }
    }

    pub async fn insert(&self, block_nr: u64) -> SyncSlot {
        let mut st = self.slots.lock().await;
        let generation = st.generation;
        let mut completed = None;
        for i in 0..st.slots.len() {
            match st.slots[i] {
                None => {
                    st.slots[i] = Some(SyncEntry { block_nr, done: false });
                    return SyncSlot::Stored(SyncToken { generation, slot: i });
                }
                Some(e) if e.done && completed.is_none() => completed = Some(i),
                Some(_) => {}
            }
        }
        if let Some(i) = completed {
            let acked_block_nr = st.slots[i].expect("checked above").block_nr;
            st.slots[i] = Some(SyncEntry { block_nr, done: false });
            return SyncSlot::Replaced {
                token: SyncToken { generation, slot: i },
                acked_block_nr,
            };
        }
        error!("sync log full, dropping resync ack");
        SyncSlot::Overflow
    }

    pub async fn mark_done(&self, token: SyncToken) {
        let mut st = self.slots.lock().await;
        if st.generation != token.generation {
            return;
        }
        if let Some(Some(e)) = st.slots.get_mut(token.slot) {
            e.done = true;
        }
    }

    /// Remove and return every completed entry, in slot order.
    pub async fn harvest(&self) -> Vec<u64> {
        let mut st = self.slots.lock().await;
        let mut out = Vec::new();
        for slot in st.slots.iter_mut() {
            if let Some(e) = slot {
                if e.done {
                    out.push(e.block_nr);
                    *slot = None;
                }
            }
        }
        out
    }

    pub async fn clear(&self) {
        let mut st = self.slots.lock().await;
        for slot in st.slots.iter_mut() {
            *slot = None;
        }
        st.generation += 1;
    }
}

impl Default for SyncLog {
    fn default() -> Self {
        Self::new()
    }
}
