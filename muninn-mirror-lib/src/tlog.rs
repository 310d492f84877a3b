//! Transfer log: the Primary's ring of in-flight writes and barrier markers.
//!
//! Entries are appended in transmission order; a barrier entry closes an
//! epoch. The ring is released one epoch at a time when the matching
//! `BarrierAck` arrives, and drained wholesale on disconnect so the dirtied
//! ranges can be re-synchronised later.

use std::sync::RwLock;

use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Write { block_id: u64, sector: u64 },
    Barrier { nr: u32 },
}

struct Ring {
    entries: Vec<Option<Entry>>,
    begin: usize,
    end: usize,
    next_barrier: u32,
}

impl Ring {
    fn advance(&self, idx: usize) -> usize {
        let idx = idx + 1;
        if idx == self.entries.len() {
            0
        } else {
            idx
        }
    }

    fn retreat(&self, idx: usize) -> usize {
        if idx == 0 {
            self.entries.len() - 1
        } else {
            idx - 1
        }
    }

    fn push(&mut self, entry: Entry) {
        self.entries[self.end] = Some(entry);
        self.end = self.advance(self.end);
        if self.end == self.begin {
            // Overflow is a configuration error; the ring keeps going and
            // the oldest epoch is clobbered.
            error!("transfer log too small");
        }
    }
}

pub struct TransferLog {
    ring: RwLock<Ring>,
}

/// A data entry drained from the log on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnackedWrite {
    pub block_id: u64,
    pub sector: u64,
}

impl TransferLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring {
                entries: vec![None; capacity.max(1)],
                begin: 0,
                end: 0,
                next_barrier: 0,
            }),
        }
    }

    /// Replace the ring with an empty one of `capacity` entries.
    pub fn reset_capacity(&self, capacity: usize) {
        let mut ring = self.ring.write().expect("tl lock poisoned");
        ring.entries = vec![None; capacity.max(1)];
        ring.begin = 0;
        ring.end = 0;
    }

    /// Record a transmitted write. Must be called while holding the send
    /// mutex so the ring order matches the wire order.
    pub fn add(&self, block_id: u64, sector: u64) {
        let mut ring = self.ring.write().expect("tl lock poisoned");
        ring.push(Entry::Write { block_id, sector });
    }

    /// Record a transmitted barrier and allocate its number. Must be called
    /// while holding the send mutex, immediately before the barrier packet
    /// is written.
    pub fn add_barrier(&self) -> u32 {
        let mut ring = self.ring.write().expect("tl lock poisoned");
        ring.next_barrier = ring.next_barrier.wrapping_add(1);
        if ring.next_barrier == 0 {
            ring.next_barrier = 1;
        }
        let nr = ring.next_barrier;
        ring.push(Entry::Barrier { nr });
        nr
    }

    /// Release everything up to and including the barrier acknowledged by
    /// the peer. Number and epoch-size mismatches are logged but the
    /// release happens regardless.
    pub fn release(&self, barrier_nr: u32, set_size: u32) {
        let mut ring = self.ring.write().expect("tl lock poisoned");
        let mut epoch_size: i64 = 0;
        if let Some(Entry::Barrier { .. }) = ring.entries[ring.begin] {
            epoch_size -= 1;
        }
        loop {
            let begin = ring.begin;
            ring.entries[begin] = None;
            ring.begin = ring.advance(ring.begin);
            if ring.begin == ring.end {
                error!(barrier_nr, "transfer log out of step with barrier acks");
                return;
            }
            epoch_size += 1;
            match ring.entries[ring.begin] {
                Some(Entry::Barrier { nr }) => {
                    if nr != barrier_nr {
                        error!(found = nr, reported = barrier_nr, "barrier number mismatch");
                    }
                    break;
                }
                Some(Entry::Write { .. }) => continue,
                None => {
                    error!(barrier_nr, "transfer log hole during release");
                    return;
                }
            }
        }
        if epoch_size != i64::from(set_size) {
            warn!(found = epoch_size, reported = set_size, "epoch set size mismatch");
        }
    }

    /// Whether `sector` was written in the epoch still open at the tail of
    /// the log. Read-only; safe to call from completion context.
    pub fn dependence(&self, sector: u64) -> bool {
        let ring = self.ring.read().expect("tl lock poisoned");
        let mut p = ring.end;
        loop {
            if p == ring.begin {
                return false;
            }
            p = ring.retreat(p);
            match ring.entries[p] {
                Some(Entry::Barrier { .. }) | None => return false,
                Some(Entry::Write { sector: s, .. }) if s == sector => return true,
                Some(Entry::Write { .. }) => continue,
            }
        }
    }

    /// Drain the ring on disconnect, returning every data entry so the
    /// caller can mark its range out-of-sync and settle the request.
    pub fn drain_clear(&self) -> Vec<UnackedWrite> {
        let mut ring = self.ring.write().expect("tl lock poisoned");
        let mut out = Vec::new();
        let mut p = ring.begin;
        while p != ring.end {
            if let Some(Entry::Write { block_id, sector }) = ring.entries[p] {
                out.push(UnackedWrite { block_id, sector });
            }
            ring.entries[p] = None;
            p = ring.advance(p);
        }
        ring.begin = 0;
        ring.end = 0;
        out
    }

    pub fn is_empty(&self) -> bool {
        let ring = self.ring.read().expect("tl lock poisoned");
        ring.begin == ring.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_numbers_skip_zero_on_wrap() {
        let tl = TransferLog::new(16);
        {
            let mut ring = tl.ring.write().expect("lock");
            ring.next_barrier = u32::MAX - 1;
        }
        assert_eq!(tl.add_barrier(), u32::MAX);
        assert_eq!(tl.add_barrier(), 1);
    }
}
