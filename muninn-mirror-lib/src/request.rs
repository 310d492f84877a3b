//! Primary-side write request state machine.
//!
//! A replicated write completes to its submitter only when both halves have
//! finished: the local disk write, and the network half (per protocol: the
//! packet handed to the socket, a `RecvAck`, or a `WriteAck`). The halves
//! finish in either order from different tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct ReqState {
    net_done: bool,
    local_done: bool,
    ok: bool,
    finished: bool,
}

pub struct WriteRequest {
    pub id: u64,
    pub sector: u64,
    state: Mutex<ReqState>,
    done: Notify,
}

impl WriteRequest {
    fn new(id: u64, sector: u64, needs_net: bool) -> Self {
        Self {
            id,
            sector,
            state: Mutex::new(ReqState {
                net_done: !needs_net,
                local_done: false,
                ok: true,
                finished: false,
            }),
            done: Notify::new(),
        }
    }

    /// Mark the network half done. Returns true when this call finished the
    /// request.
    pub fn complete_net(&self, ok: bool) -> bool {
        self.complete(ok, true)
    }

    /// Mark the local disk half done. Returns true when this call finished
    /// the request.
    pub fn complete_local(&self, ok: bool) -> bool {
        self.complete(ok, false)
    }

    fn complete(&self, ok: bool, net_half: bool) -> bool {
        let mut st = self.state.lock().expect("request lock poisoned");
        if net_half {
            st.net_done = true;
        } else {
            st.local_done = true;
        }
        st.ok &= ok;
        if st.net_done && st.local_done && !st.finished {
            st.finished = true;
            drop(st);
            self.done.notify_waiters();
            true
        } else {
            false
        }
    }

    /// Wait until both halves are done; the result is the AND of both.
    pub async fn wait(&self) -> bool {
        loop {
            let notified = self.done.notified();
            {
                let st = self.state.lock().expect("request lock poisoned");
                if st.finished {
                    return st.ok;
                }
            }
            notified.await;
        }
    }
}

/// Table of writes whose network half is still outstanding, keyed by the
/// opaque `block_id` carried on the wire.
#[derive(Default)]
pub struct InflightTable {
    map: Mutex<HashMap<u64, Arc<WriteRequest>>>,
    next_id: AtomicU64,
}

impl InflightTable {
    /// Create a request that will travel the wire and track it.
    pub fn register(&self, sector: u64) -> Arc<WriteRequest> {
        // Ids start at 1: 0 is the Secondary's "already acknowledged" mark.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let req = Arc::new(WriteRequest::new(id, sector, true));
        self.map
            .lock()
            .expect("inflight lock poisoned")
            .insert(id, Arc::clone(&req));
        req
    }

    /// Create a purely local request (nothing goes on the wire).
    pub fn local_only(&self, sector: u64) -> Arc<WriteRequest> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(WriteRequest::new(id, sector, false))
    }

    /// Detach a request when its ack arrives (or will never arrive).
    pub fn take(&self, id: u64) -> Option<Arc<WriteRequest>> {
        self.map.lock().expect("inflight lock poisoned").remove(&id)
    }

    pub fn forget(&self, id: u64) {
        self.map.lock().expect("inflight lock poisoned").remove(&id);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("inflight lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
