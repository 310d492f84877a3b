//! Persistent generation counters.
//!
//! Five 32-bit counters plus a magic word, stored big-endian in a fixed
//! 24-byte file per device. Their lexicographic comparison elects a Primary
//! between two Secondaries, and the snapshot taken at disconnect time
//! decides whether a quick (bitmap-driven) resync is sufficient after
//! reconnect.

use std::cmp::Ordering;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{error, info};

use crate::wire::{GEN_CNT_LEN, MAGIC};

/// Indices into the generation counter array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GenIdx {
    /// 1 iff the local data is a complete, valid replica.
    Consistent = 0,
    /// Bumped on explicit forced promotion.
    HumanCnt = 1,
    /// Bumped on promotion while connected, and on Primary-side disconnect.
    ConnectedCnt = 2,
    /// Bumped on promotion while disconnected.
    ArbitraryCnt = 3,
    /// 1 iff the role was Primary at the last write.
    PrimaryInd = 4,
}

const FILE_LEN: usize = 4 * (GEN_CNT_LEN + 1);

struct State {
    gen: [u32; GEN_CNT_LEN],
    /// Copy taken at disconnect: the counters at which the bitmap began
    /// tracking out-of-sync blocks.
    bitmap_gen: [u32; GEN_CNT_LEN],
}

pub struct MetaStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl MetaStore {
    /// File path for a device, `<dir>/muninn<minor>.md`.
    pub fn file_path(dir: &Path, minor: u32) -> PathBuf {
        dir.join(format!("muninn{minor}.md"))
    }

    /// Load the counters for a device, initialising the file when it is
    /// missing or corrupt (bad magic or short read).
    pub fn open(dir: &Path, minor: u32, primary: bool) -> Self {
        let store = Self {
            path: Self::file_path(dir, minor),
            state: Mutex::new(State {
                gen: [0; GEN_CNT_LEN],
                bitmap_gen: [0; GEN_CNT_LEN],
            }),
        };
        match store.load() {
            Ok(gen) => {
                store.state.lock().expect("meta lock poisoned").gen = gen;
            }
            Err(e) => {
                info!(path = %store.path.display(), error = %e, "initialising meta-data file");
                {
                    let mut st = store.state.lock().expect("meta lock poisoned");
                    st.gen = [1, 1, 1, 1, u32::from(primary)];
                }
                store.write(primary);
            }
        }
        store
    }

    fn load(&self) -> std::io::Result<[u32; GEN_CNT_LEN]> {
        let mut f = fs::File::open(&self.path)?;
        let mut buf = [0u8; FILE_LEN];
        f.read_exact(&mut buf)?;
        let mut b = &buf[..];
        let mut gen = [0u32; GEN_CNT_LEN];
        for g in gen.iter_mut() {
            *g = b.get_u32();
        }
        if b.get_u32() != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "magic mismatch",
            ));
        }
        Ok(gen)
    }

    /// Persist the counters, refreshing `PrimaryInd` from the current role.
    /// Failures are logged; replication keeps running on stale meta-data.
    pub fn write(&self, primary: bool) {
        let buf = {
            let mut st = self.state.lock().expect("meta lock poisoned");
            st.gen[GenIdx::PrimaryInd as usize] = u32::from(primary);
            let mut buf = BytesMut::with_capacity(FILE_LEN);
            for g in st.gen {
                buf.put_u32(g);
            }
            buf.put_u32(MAGIC);
            buf
        };
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(&self.path, &buf) {
            error!(path = %self.path.display(), error = %e, "error writing meta-data file");
        }
    }

    /// Increment one counter and persist.
    pub fn inc(&self, idx: GenIdx, primary: bool) {
        {
            let mut st = self.state.lock().expect("meta lock poisoned");
            st.gen[idx as usize] += 1;
        }
        self.write(primary);
    }

    /// Set or clear the consistency flag and persist.
    pub fn set_consistent(&self, consistent: bool, primary: bool) {
        {
            let mut st = self.state.lock().expect("meta lock poisoned");
            st.gen[GenIdx::Consistent as usize] = u32::from(consistent);
        }
        self.write(primary);
    }

    pub fn consistent(&self) -> bool {
        let st = self.state.lock().expect("meta lock poisoned");
        st.gen[GenIdx::Consistent as usize] != 0
    }

    /// Adopt the peer's counters verbatim (Secondary side of a handshake).
    pub fn adopt(&self, gen: [u32; GEN_CNT_LEN], primary: bool) {
        {
            let mut st = self.state.lock().expect("meta lock poisoned");
            st.gen = gen;
        }
        self.write(primary);
    }

    pub fn gen(&self) -> [u32; GEN_CNT_LEN] {
        self.state.lock().expect("meta lock poisoned").gen
    }

    /// Snapshot the counters as the bitmap-tracking baseline (disconnect).
    pub fn snapshot_bitmap_gen(&self) {
        let mut st = self.state.lock().expect("meta lock poisoned");
        st.bitmap_gen = st.gen;
    }

    pub fn bitmap_gen(&self) -> [u32; GEN_CNT_LEN] {
        self.state.lock().expect("meta lock poisoned").bitmap_gen
    }

    /// Lexicographic comparison against the peer's counters, in the order
    /// Consistent, HumanCnt, ConnectedCnt, ArbitraryCnt, PrimaryInd.
    /// `Greater` means the local data is authoritative.
    pub fn compare(&self, peer: &[u32; GEN_CNT_LEN]) -> Ordering {
        let st = self.state.lock().expect("meta lock poisoned");
        for (me, other) in st.gen.iter().zip(peer.iter()) {
            match me.cmp(other) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    /// Whether a bitmap-driven quick resync suffices: the peer was never
    /// Primary since we last tracked it, and its counters match the state
    /// at which our bitmap began tracking.
    pub fn quick_sync_ok(&self, peer: &[u32; GEN_CNT_LEN]) -> bool {
        if peer[GenIdx::PrimaryInd as usize] == 1 {
            return false;
        }
        let st = self.state.lock().expect("meta lock poisoned");
        for i in GenIdx::HumanCnt as usize..=GenIdx::ArbitraryCnt as usize {
            if st.bitmap_gen[i] != peer[i] {
                return false;
            }
        }
        true
    }
}
