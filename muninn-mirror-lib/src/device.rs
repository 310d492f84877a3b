//! Per-device state and the device registry.
//!
//! Each replicated device is an owned value held in a registry keyed by its
//! minor number. All task state (connection, counters, logs, maps) hangs off
//! the device; the connection supervisor, async sender and syncer tasks each
//! hold an `Arc` of it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::bitmap::{Bitmap, BlockStatus};
use crate::config::{NetConfig, Protocol};
use crate::epoch::{EpochSet, SyncLog};
use crate::error::{MirrorError, Result};
use crate::lower::LowerDevice;
use crate::meta::MetaStore;
use crate::request::InflightTable;
use crate::task::TaskCtl;
use crate::timer::Watchdog;
use crate::tlog::TransferLog;

/// Block size every device starts with until the handshake renegotiates it.
pub const INITIAL_BLOCK_SHIFT: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Role {
    Primary = 0,
    Secondary = 1,
    Unknown = 2,
}

impl Role {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Role::Primary),
            1 => Some(Role::Secondary),
            2 => Some(Role::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Primary => "Primary",
            Role::Secondary => "Secondary",
            Role::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Connection state. The discriminant order is meaningful: everything at or
/// above `Connected` has a live, parameter-exchanged link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ConnState {
    Unconfigured = 0,
    StandAlone = 1,
    Unconnected = 2,
    Timeout = 3,
    BrokenPipe = 4,
    WFConnection = 5,
    WFReportParams = 6,
    Connected = 7,
    SyncingAll = 8,
    SyncingQuick = 9,
}

impl ConnState {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        use ConnState::*;
        Some(match v {
            0 => Unconfigured,
            1 => StandAlone,
            2 => Unconnected,
            3 => Timeout,
            4 => BrokenPipe,
            5 => WFConnection,
            6 => WFReportParams,
            7 => Connected,
            8 => SyncingAll,
            9 => SyncingQuick,
            _ => return None,
        })
    }

    pub fn is_syncing(self) -> bool {
        matches!(self, ConnState::SyncingAll | ConnState::SyncingQuick)
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Unconfigured => "Unconfigured",
            ConnState::StandAlone => "StandAlone",
            ConnState::Unconnected => "Unconnected",
            ConnState::Timeout => "Timeout",
            ConnState::BrokenPipe => "BrokenPipe",
            ConnState::WFConnection => "WFConnection",
            ConnState::WFReportParams => "WFReportParams",
            ConnState::Connected => "Connected",
            ConnState::SyncingAll => "SyncingAll",
            ConnState::SyncingQuick => "SyncingQuick",
        };
        write!(f, "{s}")
    }
}

/// Out-of-band duties for the async sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Work {
    /// Probe a silent peer.
    Ping,
    /// Tell the peer our disk is slow before its ack timer fires.
    Postpone,
    /// Drain a deferred barrier while the send path is idle.
    Barrier,
}

/// One established link to the peer. Dropped and rebuilt on every reconnect.
pub(crate) struct Connection {
    pub writer: Mutex<OwnedWriteHalf>,
    pub cancel: CancellationToken,
    /// Armed while acknowledgements are owed to us (Primary).
    pub ack_timer: Watchdog,
    /// Armed while acknowledgements are owed by us (Secondary).
    pub proc_timer: Watchdog,
    /// Armed across one blocking send.
    pub send_timer: Watchdog,
    pub work_tx: mpsc::Sender<Work>,
    /// Wakes the async sender to harvest completed writes.
    pub scan: Notify,
}

impl Connection {
    pub(crate) fn enqueue(&self, work: Work) {
        // A full queue only ever drops duplicates of pending duties.
        let _ = self.work_tx.try_send(work);
        self.scan.notify_waiters();
    }
}

/// Transfer statistics, all in KiB.
#[derive(Default)]
pub struct Counters {
    pub net_sent: AtomicU64,
    pub net_recv: AtomicU64,
    pub disk_write: AtomicU64,
    pub disk_read: AtomicU64,
}

pub(crate) struct DiskState {
    pub lower: Arc<LowerDevice>,
    pub panic_on_error: bool,
    pub user_size_kib: Option<u64>,
}

pub(crate) struct TaskHandle {
    pub ctl: Arc<TaskCtl>,
    pub join: JoinHandle<()>,
}

pub struct Device {
    minor: u32,
    role: StdMutex<Role>,
    peer_role: StdMutex<Role>,
    cstate_tx: watch::Sender<ConnState>,
    pub(crate) disk: StdMutex<Option<Arc<DiskState>>>,
    pub(crate) net: StdMutex<Option<NetConfig>>,
    meta: StdMutex<Option<Arc<MetaStore>>>,
    bitmap: StdMutex<Option<Arc<Bitmap>>>,
    pub(crate) tl: TransferLog,
    pub(crate) inflight: InflightTable,
    pub(crate) epoch: EpochSet,
    pub(crate) sync_log: SyncLog,
    block_shift: AtomicU32,
    size_kib: AtomicU64,
    /// Next sector the full-sync sweep will copy; 0 when no sweep runs.
    pub(crate) synced_to: AtomicU64,
    pub counters: Counters,
    pending: AtomicI64,
    unacked: AtomicI64,
    /// Signalled whenever pending or unacked reach zero.
    pub(crate) state_wait: Notify,
    /// Deferred barrier: the next data transmission is preceded by one.
    pub(crate) issue_barrier: AtomicBool,
    conn: StdMutex<Option<Arc<Connection>>>,
    pub(crate) receiver: Mutex<Option<TaskHandle>>,
    pub(crate) syncer: Mutex<Option<TaskHandle>>,
    open_cnt: AtomicU32,
    writer_present: AtomicBool,
    offline: AtomicBool,
}

impl Device {
    pub fn new(minor: u32) -> Arc<Self> {
        let (cstate_tx, _) = watch::channel(ConnState::Unconfigured);
        Arc::new(Self {
            minor,
            role: StdMutex::new(Role::Secondary),
            peer_role: StdMutex::new(Role::Unknown),
            cstate_tx,
            disk: StdMutex::new(None),
            net: StdMutex::new(None),
            meta: StdMutex::new(None),
            bitmap: StdMutex::new(None),
            tl: TransferLog::new(1),
            inflight: InflightTable::default(),
            epoch: EpochSet::new(),
            sync_log: SyncLog::new(),
            block_shift: AtomicU32::new(INITIAL_BLOCK_SHIFT),
            size_kib: AtomicU64::new(0),
            synced_to: AtomicU64::new(0),
            counters: Counters::default(),
            pending: AtomicI64::new(0),
            unacked: AtomicI64::new(0),
            state_wait: Notify::new(),
            issue_barrier: AtomicBool::new(false),
            conn: StdMutex::new(None),
            receiver: Mutex::new(None),
            syncer: Mutex::new(None),
            open_cnt: AtomicU32::new(0),
            writer_present: AtomicBool::new(false),
            offline: AtomicBool::new(false),
        })
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn cstate(&self) -> ConnState {
        *self.cstate_tx.borrow()
    }

    pub fn subscribe_cstate(&self) -> watch::Receiver<ConnState> {
        self.cstate_tx.subscribe()
    }

    pub(crate) fn set_cstate(&self, cs: ConnState) {
        self.cstate_tx.send_replace(cs);
    }

    pub fn role(&self) -> Role {
        *self.role.lock().expect("role lock poisoned")
    }

    pub(crate) fn set_role_raw(&self, role: Role) {
        *self.role.lock().expect("role lock poisoned") = role;
    }

    pub fn peer_role(&self) -> Role {
        *self.peer_role.lock().expect("role lock poisoned")
    }

    pub(crate) fn set_peer_role(&self, role: Role) {
        *self.peer_role.lock().expect("role lock poisoned") = role;
    }

    pub fn block_shift(&self) -> u32 {
        self.block_shift.load(Ordering::Acquire)
    }

    pub fn block_size(&self) -> usize {
        1 << self.block_shift()
    }

    pub(crate) fn set_block_shift(&self, shift: u32) {
        self.block_shift.store(shift, Ordering::Release);
    }

    /// Negotiated device size in KiB (0 until known).
    pub fn size_kib(&self) -> u64 {
        self.size_kib.load(Ordering::Acquire)
    }

    pub(crate) fn set_size_kib(&self, kib: u64) {
        self.size_kib.store(kib, Ordering::Release);
    }

    pub(crate) fn disk(&self) -> Option<Arc<DiskState>> {
        self.disk.lock().expect("disk lock poisoned").clone()
    }

    pub(crate) fn lower(&self) -> Option<Arc<LowerDevice>> {
        self.disk().map(|d| Arc::clone(&d.lower))
    }

    pub fn net_config(&self) -> Option<NetConfig> {
        self.net.lock().expect("net lock poisoned").clone()
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.net_config().map(|n| n.protocol)
    }

    pub(crate) fn meta(&self) -> Option<Arc<MetaStore>> {
        self.meta.lock().expect("meta lock poisoned").clone()
    }

    pub(crate) fn set_meta(&self, meta: Option<Arc<MetaStore>>) {
        *self.meta.lock().expect("meta lock poisoned") = meta;
    }

    pub fn bitmap(&self) -> Option<Arc<Bitmap>> {
        self.bitmap.lock().expect("bitmap lock poisoned").clone()
    }

    pub(crate) fn set_bitmap(&self, bm: Option<Arc<Bitmap>>) {
        *self.bitmap.lock().expect("bitmap lock poisoned") = bm;
    }

    /// Create the out-of-sync map once the device size is known.
    pub(crate) fn ensure_bitmap(&self) {
        let mut slot = self.bitmap.lock().expect("bitmap lock poisoned");
        if slot.is_none() {
            *slot = Bitmap::new(self.size_kib()).map(Arc::new);
        }
    }

    pub(crate) fn conn(&self) -> Option<Arc<Connection>> {
        self.conn.lock().expect("conn lock poisoned").clone()
    }

    pub(crate) fn set_conn(&self, conn: Option<Arc<Connection>>) {
        *self.conn.lock().expect("conn lock poisoned") = conn;
    }

    pub(crate) fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    /// Take the device fatally offline after a lower-device failure.
    pub(crate) fn go_offline(&self) {
        self.offline.store(true, Ordering::Release);
        error!(minor = self.minor, "lower device failed, device taken offline");
    }

    /// A fresh disk configuration clears a previous fatal-offline state.
    pub(crate) fn clear_offline(&self) {
        self.offline.store(false, Ordering::Release);
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn unacked(&self) -> i64 {
        self.unacked.load(Ordering::Acquire)
    }

    /// Account one acknowledgement owed to us and keep the ack timer alive.
    pub(crate) fn inc_pending(&self, conn: &Connection) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Some(t) = self.net_config().and_then(|n| n.timeout_duration()) {
            conn.ack_timer.arm(t);
        }
    }

    pub(crate) fn dec_pending(&self, conn: &Connection) {
        let left = self.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        if left < 0 {
            warn!(minor = self.minor, "pending count went negative");
        }
        if let Some(t) = self.net_config().and_then(|n| n.timeout_duration()) {
            if left > 0 {
                conn.ack_timer.arm(t);
            } else {
                conn.ack_timer.disarm();
            }
        }
        if left == 0 {
            self.state_wait.notify_waiters();
        }
    }

    pub(crate) fn reset_pending(&self) {
        self.pending.store(0, Ordering::Release);
        self.state_wait.notify_waiters();
    }

    /// Account one acknowledgement we owe and keep the processing timer
    /// alive; it fires at half the network timeout so our Postpone beats the
    /// peer's ack timer.
    pub(crate) fn inc_unacked(&self, conn: &Connection) {
        self.unacked.fetch_add(1, Ordering::AcqRel);
        if let Some(t) = self.net_config().and_then(|n| n.half_timeout_duration()) {
            conn.proc_timer.arm(t);
        }
    }

    pub(crate) fn dec_unacked(&self, conn: &Connection) {
        let left = self.unacked.fetch_sub(1, Ordering::AcqRel) - 1;
        if left < 0 {
            warn!(minor = self.minor, "unacked count went negative");
        }
        if let Some(t) = self.net_config().and_then(|n| n.half_timeout_duration()) {
            if left > 0 {
                conn.proc_timer.arm(t);
            } else {
                conn.proc_timer.disarm();
            }
        }
        if left == 0 {
            self.state_wait.notify_waiters();
        }
    }

    pub(crate) fn reset_unacked(&self) {
        self.unacked.store(0, Ordering::Release);
        self.state_wait.notify_waiters();
    }

    /// Wait until nothing is on the fly in either direction.
    pub(crate) async fn quiesce(&self) {
        loop {
            let notified = self.state_wait.notified();
            if self.pending() <= 0 && self.unacked() <= 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn mark_out_of_sync(&self, block_nr: u64) {
        if let Some(bm) = self.bitmap() {
            bm.set_block_status(block_nr, self.block_shift(), BlockStatus::OutOfSync);
        }
    }

    pub(crate) fn mark_in_sync(&self, block_nr: u64) {
        if let Some(bm) = self.bitmap() {
            bm.set_block_status(block_nr, self.block_shift(), BlockStatus::InSync);
        }
    }

    /// Called when a replicated write fully completes. A sector still
    /// present in the open epoch means later writes to it must be fenced
    /// behind a barrier; the flag is drained lazily by the next data
    /// transmission or by the async sender.
    pub(crate) fn on_request_finished(&self, sector: u64) {
        if self.role() != Role::Primary || self.cstate() < ConnState::Connected {
            return;
        }
        if self.tl.dependence(sector) {
            self.issue_barrier.store(true, Ordering::Release);
            if let Some(conn) = self.conn() {
                conn.enqueue(Work::Barrier);
            }
        }
    }

    /// Open the block-device surface. Writable opens are refused on a
    /// Secondary and pin the device in the Primary role until closed.
    pub fn open(&self, writable: bool) -> Result<()> {
        if writable {
            if self.role() == Role::Secondary {
                return Err(MirrorError::ReadOnly);
            }
            self.writer_present.store(true, Ordering::Release);
        }
        self.open_cnt.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn close(&self) {
        if self.open_cnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.writer_present.store(false, Ordering::Release);
        }
    }

    pub(crate) fn open_count(&self) -> u32 {
        self.open_cnt.load(Ordering::Acquire)
    }

    pub(crate) fn writer_present(&self) -> bool {
        self.writer_present.load(Ordering::Acquire)
    }

    pub(crate) fn add_kib(counter: &AtomicU64, bytes: usize) {
        counter.fetch_add((bytes >> 10) as u64, Ordering::Relaxed);
    }
}

impl Device {
    /// Submit one block write. Completes per the negotiated protocol: the
    /// local write always has to finish, and a replicated write additionally
    /// needs its network half (handed to the socket / RecvAck / WriteAck).
    pub async fn write(self: &Arc<Self>, sector: u64, data: bytes::Bytes) -> Result<()> {
        if self.is_offline() {
            return Err(MirrorError::Offline);
        }
        let disk = self.disk().ok_or(MirrorError::NotConfigured)?;
        if self.role() != Role::Primary {
            return Err(MirrorError::ReadOnly);
        }
        let block_nr = self.check_block_request(sector, Some(data.len()))?;

        Device::add_kib(&self.counters.disk_write, data.len());

        let conn = self.conn();
        // During a full sweep, writes below the sweep position will be
        // carried by the sweep itself; only the already-synced region
        // replicates inline.
        let sending = conn.is_some()
            && self.cstate() >= ConnState::Connected
            && sector >= self.synced_to.load(Ordering::Acquire);

        let req = if sending {
            self.inflight.register(sector)
        } else {
            self.inflight.local_only(sector)
        };

        {
            let dev = Arc::clone(self);
            let req = Arc::clone(&req);
            let disk = Arc::clone(&disk);
            let payload = data.clone();
            tokio::spawn(async move {
                let ok = disk.lower.write_block(block_nr, payload).await.is_ok();
                if !ok && disk.panic_on_error {
                    dev.go_offline();
                }
                if req.complete_local(ok) {
                    dev.on_request_finished(req.sector);
                }
            });
        }

        if sending {
            let conn = conn.expect("checked above");
            let sent = self
                .send_data(&conn, block_nr, req.id, data)
                .await
                .unwrap_or(false);
            if !sent || self.protocol() == Some(Protocol::A) {
                // Nothing more will come back for this request.
                self.inflight.forget(req.id);
                if req.complete_net(true) {
                    self.on_request_finished(sector);
                }
            }
        } else {
            self.mark_out_of_sync(block_nr);
        }

        if req.wait().await {
            Ok(())
        } else {
            Err(MirrorError::Io(std::io::Error::other(
                "lower device write failed",
            )))
        }
    }

    /// Read one block from the local lower device.
    pub async fn read(&self, sector: u64) -> Result<bytes::Bytes> {
        if self.is_offline() {
            return Err(MirrorError::Offline);
        }
        let disk = self.disk().ok_or(MirrorError::NotConfigured)?;
        let block_nr = self.check_block_request(sector, None)?;
        let result = disk.lower.read_block(block_nr, self.block_size()).await;
        match result {
            Ok(data) => {
                Device::add_kib(&self.counters.disk_read, data.len());
                Ok(data)
            }
            Err(e) => {
                if disk.panic_on_error {
                    self.go_offline();
                }
                Err(e)
            }
        }
    }

    /// Operations are block granular: one full block, block aligned, within
    /// the device.
    fn check_block_request(&self, sector: u64, len: Option<usize>) -> Result<u64> {
        let shift = self.block_shift();
        if let Some(len) = len {
            if len != self.block_size() {
                return Err(MirrorError::InvalidRequest(format!(
                    "length {len} does not match the {} byte block size",
                    self.block_size()
                )));
            }
        }
        if sector & ((1 << (shift - 9)) - 1) != 0 {
            return Err(MirrorError::InvalidRequest(format!(
                "sector {sector} is not block aligned"
            )));
        }
        let size_kib = self.size_kib();
        if size_kib > 0 && sector >= size_kib << 1 {
            return Err(MirrorError::InvalidRequest(format!(
                "sector {sector} is beyond the device end"
            )));
        }
        Ok(block_of_sector(sector, shift))
    }
}

/// All configured devices of this node, keyed by minor.
pub struct Registry {
    devices: StdMutex<Vec<Arc<Device>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            devices: StdMutex::new(Vec::new()),
        }
    }

    /// Get or create the device for `minor`.
    pub fn device(&self, minor: u32) -> Arc<Device> {
        let mut devices = self.devices.lock().expect("registry lock poisoned");
        if let Some(dev) = devices.iter().find(|d| d.minor == minor) {
            return Arc::clone(dev);
        }
        let dev = Device::new(minor);
        devices.push(Arc::clone(&dev));
        dev
    }

    pub fn get(&self, minor: u32) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .find(|d| d.minor == minor)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().expect("registry lock poisoned").clone()
    }

    /// Check a new link configuration against every other device.
    pub(crate) fn check_addr_conflicts(&self, minor: u32, net: &NetConfig) -> Result<()> {
        for dev in self.devices() {
            if dev.minor == minor || dev.cstate() == ConnState::Unconfigured {
                continue;
            }
            if let Some(other) = dev.net_config() {
                if other.my_addr == net.my_addr {
                    return Err(MirrorError::LocalAddrInUse(net.my_addr));
                }
                if other.peer_addr == net.peer_addr {
                    return Err(MirrorError::PeerAddrInUse(net.peer_addr));
                }
            }
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sector ↔ block conversions; sectors are 512 bytes.
pub(crate) fn sector_of_block(block_nr: u64, block_shift: u32) -> u64 {
    block_nr << (block_shift - 9)
}

pub(crate) fn block_of_sector(sector: u64, block_shift: u32) -> u64 {
    sector >> (block_shift - 9)
}

/// Sleep helper for loops that must stay responsive to task control.
pub(crate) async fn sleep_or_stop(ctl: &TaskCtl, d: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = ctl.stopped() => true,
    }
}
