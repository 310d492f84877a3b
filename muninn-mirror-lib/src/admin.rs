//! Administrative surface: the typed command set a management tool drives.
//!
//! Configuration errors come back as typed values and leave the device
//! state untouched; state-changing commands serialize against the running
//! tasks and wait for in-flight traffic where the original semantics
//! require it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::info;

use crate::config::{validate_net, DiskConfig, NetConfig};
use crate::device::{ConnState, Device, Registry, Role, INITIAL_BLOCK_SHIFT};
use crate::error::{MirrorError, Result};
use crate::lower::LowerDevice;
use crate::meta::{GenIdx, MetaStore};
use crate::receive;
use crate::task::TaskState;
use crate::wire::{Packet, WIRE_VERSION};

/// Version reported to management tools; also the handshake version.
pub fn version() -> u32 {
    WIRE_VERSION
}

/// Snapshot of a device's configuration as handed back to management
/// tools.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub cstate: ConnState,
    pub role: Role,
    pub lower_path: Option<std::path::PathBuf>,
    pub size_hint_kib: Option<u64>,
    pub panic_on_disk_error: bool,
    pub net: Option<NetConfig>,
}

impl Device {
    /// Attach the lower device and load the meta-data. Tears down any
    /// previous configuration of this device first.
    pub async fn configure_disk(
        self: &Arc<Self>,
        cfg: &DiskConfig,
        meta_dir: &Path,
    ) -> Result<()> {
        if self.open_count() > 1 {
            return Err(MirrorError::DeviceBusy);
        }

        self.stop_tasks().await;

        // Keep the previous lower device claimed until the new one opened,
        // so a bad configuration leaves the device on its old disk. Only a
        // reconfiguration onto the same path releases it first.
        let prev = self.disk.lock().expect("disk lock poisoned").take();
        let lower = match LowerDevice::open(&cfg.path, cfg.size_kib) {
            Ok(lower) => {
                drop(prev);
                lower
            }
            Err(MirrorError::LowerDeviceInUse(ref p))
                if prev
                    .as_ref()
                    .is_some_and(|d| d.lower.path() == p.as_path()) =>
            {
                drop(prev);
                LowerDevice::open(&cfg.path, cfg.size_kib)?
            }
            Err(e) => {
                *self.disk.lock().expect("disk lock poisoned") = prev;
                return Err(e);
            }
        };

        {
            let mut disk = self.disk.lock().expect("disk lock poisoned");
            *disk = Some(Arc::new(crate::device::DiskState {
                lower: Arc::new(lower),
                panic_on_error: cfg.panic_on_disk_error,
                user_size_kib: cfg.size_kib,
            }));
        }
        self.set_block_shift(INITIAL_BLOCK_SHIFT);
        self.clear_offline();

        let size_kib = self
            .disk()
            .map(|d| d.lower.size_kib())
            .unwrap_or_default();
        self.set_size_kib(size_kib);
        if cfg.size_kib.is_some() {
            info!(minor = self.minor(), size_kib, "user provided device size");
            self.ensure_bitmap();
        }

        self.set_cstate(ConnState::StandAlone);
        let meta = MetaStore::open(meta_dir, self.minor(), self.role() == Role::Primary);
        self.set_meta(Some(Arc::new(meta)));
        Ok(())
    }

    /// Store the link configuration and start the connection supervisor.
    pub async fn configure_net(self: &Arc<Self>, cfg: NetConfig) -> Result<()> {
        validate_net(&cfg)?;
        if self.disk().is_none() {
            return Err(MirrorError::NotConfigured);
        }

        self.stop_tasks().await;

        self.tl.reset_capacity(cfg.tl_size);
        {
            let mut net = self.net.lock().expect("net lock poisoned");
            *net = Some(cfg);
        }
        self.set_cstate(ConnState::Unconnected);
        let mut receiver = self.receiver.lock().await;
        *receiver = Some(receive::spawn(Arc::clone(self)));
        Ok(())
    }

    /// Drop the link but keep the disk: back to stand-alone operation.
    pub async fn unconfigure_net(self: &Arc<Self>) -> Result<()> {
        if self.cstate() == ConnState::Unconfigured {
            return Err(MirrorError::NotConfigured);
        }
        self.stop_tasks().await;
        self.set_cstate(ConnState::StandAlone);
        Ok(())
    }

    /// Full teardown: link, lower device, bitmap, meta-data.
    pub async fn unconfigure_all(self: &Arc<Self>) -> Result<()> {
        if self.cstate() == ConnState::Unconfigured {
            return Err(MirrorError::NotConfigured);
        }
        if self.open_count() > 1 {
            return Err(MirrorError::DeviceBusy);
        }
        self.stop_tasks().await;
        {
            let mut net = self.net.lock().expect("net lock poisoned");
            *net = None;
        }
        {
            let mut disk = self.disk.lock().expect("disk lock poisoned");
            *disk = None;
        }
        self.set_bitmap(None);
        self.set_meta(None);
        self.set_cstate(ConnState::Unconfigured);
        Ok(())
    }

    /// Stop the syncer and the connection supervisor, tearing down the
    /// socket. Teardown order matters: resync first, then the link tasks,
    /// then the socket goes with the connection.
    pub(crate) async fn stop_tasks(self: &Arc<Self>) {
        if let Some(handle) = self.syncer.lock().await.take() {
            handle.ctl.request(TaskState::Exiting);
            if let Some(conn) = self.conn() {
                conn.cancel.cancel();
            }
            let _ = handle.join.await;
        }
        if let Some(handle) = self.receiver.lock().await.take() {
            handle.ctl.request(TaskState::Exiting);
            if let Some(conn) = self.conn() {
                conn.cancel.cancel();
            }
            let _ = handle.join.await;
        }
        self.set_conn(None);
    }

    /// Change the role. `force` is the human override that additionally
    /// bumps the human-intervention counter.
    ///
    /// Waits until nothing is in flight in either direction; refused while
    /// a resync runs, and demotion is refused while a writer holds the
    /// device open.
    pub async fn set_role(self: &Arc<Self>, new_role: Role, force: bool) -> Result<()> {
        if new_role == self.role() {
            return Ok(());
        }
        if self.cstate().is_syncing() {
            return Err(MirrorError::SyncInProgress);
        }
        if new_role == Role::Secondary && self.writer_present() {
            return Err(MirrorError::DeviceBusy);
        }

        // Drain in-flight traffic, but bounded: the receive loop itself may
        // be the caller (handshake tie-break, peer-requested demotion), and
        // an unanswered probe must not wedge it. Anything still outstanding
        // after a full timeout is as good as lost.
        let drain = self
            .net_config()
            .and_then(|n| n.timeout_duration())
            .unwrap_or(Duration::from_secs(60));
        if tokio::time::timeout(drain, self.quiesce()).await.is_err() {
            tracing::warn!(
                minor = self.minor(),
                pending = self.pending(),
                unacked = self.unacked(),
                "changing role with traffic still in flight"
            );
        }

        self.set_role_raw(new_role);
        if let Some(meta) = self.meta() {
            let primary = new_role == Role::Primary;
            if force {
                meta.inc(GenIdx::HumanCnt, primary);
            }
            if primary {
                let idx = if self.cstate() >= ConnState::Connected {
                    GenIdx::ConnectedCnt
                } else {
                    GenIdx::ArbitraryCnt
                };
                meta.inc(idx, primary);
            } else {
                meta.write(primary);
            }
        }
        info!(minor = self.minor(), role = %new_role, "role changed");

        if self.cstate() >= ConnState::WFReportParams {
            if let Some(conn) = self.conn() {
                self.send_param(&conn).await?;
            }
        }
        Ok(())
    }

    /// Block until the link reaches `Connected` (or better), a terminal
    /// state, or the deadline. `None` waits forever. Returns whether the
    /// link is up.
    pub async fn wait_connect(&self, wait: Option<Duration>) -> bool {
        let deadline = wait.map(|d| Instant::now() + d);
        let mut rx = self.subscribe_cstate();
        loop {
            let cs = *rx.borrow_and_update();
            if !(ConnState::Unconnected..ConnState::Connected).contains(&cs) {
                return cs >= ConnState::Connected;
            }
            let changed = rx.changed();
            let timed_out = match deadline {
                Some(dl) => timeout_at(dl, changed).await.is_err(),
                None => {
                    let _ = changed.await;
                    false
                }
            };
            if timed_out {
                return self.cstate() >= ConnState::Connected;
            }
        }
    }

    /// Block until any resynchronisation finished and the link sits at
    /// `Connected`. The deadline is suspended while a resync is actually
    /// running. Returns whether the device ended up connected.
    pub async fn wait_sync(&self, wait: Option<Duration>) -> bool {
        let deadline = wait.map(|d| Instant::now() + d);
        let mut rx = self.subscribe_cstate();
        loop {
            let cs = *rx.borrow_and_update();
            if cs == ConnState::Connected || cs < ConnState::Unconnected {
                return cs == ConnState::Connected;
            }
            let changed = rx.changed();
            let use_deadline = deadline.filter(|_| !cs.is_syncing());
            let timed_out = match use_deadline {
                Some(dl) => timeout_at(dl, changed).await.is_err(),
                None => {
                    let _ = changed.await;
                    false
                }
            };
            if timed_out {
                return self.cstate() == ConnState::Connected;
            }
        }
    }

    /// Force a full-device resynchronisation towards the Secondary,
    /// whichever side this is invoked on.
    pub async fn start_full_sync(self: &Arc<Self>) -> Result<()> {
        if self.cstate() != ConnState::Connected {
            return Err(MirrorError::NotConnected);
        }
        if self.role() == Role::Primary {
            let conn = self.conn().ok_or(MirrorError::NotConnected)?;
            self.set_cstate(ConnState::SyncingAll);
            self.send_cstate(&conn).await?;
            crate::syncer::start(self, conn).await;
            Ok(())
        } else if self.peer_role() == Role::Primary {
            let conn = self.conn().ok_or(MirrorError::NotConnected)?;
            self.send_packet(&conn, &Packet::StartSync).await
        } else {
            Err(MirrorError::InvalidRequest(
                "neither node is Primary".into(),
            ))
        }
    }

    /// Current configuration of this device.
    pub fn get_config(&self) -> DeviceConfig {
        let disk = self.disk();
        DeviceConfig {
            cstate: self.cstate(),
            role: self.role(),
            lower_path: disk.as_ref().map(|d| d.lower.path().to_path_buf()),
            size_hint_kib: disk.as_ref().and_then(|d| d.user_size_kib),
            panic_on_disk_error: disk.is_some_and(|d| d.panic_on_error),
            net: self.net_config(),
        }
    }

    /// Ask the Primary peer to step down (planned failover).
    pub async fn demote_peer(&self) -> Result<()> {
        if self.cstate() != ConnState::Connected {
            return Err(MirrorError::NotConnected);
        }
        if self.peer_role() != Role::Primary {
            return Err(MirrorError::InvalidRequest("peer is not Primary".into()));
        }
        let conn = self.conn().ok_or(MirrorError::NotConnected)?;
        self.send_packet(&conn, &Packet::BecomeSec).await
    }
}

impl Registry {
    /// Configure the link of one device, enforcing node-wide address
    /// exclusivity first.
    pub async fn configure_net(&self, minor: u32, cfg: NetConfig) -> Result<()> {
        let dev = self.get(minor).ok_or(MirrorError::NotConfigured)?;
        self.check_addr_conflicts(minor, &cfg)?;
        dev.configure_net(cfg).await
    }
}
