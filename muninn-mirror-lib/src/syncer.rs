//! Resynchronisation engine, run on the source side.
//!
//! A two-stage pipeline: while one batch is on the wire the next is already
//! being read from the lower device. The batch size is half the Primary's
//! socket send buffer; the inter-batch sleep enforces the configured rate.
//!
//! Block source: a decreasing whole-device sweep for a full resync, the
//! out-of-sync map cursor for a quick one. Every block ships with the
//! syncer sentinel id, so the target acknowledges with `WriteAck`
//! regardless of protocol.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bitmap::{Bitmap, SCAN_DONE};
use crate::device::{sleep_or_stop, ConnState, Connection, Device, TaskHandle};
use crate::error::Result;
use crate::lower::LowerDevice;
use crate::send::PRIMARY_SNDBUF;
use crate::task::{TaskCtl, TaskState};
use crate::wire::{Packet, ID_SYNCER};

const SYNC_BATCH_BYTES: usize = PRIMARY_SNDBUF / 2;

/// Launch the resync task for the current syncing state, replacing any
/// previous run.
pub(crate) async fn start(dev: &Arc<Device>, conn: Arc<Connection>) {
    let ctl = TaskCtl::new();
    let join = tokio::spawn(run(Arc::clone(dev), conn, Arc::clone(&ctl)));
    let mut slot = dev.syncer.lock().await;
    if let Some(old) = slot.replace(TaskHandle { ctl, join }) {
        old.ctl.request(TaskState::Exiting);
    }
}

enum Source {
    /// Decreasing sweep; the sector of the next block to copy, `None` once
    /// the sweep passed block zero.
    All { pos: Option<u64> },
    Quick(Arc<Bitmap>),
}

impl Source {
    fn next_block(&mut self, dev: &Device) -> Option<u64> {
        let shift = dev.block_shift();
        match self {
            Source::All { pos } => {
                let sector = (*pos)?;
                let block_nr = sector >> (shift - 9);
                let step = 1u64 << (shift - 9);
                *pos = sector.checked_sub(step);
                dev.synced_to
                    .store(pos.unwrap_or(0), Ordering::Release);
                Some(block_nr)
            }
            Source::Quick(bm) => match bm.next_out_of_sync(shift) {
                SCAN_DONE => None,
                block_nr => Some(block_nr),
            },
        }
    }
}

async fn run(dev: Arc<Device>, conn: Arc<Connection>, ctl: Arc<TaskCtl>) {
    let Some(cfg) = dev.net_config() else { return };
    let Some(lower) = dev.lower() else { return };

    let block_size = dev.block_size();
    let batch_blocks = (SYNC_BATCH_BYTES / block_size).max(1);
    let batch_kib = ((batch_blocks * block_size) >> 10) as u64;
    let interval = Duration::from_millis((batch_kib * 1000 / u64::from(cfg.sync_rate)).max(1));

    let mut source = match dev.cstate() {
        ConnState::SyncingAll => {
            let size_kib = dev.size_kib();
            let block_kib = (block_size >> 10) as u64;
            if size_kib < block_kib {
                warn!(minor = dev.minor(), "nothing to sweep");
                finish(&dev, &conn, false).await;
                return;
            }
            // Start at the last whole block and walk down to sector 0.
            let start = (size_kib - block_kib) << 1;
            dev.synced_to.store(start, Ordering::Release);
            Source::All { pos: Some(start) }
        }
        ConnState::SyncingQuick => {
            let Some(bm) = dev.bitmap() else {
                warn!(minor = dev.minor(), "quick sync without a bitmap");
                finish(&dev, &conn, false).await;
                return;
            };
            bm.reset_cursor(dev.block_shift());
            Source::Quick(bm)
        }
        other => {
            warn!(minor = dev.minor(), cstate = %other, "syncer started outside a syncing state");
            return;
        }
    };

    info!(
        minor = dev.minor(),
        batch_blocks,
        interval_ms = interval.as_millis() as u64,
        "resynchronisation started"
    );

    let mut pending = spawn_read_batch(&dev, &lower, &mut source, batch_blocks, block_size);
    let complete = loop {
        if sleep_or_stop(&ctl, interval).await {
            let _ = pending.await;
            warn!(minor = dev.minor(), "resynchronisation aborted");
            break false;
        }
        let batch = match pending.await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                error!(minor = dev.minor(), error = %e, "resync read failed");
                break false;
            }
            Err(e) => {
                error!(minor = dev.minor(), error = %e, "resync read task failed");
                break false;
            }
        };
        if batch.is_empty() {
            break true;
        }
        if ctl.should_stop() {
            // Ship what we already read, then leave.
            let _ = send_batch(&dev, &conn, &batch).await;
            warn!(minor = dev.minor(), "resynchronisation aborted");
            break false;
        }
        pending = spawn_read_batch(&dev, &lower, &mut source, batch_blocks, block_size);
        if !send_batch(&dev, &conn, &batch).await {
            let _ = pending.await;
            error!(minor = dev.minor(), "resync send failed");
            break false;
        }
    };

    finish(&dev, &conn, complete).await;
}

fn spawn_read_batch(
    dev: &Arc<Device>,
    lower: &Arc<LowerDevice>,
    source: &mut Source,
    batch_blocks: usize,
    block_size: usize,
) -> JoinHandle<Result<Vec<(u64, Bytes)>>> {
    let mut blocks = Vec::with_capacity(batch_blocks);
    while blocks.len() < batch_blocks {
        match source.next_block(dev) {
            Some(b) => blocks.push(b),
            None => break,
        }
    }
    let lower = Arc::clone(lower);
    let dev = Arc::clone(dev);
    tokio::spawn(async move {
        let mut batch = Vec::with_capacity(blocks.len());
        for block_nr in blocks {
            let data = lower.read_block(block_nr, block_size).await?;
            Device::add_kib(&dev.counters.disk_read, block_size);
            batch.push((block_nr, data));
        }
        Ok(batch)
    })
}

async fn send_batch(dev: &Arc<Device>, conn: &Arc<Connection>, batch: &[(u64, Bytes)]) -> bool {
    for (block_nr, data) in batch {
        match dev.send_data(conn, *block_nr, ID_SYNCER, data.clone()).await {
            Ok(true) => {}
            _ => return false,
        }
    }
    true
}

/// Wind the sync down. A completed run tells the target its replica is
/// whole again; either way both ends return to `Connected`.
async fn finish(dev: &Arc<Device>, conn: &Arc<Connection>, complete: bool) {
    if complete {
        let _ = dev.send_packet(conn, &Packet::SetConsistent).await;
        info!(minor = dev.minor(), "resynchronisation done");
    }
    if dev.cstate().is_syncing() {
        dev.set_cstate(ConnState::Connected);
        let _ = dev.send_cstate(conn).await;
    }
    dev.synced_to.store(0, Ordering::Release);
}
