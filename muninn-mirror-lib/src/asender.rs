//! The async sender: out-of-band control traffic.
//!
//! One cooperative task per connection. It wakes for queued duties (ping
//! probes, postpone notices, deferred barriers) and for completion scans:
//! on the Secondary it harvests writes that just reached the lower device
//! and emits their acks in completion order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Protocol;
use crate::device::{Connection, Device, Role, Work};
use crate::wire::{Command, Packet, ID_SYNCER};

pub(crate) async fn run(dev: Arc<Device>, conn: Arc<Connection>, mut work_rx: mpsc::Receiver<Work>) {
    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            work = work_rx.recv() => {
                let Some(work) = work else { break };
                handle_work(&dev, &conn, work).await;
            }
            _ = conn.scan.notified() => {}
        }

        if dev.role() == Role::Primary {
            dev.try_send_barrier(&conn).await;
            continue;
        }

        // Resync acks go out as their local writes complete, not as the
        // blocks arrived.
        for block_nr in dev.sync_log.harvest().await {
            if dev
                .send_block_ack(&conn, Command::WriteAck, block_nr, ID_SYNCER)
                .await
                .is_err()
            {
                break;
            }
        }

        if dev.protocol() == Some(Protocol::C) {
            for (block_nr, block_id) in dev.epoch.harvest_acked().await {
                match dev
                    .send_block_ack(&conn, Command::WriteAck, block_nr, block_id)
                    .await
                {
                    Ok(()) => dev.dec_unacked(&conn),
                    Err(_) => break,
                }
            }
        }
    }
    debug!(minor = dev.minor(), "async sender exiting");
}

async fn handle_work(dev: &Arc<Device>, conn: &Arc<Connection>, work: Work) {
    match work {
        Work::Ping => {
            if dev.send_packet(conn, &Packet::Ping).await.is_ok() {
                // A missing PingAck times the connection out.
                dev.inc_pending(conn);
            }
        }
        Work::Postpone => {
            if let Some(t) = dev.net_config().and_then(|n| n.half_timeout_duration()) {
                conn.proc_timer.arm(t);
            }
            if let Err(e) = dev.send_packet(conn, &Packet::Postpone).await {
                warn!(minor = dev.minor(), error = %e, "postpone send failed");
            }
        }
        // Drained below through the ordinary send path.
        Work::Barrier => {}
    }
}
