//! Send path: everything that goes onto the wire.
//!
//! The writer half of the socket lives behind the send mutex; one lock hold
//! covers a full frame, and covers barrier insertion too, so the transfer
//! log and the wire always agree on the order of data and barriers.

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;

use bytes::Bytes;
use tracing::{error, warn};

use crate::config::Protocol;
use crate::device::{sector_of_block, ConnState, Connection, Device};
use crate::error::{MirrorError, Result};
use crate::wire::{Packet, Params, ID_SYNCER, WIRE_VERSION};

/// Socket send-buffer sizing: the Primary runs bulk-throughput sized, the
/// Secondary small for ack latency.
pub(crate) const PRIMARY_SNDBUF: usize = 2 * 65535;
pub(crate) const SECONDARY_SNDBUF: usize = 2 * 32767;

impl Device {
    /// Write one frame under the send mutex.
    pub(crate) async fn send_packet(&self, conn: &Connection, pkt: &Packet) -> Result<()> {
        let mut w = conn.writer.lock().await;
        self.write_frame(conn, &mut w, pkt).await
    }

    /// Write one frame; the caller holds the send mutex.
    ///
    /// A send timeout declares the connection dead (`Timeout`), a socket
    /// error declares it broken (`BrokenPipe`); both tear the connection
    /// down so the supervisor reconnects.
    async fn write_frame(
        &self,
        conn: &Connection,
        w: &mut OwnedWriteHalf,
        pkt: &Packet,
    ) -> Result<()> {
        if self.cstate() < ConnState::WFReportParams {
            return Err(MirrorError::Disconnected);
        }
        enum SendOutcome {
            Done(std::io::Result<()>),
            TimedOut,
            Cancelled,
        }
        let buf = pkt.encode();
        let timeout = self.net_config().and_then(|n| n.timeout_duration());
        if let Some(t) = timeout {
            conn.send_timer.arm(t);
        }
        let outcome = tokio::select! {
            r = w.write_all(&buf) => SendOutcome::Done(r),
            _ = conn.send_timer.expired(), if timeout.is_some() => SendOutcome::TimedOut,
            _ = conn.cancel.cancelled() => SendOutcome::Cancelled,
        };
        conn.send_timer.disarm();
        match outcome {
            SendOutcome::Done(Ok(())) => Ok(()),
            SendOutcome::Done(Err(e)) => {
                error!(minor = self.minor(), error = %e, "socket write failed");
                self.set_cstate(ConnState::BrokenPipe);
                conn.cancel.cancel();
                Err(MirrorError::Io(e))
            }
            SendOutcome::TimedOut => {
                error!(minor = self.minor(), "send timed out");
                self.set_cstate(ConnState::Timeout);
                conn.cancel.cancel();
                Err(MirrorError::Disconnected)
            }
            SendOutcome::Cancelled => Err(MirrorError::Disconnected),
        }
    }

    /// Transmit a data block, fencing it behind a deferred barrier first if
    /// one is owed. Application writes are recorded in the transfer log and,
    /// for protocols B and C, start the ack clock.
    ///
    /// Returns `Ok(false)` when an application write could not be shipped;
    /// its range is marked out-of-sync instead. Resync writes propagate the
    /// failure.
    pub(crate) async fn send_data(
        &self,
        conn: &Connection,
        block_nr: u64,
        block_id: u64,
        payload: Bytes,
    ) -> Result<bool> {
        let payload_len = payload.len();
        let mut w = conn.writer.lock().await;

        if self.issue_barrier.swap(false, std::sync::atomic::Ordering::AcqRel) {
            self.send_barrier_locked(conn, &mut w).await?;
        }

        let pkt = Packet::Data { block_nr, block_id, payload };
        match self.write_frame(conn, &mut w, &pkt).await {
            Ok(()) => {
                if block_id != ID_SYNCER {
                    let sector = sector_of_block(block_nr, self.block_shift());
                    self.tl.add(block_id, sector);
                    if self.protocol() != Some(Protocol::A) {
                        self.inc_pending(conn);
                    }
                }
                Device::add_kib(&self.counters.net_sent, payload_len);
                Ok(true)
            }
            Err(e) => {
                if block_id == ID_SYNCER {
                    Err(e)
                } else {
                    self.mark_out_of_sync(block_nr);
                    Ok(false)
                }
            }
        }
    }

    /// Drain a deferred barrier while the send path is otherwise idle.
    pub(crate) async fn try_send_barrier(&self, conn: &Connection) {
        let mut w = conn.writer.lock().await;
        if self.issue_barrier.swap(false, std::sync::atomic::Ordering::AcqRel) {
            if let Err(e) = self.send_barrier_locked(conn, &mut w).await {
                warn!(minor = self.minor(), error = %e, "deferred barrier send failed");
            }
        }
    }

    /// Allocate a barrier number and put the packet on the wire. Log entry
    /// and packet are ordered under the same send-mutex hold.
    async fn send_barrier_locked(
        &self,
        conn: &Connection,
        w: &mut OwnedWriteHalf,
    ) -> Result<()> {
        let barrier_nr = self.tl.add_barrier();
        self.write_frame(conn, w, &Packet::Barrier { barrier_nr }).await?;
        self.inc_pending(conn);
        Ok(())
    }

    pub(crate) async fn send_block_ack(
        &self,
        conn: &Connection,
        cmd: crate::wire::Command,
        block_nr: u64,
        block_id: u64,
    ) -> Result<()> {
        self.send_packet(conn, &Packet::BlockAck { cmd, block_nr, block_id })
            .await
    }

    pub(crate) async fn send_barrier_ack(
        &self,
        conn: &Connection,
        barrier_nr: u32,
        set_size: u32,
    ) -> Result<()> {
        self.send_packet(conn, &Packet::BarrierAck { barrier_nr, set_size })
            .await
    }

    pub(crate) async fn send_cstate(&self, conn: &Connection) -> Result<()> {
        let cstate = self.cstate().as_u32();
        self.send_packet(conn, &Packet::CStateChanged { cstate }).await
    }

    /// Ship our parameter block: sizes, role, protocol, generation counters.
    pub(crate) async fn send_param(&self, conn: &Connection) -> Result<()> {
        let lower = self.lower().ok_or(MirrorError::NotConfigured)?;
        let net = self.net_config().ok_or(MirrorError::NotConfigured)?;
        let gen_cnt = self.meta().map(|m| m.gen()).unwrap_or_default();
        let params = Params {
            size_sectors: lower.size_kib() << 1,
            block_size: self.block_size() as u32,
            role: self.role().as_u32(),
            protocol: net.protocol.as_u32(),
            version: WIRE_VERSION,
            gen_cnt,
        };
        self.send_packet(conn, &Packet::ReportParams(params)).await
    }
}
