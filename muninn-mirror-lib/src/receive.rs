//! Connection supervisor and receive path.
//!
//! One task per configured device owns the link lifecycle: the
//! connect-and-listen race, the parameter handshake, the packet dispatch
//! loop, and the disconnect cleanup that decides what survives into the
//! next connection attempt.

use std::cmp::Ordering as CmpOrdering;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use bytes::Bytes;

use crate::config::Protocol;
use crate::device::{
    block_of_sector, ConnState, Connection, Device, Role, TaskHandle, Work,
};
use crate::epoch::SyncSlot;
use crate::error::{MirrorError, Result};
use crate::meta::GenIdx;
use crate::send::{PRIMARY_SNDBUF, SECONDARY_SNDBUF};
use crate::task::{TaskCtl, TaskState};
use crate::timer::Watchdog;
use crate::wire::{self, Command, Packet, Params, ID_SYNCER, WIRE_VERSION};
use crate::{asender, syncer};

/// Depth of the async sender's duty queue; overflow only drops duplicates.
const WORK_QUEUE_DEPTH: usize = 8;

pub(crate) fn spawn(dev: Arc<Device>) -> TaskHandle {
    let ctl = TaskCtl::new();
    let join = tokio::spawn(supervisor(dev, Arc::clone(&ctl)));
    TaskHandle { ctl, join }
}

async fn supervisor(dev: Arc<Device>, ctl: Arc<TaskCtl>) {
    loop {
        let Some(stream) = connect_phase(&dev, &ctl).await else {
            break;
        };
        if ctl.state() == TaskState::Exiting {
            break;
        }

        match establish(&dev, stream).await {
            Ok((conn, read, asender_join)) => {
                run_connection(&dev, &conn, &ctl, read).await;
                disconnect(&dev, &conn, asender_join).await;
            }
            Err(e) => {
                warn!(minor = dev.minor(), error = %e, "connection setup failed");
                dev.set_conn(None);
                if dev.cstate() > ConnState::StandAlone {
                    dev.set_cstate(ConnState::Unconnected);
                }
                if crate::device::sleep_or_stop(&ctl, std::time::Duration::from_secs(1)).await {
                    break;
                }
            }
        }

        match ctl.state() {
            TaskState::Exiting => break,
            TaskState::Restarting => ctl.ack_restart(),
            TaskState::Running => {}
        }
        if dev.cstate() <= ConnState::StandAlone {
            break;
        }
    }
    debug!(minor = dev.minor(), "connection supervisor exiting");
}

/// The connect-and-listen race: try the peer first; when nobody answers,
/// bind locally and wait `try_connect_int` for the peer to call in, then
/// try again.
async fn connect_phase(dev: &Device, ctl: &TaskCtl) -> Option<TcpStream> {
    loop {
        if ctl.should_stop() || dev.cstate() <= ConnState::StandAlone {
            return None;
        }
        let cfg = dev.net_config()?;

        let attempt = tokio::select! {
            r = TcpStream::connect(cfg.peer_addr) => r,
            _ = ctl.stopped() => return None,
        };
        if let Ok(stream) = attempt {
            return Some(stream);
        }

        let listener = match bind_listener(cfg.my_addr) {
            Ok(l) => l,
            Err(e) => {
                error!(minor = dev.minor(), addr = %cfg.my_addr, error = %e, "unable to bind");
                dev.set_cstate(ConnState::Unconnected);
                return None;
            }
        };
        dev.set_cstate(ConnState::WFConnection);

        tokio::select! {
            r = timeout(cfg.connect_retry_interval(), listener.accept()) => match r {
                Ok(Ok((stream, peer))) => {
                    debug!(minor = dev.minor(), %peer, "accepted inbound connection");
                    return Some(stream);
                }
                Ok(Err(e)) => {
                    warn!(minor = dev.minor(), error = %e, "accept failed");
                }
                // Accept window elapsed; go knock on the peer's door again.
                Err(_) => {}
            },
            _ = ctl.stopped() => return None,
        }
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(5)?;
    TcpListener::from_std(socket.into())
}

fn tune_socket(stream: &TcpStream, role: Role) {
    let sock = socket2::SockRef::from(stream);
    let (nodelay, sndbuf) = match role {
        // Bulk throughput on the writer side, ack latency on the receiver.
        Role::Primary => (false, PRIMARY_SNDBUF),
        _ => (true, SECONDARY_SNDBUF),
    };
    if let Err(e) = stream.set_nodelay(nodelay) {
        debug!(error = %e, "set_nodelay failed");
    }
    if let Err(e) = sock.set_send_buffer_size(sndbuf) {
        debug!(error = %e, "set_send_buffer_size failed");
    }
}

type Established = (Arc<Connection>, OwnedReadHalf, tokio::task::JoinHandle<()>);

async fn establish(dev: &Arc<Device>, stream: TcpStream) -> Result<Established> {
    tune_socket(&stream, dev.role());
    let (read, write) = stream.into_split();
    let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_DEPTH);
    let conn = Arc::new(Connection {
        writer: tokio::sync::Mutex::new(write),
        cancel: CancellationToken::new(),
        ack_timer: Watchdog::new(),
        proc_timer: Watchdog::new(),
        send_timer: Watchdog::new(),
        work_tx,
        scan: tokio::sync::Notify::new(),
    });
    dev.set_conn(Some(Arc::clone(&conn)));

    let asender_join = tokio::spawn(asender::run(
        Arc::clone(dev),
        Arc::clone(&conn),
        work_rx,
    ));

    dev.set_cstate(ConnState::WFReportParams);
    if let Err(e) = dev.send_param(&conn).await {
        conn.cancel.cancel();
        let _ = asender_join.await;
        dev.set_conn(None);
        return Err(e);
    }
    Ok((conn, read, asender_join))
}

async fn run_connection(
    dev: &Arc<Device>,
    conn: &Arc<Connection>,
    ctl: &Arc<TaskCtl>,
    mut read: OwnedReadHalf,
) {
    tokio::select! {
        r = dispatch_loop(dev, conn, ctl, &mut read) => {
            if let Err(e) = r {
                match e {
                    MirrorError::Protocol(msg) => {
                        error!(minor = dev.minor(), %msg, "protocol violation, dropping connection");
                    }
                    MirrorError::Io(e) => {
                        info!(minor = dev.minor(), error = %e, "receive failed");
                    }
                    e => {
                        info!(minor = dev.minor(), error = %e, "receiver stopping");
                    }
                }
            }
        }
        _ = conn.cancel.cancelled() => {}
        _ = ctl.stopped() => {}
        _ = ack_timeout_watch(dev, conn) => {}
        _ = postpone_watch(dev, conn) => {}
    }
}

/// Silence is fatal: when acknowledgements are owed to us and the ack
/// deadline passes without progress or a Postpone, the link is declared
/// dead.
async fn ack_timeout_watch(dev: &Arc<Device>, conn: &Arc<Connection>) {
    loop {
        conn.ack_timer.expired().await;
        error!(
            minor = dev.minor(),
            pending = dev.pending(),
            "ack timeout detected"
        );
        if dev.cstate() >= ConnState::Connected {
            dev.set_cstate(ConnState::Timeout);
            return;
        }
    }
}

/// Our own disk is the slow one: warn the peer before its ack timer fires.
async fn postpone_watch(dev: &Arc<Device>, conn: &Arc<Connection>) {
    loop {
        conn.proc_timer.expired().await;
        warn!(minor = dev.minor(), unacked = dev.unacked(), "local writes are slow");
        conn.enqueue(Work::Postpone);
    }
}

async fn dispatch_loop(
    dev: &Arc<Device>,
    conn: &Arc<Connection>,
    ctl: &Arc<TaskCtl>,
    read: &mut OwnedReadHalf,
) -> Result<()> {
    let idle = dev.net_config().and_then(|n| n.ping_interval());
    loop {
        let pkt = {
            let mut on_idle = || conn.enqueue(Work::Ping);
            wire::read_packet(read, idle, &mut on_idle).await?
        };
        match pkt {
            Packet::Data { block_nr, block_id, payload } => {
                receive_data(dev, conn, block_nr, block_id, payload).await?;
            }
            Packet::Barrier { barrier_nr } => {
                receive_barrier(dev, conn, barrier_nr).await?;
            }
            Packet::Ping => {
                dev.send_packet(conn, &Packet::PingAck).await?;
            }
            Packet::PingAck => {
                dev.dec_pending(conn);
            }
            Packet::BlockAck { cmd, block_nr, block_id } => {
                receive_block_ack(dev, conn, cmd, block_nr, block_id);
            }
            Packet::BarrierAck { barrier_nr, set_size } => {
                if dev.role() != Role::Primary {
                    warn!(minor = dev.minor(), "barrier ack while not Primary");
                }
                dev.tl.release(barrier_nr, set_size);
                dev.dec_pending(conn);
            }
            Packet::ReportParams(params) => {
                receive_param(dev, conn, ctl, &params).await?;
            }
            Packet::CStateChanged { cstate } => {
                receive_cstate(dev, cstate)?;
            }
            Packet::StartSync => {
                dev.set_cstate(ConnState::SyncingAll);
                dev.send_cstate(conn).await?;
                syncer::start(dev, Arc::clone(conn)).await;
            }
            Packet::Postpone => {
                receive_postpone(dev, conn);
            }
            Packet::BecomeSec => {
                // Runs aside so the loop keeps draining the acks the role
                // change waits for.
                let dev = Arc::clone(dev);
                tokio::spawn(async move {
                    if let Err(e) = dev.set_role(Role::Secondary, false).await {
                        warn!(minor = dev.minor(), error = %e, "peer-requested demotion failed");
                    }
                });
            }
            Packet::SetConsistent => {
                // Arrives from the sync source ahead of its cstate change;
                // leave the syncing state before touching the flag.
                if dev.cstate().is_syncing() {
                    dev.set_cstate(ConnState::Connected);
                }
                if let Some(meta) = dev.meta() {
                    meta.set_consistent(true, dev.role() == Role::Primary);
                }
            }
        }
        if ctl.should_stop() {
            return Ok(());
        }
    }
}

async fn receive_data(
    dev: &Arc<Device>,
    conn: &Arc<Connection>,
    block_nr: u64,
    block_id: u64,
    payload: Bytes,
) -> Result<()> {
    if dev.role() != Role::Secondary {
        warn!(minor = dev.minor(), "data packet while not Secondary");
    }
    let size = payload.len();
    if size != dev.block_size() {
        if !size.is_power_of_two() || !(512..=4096).contains(&size) {
            return Err(MirrorError::Protocol(format!(
                "unusable block size {size}"
            )));
        }
        dev.set_block_shift(size.trailing_zeros());
        info!(minor = dev.minor(), block_size = size, "block size changed");
    }
    Device::add_kib(&dev.counters.net_recv, size);

    let disk = dev.disk().ok_or(MirrorError::NotConfigured)?;

    if block_id != ID_SYNCER {
        let (token, ep_size) = dev.epoch.push(block_nr, block_id).await;
        if dev
            .net_config()
            .is_some_and(|n| ep_size > n.tl_size)
        {
            warn!(minor = dev.minor(), ep_size, "epoch outgrew the transfer log size");
        }
        let protocol = dev.protocol();
        if protocol != Some(Protocol::A) {
            dev.inc_unacked(conn);
        }
        if protocol == Some(Protocol::B) {
            dev.send_block_ack(conn, Command::RecvAck, block_nr, block_id)
                .await?;
            dev.dec_unacked(conn);
        }

        let dev = Arc::clone(dev);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            let ok = disk.lower.write_block(block_nr, payload).await.is_ok();
            Device::add_kib(&dev.counters.disk_write, size);
            if !ok && disk.panic_on_error {
                dev.go_offline();
            }
            dev.epoch.mark_done(token).await;
            conn.scan.notify_waiters();
        });
    } else {
        let slot = dev.sync_log.insert(block_nr).await;
        if let SyncSlot::Replaced { acked_block_nr, .. } = slot {
            dev.send_block_ack(conn, Command::WriteAck, acked_block_nr, ID_SYNCER)
                .await?;
        }
        let dev = Arc::clone(dev);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            let ok = disk.lower.write_block(block_nr, payload).await.is_ok();
            Device::add_kib(&dev.counters.disk_write, size);
            if !ok && disk.panic_on_error {
                dev.go_offline();
            }
            if ok {
                dev.mark_in_sync(block_nr);
            }
            match slot {
                SyncSlot::Stored(token) | SyncSlot::Replaced { token, .. } => {
                    dev.sync_log.mark_done(token).await;
                }
                SyncSlot::Overflow => {}
            }
            conn.scan.notify_waiters();
        });
    }
    Ok(())
}

/// Close the epoch: wait for every write to reach the lower device, settle
/// the acks still owed (protocol C), then confirm the whole epoch.
async fn receive_barrier(dev: &Arc<Device>, conn: &Arc<Connection>, barrier_nr: u32) -> Result<()> {
    if dev.role() != Role::Secondary {
        warn!(minor = dev.minor(), "barrier while not Secondary");
    }
    dev.inc_unacked(conn);
    let (ep_size, acks) = dev.epoch.drain().await;
    if dev.protocol() == Some(Protocol::C) {
        for (block_nr, block_id) in acks {
            dev.send_block_ack(conn, Command::WriteAck, block_nr, block_id)
                .await?;
            dev.dec_unacked(conn);
        }
    }
    dev.send_barrier_ack(conn, barrier_nr, ep_size as u32).await?;
    dev.dec_unacked(conn);
    Ok(())
}

fn receive_block_ack(
    dev: &Arc<Device>,
    conn: &Arc<Connection>,
    cmd: Command,
    block_nr: u64,
    block_id: u64,
) {
    if dev.role() != Role::Primary {
        warn!(minor = dev.minor(), "block ack while not Primary");
    }
    if block_id == ID_SYNCER {
        dev.mark_in_sync(block_nr);
        return;
    }
    if let Some(req) = dev.inflight.take(block_id) {
        if req.complete_net(true) {
            dev.on_request_finished(req.sector);
        }
    } else {
        debug!(minor = dev.minor(), block_id, ?cmd, "ack for an unknown request");
    }
    if dev.protocol() != Some(Protocol::A) {
        dev.dec_pending(conn);
    }
}

fn receive_cstate(dev: &Arc<Device>, cstate: u32) -> Result<()> {
    let cs = ConnState::from_u32(cstate)
        .ok_or_else(|| MirrorError::Protocol(format!("unknown connection state {cstate}")))?;
    dev.set_cstate(cs);
    // The peer started pushing a resync at us; our replica is no longer
    // complete until it finishes.
    if dev.role() == Role::Secondary && cs.is_syncing() {
        if let Some(meta) = dev.meta() {
            meta.set_consistent(false, false);
        }
    }
    Ok(())
}

/// The peer's disk is slow, not dead: give it one more full timeout.
fn receive_postpone(dev: &Arc<Device>, conn: &Arc<Connection>) {
    info!(minor = dev.minor(), "peer asked for patience");
    if let Some(t) = dev.net_config().and_then(|n| n.timeout_duration()) {
        conn.ack_timer.extend(t);
        conn.send_timer.extend(t);
    }
}

async fn receive_param(
    dev: &Arc<Device>,
    conn: &Arc<Connection>,
    ctl: &Arc<TaskCtl>,
    params: &Params,
) -> Result<()> {
    let peer_role = Role::from_u32(params.role)
        .ok_or_else(|| MirrorError::Protocol(format!("unknown role {}", params.role)))?;

    if peer_role == Role::Primary && dev.role() == Role::Primary {
        error!(minor = dev.minor(), "both nodes are Primary, standing alone");
        return handshake_refused(dev, ctl);
    }
    if params.version != WIRE_VERSION {
        error!(
            minor = dev.minor(),
            ours = WIRE_VERSION,
            peer = params.version,
            "incompatible wire versions, standing alone"
        );
        return handshake_refused(dev, ctl);
    }
    let our_protocol = dev
        .net_config()
        .map(|n| n.protocol)
        .ok_or(MirrorError::NotConfigured)?;
    if params.protocol != our_protocol.as_u32() {
        error!(
            minor = dev.minor(),
            ours = %our_protocol,
            peer = params.protocol,
            "incompatible wire protocols, standing alone"
        );
        return handshake_refused(dev, ctl);
    }

    dev.set_peer_role(peer_role);

    let lower = dev.lower().ok_or(MirrorError::NotConfigured)?;
    let peer_kib = params.size_sectors >> 1;
    let size_kib = lower.size_kib().min(peer_kib);
    dev.set_size_kib(size_kib);

    let block_size = negotiated_block_size(dev, peer_role, params.block_size)?;
    if block_size != dev.block_size() {
        dev.set_block_shift(block_size.trailing_zeros());
    }
    dev.ensure_bitmap();

    if dev.cstate() == ConnState::WFReportParams {
        info!(
            minor = dev.minor(),
            size_kib,
            block_size,
            peer_role = %peer_role,
            "connection established"
        );

        if peer_role == Role::Secondary && dev.role() == Role::Secondary {
            let ours_win = dev
                .meta()
                .map(|m| m.compare(&params.gen_cnt) == CmpOrdering::Greater)
                .unwrap_or(false);
            if ours_win {
                info!(minor = dev.minor(), "generation counters elect us Primary");
                dev.set_role(Role::Primary, false).await?;
            }
        }

        let skip_sync = dev.net_config().map(|n| n.skip_sync).unwrap_or(false);
        if dev.role() == Role::Primary && !skip_sync {
            let quick = dev
                .meta()
                .map(|m| m.quick_sync_ok(&params.gen_cnt))
                .unwrap_or(false);
            dev.set_cstate(if quick {
                ConnState::SyncingQuick
            } else {
                ConnState::SyncingAll
            });
            dev.send_cstate(conn).await?;
            syncer::start(dev, Arc::clone(conn)).await;
        } else {
            dev.set_cstate(ConnState::Connected);
        }
    }

    if dev.role() == Role::Secondary {
        // A Secondary mirrors the Primary's history.
        if let Some(meta) = dev.meta() {
            meta.adopt(params.gen_cnt, false);
        }
    }

    Ok(())
}

fn handshake_refused(dev: &Arc<Device>, ctl: &Arc<TaskCtl>) -> Result<()> {
    dev.set_cstate(ConnState::StandAlone);
    ctl.request(TaskState::Exiting);
    Err(MirrorError::Protocol("handshake refused".into()))
}

/// The block size both ends will use: the Primary's when exactly one side
/// is Primary, otherwise the larger of the two.
fn negotiated_block_size(dev: &Device, peer_role: Role, peer_block_size: u32) -> Result<usize> {
    let peer = peer_block_size as usize;
    if !peer.is_power_of_two() || !(512..=4096).contains(&peer) {
        return Err(MirrorError::Protocol(format!(
            "peer block size {peer} unusable"
        )));
    }
    Ok(if dev.role() == Role::Primary {
        dev.block_size()
    } else if peer_role == Role::Primary {
        peer
    } else {
        peer.max(dev.block_size())
    })
}

/// Tear the connection down and decide what survives: the Primary requeues
/// its un-acked writes as out-of-sync ranges, the Secondary forgets the
/// half-received epoch. Either way the counters snapshot the moment the
/// bitmap started tracking on its own.
async fn disconnect(dev: &Arc<Device>, conn: &Arc<Connection>, asender: tokio::task::JoinHandle<()>) {
    conn.cancel.cancel();
    conn.ack_timer.disarm();
    conn.proc_timer.disarm();
    conn.send_timer.disarm();

    if let Some(handle) = dev.syncer.lock().await.take() {
        handle.ctl.request(TaskState::Exiting);
        if timeout(std::time::Duration::from_secs(5), handle.join)
            .await
            .is_err()
        {
            warn!(minor = dev.minor(), "syncer did not stop in time");
        }
    }
    let _ = asender.await;

    dev.set_conn(None);

    info!(
        minor = dev.minor(),
        pending = dev.pending(),
        unacked = dev.unacked(),
        "connection lost"
    );

    if dev.cstate() > ConnState::StandAlone {
        dev.set_cstate(ConnState::Unconnected);
    }
    dev.set_peer_role(Role::Unknown);

    if let Some(meta) = dev.meta() {
        meta.snapshot_bitmap_gen();
    }

    match dev.role() {
        Role::Primary => {
            let requeue = dev
                .protocol()
                .is_some_and(|p| matches!(p, Protocol::B | Protocol::C));
            let shift = dev.block_shift();
            for entry in dev.tl.drain_clear() {
                dev.mark_out_of_sync(block_of_sector(entry.sector, shift));
                if requeue {
                    // The local write already happened (or will complete on
                    // its own); the network half is settled as done.
                    if let Some(req) = dev.inflight.take(entry.block_id) {
                        req.complete_net(true);
                    }
                }
            }
            dev.issue_barrier.store(false, Ordering::Release);
            if let Some(meta) = dev.meta() {
                meta.inc(GenIdx::ConnectedCnt, true);
            }
        }
        Role::Secondary => {
            dev.epoch.clear().await;
            dev.sync_log.clear().await;
            dev.reset_unacked();
        }
        Role::Unknown => {}
    }
    dev.reset_pending();
}
