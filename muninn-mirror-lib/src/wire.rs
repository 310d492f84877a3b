//! Wire format of the replication link.
//!
//! Every packet starts with a fixed 8-byte header (magic, command, payload
//! length), followed by a command-specific header and, for `Data`, the block
//! payload. All multi-byte fields are network byte order.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::{MirrorError, Result};

pub const MAGIC: u32 = 0x8374_0267;

/// Version of the wire protocol; both ends must match at handshake.
pub const WIRE_VERSION: u32 = 1;

/// Reserved `block_id` marking a resynchronisation write rather than an
/// application write.
pub const ID_SYNCER: u64 = u64::MAX;

pub const HEADER_LEN: usize = 8;

/// Number of generation counters carried in a parameter block.
pub const GEN_CNT_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Data = 0,
    Barrier = 1,
    Ping = 2,
    PingAck = 3,
    RecvAck = 4,
    WriteAck = 5,
    BarrierAck = 6,
    ReportParams = 7,
    CStateChanged = 8,
    StartSync = 9,
    Postpone = 10,
    BecomeSec = 11,
    SetConsistent = 12,
}

impl Command {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Command::Data,
            1 => Command::Barrier,
            2 => Command::Ping,
            3 => Command::PingAck,
            4 => Command::RecvAck,
            5 => Command::WriteAck,
            6 => Command::BarrierAck,
            7 => Command::ReportParams,
            8 => Command::CStateChanged,
            9 => Command::StartSync,
            10 => Command::Postpone,
            11 => Command::BecomeSec,
            12 => Command::SetConsistent,
            _ => return None,
        })
    }
}

/// Parameter block exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// Usable size of the sender's lower device, in sectors of 512 bytes.
    pub size_sectors: u64,
    /// The sender's current block size in bytes (power of two).
    pub block_size: u32,
    /// The sender's role (`Role::as_u32`).
    pub role: u32,
    /// The sender's wire protocol (`Protocol::as_u32`).
    pub protocol: u32,
    /// The sender's `WIRE_VERSION`.
    pub version: u32,
    /// The sender's persisted generation counters.
    pub gen_cnt: [u32; GEN_CNT_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data {
        block_nr: u64,
        block_id: u64,
        payload: Bytes,
    },
    Barrier {
        barrier_nr: u32,
    },
    BarrierAck {
        barrier_nr: u32,
        set_size: u32,
    },
    /// `RecvAck` or `WriteAck`, distinguished by `cmd`.
    BlockAck {
        cmd: Command,
        block_nr: u64,
        block_id: u64,
    },
    ReportParams(Params),
    CStateChanged {
        cstate: u32,
    },
    Ping,
    PingAck,
    StartSync,
    Postpone,
    BecomeSec,
    SetConsistent,
}

impl Packet {
    pub fn command(&self) -> Command {
        match self {
            Packet::Data { .. } => Command::Data,
            Packet::Barrier { .. } => Command::Barrier,
            Packet::BarrierAck { .. } => Command::BarrierAck,
            Packet::BlockAck { cmd, .. } => *cmd,
            Packet::ReportParams(_) => Command::ReportParams,
            Packet::CStateChanged { .. } => Command::CStateChanged,
            Packet::Ping => Command::Ping,
            Packet::PingAck => Command::PingAck,
            Packet::StartSync => Command::StartSync,
            Packet::Postpone => Command::Postpone,
            Packet::BecomeSec => Command::BecomeSec,
            Packet::SetConsistent => Command::SetConsistent,
        }
    }

    /// Serialize the packet into a single contiguous frame.
    pub fn encode(&self) -> BytesMut {
        let payload_len = match self {
            Packet::Data { payload, .. } => payload.len(),
            _ => 0,
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 44 + payload_len);
        buf.put_u32(MAGIC);
        buf.put_u16(self.command() as u16);
        buf.put_u16(payload_len as u16);
        match self {
            Packet::Data { block_nr, block_id, payload } => {
                buf.put_u64(*block_nr);
                buf.put_u64(*block_id);
                buf.put_slice(payload);
            }
            Packet::Barrier { barrier_nr } => {
                buf.put_u32(*barrier_nr);
            }
            Packet::BarrierAck { barrier_nr, set_size } => {
                buf.put_u32(*barrier_nr);
                buf.put_u32(*set_size);
            }
            Packet::BlockAck { block_nr, block_id, .. } => {
                buf.put_u64(*block_nr);
                buf.put_u64(*block_id);
            }
            Packet::ReportParams(p) => {
                buf.put_u64(p.size_sectors);
                buf.put_u32(p.block_size);
                buf.put_u32(p.role);
                buf.put_u32(p.protocol);
                buf.put_u32(p.version);
                for gc in p.gen_cnt {
                    buf.put_u32(gc);
                }
            }
            Packet::CStateChanged { cstate } => {
                buf.put_u32(*cstate);
            }
            Packet::Ping
            | Packet::PingAck
            | Packet::StartSync
            | Packet::Postpone
            | Packet::BecomeSec
            | Packet::SetConsistent => {}
        }
        buf
    }
}

fn sub_header_len(cmd: Command) -> usize {
    match cmd {
        Command::Data | Command::RecvAck | Command::WriteAck => 16,
        Command::Barrier | Command::CStateChanged => 4,
        Command::BarrierAck => 8,
        Command::ReportParams => 8 + 4 * 4 + 4 * GEN_CNT_LEN,
        Command::Ping
        | Command::PingAck
        | Command::StartSync
        | Command::Postpone
        | Command::BecomeSec
        | Command::SetConsistent => 0,
    }
}

/// Read one packet off the stream.
///
/// `idle` bounds how long a single read may sit without any bytes arriving;
/// when it elapses `on_idle` is invoked (the caller uses it to request a
/// Ping probe) and the read continues. Partial frames survive idle periods,
/// only a clean close or an I/O error abort the read.
pub async fn read_packet<R, F>(r: &mut R, idle: Option<Duration>, on_idle: &mut F) -> Result<Packet>
where
    R: AsyncRead + Unpin,
    F: FnMut(),
{
    let mut header = [0u8; HEADER_LEN];
    read_full(r, &mut header, idle, on_idle).await?;
    let mut hdr = &header[..];
    let magic = hdr.get_u32();
    let command = hdr.get_u16();
    let length = hdr.get_u16() as usize;

    if magic != MAGIC {
        return Err(MirrorError::Protocol(format!(
            "bad magic {magic:#010x} (command {command}, length {length})"
        )));
    }
    let cmd = Command::from_u16(command)
        .ok_or_else(|| MirrorError::Protocol(format!("unknown command {command}")))?;
    if cmd != Command::Data && length != 0 {
        return Err(MirrorError::Protocol(format!(
            "unexpected payload of {length} bytes on {cmd:?}"
        )));
    }

    let mut sub = vec![0u8; sub_header_len(cmd)];
    read_full(r, &mut sub, idle, on_idle).await?;
    let mut sub = &sub[..];

    let packet = match cmd {
        Command::Data => {
            let block_nr = sub.get_u64();
            let block_id = sub.get_u64();
            let mut payload = vec![0u8; length];
            read_full(r, &mut payload, idle, on_idle).await?;
            Packet::Data { block_nr, block_id, payload: Bytes::from(payload) }
        }
        Command::Barrier => Packet::Barrier { barrier_nr: sub.get_u32() },
        Command::BarrierAck => Packet::BarrierAck {
            barrier_nr: sub.get_u32(),
            set_size: sub.get_u32(),
        },
        Command::RecvAck | Command::WriteAck => Packet::BlockAck {
            cmd,
            block_nr: sub.get_u64(),
            block_id: sub.get_u64(),
        },
        Command::ReportParams => {
            let size_sectors = sub.get_u64();
            let block_size = sub.get_u32();
            let role = sub.get_u32();
            let protocol = sub.get_u32();
            let version = sub.get_u32();
            let mut gen_cnt = [0u32; GEN_CNT_LEN];
            for gc in gen_cnt.iter_mut() {
                *gc = sub.get_u32();
            }
            Packet::ReportParams(Params {
                size_sectors,
                block_size,
                role,
                protocol,
                version,
                gen_cnt,
            })
        }
        Command::CStateChanged => Packet::CStateChanged { cstate: sub.get_u32() },
        Command::Ping => Packet::Ping,
        Command::PingAck => Packet::PingAck,
        Command::StartSync => Packet::StartSync,
        Command::Postpone => Packet::Postpone,
        Command::BecomeSec => Packet::BecomeSec,
        Command::SetConsistent => Packet::SetConsistent,
    };
    Ok(packet)
}

async fn read_full<R, F>(
    r: &mut R,
    buf: &mut [u8],
    idle: Option<Duration>,
    on_idle: &mut F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(),
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = match idle {
            Some(d) => match timeout(d, r.read(&mut buf[filled..])).await {
                Ok(res) => res?,
                Err(_) => {
                    on_idle();
                    continue;
                }
            },
            None => r.read(&mut buf[filled..]).await?,
        };
        if n == 0 {
            return Err(MirrorError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )));
        }
        filled += n;
    }
    Ok(())
}
