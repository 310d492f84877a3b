use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use muninn_mirror_lib::wire::{read_packet, Command, Packet, Params, ID_SYNCER, MAGIC};
use muninn_mirror_lib::MirrorError;

async fn roundtrip(pkt: Packet) -> Packet {
    let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
    tx.write_all(&pkt.encode()).await.expect("write frame");
    read_packet(&mut rx, None, &mut || {}).await.expect("decode")
}

#[tokio::test]
async fn data_roundtrips_with_payload() {
    let payload = Bytes::from(vec![0xabu8; 4096]);
    let pkt = Packet::Data {
        block_nr: 123,
        block_id: 42,
        payload: payload.clone(),
    };
    assert_eq!(roundtrip(pkt.clone()).await, pkt);

    let sync = Packet::Data {
        block_nr: 7,
        block_id: ID_SYNCER,
        payload,
    };
    assert_eq!(roundtrip(sync.clone()).await, sync);
}

#[tokio::test]
async fn control_packets_roundtrip() {
    let packets = [
        Packet::Barrier { barrier_nr: 17 },
        Packet::BarrierAck { barrier_nr: 17, set_size: 9 },
        Packet::BlockAck { cmd: Command::RecvAck, block_nr: 5, block_id: 77 },
        Packet::BlockAck { cmd: Command::WriteAck, block_nr: 5, block_id: ID_SYNCER },
        Packet::CStateChanged { cstate: 8 },
        Packet::Ping,
        Packet::PingAck,
        Packet::StartSync,
        Packet::Postpone,
        Packet::BecomeSec,
        Packet::SetConsistent,
    ];
    for pkt in packets {
        assert_eq!(roundtrip(pkt.clone()).await, pkt);
    }
}

#[tokio::test]
async fn report_params_roundtrips() {
    let pkt = Packet::ReportParams(Params {
        size_sectors: 2_097_152,
        block_size: 4096,
        role: 0,
        protocol: 3,
        version: 1,
        gen_cnt: [1, 2, 3, 4, 0],
    });
    assert_eq!(roundtrip(pkt.clone()).await, pkt);
}

#[tokio::test]
async fn bad_magic_is_a_protocol_error() {
    let (mut tx, mut rx) = tokio::io::duplex(1024);
    let mut frame = Packet::Ping.encode();
    frame[0] ^= 0xff;
    tx.write_all(&frame).await.expect("write frame");

    match read_packet(&mut rx, None, &mut || {}).await {
        Err(MirrorError::Protocol(msg)) => assert!(msg.contains("magic")),
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_command_is_a_protocol_error() {
    let (mut tx, mut rx) = tokio::io::duplex(1024);
    let mut frame = Vec::new();
    frame.extend_from_slice(&MAGIC.to_be_bytes());
    frame.extend_from_slice(&999u16.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    tx.write_all(&frame).await.expect("write frame");

    assert!(matches!(
        read_packet(&mut rx, None, &mut || {}).await,
        Err(MirrorError::Protocol(_))
    ));
}

#[tokio::test]
async fn closed_stream_is_an_io_error() {
    let (tx, mut rx) = tokio::io::duplex(1024);
    drop(tx);
    assert!(matches!(
        read_packet(&mut rx, None, &mut || {}).await,
        Err(MirrorError::Io(_))
    ));
}

#[tokio::test]
async fn idle_callback_fires_while_header_is_awaited() {
    let (mut tx, mut rx) = tokio::io::duplex(1024);
    let mut idle_hits = 0u32;

    let reader = async {
        let mut on_idle = || idle_hits += 1;
        read_packet(
            &mut rx,
            Some(std::time::Duration::from_millis(20)),
            &mut on_idle,
        )
        .await
    };
    let writer = async {
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        tx.write_all(&Packet::Ping.encode()).await.expect("write frame");
    };
    let (decoded, ()) = tokio::join!(reader, writer);
    assert_eq!(decoded.expect("decode"), Packet::Ping);
    assert!(idle_hits >= 1);
}
