//! End-to-end wire tests against a real TCP server.
//!
//! A minimal Lumberjack client encoder lives in `wire` below; the tests
//! drive full windows through the server and assert on the exact ACK bytes
//! coming back.

use std::time::Duration;

use serde_json::json;
use timberwire::{Server, ServerBuilder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Client-side frame encoding, just enough for the tests.
mod wire {
    use std::io::Write;

    pub fn window(version: u8, count: u32) -> Vec<u8> {
        let mut buf = vec![version, b'W'];
        buf.extend_from_slice(&count.to_be_bytes());
        buf
    }

    pub fn json_frame(seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![b'2', b'J'];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    pub fn kv_frame(seq: u32, pairs: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = vec![b'1', b'D'];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
        for (key, value) in pairs {
            buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
        buf
    }

    pub fn compressed_frame(version: u8, inner: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(inner).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut buf = vec![version, b'C'];
        buf.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        buf.extend_from_slice(&compressed);
        buf
    }
}

async fn start_server(builder: ServerBuilder) -> (Server, TcpStream) {
    let server = builder.logging(false).bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    (server, client)
}

async fn read_ack(client: &mut TcpStream) -> [u8; 6] {
    let mut frame = [0u8; 6];
    client.read_exact(&mut frame).await.unwrap();
    frame
}

#[tokio::test]
async fn round_trips_batches_in_order() {
    let (mut server, mut client) = start_server(ServerBuilder::new()).await;

    // Three windows of growing size, pipelined in one write.
    let mut bytes = Vec::new();
    let mut seq = 0u32;
    for size in 1..=3u32 {
        bytes.extend(wire::window(b'2', size));
        for _ in 0..size {
            seq += 1;
            bytes.extend(wire::json_frame(seq, format!("{{\"seq\":{seq}}}").as_bytes()));
        }
    }
    client.write_all(&bytes).await.unwrap();

    let mut expected_seq = 0;
    for size in 1..=3usize {
        let batch = server.receive().await.unwrap();
        assert_eq!(batch.len(), size);
        for event in batch.events() {
            expected_seq += 1;
            assert_eq!(event["seq"], expected_seq);
        }
        batch.ack();
        let ack = read_ack(&mut client).await;
        assert_eq!(ack, [b'2', b'A', 0, 0, 0, size as u8]);
    }

    server.close().await;
}

#[tokio::test]
async fn single_json_event_acks_exact_bytes() {
    // 0x32 'W' 00000001  0x32 'J' 00000001 0000000D {"k":"v"}
    let (mut server, mut client) = start_server(ServerBuilder::new()).await;

    let mut bytes = wire::window(b'2', 1);
    bytes.extend(wire::json_frame(1, br#"{"k":"v"}"#));
    client.write_all(&bytes).await.unwrap();

    let batch = server.receive().await.unwrap();
    assert_eq!(batch.events(), [json!({"k": "v"})]);
    batch.ack();

    assert_eq!(read_ack(&mut client).await, [0x32, b'A', 0, 0, 0, 1]);
    server.close().await;
}

#[tokio::test]
async fn compressed_window_acks_full_count() {
    // Window of 2 where the second event rides inside a compressed frame.
    let (mut server, mut client) = start_server(ServerBuilder::new()).await;

    let mut bytes = wire::window(b'2', 2);
    bytes.extend(wire::json_frame(1, b"{\"n\":1}"));
    bytes.extend(wire::compressed_frame(
        b'2',
        &wire::json_frame(2, b"{\"n\":2}"),
    ));
    client.write_all(&bytes).await.unwrap();

    let batch = server.receive().await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.events()[0], json!({"n": 1}));
    assert_eq!(batch.events()[1], json!({"n": 2}));
    batch.ack();

    assert_eq!(read_ack(&mut client).await, [b'2', b'A', 0, 0, 0, 2]);
    server.close().await;
}

#[tokio::test]
async fn compressed_and_plain_encodings_are_equivalent() {
    let frames: Vec<u8> = [
        wire::json_frame(1, b"{\"a\":1}"),
        wire::json_frame(2, b"{\"b\":2}"),
        wire::json_frame(3, b"{\"c\":3}"),
    ]
    .concat();

    let (mut server, mut client) = start_server(ServerBuilder::new()).await;

    let mut plain = wire::window(b'2', 3);
    plain.extend_from_slice(&frames);
    client.write_all(&plain).await.unwrap();
    let plain_batch = server.receive().await.unwrap();
    plain_batch.ack();
    read_ack(&mut client).await;

    let mut packed = wire::window(b'2', 3);
    packed.extend(wire::compressed_frame(b'2', &frames));
    client.write_all(&packed).await.unwrap();
    let packed_batch = server.receive().await.unwrap();
    packed_batch.ack();
    read_ack(&mut client).await;

    assert_eq!(plain_batch.events(), packed_batch.events());
    server.close().await;
}

#[tokio::test]
async fn v1_key_value_window_round_trips() {
    let (mut server, mut client) = start_server(ServerBuilder::new()).await;

    let mut bytes = wire::window(b'1', 1);
    bytes.extend(wire::kv_frame(1, &[("a", "1"), ("b", "2")]));
    client.write_all(&bytes).await.unwrap();

    let batch = server.receive().await.unwrap();
    assert_eq!(batch.events()[0], json!({"a": "1", "b": "2"}));
    batch.ack();

    assert_eq!(read_ack(&mut client).await, [b'1', b'A', 0, 0, 0, 1]);
    server.close().await;
}

#[tokio::test]
async fn slow_consumer_sees_keepalives_before_ack() {
    // keepalive = 100ms, consumer acks after ~350ms: at least three
    // keep-alive frames (count 0) must precede the final ACK.
    let (mut server, mut client) = start_server(
        ServerBuilder::new().keepalive(Duration::from_millis(100)),
    )
    .await;

    let mut bytes = wire::window(b'2', 1);
    bytes.extend(wire::json_frame(1, b"{}"));
    client.write_all(&bytes).await.unwrap();

    let batch = server.receive().await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        batch.ack();
    });

    let mut keepalives = 0;
    loop {
        let frame = read_ack(&mut client).await;
        assert_eq!(frame[0], b'2');
        assert_eq!(frame[1], b'A');
        let count = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
        if count == 0 {
            keepalives += 1;
        } else {
            assert_eq!(count, 1);
            break;
        }
    }
    assert!(keepalives >= 3, "saw only {keepalives} keep-alives");

    server.close().await;
}

#[tokio::test]
async fn close_drops_pending_batches_without_ack() {
    let (mut server, mut client) = start_server(ServerBuilder::new()).await;

    let mut bytes = wire::window(b'2', 1);
    bytes.extend(wire::json_frame(1, b"{}"));
    client.write_all(&bytes).await.unwrap();

    // Delivered but never acknowledged.
    let _batch = server.receive().await.unwrap();

    server.close().await;

    let mut rest = Vec::new();
    let n = client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0, "no ACK bytes may follow a close");
}

#[tokio::test]
async fn truncated_window_gets_no_ack() {
    // Window claims 5 events, client sends 3 and disconnects.
    let (mut server, mut client) = start_server(ServerBuilder::new()).await;

    let mut bytes = wire::window(b'2', 5);
    for seq in 1..=3 {
        bytes.extend(wire::json_frame(seq, b"{}"));
    }
    client.write_all(&bytes).await.unwrap();
    drop(client);

    let mut receiver = server.take_receiver().unwrap();
    // No batch is ever produced for the truncated window.
    let got = tokio::time::timeout(Duration::from_millis(200), receiver.recv()).await;
    assert!(got.is_err() || got.unwrap().is_none());

    server.close().await;
}

#[tokio::test]
async fn interleaved_connections_deliver_independently() {
    let (mut server, mut first) = start_server(ServerBuilder::new()).await;
    let mut second = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();

    let mut bytes = wire::window(b'2', 1);
    bytes.extend(wire::json_frame(1, b"{\"conn\":1}"));
    first.write_all(&bytes).await.unwrap();

    let mut bytes = wire::window(b'1', 1);
    bytes.extend(wire::kv_frame(1, &[("conn", "2")]));
    second.write_all(&bytes).await.unwrap();

    // Both batches arrive (in whichever order) and each connection gets
    // its own versioned ACK.
    let a = server.receive().await.unwrap();
    let b = server.receive().await.unwrap();
    a.ack();
    b.ack();

    assert_eq!(read_ack(&mut first).await, [b'2', b'A', 0, 0, 0, 1]);
    assert_eq!(read_ack(&mut second).await, [b'1', b'A', 0, 0, 0, 1]);

    server.close().await;
}
