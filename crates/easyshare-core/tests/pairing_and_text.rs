//! End-to-end pairing and text scenarios over loopback TCP.

mod common;

use common::{pair, spawn_peer, wait_event, wait_pairing_step};

use easyshare_core::device::Platform;
use easyshare_core::events::{EasyShareEvent, PairingStep};
use easyshare_core::protocol::{encode_frame, Message, MessageBuffer, Payload};
use easyshare_core::storage::{Storage, TransferDirection, TransferKind};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn pairing_success_produces_matching_secrets() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let mut a = spawn_peer("Alpha", Platform::Desktop, dir_a.path()).await;
    let mut b = spawn_peer("Beta", Platform::Desktop, dir_b.path()).await;

    pair(&mut a, &mut b, "7291").await;

    let a_paired = a.storage.paired_devices().unwrap();
    let b_paired = b.storage.paired_devices().unwrap();
    assert_eq!(a_paired.len(), 1);
    assert_eq!(b_paired.len(), 1);
    assert_eq!(a_paired[0].info.id, b.device.id);
    assert_eq!(b_paired[0].info.id, a.device.id);
    assert_eq!(
        a_paired[0].shared_secret, b_paired[0].shared_secret,
        "the same passphrase must yield the same key on both sides"
    );
}

#[tokio::test]
async fn pairing_mismatch_fails_both_sides() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let mut a = spawn_peer("Alpha", Platform::Desktop, dir_a.path()).await;
    let mut b = spawn_peer("Beta", Platform::Desktop, dir_b.path()).await;

    a.handle.connect(b.device.clone()).await.unwrap();
    a.handle.start_pairing("7291".to_string()).await;
    wait_event(&mut b.events, |event| match event {
        EasyShareEvent::PairingRequest(device) => Some(device.clone()),
        _ => None,
    })
    .await;
    b.handle.provide_passphrase("0000".to_string()).await;

    wait_pairing_step(&mut a.events, PairingStep::Failed).await;
    wait_pairing_step(&mut b.events, PairingStep::Failed).await;

    assert!(a.storage.paired_devices().unwrap().is_empty());
    assert!(b.storage.paired_devices().unwrap().is_empty());
}

#[tokio::test]
async fn text_roundtrip_records_both_histories() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let mut a = spawn_peer("Alpha", Platform::Desktop, dir_a.path()).await;
    let mut b = spawn_peer("Beta", Platform::Desktop, dir_b.path()).await;

    pair(&mut a, &mut b, "7291").await;

    a.handle.send_text("hello".to_string()).await.unwrap();

    let (content, from) = wait_event(&mut b.events, |event| match event {
        EasyShareEvent::TextReceived { content, from } => {
            Some((content.clone(), from.clone()))
        }
        _ => None,
    })
    .await;
    assert_eq!(content, "hello");
    assert_eq!(from.id, a.device.id);

    let a_history = a.storage.transfers().unwrap();
    assert_eq!(a_history.len(), 1);
    assert_eq!(a_history[0].direction, TransferDirection::Send);
    assert_eq!(
        a_history[0].kind,
        TransferKind::Text {
            content: "hello".to_string()
        }
    );

    let b_history = b.storage.transfers().unwrap();
    assert_eq!(b_history.len(), 1);
    assert_eq!(b_history[0].direction, TransferDirection::Receive);
    assert_eq!(b_history[0].device_id, a.device.id);
    assert_eq!(
        b_history[0].kind,
        TransferKind::Text {
            content: "hello".to_string()
        }
    );
}

#[tokio::test]
async fn second_inbound_connection_is_refused() {
    let dir = TempDir::new().unwrap();
    let b = spawn_peer("Beta", Platform::Desktop, dir.path()).await;

    // First connection gets adopted and serviced.
    let mut first = tokio::net::TcpStream::connect(("127.0.0.1", b.port))
        .await
        .unwrap();
    let ping = Message::new(Payload::Ping);
    first.write_all(&encode_frame(&ping).unwrap()).await.unwrap();

    // Let the manager adopt the socket before the contender shows up.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    // The contender is refused: its socket is destroyed without a frame.
    let mut second = tokio::net::TcpStream::connect(("127.0.0.1", b.port))
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(std::time::Duration::from_secs(10), second.read(&mut buf))
        .await
        .expect("refusal should be prompt")
        .unwrap();
    assert_eq!(n, 0, "second connection must see EOF");

    // The first connection still works: our ping got its pong.
    let mut buffer = MessageBuffer::new();
    let pong = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            let mut chunk = [0u8; 1024];
            let n = first.read(&mut chunk).await.unwrap();
            assert_ne!(n, 0, "first connection must stay open");
            buffer.append(&chunk[..n]);
            for message in buffer.drain().unwrap() {
                if message.payload == Payload::Pong {
                    return message;
                }
            }
        }
    })
    .await
    .expect("pong expected");
    assert_eq!(pong.id, ping.id, "pong must echo the ping id");
}

#[tokio::test]
async fn oversized_frame_tears_connection_down() {
    let dir = TempDir::new().unwrap();
    let b = spawn_peer("Beta", Platform::Desktop, dir.path()).await;

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", b.port))
        .await
        .unwrap();

    // Announce a payload one byte over the limit.
    let mut header = Vec::new();
    header.extend_from_slice(&((10 * 1024 * 1024 + 1) as u32).to_be_bytes());
    header.push(0x20);
    stream.write_all(&header).await.unwrap();

    // The manager reports the protocol error and closes the socket.
    let mut buf = Vec::new();
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        stream.read_to_end(&mut buf),
    )
    .await
    .expect("socket should close");
    assert!(result.is_ok(), "clean close expected");
}
