//! End-to-end session lifecycle against a loopback data server

mod common;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use common::{request, test_config, wait_until, TestServer};
use connmux::config::{ReadMode, SocketMode};
use connmux::protocol::{encode_message, ResponseStatus};
use connmux::connection::ConnectionState;
use connmux::{ConnError, ConnectionManager, Endpoint, Message};

#[tokio::test]
async fn test_session_lifecycle() {
    let server = TestServer::start().await;
    let mut config = test_config(ReadMode::Async);
    config.manager.request_timeout = Duration::from_millis(200);
    config.ttl.data_server = Duration::from_millis(200);
    config.gc.enabled = true;
    config.gc.interval = Duration::from_millis(5);
    let manager = ConnectionManager::new(Arc::new(config)).unwrap();
    let endpoint = server.endpoint();

    // First session opens the physical connection
    let l1 = manager.connect(&endpoint).await.unwrap();
    let s1 = manager.stream_id(l1).unwrap();
    manager.write_raw(l1, &request(s1, b"open /data/file1")).await.unwrap();
    let reply = manager.read_message(l1).await.unwrap().unwrap();
    assert_eq!(reply.stream_id(), s1);
    assert_eq!(&reply.body[..], b"open /data/file1");

    // Second session is multiplexed onto it
    let l2 = manager.connect(&endpoint).await.unwrap();
    let physical = manager.physical_for(l1).unwrap();
    assert_eq!(manager.physical_for(l2).unwrap(), physical);
    assert_eq!(manager.ref_count(physical), 2);

    // Responses are routed by stream id
    let s2 = manager.stream_id(l2).unwrap();
    manager.write_raw(l2, &request(s2, b"stat /data/file2")).await.unwrap();
    let reply = manager.read_message(l2).await.unwrap().unwrap();
    assert_eq!(reply.stream_id(), s2);
    assert!(manager.read_message(l1).await.unwrap().is_none());

    manager.disconnect(l1, false).await.unwrap();
    manager.disconnect(l2, false).await.unwrap();
    assert_eq!(manager.ref_count(physical), 0);

    // Reclaimed by the background collector once idle past its TTL
    assert!(wait_until(Duration::from_secs(2), || manager.physical_count() == 0).await);

    // A later session opens a fresh physical connection
    let l3 = manager.connect(&endpoint).await.unwrap();
    assert_ne!(manager.physical_for(l3).unwrap(), physical);
    assert!(wait_until(Duration::from_secs(1), || server.accepted() == 2).await);

    manager.shutdown().await;
    assert_eq!(manager.physical_count(), 0);
}

#[tokio::test]
async fn test_sync_blocking_raw_round_trip() {
    let server = TestServer::start().await;
    let mut config = test_config(ReadMode::Sync);
    config.manager.socket_mode = SocketMode::Blocking;
    let manager = ConnectionManager::new(Arc::new(config)).unwrap();

    let id = manager.connect(&server.endpoint()).await.unwrap();
    let stream = manager.stream_id(id).unwrap();

    let sent = manager.write_raw(id, &request(stream, b"ping")).await.unwrap();
    assert_eq!(sent, 10);

    // 8 byte header followed by the echoed body
    let mut frame = [0u8; 12];
    assert_eq!(manager.read_raw(id, &mut frame).await.unwrap(), 12);
    assert_eq!(&frame[..2], &stream.to_bytes());
    assert_eq!(&frame[4..8], &4i32.to_be_bytes());
    assert_eq!(&frame[8..], b"ping");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sync_read_times_out_as_error() {
    let server = TestServer::start().await;
    let mut config = test_config(ReadMode::Sync);
    config.manager.request_timeout = Duration::from_millis(100);
    let manager = ConnectionManager::new(Arc::new(config)).unwrap();

    let id = manager.connect(&server.endpoint()).await.unwrap();
    let result = manager.read_message(id).await;
    assert!(matches!(result, Err(ConnError::ReadWriteFailed(_))));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_raw_reads_allowed_until_first_async_read() {
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(Arc::new(test_config(ReadMode::Async))).unwrap();

    let id = manager.connect(&server.endpoint()).await.unwrap();
    let stream = manager.stream_id(id).unwrap();

    // A handshake may be done raw before any framed read
    manager.write_raw(id, &request(stream, b"auth")).await.unwrap();
    let mut frame = [0u8; 12];
    assert_eq!(manager.read_raw(id, &mut frame).await.unwrap(), 12);
    assert_eq!(&frame[8..], b"auth");

    manager.write_raw(id, &request(stream, b"open")).await.unwrap();
    let reply = manager.read_message(id).await.unwrap().unwrap();
    assert_eq!(&reply.body[..], b"open");

    // The inbound reader owns the socket from now on
    match manager.read_raw(id, &mut frame).await {
        Err(ConnError::ReadWriteFailed(e)) => assert_eq!(e.kind(), io::ErrorKind::Unsupported),
        other => panic!("expected Unsupported, got {:?}", other),
    }
    let physical = manager.physical_for(id).unwrap();
    assert_eq!(manager.physical_state(physical), Some(ConnectionState::Connected));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failed_sync_socket_is_replaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
    // Accept and hang up every connection
    let server = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    let manager = ConnectionManager::new(Arc::new(test_config(ReadMode::Sync))).unwrap();

    let first = manager.connect(&endpoint).await.unwrap();
    let dead = manager.physical_for(first).unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(manager.read_raw(first, &mut buf).await, Err(ConnError::ReadWriteFailed(_))));
    assert_eq!(manager.physical_state(dead), Some(ConnectionState::Disconnected));

    // New sessions do not bind to the failed connection
    let second = manager.connect(&endpoint).await.unwrap();
    assert_ne!(manager.physical_for(second).unwrap(), dead);

    manager.disconnect(first, false).await.unwrap();
    assert_eq!(manager.ref_count(dead), 0);

    manager.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn test_malformed_inbound_frame_is_counted_and_skipped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
    let manager = ConnectionManager::new(Arc::new(test_config(ReadMode::Async))).unwrap();

    let (connected, accepted) = tokio::join!(manager.connect(&endpoint), listener.accept());
    let id = connected.unwrap();
    let (mut server, _) = accepted.unwrap();
    let stream = manager.stream_id(id).unwrap();

    // Unknown status code 9999, then a well formed reply
    let mut bad = Vec::new();
    bad.extend_from_slice(&stream.to_bytes());
    bad.extend_from_slice(&9999u16.to_be_bytes());
    bad.extend_from_slice(&3i32.to_be_bytes());
    bad.extend_from_slice(b"bad");
    server.write_all(&bad).await.unwrap();
    let good = encode_message(&Message::new(stream, ResponseStatus::Ok, &b"good"[..])).unwrap();
    server.write_all(&good).await.unwrap();

    let reply = manager.read_message(id).await.unwrap().unwrap();
    assert_eq!(&reply.body[..], b"good");
    assert_eq!(manager.metrics_snapshot().protocol_errors_total, 1);

    let physical = manager.physical_for(id).unwrap();
    assert_eq!(manager.physical_state(physical), Some(ConnectionState::Connected));

    manager.shutdown().await;
}
