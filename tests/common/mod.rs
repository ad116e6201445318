//! Loopback server speaking the response framing, shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use connmux::config::{Config, ReadMode};
use connmux::protocol::{encode_message, Message, ResponseStatus, StreamId};
use connmux::Endpoint;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Accepts any number of connections. Every request
/// `[stream_id: 2][len: u32 BE][body]` is answered with an ok frame
/// carrying the same stream id and body.
pub struct TestServer {
    endpoint: Endpoint,
    accepted: Arc<AtomicUsize>,
    writers: Arc<Mutex<Vec<SharedWriter>>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let writers: Arc<Mutex<Vec<SharedWriter>>> = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let accepted = Arc::clone(&accepted);
            let writers = Arc::clone(&writers);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (mut reader, writer) = stream.into_split();
                    let writer = Arc::new(Mutex::new(writer));
                    writers.lock().await.push(Arc::clone(&writer));
                    // Counted once the connection can receive pushed frames
                    accepted.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        loop {
                            let mut header = [0u8; 6];
                            if reader.read_exact(&mut header).await.is_err() {
                                break;
                            }
                            let stream_id = StreamId::from_bytes([header[0], header[1]]);
                            let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
                            let mut body = vec![0u8; len as usize];
                            if reader.read_exact(&mut body).await.is_err() {
                                break;
                            }

                            let reply = encode_message(&Message::new(stream_id, ResponseStatus::Ok, body)).unwrap();
                            if writer.lock().await.write_all(&reply).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            })
        };

        Self {
            endpoint: Endpoint::new("127.0.0.1", port),
            accepted,
            writers,
            handle,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Number of TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Send a raw frame on every accepted connection
    pub async fn push(&self, frame: Bytes) {
        for writer in self.writers.lock().await.iter() {
            let _ = writer.lock().await.write_all(&frame).await;
        }
    }

    /// Send an unsolicited (attn) frame on every accepted connection
    pub async fn push_unsolicited(&self, body: &'static [u8]) {
        self.push(encode_message(&Message::unsolicited(body)).unwrap()).await;
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Encode a request the test server answers
pub fn request(stream_id: StreamId, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + body.len());
    frame.extend_from_slice(&stream_id.to_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Manager configuration with short timeouts and no background collector
pub fn test_config(read_mode: ReadMode) -> Config {
    let mut config = Config::default();
    config.manager.read_mode = read_mode;
    config.manager.connect_timeout = Duration::from_secs(2);
    config.manager.request_timeout = Duration::from_millis(500);
    config.gc.enabled = false;
    config
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
