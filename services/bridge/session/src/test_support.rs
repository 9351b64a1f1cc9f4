//! In-memory peers for connection tests.

use async_trait::async_trait;
use bridge_wire::{decode_packet, Frame, HEADER_SIZE};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::error::ConnectionError;
use crate::transport::{BoxedStream, Connector};

/// HELLO_ACK with status 0
pub(crate) const HELLO_ACK_OK: [u8; 6] = [0x28, 0, 0, 0, 1, 0x00];

/// Connector handing out pre-built duplex streams, one per dial
#[derive(Debug)]
pub(crate) struct ScriptedConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
    dials: AtomicUsize,
}

impl ScriptedConnector {
    /// Connector with `count` dialable streams; returns the peer ends in dial order
    pub(crate) fn new(count: usize) -> (Self, Vec<DuplexStream>) {
        let mut clients = VecDeque::with_capacity(count);
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            let (client, peer) = tokio::io::duplex(64 * 1024);
            clients.push_back(client);
            peers.push(peer);
        }
        let connector = Self {
            streams: Mutex::new(clients),
            dials: AtomicUsize::new(0),
        };
        (connector, peers)
    }

    /// Number of dial attempts made so far
    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn dial(&self) -> Result<BoxedStream, ConnectionError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(ConnectionError::Dial {
                target: self.describe(),
                reason: "connection refused".into(),
            }),
        }
    }

    fn describe(&self) -> String {
        "scripted://peer".into()
    }
}

/// Read one complete frame from the peer side
pub(crate) async fn read_frame(peer: &mut DuplexStream) -> Frame {
    let mut header = [0u8; HEADER_SIZE];
    peer.read_exact(&mut header).await.unwrap();
    let len = ((header[3] as usize) << 8) | header[4] as usize;
    let mut raw = header.to_vec();
    raw.resize(HEADER_SIZE + len, 0);
    peer.read_exact(&mut raw[HEADER_SIZE..]).await.unwrap();
    decode_packet(&raw).unwrap()
}

/// Read the handshake the client sends first
pub(crate) async fn read_handshake(peer: &mut DuplexStream) -> Frame {
    let frame = read_frame(peer).await;
    assert_eq!(frame.packet_type.as_u8(), 0x23, "expected handshake");
    frame
}

/// Read the handshake and accept it
pub(crate) async fn accept(peer: &mut DuplexStream) {
    read_handshake(peer).await;
    peer.write_all(&HELLO_ACK_OK).await.unwrap();
}

/// Poll `condition` every 10ms until it holds or `limit` elapses
pub(crate) async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
