//! Handshake performed immediately after the socket opens.
//!
//! One call is one attempt: dial, send the `0x23` handshake, and wait for a
//! `0x28` HELLO_ACK. Retry and backoff live in the connection manager.

use bridge_wire::{decode_packet, encode_handshake, hello_ack_status, PacketFramer, PacketType};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::ConnectionError;
use crate::pending::PendingQueue;
use crate::transport::{BoxedStream, Connector};

/// Identity presented in the handshake
#[derive(Clone)]
pub(crate) struct Credentials {
    pub(crate) endpoint: [u8; 4],
    pub(crate) auth_code: Bytes,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &hex(&self.endpoint))
            .field("auth_code", &"<redacted>")
            .finish()
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A socket that completed the handshake
pub(crate) struct Established {
    pub(crate) reader: ReadHalf<BoxedStream>,
    pub(crate) writer: WriteHalf<BoxedStream>,
    pub(crate) framer: PacketFramer,
    /// Complete frames that arrived in the same read as the HELLO_ACK
    pub(crate) backlog: Vec<Bytes>,
}

/// Run one handshake attempt against `connector`.
///
/// The HELLO_ACK expectation is registered in `pending` before the handshake
/// is written and always removed before returning.
pub(crate) async fn perform_handshake(
    connector: &dyn Connector,
    credentials: &Credentials,
    pending: &PendingQueue,
    timeout: Duration,
) -> Result<Established, ConnectionError> {
    let deadline = Instant::now() + timeout;
    let stream = tokio::time::timeout_at(deadline, connector.dial())
        .await
        .map_err(|_| ConnectionError::Timeout("dial"))??;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let ticket = pending.register(PacketType::HelloAck, "handshake", 0);
    let result = exchange(
        &mut reader,
        &mut writer,
        credentials,
        pending,
        deadline,
    )
    .await;
    pending.remove(ticket.msg_id);

    let (framer, backlog) = result?;
    debug!(
        target_desc = %connector.describe(),
        endpoint = %hex(&credentials.endpoint),
        backlog = backlog.len(),
        "handshake accepted"
    );
    Ok(Established {
        reader,
        writer,
        framer,
        backlog,
    })
}

async fn exchange(
    reader: &mut ReadHalf<BoxedStream>,
    writer: &mut WriteHalf<BoxedStream>,
    credentials: &Credentials,
    pending: &PendingQueue,
    deadline: Instant,
) -> Result<(PacketFramer, Vec<Bytes>), ConnectionError> {
    let hello = encode_handshake(credentials.endpoint, &credentials.auth_code)?;
    tokio::time::timeout_at(deadline, async {
        writer.write_all(&hello).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| ConnectionError::Timeout("handshake write"))??;
    trace!(len = hello.len(), "handshake sent");

    let mut framer = PacketFramer::new();
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        buf.clear();
        let n = tokio::time::timeout_at(deadline, reader.read_buf(&mut buf))
            .await
            .map_err(|_| ConnectionError::Timeout("handshake ack"))??;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }

        let mut frames = framer.feed(&buf).into_iter();
        let Some(first) = frames.next() else {
            continue;
        };

        let ack = decode_packet(&first)?;
        if ack.packet_type != PacketType::HelloAck {
            return Err(ConnectionError::Protocol(format!(
                "expected HELLO_ACK (0x28), got {:#04x}",
                ack.packet_type.as_u8()
            )));
        }

        let status = hello_ack_status(&ack);
        if status != 0 {
            return Err(ConnectionError::AuthenticationFailed(status));
        }

        pending.complete(&ack);
        return Ok((framer, frames.collect()));
    }
}
