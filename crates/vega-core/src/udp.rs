//! UDP transport for the message bus.
//!
//! One datagram per published message. The wire format is:
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────────────┐
//! │ channel_len  │ channel (UTF-8)  │ payload                  │
//! │ u8 (1 byte)  │ channel_len bytes│ variable length          │
//! └──────────────┴──────────────────┴──────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::bus::{BusMessage, MessageBus};
use crate::error::{Result, VegaError};

/// Maximum UDP payload size.
const MAX_UDP_PAYLOAD: usize = 65507;

// ---------------------------------------------------------------------------
// UdpBus
// ---------------------------------------------------------------------------

/// Publishes bus messages as UDP datagrams to a fixed destination.
///
/// Sends are awaited, so socket errors surface to the caller (and from there
/// to the publisher's circuit breaker).
pub struct UdpBus {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl UdpBus {
    pub async fn connect(dest: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if dest.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| VegaError::Bus(format!("udp bind: {e}")))?;
        socket
            .connect(dest)
            .await
            .map_err(|e| VegaError::Bus(format!("udp connect {dest}: {e}")))?;
        Ok(Self { socket, dest })
    }
}

#[async_trait]
impl MessageBus for UdpBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(channel, payload)?;
        self.socket
            .send(&frame)
            .await
            .map_err(|e| VegaError::Bus(format!("udp send to {}: {e}", self.dest)))?;
        Ok(())
    }
}

/// Encode `channel` + `payload` into a single datagram.
pub fn encode_frame(channel: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let name = channel.as_bytes();
    let Ok(len) = u8::try_from(name.len()) else {
        return Err(VegaError::Bus(format!("channel name too long: {channel}")));
    };
    let total = 1 + name.len() + payload.len();
    if total > MAX_UDP_PAYLOAD {
        return Err(VegaError::Bus(format!(
            "message of {total} bytes exceeds UDP limit"
        )));
    }
    let mut buf = Vec::with_capacity(total);
    buf.push(len);
    buf.extend_from_slice(name);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a datagram produced by [`encode_frame`].
pub fn decode_frame(buf: &[u8]) -> Option<BusMessage> {
    let (&len, rest) = buf.split_first()?;
    let len = usize::from(len);
    if rest.len() < len {
        return None;
    }
    let channel = std::str::from_utf8(&rest[..len]).ok()?.to_string();
    Some(BusMessage {
        channel,
        payload: Arc::from(&rest[len..]),
    })
}

// ---------------------------------------------------------------------------
// UdpBusReceiver
// ---------------------------------------------------------------------------

/// Receiving end for downstream consumers of a [`UdpBus`].
pub struct UdpBusReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UdpBusReceiver {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| VegaError::Bus(format!("udp bind {addr}: {e}")))?;
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_UDP_PAYLOAD],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| VegaError::Bus(e.to_string()))
    }

    /// Wait for the next well-formed message; malformed datagrams are skipped.
    pub async fn recv(&mut self) -> Result<BusMessage> {
        loop {
            let n = self
                .socket
                .recv(&mut self.buf)
                .await
                .map_err(|e| VegaError::Bus(format!("udp recv: {e}")))?;
            match decode_frame(&self.buf[..n]) {
                Some(msg) => return Ok(msg),
                None => debug!("dropping malformed UDP frame of {n} bytes"),
            }
        }
    }
}
