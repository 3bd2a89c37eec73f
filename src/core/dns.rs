//! DNS-over-UDP exchange for UDP sessions
//!
//! Each transport chunk is sent as one query datagram to the configured
//! upstream resolver. Responses go back to the transport as
//! `[len: u16 BE][datagram]` so several in-flight queries can share the
//! stream.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::logger::log;

/// Largest datagram a UDP socket can deliver
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// UDP write path of a session
#[derive(Debug)]
pub struct DnsRelay {
    socket: UdpSocket,
    upstream: SocketAddr,
}

impl DnsRelay {
    /// Bind an ephemeral socket connected to `upstream`
    pub async fn open(upstream: SocketAddr) -> io::Result<Self> {
        let bind_addr: SocketAddr = if upstream.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(upstream).await?;
        log::trace!(local = ?socket.local_addr().ok(), "DNS relay socket bound");
        Ok(Self { socket, upstream })
    }

    /// Upstream resolver address
    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Send one query datagram; empty chunks are skipped
    ///
    /// Returns the number of bytes sent.
    pub async fn write(&self, query: &[u8]) -> io::Result<usize> {
        if query.is_empty() {
            return Ok(0);
        }
        self.socket.send(query).await
    }

    /// Wait for the next response and return it length-prefixed
    pub async fn recv_framed(&self, buf: &mut [u8]) -> io::Result<Bytes> {
        let n = self.socket.recv(buf).await?;
        Ok(frame_datagram(&buf[..n]))
    }
}

/// Prefix a datagram with its 2-byte big-endian length
pub fn frame_datagram(datagram: &[u8]) -> Bytes {
    debug_assert!(datagram.len() <= u16::MAX as usize);
    let mut out = BytesMut::with_capacity(2 + datagram.len());
    out.put_u16(datagram.len() as u16);
    out.extend_from_slice(datagram);
    out.freeze()
}
