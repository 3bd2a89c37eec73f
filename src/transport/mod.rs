//! Transport layer abstraction
//!
//! Sessions consume the upgraded connection as a sequence of binary
//! messages rather than a byte stream: on the UDP path every message is one
//! datagram, so message boundaries must survive.
//!
//! - `ws`: WebSocket transport over `tokio-tungstenite`
//! - `http`: plain HTTP front door that routes non-upgrade requests

pub mod http;
#[cfg(test)]
pub(crate) mod memory;
pub mod ws;

pub use ws::{WsReader, WsWriter};

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

/// Receiving half of an upgraded transport
#[async_trait]
pub trait TransportReader: Send {
    /// Next message payload, `Ok(None)` once the peer has closed
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// Sending half of an upgraded transport
#[async_trait]
pub trait TransportWriter: Send {
    /// Send one message, waiting for the transport to accept it
    async fn send(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Close the transport. Closing an already-closed transport is a no-op.
    async fn close(&mut self) -> io::Result<()>;
}

/// Connection metadata
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
    /// Request path of the upgrade
    pub path: String,
}

/// An accepted, upgraded connection
pub struct Transport {
    pub reader: Box<dyn TransportReader>,
    pub writer: Box<dyn TransportWriter>,
    pub meta: ConnectionMeta,
}

impl Transport {
    pub fn new<R, W>(reader: R, writer: W, meta: ConnectionMeta) -> Self
    where
        R: TransportReader + 'static,
        W: TransportWriter + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            meta,
        }
    }

    /// Drop both halves, releasing the underlying connection without any
    /// closing handshake. Later reads see end of stream, later sends fail.
    pub fn detach(&mut self) {
        self.reader = Box::new(Detached);
        self.writer = Box::new(Detached);
    }
}

/// Stand-in for the halves of a detached transport
struct Detached;

#[async_trait]
impl TransportReader for Detached {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        Ok(None)
    }
}

#[async_trait]
impl TransportWriter for Detached {
    async fn send(&mut self, _chunk: Bytes) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport detached"))
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
