//! Channel-backed transport for exercising sessions without a socket

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ConnectionMeta, Transport, TransportReader, TransportWriter};

/// Test-side handle of a memory transport
pub struct MemoryPeer {
    to_session: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
    from_session: mpsc::UnboundedReceiver<Bytes>,
    close_calls: Arc<AtomicUsize>,
}

impl MemoryPeer {
    /// Deliver one message to the session
    pub fn send(&self, chunk: impl Into<Bytes>) {
        if let Some(tx) = &self.to_session {
            let _ = tx.send(Ok(chunk.into()));
        }
    }

    /// Make the session's next read fail
    pub fn fail(&self, err: io::Error) {
        if let Some(tx) = &self.to_session {
            let _ = tx.send(Err(err));
        }
    }

    /// End the stream towards the session
    pub fn hang_up(&mut self) {
        self.to_session = None;
    }

    /// Next message the session sent, `None` once its writer is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_session.recv().await
    }

    /// Number of times the session closed its writer
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
}

#[async_trait]
impl TransportReader for MemoryReader {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    close_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(chunk)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.tx = None;
        Ok(())
    }
}

/// Build a transport and the peer handle that drives it
pub fn pair() -> (Transport, MemoryPeer) {
    let (to_session, rx) = mpsc::unbounded_channel();
    let (tx, from_session) = mpsc::unbounded_channel();
    let close_calls = Arc::new(AtomicUsize::new(0));

    let transport = Transport::new(
        MemoryReader { rx },
        MemoryWriter {
            tx: Some(tx),
            close_calls: Arc::clone(&close_calls),
        },
        ConnectionMeta {
            peer_addr: "127.0.0.1:40000".parse().expect("static address"),
            path: "/".to_string(),
        },
    );

    (
        transport,
        MemoryPeer {
            to_session: Some(to_session),
            from_session,
            close_calls,
        },
    )
}
