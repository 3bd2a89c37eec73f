//! Live-session registry
//!
//! Tracks active sessions for status reporting and graceful shutdown. Every
//! session token is a child of the registry's shutdown token, so cancelling
//! the registry tears down all sessions at once.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Unique session identifier
pub type SessionId = u64;

#[derive(Debug)]
struct ActiveSession {
    peer_addr: SocketAddr,
    started_at: Instant,
}

/// Registry of live sessions
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    next_id: Arc<AtomicU64>,
    sessions: Arc<DashMap<SessionId, ActiveSession>>,
    shutdown: CancellationToken,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_shutdown(CancellationToken::new())
    }

    /// Registry whose sessions are cancelled together with `shutdown`
    pub fn with_shutdown(shutdown: CancellationToken) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Register a new session and return its ID and cancellation token
    pub fn register(&self, peer_addr: SocketAddr) -> (SessionId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = self.shutdown.child_token();

        self.sessions.insert(
            id,
            ActiveSession {
                peer_addr,
                started_at: Instant::now(),
            },
        );
        (id, cancel_token)
    }

    pub fn unregister(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            log::trace!(
                session_id = id,
                peer = %session.peer_addr,
                duration_ms = session.started_at.elapsed().as_millis() as u64,
                "Session unregistered"
            );
        }
    }

    /// Number of live sessions
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel every live and future session
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
