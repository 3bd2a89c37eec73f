//! Session entry point
//!
//! `handle` is called once per upgraded connection. It registers the
//! session, drives it to completion, reports the outcome once and tears
//! both sides down. Nothing is returned; results show up as transport
//! activity and logs.

use crate::core::{RelayContext, Session};
use crate::error::{ProtocolError, RelayError};
use crate::logger::log;
use crate::transport::Transport;

/// Run one session to completion
pub async fn handle(ctx: &RelayContext, transport: Transport, early_data: Option<String>) {
    let peer_addr = transport.meta.peer_addr.to_string();
    let (session_id, cancel_token) = ctx.registry.register(transport.meta.peer_addr);
    log::debug!(peer = %peer_addr, session_id = session_id, path = %transport.meta.path, "Session registered");

    let _guard = scopeguard::guard((), |_| ctx.registry.unregister(session_id));

    let mut session = Session::new(ctx, transport, cancel_token);
    let reason = match session.run(early_data.as_deref()).await {
        Ok(result) => {
            log::debug!(
                peer = %peer_addr,
                up = result.up,
                down = result.down,
                end = %result.end,
                "Relay completed"
            );
            result.end.to_string()
        }
        Err(e) => {
            report_error(&peer_addr, &e);
            e.kind().to_string()
        }
    };
    session.close(&reason).await;
}

/// Log a session failure at the level its kind deserves
fn report_error(peer_addr: &str, err: &RelayError) {
    match err {
        RelayError::Protocol(ProtocolError::Unauthorized) => {
            log::authentication(peer_addr, false);
        }
        RelayError::Protocol(e) => {
            log::debug!(peer = %peer_addr, error = %e, "Rejected session header");
        }
        RelayError::Connect { .. } => {
            log::warn!(peer = %peer_addr, error = %err, "Outbound connect failed");
        }
        _ => {
            log::debug!(peer = %peer_addr, kind = err.kind(), error = %err, "Session error");
        }
    }
}
