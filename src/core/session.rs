//! Per-connection session state machine
//!
//! `New -> AwaitingHeader -> Established(Outbound) -> Closed`, with a direct
//! jump to `Closed` on any failure. The outbound side is a sum type, so a
//! session holds at most one TCP connection or one DNS relay, never both.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::dns::DnsRelay;
use super::identity::Identity;
use super::outbound::connect_tcp;
use super::protocol::{response_header, VlessCmd, VlessRequest};
use super::relay::{pump_dns, pump_stream, CopyResult, PumpEnd, ResponseWriter};
use super::server::RelayContext;
use crate::error::{ProtocolError, RelayError, Result};
use crate::logger::log;
use crate::transport::{Transport, TransportReader};

/// Outbound side of an established session
#[derive(Debug)]
pub enum Outbound {
    Tcp(TcpStream),
    Dns(DnsRelay),
}

impl Outbound {
    pub fn mode(&self) -> &'static str {
        match self {
            Outbound::Tcp(_) => "tcp",
            Outbound::Dns(_) => "udp-dns",
        }
    }

    /// Address on the far side of the outbound socket
    pub fn remote(&self) -> Option<SocketAddr> {
        match self {
            Outbound::Tcp(stream) => stream.peer_addr().ok(),
            Outbound::Dns(relay) => Some(relay.upstream()),
        }
    }
}

#[derive(Debug)]
pub enum SessionState {
    /// Transport accepted, nothing read yet
    New,
    /// Collecting frames until a complete header decodes
    AwaitingHeader,
    /// Outbound open, the pump owns all further I/O
    Established(Outbound),
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::AwaitingHeader => "awaiting-header",
            SessionState::Established(Outbound::Tcp(_)) => "tcp-established",
            SessionState::Established(Outbound::Dns(_)) => "udp-established",
            SessionState::Closed => "closed",
        }
    }
}

/// Decode the early data carried in `Sec-WebSocket-Protocol`
///
/// Accepts the URL-safe and standard alphabets, padded or not. An absent or
/// blank header means no early data.
pub fn decode_early_data(header: Option<&str>) -> Result<Option<Bytes>> {
    let Some(raw) = header.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let normalized: String = raw
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    let data = URL_SAFE_NO_PAD
        .decode(normalized)
        .map_err(|e| RelayError::Transport(format!("invalid early data: {}", e)))?;
    Ok(Some(Bytes::from(data)))
}

/// Read frames into `buf` until it holds a complete header
///
/// End of stream before that is `Truncated`. Any other rejection is
/// returned as soon as the header is complete.
pub async fn read_header(
    reader: &mut dyn TransportReader,
    identity: &Identity,
    buf: &mut BytesMut,
) -> Result<VlessRequest> {
    loop {
        match VlessRequest::decode(buf, identity) {
            Err(ProtocolError::Truncated) => {}
            other => return other.map_err(RelayError::from),
        }
        match reader
            .recv()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?
        {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => return Err(ProtocolError::Truncated.into()),
        }
    }
}

/// Open the outbound side a request asks for
pub async fn open_outbound(ctx: &RelayContext, request: &VlessRequest) -> Result<Outbound> {
    match request.cmd {
        VlessCmd::Tcp => connect_tcp(&request.addr, ctx.egress.as_ref(), ctx.dial_options())
            .await
            .map(Outbound::Tcp),
        VlessCmd::Udp => DnsRelay::open(ctx.dns_upstream)
            .await
            .map(Outbound::Dns)
            .map_err(|source| RelayError::Connect {
                target: ctx.dns_upstream.to_string(),
                source,
            }),
    }
}

/// One accepted, upgraded connection
pub struct Session<'a> {
    ctx: &'a RelayContext,
    transport: Transport,
    cancel: CancellationToken,
    state: SessionState,
}

impl<'a> Session<'a> {
    pub fn new(ctx: &'a RelayContext, transport: Transport, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            transport,
            cancel,
            state: SessionState::New,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.transport.meta.peer_addr
    }

    /// Drive the session from `New` until the pump stops
    ///
    /// Does not close the session; call [`Session::close`] afterwards
    /// whatever the outcome.
    pub async fn run(&mut self, early_data: Option<&str>) -> Result<CopyResult> {
        if !matches!(self.state, SessionState::New) {
            return Err(RelayError::Transport(format!(
                "session already {}",
                self.state.name()
            )));
        }

        let cancel = self.cancel.clone();
        let (version, payload) = tokio::select! {
            r = self.establish(early_data) => r?,
            _ = cancel.cancelled() => {
                return Ok(CopyResult { up: 0, down: 0, end: PumpEnd::Cancelled });
            }
        };
        self.pump(version, payload).await
    }

    /// Parse the header and open the outbound side
    ///
    /// Returns the request version and the leftover payload of the frames
    /// that carried the header.
    async fn establish(&mut self, early_data: Option<&str>) -> Result<(u8, Bytes)> {
        let ctx = self.ctx;
        let mut buf = BytesMut::new();
        if let Some(early) = decode_early_data(early_data)? {
            log::trace!(peer = %self.peer_addr(), len = early.len(), "Early data received");
            buf.extend_from_slice(&early);
        }
        self.state = SessionState::AwaitingHeader;

        let request = match tokio::time::timeout(
            ctx.conn_config.request_timeout,
            read_header(self.transport.reader.as_mut(), &ctx.identity, &mut buf),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ProtocolError::Truncated.into()),
        };

        let peer = self.peer_addr().to_string();
        log::authentication(&peer, true);
        log::debug!(
            peer = %peer,
            cmd = ?request.cmd,
            target = %request.addr,
            "VLESS request"
        );

        let outbound = open_outbound(ctx, &request).await?;
        log::debug!(
            peer = %peer,
            mode = outbound.mode(),
            remote = ?outbound.remote(),
            "Outbound established"
        );
        let payload = buf.split_off(request.payload_offset).freeze();
        self.state = SessionState::Established(outbound);
        Ok((request.version, payload))
    }

    async fn pump(&mut self, version: u8, payload: Bytes) -> Result<CopyResult> {
        let opts = self.ctx.pump_options();
        let SessionState::Established(outbound) = &mut self.state else {
            return Err(RelayError::Transport("session not established".to_string()));
        };

        let reader = self.transport.reader.as_mut();
        let mut writer =
            ResponseWriter::new(self.transport.writer.as_mut(), response_header(version));
        match outbound {
            Outbound::Tcp(stream) => {
                pump_stream(reader, &mut writer, stream, &payload, opts, &self.cancel).await
            }
            Outbound::Dns(relay) => {
                pump_dns(reader, &mut writer, relay, &payload, opts, &self.cancel).await
            }
        }
    }

    /// Tear down both sides; a second call is a no-op
    ///
    /// The closing handshake gets `request_timeout` to complete. A peer that
    /// stops reading cannot hold the session open past that: the transport
    /// is detached and its connection dropped.
    pub async fn close(&mut self, reason: &str) {
        if matches!(self.state, SessionState::Closed) {
            return;
        }
        // Dropping the previous state releases the outbound socket
        self.state = SessionState::Closed;
        self.cancel.cancel();

        let close_timeout = self.ctx.conn_config.request_timeout;
        let closed = tokio::time::timeout(close_timeout, self.transport.writer.close()).await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::trace!(peer = %self.peer_addr(), error = %e, "Transport close failed");
            }
            Err(_) => {
                log::debug!(peer = %self.peer_addr(), "Transport close timed out, dropping connection");
                self.transport.detach();
            }
        }
        log::session_closed(&self.peer_addr().to_string(), reason);
    }
}
