//! HTTP front door
//!
//! Reads the request head of a fresh connection. Upgrade requests continue
//! to the WebSocket handshake with the consumed bytes replayed; every other
//! request is answered here over plain HTTP/1.1 and the connection closed.

use ::http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use ::http::{Response, StatusCode};
use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::core::Identity;

/// Largest request head accepted
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

/// The parts of a request head the front door routes on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    /// `Upgrade: websocket` present
    pub upgrade: bool,
}

/// Parse a request head, `Ok(None)` while it is still incomplete
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(buf)?.is_partial() {
        return Ok(None);
    }

    let mut head = RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        path: req.path.unwrap_or("/").to_string(),
        ..RequestHead::default()
    };
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            head.host = std::str::from_utf8(header.value).ok().map(str::to_string);
        } else if header.name.eq_ignore_ascii_case("upgrade") {
            head.upgrade = std::str::from_utf8(header.value)
                .map(|v| {
                    v.split(',')
                        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
                })
                .unwrap_or(false);
        }
    }
    Ok(Some(head))
}

/// Read until a complete request head has arrived
///
/// Returns the head together with a stream that replays every byte read so
/// far, so the WebSocket handshake sees the untouched request.
pub async fn read_request_head<S>(mut stream: S) -> io::Result<(RequestHead, Rewind<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        match parse_head(&buf) {
            Ok(Some(head)) => return Ok((head, Rewind::new(stream, buf.freeze()))),
            Ok(None) if buf.len() < MAX_HEAD_SIZE => continue,
            Ok(None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ))
            }
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed request head: {}", e),
                ))
            }
        }
    }
}

#[derive(Serialize)]
struct ServerInfo<'a> {
    peer: String,
    active_sessions: usize,
    version: &'a str,
}

/// Client link for the configured identity
pub fn config_link(identity: &Identity, host: &str) -> String {
    format!(
        "vless://{}@{}:443?encryption=none&security=tls&type=ws#VLESS+WS+TLS",
        identity, host
    )
}

fn text(status: StatusCode, content_type: &'static str, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, ::http::HeaderValue::from_static(content_type));
    response
}

/// Answer a non-upgrade request
pub fn route(
    head: &RequestHead,
    identity: &Identity,
    peer_addr: SocketAddr,
    active_sessions: usize,
) -> Response<String> {
    let not_found = || {
        text(
            StatusCode::NOT_FOUND,
            "text/plain;charset=utf-8",
            "Not found".to_string(),
        )
    };
    if head.method != "GET" {
        return not_found();
    }

    let path = head.path.split('?').next().unwrap_or("/");
    if path == "/" {
        let info = ServerInfo {
            peer: peer_addr.to_string(),
            active_sessions,
            version: env!("CARGO_PKG_VERSION"),
        };
        return match serde_json::to_string(&info) {
            Ok(body) => text(StatusCode::OK, "application/json", body),
            Err(e) => text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain;charset=utf-8",
                e.to_string(),
            ),
        };
    }

    if path.strip_prefix('/') == Some(identity.to_string().as_str()) {
        let host = head.host.as_deref().unwrap_or_default();
        return text(
            StatusCode::OK,
            "text/plain;charset=utf-8",
            config_link(identity, host),
        );
    }

    not_found()
}

/// Serialize an HTTP/1.1 response; the connection is not reused
///
/// Only what the front door answers with: a complete in-memory body framed
/// by `content-length`, followed by `connection: close`. No chunked or
/// streamed bodies, no keep-alive. Framing headers already on `response`
/// are replaced.
pub fn encode_response(response: &Response<String>) -> Vec<u8> {
    let status = response.status();
    let body = response.body();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in response.headers() {
        if *name == CONTENT_LENGTH || *name == CONNECTION || *name == TRANSFER_ENCODING {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("{}: {}\r\n", CONTENT_LENGTH, body.len()).as_bytes());
    out.extend_from_slice(format!("{}: close\r\n\r\n", CONNECTION).as_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

pub async fn write_response<S>(stream: &mut S, response: &Response<String>) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_response(response)).await?;
    stream.shutdown().await
}

/// Stream that yields a buffered prefix before reading from `inner`
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
