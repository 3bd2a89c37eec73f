//! WebSocket transport
//!
//! Wraps a `tokio-tungstenite` stream split into reader and writer halves.
//! Works with any AsyncRead + AsyncWrite stream underneath.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::StatusCode;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use super::{TransportReader, TransportWriter};
use crate::logger::log;

/// What the handshake learned about the upgrade request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeInfo {
    /// Request path
    pub path: String,
    /// Raw `Sec-WebSocket-Protocol` value carrying base64 early data
    pub early_data: Option<String>,
}

/// Bounded tungstenite buffers sized from the relay buffer size
///
/// Tungstenite defaults leave the write buffer unbounded, which adds up
/// quickly across many idle sessions.
pub fn ws_config(buf_size: usize) -> WebSocketConfig {
    WebSocketConfig::default()
        .write_buffer_size(buf_size)
        .max_write_buffer_size(buf_size * 2)
        .max_message_size(Some(buf_size * 4))
        .max_frame_size(Some(buf_size * 2))
}

/// A configured path of "" or "/" accepts any request path
pub fn path_allowed(ws_path: &str, request_path: &str) -> bool {
    ws_path.is_empty() || ws_path == "/" || request_path == ws_path
}

/// Complete the server side of the WebSocket handshake
///
/// The early-data header is echoed back so clients that put their first
/// payload in `Sec-WebSocket-Protocol` accept the upgrade.
pub async fn accept<S>(
    stream: S,
    ws_path: &str,
    buf_size: usize,
) -> Result<(WebSocketStream<S>, UpgradeInfo), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut info = UpgradeInfo::default();
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, mut response: Response| {
            let path = req.uri().path();
            if !path_allowed(ws_path, path) {
                log::debug!(path = %path, expected = %ws_path, "WebSocket path mismatch");
                let mut reject = ErrorResponse::new(None);
                *reject.status_mut() = StatusCode::NOT_FOUND;
                return Err(reject);
            }
            info.path = path.to_string();

            if let Some(protocol) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                if let Ok(value) = protocol.to_str() {
                    info.early_data = Some(value.to_string());
                }
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
            }
            Ok(response)
        },
        Some(ws_config(buf_size)),
    )
    .await?;

    Ok((ws_stream, info))
}

/// Split an established WebSocket into transport halves
pub fn split<S>(ws_stream: WebSocketStream<S>) -> (WsReader<S>, WsWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws_stream.split();
    (
        WsReader {
            stream,
            closed: false,
        },
        WsWriter {
            sink,
            closed: false,
        },
    )
}

/// Receiving half: yields binary and text payloads, skips control frames
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    closed: bool,
}

#[async_trait]
impl<S> TransportReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_bytes())))
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.closed = true;
                    return Ok(None);
                }
                // Ping/Pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    self.closed = true;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(io::Error::other(format!("WebSocket error: {}", e)));
                }
            }
        }
    }
}

/// Sending half: one binary message per chunk
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

#[async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "WebSocket closed",
            ));
        }
        self.sink
            .send(Message::Binary(chunk))
            .await
            .map_err(|e| io::Error::other(format!("WebSocket send error: {}", e)))
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(io::Error::other(format!("WebSocket close error: {}", e))),
        }
    }
}
