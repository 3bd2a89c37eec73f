//! Server startup and accept loop
//!
//! Binds the listener, accepts connections and routes each one through the
//! HTTP front door: upgrade requests become sessions, everything else gets a
//! plain HTTP answer.

use crate::core::RelayContext;
use crate::handler;
use crate::logger::log;
use crate::transport::{http, ws, ConnectionMeta, Transport};

use anyhow::{anyhow, Result};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval, matches Go's net.ListenConfig default (15s).
/// Dead peers are detected in ~45s (3 probes x 15s).
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind the listening socket with SO_REUSEADDR and the configured backlog
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    // Allow immediate rebind after restart (skip TIME_WAIT)
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

fn configure_stream(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    // Detect dead peers (mobile disconnect, network change, etc.)
    let keepalive = TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(std::time::Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Serve one accepted connection: front door, then handshake, then session
pub async fn accept_connection<S>(ctx: &RelayContext, stream: S, peer_addr: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let request_timeout = ctx.conn_config.request_timeout;
    let (head, mut stream) =
        tokio::time::timeout(request_timeout, http::read_request_head(stream))
            .await
            .map_err(|_| anyhow!("Request head timeout"))??;

    if !head.upgrade {
        let response = http::route(&head, &ctx.identity, peer_addr, ctx.registry.active_count());
        log::debug!(
            peer = %peer_addr,
            method = %head.method,
            path = %head.path,
            status = response.status().as_u16(),
            "HTTP request"
        );
        http::write_response(&mut stream, &response).await?;
        return Ok(());
    }

    let (ws_stream, info) = tokio::time::timeout(
        request_timeout,
        ws::accept(stream, &ctx.ws_path, ctx.conn_config.buffer_size),
    )
    .await
    .map_err(|_| anyhow!("WebSocket handshake timeout"))??;

    let (reader, writer) = ws::split(ws_stream);
    let meta = ConnectionMeta {
        peer_addr,
        path: info.path,
    };
    handler::handle(ctx, Transport::new(reader, writer, meta), info.early_data).await;
    Ok(())
}

/// Accept connections on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    // Connection limiter: 0 = unlimited
    let conn_limiter = if ctx.conn_config.max_connections > 0 {
        Some(Arc::new(Semaphore::new(ctx.conn_config.max_connections)))
    } else {
        None
    };

    loop {
        let (stream, addr) = tokio::select! {
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!(error = %e, "Failed to accept connection");
                    // Continue accepting unless it's a fatal error
                    if e.kind() == std::io::ErrorKind::Other {
                        break;
                    }
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        let peer_addr = addr.to_string();
        log::connection(&peer_addr, "new");

        // Acquire connection permit (backpressure when at limit)
        let permit = match conn_limiter {
            Some(ref limiter) => tokio::select! {
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            },
            None => None,
        };

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            // Hold permit for the lifetime of this connection
            let _permit = permit;
            configure_stream(&stream, ctx.conn_config.tcp_nodelay);

            if let Err(e) = accept_connection(&ctx, stream, addr).await {
                log::debug!(peer = %peer_addr, error = %e, "Connection error");
            }
            log::connection(&peer_addr, "closed");
        });
    }

    log::info!(active_sessions = ctx.registry.active_count(), "Server stopped accepting");
    Ok(())
}

/// Bind and run the accept loop
pub async fn run_server(
    ctx: Arc<RelayContext>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = bind_listener(addr, ctx.conn_config.tcp_backlog)?;
    let local_addr = listener.local_addr()?;

    log::info!(
        address = %local_addr,
        ws_path = %ctx.ws_path,
        egress = ?ctx.egress.as_ref().map(|e| e.to_string()),
        dns_upstream = %ctx.dns_upstream,
        max_connections = ctx.conn_config.max_connections,
        "Server started"
    );

    serve(listener, ctx, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnConfig;
    use crate::core::Identity;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const UUID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";

    #[tokio::test]
    async fn test_serve_limits_concurrent_connections() {
        let ctx = Arc::new(
            RelayContext::builder()
                .identity(Identity::parse(UUID).unwrap())
                .conn_config(ConnConfig {
                    max_connections: 1,
                    ..ConnConfig::default()
                })
                .build()
                .unwrap(),
        );
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, ctx, shutdown.clone()));

        // First connection holds the only slot while its head is pending
        let mut first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second
            .write_all(b"GET /missing HTTP/1.1\r\nHost: relay.test\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let waiting = tokio::time::timeout(Duration::from_millis(300), second.read(&mut buf)).await;
        assert!(waiting.is_err(), "second connection served while at the limit");

        // Finishing the first connection frees the slot
        first
            .write_all(b"GET /missing HTTP/1.1\r\nHost: relay.test\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        first.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(2), second.read_to_string(&mut response))
            .await
            .expect("second connection served once the slot freed")
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_configure_stream_sets_socket_options() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();

        configure_stream(&stream, true);
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_listener_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (_stream, _) = listener.accept().await.unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_connection_plain_get() {
        let ctx = RelayContext::builder()
            .identity(Identity::parse(UUID).unwrap())
            .build()
            .unwrap();
        let (mut client, server) = tokio::io::duplex(4096);
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();

        client
            .write_all(b"GET /missing HTTP/1.1\r\nHost: relay.test\r\n\r\n")
            .await
            .unwrap();
        accept_connection(&ctx, server, peer).await.unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("Not found"));
        assert_eq!(ctx.registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let ctx = Arc::new(
            RelayContext::builder()
                .identity(Identity::parse(UUID).unwrap())
                .build()
                .unwrap(),
        );
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, ctx, shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), server)
            .await
            .expect("accept loop stopped")
            .unwrap()
            .unwrap();
    }
}
