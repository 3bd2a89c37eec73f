//! Bidirectional stream pump
//!
//! Two copy loops per session, one per direction, raced against each other,
//! an idle watchdog and the session's cancellation token. Whichever finishes
//! first ends the pump and the other loop is dropped mid-flight, so a close
//! on either side tears down both.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use super::dns::{DnsRelay, MAX_DATAGRAM_SIZE};
use crate::error::{RelayError, Result};
use crate::transport::{TransportReader, TransportWriter};

/// Upper bound on how often the idle watchdog wakes up
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Pump tuning
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    /// Read buffer size for the outbound side
    pub buffer_size: usize,
    /// Tear down after this long without traffic; zero disables the check
    pub idle_timeout: Duration,
}

/// Why the pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Transport reached end of stream
    ClientClosed,
    /// Outbound side reached end of stream
    RemoteClosed,
    /// No traffic for the configured idle timeout
    IdleTimeout,
    /// Session cancelled from outside (shutdown)
    Cancelled,
}

impl std::fmt::Display for PumpEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PumpEnd::ClientClosed => "client closed",
            PumpEnd::RemoteClosed => "remote closed",
            PumpEnd::IdleTimeout => "idle timeout",
            PumpEnd::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of a finished pump
#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    /// Bytes moved transport -> outbound
    pub up: u64,
    /// Bytes moved outbound -> transport (payload only, no framing)
    pub down: u64,
    pub end: PumpEnd,
}

/// Shared counters for one pump, readable while both loops run
struct Traffic {
    start: Instant,
    up: AtomicU64,
    down: AtomicU64,
    /// Milliseconds since `start` of the last byte moved
    last_activity: AtomicU64,
}

impl Traffic {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            up: AtomicU64::new(0),
            down: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_activity
            .store(self.start.elapsed().as_millis() as u64, Ordering::Release);
    }

    fn record_up(&self, n: usize) {
        self.up.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    fn record_down(&self, n: usize) {
        self.down.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Acquire);
        let now = self.start.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }

    fn finish(&self, end: PumpEnd) -> CopyResult {
        CopyResult {
            up: self.up.load(Ordering::Relaxed),
            down: self.down.load(Ordering::Relaxed),
            end,
        }
    }
}

/// Transport writer that puts the response header in front of the first
/// message it sends, and only that one
pub struct ResponseWriter<'a> {
    inner: &'a mut dyn TransportWriter,
    header: Option<[u8; 2]>,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(inner: &'a mut dyn TransportWriter, header: [u8; 2]) -> Self {
        Self {
            inner,
            header: Some(header),
        }
    }

    pub async fn send(&mut self, chunk: Bytes) -> std::io::Result<()> {
        let chunk = match self.header.take() {
            Some(header) => {
                let mut buf = BytesMut::with_capacity(header.len() + chunk.len());
                buf.extend_from_slice(&header);
                buf.extend_from_slice(&chunk);
                buf.freeze()
            }
            None => chunk,
        };
        self.inner.send(chunk).await
    }
}

fn transport_err(e: std::io::Error) -> RelayError {
    RelayError::Transport(e.to_string())
}

/// Resolves once the pump has been idle for `idle_timeout`
async fn idle_watch(traffic: &Traffic, idle_timeout: Duration) {
    if idle_timeout.is_zero() {
        return std::future::pending().await;
    }
    let mut interval = tokio::time::interval(idle_timeout.min(IDLE_CHECK_INTERVAL));
    interval.tick().await;
    loop {
        interval.tick().await;
        if traffic.idle_for() >= idle_timeout {
            return;
        }
    }
}

/// Relay between the transport and a byte-stream outbound connection
///
/// `first_payload` is written to the outbound side before any later
/// transport message. The outbound stream is shut down before returning.
pub async fn pump_stream<S>(
    reader: &mut dyn TransportReader,
    writer: &mut ResponseWriter<'_>,
    remote: S,
    first_payload: &[u8],
    opts: PumpOptions,
    cancel: &CancellationToken,
) -> Result<CopyResult>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let traffic = Traffic::new();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let result = tokio::select! {
        r = upload_stream(reader, &mut remote_write, first_payload, &traffic) => r,
        r = download_stream(&mut remote_read, writer, opts.buffer_size, &traffic) => r,
        _ = idle_watch(&traffic, opts.idle_timeout) => Ok(PumpEnd::IdleTimeout),
        _ = cancel.cancelled() => Ok(PumpEnd::Cancelled),
    };

    let mut remote = remote_read.unsplit(remote_write);
    let _ = remote.shutdown().await;

    result.map(|end| traffic.finish(end))
}

async fn upload_stream<W>(
    reader: &mut dyn TransportReader,
    remote: &mut WriteHalf<W>,
    first_payload: &[u8],
    traffic: &Traffic,
) -> Result<PumpEnd>
where
    W: AsyncWrite,
{
    if !first_payload.is_empty() {
        remote.write_all(first_payload).await?;
        traffic.record_up(first_payload.len());
    }
    loop {
        match reader.recv().await.map_err(transport_err)? {
            Some(chunk) => {
                remote.write_all(&chunk).await?;
                traffic.record_up(chunk.len());
            }
            None => return Ok(PumpEnd::ClientClosed),
        }
    }
}

async fn download_stream<R>(
    remote: &mut ReadHalf<R>,
    writer: &mut ResponseWriter<'_>,
    buffer_size: usize,
    traffic: &Traffic,
) -> Result<PumpEnd>
where
    R: AsyncRead,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        let n = remote.read(&mut buf).await?;
        if n == 0 {
            return Ok(PumpEnd::RemoteClosed);
        }
        writer
            .send(Bytes::copy_from_slice(&buf[..n]))
            .await
            .map_err(transport_err)?;
        traffic.record_down(n);
    }
}

/// Relay between the transport and the DNS exchange
///
/// Every transport message is one query; every response goes back
/// length-prefixed.
pub async fn pump_dns(
    reader: &mut dyn TransportReader,
    writer: &mut ResponseWriter<'_>,
    relay: &DnsRelay,
    first_payload: &[u8],
    opts: PumpOptions,
    cancel: &CancellationToken,
) -> Result<CopyResult> {
    let traffic = Traffic::new();

    let end = tokio::select! {
        r = upload_dns(reader, relay, first_payload, &traffic) => r?,
        r = download_dns(relay, writer, &traffic) => r?,
        _ = idle_watch(&traffic, opts.idle_timeout) => PumpEnd::IdleTimeout,
        _ = cancel.cancelled() => PumpEnd::Cancelled,
    };
    Ok(traffic.finish(end))
}

async fn upload_dns(
    reader: &mut dyn TransportReader,
    relay: &DnsRelay,
    first_payload: &[u8],
    traffic: &Traffic,
) -> Result<PumpEnd> {
    if !first_payload.is_empty() {
        traffic.record_up(relay.write(first_payload).await?);
    }
    loop {
        match reader.recv().await.map_err(transport_err)? {
            Some(chunk) => traffic.record_up(relay.write(&chunk).await?),
            None => return Ok(PumpEnd::ClientClosed),
        }
    }
}

async fn download_dns(
    relay: &DnsRelay,
    writer: &mut ResponseWriter<'_>,
    traffic: &Traffic,
) -> Result<PumpEnd> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let framed = relay.recv_framed(&mut buf).await?;
        let n = framed.len() - 2;
        writer.send(framed).await.map_err(transport_err)?;
        traffic.record_down(n);
    }
}
