//! Outbound TCP dialing
//!
//! One outbound connection per session. Failures are reported to the caller
//! and never retried here.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use super::protocol::Address;
use crate::error::{RelayError, Result};
use crate::logger::log;

/// How the configured egress hint influences dialing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressHint {
    /// Dial this host instead of the requested one, keeping the requested
    /// port unless the hint carries its own
    Relay { host: String, port: Option<u16> },
    /// Bind the outbound socket to this local source address
    Bind(IpAddr),
}

impl EgressHint {
    /// Parse a relay hint: `host`, `host:port`, `ip`, `ip:port` or `[v6]:port`
    pub fn parse_relay(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RelayError::Config("empty egress hint".to_string()));
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(EgressHint::Relay {
                host: addr.ip().to_string(),
                port: Some(addr.port()),
            });
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(EgressHint::Relay {
                host: ip.to_string(),
                port: None,
            });
        }
        if let Some((host, port)) = s.rsplit_once(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| RelayError::Config(format!("invalid egress hint port: {}", s)))?;
            if host.is_empty() || host.contains(':') {
                return Err(RelayError::Config(format!("invalid egress hint: {}", s)));
            }
            return Ok(EgressHint::Relay {
                host: host.to_string(),
                port: Some(port),
            });
        }
        Ok(EgressHint::Relay {
            host: s.to_string(),
            port: None,
        })
    }

    /// Parse a bind hint, which must be an IP literal
    pub fn parse_bind(s: &str) -> Result<Self> {
        s.trim()
            .parse::<IpAddr>()
            .map(EgressHint::Bind)
            .map_err(|_| RelayError::Config(format!("bind egress hint must be an IP: {}", s)))
    }
}

impl std::fmt::Display for EgressHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EgressHint::Relay { host, port: Some(p) } => write!(f, "relay({}:{})", host, p),
            EgressHint::Relay { host, port: None } => write!(f, "relay({})", host),
            EgressHint::Bind(ip) => write!(f, "bind({})", ip),
        }
    }
}

/// Settings for a single dial
#[derive(Debug, Clone, Copy)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
}

/// Host and port actually dialed for `target` under `egress`
pub fn dial_target(target: &Address, egress: Option<&EgressHint>) -> (String, u16) {
    match egress {
        Some(EgressHint::Relay { host, port }) => (host.clone(), port.unwrap_or(target.port())),
        _ => (target.host(), target.port()),
    }
}

/// Resolve a host/port pair to socket addresses
pub async fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", host),
        ));
    }
    Ok(addrs)
}

/// Open the outbound TCP connection for a session
pub async fn connect_tcp(
    target: &Address,
    egress: Option<&EgressHint>,
    opts: DialOptions,
) -> Result<TcpStream> {
    let (host, port) = dial_target(target, egress);
    let dial = async {
        let addrs = resolve(&host, port).await?;
        let bind_ip = match egress {
            Some(EgressHint::Bind(ip)) => Some(*ip),
            _ => None,
        };
        dial_first(&addrs, bind_ip).await
    };
    let stream = dial_within(target, opts.connect_timeout, dial).await?;

    if opts.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    log::debug!(target = %target, via = %host, port = port, "Connected to remote");
    Ok(stream)
}

/// Bound a dial attempt by `timeout`, mapping both failure paths to `Connect`
async fn dial_within<F>(target: &Address, timeout: Duration, dial: F) -> Result<TcpStream>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    let source = match tokio::time::timeout(timeout, dial).await {
        Ok(Ok(stream)) => return Ok(stream),
        Ok(Err(e)) => e,
        Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
    };
    Err(RelayError::Connect {
        target: target.to_string(),
        source,
    })
}

/// Try each resolved address in order until one connects
async fn dial_first(addrs: &[SocketAddr], bind_ip: Option<IpAddr>) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        let result = match bind_ip {
            Some(ip) if ip.is_ipv4() != addr.is_ipv4() => continue,
            Some(ip) => connect_from(ip, *addr).await,
            None => TcpStream::connect(addr).await,
        };
        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                log::trace!(remote = %addr, error = %e, "Dial attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no address matches the bind address family",
        )
    }))
}

async fn connect_from(source: IpAddr, remote: SocketAddr) -> io::Result<TcpStream> {
    let socket = match source {
        IpAddr::V4(_) => TcpSocket::new_v4()?,
        IpAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.bind(SocketAddr::new(source, 0))?;
    socket.connect(remote).await
}
