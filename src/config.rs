//! Configuration module for the VLESS relay
//!
//! CLI argument parsing with environment variable support. All settings are
//! read once at startup and folded into an immutable `RelayContext`.

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::time::Duration;

use crate::core::{is_valid_identity, EgressHint};

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Default WebSocket path, accepts any request path
pub const DEFAULT_WS_PATH: &str = "/";

/// Default upstream resolver for DNS sessions
pub const DEFAULT_DNS_SERVER: &str = "1.1.1.1:53";

/// How `--proxy_ip` influences outbound dialing
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EgressMode {
    /// Dial the hint host instead of the destination host
    Relay,
    /// Bind outbound sockets to the hint as local source address
    Bind,
}

/// CLI arguments for the VLESS relay
///
/// Supports environment variables with VLESS_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "VLESS over WebSocket relay server")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Accepted identity (UUID v4)
    #[arg(long, env = "VLESS_UUID")]
    pub uuid: String,

    /// Bind host
    #[arg(long, env = "VLESS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Bind port
    #[arg(long, env = "VLESS_PORT", default_value_t = 8080)]
    pub port: u16,

    /// WebSocket path; "/" accepts any path
    #[arg(long = "ws_path", env = "VLESS_WS_PATH", default_value = DEFAULT_WS_PATH)]
    pub ws_path: String,

    /// Egress hint used when dialing outbound connections
    #[arg(long = "proxy_ip", env = "VLESS_PROXY_IP")]
    pub proxy_ip: Option<String>,

    /// Interpretation of --proxy_ip
    #[arg(long = "egress_mode", env = "VLESS_EGRESS_MODE", value_enum, default_value_t = EgressMode::Relay)]
    pub egress_mode: EgressMode,

    /// Upstream resolver for UDP port 53 sessions
    #[arg(long = "dns_server", env = "VLESS_DNS_SERVER", default_value = DEFAULT_DNS_SERVER)]
    pub dns_server: String,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "VLESS_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - disconnect if no data transferred (default: 5m)
    #[arg(long, env = "VLESS_CONN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub conn_idle_timeout: Duration,

    /// TCP connect timeout to target server (default: 5s)
    #[arg(long, env = "VLESS_TCP_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// Timeout for receiving a complete VLESS header (default: 5s)
    #[arg(long, env = "VLESS_REQUEST_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub request_timeout: Duration,

    /// Buffer size for data transfer in bytes (default: 32KB)
    #[arg(long, env = "VLESS_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "VLESS_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "VLESS_TCP_NODELAY",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Maximum concurrent connections, 0 = unlimited
    #[arg(
        long,
        env = "VLESS_MAX_CONNECTIONS",
        default_value_t = 0,
        help_heading = "Performance"
    )]
    pub max_connections: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        if !is_valid_identity(&self.uuid) {
            return Err(anyhow!("Invalid UUID: {}", self.uuid));
        }
        self.egress_hint()?;
        self.dns_upstream()?;

        if self.conn_idle_timeout.is_zero() {
            return Err(anyhow!("conn_idle_timeout must be greater than 0"));
        }
        if self.tcp_connect_timeout.is_zero() {
            return Err(anyhow!("tcp_connect_timeout must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(anyhow!("request_timeout must be greater than 0"));
        }
        if self.buffer_size == 0 {
            return Err(anyhow!("buffer_size must be greater than 0"));
        }
        Ok(())
    }

    /// Egress hint built from --proxy_ip and --egress_mode
    pub fn egress_hint(&self) -> Result<Option<EgressHint>> {
        let Some(raw) = self.proxy_ip.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let hint = match self.egress_mode {
            EgressMode::Relay => EgressHint::parse_relay(raw)?,
            EgressMode::Bind => EgressHint::parse_bind(raw)?,
        };
        Ok(Some(hint))
    }

    /// Upstream resolver address
    pub fn dns_upstream(&self) -> Result<SocketAddr> {
        self.dns_server
            .parse()
            .map_err(|_| anyhow!("Invalid DNS server address: {}", self.dns_server))
    }

    /// Listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip = host
            .parse()
            .map_err(|_| anyhow!("Invalid listen host: {}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Time allowed for a complete VLESS header to arrive
    pub request_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Concurrent connection cap, 0 = unlimited
    pub max_connections: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            buffer_size: 32 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.conn_idle_timeout,
            connect_timeout: cli.tcp_connect_timeout,
            request_timeout: cli.request_timeout,
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            max_connections: cli.max_connections,
        }
    }
}
