use std::io;
use thiserror::Error;

/// Reasons a session header is rejected
///
/// Every variant terminates the session, never the process.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ends before the header does
    #[error("truncated header")]
    Truncated,

    /// Session token does not match the configured identity
    #[error("unauthorized session token")]
    Unauthorized,

    #[error("unknown command {0}")]
    UnknownCommand(u8),

    #[error("unknown address type {0}")]
    UnknownAddressType(u8),

    /// UDP is only relayed towards port 53
    #[error("UDP only allowed for DNS on port 53, got port {0}")]
    UnsupportedUdpPort(u16),

    #[error("invalid domain encoding")]
    InvalidDomain,
}

/// Relay error taxonomy
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid configuration, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unauthorized session header
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Outbound dial failure
    #[error("Connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Peer-side close or error on the upgraded transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Mid-stream read/write failure on either side
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Short label used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Protocol(_) => "protocol",
            RelayError::Connect { .. } => "connect",
            RelayError::Transport(_) => "transport",
            RelayError::Io(_) => "io",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;
