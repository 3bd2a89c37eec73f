//! Process-wide relay context
//!
//! Built once at startup and shared read-only by every session.

use std::net::SocketAddr;

use super::identity::Identity;
use super::outbound::{DialOptions, EgressHint};
use super::registry::SessionRegistry;
use super::relay::PumpOptions;
use crate::config::{ConnConfig, DEFAULT_DNS_SERVER, DEFAULT_WS_PATH};
use crate::error::{RelayError, Result};

/// Immutable configuration every session runs against
#[derive(Debug)]
pub struct RelayContext {
    /// Accepted session identity
    pub identity: Identity,
    /// Optional egress hint for outbound dialing
    pub egress: Option<EgressHint>,
    /// Upstream resolver for UDP port 53 sessions
    pub dns_upstream: SocketAddr,
    /// Accepted WebSocket upgrade path
    pub ws_path: String,
    /// Live sessions
    pub registry: SessionRegistry,
    /// Connection performance configuration
    pub conn_config: ConnConfig,
}

impl RelayContext {
    /// Create a new context builder
    pub fn builder() -> RelayContextBuilder {
        RelayContextBuilder::new()
    }

    pub fn dial_options(&self) -> DialOptions {
        DialOptions {
            connect_timeout: self.conn_config.connect_timeout,
            tcp_nodelay: self.conn_config.tcp_nodelay,
        }
    }

    pub fn pump_options(&self) -> PumpOptions {
        PumpOptions {
            buffer_size: self.conn_config.buffer_size,
            idle_timeout: self.conn_config.idle_timeout,
        }
    }
}

/// Builder for constructing a RelayContext
#[derive(Default)]
pub struct RelayContextBuilder {
    identity: Option<Identity>,
    egress: Option<EgressHint>,
    dns_upstream: Option<SocketAddr>,
    ws_path: Option<String>,
    registry: Option<SessionRegistry>,
    conn_config: Option<ConnConfig>,
}

impl RelayContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set accepted identity
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set egress hint
    pub fn egress(mut self, egress: Option<EgressHint>) -> Self {
        self.egress = egress;
        self
    }

    /// Set DNS upstream resolver
    pub fn dns_upstream(mut self, addr: SocketAddr) -> Self {
        self.dns_upstream = Some(addr);
        self
    }

    /// Set WebSocket path
    pub fn ws_path(mut self, path: impl Into<String>) -> Self {
        self.ws_path = Some(path.into());
        self
    }

    /// Set session registry
    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set connection configuration
    pub fn conn_config(mut self, config: ConnConfig) -> Self {
        self.conn_config = Some(config);
        self
    }

    /// Build the context
    ///
    /// The identity is required; everything else has a default.
    pub fn build(self) -> Result<RelayContext> {
        let identity = self
            .identity
            .ok_or_else(|| RelayError::Config("identity is required".to_string()))?;
        let dns_upstream = match self.dns_upstream {
            Some(addr) => addr,
            None => DEFAULT_DNS_SERVER
                .parse()
                .map_err(|_| RelayError::Config("invalid default DNS server".to_string()))?,
        };

        Ok(RelayContext {
            identity,
            egress: self.egress,
            dns_upstream,
            ws_path: self.ws_path.unwrap_or_else(|| DEFAULT_WS_PATH.to_string()),
            registry: self.registry.unwrap_or_default(),
            conn_config: self.conn_config.unwrap_or_default(),
        })
    }
}
