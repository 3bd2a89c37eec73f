//! Core relay module
//!
//! This module contains the relay core:
//! - Identity validation
//! - VLESS header codec
//! - Outbound dialing (TCP and DNS over UDP)
//! - Bidirectional stream pump
//! - Session state machine and registry

mod dns;
mod identity;
mod outbound;
mod protocol;
mod registry;
mod relay;
mod server;
mod session;

pub use dns::{frame_datagram, DnsRelay};
pub use identity::{is_valid_identity, Identity};
pub use outbound::{connect_tcp, DialOptions, EgressHint};
pub use protocol::{response_header, Address, VlessCmd, VlessRequest, DNS_PORT};
pub use registry::{SessionId, SessionRegistry};
pub use relay::{CopyResult, PumpEnd, PumpOptions};
pub use server::{RelayContext, RelayContextBuilder};
pub use session::{decode_early_data, Session, SessionState};
