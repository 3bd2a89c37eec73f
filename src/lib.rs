//! VLESS over WebSocket relay
//!
//! Architecture:
//! - `core/`: header codec, outbound dialing, stream pump, session state
//! - `transport/`: WebSocket transport and the plain HTTP front door
//! - `handler`: per-session entry point
//! - `server_runner`: listener setup and accept loop

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server_runner;
pub mod transport;

pub use error::{ProtocolError, RelayError, Result};
