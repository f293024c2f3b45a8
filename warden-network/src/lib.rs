//! # Warden Network
//!
//! Network plumbing for Warden nodes:
//!
//! - [`TcpTransport`]: request/response RPC between consensus engines over
//!   length-prefixed bincode frames
//! - [`AliasConfigurator`]: manages the floating address on a local
//!   interface through the `ip` command

pub mod alias;
pub mod tcp;

pub use alias::{AddressParseError, AliasConfigurator, InterfaceAddress};
pub use tcp::{TcpTransport, TcpTransportConfig, TcpTransportFactory};
