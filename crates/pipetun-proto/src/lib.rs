//! Tunnel data model
//!
//! Shared value types for the pipetun workspace: the tunnel specification a
//! user requests, the port range grammar it is built from, and the connection
//! metadata describing how a run or host is reached through the edge proxy.

pub mod connection;
pub mod ports;
pub mod spec;

pub use connection::{ConnectionInfo, Endpoint, Platform, PARENT_RUN_PARAMETER, SSH_USERS_PARAMETER};
pub use ports::{contiguous_runs, format_ports, parse_port_range, resolve_ports};
pub use spec::TunnelSpec;

use thiserror::Error;

/// Remote port the passwordless SSH provisioner talks to
pub const SSH_PORT: u16 = 22;

/// Invalid user input, reported before any network or process action
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Invalid port specification '{0}': expected a port like 4567 or a range like 4567-4569")]
    InvalidPort(String),

    #[error("Port {0} is out of range (1-65535)")]
    PortOutOfRange(u64),

    #[error("Either local port or remote port should be specified")]
    MissingPorts,

    #[error("The number of ports should be the same: {local} local port(s) vs {remote} remote port(s)")]
    PortCountMismatch { local: usize, remote: usize },

    #[error("Invalid endpoint '{0}': expected host:port")]
    InvalidEndpoint(String),

    #[error("Missing required option: {0}")]
    MissingOption(String),
}
