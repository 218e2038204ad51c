//! Relay engines
//!
//! Three topologies share the same building blocks:
//!
//! - [`DirectRelay`]: local listeners forwarded point-to-point to a remote
//!   target, either directly or through the edge proxy.
//! - [`TransmittingRelay`]: a pool of pre-established connections to a
//!   tunnel host, each paired with a fresh connection to an output host when
//!   traffic arrives.
//! - [`ReceivingRelay`]: the other end of a transmitting relay; pooled tunnel
//!   connections are handed out to clients of the input listeners.
//!
//! Each engine is one event loop that owns its state. The binary runs them on
//! a current-thread runtime, so an engine never shares mutable state with
//! another thread.

pub mod channels;
pub mod direct;
pub mod pump;
pub mod receive;
pub mod supervisor;
pub mod transmit;

pub use channels::{ChannelTable, SocketId, SocketRole, TrackedSocket};
pub use direct::{DirectRelay, PortMapping};
pub use pump::{pump, ClosedBy, PumpOutcome, CHUNK_SIZE};
pub use receive::{ReceiveConfig, ReceivingRelay};
pub use supervisor::{run_supervised, run_supervised_until, shutdown_signal};
pub use transmit::{TransmitConfig, TransmittingRelay};

use pipetun_connection::ConnectError;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("Failed to accept connections on port {port}: {source}")]
    Accept { port: u16, source: std::io::Error },

    #[error("Invalid relay configuration: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Relay interrupted")]
    Cancelled,
}

/// Bind a listener, retrying briefly while the port sits in TIME_WAIT
pub(crate) async fn bind_with_retry(host: &str, port: u16) -> Result<TcpListener, RelayError> {
    let address = format!("{}:{}", host, port);
    for attempt in 1..=3 {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!("Bound to {} on attempt {}/3", address, attempt);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 3 => {
                warn!(
                    "Port {} is in use (attempt {}/3), retrying in 1 second...",
                    port, attempt
                );
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
            Err(source) => {
                return Err(RelayError::Bind {
                    address,
                    port,
                    source,
                })
            }
        }
    }
    Err(RelayError::Bind {
        address,
        port,
        source: std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "address in use after 3 attempts",
        ),
    })
}

/// Reject duplicated ports on either side of a mapping
pub(crate) fn ensure_unique(ports: impl IntoIterator<Item = u16>, side: &str) -> Result<(), RelayError> {
    let mut seen = std::collections::HashSet::new();
    for port in ports {
        if !seen.insert(port) {
            return Err(RelayError::Config(format!(
                "{} port {} is listed more than once",
                side, port
            )));
        }
    }
    Ok(())
}

/// Accepted socket handed from an accept loop to its engine
#[derive(Debug)]
pub(crate) struct Accepted {
    pub port: u16,
    pub stream: tokio::net::TcpStream,
    pub peer: SocketAddr,
}
