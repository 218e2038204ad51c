//! Tunnel command errors

use pipetun_connection::ConnectError;
use pipetun_proto::ConfigurationError;
use pipetun_relay::RelayError;
use pipetun_ssh::SshError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("{0}")]
    Conflict(String),

    #[error("Local ports are not available:\n{0}")]
    PortsOccupied(String),

    #[error("Failed to launch background tunnel: {0}")]
    Launch(String),

    #[error("Failed to fetch connection details: {0}")]
    Metadata(String),

    #[error("Tunnels to sensitive run {0} are not allowed")]
    Sensitive(String),

    #[error("Process registry error: {0}")]
    Registry(String),

    #[error("Ports {0} were not released in time")]
    StopTimeout(String),

    #[error("Interrupted")]
    Cancelled,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
