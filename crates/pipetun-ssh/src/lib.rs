//! Passwordless SSH over a running tunnel
//!
//! A key pair is generated on the remote host through an SSH session that
//! rides the tunnel itself. The private key is copied back and registered in
//! the local SSH client configuration (an OpenSSH config file or the PuTTY
//! registry) under a synthetic alias, so `ssh <alias>` works without a
//! password until the tunnel is stopped.

pub mod config;
pub mod openssh;
pub mod provisioner;
pub mod putty;
pub mod session;
pub mod shell;
pub mod store;

pub use config::PasswordlessSshConfig;
pub use openssh::OpenSshConfigStore;
pub use provisioner::{ProvisionedSsh, SshProvisioner};
pub use putty::{PuttyConfigStore, RegExe, RegistryRunner};
pub use session::RusshSession;
pub use shell::{CommandOutput, RemoteShell};
pub use store::{HostEntry, KeyFormat, SshClientConfigStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("Failed to connect to SSH server at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("SSH authentication failed for user {user}")]
    Auth { user: String },

    #[error("Remote command `{command}` failed with status {status}: {stderr}")]
    Command {
        command: String,
        status: u32,
        stderr: String,
    },

    #[error("Invalid host key: {0}")]
    InvalidHostKey(String),

    #[error("Registry operation failed: {0}")]
    Registry(String),

    #[error("Passwordless SSH is not supported for {0} hosts")]
    UnsupportedPlatform(String),

    #[error("Passwordless SSH setup was interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Quote a value for a POSIX shell
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
