//! Local SSH client configuration stores

use crate::SshError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Private key format a store's client expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    OpenSsh,
    Putty,
}

/// A host registered for passwordless login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: PathBuf,
}

/// Where SSH clients on this workstation look up hosts and host keys
///
/// Every addition is keyed by alias (entries) or by port (host keys), and
/// removing with the same key undoes it.
pub trait SshClientConfigStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn key_format(&self) -> KeyFormat;

    fn add_host(&self, entry: &HostEntry) -> Result<(), SshError>;

    fn remove_host(&self, alias: &str) -> Result<(), SshError>;

    /// Trust `public_key` (an `ssh-rsa AAAA...` line) for 127.0.0.1:`port`
    fn add_host_key(&self, alias: &str, port: u16, public_key: &str) -> Result<(), SshError>;

    fn remove_host_key(&self, alias: &str, port: u16) -> Result<(), SshError>;
}
