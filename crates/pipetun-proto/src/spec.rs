//! Tunnel specification

use crate::{resolve_ports, ConfigurationError, SSH_PORT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// What a user asked to forward
///
/// Equality over every field is what the conflict resolver uses to tell an
/// identical running tunnel from a different one on the same ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Run identifier or bare host name
    pub host_id: String,
    pub local_ports: Vec<u16>,
    pub remote_ports: Vec<u16>,
    pub use_ssh: bool,
    pub ssh_config_path: Option<PathBuf>,
    /// Overrides the synthetic SSH alias
    pub ssh_host: Option<String>,
    pub ssh_users: BTreeSet<String>,
    /// Connect straight to the target, bypassing the edge proxy
    pub direct: bool,
}

impl TunnelSpec {
    /// Build a spec from raw port specifications
    pub fn new(host_id: &str, local: &str, remote: &str) -> Result<Self, ConfigurationError> {
        let host_id = host_id.trim();
        if host_id.is_empty() {
            return Err(ConfigurationError::MissingOption("host id".to_string()));
        }
        let (local_ports, remote_ports) = resolve_ports(local, remote)?;
        Ok(Self {
            host_id: host_id.to_string(),
            local_ports,
            remote_ports,
            use_ssh: false,
            ssh_config_path: None,
            ssh_host: None,
            ssh_users: BTreeSet::new(),
            direct: false,
        })
    }

    pub fn with_ssh(mut self, enabled: bool) -> Self {
        self.use_ssh = enabled;
        self
    }

    pub fn with_ssh_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.ssh_config_path = path;
        self
    }

    pub fn with_ssh_host(mut self, host: Option<String>) -> Self {
        self.ssh_host = host;
        self
    }

    pub fn with_ssh_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ssh_users = users.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    /// Whether the host id names a platform run rather than a bare host
    pub fn is_run(&self) -> bool {
        self.host_id.parse::<u64>().is_ok()
    }

    /// Local → remote port pairs in declaration order
    pub fn port_pairs(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.local_ports
            .iter()
            .copied()
            .zip(self.remote_ports.iter().copied())
    }

    /// Whether any of `ports` is one of this spec's local ports
    pub fn shares_local_ports(&self, ports: &[u16]) -> bool {
        self.local_ports.iter().any(|p| ports.contains(p))
    }

    /// Local port that forwards to the remote SSH daemon
    ///
    /// Falls back to the first local port when no pair targets port 22.
    pub fn ssh_local_port(&self) -> u16 {
        self.port_pairs()
            .find(|(_, remote)| *remote == SSH_PORT)
            .map(|(local, _)| local)
            .or_else(|| self.local_ports.first().copied())
            .unwrap_or(SSH_PORT)
    }

    /// Alias under which the tunnel is registered in SSH client configuration
    pub fn ssh_alias(&self) -> String {
        self.ssh_host
            .clone()
            .unwrap_or_else(|| format!("pipe-{}", self.host_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TunnelSpec {
        TunnelSpec::new("12345", "4567", "22")
            .unwrap()
            .with_ssh(true)
            .with_ssh_users(["root"])
    }

    #[test]
    fn test_equal_specs() {
        assert_eq!(spec(), spec());
    }

    #[test]
    fn test_single_field_change_breaks_equality() {
        assert_ne!(spec(), spec().with_direct(true));
        assert_ne!(spec(), spec().with_ssh_users(["root", "alice"]));
        assert_ne!(spec(), spec().with_ssh_host(Some("gpu".to_string())));
    }

    #[test]
    fn test_missing_host_id() {
        assert_eq!(
            TunnelSpec::new(" ", "4567", ""),
            Err(ConfigurationError::MissingOption("host id".to_string()))
        );
    }

    #[test]
    fn test_is_run() {
        assert!(spec().is_run());
        assert!(!TunnelSpec::new("gpu-box.internal", "80", "").unwrap().is_run());
    }

    #[test]
    fn test_shares_local_ports() {
        let spec = TunnelSpec::new("1", "4567-4569", "").unwrap();
        assert!(spec.shares_local_ports(&[4569, 9000]));
        assert!(!spec.shares_local_ports(&[9000]));
    }

    #[test]
    fn test_ssh_local_port_prefers_remote_22() {
        let spec = TunnelSpec::new("1", "4566-4567", "21-22").unwrap();
        assert_eq!(spec.ssh_local_port(), 4567);

        let spec = TunnelSpec::new("1", "8080", "").unwrap();
        assert_eq!(spec.ssh_local_port(), 8080);
    }

    #[test]
    fn test_ssh_alias() {
        assert_eq!(spec().ssh_alias(), "pipe-12345");
        assert_eq!(
            spec().with_ssh_host(Some("train".to_string())).ssh_alias(),
            "train"
        );
    }
}
