//! Paths and names for one passwordless SSH provisioning

use crate::store::KeyFormat;
use chrono::{DateTime, Utc};
use pipetun_proto::{ConnectionInfo, TunnelSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Remote directory for generated key pairs
const REMOTE_KEY_DIR: &str = "/root/.pipe/ssh";

/// Default account authorized when neither the CLI nor the run names any
pub const DEFAULT_SSH_USER: &str = "root";

/// Persisted next to a background tunnel so `stop` can undo the provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordlessSshConfig {
    /// Comment of the generated key; marks it in every authorized_keys file
    pub key_name: String,
    pub alias: String,
    pub host_id: String,
    /// Local tunnel port leading to the remote SSH daemon
    pub local_port: u16,
    /// Account used for the provisioning session and the client entry
    pub login_user: String,
    /// Never written to disk
    #[serde(skip, default)]
    pub password: String,
    pub authorized_users: BTreeSet<String>,
    pub remote_private_key: String,
    pub remote_public_key: String,
    pub remote_ppk_key: String,
    pub remote_host_key: String,
    pub local_key_dir: PathBuf,
    pub key_format: KeyFormat,
    pub keep: bool,
}

impl PasswordlessSshConfig {
    /// Derive every path from `key_name`, the host id and `generated_at`
    pub fn new(
        spec: &TunnelSpec,
        info: &ConnectionInfo,
        key_name: &str,
        generated_at: DateTime<Utc>,
        local_key_dir: &Path,
        key_format: KeyFormat,
    ) -> Self {
        let stem = format!(
            "{}-{}-{}",
            spec.ssh_alias(),
            generated_at.format("%Y%m%d%H%M%S"),
            key_name
        );
        let remote_private_key = format!("{}/{}", REMOTE_KEY_DIR, stem);

        let authorized_users = if !spec.ssh_users.is_empty() {
            spec.ssh_users.clone()
        } else {
            info.ssh_users_override()
                .unwrap_or_else(|| BTreeSet::from([DEFAULT_SSH_USER.to_string()]))
        };

        Self {
            key_name: key_name.to_string(),
            alias: spec.ssh_alias(),
            host_id: spec.host_id.clone(),
            local_port: spec.ssh_local_port(),
            login_user: DEFAULT_SSH_USER.to_string(),
            password: info.credential.clone(),
            authorized_users,
            remote_public_key: format!("{}.pub", remote_private_key),
            remote_ppk_key: format!("{}.ppk", remote_private_key),
            remote_private_key,
            remote_host_key: "/etc/ssh/ssh_host_rsa_key.pub".to_string(),
            local_key_dir: local_key_dir.join(stem),
            key_format,
            keep: false,
        }
    }

    /// Fresh random key name stamped with the current time
    pub fn generate(
        spec: &TunnelSpec,
        info: &ConnectionInfo,
        local_key_root: &Path,
        key_format: KeyFormat,
    ) -> Self {
        let key_name = format!("pipetun-{}", uuid::Uuid::new_v4().simple());
        Self::new(spec, info, &key_name, Utc::now(), local_key_root, key_format)
    }

    pub fn with_keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Local copy of the private key
    pub fn local_key_path(&self) -> PathBuf {
        match self.key_format {
            KeyFormat::OpenSsh => self.local_key_dir.join("id_rsa"),
            KeyFormat::Putty => self.local_key_dir.join("id_rsa.ppk"),
        }
    }

    /// Remote key file matching the local store's format
    pub fn remote_key_to_copy(&self) -> &str {
        match self.key_format {
            KeyFormat::OpenSsh => &self.remote_private_key,
            KeyFormat::Putty => &self.remote_ppk_key,
        }
    }
}
