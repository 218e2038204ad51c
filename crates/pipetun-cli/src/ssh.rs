//! Passwordless SSH for tunnels
//!
//! Provisioning talks to the remote SSH daemon through the tunnel's own local
//! port. A background tunnel is provisioned by the launching process, so the
//! resulting configuration is persisted under `~/.pipetun/ssh` for `stop` to
//! find it again.

use crate::config::{pipetun_home, Settings};
use crate::error::Result;
use anyhow::Context;
use pipetun_connection::{with_retry, RetryPolicy};
use pipetun_proto::{ConnectionInfo, TunnelSpec};
use pipetun_ssh::{
    PasswordlessSshConfig, ProvisionedSsh, RemoteShell, RusshSession, SshClientConfigStore, SshError,
    SshProvisioner,
};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const LOOPBACK: &str = "127.0.0.1";

/// The SSH client configuration of this workstation
pub fn client_store(spec: &TunnelSpec) -> Result<Box<dyn SshClientConfigStore>> {
    #[cfg(windows)]
    {
        let _ = spec;
        Ok(Box::new(pipetun_ssh::PuttyConfigStore::new()))
    }
    #[cfg(not(windows))]
    {
        Ok(Box::new(pipetun_ssh::OpenSshConfigStore::for_user(
            spec.ssh_config_path.clone(),
        )?))
    }
}

/// Where copied private keys live
pub fn local_key_root() -> anyhow::Result<PathBuf> {
    Ok(pipetun_home()?.join("keys"))
}

async fn connect_over_tunnel(
    config: &PasswordlessSshConfig,
    settings: &Settings,
    policy: RetryPolicy,
) -> std::result::Result<RusshSession, SshError> {
    with_retry(policy, move |attempt| {
        debug!(
            local_port = config.local_port,
            "Opening SSH session through the tunnel (attempt {})", attempt
        );
        RusshSession::connect(
            LOOPBACK,
            config.local_port,
            &config.login_user,
            &config.password,
            settings.connect_timeout(),
        )
    })
    .await
}

/// Generate a key on the target and register it locally
///
/// The tunnel may still be binding, so the session is retried. When
/// `interrupt` resolves first, whatever was already set up is removed and
/// [`SshError::Interrupted`] is returned.
pub async fn provision_over_tunnel<S>(
    spec: &TunnelSpec,
    info: &ConnectionInfo,
    store: &dyn SshClientConfigStore,
    settings: &Settings,
    key_root: &Path,
    keep: bool,
    interrupt: S,
) -> Result<ProvisionedSsh>
where
    S: Future<Output = ()>,
{
    let config =
        PasswordlessSshConfig::generate(spec, info, key_root, store.key_format()).with_keep(keep);
    tokio::pin!(interrupt);

    let policy = RetryPolicy::retries(settings.retries, Duration::from_secs(1));
    let mut session = tokio::select! {
        session = connect_over_tunnel(&config, settings, policy) => session?,
        _ = &mut interrupt => return Err(SshError::Interrupted.into()),
    };
    let result = SshProvisioner::new(store)
        .provision_until(&mut session, config, info.platform, interrupt)
        .await;
    if let Err(e) = session.close().await {
        debug!("Failed to close SSH session: {}", e);
    }
    Ok(result?)
}

/// Undo a provisioning
///
/// Remote cleanup needs the tunnel to still be up; when no session can be
/// opened only the local side is cleaned.
pub async fn release_over_tunnel(
    store: &dyn SshClientConfigStore,
    provisioned: &ProvisionedSsh,
    settings: &Settings,
) {
    let provisioner = SshProvisioner::new(store);
    if provisioned.config.keep {
        provisioner.release(None, provisioned).await;
        return;
    }

    match connect_over_tunnel(&provisioned.config, settings, RetryPolicy::once()).await {
        Ok(mut session) => {
            provisioner.release(Some(&mut session), provisioned).await;
            if let Err(e) = session.close().await {
                debug!("Failed to close SSH session: {}", e);
            }
        }
        Err(e) => {
            warn!(
                "Cannot reach {} for remote key cleanup, cleaning up locally: {}",
                provisioned.alias(),
                e
            );
            provisioner.release(None, provisioned).await;
        }
    }
}

/// Provisionings made for background tunnels, one JSON file per alias
pub struct SshStateStore {
    dir: PathBuf,
}

impl SshStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// ~/.pipetun/ssh
    pub fn default_location() -> anyhow::Result<Self> {
        Ok(Self::new(pipetun_home()?.join("ssh")))
    }

    fn path(&self, alias: &str) -> PathBuf {
        let file: String = alias
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{}.json", file))
    }

    pub fn save(&self, config: &PasswordlessSshConfig) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .context(format!("Failed to create SSH state directory: {:?}", self.dir))?;
        let path = self.path(&config.alias);
        let json = serde_json::to_string_pretty(config).context("Failed to serialize SSH state")?;
        fs::write(&path, json).context(format!("Failed to write SSH state: {:?}", path))?;
        Ok(())
    }

    /// The saved provisioning, if any; the password is never stored
    pub fn load(&self, alias: &str) -> anyhow::Result<Option<PasswordlessSshConfig>> {
        let path = self.path(alias);
        if !path.exists() {
            return Ok(None);
        }
        let json =
            fs::read_to_string(&path).context(format!("Failed to read SSH state: {:?}", path))?;
        let config =
            serde_json::from_str(&json).context(format!("Failed to parse SSH state: {:?}", path))?;
        Ok(Some(config))
    }

    pub fn remove(&self, alias: &str) -> anyhow::Result<()> {
        let path = self.path(alias);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("Failed to remove SSH state: {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipetun_proto::{Endpoint, Platform};
    use pipetun_ssh::KeyFormat;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config(alias: &str) -> PasswordlessSshConfig {
        let spec = TunnelSpec::new("12345", "4567", "22")
            .unwrap()
            .with_ssh(true)
            .with_ssh_host(Some(alias.to_string()));
        let info = ConnectionInfo {
            proxy: Endpoint::new("edge", 8080),
            target: Endpoint::new("10.0.0.5", 22),
            credential: "secret".to_string(),
            owner: "alice".to_string(),
            sensitive: false,
            platform: Platform::Linux,
            parameters: HashMap::new(),
        };
        PasswordlessSshConfig::generate(&spec, &info, Path::new("/tmp/keys"), KeyFormat::OpenSsh)
    }

    #[test]
    fn test_state_round_trip_drops_password() {
        let dir = TempDir::new().unwrap();
        let store = SshStateStore::new(dir.path().join("ssh"));
        let config = config("pipe-12345");

        assert!(store.load("pipe-12345").unwrap().is_none());
        store.save(&config).unwrap();

        let loaded = store.load("pipe-12345").unwrap().unwrap();
        assert_eq!(loaded.key_name, config.key_name);
        assert_eq!(loaded.local_port, 4567);
        assert!(loaded.password.is_empty());

        store.remove("pipe-12345").unwrap();
        assert!(store.load("pipe-12345").unwrap().is_none());
        store.remove("pipe-12345").unwrap();
    }

    #[test]
    fn test_alias_is_a_safe_file_name() {
        let dir = TempDir::new().unwrap();
        let store = SshStateStore::new(dir.path());
        let config = config("../gpu box");
        store.save(&config).unwrap();
        assert!(dir.path().join(".._gpu_box.json").exists());
        assert!(store.load("../gpu box").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_interrupt_while_connecting_leaves_config_untouched() {
        // Accepts the connection but never sends an SSH banner
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port().to_string();
        let dir = TempDir::new().unwrap();
        let store = pipetun_ssh::OpenSshConfigStore::new(
            dir.path().join("config"),
            dir.path().join("known_hosts"),
        );
        let spec = TunnelSpec::new("12345", &port, "22").unwrap().with_ssh(true);
        let info = ConnectionInfo {
            proxy: Endpoint::new("edge", 8080),
            target: Endpoint::new("10.0.0.5", 22),
            credential: "secret".to_string(),
            owner: "alice".to_string(),
            sensitive: false,
            platform: Platform::Linux,
            parameters: HashMap::new(),
        };

        let err = provision_over_tunnel(
            &spec,
            &info,
            &store,
            &Settings::default(),
            &dir.path().join("keys"),
            false,
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, crate::TunnelError::Ssh(SshError::Interrupted)));
        assert!(!dir.path().join("config").exists());
        assert!(!dir.path().join("keys").exists());
    }
}
