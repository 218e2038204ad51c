//! Passwordless SSH provisioning and teardown

use crate::config::PasswordlessSshConfig;
use crate::shell::RemoteShell;
use crate::store::{HostEntry, KeyFormat, SshClientConfigStore};
use crate::{shell_quote, SshError};
use pipetun_proto::Platform;
use std::fs;
use std::future::Future;
use std::path::Path;
use tracing::{debug, info, warn};

/// Steps of a provisioning that have to be undone
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Progress {
    remote_keys: bool,
    local_key: bool,
    host_entry: bool,
    host_key: bool,
}

impl Progress {
    fn complete() -> Self {
        Self {
            remote_keys: true,
            local_key: true,
            host_entry: true,
            host_key: true,
        }
    }
}

/// Handle to a finished provisioning
#[derive(Debug, Clone)]
pub struct ProvisionedSsh {
    pub config: PasswordlessSshConfig,
    progress: Progress,
}

impl ProvisionedSsh {
    /// Rebuild the handle of a provisioning made by another process
    pub fn restore(config: PasswordlessSshConfig) -> Self {
        Self {
            config,
            progress: Progress::complete(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }
}

pub struct SshProvisioner<'a> {
    store: &'a dyn SshClientConfigStore,
}

impl<'a> SshProvisioner<'a> {
    pub fn new(store: &'a dyn SshClientConfigStore) -> Self {
        Self { store }
    }

    /// Generate a key pair remotely and register it locally
    ///
    /// Whatever was created before a failure is removed again before the
    /// error is returned.
    pub async fn provision(
        &self,
        shell: &mut dyn RemoteShell,
        config: PasswordlessSshConfig,
        platform: Platform,
    ) -> Result<ProvisionedSsh, SshError> {
        self.provision_until(shell, config, platform, std::future::pending())
            .await
    }

    /// [`provision`](Self::provision) that stops when `interrupt` resolves
    ///
    /// An interruption is handled like a failure: the completed steps are
    /// undone and [`SshError::Interrupted`] is returned.
    pub async fn provision_until<S>(
        &self,
        shell: &mut dyn RemoteShell,
        config: PasswordlessSshConfig,
        platform: Platform,
        interrupt: S,
    ) -> Result<ProvisionedSsh, SshError>
    where
        S: Future<Output = ()>,
    {
        if platform == Platform::Windows {
            return Err(SshError::UnsupportedPlatform("windows".to_string()));
        }

        let mut provisioned = ProvisionedSsh {
            config,
            progress: Progress::default(),
        };
        let outcome = tokio::select! {
            result = self.run_steps(&mut *shell, &mut provisioned) => result,
            _ = interrupt => Err(SshError::Interrupted),
        };
        match outcome {
            Ok(()) => {
                info!(
                    "Passwordless SSH is ready: ssh {} ({} store)",
                    provisioned.config.alias,
                    self.store.name()
                );
                Ok(provisioned)
            }
            Err(e) => {
                warn!("Passwordless SSH provisioning failed, cleaning up: {}", e);
                self.teardown(Some(shell), &provisioned).await;
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        shell: &mut dyn RemoteShell,
        provisioned: &mut ProvisionedSsh,
    ) -> Result<(), SshError> {
        let config = provisioned.config.clone();

        let script = generate_script(&config);
        provisioned.progress.remote_keys = true;
        shell.exec(&script).await?.check("passwordless SSH key generation")?;
        debug!("Generated remote key pair {}", config.remote_private_key);

        let private_key = shell.read_file(config.remote_key_to_copy()).await?;
        let host_key = shell.read_file(&config.remote_host_key).await?;
        let host_key = String::from_utf8_lossy(&host_key).trim().to_string();

        provisioned.progress.local_key = true;
        write_private_key(&config.local_key_path(), &private_key)?;

        provisioned.progress.host_entry = true;
        self.store.add_host(&HostEntry {
            alias: config.alias.clone(),
            hostname: "127.0.0.1".to_string(),
            port: config.local_port,
            user: config.login_user.clone(),
            identity_file: config.local_key_path(),
        })?;

        provisioned.progress.host_key = true;
        self.store
            .add_host_key(&config.alias, config.local_port, &host_key)?;
        Ok(())
    }

    /// Undo a provisioning, unless it was asked to be kept
    pub async fn release(&self, shell: Option<&mut dyn RemoteShell>, provisioned: &ProvisionedSsh) {
        if provisioned.config.keep {
            info!("Keeping passwordless SSH for {}", provisioned.alias());
            return;
        }
        self.teardown(shell, provisioned).await;
    }

    /// Undo every recorded step
    ///
    /// Each step is attempted independently; failures are logged. Remote
    /// cleanup is skipped when no shell is available.
    pub async fn teardown(&self, shell: Option<&mut dyn RemoteShell>, provisioned: &ProvisionedSsh) {
        let config = &provisioned.config;
        let progress = &provisioned.progress;

        if progress.host_key {
            if let Err(e) = self.store.remove_host_key(&config.alias, config.local_port) {
                warn!("Failed to remove host key of {}: {}", config.alias, e);
            }
        }
        if progress.host_entry {
            if let Err(e) = self.store.remove_host(&config.alias) {
                warn!("Failed to remove SSH host {}: {}", config.alias, e);
            }
        }
        if progress.local_key {
            if let Err(e) = remove_local_key(&config.local_key_dir) {
                warn!(
                    "Failed to remove {}: {}",
                    config.local_key_dir.display(),
                    e
                );
            }
        }
        if progress.remote_keys {
            match shell {
                Some(shell) => {
                    let script = cleanup_script(config);
                    match shell.exec(&script).await {
                        Ok(output) if output.success() => {}
                        Ok(output) => warn!(
                            "Remote SSH key cleanup exited with {}: {}",
                            output.exit_status,
                            output.stderr_lossy()
                        ),
                        Err(e) => warn!("Remote SSH key cleanup failed: {}", e),
                    }
                }
                None => debug!("No remote session, leaving remote key {}", config.key_name),
            }
        }
        debug!("Passwordless SSH for {} removed", config.alias);
    }
}

/// Remote script generating the key pair and authorizing it
pub fn generate_script(config: &PasswordlessSshConfig) -> String {
    let private_key = shell_quote(&config.remote_private_key);
    let public_key = shell_quote(&config.remote_public_key);
    let key_dir = config
        .remote_private_key
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or(".");

    let mut script = String::from("set -e\n");
    script.push_str(&format!("mkdir -p {}\n", shell_quote(key_dir)));
    script.push_str(&format!("rm -f {} {}\n", private_key, public_key));
    script.push_str(&format!(
        "ssh-keygen -q -t rsa -b 2048 -N '' -C {} -f {}\n",
        shell_quote(&config.key_name),
        private_key
    ));
    script.push_str(&format!(
        "for user in {}; do\n",
        users_list(config)
    ));
    script.push_str(concat!(
        "  home=$(getent passwd \"$user\" | cut -d: -f6)\n",
        "  if [ -z \"$home\" ]; then echo \"user $user not found\" >&2; continue; fi\n",
        "  mkdir -p \"$home/.ssh\"\n",
        "  chmod 700 \"$home/.ssh\"\n",
    ));
    script.push_str(&format!(
        "  cat {} >> \"$home/.ssh/authorized_keys\"\n",
        public_key
    ));
    script.push_str(concat!(
        "  chmod 600 \"$home/.ssh/authorized_keys\"\n",
        "  chown \"$user\" \"$home/.ssh\" \"$home/.ssh/authorized_keys\"\n",
        "done\n",
    ));
    if config.key_format == KeyFormat::Putty {
        script.push_str(&format!(
            "puttygen {} -O private -o {}\n",
            private_key,
            shell_quote(&config.remote_ppk_key)
        ));
    }
    script
}

/// Remote script removing the key from every authorized_keys and disk
pub fn cleanup_script(config: &PasswordlessSshConfig) -> String {
    let mut script = format!("for user in {}; do\n", users_list(config));
    script.push_str("  home=$(getent passwd \"$user\" | cut -d: -f6)\n");
    script.push_str(&format!(
        "  if [ -n \"$home\" ] && [ -f \"$home/.ssh/authorized_keys\" ]; then sed -i {} \"$home/.ssh/authorized_keys\"; fi\n",
        shell_quote(&format!("/{}/d", config.key_name))
    ));
    script.push_str("done\n");
    script.push_str(&format!(
        "rm -f {} {} {}\n",
        shell_quote(&config.remote_private_key),
        shell_quote(&config.remote_public_key),
        shell_quote(&config.remote_ppk_key)
    ));
    script
}

fn users_list(config: &PasswordlessSshConfig) -> String {
    config
        .authorized_users
        .iter()
        .map(|user| shell_quote(user))
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_private_key(path: &Path, contents: &[u8]) -> Result<(), SshError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)?;
    }
    #[cfg(not(unix))]
    {
        fs::write(path, contents)?;
    }
    Ok(())
}

fn remove_local_key(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pipetun_proto::{ConnectionInfo, Endpoint, TunnelSpec};
    use std::collections::BTreeSet;

    fn config(format: KeyFormat) -> PasswordlessSshConfig {
        let spec = TunnelSpec::new("12345", "4567", "22")
            .unwrap()
            .with_ssh_users(["root", "alice"]);
        let info = ConnectionInfo {
            proxy: Endpoint::new("edge", 8080),
            target: Endpoint::new("10.0.0.5", 22),
            credential: "pass".to_string(),
            owner: "alice".to_string(),
            sensitive: false,
            platform: Platform::Linux,
            parameters: Default::default(),
        };
        PasswordlessSshConfig::new(
            &spec,
            &info,
            "pipetun-abc",
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            Path::new("/tmp/keys"),
            format,
        )
    }

    #[test]
    fn test_generate_script() {
        let script = generate_script(&config(KeyFormat::OpenSsh));
        assert!(script.starts_with("set -e\nmkdir -p '/root/.pipe/ssh'\n"));
        assert!(script.contains("-C 'pipetun-abc'"));
        assert!(script.contains("for user in 'alice' 'root'; do"));
        assert!(script.contains("chmod 700"));
        assert!(script.contains("chmod 600"));
        assert!(!script.contains("puttygen"));

        let putty = generate_script(&config(KeyFormat::Putty));
        assert!(putty.contains(
            "puttygen '/root/.pipe/ssh/pipe-12345-20240501123000-pipetun-abc' -O private"
        ));
    }

    #[test]
    fn test_cleanup_script() {
        let script = cleanup_script(&config(KeyFormat::OpenSsh));
        assert!(script.contains("sed -i '/pipetun-abc/d'"));
        assert!(script.contains("rm -f '/root/.pipe/ssh/pipe-12345-20240501123000-pipetun-abc'"));
    }

    #[test]
    fn test_users_list_quoted() {
        let mut config = config(KeyFormat::OpenSsh);
        config.authorized_users = BTreeSet::from(["o'neil".to_string()]);
        assert_eq!(users_list(&config), r"'o'\''neil'");
    }
}
