//! russh-backed remote shell

use crate::shell::{CommandOutput, RemoteShell};
use crate::SshError;
use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Accepts any server key
///
/// Sessions only ever target 127.0.0.1 through our own tunnel, and the host
/// key is exactly what provisioning reads off the remote side afterwards.
struct TunnelHandler;

impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct RusshSession {
    handle: Handle<TunnelHandler>,
}

impl RusshSession {
    /// Connect and authenticate with a password
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Self, SshError> {
        let address = format!("{}:{}", host, port);
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });

        info!("Connecting to SSH server at {}", address);
        let mut handle = match tokio::time::timeout(
            timeout,
            client::connect(config, (host, port), TunnelHandler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(SshError::Connect {
                    address,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(SshError::Connect {
                    address,
                    reason: format!("timed out after {:?}", timeout),
                })
            }
        };

        match handle.authenticate_password(user, password).await? {
            AuthResult::Success => {
                debug!("Authenticated as {} on {}", user, address);
                Ok(Self { handle })
            }
            AuthResult::Failure { .. } => Err(SshError::Auth {
                user: user.to_string(),
            }),
        }
    }
}

#[async_trait]
impl RemoteShell for RusshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = CommandOutput::default();
        let mut exit_status = None;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        // A channel closed without a status is treated as a failure
        output.exit_status = exit_status.unwrap_or(u32::MAX);
        Ok(output)
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
