//! Remote command execution

use crate::{shell_quote, SshError};
use async_trait::async_trait;

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Turn a non-zero exit status into [`SshError::Command`]
    pub fn check(self, command: &str) -> Result<Self, SshError> {
        if self.success() {
            Ok(self)
        } else {
            Err(SshError::Command {
                command: command.to_string(),
                status: self.exit_status,
                stderr: self.stderr_lossy(),
            })
        }
    }
}

/// A shell on the remote host
#[async_trait]
pub trait RemoteShell: Send {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SshError>;

    /// Fetch a remote file's contents
    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, SshError> {
        let command = format!("cat {}", shell_quote(path));
        Ok(self.exec(&command).await?.check(&command)?.stdout)
    }

    async fn close(&mut self) -> Result<(), SshError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(CommandOutput);

    #[async_trait]
    impl RemoteShell for Canned {
        async fn exec(&mut self, _command: &str) -> Result<CommandOutput, SshError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_read_file_fails_on_status() {
        let mut shell = Canned(CommandOutput {
            exit_status: 1,
            stdout: Vec::new(),
            stderr: b"cat: /nope: No such file or directory\n".to_vec(),
        });
        let err = shell.read_file("/nope").await.unwrap_err();
        assert!(matches!(err, SshError::Command { status: 1, .. }));
        assert!(err.to_string().contains("No such file"));
    }

    #[tokio::test]
    async fn test_read_file_returns_stdout() {
        let mut shell = Canned(CommandOutput {
            exit_status: 0,
            stdout: b"key".to_vec(),
            stderr: Vec::new(),
        });
        assert_eq!(shell.read_file("/root/key").await.unwrap(), b"key");
    }
}
