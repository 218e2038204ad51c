//! OpenSSH flat-file store
//!
//! Entries are written as marked blocks:
//!
//! ```text
//! # BEGIN pipe-tunnel pipe-12345
//! Host pipe-12345
//!     ...
//! # END pipe-tunnel pipe-12345
//! ```
//!
//! The begin marker records how the file looked before the block went in
//! (missing trailing newline, or no file at all), so removing the block puts
//! the file back exactly as it was.

use crate::store::{HostEntry, KeyFormat, SshClientConfigStore};
use crate::SshError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const BEGIN: &str = "# BEGIN pipe-tunnel ";
const END: &str = "# END pipe-tunnel ";
const APPENDED_NEWLINE: &str = " (appended-newline)";
const CREATED: &str = " (created)";

pub struct OpenSshConfigStore {
    config_path: PathBuf,
    known_hosts_path: PathBuf,
}

impl OpenSshConfigStore {
    pub fn new(config_path: impl Into<PathBuf>, known_hosts_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            known_hosts_path: known_hosts_path.into(),
        }
    }

    /// `~/.ssh/config` and `~/.ssh/known_hosts`, with an optional config override
    pub fn for_user(config_override: Option<PathBuf>) -> Result<Self, SshError> {
        let ssh_dir = dirs::home_dir()
            .ok_or_else(|| {
                SshError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "home directory not found",
                ))
            })?
            .join(".ssh");
        Ok(Self::new(
            config_override.unwrap_or_else(|| ssh_dir.join("config")),
            ssh_dir.join("known_hosts"),
        ))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn known_hosts_path(&self) -> &Path {
        &self.known_hosts_path
    }
}

impl SshClientConfigStore for OpenSshConfigStore {
    fn name(&self) -> &'static str {
        "openssh"
    }

    fn key_format(&self) -> KeyFormat {
        KeyFormat::OpenSsh
    }

    fn add_host(&self, entry: &HostEntry) -> Result<(), SshError> {
        let body = format!(
            "Host {}\n    HostName {}\n    Port {}\n    User {}\n    IdentityFile {}\n    IdentitiesOnly yes\n",
            entry.alias,
            entry.hostname,
            entry.port,
            entry.user,
            entry.identity_file.display()
        );
        add_block(&self.config_path, &entry.alias, &body)?;
        debug!("Added host {} to {}", entry.alias, self.config_path.display());
        Ok(())
    }

    fn remove_host(&self, alias: &str) -> Result<(), SshError> {
        remove_block(&self.config_path, alias)
    }

    fn add_host_key(&self, alias: &str, port: u16, public_key: &str) -> Result<(), SshError> {
        let body = format!("[127.0.0.1]:{} {}\n", port, public_key.trim());
        add_block(&self.known_hosts_path, &host_key_label(alias, port), &body)
    }

    fn remove_host_key(&self, alias: &str, port: u16) -> Result<(), SshError> {
        remove_block(&self.known_hosts_path, &host_key_label(alias, port))
    }
}

fn host_key_label(alias: &str, port: u16) -> String {
    format!("{}:{}", alias, port)
}

/// Append a marked block, replacing an existing block with the same label
pub fn add_block(path: &Path, label: &str, body: &str) -> Result<(), SshError> {
    remove_block(path, label)?;

    let existing = match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let mut content = existing.clone().unwrap_or_default();
    let flag = match &existing {
        None => CREATED,
        Some(text) if !text.is_empty() && !text.ends_with('\n') => {
            content.push('\n');
            APPENDED_NEWLINE
        }
        Some(_) => "",
    };

    content.push_str(&format!("{}{}{}\n", BEGIN, label, flag));
    content.push_str(body);
    if !body.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&format!("{}{}\n", END, label));

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, content)?;
    Ok(())
}

/// Remove a marked block, restoring the bytes that surrounded it
pub fn remove_block(path: &Path, label: &str) -> Result<(), SshError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let begin = format!("{}{}", BEGIN, label);
    let end_line = format!("{}{}", END, label);

    let mut start = None;
    let mut flag = "";
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end_matches('\n');
        if start.is_none() {
            if let Some(rest) = trimmed.strip_prefix(&begin) {
                if rest.is_empty() || rest == APPENDED_NEWLINE || rest == CREATED {
                    start = Some(offset);
                    flag = if rest == APPENDED_NEWLINE {
                        APPENDED_NEWLINE
                    } else if rest == CREATED {
                        CREATED
                    } else {
                        ""
                    };
                }
            }
        } else if trimmed == end_line {
            let end = offset + line.len();
            let Some(start) = start else { break };
            let mut restored = String::with_capacity(content.len());
            let mut head = &content[..start];
            if flag == APPENDED_NEWLINE {
                head = head.strip_suffix('\n').unwrap_or(head);
            }
            restored.push_str(head);
            restored.push_str(&content[end..]);

            if flag == CREATED && restored.is_empty() {
                fs::remove_file(path)?;
            } else {
                fs::write(path, restored)?;
            }
            return Ok(());
        }
        offset += line.len();
    }

    Ok(())
}
