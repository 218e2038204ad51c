//! Connection metadata for runs and hosts

use crate::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Run parameter linking a cluster worker to its parent run
pub const PARENT_RUN_PARAMETER: &str = "parent-id";

/// Run parameter listing the users passwordless SSH is provisioned for
pub const SSH_USERS_PARAMETER: &str = "CP_CAP_SSH_USERS";

/// A host:port pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Same host, different port
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

/// `host:port`, with IPv6 hosts in brackets
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ConfigurationError::InvalidEndpoint(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigurationError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(ConfigurationError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self::new(host.trim_start_matches('[').trim_end_matches(']'), port))
    }
}

/// Operating system of the tunnel target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Linux,
    Windows,
}

impl From<&str> for Platform {
    fn from(value: &str) -> Self {
        if value.eq_ignore_ascii_case("windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

/// How to reach a tunnel target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Edge proxy accepting HTTP CONNECT
    pub proxy: Endpoint,
    /// Target host; the port is the target's default and is replaced per pairing
    pub target: Endpoint,
    /// SSH pass-phrase of the target
    pub credential: String,
    pub owner: String,
    /// Sensitive targets refuse tunneling
    pub sensitive: bool,
    pub platform: Platform,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl ConnectionInfo {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Parent run of a cluster worker, if any
    pub fn parent_run_id(&self) -> Option<u64> {
        self.parameter(PARENT_RUN_PARAMETER)
            .and_then(|value| value.trim().parse().ok())
    }

    /// Users configured on the run for SSH access
    pub fn ssh_users_override(&self) -> Option<BTreeSet<String>> {
        let users: BTreeSet<String> = self
            .parameter(SSH_USERS_PARAMETER)?
            .split(',')
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(str::to_string)
            .collect();
        (!users.is_empty()).then_some(users)
    }

    pub fn target_port(&self, port: u16) -> Endpoint {
        self.target.with_port(port)
    }
}
