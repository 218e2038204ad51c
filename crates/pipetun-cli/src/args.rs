//! Command-line definitions
//!
//! The same parser reads the live command line and the argument vectors of
//! other running tunnels found by the registry, so a running tunnel's spec is
//! recovered exactly the way it was originally built.

use crate::conflict::ConflictPolicy;
use clap::{Args, Parser, Subcommand};
use pipetun_proto::{ConfigurationError, TunnelSpec};
use std::ffi::OsString;
use std::path::PathBuf;

/// pipetun - TCP tunnels to platform runs and hosts
#[derive(Parser, Debug)]
#[command(name = "pipetun")]
#[command(about = "Forward local ports to remote runs through the platform edge", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Write logs to this file instead of stdout
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage tunnels
    Tunnel {
        #[command(subcommand)]
        command: TunnelCommands,
    },
    /// Manage CLI settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum TunnelCommands {
    /// Open a tunnel to a run or host
    Start(StartArgs),
    /// Stop running tunnels
    Stop(StopArgs),
    /// List running tunnels
    List,
    /// Keep a pool of connections to a tunnel host and relay them to an output host
    Transmit(TransmitArgs),
    /// Accept pooled tunnel connections and hand them to local clients
    Receive(ReceiveArgs),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective settings
    Show,
    /// Set the platform API URL
    SetApi { url: String },
    /// Set the platform access token
    SetToken { token: String },
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct StartArgs {
    /// Run id or host name
    pub host_id: String,

    /// Local port or inclusive range (A-B)
    #[arg(long = "local-port")]
    pub local_port: Option<String>,

    /// Remote port or inclusive range (A-B)
    #[arg(long = "remote-port")]
    pub remote_port: Option<String>,

    /// Configure passwordless SSH through the tunnel
    #[arg(long)]
    pub ssh: bool,

    /// SSH client config file to register the host in
    #[arg(long)]
    pub ssh_path: Option<PathBuf>,

    /// Alias to register the host under
    #[arg(long)]
    pub ssh_host: Option<String>,

    /// Remote users to authorize the key for (repeatable)
    #[arg(long = "ssh-user")]
    pub ssh_users: Vec<String>,

    /// Keep passwordless SSH configuration after the tunnel stops
    #[arg(long)]
    pub ssh_keep: bool,

    /// Connect to the target directly instead of through the edge proxy
    #[arg(long)]
    pub direct: bool,

    /// Reuse any tunnel already serving the ports
    #[arg(long, group = "policy")]
    pub keep_existing: bool,

    /// Reuse an identical tunnel, fail on a different one
    #[arg(long, group = "policy")]
    pub keep_same: bool,

    /// Replace any tunnel already serving the ports
    #[arg(long, group = "policy")]
    pub replace_existing: bool,

    /// Replace a different tunnel, reuse an identical one
    #[arg(long, group = "policy")]
    pub replace_different: bool,

    /// Skip the check for tunnels already serving the ports
    #[arg(long)]
    pub ignore_existing: bool,

    /// Allow replacing tunnels started by other users
    #[arg(long)]
    pub ignore_owner: bool,

    /// Serve in this process instead of launching a background tunnel
    #[arg(short, long)]
    pub foreground: bool,

    /// Seconds to wait for a background tunnel to come up
    #[arg(long, default_value = "60")]
    pub timeout: u64,

    /// Seconds to wait for replaced tunnels to stop
    #[arg(long, default_value = "60")]
    pub timeout_stop: u64,

    /// Connection attempts per client after the first one
    #[arg(long)]
    pub retries: Option<usize>,

    /// Cloud region of the edge to use
    #[arg(long)]
    pub region: Option<String>,

    /// Passwordless SSH is set up by the launching process
    #[arg(long, hide = true)]
    pub skip_ssh_setup: bool,
}

impl StartArgs {
    pub fn spec(&self) -> Result<TunnelSpec, ConfigurationError> {
        Ok(TunnelSpec::new(
            &self.host_id,
            self.local_port.as_deref().unwrap_or(""),
            self.remote_port.as_deref().unwrap_or(""),
        )?
        .with_ssh(self.ssh)
        .with_ssh_config_path(self.ssh_path.clone())
        .with_ssh_host(self.ssh_host.clone())
        .with_ssh_users(self.ssh_users.iter().cloned())
        .with_direct(self.direct))
    }

    pub fn policy(&self) -> ConflictPolicy {
        if self.keep_existing {
            ConflictPolicy::KeepExisting
        } else if self.keep_same {
            ConflictPolicy::KeepSame
        } else if self.replace_existing {
            ConflictPolicy::ReplaceExisting
        } else if self.replace_different {
            ConflictPolicy::ReplaceDifferent
        } else {
            ConflictPolicy::None
        }
    }

    /// Arguments for the detached foreground child
    ///
    /// Conflict policies are dropped since this process already resolved
    /// conflicts.
    pub fn child_args(&self, log_level: &str, log_file: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            "tunnel".to_string(),
            "start".to_string(),
            self.host_id.clone(),
        ];
        let mut push = |flag: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        };
        push("--local-port", self.local_port.clone());
        push("--remote-port", self.remote_port.clone());
        push(
            "--ssh-path",
            self.ssh_path.as_ref().map(|p| p.display().to_string()),
        );
        push("--ssh-host", self.ssh_host.clone());
        for user in &self.ssh_users {
            push("--ssh-user", Some(user.clone()));
        }
        push("--retries", self.retries.map(|r| r.to_string()));
        push("--region", self.region.clone());
        push("--timeout", Some(self.timeout.to_string()));
        push("--timeout-stop", Some(self.timeout_stop.to_string()));
        push("--log-level", Some(log_level.to_string()));
        push("--log-file", Some(log_file.display().to_string()));

        for (enabled, flag) in [
            (self.ssh, "--ssh"),
            (self.ssh_keep, "--ssh-keep"),
            (self.direct, "--direct"),
            (self.ssh, "--skip-ssh-setup"),
            (true, "--foreground"),
            (true, "--ignore-existing"),
        ] {
            if enabled {
                args.push(flag.to_string());
            }
        }
        args
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct StopArgs {
    /// Run id or host name; all tunnels when omitted
    pub host_id: Option<String>,

    /// Only tunnels serving any of these local ports
    #[arg(long = "local-port")]
    pub local_port: Option<String>,

    /// Seconds to wait before killing tunnels that ignore SIGTERM
    #[arg(long, default_value = "60")]
    pub timeout: u64,

    /// Kill immediately
    #[arg(long)]
    pub force: bool,

    /// Also stop tunnels started by other users
    #[arg(long)]
    pub ignore_owner: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TransmitArgs {
    /// Host accepting pooled tunnel connections
    #[arg(long)]
    pub tunnel_host: String,

    /// Tunnel port or range (A-B)
    #[arg(long)]
    pub tunnel_ports: String,

    /// Host receiving the relayed traffic
    #[arg(long, default_value = "127.0.0.1")]
    pub output_host: String,

    /// Output port or range; defaults to the tunnel ports
    #[arg(long)]
    pub output_ports: Option<String>,

    /// Idle connections kept per tunnel port
    #[arg(long, default_value = "10")]
    pub pool_size: usize,

    /// Seconds after which an idle pooled connection is replaced
    #[arg(long, default_value = "60")]
    pub refresh_interval: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ReceiveArgs {
    /// Ports local clients connect to (port or A-B)
    #[arg(long)]
    pub input_ports: String,

    /// Ports the transmitter connects to; same count as input ports
    #[arg(long)]
    pub tunnel_ports: String,

    /// Address to listen on; defaults to the configured listen host
    #[arg(long)]
    pub listen_host: Option<String>,
}

/// Expand the two-letter short flags clap cannot express
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(|arg| {
            let arg = arg.into();
            match arg.to_str() {
                Some("-lp") => OsString::from("--local-port"),
                Some("-rp") => OsString::from("--remote-port"),
                _ => arg,
            }
        })
        .collect()
}

/// Recover the start arguments of a running foreground tunnel
///
/// Returns `None` for anything that is not `tunnel start ... --foreground`.
pub fn parse_tunnel_process(argv: &[String]) -> Option<StartArgs> {
    let has_marker = argv
        .windows(2)
        .any(|pair| pair[0] == "tunnel" && pair[1] == "start");
    let foreground = argv.iter().any(|arg| arg == "--foreground" || arg == "-f");
    if !has_marker || !foreground {
        return None;
    }

    match Cli::try_parse_from(normalize_args(argv)).ok()?.command {
        Commands::Tunnel {
            command: TunnelCommands::Start(args),
        } if args.foreground => Some(args),
        _ => None,
    }
}
