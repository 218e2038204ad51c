//! Discovery of running tunnel processes
//!
//! Discovery is best-effort: a process can exit or appear between a scan and
//! whatever is done with its result. Every scan reads the process table
//! afresh.

use crate::args::parse_tunnel_process;
use crate::error::{Result, TunnelError};
use pipetun_proto::TunnelSpec;
use std::collections::HashSet;
use std::time::Duration;
use sysinfo::{Pid, System, Users};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Executable name the scanner looks for
pub const TOOL_NAME: &str = "pipetun";

/// Owner reported when the OS does not tell
pub const UNKNOWN_OWNER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelProcessRecord {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub owner: String,
    pub raw_args: Vec<String>,
    pub spec: Option<TunnelSpec>,
}

impl TunnelProcessRecord {
    pub fn local_ports(&self) -> &[u16] {
        self.spec
            .as_ref()
            .map(|spec| spec.local_ports.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

pub trait TunnelRegistry: Send + Sync {
    /// Running tunnels, read lazily from a fresh snapshot
    fn scan(&self) -> Box<dyn Iterator<Item = TunnelProcessRecord> + '_>;

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;

    /// User name that ownership is compared against
    fn current_user(&self) -> String;
}

/// Registry over the OS process table
pub struct SystemRegistry;

struct Candidate {
    pid: u32,
    parent_pid: Option<u32>,
    owner: String,
    args: Vec<String>,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The scanning process and all of its ancestors
fn lineage(system: &System, own: Pid) -> HashSet<u32> {
    let mut seen = HashSet::new();
    let mut current = Some(own);
    while let Some(pid) = current {
        if !seen.insert(pid.as_u32()) {
            break;
        }
        current = system.process(pid).and_then(|p| p.parent());
    }
    seen
}

fn looks_like_tool(name: &str, args: &[String]) -> bool {
    name.contains(TOOL_NAME)
        || args
            .first()
            .and_then(|arg0| std::path::Path::new(arg0).file_name())
            .map(|file| file.to_string_lossy().contains(TOOL_NAME))
            .unwrap_or(false)
}

impl TunnelRegistry for SystemRegistry {
    fn scan(&self) -> Box<dyn Iterator<Item = TunnelProcessRecord> + '_> {
        let mut system = System::new();
        system.refresh_processes();
        let users = Users::new_with_refreshed_list();

        let excluded = match sysinfo::get_current_pid() {
            Ok(own) => lineage(&system, own),
            Err(e) => {
                warn!("Failed to determine own pid: {}", e);
                HashSet::new()
            }
        };

        let candidates: Vec<Candidate> = system
            .processes()
            .iter()
            .filter(|(pid, _)| !excluded.contains(&pid.as_u32()))
            .filter(|(_, process)| looks_like_tool(process.name(), process.cmd()))
            .map(|(pid, process)| Candidate {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(|p| p.as_u32()),
                owner: process
                    .user_id()
                    .and_then(|uid| users.get_user_by_id(uid))
                    .map(|user| user.name().to_string())
                    .unwrap_or_else(|| UNKNOWN_OWNER.to_string()),
                args: process.cmd().to_vec(),
            })
            .collect();

        Box::new(candidates.into_iter().filter_map(|candidate| {
            let args = parse_tunnel_process(&candidate.args)?;
            let spec = match args.spec() {
                Ok(spec) => Some(spec),
                Err(e) => {
                    debug!(pid = candidate.pid, "Skipping tunnel with invalid arguments: {}", e);
                    return None;
                }
            };
            Some(TunnelProcessRecord {
                pid: candidate.pid,
                parent_pid: candidate.parent_pid,
                owner: candidate.owner,
                raw_args: candidate.args,
                spec,
            })
        }))
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid as UnixPid;

            let raw = i32::try_from(pid)
                .map_err(|_| TunnelError::Registry(format!("invalid pid {}", pid)))?;
            let signal = match signal {
                StopSignal::Terminate => Signal::SIGTERM,
                StopSignal::Kill => Signal::SIGKILL,
            };
            match kill(UnixPid::from_raw(raw), signal) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(TunnelError::Registry(format!(
                    "failed to send {:?} to {}: {}",
                    signal, pid, e
                ))),
            }
        }
        #[cfg(not(unix))]
        {
            let mut system = System::new();
            let pid = Pid::from_u32(pid);
            if !system.refresh_process(pid) {
                return Ok(());
            }
            let delivered = system.process(pid).map(|process| match signal {
                StopSignal::Terminate => process
                    .kill_with(sysinfo::Signal::Term)
                    .unwrap_or_else(|| process.kill()),
                StopSignal::Kill => process.kill(),
            });
            match delivered {
                Some(false) => Err(TunnelError::Registry(format!(
                    "failed to stop process {}",
                    pid
                ))),
                _ => Ok(()),
            }
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }

    fn current_user(&self) -> String {
        let mut system = System::new();
        let users = Users::new_with_refreshed_list();
        sysinfo::get_current_pid()
            .ok()
            .filter(|pid| system.refresh_process(*pid))
            .and_then(|pid| system.process(pid).and_then(|p| p.user_id().cloned()))
            .and_then(|uid| users.get_user_by_id(&uid).map(|u| u.name().to_string()))
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| UNKNOWN_OWNER.to_string())
    }
}

/// Terminate `pids` and wait for them to exit
///
/// SIGTERM first; processes still alive after `timeout` get SIGKILL. With
/// `force` they are killed right away.
pub async fn terminate_all(
    registry: &dyn TunnelRegistry,
    pids: &[u32],
    timeout: Duration,
    force: bool,
) -> Result<()> {
    if pids.is_empty() {
        return Ok(());
    }

    let first = if force {
        StopSignal::Kill
    } else {
        StopSignal::Terminate
    };
    for pid in pids {
        info!("Stopping tunnel process {}", pid);
        registry.signal(*pid, first)?;
    }

    let deadline = Instant::now() + timeout;
    let mut escalated = force;
    loop {
        let alive: Vec<u32> = pids
            .iter()
            .copied()
            .filter(|pid| registry.is_alive(*pid))
            .collect();
        if alive.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            if escalated {
                return Err(TunnelError::Registry(format!(
                    "processes {:?} did not exit",
                    alive
                )));
            }
            for pid in &alive {
                warn!("Tunnel process {} ignored SIGTERM, killing it", pid);
                registry.signal(*pid, StopSignal::Kill)?;
            }
            escalated = true;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
