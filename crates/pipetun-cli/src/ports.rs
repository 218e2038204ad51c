//! Local port occupancy
//!
//! A port is free when it can be bound on the listen host. For occupied
//! ports the owning process is looked up on Linux by matching the LISTEN
//! socket inodes of `/proc/net/tcp` and `/proc/net/tcp6` against the socket
//! links in `/proc/<pid>/fd`. Other platforms report occupied ports without
//! an owner.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::TcpListener;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDetails {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
}

impl fmt::Display for ProcessDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.name, self.pid)
    }
}

/// Occupied ports and their owners, if known
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortReport {
    pub occupied: BTreeMap<u16, Option<ProcessDetails>>,
}

impl PortReport {
    pub fn is_free(&self) -> bool {
        self.occupied.is_empty()
    }

    pub fn is_occupied(&self, port: u16) -> bool {
        self.occupied.contains_key(&port)
    }

    pub fn owner(&self, port: u16) -> Option<&ProcessDetails> {
        self.occupied.get(&port).and_then(Option::as_ref)
    }

    /// Occupied ports nobody could be found for
    pub fn unknown_owner(&self) -> Vec<u16> {
        self.occupied
            .iter()
            .filter(|(_, owner)| owner.is_none())
            .map(|(port, _)| *port)
            .collect()
    }

    /// One line per occupied port
    pub fn describe(&self) -> String {
        self.occupied
            .iter()
            .map(|(port, owner)| match owner {
                Some(owner) => format!("  port {} is used by {}", port, owner),
                None => format!("  port {} is used by an unknown process", port),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub trait PortProbe: Send + Sync {
    fn check(&self, host: &str, ports: &[u16]) -> PortReport;
}

/// Probes by binding, owners from procfs
pub struct SystemPortProbe;

impl PortProbe for SystemPortProbe {
    fn check(&self, host: &str, ports: &[u16]) -> PortReport {
        let occupied: Vec<u16> = ports
            .iter()
            .copied()
            .filter(|port| !can_bind(host, *port))
            .collect();
        if occupied.is_empty() {
            return PortReport::default();
        }

        let owners = listening_owners();
        PortReport {
            occupied: occupied
                .into_iter()
                .map(|port| (port, owners.get(&port).cloned()))
                .collect(),
        }
    }
}

/// Whether a listener can be opened; the probe listener is closed on return
pub fn can_bind(host: &str, port: u16) -> bool {
    match TcpListener::bind((host, port)) {
        Ok(_listener) => true,
        Err(e) => {
            trace!(port, "Port probe failed: {}", e);
            false
        }
    }
}

#[cfg(target_os = "linux")]
fn listening_owners() -> HashMap<u16, ProcessDetails> {
    let mut inodes: HashMap<u64, u16> = HashMap::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(parse_listen_inodes(&content));
        }
    }
    if inodes.is_empty() {
        return HashMap::new();
    }

    let mut owners = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return owners;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Other users' fd directories are unreadable; those ports stay unknown
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(link) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let Some(inode) = socket_inode(&link.to_string_lossy()) else {
                continue;
            };
            if let Some(port) = inodes.get(&inode) {
                owners.entry(*port).or_insert_with(|| process_details(pid));
            }
        }
    }
    owners
}

#[cfg(not(target_os = "linux"))]
fn listening_owners() -> HashMap<u16, ProcessDetails> {
    HashMap::new()
}

#[cfg(target_os = "linux")]
fn process_details(pid: u32) -> ProcessDetails {
    let name = std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let parent_pid = std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| parse_stat_ppid(&stat));
    ProcessDetails {
        pid,
        parent_pid,
        name,
    }
}

/// Socket inode → local port of every LISTEN entry of a /proc/net/tcp table
pub fn parse_listen_inodes(content: &str) -> HashMap<u64, u16> {
    const LISTEN: &str = "0A";
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != LISTEN {
                return None;
            }
            let (_, port) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            (inode != 0).then_some((inode, port))
        })
        .collect()
}

/// Inode of a `socket:[12345]` fd link
pub fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Parent pid from /proc/<pid>/stat; the command name may contain spaces
pub fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}
