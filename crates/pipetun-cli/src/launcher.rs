//! Background tunnels
//!
//! A background tunnel is this executable started again in foreground mode,
//! detached from the terminal. The launching process waits until the child
//! listens on every requested port.

use crate::config::pipetun_home;
use crate::error::{Result, TunnelError};
use crate::ports::{PortProbe, PortReport};
use pipetun_proto::format_ports;
use pipetun_relay::shutdown_signal;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// ~/.pipetun/logs/tunnel-<host>-<ports>.log
pub fn default_log_file(host_id: &str, local_ports: &[u16]) -> anyhow::Result<PathBuf> {
    let name: String = format!("tunnel-{}-{}.log", host_id, format_ports(local_ports))
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ',' | ' ' => '_',
            c => c,
        })
        .collect();
    Ok(pipetun_home()?.join("logs").join(name))
}

/// Whether every port is served by `child` or one of its direct children
///
/// Ports whose owner cannot be determined count as served.
pub fn is_ready(report: &PortReport, ports: &[u16], child: u32) -> bool {
    ports.iter().all(|port| {
        report.is_occupied(*port)
            && report
                .owner(*port)
                .map(|owner| owner.pid == child || owner.parent_pid == Some(child))
                .unwrap_or(true)
    })
}

pub struct Launcher<'a> {
    probe: &'a dyn PortProbe,
    listen_host: &'a str,
    timeout: Duration,
}

impl<'a> Launcher<'a> {
    pub fn new(probe: &'a dyn PortProbe, listen_host: &'a str, timeout: Duration) -> Self {
        Self {
            probe,
            listen_host,
            timeout,
        }
    }

    /// Start `program args` detached and wait until it serves `ports`
    ///
    /// Returns the child's pid. A child that exits or does not come up in
    /// time is an error; in the latter case it is killed.
    pub async fn launch(
        &self,
        program: &Path,
        args: &[String],
        log_file: &Path,
        ports: &[u16],
    ) -> Result<u32> {
        let mut child = spawn_detached(program, args, log_file)?;
        let pid = child.id();
        info!(
            "Started background tunnel (pid {}), logging to {}",
            pid,
            log_file.display()
        );

        let outcome = tokio::select! {
            result = self.wait_ready(&mut child, ports) => result,
            _ = shutdown_signal() => Err(TunnelError::Cancelled),
        };
        if let Err(e) = &outcome {
            if matches!(child.try_wait(), Ok(None)) {
                warn!("Killing background tunnel {}: {}", pid, e);
                if let Err(e) = child.kill() {
                    debug!("Failed to kill {}: {}", pid, e);
                }
                let _ = child.wait();
            }
        }
        outcome.map(|()| pid)
    }

    async fn wait_ready(&self, child: &mut Child, ports: &[u16]) -> Result<()> {
        let pid = child.id();
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(TunnelError::Launch(format!(
                    "tunnel process {} exited with {}",
                    pid, status
                )));
            }
            let report = self.probe.check(self.listen_host, ports);
            if is_ready(&report, ports, pid) {
                info!("Background tunnel {} serves ports {}", pid, format_ports(ports));
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::Launch(format!(
                    "tunnel process {} did not open ports {} within {}s",
                    pid,
                    format_ports(ports),
                    self.timeout.as_secs()
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

fn spawn_detached(program: &Path, args: &[String], log_file: &Path) -> Result<Child> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let log = OpenOptions::new().create(true).append(true).open(log_file)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New session: no controlling terminal, own process group
        // SAFETY: setsid is async-signal-safe and touches no parent state
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    debug!("Launching {} {}", program.display(), args.join(" "));
    command
        .spawn()
        .map_err(|e| TunnelError::Launch(format!("failed to start {}: {}", program.display(), e)))
}
