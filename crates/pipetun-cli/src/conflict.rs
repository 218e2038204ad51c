//! Conflicts with tunnels already serving the requested ports

use crate::error::{Result, TunnelError};
use crate::ports::PortProbe;
use crate::registry::{terminate_all, TunnelProcessRecord, TunnelRegistry};
use pipetun_proto::{contiguous_runs, format_ports, TunnelSpec};
use std::time::Duration;
use tracing::{debug, info};

/// What to do with a running tunnel on the same ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    None,
    KeepExisting,
    KeepSame,
    ReplaceExisting,
    ReplaceDifferent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Reuse,
    Replace,
    Fail,
}

impl ConflictPolicy {
    pub fn decide(self, same_spec: bool) -> Decision {
        match (self, same_spec) {
            (ConflictPolicy::KeepExisting, _) => Decision::Reuse,
            (ConflictPolicy::KeepSame, true) => Decision::Reuse,
            (ConflictPolicy::KeepSame, false) => Decision::Fail,
            (ConflictPolicy::ReplaceExisting, _) => Decision::Replace,
            (ConflictPolicy::ReplaceDifferent, true) => Decision::Reuse,
            (ConflictPolicy::ReplaceDifferent, false) => Decision::Replace,
            (ConflictPolicy::None, _) => Decision::Fail,
        }
    }
}

/// How a start should proceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Ports are free, serve them
    Serve,
    /// A running tunnel stays in place
    Reuse {
        record: TunnelProcessRecord,
        /// Passwordless SSH belongs to another user and has to be set up
        /// for this one
        reprovision_ssh: bool,
    },
}

pub struct ConflictResolver<'a> {
    registry: &'a dyn TunnelRegistry,
    probe: &'a dyn PortProbe,
    listen_host: &'a str,
    stop_timeout: Duration,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(
        registry: &'a dyn TunnelRegistry,
        probe: &'a dyn PortProbe,
        listen_host: &'a str,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            probe,
            listen_host,
            stop_timeout,
        }
    }

    /// Settle conflicts, then make sure every local port can be bound
    pub async fn resolve(
        &self,
        spec: &TunnelSpec,
        policy: ConflictPolicy,
        ignore_existing: bool,
        ignore_owner: bool,
    ) -> Result<Resolution> {
        if !ignore_existing {
            if let Some(resolution) = self.settle(spec, policy, ignore_owner).await? {
                return Ok(resolution);
            }
        }

        let report = self.probe.check(self.listen_host, &spec.local_ports);
        if !report.is_free() {
            return Err(TunnelError::PortsOccupied(report.describe()));
        }
        Ok(Resolution::Serve)
    }

    async fn settle(
        &self,
        spec: &TunnelSpec,
        policy: ConflictPolicy,
        ignore_owner: bool,
    ) -> Result<Option<Resolution>> {
        let current_user = self.registry.current_user();
        let existing: Vec<TunnelProcessRecord> = self
            .registry
            .scan()
            .filter(|record| {
                record
                    .spec
                    .as_ref()
                    .map(|other| other.shares_local_ports(&spec.local_ports))
                    .unwrap_or(false)
            })
            .collect();
        if existing.is_empty() {
            return Ok(None);
        }

        let mut failures = Vec::new();
        let mut reused = Vec::new();
        let mut replaced = Vec::new();
        for record in existing {
            let same_spec = record.spec.as_ref() == Some(spec);
            let owned = record.owner == current_user;
            let decision = match policy.decide(same_spec) {
                Decision::Replace if !owned && !ignore_owner => Decision::Fail,
                decision => decision,
            };
            debug!(
                pid = record.pid,
                owner = %record.owner,
                same_spec,
                "Existing tunnel decision: {:?}",
                decision
            );
            match decision {
                Decision::Fail => failures.push(conflict_message(&record, same_spec, owned)),
                Decision::Reuse => reused.push(record),
                Decision::Replace => replaced.push(record),
            }
        }

        if !failures.is_empty() {
            return Err(TunnelError::Conflict(failures.join("\n")));
        }
        if !reused.is_empty() && !replaced.is_empty() {
            let ports: Vec<u16> = reused
                .iter()
                .chain(replaced.iter())
                .flat_map(|record| record.local_ports().iter().copied())
                .collect();
            return Err(TunnelError::Conflict(format!(
                "Tunnels on ports {} would be both kept and replaced, stop them first: {}",
                format_ports(&ports),
                remediation(&ports, false)
            )));
        }

        if let Some(record) = reused.into_iter().next() {
            info!(
                "Keeping existing tunnel {} (pid {}) on ports {}",
                record.spec.as_ref().map(|s| s.host_id.as_str()).unwrap_or("?"),
                record.pid,
                format_ports(record.local_ports())
            );
            let reprovision_ssh = record.spec.as_ref().map_or(false, |s| s.use_ssh)
                && record.owner != current_user;
            return Ok(Some(Resolution::Reuse {
                record,
                reprovision_ssh,
            }));
        }

        let pids: Vec<u32> = replaced.iter().map(|record| record.pid).collect();
        info!("Replacing existing tunnels {:?}", pids);
        terminate_all(self.registry, &pids, self.stop_timeout, false).await?;
        Ok(None)
    }
}

/// Stop commands for `ports`, one per contiguous run
fn remediation(ports: &[u16], other_owner: bool) -> String {
    let flag = if other_owner { " --ignore-owner" } else { "" };
    contiguous_runs(ports)
        .iter()
        .map(|run| format!("pipetun tunnel stop -lp {}{}", format_ports(run), flag))
        .collect::<Vec<_>>()
        .join(" && ")
}

fn conflict_message(record: &TunnelProcessRecord, same_spec: bool, owned: bool) -> String {
    let ports = format_ports(record.local_ports());
    let host = record
        .spec
        .as_ref()
        .map(|spec| spec.host_id.as_str())
        .unwrap_or("?");
    let fix = remediation(record.local_ports(), !owned);
    match (same_spec, owned) {
        (true, true) => format!(
            "The same tunnel to {} is already serving ports {} (pid {}). \
             Use --keep-same to reuse it or stop it with: {}",
            host, ports, record.pid, fix
        ),
        (false, true) => format!(
            "A different tunnel to {} is already serving ports {} (pid {}). \
             Use --replace-different to replace it or stop it with: {}",
            host, ports, record.pid, fix
        ),
        (true, false) => format!(
            "The same tunnel to {} is already serving ports {} (pid {}) for user {}. \
             Use --keep-same to reuse it or stop it with: {}",
            host, ports, record.pid, record.owner, fix
        ),
        (false, false) => format!(
            "A different tunnel to {} started by user {} is already serving ports {} (pid {}). \
             It can only be stopped with: {}",
            host, record.owner, ports, record.pid, fix
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_matrix() {
        use ConflictPolicy::*;
        use Decision::*;

        let cases = [
            (KeepExisting, Reuse, Reuse),
            (KeepSame, Reuse, Fail),
            (ReplaceExisting, Replace, Replace),
            (ReplaceDifferent, Reuse, Replace),
            (None, Fail, Fail),
        ];
        for (policy, same, different) in cases {
            assert_eq!(policy.decide(true), same, "{:?} same", policy);
            assert_eq!(policy.decide(false), different, "{:?} different", policy);
        }
    }

    #[test]
    fn test_owner_messages_differ() {
        let record = TunnelProcessRecord {
            pid: 42,
            parent_pid: None,
            owner: "bob".to_string(),
            raw_args: Vec::new(),
            spec: Some(TunnelSpec::new("12345", "4567", "22").unwrap()),
        };
        let same = conflict_message(&record, true, false);
        let different = conflict_message(&record, false, false);
        assert_ne!(same, different);
        assert!(same.contains("pipetun tunnel stop -lp 4567 --ignore-owner"));
        assert!(different.contains("bob"));

        let own = conflict_message(&record, true, true);
        assert!(own.ends_with("pipetun tunnel stop -lp 4567"));
    }

    #[test]
    fn test_remediation_splits_gaps() {
        assert_eq!(
            remediation(&[443, 80, 81], true),
            "pipetun tunnel stop -lp 80-81 --ignore-owner && pipetun tunnel stop -lp 443 --ignore-owner"
        );
        assert_eq!(remediation(&[4567, 4568], false), "pipetun tunnel stop -lp 4567-4568");
    }
}
