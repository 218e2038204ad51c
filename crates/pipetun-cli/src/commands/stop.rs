use super::Context;
use crate::args::{parse_tunnel_process, StopArgs};
use crate::error::TunnelError;
use crate::ports::PortProbe;
use crate::registry::{terminate_all, TunnelProcessRecord};
use crate::ssh::{client_store, release_over_tunnel};
use pipetun_proto::{format_ports, parse_port_range};
use pipetun_relay::shutdown_signal;
use pipetun_ssh::ProvisionedSsh;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// `pipetun tunnel stop`
pub async fn stop(ctx: &Context, args: &StopArgs) -> anyhow::Result<()> {
    let ports = parse_port_range(args.local_port.as_deref().unwrap_or(""))?;
    let current_user = ctx.registry.current_user();
    let records = select_records(
        ctx.registry.scan(),
        args.host_id.as_deref(),
        &ports,
        &current_user,
        args.ignore_owner,
    );
    if records.is_empty() {
        println!("No matching tunnels are running");
        return Ok(());
    }

    for record in &records {
        release_ssh(ctx, record).await;
    }

    let pids: Vec<u32> = records.iter().map(|record| record.pid).collect();
    let timeout = Duration::from_secs(args.timeout);
    terminate_all(ctx.registry.as_ref(), &pids, timeout, args.force).await?;

    let served: Vec<u16> = records
        .iter()
        .flat_map(|record| record.local_ports().iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    wait_ports_released(
        ctx.probe.as_ref(),
        &ctx.settings.listen_host,
        &served,
        timeout,
    )
    .await?;

    println!("Stopped {} tunnel process(es)", pids.len());
    Ok(())
}

/// Records matching the stop filters
///
/// An empty `ports` matches any ports. Tunnels of other users are only
/// selected with `ignore_owner`.
pub fn select_records(
    records: impl Iterator<Item = TunnelProcessRecord>,
    host_id: Option<&str>,
    ports: &[u16],
    current_user: &str,
    ignore_owner: bool,
) -> Vec<TunnelProcessRecord> {
    records
        .filter(|record| {
            let Some(spec) = &record.spec else {
                return false;
            };
            host_id.map(|id| spec.host_id == id).unwrap_or(true)
                && (ports.is_empty() || spec.shares_local_ports(ports))
        })
        .filter(|record| {
            if ignore_owner || record.owner == current_user {
                return true;
            }
            info!(
                "Skipping tunnel {} of user {} (use --ignore-owner to stop it)",
                record.pid, record.owner
            );
            false
        })
        .collect()
}

/// Remove passwordless SSH a background tunnel was set up with
///
/// Best-effort: the remote key is only removed when the target can still be
/// reached through the tunnel.
async fn release_ssh(ctx: &Context, record: &TunnelProcessRecord) {
    let Some(spec) = record.spec.as_ref().filter(|spec| spec.use_ssh) else {
        return;
    };
    let alias = spec.ssh_alias();
    let mut config = match ctx.ssh_state.load(&alias) {
        Ok(Some(config)) => config,
        Ok(None) => {
            debug!("No passwordless SSH recorded for {}", alias);
            return;
        }
        Err(e) => {
            warn!("Failed to load passwordless SSH state of {}: {}", alias, e);
            return;
        }
    };

    let region = parse_tunnel_process(&record.raw_args).and_then(|args| args.region);
    match ctx.metadata() {
        Ok(metadata) => match metadata
            .connection_info(&spec.host_id, region.as_deref())
            .await
        {
            Ok(info) => config.password = info.credential,
            Err(e) => warn!("Cannot fetch SSH credentials of {}: {}", spec.host_id, e),
        },
        Err(e) => warn!("Cannot fetch SSH credentials of {}: {}", spec.host_id, e),
    }

    match client_store(spec) {
        Ok(store) => {
            release_over_tunnel(store.as_ref(), &ProvisionedSsh::restore(config), &ctx.settings)
                .await
        }
        Err(e) => warn!("Cannot open SSH client configuration: {}", e),
    }
    if let Err(e) = ctx.ssh_state.remove(&alias) {
        warn!("{:#}", e);
    }
}

async fn wait_ports_released(
    probe: &dyn PortProbe,
    host: &str,
    ports: &[u16],
    timeout: Duration,
) -> Result<(), TunnelError> {
    let deadline = Instant::now() + timeout;
    loop {
        let report = probe.check(host, ports);
        if report.is_free() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            let busy: Vec<u16> = report.occupied.keys().copied().collect();
            return Err(TunnelError::StopTimeout(format_ports(&busy)));
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(500)) => {}
            _ = shutdown_signal() => return Err(TunnelError::Cancelled),
        }
    }
}
