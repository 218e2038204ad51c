use super::{Context, Logging};
use crate::args::StartArgs;
use crate::config::Settings;
use crate::conflict::{ConflictResolver, Resolution};
use crate::error::TunnelError;
use crate::launcher::{default_log_file, Launcher};
use crate::registry::terminate_all;
use crate::ssh::{client_store, local_key_root, provision_over_tunnel, release_over_tunnel};
use anyhow::Context as _;
use pipetun_connection::{Dialer, ProxyCredentials};
use pipetun_proto::{format_ports, ConnectionInfo, TunnelSpec};
use pipetun_relay::{run_supervised_until, shutdown_signal, DirectRelay, PortMapping, RelayError};
use pipetun_ssh::{ProvisionedSsh, SshError};
use std::time::Duration;
use tracing::{error, info, warn};

/// `pipetun tunnel start`
pub async fn start(ctx: &Context, args: &StartArgs, logging: &Logging) -> anyhow::Result<()> {
    let spec = args.spec()?;

    let metadata = ctx.metadata()?;
    let info = metadata
        .connection_info(&spec.host_id, args.region.as_deref())
        .await?;
    if info.sensitive {
        return Err(TunnelError::Sensitive(spec.host_id.clone()).into());
    }

    let resolver = ConflictResolver::new(
        ctx.registry.as_ref(),
        ctx.probe.as_ref(),
        &ctx.settings.listen_host,
        Duration::from_secs(args.timeout_stop),
    );
    let resolution = resolver
        .resolve(&spec, args.policy(), args.ignore_existing, args.ignore_owner)
        .await?;
    if let Resolution::Reuse {
        record,
        reprovision_ssh,
    } = resolution
    {
        let mut reused = spec.clone();
        if let Some(existing) = &record.spec {
            reused.local_ports = existing.local_ports.clone();
            reused.remote_ports = existing.remote_ports.clone();
        }
        if reprovision_ssh {
            info!(
                "Tunnel {} belongs to {}, setting up passwordless SSH for this user",
                record.pid, record.owner
            );
            provision_and_record(ctx, &reused, &info, args.ssh_keep).await?;
        }
        println!(
            "Tunnel to {} is already running on ports {} (pid {})",
            reused.host_id,
            format_ports(&reused.local_ports),
            record.pid
        );
        return Ok(());
    }

    if args.foreground {
        let relay = build_relay(&ctx.settings, &spec, &info, args.retries)?;
        serve_foreground(ctx, args, &spec, &info, &relay).await
    } else {
        start_background(ctx, args, &spec, &info, logging).await
    }
}

/// Point-to-point relay for a spec, through the edge unless `direct`
pub fn build_relay(
    settings: &Settings,
    spec: &TunnelSpec,
    info: &ConnectionInfo,
    retries: Option<usize>,
) -> Result<DirectRelay, TunnelError> {
    let retries = retries.unwrap_or(settings.retries);
    let timeout = settings.connect_timeout();
    let dialer = if spec.direct {
        Dialer::direct(timeout, retries)
    } else {
        let credentials = ProxyCredentials::new(
            settings.user.clone().unwrap_or_else(|| info.owner.clone()),
            settings.access_token.clone().unwrap_or_default(),
        );
        Dialer::via_proxy(info.proxy.clone(), credentials, timeout, retries)
    };
    let mappings = spec
        .port_pairs()
        .map(|(local, remote)| PortMapping::new(local, info.target_port(remote)))
        .collect();
    Ok(DirectRelay::new(
        settings.listen_host.clone(),
        mappings,
        dialer,
    )?)
}

fn relay_finished(result: Result<(), RelayError>) -> anyhow::Result<()> {
    match result {
        Ok(()) | Err(RelayError::Cancelled) => Ok(()),
        Err(e) => Err(TunnelError::from(e).into()),
    }
}

async fn serve_foreground(
    ctx: &Context,
    args: &StartArgs,
    spec: &TunnelSpec,
    info: &ConnectionInfo,
    relay: &DirectRelay,
) -> anyhow::Result<()> {
    // Shutdown is handled here so the relay outlives remote SSH cleanup
    let serving = run_supervised_until(
        "Tunnel",
        ctx.settings.restart_backoff(),
        || relay.run(),
        std::future::pending::<()>(),
    );
    tokio::pin!(serving);

    let store = if spec.use_ssh && !args.skip_ssh_setup {
        Some(client_store(spec)?)
    } else {
        None
    };
    let mut provisioned = None;
    if let Some(store) = &store {
        let key_root = local_key_root()?;
        tokio::select! {
            result = &mut serving => return relay_finished(result),
            result = provision_over_tunnel(
                spec,
                info,
                store.as_ref(),
                &ctx.settings,
                &key_root,
                args.ssh_keep,
                shutdown_signal(),
            ) => match result {
                Ok(done) => provisioned = Some(done),
                Err(TunnelError::Ssh(SshError::Interrupted)) => {
                    info!("Shutting down tunnel to {} during SSH setup", spec.host_id);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            },
        }
    }

    info!(
        "Tunnel to {} is serving ports {}",
        spec.host_id,
        format_ports(&spec.local_ports)
    );
    let mut serving_done = false;
    let outcome = tokio::select! {
        result = &mut serving => {
            serving_done = true;
            relay_finished(result)
        }
        _ = shutdown_signal() => {
            info!("Shutting down tunnel to {}", spec.host_id);
            Ok(())
        }
    };

    if let (Some(store), Some(provisioned)) = (&store, &provisioned) {
        let release = release_over_tunnel(store.as_ref(), provisioned, &ctx.settings);
        tokio::pin!(release);
        if serving_done {
            release.await;
        } else {
            tokio::select! {
                _ = &mut release => {}
                result = &mut serving => {
                    if let Err(e) = relay_finished(result) {
                        warn!("Tunnel failed during SSH cleanup: {}", e);
                    }
                    release.await;
                }
            }
        }
    }
    outcome
}

async fn start_background(
    ctx: &Context,
    args: &StartArgs,
    spec: &TunnelSpec,
    info: &ConnectionInfo,
    logging: &Logging,
) -> anyhow::Result<()> {
    let log_file = match &logging.file {
        Some(file) => file.clone(),
        None => default_log_file(&spec.host_id, &spec.local_ports)?,
    };
    let program = std::env::current_exe().context("Failed to locate the pipetun executable")?;
    let child_args = args.child_args(&logging.level, &log_file);

    let launcher = Launcher::new(
        ctx.probe.as_ref(),
        &ctx.settings.listen_host,
        Duration::from_secs(args.timeout),
    );
    let pid = launcher
        .launch(&program, &child_args, &log_file, &spec.local_ports)
        .await?;

    let mut alias = None;
    if spec.use_ssh {
        match provision_and_record(ctx, spec, info, args.ssh_keep).await {
            Ok(provisioned) => alias = Some(provisioned.config.alias),
            Err(e) => {
                error!("Passwordless SSH setup failed, stopping tunnel {}", pid);
                let timeout = Duration::from_secs(args.timeout_stop);
                if let Err(stop_error) =
                    terminate_all(ctx.registry.as_ref(), &[pid], timeout, false).await
                {
                    warn!("Failed to stop tunnel {}: {}", pid, stop_error);
                }
                return Err(e);
            }
        }
    }

    println!(
        "Tunnel to {} is running in the background (pid {})",
        spec.host_id, pid
    );
    println!("  Local ports: {}", format_ports(&spec.local_ports));
    if let Some(alias) = alias {
        println!("  SSH: ssh {}", alias);
    }
    println!("  Logs: {}", log_file.display());
    Ok(())
}

/// Provision over a running tunnel and remember it for `stop`
async fn provision_and_record(
    ctx: &Context,
    spec: &TunnelSpec,
    info: &ConnectionInfo,
    keep: bool,
) -> anyhow::Result<ProvisionedSsh> {
    let store = client_store(spec)?;
    let provisioned = provision_over_tunnel(
        spec,
        info,
        store.as_ref(),
        &ctx.settings,
        &local_key_root()?,
        keep,
        shutdown_signal(),
    )
    .await?;

    if !keep {
        if let Err(e) = ctx.ssh_state.save(&provisioned.config) {
            release_over_tunnel(store.as_ref(), &provisioned, &ctx.settings).await;
            return Err(e);
        }
    }
    Ok(provisioned)
}
