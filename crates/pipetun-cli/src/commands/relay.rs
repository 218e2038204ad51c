use super::Context;
use crate::args::{ReceiveArgs, TransmitArgs};
use crate::error::TunnelError;
use pipetun_connection::Dialer;
use pipetun_proto::{parse_port_range, ConfigurationError};
use pipetun_relay::{
    run_supervised, ReceiveConfig, ReceivingRelay, RelayError, TransmitConfig, TransmittingRelay,
};
use std::time::Duration;

/// Position-wise pairs of two port specifications
fn pair_ports(
    first: &str,
    second: &str,
    first_name: &str,
) -> Result<Vec<(u16, u16)>, ConfigurationError> {
    let first_ports = parse_port_range(first)?;
    if first_ports.is_empty() {
        return Err(ConfigurationError::MissingOption(first_name.to_string()));
    }
    let second_ports = match parse_port_range(second)? {
        ports if ports.is_empty() => first_ports.clone(),
        ports => ports,
    };
    if first_ports.len() != second_ports.len() {
        return Err(ConfigurationError::PortCountMismatch {
            local: first_ports.len(),
            remote: second_ports.len(),
        });
    }
    Ok(first_ports.into_iter().zip(second_ports).collect())
}

fn finished(result: Result<(), RelayError>) -> anyhow::Result<()> {
    match result {
        Ok(()) | Err(RelayError::Cancelled) => Ok(()),
        Err(e) => Err(TunnelError::from(e).into()),
    }
}

/// `pipetun tunnel transmit`
pub async fn transmit(ctx: &Context, args: &TransmitArgs) -> anyhow::Result<()> {
    let mappings = pair_ports(
        &args.tunnel_ports,
        args.output_ports.as_deref().unwrap_or(""),
        "tunnel ports",
    )?;
    let config = TransmitConfig {
        tunnel_host: args.tunnel_host.clone(),
        output_host: args.output_host.clone(),
        mappings,
        pool_size: args.pool_size,
        refresh_interval: Duration::from_secs(args.refresh_interval),
        reconnect_backoff: Duration::from_secs(1),
    };
    let dialer = Dialer::direct(ctx.settings.connect_timeout(), ctx.settings.retries);
    let relay = TransmittingRelay::new(config, dialer.clone(), dialer)?;
    finished(
        run_supervised(
            "Transmitting relay",
            ctx.settings.restart_backoff(),
            || relay.run(),
        )
        .await,
    )
}

/// `pipetun tunnel receive`
pub async fn receive(ctx: &Context, args: &ReceiveArgs) -> anyhow::Result<()> {
    let config = ReceiveConfig {
        listen_host: args
            .listen_host
            .clone()
            .unwrap_or_else(|| ctx.settings.listen_host.clone()),
        mappings: pair_ports(&args.input_ports, &args.tunnel_ports, "input ports")?,
    };
    let relay = ReceivingRelay::new(config)?;
    finished(
        run_supervised(
            "Receiving relay",
            ctx.settings.restart_backoff(),
            || relay.run(),
        )
        .await,
    )
}
