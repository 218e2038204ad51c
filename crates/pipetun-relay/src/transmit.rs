//! Transmitting relay
//!
//! Keeps `pool_size` idle connections open to the tunnel host for every
//! tunnel port. When the far side starts talking on one of them, a fresh
//! connection to the output host is dialed and the two are paired. A slot
//! whose connection is torn down, or sat idle past the refresh interval,
//! reconnects right away so the pool never shrinks.

use crate::channels::{ChannelTable, SocketId, SocketRole};
use crate::pump::pump;
use crate::{ensure_unique, RelayError};
use pipetun_connection::Dialer;
use pipetun_proto::Endpoint;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TransmitConfig {
    pub tunnel_host: String,
    pub output_host: String,
    /// (tunnel port, output port) pairs
    pub mappings: Vec<(u16, u16)>,
    pub pool_size: usize,
    /// Idle pool connections older than this are replaced
    pub refresh_interval: Duration,
    /// Pause before redialing an unreachable tunnel host
    pub reconnect_backoff: Duration,
}

impl TransmitConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.mappings.is_empty() {
            return Err(RelayError::Config("no tunnel ports".to_string()));
        }
        if self.pool_size == 0 {
            return Err(RelayError::Config("pool size must be at least 1".to_string()));
        }
        ensure_unique(self.mappings.iter().map(|(tunnel, _)| *tunnel), "tunnel")
    }
}

#[derive(Debug)]
enum SlotEvent {
    Pooled { slot: usize, port: u16 },
    Paired { slot: usize, port: u16 },
    Released { slot: usize, reason: &'static str },
}

pub struct TransmittingRelay {
    config: TransmitConfig,
    tunnel_dialer: Dialer,
    output_dialer: Dialer,
}

impl TransmittingRelay {
    pub fn new(
        config: TransmitConfig,
        tunnel_dialer: Dialer,
        output_dialer: Dialer,
    ) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self {
            config,
            tunnel_dialer,
            output_dialer,
        })
    }

    pub async fn run(&self) -> Result<(), RelayError> {
        let (tx, mut rx) = mpsc::channel::<SlotEvent>(64);
        let mut slots = JoinSet::new();

        let mut slot = 0;
        for (tunnel_port, output_port) in &self.config.mappings {
            info!(
                "Keeping {} connection(s) to {}:{} for {}:{}",
                self.config.pool_size,
                self.config.tunnel_host,
                tunnel_port,
                self.config.output_host,
                output_port
            );
            for _ in 0..self.config.pool_size {
                slots.spawn(run_slot(
                    Slot {
                        id: slot,
                        tunnel: Endpoint::new(self.config.tunnel_host.clone(), *tunnel_port),
                        output: Endpoint::new(self.config.output_host.clone(), *output_port),
                        tunnel_dialer: self.tunnel_dialer.clone(),
                        output_dialer: self.output_dialer.clone(),
                        refresh_interval: self.config.refresh_interval,
                        reconnect_backoff: self.config.reconnect_backoff,
                    },
                    tx.clone(),
                ));
                slot += 1;
            }
        }
        drop(tx);

        let mut table = ChannelTable::new();
        let mut held: HashMap<usize, SocketId> = HashMap::new();

        while let Some(event) = rx.recv().await {
            match event {
                SlotEvent::Pooled { slot, port } => {
                    let id = table.track(SocketRole::Pooled, port, None);
                    held.insert(slot, id);
                    debug!(
                        slot,
                        port,
                        pooled = table.count(SocketRole::Pooled, port),
                        "Pool connection ready"
                    );
                }
                SlotEvent::Paired { slot, port } => {
                    if let Some(pooled) = held.get(&slot).copied() {
                        let output = table.track(SocketRole::Remote, port, None);
                        table.pair(pooled, output);
                    }
                }
                SlotEvent::Released { slot, reason } => {
                    if let Some(id) = held.remove(&slot) {
                        table.close(id);
                    }
                    debug!(slot, reason, active_pairings = table.pairings(), "Pool connection released");
                }
            }
        }

        // Slots only return when the engine itself is being dropped
        Ok(())
    }
}

struct Slot {
    id: usize,
    tunnel: Endpoint,
    output: Endpoint,
    tunnel_dialer: Dialer,
    output_dialer: Dialer,
    refresh_interval: Duration,
    reconnect_backoff: Duration,
}

/// Wait for the first byte on an idle pool connection
///
/// Returns false when the refresh interval elapses first or the peer closed.
async fn wait_for_activity(stream: &TcpStream, refresh_interval: Duration) -> bool {
    tokio::select! {
        ready = stream.readable() => {
            if ready.is_err() {
                return false;
            }
            let mut probe = [0u8; 1];
            matches!(stream.peek(&mut probe).await, Ok(n) if n > 0)
        }
        _ = sleep(refresh_interval) => false,
    }
}

async fn run_slot(slot: Slot, tx: mpsc::Sender<SlotEvent>) {
    let port = slot.tunnel.port;
    loop {
        let stream = match slot.tunnel_dialer.connect(&slot.tunnel).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(slot = slot.id, "Failed to reach tunnel host {}: {}", slot.tunnel, e);
                sleep(slot.reconnect_backoff).await;
                continue;
            }
        };
        if tx.send(SlotEvent::Pooled { slot: slot.id, port }).await.is_err() {
            return;
        }

        if !wait_for_activity(&stream, slot.refresh_interval).await {
            let _ = tx
                .send(SlotEvent::Released {
                    slot: slot.id,
                    reason: "refresh",
                })
                .await;
            continue;
        }

        let reason = match slot.output_dialer.connect(&slot.output).await {
            Ok(output) => {
                let _ = tx.send(SlotEvent::Paired { slot: slot.id, port }).await;
                let outcome = pump(stream, output).await;
                debug!(
                    slot = slot.id,
                    bytes_up = outcome.bytes_up,
                    bytes_down = outcome.bytes_down,
                    "Transmission finished"
                );
                "closed"
            }
            Err(e) => {
                warn!(slot = slot.id, "Failed to reach output {}: {}", slot.output, e);
                "output unreachable"
            }
        };
        if tx
            .send(SlotEvent::Released {
                slot: slot.id,
                reason,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TransmitConfig {
        TransmitConfig {
            tunnel_host: "tunnel".to_string(),
            output_host: "output".to_string(),
            mappings: vec![(7000, 22)],
            pool_size: 2,
            refresh_interval: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut empty = config();
        empty.mappings.clear();
        assert!(empty.validate().is_err());

        let mut no_pool = config();
        no_pool.pool_size = 0;
        assert!(no_pool.validate().is_err());

        let mut duplicated = config();
        duplicated.mappings.push((7000, 80));
        assert!(duplicated.validate().is_err());
    }
}
