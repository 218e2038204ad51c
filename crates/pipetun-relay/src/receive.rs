//! Receiving relay
//!
//! Counterpart of the transmitting relay. Tunnel listeners accept the
//! transmitter's pool connections and park them per port; input listeners
//! accept clients and hand each one the oldest parked connection of the
//! mapped tunnel port. A client arriving while the pool is empty is closed.
//!
//! The transmitter recycles idle connections, so parked sockets the peer has
//! closed are dropped whenever a pool is touched.

use crate::channels::{ChannelTable, SocketId, SocketRole};
use crate::direct::{accept_loop, AcceptEvent};
use crate::pump::{pump, PumpOutcome};
use crate::{bind_with_retry, ensure_unique, Accepted, RelayError};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    pub listen_host: String,
    /// (input port, tunnel port) pairs
    pub mappings: Vec<(u16, u16)>,
}

impl ReceiveConfig {
    /// Input and tunnel ports must map one to one and never overlap
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.mappings.is_empty() {
            return Err(RelayError::Config("no input ports".to_string()));
        }
        ensure_unique(self.mappings.iter().map(|(input, _)| *input), "input")?;
        ensure_unique(self.mappings.iter().map(|(_, tunnel)| *tunnel), "tunnel")?;

        let inputs: HashSet<u16> = self.mappings.iter().map(|(input, _)| *input).collect();
        if let Some((_, tunnel)) = self.mappings.iter().find(|(_, t)| inputs.contains(t)) {
            return Err(RelayError::Config(format!(
                "port {} is used both as input and tunnel port",
                tunnel
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ListenerKind {
    Input,
    Tunnel,
}

enum Event {
    Accepted(Accepted),
    AcceptFailed { port: u16, source: std::io::Error },
}

impl From<AcceptEvent> for Event {
    fn from(event: AcceptEvent) -> Self {
        match event {
            AcceptEvent::Accepted(accepted) => Event::Accepted(accepted),
            AcceptEvent::Failed { port, source } => Event::AcceptFailed { port, source },
        }
    }
}

pub struct ReceivingRelay {
    config: ReceiveConfig,
}

impl ReceivingRelay {
    pub fn new(config: ReceiveConfig) -> Result<Self, RelayError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Bind all tunnel and input listeners
    pub async fn bind(&self) -> Result<Vec<(u16, TcpListener)>, RelayError> {
        let mut listeners = Vec::with_capacity(self.config.mappings.len() * 2);
        for (input, tunnel) in &self.config.mappings {
            let tunnel_listener = bind_with_retry(&self.config.listen_host, *tunnel).await?;
            let input_listener = bind_with_retry(&self.config.listen_host, *input).await?;
            info!(
                "Receiving tunnel connections on {}:{} for clients of port {}",
                self.config.listen_host, tunnel, input
            );
            listeners.push((*tunnel, tunnel_listener));
            listeners.push((*input, input_listener));
        }
        Ok(listeners)
    }

    pub async fn run(&self) -> Result<(), RelayError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Serve already bound listeners, keyed by their configured port
    pub async fn serve(&self, listeners: Vec<(u16, TcpListener)>) -> Result<(), RelayError> {
        let mut kinds: HashMap<u16, ListenerKind> = HashMap::new();
        let mut tunnel_for_input: HashMap<u16, u16> = HashMap::new();
        for (input, tunnel) in &self.config.mappings {
            kinds.insert(*input, ListenerKind::Input);
            kinds.insert(*tunnel, ListenerKind::Tunnel);
            tunnel_for_input.insert(*input, *tunnel);
        }

        let (tx, mut rx) = mpsc::channel::<Event>(64);
        let mut acceptors = JoinSet::new();
        for (port, listener) in listeners {
            acceptors.spawn(accept_loop(port, listener, tx.clone()));
        }
        drop(tx);

        let mut pools: HashMap<u16, Pool> = HashMap::new();
        let mut table = ChannelTable::new();
        let mut pairings: JoinSet<(SocketId, PumpOutcome)> = JoinSet::new();

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Event::Accepted(accepted)) => match kinds.get(&accepted.port) {
                        Some(ListenerKind::Tunnel) => {
                            let id = table.track(SocketRole::Pooled, accepted.port, Some(accepted.peer));
                            let pool = pools.entry(accepted.port).or_default();
                            prune_closed(pool, &mut table);
                            pool.push_back((id, accepted.stream));
                            debug!(port = accepted.port, pooled = pool.len(), "Tunnel connection pooled");
                        }
                        Some(ListenerKind::Input) => {
                            let tunnel_port = tunnel_for_input[&accepted.port];
                            match pools
                                .get_mut(&tunnel_port)
                                .and_then(|pool| claim_open(pool, &mut table))
                            {
                                Some((pooled, tunnel_stream)) => {
                                    let client = table.track(SocketRole::Client, accepted.port, Some(accepted.peer));
                                    table.pair(client, pooled);
                                    pairings.spawn(async move {
                                        (client, pump(accepted.stream, tunnel_stream).await)
                                    });
                                }
                                None => {
                                    warn!(
                                        input_port = accepted.port,
                                        tunnel_port,
                                        "No tunnel connection available, closing client {}",
                                        accepted.peer
                                    );
                                }
                            }
                        }
                        None => warn!(port = accepted.port, "Connection on an unknown port"),
                    },
                    Some(Event::AcceptFailed { port, source }) => {
                        error!(port, "Listener failed: {}", source);
                        return Err(RelayError::Accept { port, source });
                    }
                    None => return Ok(()),
                },
                Some(joined) = pairings.join_next() => match joined {
                    Ok((client, outcome)) => {
                        table.close(client);
                        debug!(
                            bytes_up = outcome.bytes_up,
                            bytes_down = outcome.bytes_down,
                            active_pairings = table.pairings(),
                            "Pairing closed"
                        );
                    }
                    Err(e) => warn!("Pairing task failed: {}", e),
                },
            }
        }
    }
}

type Pool = VecDeque<(SocketId, TcpStream)>;

/// The stream back if its peer has not closed it
///
/// Peeks on the raw socket: the runtime may not have seen the FIN of a
/// connection that has been idle since it was parked.
fn still_open(stream: TcpStream) -> Option<TcpStream> {
    let stream = stream.into_std().ok()?;
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf) {
        Ok(0) => return None,
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(_) => return None,
    }
    TcpStream::from_std(stream).ok()
}

fn prune_closed(pool: &mut Pool, table: &mut ChannelTable) {
    for (id, stream) in std::mem::take(pool) {
        match still_open(stream) {
            Some(stream) => pool.push_back((id, stream)),
            None => {
                table.close(id);
                debug!("Dropped closed tunnel connection from the pool");
            }
        }
    }
}

/// Oldest parked connection that is still open
fn claim_open(pool: &mut Pool, table: &mut ChannelTable) -> Option<(SocketId, TcpStream)> {
    while let Some((id, stream)) = pool.pop_front() {
        match still_open(stream) {
            Some(stream) => return Some((id, stream)),
            None => {
                table.close(id);
                debug!("Skipped closed tunnel connection");
            }
        }
    }
    None
}
