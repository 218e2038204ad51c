//! Point-to-point relay
//!
//! One listener per local port. Every accepted client is paired with a
//! freshly dialed connection to the mapped remote endpoint; when the dial
//! fails the client is closed and the listener keeps accepting.

use crate::channels::{ChannelTable, SocketId, SocketRole};
use crate::pump::{pump, PumpOutcome};
use crate::{bind_with_retry, ensure_unique, Accepted, RelayError};
use pipetun_connection::{ConnectError, Dialer};
use pipetun_proto::Endpoint;
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A local port and where its traffic goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub local_port: u16,
    pub remote: Endpoint,
}

impl PortMapping {
    pub fn new(local_port: u16, remote: Endpoint) -> Self {
        Self { local_port, remote }
    }
}

enum Event {
    Accepted(Accepted),
    AcceptFailed { port: u16, source: std::io::Error },
    Paired { client: SocketId, port: u16 },
}

pub struct DirectRelay {
    listen_host: String,
    mappings: Vec<PortMapping>,
    dialer: Dialer,
}

impl DirectRelay {
    pub fn new(
        listen_host: impl Into<String>,
        mappings: Vec<PortMapping>,
        dialer: Dialer,
    ) -> Result<Self, RelayError> {
        if mappings.is_empty() {
            return Err(RelayError::Config("no ports to forward".to_string()));
        }
        ensure_unique(mappings.iter().map(|m| m.local_port), "local")?;
        Ok(Self {
            listen_host: listen_host.into(),
            mappings,
            dialer,
        })
    }

    pub fn local_ports(&self) -> Vec<u16> {
        self.mappings.iter().map(|m| m.local_port).collect()
    }

    /// Bind every local listener
    ///
    /// Returned pairs carry the requested port, which is the key used to find
    /// the remote endpoint while serving.
    pub async fn bind(&self) -> Result<Vec<(u16, TcpListener)>, RelayError> {
        let mut listeners = Vec::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            let listener = bind_with_retry(&self.listen_host, mapping.local_port).await?;
            info!(
                "Listening on {}:{} -> {}",
                self.listen_host, mapping.local_port, mapping.remote
            );
            listeners.push((mapping.local_port, listener));
        }
        Ok(listeners)
    }

    /// Bind and serve until an unrecoverable error
    pub async fn run(&self) -> Result<(), RelayError> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Serve already bound listeners
    ///
    /// Every socket is owned by this future; dropping it closes them all.
    pub async fn serve(&self, listeners: Vec<(u16, TcpListener)>) -> Result<(), RelayError> {
        let remotes: HashMap<u16, Endpoint> = self
            .mappings
            .iter()
            .map(|m| (m.local_port, m.remote.clone()))
            .collect();

        let (tx, mut rx) = mpsc::channel::<Event>(64);
        let mut acceptors = JoinSet::new();
        for (port, listener) in listeners {
            acceptors.spawn(accept_loop(port, listener, tx.clone()));
        }

        let mut pairings: JoinSet<(SocketId, Endpoint, Result<PumpOutcome, ConnectError>)> =
            JoinSet::new();
        let mut table = ChannelTable::new();

        loop {
            tokio::select! {
                Some(event) = rx.recv() => match event {
                    Event::Accepted(accepted) => {
                        let Some(remote) = remotes.get(&accepted.port).cloned() else {
                            warn!(port = accepted.port, "Connection on an unmapped port, closing");
                            continue;
                        };
                        let client = table.track(SocketRole::Client, accepted.port, Some(accepted.peer));
                        debug!(
                            local_port = accepted.port,
                            peer = %accepted.peer,
                            "Accepted connection, dialing {}", remote
                        );

                        let dialer = self.dialer.clone();
                        let tx = tx.clone();
                        pairings.spawn(async move {
                            let result = match dialer.connect(&remote).await {
                                Ok(stream) => {
                                    let _ = tx.send(Event::Paired { client, port: accepted.port }).await;
                                    Ok(pump(accepted.stream, stream).await)
                                }
                                Err(e) => Err(e),
                            };
                            (client, remote, result)
                        });
                    }
                    Event::Paired { client, port } => {
                        // The pairing may already be over by the time this arrives
                        if table.get(client).is_some() {
                            let remote = table.track(SocketRole::Remote, port, None);
                            table.pair(client, remote);
                        }
                    }
                    Event::AcceptFailed { port, source } => {
                        error!(port, "Listener failed: {}", source);
                        return Err(RelayError::Accept { port, source });
                    }
                },
                Some(joined) = pairings.join_next() => match joined {
                    Ok((client, remote, Ok(outcome))) => {
                        table.close(client);
                        debug!(
                            remote = %remote,
                            bytes_up = outcome.bytes_up,
                            bytes_down = outcome.bytes_down,
                            active_pairings = table.pairings(),
                            "Connection closed"
                        );
                    }
                    Ok((client, remote, Err(e))) => {
                        table.close(client);
                        warn!("Failed to connect to {}, closing client: {}", remote, e);
                    }
                    Err(e) => warn!("Pairing task failed: {}", e),
                },
            }
        }
    }
}

/// Forward accepted sockets to the engine until the listener fails
pub(crate) async fn accept_loop<E>(port: u16, listener: TcpListener, tx: mpsc::Sender<E>)
where
    E: From<AcceptEvent> + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                if tx
                    .send(AcceptEvent::Accepted(Accepted { port, stream, peer }).into())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) if is_transient(&e) => {
                debug!(port, "Transient accept error: {}", e);
            }
            Err(source) => {
                let _ = tx.send(AcceptEvent::Failed { port, source }.into()).await;
                return;
            }
        }
    }
}

/// What an accept loop reports
pub(crate) enum AcceptEvent {
    Accepted(Accepted),
    Failed { port: u16, source: std::io::Error },
}

impl From<AcceptEvent> for Event {
    fn from(event: AcceptEvent) -> Self {
        match event {
            AcceptEvent::Accepted(accepted) => Event::Accepted(accepted),
            AcceptEvent::Failed { port, source } => Event::AcceptFailed { port, source },
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}
