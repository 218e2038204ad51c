//! Restart-on-failure wrapper for relay engines

use crate::RelayError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

/// Resolves on Ctrl-C, or SIGTERM on Unix
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Run `engine` and restart it after `backoff` whenever it fails
///
/// A termination signal is never swallowed: it ends supervision with
/// [`RelayError::Cancelled`].
pub async fn run_supervised<F, Fut>(name: &str, backoff: Duration, engine: F) -> Result<(), RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RelayError>>,
{
    run_supervised_until(name, backoff, engine, shutdown_signal()).await
}

/// [`run_supervised`] with an explicit cancellation future
pub async fn run_supervised_until<F, Fut, S>(
    name: &str,
    backoff: Duration,
    mut engine: F,
    shutdown: S,
) -> Result<(), RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), RelayError>>,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut restarts = 0u32;

    loop {
        tokio::select! {
            result = engine() => match result {
                Ok(()) => return Ok(()),
                Err(RelayError::Cancelled) => return Err(RelayError::Cancelled),
                Err(e) => {
                    restarts += 1;
                    error!(
                        "{} failed: {}. Restarting in {}s (restart #{})",
                        name,
                        e,
                        backoff.as_secs(),
                        restarts
                    );
                }
            },
            _ = &mut shutdown => {
                info!("{} interrupted, shutting down", name);
                return Err(RelayError::Cancelled);
            }
        }

        tokio::select! {
            _ = sleep(backoff) => {}
            _ = &mut shutdown => {
                info!("{} interrupted while waiting to restart", name);
                return Err(RelayError::Cancelled);
            }
        }
    }
}
