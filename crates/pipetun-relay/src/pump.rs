//! Byte pump between two paired sockets

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

/// Maximum number of bytes moved per read
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Which side ended a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Remote,
}

/// Summary of a finished pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpOutcome {
    /// Bytes copied client → remote
    pub bytes_up: u64,
    /// Bytes copied remote → client
    pub bytes_down: u64,
    pub closed_by: ClosedBy,
    /// Error that ended the pairing, if it was not a clean EOF
    pub error: Option<String>,
}

/// Copy one direction until EOF or error
///
/// Returns the number of bytes copied and the error, if any.
async fn copy_half(mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf) -> (u64, Option<std::io::Error>) {
    let mut total = 0u64;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => return (total, None),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).await {
                    return (total, Some(e));
                }
                total += n as u64;
            }
            Err(e) => return (total, Some(e)),
        }
    }
}

/// Relay bytes between `client` and `remote` until either side is done
///
/// EOF or an error on either side ends the whole pairing: both sockets are
/// dropped, and therefore closed, when this returns.
pub async fn pump(client: TcpStream, remote: TcpStream) -> PumpOutcome {
    let (client_read, client_write) = client.into_split();
    let (remote_read, remote_write) = remote.into_split();

    let up = copy_half(client_read, remote_write);
    let down = copy_half(remote_read, client_write);
    tokio::pin!(up);
    tokio::pin!(down);

    // The losing direction is dropped mid-flight; only the winner's count is exact
    let outcome = tokio::select! {
        (bytes, error) = &mut up => PumpOutcome {
            bytes_up: bytes,
            bytes_down: 0,
            closed_by: ClosedBy::Client,
            error: error.map(|e| e.to_string()),
        },
        (bytes, error) = &mut down => PumpOutcome {
            bytes_up: 0,
            bytes_down: bytes,
            closed_by: ClosedBy::Remote,
            error: error.map(|e| e.to_string()),
        },
    };

    trace!(
        bytes_up = outcome.bytes_up,
        bytes_down = outcome.bytes_down,
        closed_by = ?outcome.closed_by,
        "Pairing finished"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_pump_round_trip_and_close_together() {
        // user <-> (client, remote) <-> server
        let (mut user, client) = socket_pair().await;
        let (remote, mut server) = socket_pair().await;

        let pump_task = tokio::spawn(pump(client, remote));

        let payload: Vec<u8> = (0..=255u8).cycle().take(3 * CHUNK_SIZE + 17).collect();
        user.write_all(&payload).await.unwrap();
        let mut received = vec![0u8; payload.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);

        server.write_all(b"\x00\xffreply").await.unwrap();
        let mut reply = [0u8; 7];
        user.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"\x00\xffreply");

        // Remote EOF tears down the client side too
        drop(server);
        let outcome = pump_task.await.unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Remote);
        assert_eq!(outcome.bytes_down, 7);

        let mut buf = [0u8; 1];
        assert_eq!(user.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_client_eof_closes_remote() {
        let (user, client) = socket_pair().await;
        let (remote, mut server) = socket_pair().await;

        let pump_task = tokio::spawn(pump(client, remote));
        drop(user);

        let outcome = pump_task.await.unwrap();
        assert_eq!(outcome.closed_by, ClosedBy::Client);
        assert!(outcome.error.is_none());

        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }
}
