//! End-to-end relay tests over loopback sockets

use pipetun_connection::Dialer;
use pipetun_proto::Endpoint;
use pipetun_relay::{
    DirectRelay, PortMapping, ReceiveConfig, ReceivingRelay, TransmitConfig, TransmittingRelay,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

fn dialer() -> Dialer {
    Dialer::direct(Duration::from_millis(500), 0)
}

async fn spawn_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn bound(count: usize) -> Vec<(u16, TcpListener)> {
    let mut listeners = Vec::new();
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listeners.push((listener.local_addr().unwrap().port(), listener));
    }
    listeners
}

async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

/// EOF or reset both count as the relay closing the socket
async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("socket should be closed by the relay");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn test_direct_relay_round_trip() {
    let echo = spawn_echo().await;
    let listeners = bound(1).await;
    let local = listeners[0].0;

    let relay = DirectRelay::new(
        "127.0.0.1",
        vec![PortMapping::new(local, Endpoint::new("127.0.0.1", echo))],
        dialer(),
    )
    .unwrap();
    tokio::spawn(async move { relay.serve(listeners).await });

    let mut first = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
    let mut second = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
    assert_eq!(round_trip(&mut first, b"hello").await, b"hello");
    assert_eq!(round_trip(&mut second, b"world").await, b"world");
}

#[tokio::test]
async fn test_direct_relay_closes_client_when_remote_is_down() {
    let dead = free_port().await;
    let echo = spawn_echo().await;
    let listeners = bound(2).await;
    let (broken, healthy) = (listeners[0].0, listeners[1].0);

    let relay = DirectRelay::new(
        "127.0.0.1",
        vec![
            PortMapping::new(broken, Endpoint::new("127.0.0.1", dead)),
            PortMapping::new(healthy, Endpoint::new("127.0.0.1", echo)),
        ],
        dialer(),
    )
    .unwrap();
    tokio::spawn(async move { relay.serve(listeners).await });

    let mut client = TcpStream::connect(("127.0.0.1", broken)).await.unwrap();
    assert_closed(&mut client).await;

    // Both listeners keep serving after the failed dial
    let mut retry = TcpStream::connect(("127.0.0.1", broken)).await.unwrap();
    assert_closed(&mut retry).await;
    let mut other = TcpStream::connect(("127.0.0.1", healthy)).await.unwrap();
    assert_eq!(round_trip(&mut other, b"still up").await, b"still up");
}

#[tokio::test]
async fn test_direct_relay_closes_both_sides_on_client_eof() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    let listeners = bound(1).await;
    let local = listeners[0].0;

    let relay = DirectRelay::new(
        "127.0.0.1",
        vec![PortMapping::new(local, Endpoint::new("127.0.0.1", target_port))],
        dialer(),
    )
    .unwrap();
    tokio::spawn(async move { relay.serve(listeners).await });

    let client = TcpStream::connect(("127.0.0.1", local)).await.unwrap();
    let (mut remote_side, _) = timeout(Duration::from_secs(2), target.accept())
        .await
        .unwrap()
        .unwrap();
    drop(client);

    assert_closed(&mut remote_side).await;
}

#[tokio::test]
async fn test_transmitting_relay_keeps_pool_full() {
    let echo = spawn_echo().await;
    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_port = tunnel.local_addr().unwrap().port();

    let relay = TransmittingRelay::new(
        TransmitConfig {
            tunnel_host: "127.0.0.1".to_string(),
            output_host: "127.0.0.1".to_string(),
            mappings: vec![(tunnel_port, echo)],
            pool_size: 2,
            refresh_interval: Duration::from_secs(60),
            reconnect_backoff: Duration::from_millis(50),
        },
        dialer(),
        dialer(),
    )
    .unwrap();
    tokio::spawn(async move { relay.run().await });

    let tunnel = &tunnel;
    let accept = || async move {
        timeout(Duration::from_secs(2), tunnel.accept())
            .await
            .expect("pool connection expected")
            .unwrap()
            .0
    };
    let mut first = accept().await;
    let _second = accept().await;

    // Traffic on a pooled connection is forwarded to the output host
    assert_eq!(round_trip(&mut first, b"ping").await, b"ping");

    // Ending a transmission makes the slot reconnect
    drop(first);
    let mut replacement = accept().await;
    assert_eq!(round_trip(&mut replacement, b"again").await, b"again");
}

#[tokio::test]
async fn test_transmitting_relay_refreshes_idle_connections() {
    let echo = spawn_echo().await;
    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_port = tunnel.local_addr().unwrap().port();

    let relay = TransmittingRelay::new(
        TransmitConfig {
            tunnel_host: "127.0.0.1".to_string(),
            output_host: "127.0.0.1".to_string(),
            mappings: vec![(tunnel_port, echo)],
            pool_size: 1,
            refresh_interval: Duration::from_millis(200),
            reconnect_backoff: Duration::from_millis(50),
        },
        dialer(),
        dialer(),
    )
    .unwrap();
    tokio::spawn(async move { relay.run().await });

    let (mut idle, _) = timeout(Duration::from_secs(2), tunnel.accept())
        .await
        .expect("pool connection expected")
        .unwrap();
    assert_closed(&mut idle).await;

    let (mut replacement, _) = timeout(Duration::from_secs(2), tunnel.accept())
        .await
        .expect("replacement connection expected")
        .unwrap();
    assert_eq!(round_trip(&mut replacement, b"fresh").await, b"fresh");
}

#[tokio::test]
async fn test_receiving_relay_skips_closed_pool_connections() {
    let listeners = bound(2).await;
    let (tunnel_port, input_port) = (listeners[0].0, listeners[1].0);

    let relay = ReceivingRelay::new(ReceiveConfig {
        listen_host: "127.0.0.1".to_string(),
        mappings: vec![(input_port, tunnel_port)],
    })
    .unwrap();
    tokio::spawn(async move { relay.serve(listeners).await });

    // Parked first, then closed by the transmitter side
    let stale = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stale);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut live = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(("127.0.0.1", input_port)).await.unwrap();
    client.write_all(b"request").await.unwrap();

    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(2), live.read_exact(&mut buf))
        .await
        .expect("the live tunnel connection should get the client")
        .unwrap();
    assert_eq!(&buf, b"request");

    live.write_all(b"reply").await.unwrap();
    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(2), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"reply");
}

#[tokio::test]
async fn test_receiving_relay_closes_client_when_pool_went_stale() {
    let listeners = bound(2).await;
    let (tunnel_port, input_port) = (listeners[0].0, listeners[1].0);

    let relay = ReceivingRelay::new(ReceiveConfig {
        listen_host: "127.0.0.1".to_string(),
        mappings: vec![(input_port, tunnel_port)],
    })
    .unwrap();
    tokio::spawn(async move { relay.serve(listeners).await });

    let stale = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stale);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(("127.0.0.1", input_port)).await.unwrap();
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_receiving_relay_pairs_clients_with_pool() {
    let listeners = bound(2).await;
    let (tunnel_port, input_port) = (listeners[0].0, listeners[1].0);

    let relay = ReceivingRelay::new(ReceiveConfig {
        listen_host: "127.0.0.1".to_string(),
        mappings: vec![(input_port, tunnel_port)],
    })
    .unwrap();
    tokio::spawn(async move { relay.serve(listeners).await });

    let mut pooled = TcpStream::connect(("127.0.0.1", tunnel_port)).await.unwrap();
    // Give the engine a moment to park the pooled connection
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(("127.0.0.1", input_port)).await.unwrap();
    client.write_all(b"request").await.unwrap();

    let mut buf = [0u8; 7];
    timeout(Duration::from_secs(2), pooled.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"request");

    pooled.write_all(b"reply").await.unwrap();
    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(2), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"reply");
}

#[tokio::test]
async fn test_receiving_relay_closes_client_without_pool() {
    let listeners = bound(2).await;
    let (tunnel_port, input_port) = (listeners[0].0, listeners[1].0);

    let relay = ReceivingRelay::new(ReceiveConfig {
        listen_host: "127.0.0.1".to_string(),
        mappings: vec![(input_port, tunnel_port)],
    })
    .unwrap();
    tokio::spawn(async move { relay.serve(listeners).await });

    let mut client = TcpStream::connect(("127.0.0.1", input_port)).await.unwrap();
    assert_closed(&mut client).await;
}
