
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{dead_port, start_tcp, tcp_roundtrip, TcpEchoBackend, WAIT};
use bulxy_relay::{RelayError, Transport};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Read until the relay closes the connection.
async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let result = timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("connection should be closed promptly");
    match result {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected close, read {} bytes", n),
    }
}

#[tokio::test]
async fn bytes_arrive_in_order_both_ways() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = start_tcp(0, backend.addr.port()).await.unwrap();

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();

    // Larger than one copy buffer so ordering across chunks is exercised.
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let echoed = tcp_roundtrip(&mut client, &payload).await.unwrap();
    assert_eq!(echoed, payload);

    let echoed = tcp_roundtrip(&mut client, b"second message").await.unwrap();
    assert_eq!(echoed, b"second message");

    drop(client);
    let exit = relay.stop().await;
    assert!(exit.is_stopped());
}

#[tokio::test]
async fn byte_counters_track_both_directions() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = start_tcp(0, backend.addr.port()).await.unwrap();
    let stats = relay.stats_handle();

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    tcp_roundtrip(&mut client, b"0123456789").await.unwrap();
    drop(client);

    relay.stop().await;
    assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 10);
    assert_eq!(stats.bytes_from_backend.load(Ordering::Relaxed), 10);
    assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn unreachable_backend_drops_only_that_connection() {
    let relay = start_tcp(0, dead_port().await).await.unwrap();
    let stats = relay.stats_handle();

    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    expect_closed(&mut client).await;
    assert_eq!(stats.backend_failed.load(Ordering::Relaxed), 1);

    // The relay keeps accepting after a failed dial.
    let mut again = TcpStream::connect(relay.local_addr()).await.unwrap();
    expect_closed(&mut again).await;
    assert_eq!(stats.backend_failed.load(Ordering::Relaxed), 2);

    assert!(relay.stop().await.is_stopped());
}

#[tokio::test]
async fn stop_drains_in_flight_connections() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = start_tcp(0, backend.addr.port()).await.unwrap();
    let stats = relay.stats_handle();

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
        let echoed = tcp_roundtrip(&mut client, &[i; 16]).await.unwrap();
        assert_eq!(echoed, [i; 16]);
        clients.push(client);
    }
    assert_eq!(relay.active_connections(), 3);

    let addr = relay.local_addr();
    timeout(WAIT, relay.stop())
        .await
        .expect("stop should finish once connections are closed");

    // Every handler has finished before stop returned.
    assert_eq!(stats.connections_active.load(Ordering::Acquire), 0);
    assert_eq!(stats.connections_closed.load(Ordering::Relaxed), 3);

    for client in clients.iter_mut() {
        expect_closed(client).await;
    }

    // The listener is gone.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn backend_close_closes_client() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // Accept and immediately hang up.
        if let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let relay = start_tcp(0, backend_port).await.unwrap();
    let mut client = TcpStream::connect(relay.local_addr()).await.unwrap();
    expect_closed(&mut client).await;

    let stats = relay.stats_handle();
    let drained = harness::eventually(|| {
        let stats = stats.clone();
        async move { stats.connections_active.load(Ordering::Acquire) == 0 }
    })
    .await;
    assert!(drained);

    relay.stop().await;
}

#[tokio::test]
async fn second_relay_on_same_port_fails_and_first_keeps_working() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let first = start_tcp(0, backend.addr.port()).await.unwrap();
    let port = first.local_addr().port();

    let err = start_tcp(port, backend.addr.port()).await.err().unwrap();
    match err {
        RelayError::Listen {
            transport,
            port: p,
            ..
        } => {
            assert_eq!(transport, Transport::Tcp);
            assert_eq!(p, port);
        }
        other => panic!("expected listen error, got {other}"),
    }

    let mut client = TcpStream::connect(first.local_addr()).await.unwrap();
    let echoed = tcp_roundtrip(&mut client, b"still here").await.unwrap();
    assert_eq!(echoed, b"still here");
    assert_eq!(backend.connection_count(), 1);

    drop(client);
    first.stop().await;
}

#[tokio::test]
async fn stop_without_connections_is_prompt() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = start_tcp(0, backend.addr.port()).await.unwrap();

    let exit = timeout(Duration::from_millis(500), relay.stop())
        .await
        .expect("idle relay should stop immediately");
    assert!(exit.is_stopped());
}
