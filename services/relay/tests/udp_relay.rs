
use std::time::Duration;

use harness::{dead_port, eventually, start_udp, test_settings, udp_roundtrip, UdpEchoBackend, WAIT};
use bulxy_relay::{RelayError, RelaySettings, Transport};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

async fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

#[tokio::test]
async fn datagrams_from_one_client_share_one_session() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let relay = start_udp(0, backend.addr.port(), test_settings()).await.unwrap();
    let client = client_socket().await;
    let client_addr = client.local_addr().unwrap();

    let reply = udp_roundtrip(&client, relay.local_addr(), b"D1").await.unwrap();
    assert_eq!(reply, b"D1");
    tokio::time::sleep(Duration::from_millis(10)).await;
    let reply = udp_roundtrip(&client, relay.local_addr(), b"D2").await.unwrap();
    assert_eq!(reply, b"D2");

    let sessions = relay.sessions().snapshot().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].client, client_addr);

    // Both datagrams left through the same backend socket.
    let sources = backend.distinct_sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(Some(sources[0]), sessions[0].backend_local_addr);
    assert_eq!(backend.payloads_from(sources[0]), vec![b"D1".to_vec(), b"D2".to_vec()]);

    assert_eq!(relay.stats().sessions_created, 1);
    // Counters are bumped after each send completes, so allow them to settle.
    let counted = eventually(|| async {
        let stats = relay.stats();
        stats.datagrams_to_backend == 2 && stats.datagrams_to_client == 2
    })
    .await;
    assert!(counted);

    relay.stop().await;
}

#[tokio::test]
async fn concurrent_clients_are_never_cross_delivered() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let relay = start_udp(0, backend.addr.port(), test_settings()).await.unwrap();
    let relay_addr = relay.local_addr();

    let run_client = move |tag: &'static [u8]| async move {
        let socket = client_socket().await;
        for i in 0..20u8 {
            let mut payload = tag.to_vec();
            payload.push(i);
            let reply = udp_roundtrip(&socket, relay_addr, &payload).await.unwrap();
            assert_eq!(reply, payload, "reply delivered to the wrong client");
        }
        socket.local_addr().unwrap()
    };

    let (a, b) = tokio::join!(run_client(b"A"), run_client(b"B"));

    let sessions = relay.sessions().snapshot().await;
    assert_eq!(sessions.len(), 2);
    let session_a = sessions.iter().find(|s| s.client == a).unwrap();
    let session_b = sessions.iter().find(|s| s.client == b).unwrap();
    assert_ne!(session_a.backend_local_addr, session_b.backend_local_addr);

    // Each backend socket only ever carried its own client's traffic.
    let from_a = backend.payloads_from(session_a.backend_local_addr.unwrap());
    let from_b = backend.payloads_from(session_b.backend_local_addr.unwrap());
    assert_eq!(from_a.len(), 20);
    assert_eq!(from_b.len(), 20);
    assert!(from_a.iter().all(|p| p[0] == b'A'));
    assert!(from_b.iter().all(|p| p[0] == b'B'));

    relay.stop().await;
}

#[tokio::test]
async fn idle_session_is_reaped_and_its_socket_closed() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let settings = test_settings();
    let relay = start_udp(0, backend.addr.port(), settings).await.unwrap();
    let client = client_socket().await;

    udp_roundtrip(&client, relay.local_addr(), b"ping").await.unwrap();
    let sessions = relay.sessions().snapshot().await;
    assert_eq!(sessions.len(), 1);
    let backend_socket_addr = sessions[0].backend_local_addr.unwrap();

    // Not idle long enough yet.
    assert_eq!(relay.reap_now(Instant::now()).await, 0);
    assert_eq!(relay.sessions().len().await, 1);

    let later = Instant::now() + settings.udp_idle_timeout + Duration::from_secs(1);
    assert_eq!(relay.reap_now(later).await, 1);
    assert!(relay.sessions().is_empty().await);
    assert_eq!(relay.stats().sessions_expired, 1);

    // The session's backend socket has been released.
    UdpSocket::bind(backend_socket_addr)
        .await
        .expect("reaped session socket should be closed");

    // The next datagram from the same client starts a fresh session.
    let reply = udp_roundtrip(&client, relay.local_addr(), b"again").await.unwrap();
    assert_eq!(reply, b"again");
    assert_eq!(relay.stats().sessions_created, 2);

    relay.stop().await;
}

#[tokio::test]
async fn reaper_expires_sessions_on_its_own() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let settings = RelaySettings {
        udp_idle_timeout: Duration::from_millis(100),
        udp_reap_interval: Duration::from_millis(50),
        ..test_settings()
    };
    let relay = start_udp(0, backend.addr.port(), settings).await.unwrap();
    let client = client_socket().await;

    udp_roundtrip(&client, relay.local_addr(), b"x").await.unwrap();

    let table = relay.sessions().clone();
    let expired = eventually(|| {
        let table = table.clone();
        async move { table.is_empty().await }
    })
    .await;
    assert!(expired, "idle session should be reaped");
    assert_eq!(relay.stats().sessions_expired, 1);

    relay.stop().await;
}

#[tokio::test]
async fn stop_closes_every_session() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let relay = start_udp(0, backend.addr.port(), test_settings()).await.unwrap();

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let client = client_socket().await;
        udp_roundtrip(&client, relay.local_addr(), &[i]).await.unwrap();
        clients.push(client);
    }

    let table = relay.sessions().clone();
    let backend_sockets: Vec<_> = table
        .snapshot()
        .await
        .into_iter()
        .filter_map(|s| s.backend_local_addr)
        .collect();
    assert_eq!(backend_sockets.len(), 3);

    let relay_addr = relay.local_addr();
    let exit = timeout(WAIT, relay.stop()).await.expect("stop should not hang");
    assert!(exit.is_stopped());
    assert!(table.is_empty().await);

    // Reply loops have exited, so every backend socket and the listening
    // socket are free again.
    for addr in backend_sockets {
        UdpSocket::bind(addr).await.expect("session socket should be closed");
    }
    UdpSocket::bind(relay_addr)
        .await
        .expect("listening socket should be closed");
}

#[tokio::test]
async fn session_with_dead_backend_is_removed() {
    let relay = start_udp(0, dead_port().await, test_settings()).await.unwrap();
    let client = client_socket().await;

    // The first send succeeds; the backend's ICMP port-unreachable then fails
    // the session's read, and the session takes itself out of the table.
    client.send_to(b"hello?", relay.local_addr()).await.unwrap();
    let created = eventually(|| async { relay.stats().sessions_created == 1 }).await;
    assert!(created);

    let table = relay.sessions().clone();
    let removed = eventually(|| {
        let table = table.clone();
        async move { table.is_empty().await }
    })
    .await;
    assert!(removed, "session with failed backend should not linger");

    relay.stop().await;
}

#[tokio::test]
async fn second_relay_on_same_port_fails_and_first_keeps_working() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let first = start_udp(0, backend.addr.port(), test_settings()).await.unwrap();
    let port = first.local_addr().port();

    let err = start_udp(port, backend.addr.port(), test_settings())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        RelayError::Listen {
            transport: Transport::Udp,
            ..
        }
    ));

    let client = client_socket().await;
    let reply = udp_roundtrip(&client, first.local_addr(), b"ok").await.unwrap();
    assert_eq!(reply, b"ok");

    first.stop().await;
}
