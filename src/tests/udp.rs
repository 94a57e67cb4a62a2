use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{PacketServerConfig, UdpConfig};
use crate::error::FabricError;
use crate::tests::test_harness::{loopback, wait_until};
use crate::udp::{UdpFabricClient, UdpPacketServer};

#[tokio::test]
async fn test_packet_server_round_trip() {
    let server = UdpPacketServer::new(PacketServerConfig {
        timeout: Duration::from_secs(30),
    });
    server.on_packet_received(move |packet| {
        let mut reply = b"pong:".to_vec();
        reply.extend(&packet.data);
        packet.respond_detached(reply);
    });
    let connects: Arc<Mutex<Vec<std::net::SocketAddr>>> = Arc::new(Mutex::new(vec![]));
    let seen = connects.clone();
    server.on_connected(move |remote| seen.lock().expect("lock poisoned").push(remote));
    let server_addr = server.bind(loopback()).expect("Failed to bind packet server");

    let client = UdpFabricClient::new(UdpConfig::default());
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(vec![]));
    let sink = received.clone();
    client.on_received(move |_remote, bytes| {
        sink.lock().expect("lock poisoned").extend(bytes);
    });
    let client_addr = client.bind(loopback()).expect("Failed to bind client");

    let sent = client
        .send_to(server_addr, b"ping")
        .await
        .expect("Failed to send");
    assert_eq!(sent, 4);

    wait_until(Duration::from_secs(2), "the pong to arrive", || {
        received.lock().expect("lock poisoned").as_slice() == b"pong:ping"
    })
    .await;

    assert_eq!(server.session_count(), 1);
    assert_eq!(server.sessions(), vec![client_addr]);
    assert_eq!(connects.lock().expect("lock poisoned").as_slice(), [client_addr]);
    assert_eq!(client.bytes_sent(), 4);
    assert_eq!(client.bytes_received(), 9);

    client.close();
    server.close();
}

/// One packet then silence: the sweeper must fire `timeout` for the remote
/// and drop the session.
#[tokio::test]
async fn test_idle_session_swept() {
    let server = UdpPacketServer::new(PacketServerConfig {
        timeout: Duration::from_secs(2),
    });
    let timeouts: Arc<Mutex<Vec<std::net::SocketAddr>>> = Arc::new(Mutex::new(vec![]));
    let sink = timeouts.clone();
    server.on_timeout(move |remote| sink.lock().expect("lock poisoned").push(remote));
    let server_addr = server.bind(loopback()).expect("Failed to bind packet server");

    let client = UdpFabricClient::default();
    let client_addr = client.bind(loopback()).expect("Failed to bind client");
    client
        .send_to(server_addr, b"one packet")
        .await
        .expect("Failed to send");

    wait_until(Duration::from_secs(2), "the session to appear", || {
        server.session_count() == 1
    })
    .await;
    // replies leave through the session's shared sending socket
    server
        .send_to(client_addr, b"hello there")
        .await
        .expect("send through the session socket failed");

    // then silence, until the sweeper reaps it
    wait_until(Duration::from_secs(4), "the session to be swept", || {
        server.session_count() == 0
    })
    .await;
    assert_eq!(timeouts.lock().expect("lock poisoned").as_slice(), [client_addr]);

    client.close();
    server.close();
}

#[tokio::test]
async fn test_double_bind_is_state_misuse() {
    let client = UdpFabricClient::default();
    client.bind(loopback()).expect("first bind failed");
    let second = client.bind(loopback());
    assert!(matches!(second, Err(FabricError::StateMisuse(_))));
    client.close();
}

#[tokio::test]
async fn test_bind_port_without_family_picks_a_stack() {
    let client = UdpFabricClient::default();
    let local = client
        .bind_port(0, None)
        .expect("family-less bind failed on both stacks");
    assert_ne!(local.port(), 0);
    client.close();
}

#[tokio::test]
async fn test_zero_length_send_is_noop() {
    let client = UdpFabricClient::default();
    client.bind(loopback()).expect("Failed to bind");
    let target = client.local_addr().expect("bound client has an address");
    let sent = client.send_to(target, b"").await.expect("empty send failed");
    assert_eq!(sent, 0);
    assert_eq!(client.bytes_sent(), 0);
    client.close();
}

#[tokio::test]
async fn test_detached_send_invokes_callback() {
    let listener = UdpFabricClient::default();
    let target = listener.bind(loopback()).expect("Failed to bind listener");

    let client = UdpFabricClient::default();
    client.bind(loopback()).expect("Failed to bind client");

    let (slot, done) = crate::tests::test_harness::oneshot_slot();
    client.send_to_detached(
        target,
        b"detached".to_vec(),
        Some(Box::new(move |result| {
            crate::tests::test_harness::fire_slot(&slot, result.expect("detached send failed"));
        })),
    );
    let sent = done.await.expect("completion callback never ran");
    assert_eq!(sent, 8);

    client.close();
    listener.close();
}

/// A panicking receive handler must not kill the receive loop; the panic
/// surfaces through the error event instead.
#[tokio::test]
async fn test_handler_panic_surfaces_via_error_event() {
    let server = UdpPacketServer::new(PacketServerConfig::default());
    server.on_packet_received(|_packet| panic!("boom"));
    let errors = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = errors.clone();
    server.on_error(move |remote, error| {
        assert!(remote.is_some());
        assert!(matches!(error, FabricError::UserCallback(_)));
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    let server_addr = server.bind(loopback()).expect("Failed to bind packet server");

    let client = UdpFabricClient::default();
    client.bind(loopback()).expect("Failed to bind client");
    client
        .send_to(server_addr, b"first")
        .await
        .expect("Failed to send");
    wait_until(Duration::from_secs(2), "the first panic to surface", || {
        errors.load(std::sync::atomic::Ordering::SeqCst) == 1
    })
    .await;

    // the loop survives and keeps dispatching
    client
        .send_to(server_addr, b"second")
        .await
        .expect("Failed to send again");
    wait_until(Duration::from_secs(2), "the second panic to surface", || {
        errors.load(std::sync::atomic::Ordering::SeqCst) == 2
    })
    .await;

    client.close();
    server.close();
}

#[tokio::test]
async fn test_close_fires_disconnected_once() {
    let client = UdpFabricClient::default();
    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = count.clone();
    client.on_disconnected(move |_local| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    client.bind(loopback()).expect("Failed to bind");
    client.close();
    client.close();
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
}
