use std::time::Duration;

use rand::{Rng, SeedableRng};

use crate::config::{TcpClientConfig, TcpServerConfig};
use crate::error::FabricError;
use crate::tcp::{ClientState, TcpFabricClient, TcpFabricServer};
use crate::tests::test_harness::{fire_slot, init_logging, loopback, oneshot_slot, wait_until};

#[tokio::test]
async fn test_tcp_echo() {
    init_logging();
    let server = TcpFabricServer::default();
    server.on_client_accepted(|client| {
        let echo = client.clone();
        client.on_received(move |bytes| {
            echo.send_detached(bytes.to_vec(), None);
            true
        });
    });
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::default();
    client.connect(addr).await.expect("Failed to connect");
    assert_eq!(client.state(), ClientState::Connected);

    client.send(b"hello").await.expect("Failed to send");
    let stream = client.stream();
    let mut buf = [0u8; 5];
    let got = stream
        .read_exact_or_eof(&mut buf)
        .await
        .expect("Failed to read the echo");
    assert_eq!(got, 5);
    assert_eq!(&buf, b"hello");

    assert_eq!(client.bytes_sent(), 5);
    assert_eq!(client.bytes_received(), 5);
    assert_eq!(stream.position(), 5);
    assert_eq!(stream.available(), 0);
    // the write-timeout getter reports the send timeout
    assert_eq!(stream.write_timeout(), client.config().send_timeout);
    assert_eq!(stream.read_timeout(), client.config().receive_timeout);

    let accepted = server.clients().pop().expect("server lost its client");
    wait_until(Duration::from_secs(2), "server-side counters", || {
        accepted.bytes_received() == 5 && accepted.bytes_sent() == 5
    })
    .await;

    client.close().await.expect("Failed to close client");
    server.close().await;
}

#[tokio::test]
async fn test_stream_fragmentation_round_trip() {
    let server = TcpFabricServer::default();
    let (slot, accepted_rx) = oneshot_slot();
    server.on_client_accepted(move |client| fire_slot(&slot, client.clone()));
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::default();
    client.connect(addr).await.expect("Failed to connect");
    let accepted = accepted_rx.await.expect("no client accepted");

    let buffered_events = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let buffered_counter = buffered_events.clone();
    accepted.on_buffered(move |count| {
        assert!(count > 0);
        buffered_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    let reader = tokio::spawn(async move {
        let stream = accepted.stream();
        let mut collected: Vec<u8> = Vec::with_capacity(1_000_000);
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let got = stream.read(&mut chunk).await.expect("server read failed");
            if got == 0 {
                break;
            }
            collected.extend(&chunk[..got]);
        }
        collected
    });

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut payload = vec![0u8; 1_000_000];
    rng.fill(payload.as_mut_slice());

    let stream = client.stream();
    for chunk in payload.chunks(7777) {
        stream.write(chunk).await.expect("stream write failed");
    }
    stream.close().await.expect("stream close failed");

    let collected = reader.await.expect("reader task failed");
    assert_eq!(collected.len(), payload.len());
    assert_eq!(collected, payload);
    assert!(buffered_events.load(std::sync::atomic::Ordering::SeqCst) > 0);
    server.close().await;
}

#[tokio::test]
async fn test_spawn_connect_reports_through_events() {
    let server = TcpFabricServer::default();
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::default();
    let (slot, connected) = oneshot_slot();
    client.on_connected(move || fire_slot(&slot, ()));
    client.spawn_connect(addr);
    connected.await.expect("connected event never fired");
    assert_eq!(client.state(), ClientState::Connected);

    client.close().await.expect("Failed to close");
    server.close().await;
}

#[tokio::test]
async fn test_direct_mode_stream_writes_synchronously() {
    let server = TcpFabricServer::default();
    let (slot, accepted_rx) = oneshot_slot();
    server.on_client_accepted(move |client| fire_slot(&slot, client.clone()));
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::default();
    client.connect(addr).await.expect("Failed to connect");
    let accepted = accepted_rx.await.expect("no client accepted");

    let stream = client.stream_with_mode(crate::tcp::WriteMode::Direct);
    stream.write(b"direct").await.expect("direct write failed");
    // nothing pending in direct mode
    stream.flush().await.expect("flush failed");
    assert_eq!(client.bytes_sent(), 6);

    let peer = accepted.stream();
    let mut buf = [0u8; 6];
    let got = peer.read_exact_or_eof(&mut buf).await.expect("read failed");
    assert_eq!(&buf[..got], b"direct");

    client.close().await.expect("Failed to close");
    server.close().await;
}

#[tokio::test]
async fn test_single_acceptor_signals_saturation() {
    let server = TcpFabricServer::new(TcpServerConfig {
        accept_threads: 1,
        ..TcpServerConfig::default()
    });
    let busy = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = busy.clone();
    server.on_accept_tasks_busy(move || {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");
    assert_eq!(server.state(), crate::tcp::ServerState::Listening);

    let client = TcpFabricClient::default();
    client.connect(addr).await.expect("Failed to connect");
    wait_until(Duration::from_secs(2), "the busy signal", || {
        busy.load(std::sync::atomic::Ordering::SeqCst) >= 1
    })
    .await;

    let _ = client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_listen_port_without_family() {
    let server = TcpFabricServer::default();
    let local = server
        .listen_port(0, Some(false))
        .expect("Failed to listen on an ephemeral port");
    assert_ne!(local.port(), 0);
    assert_eq!(server.local_addr(), Some(local));
    server.close().await;
}

/// A `received` handler that blocks forever must not be able to hang
/// `close` callers: the instance lock times out and surfaces a deadlock
/// error instead.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_times_out_when_handler_blocks() {
    let server = TcpFabricServer::default();
    let (slot, accepted_rx) = oneshot_slot();
    server.on_client_accepted(move |client| {
        client.on_received(|_| {
            std::thread::sleep(Duration::from_secs(3));
            true
        });
        fire_slot(&slot, client.clone());
    });
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::default();
    client.connect(addr).await.expect("Failed to connect");
    let accepted = accepted_rx.await.expect("no client accepted");

    client.send(b"block").await.expect("Failed to send");
    // give the blocking handler time to take the instance lock
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    let result = accepted.close().await;
    let elapsed = started.elapsed();
    assert!(
        matches!(result, Err(FabricError::Deadlock(_))),
        "expected a deadlock error, got {result:?}"
    );
    assert!(
        elapsed >= Duration::from_millis(900) && elapsed < Duration::from_millis(2500),
        "close took {elapsed:?}, expected roughly the deadlock timeout"
    );

    let _ = client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_failed_connect_leaves_client_closed() {
    // grab a port that nothing listens on
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind probe");
    let dead_addr = probe.local_addr().expect("probe has no address");
    drop(probe);

    let client = TcpFabricClient::default();
    let result = client.connect(dead_addr).await;
    assert!(matches!(
        result,
        Err(FabricError::Transport(_)) | Err(FabricError::Timeout(_))
    ));
    assert_eq!(client.state(), ClientState::Closed);

    // a second connect is a state error, not a hang
    let again = client.connect(dead_addr).await;
    assert!(matches!(again, Err(FabricError::StateMisuse(_))));
}

#[tokio::test]
async fn test_zero_length_detached_send_still_completes() {
    let server = TcpFabricServer::default();
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::default();
    client.connect(addr).await.expect("Failed to connect");

    let (slot, done) = oneshot_slot();
    client.send_detached(
        vec![],
        Some(Box::new(move |result| fire_slot(&slot, result.expect("send failed")))),
    );
    let sent = done.await.expect("completion callback never ran");
    assert_eq!(sent, 0);
    assert_eq!(client.bytes_sent(), 0);
    wait_until(Duration::from_secs(2), "pending sends to settle", || {
        client.pending_async_sends() == 0
    })
    .await;

    client.close().await.expect("Failed to close");
    server.close().await;
}

#[tokio::test]
async fn test_server_close_closes_accepted_clients() {
    let server = TcpFabricServer::new(TcpServerConfig::default());
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::default();
    client.connect(addr).await.expect("Failed to connect");
    wait_until(Duration::from_secs(2), "client set to fill", || {
        server.client_count() == 1
    })
    .await;

    server.close().await;
    assert_eq!(server.client_count(), 0);

    // the peer shutdown surfaces as EOF on our side
    let stream = client.stream();
    let mut buf = [0u8; 1];
    let got = stream.read(&mut buf).await.expect("read after close failed");
    assert_eq!(got, 0);
}

#[tokio::test]
async fn test_disconnect_fires_once_and_empties_client_set() {
    let server = TcpFabricServer::default();
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::default();
    let disconnects = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = disconnects.clone();
    client.on_disconnected(move || {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    client.connect(addr).await.expect("Failed to connect");
    wait_until(Duration::from_secs(2), "client set to fill", || {
        server.client_count() == 1
    })
    .await;

    client.close().await.expect("Failed to close");
    client.close().await.expect("close must be idempotent");
    assert_eq!(disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);

    // the server notices the disconnect and drops its side
    wait_until(Duration::from_secs(2), "client set to empty", || {
        server.client_count() == 0
    })
    .await;
    server.close().await;
}

#[tokio::test]
async fn test_detached_client_outlives_server() {
    let server = TcpFabricServer::default();
    let (slot, accepted_rx) = oneshot_slot();
    server.on_client_accepted(move |client| fire_slot(&slot, client.clone()));
    let addr = server.listen(loopback()).expect("Failed to start TCP listener");

    let client = TcpFabricClient::new(TcpClientConfig::default());
    client.connect(addr).await.expect("Failed to connect");
    let accepted = accepted_rx.await.expect("no client accepted");

    assert!(accepted.is_server_client());
    accepted.detach();
    assert!(!accepted.is_server_client());
    assert_eq!(server.client_count(), 0);

    server.close().await;
    // the detached connection keeps working
    assert_eq!(accepted.state(), ClientState::Connected);
    client.send(b"ping").await.expect("send after detach failed");
    let stream = accepted.stream();
    let mut buf = [0u8; 4];
    let got = stream
        .read_exact_or_eof(&mut buf)
        .await
        .expect("read after detach failed");
    assert_eq!(&buf[..got], b"ping");

    let _ = accepted.close().await;
    let _ = client.close().await;
}
