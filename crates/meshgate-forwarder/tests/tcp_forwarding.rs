use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use meshgate_forwarder::{
    DialError, DialFailureKind, Direction, Forwarder, ForwarderConfig, Lifecycle, TcpOutcome,
    Termination,
};
use meshgate_netstack::{
    pipe::PipeStack, ConnectionId, ConnectionRequest, EndpointError, Resolution,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
};

const STEP: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn conn_id(dst: SocketAddr) -> ConnectionId {
    ConnectionId::new(
        IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2)),
        9000,
        dst.ip(),
        dst.port(),
    )
}

/// Stack whose handler hands requests to the test instead of a forwarder.
fn parked_stack() -> (PipeStack, mpsc::UnboundedReceiver<ConnectionRequest>) {
    let stack = PipeStack::new();
    let (tx, rx) = mpsc::unbounded_channel();
    stack
        .register_tcp_handler(move |req: ConnectionRequest| {
            let _ = tx.send(req);
        })
        .unwrap();
    (stack, rx)
}

async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn read_to_eof(stream: &mut (impl AsyncReadExt + Unpin)) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(STEP, stream.read_to_end(&mut out))
        .await
        .expect("stream did not reach EOF in time")
        .expect("read_to_end failed");
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accepted_connection_relays_both_ways_until_real_side_closes() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();

    let lifecycle = Lifecycle::new();
    let forwarder = Forwarder::new(ForwarderConfig::default(), lifecycle.clone());
    let (stack, mut requests) = parked_stack();

    let mut conn = stack.connect(conn_id(target)).unwrap();
    let request = requests.recv().await.unwrap();
    let outcome = forwarder.forward_tcp(request).await;
    let TcpOutcome::Relaying(handle) = outcome else {
        panic!("expected relay, got {outcome:?}");
    };

    assert_eq!(conn.resolution().await, Some(Resolution::Accept));
    assert_eq!(conn.resolve_count(), 1);

    let (mut server, _) = tokio::time::timeout(STEP, listener.accept())
        .await
        .unwrap()
        .unwrap();

    conn.stream().write_all(b"client hello").await.unwrap();
    let mut buf = [0u8; 12];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"client hello");

    server.write_all(b"server reply").await.unwrap();
    conn.stream().read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"server reply");

    drop(server);

    let report = tokio::time::timeout(STEP, handle.join())
        .await
        .expect("session did not tear down in time")
        .expect("supervisor panicked");
    assert_eq!(
        report.termination,
        Termination::Finished(Direction::RealToVirtual)
    );
    assert_eq!(report.virtual_to_real, 12);
    assert_eq!(report.real_to_virtual, 12);

    assert!(read_to_eof(conn.stream()).await.is_empty());
    assert_eq!(conn.endpoint_shutdowns(), 1);
    assert_eq!(conn.endpoint_releases(), 1);
    assert_eq!(conn.resolve_count(), 1);

    let stats = forwarder.stats().snapshot();
    assert_eq!(stats.tcp_requests_total, 1);
    assert_eq!(stats.tcp_sessions_total, 1);
    assert_eq!(stats.tcp_sessions_active, 0);
    assert_eq!(stats.bytes_virtual_to_real_total, 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_dial_rejects_exactly_once_and_relays_nothing() {
    init_tracing();
    let target = closed_port().await;

    let forwarder = Forwarder::new(ForwarderConfig::default(), Lifecycle::new());
    let (stack, mut requests) = parked_stack();

    let mut conn = stack.connect(conn_id(target)).unwrap();
    let outcome = forwarder.forward_tcp(requests.recv().await.unwrap()).await;
    let TcpOutcome::Rejected(err) = outcome else {
        panic!("expected rejection, got {outcome:?}");
    };
    assert_eq!(err.kind(), DialFailureKind::Refused);
    assert_eq!(err.target(), target);

    assert_eq!(conn.resolution().await, Some(Resolution::Reject));
    assert_eq!(conn.resolve_count(), 1);
    assert_eq!(conn.endpoint_releases(), 0, "no endpoint should be created");
    assert!(read_to_eof(conn.stream()).await.is_empty());

    let stats = forwarder.stats().snapshot();
    assert_eq!(stats.tcp_dial_fail_total, 1);
    assert_eq!(stats.tcp_sessions_total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endpoint_failure_closes_dialed_connection_and_rejects() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();

    let forwarder = Forwarder::new(ForwarderConfig::default(), Lifecycle::new());
    let (stack, mut requests) = parked_stack();
    stack.fail_next_endpoints(1);

    let mut conn = stack.connect(conn_id(target)).unwrap();
    let outcome = forwarder.forward_tcp(requests.recv().await.unwrap()).await;
    assert!(
        matches!(outcome, TcpOutcome::ProvisionFailed(EndpointError::Exhausted)),
        "unexpected outcome {outcome:?}"
    );
    assert_eq!(conn.resolution().await, Some(Resolution::Reject));
    assert_eq!(conn.resolve_count(), 1);

    // The dial completed before the endpoint failed; the host side must see it closed.
    let (mut server, _) = tokio::time::timeout(STEP, listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert!(read_to_eof(&mut server).await.is_empty());

    assert_eq!(forwarder.stats().snapshot().tcp_endpoint_fail_total, 1);
}

#[tokio::test]
async fn requests_after_shutdown_are_rejected_without_dialing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();

    let lifecycle = Lifecycle::new();
    lifecycle.shutdown();
    let forwarder = Forwarder::new(ForwarderConfig::default(), lifecycle);
    let (stack, mut requests) = parked_stack();

    let mut conn = stack.connect(conn_id(target)).unwrap();
    let outcome = forwarder.forward_tcp(requests.recv().await.unwrap()).await;
    assert!(
        matches!(outcome, TcpOutcome::Rejected(DialError::Cancelled { .. })),
        "unexpected outcome {outcome:?}"
    );
    assert_eq!(conn.resolution().await, Some(Resolution::Reject));

    let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
    assert!(accepted.is_err(), "no connection should reach the destination");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_mid_dial_resolves_promptly() {
    // Non-routable; the dial either hangs until cancelled or fails fast, depending on the host.
    let target = SocketAddr::from(([10, 255, 255, 1], 9));
    let lifecycle = Lifecycle::new();
    let forwarder = Forwarder::new(ForwarderConfig::default(), lifecycle.clone());
    let (stack, mut requests) = parked_stack();

    let mut conn = stack.connect(conn_id(target)).unwrap();
    let request = requests.recv().await.unwrap();
    let task = tokio::spawn({
        let forwarder = forwarder.clone();
        async move { forwarder.forward_tcp(request).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    lifecycle.shutdown();

    let outcome = tokio::time::timeout(STEP, task)
        .await
        .expect("dial was not aborted by shutdown")
        .unwrap();
    assert!(matches!(outcome, TcpOutcome::Rejected(_)), "{outcome:?}");
    assert_eq!(conn.resolution().await, Some(Resolution::Reject));
    assert_eq!(conn.resolve_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registered_forwarder_serves_many_concurrent_connections() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();

    // Echo server.
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = sock.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });

    let lifecycle = Lifecycle::new();
    let forwarder = Forwarder::new(ForwarderConfig::default(), lifecycle.clone());
    let stack = PipeStack::new();
    stack.register_tcp_handler(forwarder.clone()).unwrap();

    let mut clients = Vec::new();
    for i in 0..16u16 {
        let mut id = conn_id(target);
        id.src_port = 10_000 + i;
        let mut conn = stack.connect(id).unwrap();
        clients.push(tokio::spawn(async move {
            assert_eq!(conn.resolution().await, Some(Resolution::Accept));
            let msg = format!("payload-{i}");
            conn.stream().write_all(msg.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            conn.stream().read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, msg.as_bytes());
            conn
        }));
    }

    let mut conns = Vec::new();
    for client in clients {
        conns.push(tokio::time::timeout(STEP, client).await.unwrap().unwrap());
    }

    lifecycle.shutdown();
    for conn in &mut conns {
        assert!(read_to_eof(conn.stream()).await.is_empty());
        assert_eq!(conn.resolve_count(), 1);
    }

    let deadline = tokio::time::Instant::now() + STEP;
    while forwarder.stats().snapshot().tcp_sessions_active != 0 {
        assert!(tokio::time::Instant::now() < deadline, "sessions still active");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for conn in &conns {
        assert_eq!(conn.endpoint_shutdowns(), 1);
        assert_eq!(conn.endpoint_releases(), 1);
    }
    assert_eq!(forwarder.stats().snapshot().tcp_sessions_total, 16);
}
