//! Virtual ports end to end: client through the physical socket, PROXY
//! header decoded by the primary, connection handed to the owning worker.


use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use harness::{eventually, free_range, multiplexer, proxy_connect, Cluster, Transport};
use portshare_broker::{Listening, ProxyVersion, VirtualHandle};
use portshare_id::CorrelationId;
use portshare_ipc::{memory, PrimaryBody, WorkerMessage};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn client_addr() -> SocketAddr {
    "203.0.113.7:51000".parse().unwrap()
}

fn expect_virtual(listening: Listening) -> VirtualHandle {
    match listening {
        Listening::Virtual(handle) => handle,
        other => panic!("expected a virtual port, got {other:?}"),
    }
}

#[rstest]
#[case::v1_memory(ProxyVersion::V1, Transport::Memory)]
#[case::v2_memory(ProxyVersion::V2, Transport::Memory)]
#[case::v1_unix(ProxyVersion::V1, Transport::Unix)]
#[case::v2_unix(ProxyVersion::V2, Transport::Unix)]
#[tokio::test]
async fn test_connection_reaches_worker_with_payload(
    #[case] version: ProxyVersion,
    #[case] transport: Transport,
) {
    let mux = multiplexer(version, None).await;
    let cluster = Cluster::start(mux.clone(), 1, transport).await;

    let mut handle = expect_virtual(cluster.worker(0).listen(7001, "127.0.0.1").await.unwrap());
    assert_eq!(handle.port(), 7001);
    assert_eq!(handle.local_addr().ip(), mux.local_addr().ip());
    assert!(mux.is_registered(7001));

    let mut client = proxy_connect(mux.local_addr(), version, client_addr(), 7001)
        .await
        .unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut connection = handle.accept().await.expect("connection routed");
    assert_eq!(connection.peer, client_addr());
    assert_eq!(connection.destination.port(), 7001);

    let mut buf = [0u8; 4];
    connection.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    connection.stream.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    assert_eq!(mux.stats().connections_dispatched.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_unrouted_connection_is_closed_and_counted() {
    let mux = multiplexer(ProxyVersion::V1, None).await;
    let cluster = Cluster::start(mux.clone(), 1, Transport::Memory).await;
    let _handle = cluster.worker(0).listen(7001, "127.0.0.1").await.unwrap();

    let mut client = proxy_connect(mux.local_addr(), ProxyVersion::V1, client_addr(), 7002)
        .await
        .unwrap();

    let mut buf = [0u8; 1];
    let read = client.read(&mut buf).await;
    assert!(matches!(read, Ok(0) | Err(_)), "connection left open: {read:?}");

    eventually(|| mux.stats().connections_unrouted.load(Ordering::Relaxed) == 1).await;
    assert_eq!(mux.stats().connections_dispatched.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn test_ephemeral_virtual_ports_are_distinct() {
    let range = free_range(8);
    let mux = multiplexer(ProxyVersion::V1, Some(range)).await;
    let cluster = Cluster::start(mux.clone(), 2, Transport::Memory).await;

    let first = cluster.worker(0).listen(0, "127.0.0.1").await.unwrap();
    let second = cluster.worker(1).listen(0, "127.0.0.1").await.unwrap();

    assert_ne!(first.port(), second.port());
    assert!(range.contains(first.port()));
    assert!(range.contains(second.port()));
    assert!(mux.is_registered(first.port()));
    assert!(mux.is_registered(second.port()));
}

#[tokio::test]
async fn test_virtual_port_conflict_across_workers() {
    let mux = multiplexer(ProxyVersion::V1, None).await;
    let cluster = Cluster::start(mux.clone(), 2, Transport::Memory).await;

    let _held = cluster.worker(0).listen(7004, "127.0.0.1").await.unwrap();
    let err = cluster
        .worker(1)
        .listen(7004, "127.0.0.1")
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "bind_error");
}

#[tokio::test]
async fn test_worker_close_unregisters_port() {
    let mux = multiplexer(ProxyVersion::V1, None).await;
    let cluster = Cluster::start(mux.clone(), 2, Transport::Memory).await;

    let handle = expect_virtual(cluster.worker(0).listen(7005, "127.0.0.1").await.unwrap());
    assert!(handle.close());
    assert!(!handle.close());
    eventually(|| !mux.is_registered(7005)).await;

    let mut client = proxy_connect(mux.local_addr(), ProxyVersion::V1, client_addr(), 7005)
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    assert!(matches!(client.read(&mut buf).await, Ok(0) | Err(_)));
    eventually(|| mux.stats().connections_unrouted.load(Ordering::Relaxed) == 1).await;

    // The port is free for anyone now.
    let again = cluster.worker(1).listen(7005, "127.0.0.1").await.unwrap();
    assert_eq!(again.port(), 7005);
}

#[tokio::test]
async fn test_dropping_handle_unregisters_port() {
    let mux = multiplexer(ProxyVersion::V2, None).await;
    let cluster = Cluster::start(mux.clone(), 1, Transport::Memory).await;

    let listening = cluster.worker(0).listen(7006, "127.0.0.1").await.unwrap();
    assert!(mux.is_registered(7006));
    drop(listening);
    eventually(|| !mux.is_registered(7006)).await;
}

#[tokio::test]
async fn test_worker_disconnect_closes_its_ports() {
    let mux = multiplexer(ProxyVersion::V1, None).await;
    let mut cluster = Cluster::start(mux.clone(), 0, Transport::Memory).await;

    let (primary_end, worker_end) = memory::pair();
    cluster.attach(primary_end).await;
    let (link, mut replies) = worker_end.split();

    for port in [7007, 7008] {
        let id = CorrelationId::generate();
        link.send(WorkerMessage::listen(id, port, "127.0.0.1"), None)
            .await
            .unwrap();
        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.message.id, id);
        let PrimaryBody::Bind(bind) = reply.message.body else {
            panic!("expected bind");
        };
        assert_eq!(bind.shared, Some(mux.local_addr()));
        assert!(reply.handle.is_none());
    }
    assert!(mux.is_registered(7007));
    assert!(mux.is_registered(7008));

    drop(link);
    drop(replies);
    eventually(|| !mux.is_registered(7007) && !mux.is_registered(7008)).await;
}
