//! Integration tests: two RuvNode instances talking QUIC over loopback.

use std::time::Duration;

use ruvmail_transport::{
    Identity, PeerId, RuvNode, RuvNodeConfig, RuvTransportError, SecureConnection,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

fn loopback_config() -> RuvNodeConfig {
    RuvNodeConfig::new().bind_addr("127.0.0.1:0".parse().unwrap())
}

fn bind() -> RuvNode {
    RuvNode::bind(Identity::generate(), loopback_config()).unwrap()
}

/// Two nodes on loopback, each knowing the other's socket address.
fn pair() -> (RuvNode, RuvNode) {
    let a = bind();
    let b = bind();
    a.add_peer_addr(b.id(), b.local_socket_addr().unwrap());
    b.add_peer_addr(a.id(), a.local_socket_addr().unwrap());
    (a, b)
}

/// Dial B from A, send a request, get an answer back on the same stream.
#[tokio::test]
async fn stream_round_trip() {
    init_tracing();
    let (node_a, node_b) = pair();
    let id_a = node_a.id();
    let id_b = node_b.id();
    let listener = node_b.listener();

    let server = tokio::spawn(async move {
        let mut stream = listener.accept().await.unwrap();
        assert_eq!(stream.remote_addr(), id_a);
        assert_eq!(stream.local_addr(), id_b);
        assert!(stream.verify_claimed_identity(&id_a.to_string()).is_ok());

        let mut request = Vec::new();
        stream.read_to_end(&mut request).await.unwrap();
        stream.write_all(b"250 ").await.unwrap();
        stream.write_all(&request).await.unwrap();
        stream.shutdown().await.unwrap();
        node_b
    });

    let mut stream = node_a.dial(&id_b.to_string()).await.unwrap();
    assert_eq!(stream.remote_addr(), id_b);
    stream.write_all(b"EHLO a").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), stream.read_to_end(&mut reply))
        .await
        .expect("reply timed out")
        .unwrap();
    assert_eq!(reply, b"250 EHLO a");

    let node_b = server.await.unwrap();
    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

/// Several dials to the same peer share one QUIC connection.
#[tokio::test]
async fn repeated_dials_share_connection() {
    init_tracing();
    let (node_a, node_b) = pair();
    let id_b = node_b.id();

    let first = node_a.dial_peer(id_b).await.unwrap();
    let second = node_a.dial_peer(id_b).await.unwrap();
    assert_eq!(
        first.connection().stable_id(),
        second.connection().stable_id()
    );
    assert_eq!(node_a.connected_peers(), vec![id_b]);

    drop((first, second));
    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

/// Once B has accepted A's connection it can open streams back to A over
/// it without knowing A's address.
#[tokio::test]
async fn reverse_dial_reuses_inbound_connection() {
    init_tracing();
    let node_a = bind();
    let node_b = bind();
    node_a.add_peer_addr(node_b.id(), node_b.local_socket_addr().unwrap());
    let id_a = node_a.id();

    let mut outbound = node_a.dial_peer(node_b.id()).await.unwrap();
    outbound.write_all(b"hi").await.unwrap();
    let mut inbound = tokio::time::timeout(Duration::from_secs(30), node_b.listener().accept())
        .await
        .expect("accept timed out")
        .unwrap();
    let mut buf = [0u8; 2];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    let mut back = node_b.dial_peer(id_a).await.unwrap();
    assert_eq!(
        back.connection().stable_id(),
        inbound.connection().stable_id()
    );
    back.write_all(b"yo").await.unwrap();
    let mut reverse = tokio::time::timeout(Duration::from_secs(30), node_a.listener().accept())
        .await
        .expect("reverse accept timed out")
        .unwrap();
    reverse.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"yo");

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

/// Two nodes dialing each other at the same moment both get working streams,
/// and each stream reaches the other side's listener.
#[tokio::test]
async fn simultaneous_dials_both_succeed() {
    init_tracing();
    for _ in 0..10 {
        let (node_a, node_b) = pair();
        let (id_a, id_b) = (node_a.id(), node_b.id());

        let (to_b, to_a) = tokio::join!(node_a.dial_peer(id_b), node_b.dial_peer(id_a));
        let mut to_b = to_b.unwrap();
        let mut to_a = to_a.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!to_b.connection().is_closed());
        assert!(!to_a.connection().is_closed());
        assert_eq!(node_a.connected_peers(), vec![id_b]);
        assert_eq!(node_b.connected_peers(), vec![id_a]);

        to_b.write_all(b"from a").await.unwrap();
        to_b.shutdown().await.unwrap();
        to_a.write_all(b"from b").await.unwrap();
        to_a.shutdown().await.unwrap();

        for (node, expected) in [(&node_b, b"from a"), (&node_a, b"from b")] {
            let mut stream = tokio::time::timeout(Duration::from_secs(30), node.listener().accept())
                .await
                .expect("accept timed out")
                .unwrap();
            let mut got = Vec::new();
            stream.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, expected);
        }

        // Later dials keep working on whichever connection each side kept.
        let again = node_a.dial_peer(id_b).await.unwrap();
        assert!(!again.connection().is_closed());

        drop((to_a, to_b, again));
        node_a.shutdown().await.unwrap();
        node_b.shutdown().await.unwrap();
    }
}

/// A peer answering at the expected address with a different key is refused.
#[tokio::test]
async fn identity_mismatch_is_refused() {
    init_tracing();
    let node_a = bind();
    let node_b = bind();
    let impostor_target = Identity::generate().peer_id();
    node_a.add_peer_addr(impostor_target, node_b.local_socket_addr().unwrap());

    let err = node_a.dial_peer(impostor_target).await.unwrap_err();
    match err {
        RuvTransportError::AuthenticationFailed { expected, presented } => {
            assert_eq!(expected, impostor_target.to_string());
            assert_eq!(presented, node_b.id().to_string());
        }
        other => panic!("expected AuthenticationFailed, got {other:?}"),
    }
    assert!(node_a.connected_peers().is_empty());

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_peer_has_no_route() {
    init_tracing();
    let node = bind();
    let nowhere = PeerId::from_bytes([9u8; 32]);
    assert!(matches!(
        node.dial_peer(nowhere).await,
        Err(RuvTransportError::ClosedNetwork { .. })
    ));
    node.shutdown().await.unwrap();
}

/// An address where nobody answers fails within the dial deadline.
#[tokio::test]
async fn unreachable_peer_times_out() {
    init_tracing();
    let config = loopback_config().dial_timeout(Duration::from_secs(1));
    let node = RuvNode::bind(Identity::generate(), config).unwrap();
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = Identity::generate().peer_id();
    node.add_peer_addr(target, silent.local_addr().unwrap());

    let started = tokio::time::Instant::now();
    let err = node.dial_peer(target).await.unwrap_err();
    assert!(matches!(err, RuvTransportError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn closing_listener_releases_accept() {
    init_tracing();
    let node = bind();
    let listener = node.listener();
    assert_eq!(listener.local_addr(), node.id());

    let waiting = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.close().unwrap();

    let res = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("accept still blocked")
        .unwrap();
    assert!(matches!(res, Err(RuvTransportError::Shutdown)));
    assert!(matches!(
        node.dial_peer(PeerId::from_bytes([1u8; 32])).await,
        Err(RuvTransportError::Shutdown)
    ));
}
