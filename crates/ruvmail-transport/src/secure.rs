//! Contract with the secure multiplexed transport underneath the node.
//!
//! In production: implemented by [`QuicEndpoint`](crate::QuicEndpoint).
//! In tests: implemented by `mock::MockTransport`, which records connects.

use crate::{BoxError, CloseReason, PeerId};

use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};

/// A secure connection to exactly one peer, carrying many streams.
///
/// Clones are handles to the same underlying connection.
#[async_trait::async_trait]
pub trait SecureConnection: Clone + Send + Sync + Unpin + 'static {
    type SendStream: AsyncWrite + Send + Unpin + 'static;
    type RecvStream: AsyncRead + Send + Unpin + 'static;

    /// Authenticated identity of the remote side.
    fn remote_peer(&self) -> PeerId;

    /// Identifier that distinguishes this connection from any other
    /// connection to the same peer.
    fn stable_id(&self) -> usize;

    /// Whether the connection has terminated, locally or remotely.
    fn is_closed(&self) -> bool;

    /// Wait for the remote side to open a bidirectional stream.
    async fn accept_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), BoxError>;

    /// Open a bidirectional stream towards the remote side.
    async fn open_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), BoxError>;

    /// Close the connection. Idempotent; the first reason wins.
    fn close(&self, reason: CloseReason);
}

/// The secure transport endpoint bound to the local identity.
#[async_trait::async_trait]
pub trait SecureTransport: Send + Sync + 'static {
    type Connection: SecureConnection;

    /// Handshake still in progress for an accepted connection.
    type Incoming: Future<Output = Result<Self::Connection, BoxError>> + Send + 'static;

    /// Identity this endpoint is bound to.
    fn local_peer(&self) -> PeerId;

    /// Wait for the next incoming connection attempt.
    ///
    /// An error means the listener is gone and no more connections will
    /// arrive.
    async fn accept(&self) -> Result<Self::Incoming, BoxError>;

    /// Connect to `peer` and authenticate it.
    async fn connect(&self, peer: PeerId) -> Result<Self::Connection, BoxError>;

    /// Stop listening and release the packet socket.
    fn close(&self);

    /// Wait until closed connections have finished notifying their peers.
    async fn wait_idle(&self) {}
}

// ── MockTransport (tests) ───────────────────────────────────────────

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    use futures_lite::future::{Boxed, FutureExt};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::{mpsc, oneshot, watch};
    use tokio_util::sync::CancellationToken;

    static NEXT_CONN_ID: AtomicUsize = AtomicUsize::new(1);

    fn mock_error(msg: &str) -> BoxError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
    }

    fn split_duplex(end: DuplexStream) -> (WriteHalf<DuplexStream>, ReadHalf<DuplexStream>) {
        let (recv, send) = tokio::io::split(end);
        (send, recv)
    }

    struct ConnState {
        id: usize,
        remote: PeerId,
        close_reason: Mutex<Option<CloseReason>>,
        closed: CancellationToken,
        streams_ended: CancellationToken,
        open_failures: AtomicU32,
        kick_failures: AtomicU32,
        die_on_open: AtomicBool,
        open_attempts: AtomicUsize,
        inbound_tx: mpsc::UnboundedSender<DuplexStream>,
        inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
        far_ends: Mutex<Vec<DuplexStream>>,
    }

    /// Fake connection: streams are in-memory duplex pipes.
    #[derive(Clone)]
    pub struct MockConnection {
        state: Arc<ConnState>,
    }

    impl MockConnection {
        pub fn new(remote: PeerId) -> Self {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Self {
                state: Arc::new(ConnState {
                    id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                    remote,
                    close_reason: Mutex::new(None),
                    closed: CancellationToken::new(),
                    streams_ended: CancellationToken::new(),
                    open_failures: AtomicU32::new(0),
                    kick_failures: AtomicU32::new(0),
                    die_on_open: AtomicBool::new(false),
                    open_attempts: AtomicUsize::new(0),
                    inbound_tx,
                    inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                    far_ends: Mutex::new(Vec::new()),
                }),
            }
        }

        pub fn close_reason(&self) -> Option<CloseReason> {
            *self.state.close_reason.lock().unwrap()
        }

        /// Make the next `n` stream opens fail outright.
        pub fn fail_next_opens(&self, n: u32) {
            self.state.open_failures.store(n, Ordering::SeqCst);
        }

        /// Make the next `n` opened streams fail on first write.
        pub fn break_next_streams(&self, n: u32) {
            self.state.kick_failures.store(n, Ordering::SeqCst);
        }

        /// Have the remote drop the connection during the next stream open.
        pub fn die_on_next_open(&self) {
            self.state.die_on_open.store(true, Ordering::SeqCst);
        }

        /// Make every pending and future stream accept fail, as an idle
        /// timeout would, without closing the connection.
        pub fn end_streams(&self) {
            self.state.streams_ended.cancel();
        }

        pub fn open_attempts(&self) -> usize {
            self.state.open_attempts.load(Ordering::SeqCst)
        }

        /// Simulate the remote side opening a stream; returns its end.
        pub fn push_inbound_stream(&self) -> DuplexStream {
            let (local, remote) = tokio::io::duplex(64 * 1024);
            let _ = self.state.inbound_tx.send(local);
            remote
        }

        /// Remote ends of the streams this side opened, oldest first.
        pub fn take_far_ends(&self) -> Vec<DuplexStream> {
            std::mem::take(&mut *self.state.far_ends.lock().unwrap())
        }

        fn take_one(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait::async_trait]
    impl SecureConnection for MockConnection {
        type SendStream = WriteHalf<DuplexStream>;
        type RecvStream = ReadHalf<DuplexStream>;

        fn remote_peer(&self) -> PeerId {
            self.state.remote
        }

        fn stable_id(&self) -> usize {
            self.state.id
        }

        fn is_closed(&self) -> bool {
            self.state.closed.is_cancelled()
        }

        async fn accept_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), BoxError> {
            let mut rx = self.state.inbound_rx.lock().await;
            tokio::select! {
                _ = self.state.closed.cancelled() => Err(mock_error("mock: connection closed")),
                _ = self.state.streams_ended.cancelled() => Err(mock_error("mock: stream accept failed")),
                stream = rx.recv() => match stream {
                    Some(stream) => Ok(split_duplex(stream)),
                    None => Err(mock_error("mock: connection closed")),
                },
            }
        }

        async fn open_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), BoxError> {
            self.state.open_attempts.fetch_add(1, Ordering::SeqCst);
            if self.state.die_on_open.swap(false, Ordering::SeqCst) {
                self.state.closed.cancel();
            }
            if self.is_closed() {
                return Err(mock_error("mock: connection closed"));
            }
            if Self::take_one(&self.state.open_failures) {
                return Err(mock_error("mock: stream open failed"));
            }
            let (local, remote) = tokio::io::duplex(64 * 1024);
            if Self::take_one(&self.state.kick_failures) {
                drop(remote);
            } else {
                self.state.far_ends.lock().unwrap().push(remote);
            }
            Ok(split_duplex(local))
        }

        fn close(&self, reason: CloseReason) {
            let mut slot = self.state.close_reason.lock().unwrap();
            if slot.is_none() {
                *slot = Some(reason);
            }
            self.state.closed.cancel();
        }
    }

    struct TransportState {
        local: PeerId,
        connects: Mutex<HashMap<PeerId, usize>>,
        connections: Mutex<Vec<MockConnection>>,
        fail_connects: Mutex<bool>,
        hold: watch::Sender<bool>,
        inbound_tx: mpsc::UnboundedSender<PendingInbound>,
        inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingInbound>>,
        closed: CancellationToken,
    }

    /// An inbound connection plus, optionally, the signal that completes
    /// its handshake.
    type PendingInbound = (MockConnection, Option<oneshot::Receiver<()>>);

    /// Fake transport that records connects and lets tests inject inbound
    /// connections.
    #[derive(Clone)]
    pub struct MockTransport {
        state: Arc<TransportState>,
    }

    impl MockTransport {
        pub fn new(local: PeerId) -> Self {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (hold, _) = watch::channel(false);
            Self {
                state: Arc::new(TransportState {
                    local,
                    connects: Mutex::new(HashMap::new()),
                    connections: Mutex::new(Vec::new()),
                    fail_connects: Mutex::new(false),
                    hold,
                    inbound_tx,
                    inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                    closed: CancellationToken::new(),
                }),
            }
        }

        /// Number of connect attempts made towards `peer`.
        pub fn connects(&self, peer: PeerId) -> usize {
            self.state
                .connects
                .lock()
                .unwrap()
                .get(&peer)
                .copied()
                .unwrap_or(0)
        }

        /// Connections handed out by `connect`, oldest first.
        pub fn outbound(&self) -> Vec<MockConnection> {
            self.state.connections.lock().unwrap().clone()
        }

        pub fn set_fail_connects(&self, fail: bool) {
            *self.state.fail_connects.lock().unwrap() = fail;
        }

        /// Park every connect until [`release_connects`](Self::release_connects).
        pub fn hold_connects(&self) {
            self.state.hold.send_replace(true);
        }

        pub fn release_connects(&self) {
            self.state.hold.send_replace(false);
        }

        /// Deliver an inbound connection from `remote` to the accept loop.
        pub fn inject_inbound(&self, remote: PeerId) -> MockConnection {
            let conn = MockConnection::new(remote);
            let _ = self.state.inbound_tx.send((conn.clone(), None));
            conn
        }

        /// Like [`inject_inbound`](Self::inject_inbound), but the handshake
        /// only completes once the returned sender fires or is dropped.
        pub fn inject_inbound_handshaking(
            &self,
            remote: PeerId,
        ) -> (MockConnection, oneshot::Sender<()>) {
            let conn = MockConnection::new(remote);
            let (finish, finished) = oneshot::channel();
            let _ = self.state.inbound_tx.send((conn.clone(), Some(finished)));
            (conn, finish)
        }

        pub fn is_closed(&self) -> bool {
            self.state.closed.is_cancelled()
        }
    }

    #[async_trait::async_trait]
    impl SecureTransport for MockTransport {
        type Connection = MockConnection;
        type Incoming = Boxed<Result<MockConnection, BoxError>>;

        fn local_peer(&self) -> PeerId {
            self.state.local
        }

        async fn accept(&self) -> Result<Self::Incoming, BoxError> {
            let mut rx = self.state.inbound_rx.lock().await;
            tokio::select! {
                _ = self.state.closed.cancelled() => Err(mock_error("mock: listener closed")),
                pending = rx.recv() => match pending {
                    Some((conn, finished)) => Ok(async move {
                        if let Some(finished) = finished {
                            let _ = finished.await;
                        }
                        Ok::<_, BoxError>(conn)
                    }
                    .boxed()),
                    None => Err(mock_error("mock: listener closed")),
                },
            }
        }

        async fn connect(&self, peer: PeerId) -> Result<Self::Connection, BoxError> {
            *self.state.connects.lock().unwrap().entry(peer).or_insert(0) += 1;

            let mut hold = self.state.hold.subscribe();
            loop {
                let held = *hold.borrow_and_update();
                if !held || hold.changed().await.is_err() {
                    break;
                }
            }

            if *self.state.fail_connects.lock().unwrap() {
                return Err(mock_error("mock: connect refused"));
            }
            let conn = MockConnection::new(peer);
            self.state.connections.lock().unwrap().push(conn.clone());
            Ok(conn)
        }

        fn close(&self) {
            self.state.closed.cancel();
        }
    }
}
