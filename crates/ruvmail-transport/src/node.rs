use crate::config::RuvNodeConfig;
use crate::coordinator::{Acquired, DialCoordinator, DialGuard};
use crate::listener::{RuvListener, RuvStream, ACTIVATION_BYTE};
use crate::quic::QuicEndpoint;
use crate::registry::{ConnectionRegistry, Direction, Offer};
use crate::secure::{SecureConnection, SecureTransport};
use crate::session;
use crate::{CloseReason, Identity, PeerId, RuvTransportError};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// State shared by the node handle, its listener and background loops.
pub(crate) struct NodeInner<B: SecureTransport> {
    pub id: PeerId,
    pub backend: B,
    pub config: RuvNodeConfig,
    pub registry: ConnectionRegistry<B::Connection>,
    pub dials: DialCoordinator,
    pub incoming_tx: mpsc::Sender<RuvStream<B::Connection>>,
    pub incoming_rx: Mutex<mpsc::Receiver<RuvStream<B::Connection>>>,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
}

/// A ruvmail transport node.
///
/// Dial peers by identity with [`dial`](Self::dial) and accept their streams
/// through [`listener`](Self::listener). At most one connection is kept per
/// peer and reused by every stream to it.
///
/// Dropping the node closes it, like [`RuvListener::close`].
pub struct RuvNode<B: SecureTransport = QuicEndpoint> {
    inner: Arc<NodeInner<B>>,
}

impl RuvNode<QuicEndpoint> {
    /// Bind a QUIC endpoint for `identity` and start accepting connections.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(identity: Identity, config: RuvNodeConfig) -> Result<Self, RuvTransportError> {
        config.validate()?;
        let endpoint = QuicEndpoint::bind(&identity, &config)?;
        Self::with_transport(endpoint, config)
    }

    /// Teach the node where `peer` can be reached.
    pub fn add_peer_addr(&self, peer: PeerId, addr: SocketAddr) {
        self.inner.backend.add_peer_addr(peer, addr);
    }

    /// The UDP address the endpoint is bound to.
    pub fn local_socket_addr(&self) -> Result<SocketAddr, RuvTransportError> {
        self.inner.backend.local_addr()
    }
}

impl<B: SecureTransport> RuvNode<B> {
    /// Run the node over an already bound secure transport.
    pub fn with_transport(backend: B, config: RuvNodeConfig) -> Result<Self, RuvTransportError> {
        config.validate()?;
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_buffer);
        let inner = Arc::new(NodeInner {
            id: backend.local_peer(),
            backend,
            config,
            registry: ConnectionRegistry::new(),
            dials: DialCoordinator::new(),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        session::spawn_inbound_loop(&inner);
        info!(id = %inner.id, "ruvmail node started");
        Ok(Self { inner })
    }

    /// This node's identity.
    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    /// Listener for streams opened by remote peers.
    pub fn listener(&self) -> RuvListener<B> {
        RuvListener::new(self.inner.clone())
    }

    /// Open a new stream to the peer named by its hex identity.
    pub async fn dial(&self, peer: &str) -> Result<RuvStream<B::Connection>, RuvTransportError> {
        let peer: PeerId = peer.parse()?;
        self.dial_peer(peer).await
    }

    /// Open a new stream to `peer`, connecting first if no live connection
    /// is registered. Bounded by the configured dial timeout.
    pub async fn dial_peer(
        &self,
        peer: PeerId,
    ) -> Result<RuvStream<B::Connection>, RuvTransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RuvTransportError::Shutdown);
        }
        let after = self.inner.config.dial_timeout;
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(RuvTransportError::Shutdown),
            res = tokio::time::timeout(after, self.inner.dial(peer)) => match res {
                Ok(res) => res,
                Err(_) => Err(RuvTransportError::Timeout { peer, after }),
            },
        }
    }

    /// Peers with a live registered connection.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.registry.peers()
    }

    /// Close and forget the connection to `peer`. Returns whether one was
    /// registered.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        match self.inner.registry.evict(&peer) {
            Some(entry) => {
                entry.stop.cancel();
                entry.conn.close(CloseReason::Disconnected);
                debug!(%peer, "disconnected");
                true
            }
            None => false,
        }
    }

    /// Close every connection and the endpoint, then wait for background
    /// tasks and for close notifications to reach peers.
    pub async fn shutdown(self) -> Result<(), RuvTransportError> {
        self.inner.close();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.backend.wait_idle().await;
        info!(id = %self.inner.id, "ruvmail node shut down");
        Ok(())
    }
}

impl<B: SecureTransport> Drop for RuvNode<B> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<B: SecureTransport> NodeInner<B> {
    /// Stop accepting, close every connection and the endpoint. Idempotent.
    pub(crate) fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for entry in self.registry.drain() {
            entry.stop.cancel();
            entry.conn.close(CloseReason::Shutdown);
        }
        self.backend.close();
        debug!(id = %self.id, "node closed");
    }

    async fn dial(
        self: &Arc<Self>,
        peer: PeerId,
    ) -> Result<RuvStream<B::Connection>, RuvTransportError> {
        let mut last_err = None;
        for attempt in 0..=self.config.stream_open_retries {
            let conn = self.connection_for(peer).await?;
            match self.open_stream(&conn).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%peer, attempt, "stream open failed: {e}");
                    // Other streams may still be running on a live connection,
                    // so only a dead one is given up and redialed.
                    if conn.is_closed() {
                        self.registry.remove(&peer, conn.stable_id());
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(RuvTransportError::ClosedNetwork { peer }))
    }

    /// The registered connection for `peer`, connecting if there is none.
    async fn connection_for(
        self: &Arc<Self>,
        peer: PeerId,
    ) -> Result<B::Connection, RuvTransportError> {
        loop {
            if let Some(conn) = self.registry.lookup(&peer) {
                return Ok(conn);
            }
            match self.dials.acquire(peer) {
                Acquired::Owner(guard) => return self.connect_as_owner(peer, guard).await,
                Acquired::Waiter(ticket) => {
                    ticket.wait().await;
                    if let Some(conn) = self.registry.lookup(&peer) {
                        return Ok(conn);
                    }
                    match ticket.outcome() {
                        Some(Err(e)) => return Err(e.clone()),
                        Some(Ok(())) => return Err(RuvTransportError::ClosedNetwork { peer }),
                        // Released without an outcome: an inbound connection
                        // that has already gone away, or an abandoned owner.
                        None => continue,
                    }
                }
            }
        }
    }

    async fn connect_as_owner(
        self: &Arc<Self>,
        peer: PeerId,
        guard: DialGuard<'_>,
    ) -> Result<B::Connection, RuvTransportError> {
        debug!(%peer, "connecting");
        let started = Instant::now();
        let after = self.config.handshake_timeout;
        let connected = match tokio::time::timeout(after, self.backend.connect(peer)).await {
            Ok(Ok(conn)) if conn.remote_peer() != peer => {
                conn.close(CloseReason::IdentityMismatch);
                Err(RuvTransportError::AuthenticationFailed {
                    expected: peer.to_string(),
                    presented: conn.remote_peer().to_string(),
                })
            }
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(RuvTransportError::connect(peer, e)),
            Err(_) => Err(RuvTransportError::Timeout { peer, after }),
        };

        let adopted = match connected {
            Ok(conn) => self.adopt_outbound(peer, conn, started),
            Err(e) => match self.registry.lookup(&peer) {
                // The peer reached us while our own attempt was failing.
                Some(inbound) => {
                    debug!(%peer, "connect failed, using inbound connection: {e}");
                    Ok(inbound)
                }
                None => {
                    debug!(%peer, "connect failed: {e}");
                    Err(e)
                }
            },
        };
        guard.finish(adopted.as_ref().map(|_| ()).map_err(Clone::clone));
        adopted
    }

    /// Register a fresh outbound connection whose connect began at `started`.
    ///
    /// If it lost a simultaneous open, the inbound connection that won is
    /// returned instead and this one stays up unregistered, since the remote
    /// may already be using it.
    fn adopt_outbound(
        self: &Arc<Self>,
        peer: PeerId,
        conn: B::Connection,
        started: Instant,
    ) -> Result<B::Connection, RuvTransportError> {
        if self.shutdown.is_cancelled() {
            conn.close(CloseReason::Shutdown);
            return Err(RuvTransportError::Shutdown);
        }
        let stop = CancellationToken::new();
        let offered = self.registry.offer(
            self.id,
            peer,
            conn.clone(),
            stop.clone(),
            Direction::Outbound,
            started,
        );
        session::spawn_stream_loop(self, conn.clone(), stop);
        match offered {
            Offer::Installed => {
                info!(%peer, "outbound connection established");
                Ok(conn)
            }
            Offer::Lost(inbound) => {
                debug!(
                    %peer,
                    unregistered = conn.stable_id(),
                    "simultaneous open, using the inbound connection"
                );
                Ok(inbound)
            }
        }
    }

    async fn open_stream(
        &self,
        conn: &B::Connection,
    ) -> Result<RuvStream<B::Connection>, RuvTransportError> {
        let peer = conn.remote_peer();
        let (mut send, recv) = conn
            .open_stream()
            .await
            .map_err(|e| RuvTransportError::stream_open(peer, e))?;
        if self.config.activation_kick {
            send.write_all(&[ACTIVATION_BYTE])
                .await
                .map_err(|e| RuvTransportError::stream_open(peer, Box::new(e)))?;
        }
        Ok(RuvStream::new(conn.clone(), self.id, send, recv, false))
    }
}
