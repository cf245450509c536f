//! QUIC backend: the secure multiplexed transport used by [`RuvNode::bind`].
//!
//! [`RuvNode::bind`]: crate::RuvNode::bind

mod tls;

use crate::config::RuvNodeConfig;
use crate::identity::{peer_id_from_certificate, TLS_SERVER_NAME};
use crate::secure::{SecureConnection, SecureTransport};
use crate::{BoxError, CloseReason, Identity, PeerId, RuvTransportError};

use dashmap::DashMap;
use futures_lite::future::{Boxed, FutureExt};
use quinn::VarInt;
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// A bound QUIC endpoint carrying this node's identity.
///
/// Peers are reached through an address book mapping identities to socket
/// addresses, filled from [`RuvNodeConfig::peer`] and
/// [`add_peer_addr`](Self::add_peer_addr).
#[derive(Clone)]
pub struct QuicEndpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    id: PeerId,
    endpoint: quinn::Endpoint,
    addresses: DashMap<PeerId, SocketAddr>,
}

impl QuicEndpoint {
    /// Bind a UDP socket and start a QUIC endpoint for `identity`.
    ///
    /// Requires a tokio runtime, even though the function is not async.
    pub fn bind(identity: &Identity, config: &RuvNodeConfig) -> Result<Self, RuvTransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let cert = identity.certificate()?;

        let mut transport = quinn::TransportConfig::default();
        let idle = quinn::IdleTimeout::try_from(config.max_idle_timeout)
            .map_err(|e| RuvTransportError::Config(format!("max_idle_timeout: {e}")))?;
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(config.keep_alive_interval);
        let transport = Arc::new(transport);

        let server = tls::server_config(&cert, &config.alpn, provider.clone(), transport.clone())?;
        let client = tls::client_config(&cert, &config.alpn, provider, transport)?;

        let mut endpoint = quinn::Endpoint::server(server, config.bind_addr)
            .map_err(|e| RuvTransportError::Bind(Arc::new(e)))?;
        endpoint.set_default_client_config(client);

        let addresses = DashMap::new();
        for (peer, addr) in &config.peers {
            addresses.insert(*peer, *addr);
        }

        let id = identity.peer_id();
        info!(%id, addr = ?endpoint.local_addr().ok(), "QUIC endpoint bound");
        Ok(Self {
            inner: Arc::new(EndpointInner {
                id,
                endpoint,
                addresses,
            }),
        })
    }

    /// The UDP address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, RuvTransportError> {
        self.inner
            .endpoint
            .local_addr()
            .map_err(|e| RuvTransportError::Bind(Arc::new(e)))
    }

    /// Record (or replace) the socket address `peer` is reachable at.
    pub fn add_peer_addr(&self, peer: PeerId, addr: SocketAddr) {
        if let Some(previous) = self.inner.addresses.insert(peer, addr) {
            if previous != addr {
                debug!(%peer, %previous, %addr, "peer address updated");
            }
        }
    }

}

impl fmt::Debug for QuicEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicEndpoint")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("known_peers", &self.inner.addresses.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl SecureTransport for QuicEndpoint {
    type Connection = QuicConnection;
    type Incoming = Boxed<Result<QuicConnection, BoxError>>;

    fn local_peer(&self) -> PeerId {
        self.inner.id
    }

    async fn accept(&self) -> Result<Self::Incoming, BoxError> {
        let incoming = self
            .inner
            .endpoint
            .accept()
            .await
            .ok_or_else(|| BoxError::from("QUIC endpoint closed"))?;
        let remote = incoming.remote_address();
        Ok(async move {
            let conn = incoming.accept()?.await?;
            let conn = QuicConnection::authenticated(conn)?;
            debug!(peer = %conn.remote, %remote, "accepted QUIC connection");
            Ok::<_, BoxError>(conn)
        }
        .boxed())
    }

    async fn connect(&self, peer: PeerId) -> Result<Self::Connection, BoxError> {
        let addr = self
            .inner
            .addresses
            .get(&peer)
            .map(|entry| *entry.value())
            .ok_or(RuvTransportError::ClosedNetwork { peer })?;

        let conn = self
            .inner
            .endpoint
            .connect(addr, TLS_SERVER_NAME)?
            .await?;
        let conn = QuicConnection::authenticated(conn)?;
        if conn.remote != peer {
            let presented = conn.remote;
            conn.close(CloseReason::IdentityMismatch);
            return Err(Box::new(RuvTransportError::AuthenticationFailed {
                expected: peer.to_string(),
                presented: presented.to_string(),
            }));
        }
        Ok(conn)
    }

    fn close(&self) {
        self.inner.endpoint.close(
            VarInt::from_u32(CloseReason::Shutdown.code()),
            CloseReason::Shutdown.as_str().as_bytes(),
        );
    }

    async fn wait_idle(&self) {
        self.inner.endpoint.wait_idle().await;
    }
}

/// An authenticated QUIC connection to one peer.
#[derive(Clone)]
pub struct QuicConnection {
    conn: quinn::Connection,
    remote: PeerId,
}

impl QuicConnection {
    /// Wrap a finished handshake, deriving the remote identity from the
    /// certificate it presented.
    fn authenticated(conn: quinn::Connection) -> Result<Self, RuvTransportError> {
        let certs: Vec<CertificateDer<'static>> = conn
            .peer_identity()
            .and_then(|id| id.downcast::<Vec<CertificateDer<'static>>>().ok())
            .map(|certs| *certs)
            .unwrap_or_default();
        let Some(end_entity) = certs.first() else {
            conn.close(VarInt::from_u32(0), b"no certificate");
            return Err(RuvTransportError::Identity(
                "peer presented no certificate".into(),
            ));
        };
        let remote = peer_id_from_certificate(end_entity)?;
        Ok(Self { conn, remote })
    }

    /// Remote UDP address, which may change under migration.
    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Current round-trip time estimate of the connection's path.
    pub fn rtt(&self) -> std::time::Duration {
        self.conn.rtt()
    }
}

impl fmt::Debug for QuicConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicConnection")
            .field("remote", &self.remote)
            .field("id", &self.conn.stable_id())
            .finish()
    }
}

#[async_trait::async_trait]
impl SecureConnection for QuicConnection {
    type SendStream = quinn::SendStream;
    type RecvStream = quinn::RecvStream;

    fn remote_peer(&self) -> PeerId {
        self.remote
    }

    fn stable_id(&self) -> usize {
        self.conn.stable_id()
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    async fn accept_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), BoxError> {
        Ok(self.conn.accept_bi().await?)
    }

    async fn open_stream(&self) -> Result<(Self::SendStream, Self::RecvStream), BoxError> {
        Ok(self.conn.open_bi().await?)
    }

    fn close(&self, reason: CloseReason) {
        self.conn
            .close(VarInt::from_u32(reason.code()), reason.as_str().as_bytes());
    }
}
