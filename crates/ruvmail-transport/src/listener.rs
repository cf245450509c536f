//! Byte-stream and listener surface handed to application protocols.

use crate::node::NodeInner;
use crate::quic::{QuicConnection, QuicEndpoint};
use crate::secure::{SecureConnection, SecureTransport};
use crate::{PeerId, RuvTransportError};

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Byte written by the dialer on every new stream so the peer sees it.
pub(crate) const ACTIVATION_BYTE: u8 = b' ';

/// One bidirectional stream to a peer.
///
/// Addresses are peer identities: [`local_addr`](Self::local_addr) is this
/// node and [`remote_addr`](Self::remote_addr) the authenticated remote.
/// Dropping the stream finishes it; the underlying connection stays up for
/// other streams.
pub struct RuvStream<C: SecureConnection = QuicConnection> {
    conn: C,
    local: PeerId,
    send: C::SendStream,
    recv: C::RecvStream,
    /// First byte on the wire is the dialer's activation byte.
    strip_kick: bool,
}

impl<C: SecureConnection> RuvStream<C> {
    pub(crate) fn new(
        conn: C,
        local: PeerId,
        send: C::SendStream,
        recv: C::RecvStream,
        strip_kick: bool,
    ) -> Self {
        Self {
            conn,
            local,
            send,
            recv,
            strip_kick,
        }
    }

    pub fn local_addr(&self) -> PeerId {
        self.local
    }

    pub fn remote_addr(&self) -> PeerId {
        self.conn.remote_peer()
    }

    /// The shared connection this stream runs on.
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Check an identity the remote claims in-band against the one it
    /// authenticated with.
    pub fn verify_claimed_identity(&self, claimed: &str) -> Result<(), RuvTransportError> {
        crate::verify_claimed_identity(&self.remote_addr(), claimed)
    }
}

impl<C: SecureConnection> fmt::Debug for RuvStream<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuvStream")
            .field("local", &self.local)
            .field("remote", &self.conn.remote_peer())
            .field("connection", &self.conn.stable_id())
            .finish()
    }
}

impl<C: SecureConnection> AsyncRead for RuvStream<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.strip_kick && buf.remaining() > 0 {
            let mut byte = [0u8; 1];
            let mut kick = ReadBuf::new(&mut byte);
            ready!(Pin::new(&mut this.recv).poll_read(cx, &mut kick))?;
            this.strip_kick = false;
            match kick.filled().first().copied() {
                None => return Poll::Ready(Ok(())),
                Some(ACTIVATION_BYTE) => {}
                Some(other) => {
                    // The dialer runs without the activation byte: this is data.
                    debug!(byte = other, "stream did not start with the activation byte");
                    buf.put_slice(&[other]);
                    return Poll::Ready(Ok(()));
                }
            }
        }
        Pin::new(&mut this.recv).poll_read(cx, buf)
    }
}

impl<C: SecureConnection> AsyncWrite for RuvStream<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().send).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().send).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().send).poll_shutdown(cx)
    }
}

/// Streams opened towards this node by remote peers.
///
/// Obtained from [`RuvNode::listener`](crate::RuvNode::listener). Any number
/// of tasks may call [`accept`](Self::accept) concurrently; each stream is
/// delivered once.
pub struct RuvListener<B: SecureTransport = QuicEndpoint> {
    inner: Arc<NodeInner<B>>,
}

impl<B: SecureTransport> RuvListener<B> {
    pub(crate) fn new(inner: Arc<NodeInner<B>>) -> Self {
        Self { inner }
    }

    /// Wait for the next inbound stream.
    ///
    /// Returns [`RuvTransportError::Shutdown`] once the listener or its node
    /// is closed, including for calls already waiting.
    pub async fn accept(&self) -> Result<RuvStream<B::Connection>, RuvTransportError> {
        let next = async { self.inner.incoming_rx.lock().await.recv().await };
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(RuvTransportError::Shutdown),
            stream = next => stream.ok_or(RuvTransportError::Shutdown),
        }
    }

    /// This node's identity.
    pub fn local_addr(&self) -> PeerId {
        self.inner.id
    }

    /// Stop accepting and close the underlying endpoint and socket.
    ///
    /// Every registered connection is closed and pending `accept` calls
    /// return. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), RuvTransportError> {
        self.inner.close();
        Ok(())
    }
}

impl<B: SecureTransport> Clone for RuvListener<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: SecureTransport> fmt::Debug for RuvListener<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuvListener")
            .field("local", &self.inner.id)
            .finish_non_exhaustive()
    }
}
