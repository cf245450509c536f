//! Background loops: one accepting connections on the endpoint, and one per
//! registered connection accepting the streams its peer opens.

use crate::listener::RuvStream;
use crate::node::NodeInner;
use crate::registry::{Direction, Offer};
use crate::secure::{SecureConnection, SecureTransport};
use crate::CloseReason;

use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Spawn the loop that accepts incoming connections for the node.
pub(crate) fn spawn_inbound_loop<B: SecureTransport>(inner: &Arc<NodeInner<B>>) {
    let span = tracing::info_span!("inbound", local = %inner.id);
    inner
        .tasks
        .spawn(inbound_accept_loop(inner.clone()).instrument(span));
}

async fn inbound_accept_loop<B: SecureTransport>(inner: Arc<NodeInner<B>>) {
    loop {
        let incoming = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            res = inner.backend.accept() => match res {
                Ok(incoming) => incoming,
                Err(e) => {
                    debug!("endpoint stopped accepting: {e}");
                    break;
                }
            },
        };

        // Handshakes run on their own so a slow peer cannot hold up others.
        let started = Instant::now();
        let handshake = {
            let inner = inner.clone();
            async move {
                match tokio::time::timeout(inner.config.handshake_timeout, incoming).await {
                    Ok(Ok(conn)) => register_inbound(&inner, conn, started),
                    Ok(Err(e)) => warn!("inbound handshake failed: {e}"),
                    Err(_) => warn!(
                        "inbound handshake timed out after {:?}",
                        inner.config.handshake_timeout
                    ),
                }
            }
        };
        inner.tasks.spawn(handshake.in_current_span());
    }
    debug!("inbound accept loop stopped");
}

/// Adopt an authenticated inbound connection whose handshake began at
/// `started`: it replaces whatever was registered for the peer and settles
/// any outbound attempt towards it, unless it lost a simultaneous open.
///
/// Either way its streams are accepted until it closes.
pub(crate) fn register_inbound<B: SecureTransport>(
    inner: &Arc<NodeInner<B>>,
    conn: B::Connection,
    started: Instant,
) {
    let peer = conn.remote_peer();
    if inner.shutdown.is_cancelled() {
        conn.close(CloseReason::Shutdown);
        return;
    }

    let stop = CancellationToken::new();
    let offered = inner.registry.offer(
        inner.id,
        peer,
        conn.clone(),
        stop.clone(),
        Direction::Inbound,
        started,
    );
    match offered {
        Offer::Installed => {
            info!(%peer, "inbound connection established");
            if inner.dials.cancel_for(&peer) {
                debug!(%peer, "released dial waiters");
            }
        }
        Offer::Lost(kept) => debug!(
            %peer,
            kept = kept.stable_id(),
            "simultaneous open, inbound connection left unregistered"
        ),
    }
    spawn_stream_loop(inner, conn, stop);
}

/// Spawn the stream accept loop for a connection.
pub(crate) fn spawn_stream_loop<B: SecureTransport>(
    inner: &Arc<NodeInner<B>>,
    conn: B::Connection,
    stop: CancellationToken,
) {
    let span = tracing::debug_span!(
        "connection",
        peer = %conn.remote_peer(),
        id = conn.stable_id()
    );
    inner
        .tasks
        .spawn(stream_accept_loop(inner.clone(), conn, stop).instrument(span));
}

enum LoopExit {
    /// Evicted from the registry; whoever evicted it already closed it.
    Evicted,
    Shutdown,
    Failed,
}

async fn stream_accept_loop<B: SecureTransport>(
    inner: Arc<NodeInner<B>>,
    conn: B::Connection,
    stop: CancellationToken,
) {
    let exit = loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.cancelled() => break LoopExit::Evicted,
            _ = inner.shutdown.cancelled() => break LoopExit::Shutdown,
            res = conn.accept_stream() => res,
        };
        let (send, recv) = match accepted {
            Ok(halves) => halves,
            Err(e) => {
                debug!("stream accept failed: {e}");
                break LoopExit::Failed;
            }
        };

        let stream = RuvStream::new(
            conn.clone(),
            inner.id,
            send,
            recv,
            inner.config.activation_kick,
        );
        tokio::select! {
            biased;
            _ = stop.cancelled() => break LoopExit::Evicted,
            _ = inner.shutdown.cancelled() => break LoopExit::Shutdown,
            sent = inner.incoming_tx.send(stream) => {
                if sent.is_err() {
                    break LoopExit::Shutdown;
                }
            }
        }
    };

    match exit {
        LoopExit::Evicted => {}
        LoopExit::Shutdown => conn.close(CloseReason::Shutdown),
        LoopExit::Failed => conn.close(CloseReason::StreamAcceptFailed),
    }
    inner.registry.remove(&conn.remote_peer(), conn.stable_id());
    debug!("stream accept loop stopped");
}
