use crate::secure::SecureConnection;
use crate::{CloseReason, PeerId};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// Who initiated a connection in this direction between `local` and `remote`.
    fn initiator(self, local: PeerId, remote: PeerId) -> PeerId {
        match self {
            Direction::Inbound => remote,
            Direction::Outbound => local,
        }
    }
}

/// A registered connection plus the stop signal of its stream accept loop.
pub(crate) struct Registered<C> {
    pub conn: C,
    pub stop: CancellationToken,
    pub direction: Direction,
    pub established: Instant,
}

/// Result of [`ConnectionRegistry::offer`].
pub(crate) enum Offer<C> {
    /// The offered connection now holds the slot.
    Installed,
    /// The offered connection lost a simultaneous open to the registered one,
    /// which is returned.
    Lost(C),
}

/// At most one live connection per peer. Every operation touches a single
/// key atomically; unrelated peers never wait on each other.
pub(crate) struct ConnectionRegistry<C> {
    connections: DashMap<PeerId, Registered<C>>,
}

impl<C: SecureConnection> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// The registered connection for `peer`, if it is still alive.
    pub fn lookup(&self, peer: &PeerId) -> Option<C> {
        let entry = self.connections.get(peer)?;
        if entry.conn.is_closed() {
            return None;
        }
        Some(entry.conn.clone())
    }

    /// Register `conn` for `peer`, evicting and closing any previous entry.
    #[cfg(test)]
    pub fn install(
        &self,
        peer: PeerId,
        conn: C,
        stop: CancellationToken,
        direction: Direction,
    ) -> Option<C> {
        let evicted = self.connections.insert(
            peer,
            Registered {
                conn,
                stop,
                direction,
                established: Instant::now(),
            },
        )?;
        Some(retire(peer, evicted))
    }

    /// Register `conn`, whose handshake began at `started`, unless it lost a
    /// simultaneous open.
    ///
    /// Two nodes dialing each other at once each end up with an inbound and
    /// an outbound connection. When the registered connection has the other
    /// direction and was established after `started`, both ends keep the
    /// connection initiated by the lower [`PeerId`]. The other one is left
    /// open and unregistered: its stream accept loop keeps serving whatever
    /// the remote already sent on it until it idles out.
    ///
    /// Any other previous entry is evicted and closed as [`CloseReason::Replaced`].
    pub fn offer(
        &self,
        local: PeerId,
        peer: PeerId,
        conn: C,
        stop: CancellationToken,
        direction: Direction,
        started: Instant,
    ) -> Offer<C> {
        let candidate = Registered {
            conn,
            stop,
            direction,
            established: Instant::now(),
        };
        let evicted = match self.connections.entry(peer) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
                return Offer::Installed;
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                let simultaneous = !current.conn.is_closed()
                    && current.direction != direction
                    && current.established >= started;
                let current_initiator = current.direction.initiator(local, peer);
                if !simultaneous {
                    slot.insert(candidate)
                } else if direction.initiator(local, peer) < current_initiator {
                    let detached = slot.insert(candidate);
                    debug!(
                        %peer,
                        detached = detached.conn.stable_id(),
                        "simultaneous open, keeping the connection initiated by the lower id"
                    );
                    return Offer::Installed;
                } else {
                    return Offer::Lost(slot.get().conn.clone());
                }
            }
        };
        retire(peer, evicted);
        Offer::Installed
    }

    /// Deregister `peer` only if the registered connection is still
    /// `expected_id`; a connection that has since replaced it stays.
    pub fn remove(&self, peer: &PeerId, expected_id: usize) -> bool {
        self.connections
            .remove_if(peer, |_, entry| entry.conn.stable_id() == expected_id)
            .is_some()
    }

    /// Deregister `peer` unconditionally, returning what was there.
    pub fn evict(&self, peer: &PeerId) -> Option<Registered<C>> {
        self.connections.remove(peer).map(|(_, entry)| entry)
    }

    /// Whether any entry, live or not, is held for `peer`.
    #[cfg(test)]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.connections.contains_key(peer)
    }

    /// Snapshot of peers with a live connection.
    ///
    /// Walks the whole map, so it is for diagnostics only and never on a
    /// dial or accept path.
    pub fn peers(&self) -> Vec<PeerId> {
        self.connections
            .iter()
            .filter(|entry| !entry.conn.is_closed())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Remove every entry. Walks the whole map; only node shutdown calls it.
    pub fn drain(&self) -> Vec<Registered<C>> {
        let peers: Vec<PeerId> = self.connections.iter().map(|entry| *entry.key()).collect();
        peers.iter().filter_map(|peer| self.evict(peer)).collect()
    }
}

/// Stop and close a connection that lost its slot.
fn retire<C: SecureConnection>(peer: PeerId, evicted: Registered<C>) -> C {
    debug!(
        %peer,
        evicted = evicted.conn.stable_id(),
        "replacing registered connection"
    );
    evicted.stop.cancel();
    evicted.conn.close(CloseReason::Replaced);
    evicted.conn
}
