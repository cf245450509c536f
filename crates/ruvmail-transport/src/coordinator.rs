use crate::{PeerId, RuvTransportError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// An outbound connection attempt in flight for one peer.
///
/// `done` fires exactly once: when the owner releases the ticket, or when an
/// inbound connection for the peer makes the attempt unnecessary.
#[derive(Debug, Default)]
pub(crate) struct DialTicket {
    done: CancellationToken,
    outcome: OnceLock<Result<(), RuvTransportError>>,
}

impl DialTicket {
    /// Resolves once waiters may re-check the registry.
    pub async fn wait(&self) {
        self.done.cancelled().await
    }

    /// Whether an inbound connection (or the owner) already released waiters.
    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// How the owner's attempt ended, if it has.
    pub fn outcome(&self) -> Option<&Result<(), RuvTransportError>> {
        self.outcome.get()
    }

    pub fn set_outcome(&self, outcome: Result<(), RuvTransportError>) {
        let _ = self.outcome.set(outcome);
    }
}

/// Result of [`DialCoordinator::acquire`].
pub(crate) enum Acquired<'a> {
    /// The caller performs the connect and must finish with the guard.
    Owner(DialGuard<'a>),
    /// Someone else is connecting; wait on the ticket.
    Waiter(Arc<DialTicket>),
}

/// At most one in-flight outbound attempt per peer.
#[derive(Default)]
pub(crate) struct DialCoordinator {
    tickets: DashMap<PeerId, Arc<DialTicket>>,
}

impl DialCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the owner of the attempt for `peer`, or get the ticket to wait on.
    pub fn acquire(&self, peer: PeerId) -> Acquired<'_> {
        match self.tickets.entry(peer) {
            Entry::Occupied(entry) => Acquired::Waiter(entry.get().clone()),
            Entry::Vacant(entry) => {
                let ticket = Arc::new(DialTicket::default());
                entry.insert(ticket.clone());
                Acquired::Owner(DialGuard {
                    coordinator: self,
                    peer,
                    ticket,
                })
            }
        }
    }

    /// Drop `ticket` if it is still the registered one and release its waiters.
    pub fn release(&self, peer: &PeerId, ticket: &Arc<DialTicket>) {
        if self
            .tickets
            .remove_if(peer, |_, current| Arc::ptr_eq(current, ticket))
            .is_some()
        {
            ticket.done.cancel();
        }
    }

    /// A connection for `peer` arrived through another path: wake its
    /// waiters now. The owner's connect keeps running.
    pub fn cancel_for(&self, peer: &PeerId) -> bool {
        match self.tickets.remove(peer) {
            Some((_, ticket)) => {
                ticket.done.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self, peer: &PeerId) -> bool {
        self.tickets.contains_key(peer)
    }
}

/// Ownership of a dial ticket. Releases the ticket when dropped, so waiters
/// are freed even if the owning dial is abandoned mid-connect.
pub(crate) struct DialGuard<'a> {
    coordinator: &'a DialCoordinator,
    peer: PeerId,
    ticket: Arc<DialTicket>,
}

impl DialGuard<'_> {
    #[cfg(test)]
    pub fn ticket(&self) -> &Arc<DialTicket> {
        &self.ticket
    }

    /// Record the outcome and release the waiters.
    pub fn finish(self, outcome: Result<(), RuvTransportError>) {
        self.ticket.set_outcome(outcome);
    }
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release(&self.peer, &self.ticket);
    }
}
