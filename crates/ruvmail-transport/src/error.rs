use crate::PeerId;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cause reported by a secure transport backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A backend cause that can be handed to several callers at once.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the ruvmail transport layer.
///
/// Cloneable so that every caller waiting on one dial attempt sees the same
/// failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuvTransportError {
    #[error("invalid peer address: {0:?}")]
    InvalidAddress(String),

    #[error("connection to {peer} failed: {source}")]
    ConnectFailed {
        peer: PeerId,
        #[source]
        source: SharedError,
    },

    #[error("dial to {peer} timed out after {after:?}")]
    Timeout { peer: PeerId, after: Duration },

    #[error("opening stream to {peer} failed: {source}")]
    StreamOpenFailed {
        peer: PeerId,
        #[source]
        source: SharedError,
    },

    #[error("no route to {peer}")]
    ClosedNetwork { peer: PeerId },

    #[error("peer identity mismatch: expected {expected}, presented {presented}")]
    AuthenticationFailed { expected: String, presented: String },

    #[error("failed to bind endpoint: {0}")]
    Bind(#[source] SharedError),

    #[error("unusable identity material: {0}")]
    Identity(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport is shut down")]
    Shutdown,
}

impl RuvTransportError {
    pub(crate) fn connect(peer: PeerId, source: BoxError) -> Self {
        // Backends report identity mismatches through the connect path; keep
        // them distinguishable for callers.
        match source.downcast::<RuvTransportError>() {
            Ok(inner) => *inner,
            Err(source) => RuvTransportError::ConnectFailed {
                peer,
                source: Arc::from(source),
            },
        }
    }

    pub(crate) fn stream_open(peer: PeerId, source: BoxError) -> Self {
        RuvTransportError::StreamOpenFailed {
            peer,
            source: Arc::from(source),
        }
    }

    /// Whether retrying the same operation can ever succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RuvTransportError::InvalidAddress(_)
                | RuvTransportError::AuthenticationFailed { .. }
                | RuvTransportError::Config(_)
                | RuvTransportError::Identity(_)
                | RuvTransportError::Shutdown
        )
    }
}

/// Why a connection was closed by this node.
///
/// Carried to the remote side as the application close code and reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same peer took over the registry slot.
    Replaced,
    /// Accepting the next stream failed (idle timeout, reset, peer gone).
    StreamAcceptFailed,
    /// The remote authenticated as a different peer than the one dialed.
    IdentityMismatch,
    /// The local node dropped the peer on request.
    Disconnected,
    /// The local node is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Application error code sent in the close frame.
    pub fn code(self) -> u32 {
        match self {
            CloseReason::Shutdown => 0,
            CloseReason::Replaced => 1,
            CloseReason::StreamAcceptFailed => 2,
            CloseReason::IdentityMismatch => 3,
            CloseReason::Disconnected => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Replaced => "connection replaced",
            CloseReason::StreamAcceptFailed => "timed out",
            CloseReason::IdentityMismatch => "identity mismatch",
            CloseReason::Disconnected => "disconnected",
            CloseReason::Shutdown => "shutting down",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
