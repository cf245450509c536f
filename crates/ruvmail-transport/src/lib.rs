//! Ruvmail transport layer.
//!
//! Identity-addressed byte streams between nodes named by their Ed25519
//! public key. One secure QUIC connection is kept per peer and shared by
//! every stream to that peer; concurrent dials to the same peer collapse
//! into a single connection attempt, and an inbound connection from a peer
//! replaces whatever was registered for it before.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use ruvmail_transport::{Identity, RuvNode, RuvNodeConfig};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = RuvNode::bind(Identity::generate(), RuvNodeConfig::new())?;
//! println!("My ID: {}", node.id());
//!
//! // Outbound: one fresh stream per dial, connection reused across dials
//! let mut stream = node.dial("ab01...ef").await?;
//! stream.write_all(b"EHLO\r\n").await?;
//!
//! // Inbound: streams opened by remote peers
//! let listener = node.listener();
//! let mut incoming = listener.accept().await?;
//! let mut buf = [0u8; 512];
//! let n = incoming.read(&mut buf).await?;
//! println!("{} sent {n} bytes", incoming.remote_addr());
//!
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod error;
mod identity;
mod listener;
mod node;
pub mod quic;
mod registry;
pub mod secure;
mod session;

pub use config::{parse_peer_entry, RuvNodeConfig};
pub use error::{BoxError, CloseReason, RuvTransportError, SharedError};
pub use identity::{verify_claimed_identity, Identity, IdentityCertificate};
pub use listener::{RuvListener, RuvStream};
pub use node::RuvNode;
pub use quic::{QuicConnection, QuicEndpoint};
pub use secure::{SecureConnection, SecureTransport};

use std::fmt;
use std::str::FromStr;

/// Length of a raw peer identity (Ed25519 public key).
pub const PEER_ID_LEN: usize = 32;

/// Ruvmail network identity: an Ed25519 public key.
///
/// Displayed and parsed as lowercase hex. The hex form is also the peer's
/// overlay address and the key every per-peer table is indexed by.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap raw public-key bytes.
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, which must be exactly [`PEER_ID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RuvTransportError> {
        let raw: [u8; PEER_ID_LEN] = bytes
            .try_into()
            .map_err(|_| RuvTransportError::InvalidAddress(hex::encode(bytes)))?;
        Ok(Self(raw))
    }

    /// Get the raw 32-byte public key.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Canonical text form (lowercase hex).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "PeerId({}...)", &hex[..12])
    }
}

impl FromStr for PeerId {
    type Err = RuvTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PEER_ID_LEN * 2 {
            return Err(RuvTransportError::InvalidAddress(s.to_string()));
        }
        let mut raw = [0u8; PEER_ID_LEN];
        hex::decode_to_slice(s, &mut raw)
            .map_err(|_| RuvTransportError::InvalidAddress(s.to_string()))?;
        Ok(Self(raw))
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// ALPN protocol identifier for ruvmail transport.
pub const RUVMAIL_ALPN: &[u8] = b"ruvmail/transport/0";
