use crate::{PeerId, RuvTransportError};

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a [`RuvNode`](crate::RuvNode).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use ruvmail_transport::RuvNodeConfig;
///
/// let config = RuvNodeConfig::new()
///     .dial_timeout(Duration::from_secs(10))
///     .incoming_buffer(4);
/// ```
#[derive(Debug, Clone)]
pub struct RuvNodeConfig {
    /// Local UDP address the endpoint binds to.
    pub(crate) bind_addr: SocketAddr,
    /// ALPN protocol identifier.
    pub(crate) alpn: Vec<u8>,
    /// Overall budget for one `dial()` call.
    pub(crate) dial_timeout: Duration,
    /// Budget for completing the secure handshake, both directions.
    pub(crate) handshake_timeout: Duration,
    /// Connections with no traffic for this long are torn down.
    pub(crate) max_idle_timeout: Duration,
    /// Keep-alive interval; `None` lets idle connections expire.
    pub(crate) keep_alive_interval: Option<Duration>,
    /// Capacity of the queue between stream accept loops and `accept()`.
    pub(crate) incoming_buffer: usize,
    /// How many times a failed stream open is retried per dial.
    pub(crate) stream_open_retries: u32,
    /// Write (and strip on the accepting side) one activation byte per stream.
    ///
    /// QUIC does not announce a new stream to the peer until data flows on
    /// it. Both ends must agree on this setting.
    pub(crate) activation_kick: bool,
    /// Statically known peers and their socket addresses.
    pub(crate) peers: Vec<(PeerId, SocketAddr)>,
}

impl Default for RuvNodeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuvNodeConfig {
    /// Create a new config with defaults.
    ///
    /// `RUVMAIL_BIND_ADDR` overrides the bind address and `RUVMAIL_PEERS`
    /// (comma-separated `hex@host:port`) seeds the static peer list. Both
    /// can be overridden again with the builder methods. Malformed values
    /// are ignored with a warning.
    pub fn new() -> Self {
        let bind_addr = std::env::var("RUVMAIL_BIND_ADDR")
            .ok()
            .and_then(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    tracing::warn!("ignoring malformed RUVMAIL_BIND_ADDR {s:?}");
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        let peers = std::env::var("RUVMAIL_PEERS")
            .ok()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .filter_map(|entry| match parse_peer_entry(entry) {
                        Ok(peer) => Some(peer),
                        Err(e) => {
                            tracing::warn!("ignoring RUVMAIL_PEERS entry {entry:?}: {e}");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind_addr,
            alpn: crate::RUVMAIL_ALPN.to_vec(),
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(60),
            keep_alive_interval: None,
            incoming_buffer: 1,
            stream_open_retries: 1,
            activation_kick: true,
            peers,
        }
    }

    /// Set the local bind address (default: `0.0.0.0:0`).
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the ALPN protocol identifier.
    pub fn alpn(mut self, alpn: &[u8]) -> Self {
        self.alpn = alpn.to_vec();
        self
    }

    /// Set the overall deadline of a single dial (default: 5 s).
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the handshake deadline (default: 5 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout of established connections (default: 60 s).
    pub fn max_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Send keep-alives at this interval (default: disabled).
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Set the incoming stream queue capacity (default: 1).
    pub fn incoming_buffer(mut self, capacity: usize) -> Self {
        self.incoming_buffer = capacity;
        self
    }

    /// Set how many times a failed stream open is retried (default: 1).
    pub fn stream_open_retries(mut self, retries: u32) -> Self {
        self.stream_open_retries = retries;
        self
    }

    /// Enable or disable the per-stream activation byte (default: enabled).
    pub fn activation_kick(mut self, enabled: bool) -> Self {
        self.activation_kick = enabled;
        self
    }

    /// Add a statically known peer.
    pub fn peer(mut self, id: PeerId, addr: SocketAddr) -> Self {
        self.peers.push((id, addr));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), RuvTransportError> {
        if self.incoming_buffer == 0 {
            return Err(RuvTransportError::Config(
                "incoming_buffer must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("dial_timeout", self.dial_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("max_idle_timeout", self.max_idle_timeout),
        ] {
            if value.is_zero() {
                return Err(RuvTransportError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.alpn.is_empty() {
            return Err(RuvTransportError::Config("alpn must not be empty".into()));
        }
        Ok(())
    }
}

/// Parse a `hex@host:port` peer entry.
pub fn parse_peer_entry(entry: &str) -> Result<(PeerId, SocketAddr), RuvTransportError> {
    let (id, addr) = entry
        .split_once('@')
        .ok_or_else(|| RuvTransportError::Config(format!("expected hex@addr, got {entry:?}")))?;
    let id: PeerId = id.parse()?;
    let addr = addr
        .parse()
        .map_err(|_| RuvTransportError::Config(format!("bad socket address {addr:?}")))?;
    Ok((id, addr))
}
