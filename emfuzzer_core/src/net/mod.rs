pub mod reactor;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use thiserror::Error;

pub use reactor::NetworkReactor;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Failed to set up network socket: {0}")]
    Socket(#[from] std::io::Error),
    #[error("Cannot resolve address {0}")]
    Unresolvable(Address),
    #[error("Send queue is full ({0} datagrams pending), datagram to {1} rejected")]
    QueueFull(usize, Address),
    #[error("Network reactor is not running")]
    Stopped,
}

/// Host/port pair identifying the fuzz target or the origin of a datagram.
///
/// Compared by value: a target configured as `127.0.0.1` only matches replies
/// whose origin is reported as `127.0.0.1`, not `localhost`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn resolve(&self) -> Result<SocketAddr, NetError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| NetError::Unresolvable(self.clone()))?
            .next()
            .ok_or_else(|| NetError::Unresolvable(self.clone()))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Receives every datagram that passes through the [`NetworkReactor`].
///
/// Both callbacks run on the reactor thread and must return promptly.
pub trait Consumer: Send + Sync {
    /// Called right before the datagram is written to the socket.
    fn on_sent(&self, addr: &Address, payload: &[u8]);
    fn on_received(&self, addr: &Address, payload: &[u8]);
}

pub(crate) fn hex(payload: &[u8]) -> String {
    payload.iter().map(|b| format!("{b:02x}")).collect()
}
