//! DHT peer identity and address hints.

use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Errors that can occur while parsing a peer address hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddrError {
    /// The text is not a valid multiaddr.
    InvalidMultiaddr(String),
    /// The multiaddr does not end with a `/p2p/<peer id>` component.
    MissingPeerId,
}

impl fmt::Display for PeerAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddrError::InvalidMultiaddr(err) => write!(f, "Invalid multiaddr: {err}"),
            PeerAddrError::MissingPeerId => {
                write!(f, "Address must end with a /p2p/<peer id> component")
            }
        }
    }
}

impl std::error::Error for PeerAddrError {}

/// A peer identifier together with the transport addresses it may be reachable at.
///
/// This is the "address hint" handed to the crawler for seeds and the shape
/// peers take when they are returned in a DHT response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's stable identifier.
    pub id: PeerId,
    /// Transport addresses, without a trailing `/p2p` component.
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    /// Create a new address hint.
    pub fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        PeerInfo { id, addrs }
    }

    /// Split a full peer address such as `/ip4/1.2.3.4/tcp/4001/p2p/12D3Koo...`
    /// into the peer identifier and its transport address.
    ///
    /// A bare `/p2p/<peer id>` yields a hint without addresses.
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, PeerAddrError> {
        let mut transport = addr.clone();
        match transport.pop() {
            Some(Protocol::P2p(id)) => {
                let addrs = if transport.is_empty() {
                    Vec::new()
                } else {
                    vec![transport]
                };
                Ok(PeerInfo { id, addrs })
            }
            _ => Err(PeerAddrError::MissingPeerId),
        }
    }

    /// Full addresses of this peer, each with the `/p2p/<peer id>` suffix.
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|addr| addr.clone().with(Protocol::P2p(self.id)))
            .collect()
    }
}

impl FromStr for PeerInfo {
    type Err = PeerAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = Multiaddr::from_str(s.trim())
            .map_err(|e| PeerAddrError::InvalidMultiaddr(e.to_string()))?;
        PeerInfo::from_p2p_addr(&addr)
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{addr}")?;
        }
        write!(f, "]")
    }
}

/// Remove a trailing `/p2p/<peer id>` component, if any.
pub fn strip_peer_id(addr: &Multiaddr) -> Multiaddr {
    let mut stripped = addr.clone();
    let has_peer_id = matches!(stripped.iter().last(), Some(Protocol::P2p(_)));
    if has_peer_id {
        stripped.pop();
    }
    stripped
}

/// The IP an address leads with.
///
/// Addresses starting with anything else (DNS names, relays) return `None`,
/// even when an IP component follows later.
pub fn ip_of(addr: &Multiaddr) -> Option<IpAddr> {
    match addr.iter().next()? {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    }
}

/// Socket address of an `/ip{4,6}/.../tcp/<port>` multiaddr.
pub fn tcp_socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut iter = addr.iter();
    let ip = match iter.next()? {
        Protocol::Ip4(ip) => IpAddr::V4(ip),
        Protocol::Ip6(ip) => IpAddr::V6(ip),
        _ => return None,
    };
    match iter.next()? {
        Protocol::Tcp(port) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}
