//! Seams between the crawler and the network layer.
//!
//! The network layer owns sockets, handshakes and streams. The crawler only
//! needs three capabilities from it, each a trait here.
//!
//! * [`Network`] - send one DHT request to a peer and get one response back.
//! * [`ConnectionGate`] - a hook consulted before every dial and notified of
//!   every connection lifecycle event.
//! * [`Pinger`] - an application level round trip probe.

use crate::codec::CodecError;
use crate::directory::AddressBook;
use crate::message::Message;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::time::Duration;

/// An owned, boxed future, used where trait objects need async methods.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Errors raised by the network layer while dialing or exchanging messages.
#[derive(Debug)]
pub enum NetworkError {
    /// An I/O error occurred during network operations.
    Io(io::Error),
    /// Framing or message decoding failed.
    Codec(CodecError),
    /// The directory has no address for the peer.
    NoAddresses(PeerId),
    /// Every known address of the peer failed to dial.
    DialFailed(PeerId),
    /// The address cannot be dialed by this transport.
    UnsupportedAddress(Multiaddr),
    /// The connection gate refused the dial.
    DialDenied(PeerId),
    /// The remote identified as a different peer than the one dialed.
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    /// The dial or exchange took longer than allowed.
    Timeout,
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Io(err) => write!(f, "Network error: {err}"),
            NetworkError::Codec(err) => write!(f, "Stream codec failed: {err}"),
            NetworkError::NoAddresses(peer) => write!(f, "No known addresses for {peer}"),
            NetworkError::DialFailed(peer) => write!(f, "All dials to {peer} failed"),
            NetworkError::UnsupportedAddress(addr) => {
                write!(f, "Unsupported address for this transport: {addr}")
            }
            NetworkError::DialDenied(peer) => write!(f, "Dial to {peer} denied by gate"),
            NetworkError::PeerIdMismatch { expected, actual } => {
                write!(f, "Dialed {expected} but remote identified as {actual}")
            }
            NetworkError::Timeout => write!(f, "Network operation timed out"),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetworkError::Io(err) => Some(err),
            NetworkError::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Io(err)
    }
}

impl From<CodecError> for NetworkError {
    fn from(err: CodecError) -> Self {
        NetworkError::Codec(err)
    }
}

/// Describes the local node to remote peers.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pub id: PeerId,
    /// Externally reachable addresses. Empty for a dial-only crawler.
    pub listen_addrs: Vec<Multiaddr>,
    pub agent_version: String,
    pub protocol_version: String,
    pub protocols: Vec<String>,
}

impl LocalPeer {
    /// A dial-only local peer with the crate's default identify strings.
    pub fn new(id: PeerId) -> Self {
        LocalPeer {
            id,
            listen_addrs: Vec::new(),
            agent_version: concat!("dht-peers/", env!("CARGO_PKG_VERSION")).to_string(),
            protocol_version: "ipfs/0.1.0".to_string(),
            protocols: vec![crate::KAD_PROTOCOL.to_string()],
        }
    }
}

/// Identifies one underlying connection to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    /// Unique per network layer instance.
    pub id: u64,
    pub peer: PeerId,
    /// The address the connection was established on.
    pub remote_addr: Multiaddr,
}

/// Aggregate connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    NotConnected,
    Connected,
}

/// The request/response capability the query layer needs from the network.
pub trait Network: Clone + Send + Sync + 'static {
    /// The local node.
    fn local_peer(&self) -> &LocalPeer;

    /// The shared peer directory the network dials from.
    fn address_book(&self) -> &AddressBook;

    /// Send one DHT request to a peer and wait for its response.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(message))` - The peer responded.
    /// * `Ok(None)` - The peer closed the stream without responding.
    /// * `Err(NetworkError)` - Dialing or the exchange failed.
    fn send_request(
        &self,
        peer: &PeerId,
        request: Message,
    ) -> impl Future<Output = Result<Option<Message>, NetworkError>> + Send;
}

/// Hook consulted by the network layer on every connection event.
///
/// The `intercept_*` methods are permission checks and are called before the
/// corresponding step. The remaining methods are notifications. All methods
/// are called inline on the network layer's tasks and must return promptly.
pub trait ConnectionGate: Send + Sync {
    /// Called before any dial to a peer.
    fn intercept_peer_dial(&self, peer: &PeerId) -> bool;

    /// Called before dialing each individual address of a peer.
    fn intercept_addr_dial(&self, peer: &PeerId, addr: &Multiaddr) -> bool;

    /// Called once the remote proved its identity.
    fn intercept_secured(&self, peer: &PeerId, addr: &Multiaddr) -> bool;

    /// Called once the connection is ready to carry protocol streams.
    fn intercept_upgraded(&self, conn: &ConnectionInfo) -> bool;

    /// A dial to one address failed before a connection existed.
    fn dial_failed(&self, peer: &PeerId, addr: &Multiaddr, error: &NetworkError);

    /// A connection was established.
    fn connected(&self, conn: &ConnectionInfo);

    /// A connection was closed.
    fn disconnected(&self, conn: &ConnectionInfo);

    /// The aggregate state of a peer changed. `conns` lists its open connections.
    fn connectedness_changed(
        &self,
        peer: &PeerId,
        connectedness: Connectedness,
        conns: &[ConnectionInfo],
    );
}

/// Application level round trip probe.
pub trait Pinger: Send + Sync {
    /// Measure a round trip to the peer behind a connection.
    fn ping(&self, conn: &ConnectionInfo) -> BoxFuture<Result<Duration, NetworkError>>;
}
