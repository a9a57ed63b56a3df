//! Kademlia DHT peer protocol.
//!
//! Wire messages, stream framing, a shared peer directory and the traits the
//! crawler uses to talk to the network. [`TcpNetwork`] is a plaintext
//! implementation of those traits.

mod codec;
mod directory;
mod message;
mod network;
mod peer;
mod query;
mod tcp;

/// Protocol identifier of the Kademlia DHT.
pub const KAD_PROTOCOL: &str = "/ipfs/kad/1.0.0";

pub use codec::{encode_frame, CodecError, FrameReader, FrameWriter, Framed, MAX_FRAME_SIZE};
pub use directory::{AddressBook, PeerMetadata, PeerSnapshot};
pub use message::{
    peer_infos_from_wire, peer_infos_to_wire, ConnectionType, Identify, Message, MessageType,
    Record, WirePeer,
};
pub use network::{
    BoxFuture, Connectedness, ConnectionGate, ConnectionInfo, LocalPeer, Network, NetworkError,
    Pinger,
};
pub use peer::{ip_of, strip_peer_id, tcp_socket_addr, PeerAddrError, PeerInfo};
pub use query::{DhtClient, ProvidersResponse, QueryError, ValueResponse};
pub use tcp::{TcpNetwork, DEFAULT_DIAL_TIMEOUT};

pub use libp2p_identity::PeerId;
pub use multiaddr::{Multiaddr, Protocol};
