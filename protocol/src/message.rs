//! Kademlia DHT wire messages.
//!
//! The structs mirror the `dht.proto` schema used by libp2p DHT
//! implementations. Field tags must not change, they are the wire format.

use crate::peer::{strip_peer_id, PeerInfo};
use libp2p_identity::PeerId;
use log::debug;
use multiaddr::Multiaddr;

/// Request and response kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
}

/// Connection state the sender claims to have with a listed peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

/// A peer entry inside a DHT message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WirePeer {
    /// Binary peer identifier.
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    /// Binary multiaddrs.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(enumeration = "ConnectionType", tag = "3")]
    pub connection: i32,
}

/// A value record returned by GET_VALUE.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Record {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(string, tag = "5")]
    pub time_received: String,
}

/// The single message type exchanged by the DHT protocol.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(int32, tag = "10")]
    pub cluster_level_raw: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub record: Option<Record>,
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<WirePeer>,
    #[prost(message, repeated, tag = "9")]
    pub provider_peers: Vec<WirePeer>,
}

impl Message {
    /// Create a request of the given kind for a key.
    pub fn request(kind: MessageType, key: &[u8]) -> Self {
        Message {
            r#type: kind as i32,
            key: key.to_vec(),
            ..Default::default()
        }
    }

    /// The message kind, or `None` for values outside the schema.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.r#type).ok()
    }
}

/// Identify exchange payload, sent by both sides right after a connection opens.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Identify {
    /// Binary peer identifier of the sender.
    #[prost(bytes = "vec", tag = "1")]
    pub peer_id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub listen_addrs: Vec<Vec<u8>>,
    #[prost(string, repeated, tag = "3")]
    pub protocols: Vec<String>,
    #[prost(string, tag = "5")]
    pub protocol_version: String,
    #[prost(string, tag = "6")]
    pub agent_version: String,
}

/// Convert wire peer entries into address hints.
///
/// Entries with an undecodable identifier are skipped, as are individual
/// addresses that fail to parse. An entry with no usable address is kept.
pub fn peer_infos_from_wire(peers: &[WirePeer]) -> Vec<PeerInfo> {
    peers
        .iter()
        .filter_map(|peer| {
            let id = match PeerId::from_bytes(&peer.id) {
                Ok(id) => id,
                Err(e) => {
                    debug!("Skipping peer entry with invalid id: {e}");
                    return None;
                }
            };
            let addrs = peer
                .addrs
                .iter()
                .filter_map(|raw| match Multiaddr::try_from(raw.clone()) {
                    Ok(addr) => Some(strip_peer_id(&addr)),
                    Err(e) => {
                        debug!("Skipping invalid address for {id}: {e}");
                        None
                    }
                })
                .collect();
            Some(PeerInfo::new(id, addrs))
        })
        .collect()
}

/// Convert address hints into wire peer entries.
pub fn peer_infos_to_wire(peers: &[PeerInfo], connection: ConnectionType) -> Vec<WirePeer> {
    peers
        .iter()
        .map(|peer| WirePeer {
            id: peer.id.to_bytes(),
            addrs: peer.addrs.iter().map(|addr| addr.to_vec()).collect(),
            connection: connection as i32,
        })
        .collect()
}
