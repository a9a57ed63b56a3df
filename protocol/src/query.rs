//! Single request/response DHT queries.
//!
//! Each call performs exactly one exchange with one peer. Responses are read
//! permissively, zero closer peers is a valid answer. Every peer found in a
//! response is registered with the network's address book so later dials know
//! where to find it.

use crate::message::{
    peer_infos_from_wire, peer_infos_to_wire, ConnectionType, Message, MessageType, Record,
    WirePeer,
};
use crate::network::{Network, NetworkError};
use crate::peer::PeerInfo;
use libp2p_identity::PeerId;
use log::debug;
use std::fmt;

/// Errors from a single DHT query.
#[derive(Debug)]
pub enum QueryError {
    /// Dialing or sending failed.
    Transport(NetworkError),
    /// The peer closed the stream without a response.
    NoResponse,
    /// The response could not be decoded or has the wrong type.
    Protocol(String),
    /// Neither a record nor closer peers were returned.
    NotFound,
    /// The local node has no address to advertise.
    NoKnownAddress,
    /// The query exceeded its time budget.
    Timeout,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Transport(err) => write!(f, "Transport failed: {err}"),
            QueryError::NoResponse => write!(f, "Peer returned no response"),
            QueryError::Protocol(reason) => write!(f, "Protocol error: {reason}"),
            QueryError::NotFound => write!(f, "Routing: not found"),
            QueryError::NoKnownAddress => {
                write!(f, "No known addresses for self, cannot put provider")
            }
            QueryError::Timeout => write!(f, "Query timed out"),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NetworkError> for QueryError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Codec(crate::codec::CodecError::Decode(e)) => {
                QueryError::Protocol(e.to_string())
            }
            NetworkError::Timeout => QueryError::Timeout,
            err => QueryError::Transport(err),
        }
    }
}

/// Answer to a GET_VALUE query.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueResponse {
    /// The peer holds the record. It may still suggest closer peers.
    Record {
        record: Record,
        closer_peers: Vec<PeerInfo>,
    },
    /// The peer does not hold the record but knows closer peers.
    CloserPeers(Vec<PeerInfo>),
}

/// Answer to a GET_PROVIDERS query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvidersResponse {
    pub providers: Vec<PeerInfo>,
    pub closer_peers: Vec<PeerInfo>,
}

/// Issues DHT queries through a [`Network`].
#[derive(Debug, Clone)]
pub struct DhtClient<N> {
    network: N,
}

impl<N: Network> DhtClient<N> {
    pub fn new(network: N) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Ask `target` for the peers it knows closest to `key`.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<PeerInfo>)` - The advertised closer peers, possibly empty.
    /// * `Err(QueryError)` - Transport failure, no response, or bad response.
    pub async fn find_closest_peers(
        &self,
        target: &PeerId,
        key: &[u8],
    ) -> Result<Vec<PeerInfo>, QueryError> {
        let response = self
            .request(target, Message::request(MessageType::FindNode, key))
            .await?;
        Ok(self.register(&response.closer_peers))
    }

    /// Ask `target` for the value stored under `key`.
    ///
    /// Fails with [`QueryError::NotFound`] if the response has neither a record
    /// nor closer peers.
    pub async fn get_value(&self, target: &PeerId, key: &[u8]) -> Result<ValueResponse, QueryError> {
        let response = self
            .request(target, Message::request(MessageType::GetValue, key))
            .await?;
        let closer_peers = self.register(&response.closer_peers);

        match response.record {
            Some(record) => Ok(ValueResponse::Record {
                record,
                closer_peers,
            }),
            None if !closer_peers.is_empty() => Ok(ValueResponse::CloserPeers(closer_peers)),
            None => Err(QueryError::NotFound),
        }
    }

    /// Ask `target` for providers of the content identified by `key`.
    pub async fn get_providers(
        &self,
        target: &PeerId,
        key: &[u8],
    ) -> Result<ProvidersResponse, QueryError> {
        let response = self
            .request(target, Message::request(MessageType::GetProviders, key))
            .await?;
        Ok(ProvidersResponse {
            providers: self.register(&response.provider_peers),
            closer_peers: self.register(&response.closer_peers),
        })
    }

    /// Liveness check at the DHT protocol level.
    pub async fn ping(&self, target: &PeerId) -> Result<(), QueryError> {
        self.request(target, Message::request(MessageType::Ping, &[]))
            .await
            .map(|_| ())
    }

    /// Build an ADD_PROVIDER message advertising the local node for `key`.
    pub fn provider_record(&self, key: &[u8]) -> Result<Message, QueryError> {
        let local = self.network.local_peer();
        if local.listen_addrs.is_empty() {
            return Err(QueryError::NoKnownAddress);
        }

        let mut message = Message::request(MessageType::AddProvider, key);
        message.provider_peers = peer_infos_to_wire(
            &[PeerInfo::new(local.id, local.listen_addrs.clone())],
            ConnectionType::Connected,
        );
        Ok(message)
    }

    /// Perform the exchange and check the response kind matches the request.
    async fn request(&self, target: &PeerId, request: Message) -> Result<Message, QueryError> {
        let expected = request.kind();
        let response = self
            .network
            .send_request(target, request)
            .await?
            .ok_or(QueryError::NoResponse)?;

        if response.kind() != expected {
            return Err(QueryError::Protocol(format!(
                "expected {expected:?} response, got type {}",
                response.r#type
            )));
        }
        Ok(response)
    }

    /// Convert wire peers and make their addresses known to the network.
    fn register(&self, peers: &[WirePeer]) -> Vec<PeerInfo> {
        let infos = peer_infos_from_wire(peers);
        let book = self.network.address_book();
        for info in &infos {
            if book.add_peer(info) {
                debug!("Learned addresses for {info}");
            }
        }
        infos
    }
}
