//! Turns crawl outcomes into [`Node`] records.

use crate::crawler::CrawlObserver;
use crate::record::Node;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dht_peers_protocol::{AddressBook, PeerId, PeerInfo, QueryError};
use log::warn;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Builds one [`Node`] per crawled peer, optionally streaming it to a pipeline.
pub struct Recorder {
    book: Arc<AddressBook>,
    nodes: DashMap<PeerId, Node>,
    node_tx: Option<mpsc::Sender<Node>>,
}

impl Recorder {
    /// A recorder keeping nodes in memory only.
    pub fn new(book: Arc<AddressBook>) -> Self {
        Recorder {
            book,
            nodes: DashMap::new(),
            node_tx: None,
        }
    }

    /// A recorder that also forwards every node, e.g. to [`crate::Pipeline::node_sender`].
    pub fn with_pipeline(book: Arc<AddressBook>, node_tx: mpsc::Sender<Node>) -> Self {
        Recorder {
            book,
            nodes: DashMap::new(),
            node_tx: Some(node_tx),
        }
    }

    /// All nodes recorded so far, ordered by peer identifier.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        nodes
    }

    pub fn node(&self, peer: &PeerId) -> Option<Node> {
        self.nodes.get(peer).map(|node| node.clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Build and store the node of a peer.
    ///
    /// # Panics
    ///
    /// If the peer already has a node. Every peer completes once per crawl.
    fn record(&self, peer: &PeerId, neighbors: BTreeSet<PeerId>, error: Option<String>) -> Node {
        let snapshot = self.book.snapshot(peer);
        let node = Node {
            peer_id: *peer,
            observed: Utc::now(),
            addresses: snapshot.addrs.iter().map(|addr| addr.to_string()).collect(),
            user_agent: snapshot.metadata.agent_version,
            protocol_version: snapshot.metadata.protocol_version,
            protocols: snapshot.metadata.protocols,
            neighbors,
            error,
        };

        match self.nodes.entry(*peer) {
            Entry::Occupied(_) => panic!("peer {peer} completed twice"),
            Entry::Vacant(entry) => {
                entry.insert(node.clone());
            }
        }
        node
    }

    async fn forward(&self, node: Node) {
        if let Some(node_tx) = &self.node_tx {
            let peer = node.peer_id;
            if node_tx.send(node).await.is_err() {
                warn!("Pipeline closed, node record for {peer} not uploaded");
            }
        }
    }
}

impl CrawlObserver for Recorder {
    fn on_peer_success(
        &self,
        peer: &PeerId,
        neighbors: &[PeerInfo],
    ) -> impl Future<Output = ()> + Send {
        let neighbors = neighbors.iter().map(|info| info.id).collect();
        let node = self.record(peer, neighbors, None);
        self.forward(node)
    }

    fn on_peer_failure(&self, peer: &PeerId, error: &QueryError) -> impl Future<Output = ()> + Send {
        let node = self.record(peer, BTreeSet::new(), Some(error.to_string()));
        self.forward(node)
    }
}
