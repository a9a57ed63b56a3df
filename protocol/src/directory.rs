//! Peer directory shared by the network layer, the query layer and the recorders.
//!
//! The directory is additive only. Entries are created the first time a peer is
//! seen (seed input or a DHT response) and addresses are appended, never
//! removed, for the lifetime of a crawl run.

use crate::peer::{strip_peer_id, PeerInfo};
use dashmap::DashMap;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use std::time::Duration;

/// Weight given to a new latency sample in the moving average.
const LATENCY_EWMA_SMOOTHING: f64 = 0.1;

/// Metadata a peer advertises about itself during the identify exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerMetadata {
    /// Free-form implementation string, e.g. `go-ipfs/0.8.0/`.
    pub agent_version: Option<String>,
    /// Protocol family version, e.g. `ipfs/0.1.0`.
    pub protocol_version: Option<String>,
    /// Supported sub-protocols.
    pub protocols: Vec<String>,
}

/// A copy of everything the directory knows about one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub addrs: Vec<Multiaddr>,
    pub metadata: PeerMetadata,
}

#[derive(Debug, Default)]
struct PeerEntry {
    addrs: Vec<Multiaddr>,
    metadata: PeerMetadata,
    latency: Option<Duration>,
}

/// Concurrent peer directory keyed by peer identifier.
#[derive(Debug, Default)]
pub struct AddressBook {
    peers: DashMap<PeerId, PeerEntry>,
}

impl AddressBook {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and any addresses not yet known for it.
    ///
    /// Trailing `/p2p` components are stripped before comparison.
    ///
    /// # Returns
    ///
    /// `true` if the peer was new or at least one new address was added.
    pub fn add_addrs<I>(&self, peer: &PeerId, addrs: I) -> bool
    where
        I: IntoIterator<Item = Multiaddr>,
    {
        let mut added = false;
        let mut entry = self.peers.entry(*peer).or_insert_with(|| {
            added = true;
            PeerEntry::default()
        });

        for addr in addrs {
            let addr = strip_peer_id(&addr);
            if !entry.addrs.contains(&addr) {
                entry.addrs.push(addr);
                added = true;
            }
        }
        added
    }

    /// Register an address hint.
    pub fn add_peer(&self, info: &PeerInfo) -> bool {
        self.add_addrs(&info.id, info.addrs.iter().cloned())
    }

    /// Known addresses for a peer, in insertion order.
    pub fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.peers
            .get(peer)
            .map(|entry| entry.addrs.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Replace the identify metadata of a peer, creating the entry if needed.
    pub fn set_metadata(&self, peer: &PeerId, metadata: PeerMetadata) {
        self.peers.entry(*peer).or_default().metadata = metadata;
    }

    pub fn metadata(&self, peer: &PeerId) -> Option<PeerMetadata> {
        self.peers.get(peer).map(|entry| entry.metadata.clone())
    }

    /// Fold a round trip sample into the peer's latency moving average.
    pub fn record_latency(&self, peer: &PeerId, sample: Duration) {
        let mut entry = self.peers.entry(*peer).or_default();
        entry.latency = Some(match entry.latency {
            None => sample,
            Some(prev) => Duration::from_secs_f64(
                prev.as_secs_f64() * (1.0 - LATENCY_EWMA_SMOOTHING)
                    + sample.as_secs_f64() * LATENCY_EWMA_SMOOTHING,
            ),
        });
    }

    /// Current latency moving average, if any sample was recorded.
    pub fn latency_ewma(&self, peer: &PeerId) -> Option<Duration> {
        self.peers.get(peer).and_then(|entry| entry.latency)
    }

    /// Copy of the addresses and metadata of a peer.
    ///
    /// Unknown peers produce an empty snapshot.
    pub fn snapshot(&self, peer: &PeerId) -> PeerSnapshot {
        self.peers
            .get(peer)
            .map(|entry| PeerSnapshot {
                addrs: entry.addrs.clone(),
                metadata: entry.metadata.clone(),
            })
            .unwrap_or_default()
    }
}
