//! The per-peer work a crawl worker performs.

use dht_peers_protocol::{DhtClient, Network, PeerId, PeerInfo, QueryError};
use log::debug;
use std::collections::BTreeMap;
use std::future::Future;

/// Asks one peer for its neighbors.
///
/// This trait is the seam between the scheduler and the query layer, allowing
/// for easy testing with mock implementations.
pub trait PeerQuerier: Clone + Send + Sync + 'static {
    /// Query a peer for the peers it knows.
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<PeerInfo>)` - The discovered neighbors, possibly empty.
    /// * `Err(QueryError)` - The peer could not be queried.
    fn query(
        &self,
        peer: &PeerInfo,
    ) -> impl Future<Output = Result<Vec<PeerInfo>, QueryError>> + Send;
}

/// Crawls a peer's routing table with FIND_NODE requests for random keys.
#[derive(Clone)]
pub struct DhtQuerier<N> {
    client: DhtClient<N>,
    /// FIND_NODE requests per peer.
    lookups: usize,
}

impl<N: Network> DhtQuerier<N> {
    pub fn new(network: N, lookups: usize) -> Self {
        DhtQuerier {
            client: DhtClient::new(network),
            lookups,
        }
    }

    pub fn client(&self) -> &DhtClient<N> {
        &self.client
    }

    async fn crawl_peer(&self, peer: &PeerInfo) -> Result<Vec<PeerInfo>, QueryError> {
        // Seeds only exist in the caller's list until registered here.
        self.client.network().address_book().add_peer(peer);

        let mut found: BTreeMap<PeerId, PeerInfo> = BTreeMap::new();
        for _ in 0..self.lookups {
            let key: [u8; 32] = rand::random();
            for info in self.client.find_closest_peers(&peer.id, &key).await? {
                let entry = found
                    .entry(info.id)
                    .or_insert_with(|| PeerInfo::new(info.id, Vec::new()));
                for addr in info.addrs {
                    if !entry.addrs.contains(&addr) {
                        entry.addrs.push(addr);
                    }
                }
            }
        }

        debug!("{} returned {} distinct peers", peer.id, found.len());
        Ok(found.into_values().collect())
    }
}

impl<N: Network> PeerQuerier for DhtQuerier<N> {
    fn query(
        &self,
        peer: &PeerInfo,
    ) -> impl Future<Output = Result<Vec<PeerInfo>, QueryError>> + Send {
        let querier = self.clone();
        let peer = peer.clone();
        async move { querier.crawl_peer(&peer).await }
    }
}
