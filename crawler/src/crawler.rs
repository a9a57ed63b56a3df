use crate::querier::PeerQuerier;
use crate::session::{CrawlSession, SessionConfig};
use dht_peers_protocol::{PeerId, PeerInfo, QueryError};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver};

/// Messages sent from the [`Crawler`] to the caller about crawled peers.
#[derive(Debug, Clone)]
pub enum CrawlerMessage {
    /// A peer answered and returned its neighbors.
    Succeeded {
        peer: PeerId,
        neighbors: Vec<PeerInfo>,
    },
    /// A peer could not be queried.
    Failed { peer: PeerId, error: String },
}

impl fmt::Display for CrawlerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlerMessage::Succeeded { peer, neighbors } => {
                write!(f, "Crawled {peer}: {} neighbors", neighbors.len())
            }
            CrawlerMessage::Failed { peer, error } => write!(f, "Failed {peer}: {error}"),
        }
    }
}

/// Receives the terminal outcome of every crawled peer.
///
/// Each peer identifier is reported exactly once per crawl, through one of the
/// two callbacks. Callbacks are awaited by the crawl's coordinating loop, so a
/// slow observer slows dispatching down.
pub trait CrawlObserver: Send + Sync {
    /// The peer answered with the given neighbors.
    fn on_peer_success(
        &self,
        peer: &PeerId,
        neighbors: &[PeerInfo],
    ) -> impl Future<Output = ()> + Send;

    /// The peer could not be queried.
    fn on_peer_failure(&self, peer: &PeerId, error: &QueryError) -> impl Future<Output = ()> + Send;

    /// Whether the observer lost interest. A closed observer stops the crawl
    /// the same way the deadline does.
    fn is_closed(&self) -> bool {
        false
    }
}

impl CrawlObserver for mpsc::Sender<CrawlerMessage> {
    fn on_peer_success(
        &self,
        peer: &PeerId,
        neighbors: &[PeerInfo],
    ) -> impl Future<Output = ()> + Send {
        let message = CrawlerMessage::Succeeded {
            peer: *peer,
            neighbors: neighbors.to_vec(),
        };
        async move {
            // Receiver dropped, the crawl stops on the next is_closed check.
            let _ = self.send(message).await;
        }
    }

    fn on_peer_failure(&self, peer: &PeerId, error: &QueryError) -> impl Future<Output = ()> + Send {
        let message = CrawlerMessage::Failed {
            peer: *peer,
            error: error.to_string(),
        };
        async move {
            let _ = self.send(message).await;
        }
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

/// Counters describing a finished crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Peers handed to a worker.
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Known peers never dispatched because the crawl stopped early.
    pub abandoned: usize,
    pub elapsed: Duration,
}

impl fmt::Display for CrawlSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} peers queried ({} succeeded, {} failed), {} abandoned, took {:?}",
            self.dispatched, self.succeeded, self.failed, self.abandoned, self.elapsed
        )
    }
}

/// A crawler for a Kademlia DHT network.
///
/// The crawler queries every peer reachable from the seeds exactly once,
/// with a bounded number of queries in flight.
#[derive(Debug, Clone)]
pub struct Crawler<Q> {
    querier: Q,
    config: SessionConfig,
}

impl<Q: PeerQuerier> Crawler<Q> {
    pub(crate) fn new(querier: Q, config: SessionConfig) -> Self {
        Crawler { querier, config }
    }

    pub fn querier(&self) -> &Q {
        &self.querier
    }

    /// Crawl the network starting from the seeds, reporting to `observer`.
    ///
    /// # Termination
    ///
    /// * **Natural completion** - Every discovered peer has been queried.
    /// * **Deadline** - No new queries are dispatched once the deadline passes,
    ///   the crawl returns when the in-flight ones resolve.
    /// * **Closed observer** - Same as the deadline.
    ///
    /// # Arguments
    ///
    /// * `seeds` - Peers to start from. Duplicate identifiers are crawled once.
    /// * `observer` - Receives one callback per crawled peer.
    pub async fn run<O: CrawlObserver>(&self, seeds: Vec<PeerInfo>, observer: &O) -> CrawlSummary {
        CrawlSession::new(self.config.clone(), self.querier.clone(), observer)
            .coordinate(seeds)
            .await
    }

    /// Crawl in a background task, streaming outcomes through a channel.
    ///
    /// The channel closes when the crawl is complete. Dropping the receiver
    /// stops the crawl.
    pub fn crawl(&self, seeds: Vec<PeerInfo>) -> Receiver<CrawlerMessage> {
        let (crawl_tx, crawl_rx) = mpsc::channel(1000);
        let crawler = self.clone();
        tokio::spawn(async move {
            crawler.run(seeds, &crawl_tx).await;
        });
        crawl_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CrawlerBuilder;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::{sleep, Instant};

    /// Querier answering from a fixed neighbor graph after a delay.
    ///
    /// Peers missing from the graph fail with `NoResponse`.
    #[derive(Clone)]
    struct MockQuerier {
        graph: Arc<HashMap<PeerId, Vec<PeerId>>>,
        delay: Duration,
        queried: Arc<Mutex<Vec<PeerId>>>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    impl MockQuerier {
        fn new(graph: HashMap<PeerId, Vec<PeerId>>, delay: Duration) -> Self {
            MockQuerier {
                graph: Arc::new(graph),
                delay,
                queried: Arc::new(Mutex::new(Vec::new())),
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn queried(&self) -> Vec<PeerId> {
            self.queried.lock().unwrap().clone()
        }
    }

    impl PeerQuerier for MockQuerier {
        fn query(
            &self,
            peer: &PeerInfo,
        ) -> impl Future<Output = Result<Vec<PeerInfo>, QueryError>> + Send {
            let querier = self.clone();
            let id = peer.id;
            async move {
                querier.queried.lock().unwrap().push(id);
                let now = querier.active.fetch_add(1, Ordering::SeqCst) + 1;
                querier.max_active.fetch_max(now, Ordering::SeqCst);

                sleep(querier.delay).await;
                querier.active.fetch_sub(1, Ordering::SeqCst);

                match querier.graph.get(&id) {
                    Some(neighbors) => Ok(neighbors
                        .iter()
                        .map(|n| PeerInfo::new(*n, Vec::new()))
                        .collect()),
                    None => Err(QueryError::NoResponse),
                }
            }
        }
    }

    /// Observer collecting callbacks.
    #[derive(Default)]
    struct Outcomes {
        succeeded: Mutex<HashMap<PeerId, HashSet<PeerId>>>,
        failed: Mutex<Vec<PeerId>>,
    }

    impl CrawlObserver for Outcomes {
        fn on_peer_success(
            &self,
            peer: &PeerId,
            neighbors: &[PeerInfo],
        ) -> impl Future<Output = ()> + Send {
            self.succeeded
                .lock()
                .unwrap()
                .insert(*peer, neighbors.iter().map(|n| n.id).collect());
            async {}
        }

        fn on_peer_failure(
            &self,
            peer: &PeerId,
            _error: &QueryError,
        ) -> impl Future<Output = ()> + Send {
            self.failed.lock().unwrap().push(*peer);
            async {}
        }
    }

    fn seeds(ids: &[PeerId]) -> Vec<PeerInfo> {
        ids.iter().map(|id| PeerInfo::new(*id, Vec::new())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_neighbors_fail_once() {
        let p1 = PeerId::random();
        let p2 = PeerId::random();
        let p3 = PeerId::random();
        let graph = HashMap::from([(p1, vec![p2, p3])]);
        let querier = MockQuerier::new(graph, Duration::from_millis(10));
        let crawler = CrawlerBuilder::new().build_with_querier(querier.clone());
        let outcomes = Outcomes::default();

        let summary = crawler.run(seeds(&[p1]), &outcomes).await;

        assert_eq!(summary.dispatched, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.abandoned, 0);

        let succeeded = outcomes.succeeded.lock().unwrap();
        assert_eq!(succeeded[&p1], HashSet::from([p2, p3]));
        let mut failed = outcomes.failed.lock().unwrap().clone();
        failed.sort();
        let mut expected = vec![p2, p3];
        expected.sort();
        assert_eq!(failed, expected);
        assert_eq!(querier.queried().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cyclic_graph_visits_each_peer_once() {
        let ids: Vec<PeerId> = (0..20).map(|_| PeerId::random()).collect();
        // Everyone knows everyone, including themselves.
        let graph = ids.iter().map(|id| (*id, ids.clone())).collect();
        let querier = MockQuerier::new(graph, Duration::from_millis(5));
        let crawler = CrawlerBuilder::new()
            .with_parallelism(4)
            .unwrap()
            .build_with_querier(querier.clone());
        let outcomes = Outcomes::default();

        // Seed the same peer twice.
        let summary = crawler.run(seeds(&[ids[0], ids[0]]), &outcomes).await;

        assert_eq!(summary.dispatched, ids.len());
        assert_eq!(summary.succeeded, ids.len());
        let queried: HashSet<PeerId> = querier.queried().into_iter().collect();
        assert_eq!(queried.len(), querier.queried().len());
        assert_eq!(outcomes.succeeded.lock().unwrap().len(), ids.len());
        assert!(querier.max_active.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_one_is_sequential() {
        let ids = [PeerId::random(), PeerId::random(), PeerId::random()];
        let graph = ids.iter().map(|id| (*id, Vec::new())).collect();
        let querier = MockQuerier::new(graph, Duration::from_secs(1));
        let crawler = CrawlerBuilder::new()
            .with_parallelism(1)
            .unwrap()
            .build_with_querier(querier.clone());

        let started = Instant::now();
        let summary = crawler.run(seeds(&ids), &Outcomes::default()).await;

        assert_eq!(summary.succeeded, 3);
        assert_eq!(querier.max_active.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_timeout_is_a_failure() {
        let p1 = PeerId::random();
        let graph = HashMap::from([(p1, Vec::new())]);
        let querier = MockQuerier::new(graph, Duration::from_secs(60));
        let crawler = CrawlerBuilder::new()
            .with_query_timeout(Duration::from_secs(5))
            .build_with_querier(querier);
        let outcomes = Outcomes::default();

        let started = Instant::now();
        let summary = crawler.run(seeds(&[p1]), &outcomes).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(*outcomes.failed.lock().unwrap(), vec![p1]);
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_waits_for_in_flight() {
        let ids: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        let graph = ids.iter().map(|id| (*id, Vec::new())).collect();
        let querier = MockQuerier::new(graph, Duration::from_secs(3));
        let crawler = CrawlerBuilder::new()
            .with_parallelism(1)
            .unwrap()
            .with_deadline(Some(Duration::from_secs(5)))
            .build_with_querier(querier);

        let started = Instant::now();
        let summary = crawler.run(seeds(&ids), &Outcomes::default()).await;

        // Dispatched at 0s and 3s, the second resolves after the deadline.
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.abandoned, 2);
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert!(started.elapsed() < Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_crawl_streams_messages() {
        let p1 = PeerId::random();
        let p2 = PeerId::random();
        let graph = HashMap::from([(p1, vec![p2]), (p2, Vec::new())]);
        let crawler = CrawlerBuilder::new()
            .build_with_querier(MockQuerier::new(graph, Duration::from_millis(1)));

        let mut rx = crawler.crawl(seeds(&[p1]));
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }

        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| matches!(m, CrawlerMessage::Succeeded { .. })));
        assert!(messages[0].to_string().contains(&p1.to_string()));
    }
}
