//! Internal session coordination for crawling operations.
//!
//! This module contains the [`CrawlSession`] which orchestrates the crawling process
//! by managing the frontier and a fixed pool of query workers.

use crate::crawler::{CrawlObserver, CrawlSummary};
use crate::querier::PeerQuerier;
use dht_peers_protocol::{PeerId, PeerInfo, QueryError};
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, timeout, Instant};

/// How often progress is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a crawl session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub parallelism: usize,
    pub query_timeout: Duration,
    pub deadline: Option<Duration>,
}

/// A finished query, sent from a worker to the coordinator.
#[derive(Debug)]
struct Completion {
    peer: PeerId,
    outcome: Result<Vec<PeerInfo>, QueryError>,
    elapsed: Duration,
}

/// Internal coordinator for a crawling session.
///
/// # Architecture
///
/// * **Coordinator** (`coordinate()`) - Sole owner of the frontier and the
///   set of known peers, so neither needs a lock. Hands peers to workers and
///   processes their completions one at a time.
/// * **Workers** (`work()`) - A fixed pool pulling peers from a shared
///   dispatch channel and running one query each, bounded by the query timeout.
pub struct CrawlSession<'a, Q, O> {
    config: SessionConfig,
    querier: Q,
    observer: &'a O,
}

/// Frontier bookkeeping, only touched by the coordinator.
#[derive(Default)]
struct Frontier {
    /// Pending peers. FIFO for a breadth first walk.
    pending: VecDeque<PeerInfo>,
    /// Every identifier ever seen: pending, in flight or done.
    known: HashSet<PeerId>,
    /// Identifiers that reached a terminal state.
    completed: HashSet<PeerId>,
}

impl Frontier {
    /// Queue a peer unless it was seen before.
    fn discover(&mut self, peer: PeerInfo) -> bool {
        if self.known.insert(peer.id) {
            self.pending.push_back(peer);
            true
        } else {
            false
        }
    }
}

/// Runs queries for a worker until the dispatch channel closes.
async fn work<Q: PeerQuerier>(
    querier: Q,
    jobs: Arc<Mutex<mpsc::Receiver<PeerInfo>>>,
    done_tx: mpsc::Sender<Completion>,
    query_timeout: Duration,
) {
    loop {
        // Lock only while waiting for the next job, not during the query.
        let next = jobs.lock().await.recv().await;
        let Some(peer) = next else {
            break;
        };

        let started = Instant::now();
        let outcome = match timeout(query_timeout, querier.query(&peer)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(QueryError::Timeout),
        };
        let completion = Completion {
            peer: peer.id,
            outcome,
            elapsed: started.elapsed(),
        };
        if done_tx.send(completion).await.is_err() {
            break;
        }
    }
}

impl<'a, Q, O> CrawlSession<'a, Q, O>
where
    Q: PeerQuerier,
    O: CrawlObserver,
{
    pub fn new(config: SessionConfig, querier: Q, observer: &'a O) -> Self {
        Self {
            config,
            querier,
            observer,
        }
    }

    /// Coordinates the crawl until the frontier is exhausted or the crawl is stopped.
    ///
    /// # Termination Conditions
    ///
    /// 1. **Natural Completion** - No pending peers and no queries in flight.
    /// 2. **Deadline or closed observer** - Dispatching stops, in-flight queries
    ///    are awaited, remaining pending peers are abandoned.
    pub async fn coordinate(self, seeds: Vec<PeerInfo>) -> CrawlSummary {
        let started = Instant::now();
        let parallelism = self.config.parallelism;

        let (job_tx, job_rx) = mpsc::channel::<PeerInfo>(parallelism);
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(parallelism);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = JoinSet::new();
        for _ in 0..parallelism {
            workers.spawn(work(
                self.querier.clone(),
                job_rx.clone(),
                done_tx.clone(),
                self.config.query_timeout,
            ));
        }
        drop(done_tx);
        drop(job_rx);

        let mut frontier = Frontier::default();
        for seed in seeds {
            if !frontier.discover(seed) {
                debug!("Ignoring duplicate seed");
            }
        }
        info!(
            "Crawling from {} seeds with {} workers",
            frontier.pending.len(),
            parallelism
        );

        let deadline = self.config.deadline;
        let deadline_timer = async move {
            match deadline {
                Some(deadline) => sleep(deadline).await,
                None => pending::<()>().await,
            }
        };
        tokio::pin!(deadline_timer);
        let mut status = interval_at(started + STATUS_INTERVAL, STATUS_INTERVAL);

        let mut summary = CrawlSummary::default();
        let mut in_flight = 0usize;
        let mut expired = false;

        loop {
            let stopping = expired || self.observer.is_closed();

            while !stopping && in_flight < parallelism {
                let Some(peer) = frontier.pending.pop_front() else {
                    break;
                };
                debug!("Dispatching {}", peer.id);
                // Capacity matches the worker count, this never waits.
                if job_tx.send(peer).await.is_err() {
                    warn!("All crawl workers exited");
                    break;
                }
                in_flight += 1;
                summary.dispatched += 1;
            }

            if in_flight == 0 && (stopping || frontier.pending.is_empty()) {
                break;
            }

            tokio::select! {
                completion = done_rx.recv() => {
                    let Some(completion) = completion else {
                        warn!("Completion channel closed with {in_flight} queries in flight");
                        break;
                    };
                    in_flight -= 1;
                    self.complete(completion, &mut frontier, &mut summary).await;
                }
                _ = &mut deadline_timer, if !expired => {
                    expired = true;
                    info!("Crawl deadline reached, waiting for {in_flight} in-flight queries");
                }
                _ = status.tick() => {
                    info!(
                        "{} in flight (max: {}), {} pending, {} completed",
                        in_flight,
                        parallelism,
                        frontier.pending.len(),
                        frontier.completed.len()
                    );
                }
            }
        }

        summary.abandoned = frontier.pending.len();
        summary.elapsed = started.elapsed();

        // Closing the dispatch channel releases the workers.
        drop(job_tx);
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!("Crawl worker failed: {e}");
            }
        }

        info!("Crawl finished: {summary}");
        summary
    }

    /// Record a terminal outcome and grow the frontier.
    async fn complete(
        &self,
        completion: Completion,
        frontier: &mut Frontier,
        summary: &mut CrawlSummary,
    ) {
        let Completion {
            peer,
            outcome,
            elapsed,
        } = completion;

        // Dispatch is deduplicated, a second completion means that broke.
        assert!(
            frontier.completed.insert(peer),
            "peer {peer} completed twice"
        );

        match outcome {
            Ok(neighbors) => {
                summary.succeeded += 1;
                let mut new_peers = 0;
                for neighbor in &neighbors {
                    if frontier.discover(neighbor.clone()) {
                        new_peers += 1;
                    }
                }
                debug!(
                    "{peer} returned {} neighbors ({new_peers} new) in {elapsed:?}",
                    neighbors.len()
                );
                self.observer.on_peer_success(&peer, &neighbors).await;
            }
            Err(e) => {
                summary.failed += 1;
                debug!("Query to {peer} failed after {elapsed:?}: {e}");
                self.observer.on_peer_failure(&peer, &e).await;
            }
        }
    }
}
