//! Builder pattern for configuring and creating crawler instances.

use crate::crawler::Crawler;
use crate::querier::{DhtQuerier, PeerQuerier};
use crate::session::SessionConfig;
use dht_peers_protocol::Network;
use std::fmt;
use std::time::Duration;

/// Default maximum number of concurrent queries.
const DEFAULT_PARALLELISM: usize = 1000;
/// Default timeout for a single peer query.
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(20);
/// Default bound on a whole crawl.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(20 * 60 * 60);
/// Default FIND_NODE requests per peer.
const DEFAULT_LOOKUPS: usize = 1;

/// Errors that can occur during crawler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlerBuilderError {
    /// At least one query must be allowed in flight.
    ZeroParallelism,
    /// Each peer needs at least one lookup.
    ZeroLookups,
}

impl fmt::Display for CrawlerBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlerBuilderError::ZeroParallelism => write!(f, "Parallelism must be at least 1"),
            CrawlerBuilderError::ZeroLookups => write!(f, "Lookups per peer must be at least 1"),
        }
    }
}

impl std::error::Error for CrawlerBuilderError {}

/// Builder for creating a customized [`Crawler`] instance.
///
/// # Example
///
/// ```
/// # fn main() -> Result<(), dht_peers_crawler::CrawlerBuilderError> {
/// use dht_peers_crawler::CrawlerBuilder;
/// use std::time::Duration;
///
/// let builder = CrawlerBuilder::new()
///     .with_parallelism(64)?
///     .with_query_timeout(Duration::from_secs(10))
///     .with_deadline(Some(Duration::from_secs(3600)))
///     .with_lookups(2)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CrawlerBuilder {
    /// Maximum number of concurrent queries.
    parallelism: usize,
    /// Timeout for a single peer query.
    query_timeout: Duration,
    /// Bound on the whole crawl, `None` runs until the frontier is exhausted.
    deadline: Option<Duration>,
    /// FIND_NODE requests per peer.
    lookups: usize,
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlerBuilder {
    /// Create a new crawler builder with default settings.
    pub fn new() -> Self {
        CrawlerBuilder {
            parallelism: DEFAULT_PARALLELISM,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            deadline: Some(DEFAULT_DEADLINE),
            lookups: DEFAULT_LOOKUPS,
        }
    }

    /// Set the maximum number of concurrent queries.
    ///
    /// This is the size of the worker pool and the only bound on outbound
    /// requests. Higher values speed up crawling but increase resource usage
    /// and network load.
    ///
    /// # Arguments
    ///
    /// * `parallelism` - Number of workers (defaults to 1000).
    ///
    /// # Returns
    ///
    /// * `Ok(Self)` - The builder for method chaining.
    /// * `Err(CrawlerBuilderError)` - If `parallelism` is zero.
    pub fn with_parallelism(mut self, parallelism: usize) -> Result<Self, CrawlerBuilderError> {
        if parallelism == 0 {
            return Err(CrawlerBuilderError::ZeroParallelism);
        }
        self.parallelism = parallelism;
        Ok(self)
    }

    /// Set the timeout for a single peer query.
    ///
    /// The timeout covers dialing, the identify exchange and every lookup
    /// against the peer. A peer exceeding it is recorded as failed.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time per peer (defaults to 20 seconds).
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set the overall crawl deadline.
    ///
    /// Once it elapses no new queries are dispatched. The crawl still waits
    /// for in-flight queries, so it can overrun by up to one query timeout.
    ///
    /// # Arguments
    ///
    /// * `deadline` - Bound on the crawl (defaults to 20 hours), `None` for no bound.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the number of random-key FIND_NODE requests made to each peer.
    ///
    /// More lookups walk more of each peer's routing table.
    ///
    /// # Returns
    ///
    /// * `Ok(Self)` - The builder for method chaining.
    /// * `Err(CrawlerBuilderError)` - If `lookups` is zero.
    pub fn with_lookups(mut self, lookups: usize) -> Result<Self, CrawlerBuilderError> {
        if lookups == 0 {
            return Err(CrawlerBuilderError::ZeroLookups);
        }
        self.lookups = lookups;
        Ok(self)
    }

    /// Build a crawler querying the DHT through `network`.
    pub fn build<N: Network>(self, network: N) -> Crawler<DhtQuerier<N>> {
        let querier = DhtQuerier::new(network, self.lookups);
        self.build_with_querier(querier)
    }

    /// Build a crawler around a custom querier.
    pub fn build_with_querier<Q: PeerQuerier>(self, querier: Q) -> Crawler<Q> {
        Crawler::new(
            querier,
            SessionConfig {
                parallelism: self.parallelism,
                query_timeout: self.query_timeout,
                deadline: self.deadline,
            },
        )
    }
}
