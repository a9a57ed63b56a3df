//! Kademlia DHT crawler.
//!
//! Walks a DHT network from a set of seed peers, asking every reachable peer
//! for its routing table. Per peer outcomes become [`Node`] records, per
//! address dial histories become [`Trial`] records.

mod builder;
mod config;
mod crawler;
mod dial;
mod output;
mod pipeline;
mod querier;
mod record;
mod recorder;
mod report;
mod seed;
mod session;
mod sink;

pub use builder::{CrawlerBuilder, CrawlerBuilderError};
pub use config::{ConfigError, SeedSource, SinkConfig};
pub use crawler::{CrawlObserver, CrawlSummary, Crawler, CrawlerMessage};
pub use dial::DialRecorder;
pub use output::{
    edges_path, nodes_path, read_nodes, read_trials, trials_path, write_edges, write_nodes,
    write_trials, OutputError,
};
pub use pipeline::{Pipeline, PipelineStats, QUEUE_CAPACITY, TRIAL_BATCH_SIZE};
pub use querier::{DhtQuerier, PeerQuerier};
pub use record::{DialAttempt, Node, Trial};
pub use recorder::Recorder;
pub use report::CrawlReport;
pub use seed::{SeedError, SeedList, BOOTSTRAP_PEERS};
pub use sink::{NdjsonSink, Sink, SinkError};

// Re-exports.
pub use dht_peers_protocol::{
    AddressBook, LocalPeer, Multiaddr, NetworkError, PeerId, PeerInfo, Pinger, QueryError,
    TcpNetwork,
};
