//! Example of using the dht-peers crawler.

use clap::Parser;
use dht_peers_crawler::{
    write_edges, write_nodes, write_trials, AddressBook, CrawlReport, CrawlerBuilder,
    DialRecorder, LocalPeer, NdjsonSink, PeerId, Pinger, Pipeline, Recorder, SeedSource,
    Sink, SinkConfig, TcpNetwork,
};
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Seed peer as a /p2p/ multiaddr, may be repeated.
    #[arg(short, long)]
    seed: Vec<String>,

    /// File with one seed multiaddr per line.
    #[arg(long)]
    seed_file: Option<PathBuf>,

    /// Seed from the reachable peers of a prior run's trials file.
    #[arg(long)]
    prior_trials: Option<PathBuf>,

    /// Only use prior run trials observed within this many hours.
    #[arg(long)]
    prior_window_hours: Option<u64>,

    /// Maximum number of concurrent queries.
    #[arg(short, long, default_value = "1000")]
    parallelism: usize,

    /// Timeout per peer query in seconds.
    #[arg(short, long, default_value = "20")]
    timeout: u64,

    /// Overall crawl deadline in seconds.
    #[arg(long, default_value = "72000")]
    deadline: u64,

    /// FIND_NODE requests per peer.
    #[arg(long, default_value = "1")]
    lookups: usize,

    /// Prefix of the output files.
    #[arg(short, long, default_value = "crawl")]
    output: PathBuf,

    /// Also write the neighbor graph as an edge list.
    #[arg(long)]
    edges: bool,

    /// Sink dataset directory, requires --table.
    #[arg(long)]
    dataset: Option<String>,

    /// Sink table name, requires --dataset.
    #[arg(long)]
    table: Option<String>,

    /// Create missing sink tables.
    #[arg(long)]
    create_tables: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn seed_source(&self) -> SeedSource {
        if let Some(trials) = &self.prior_trials {
            SeedSource::PriorRun {
                trials: trials.clone(),
                within: self
                    .prior_window_hours
                    .map(|hours| Duration::from_secs(hours * 3600)),
            }
        } else if let Some(path) = &self.seed_file {
            SeedSource::File(path.clone())
        } else if !self.seed.is_empty() {
            SeedSource::Inline(self.seed.clone())
        } else {
            SeedSource::Bootstrap
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = if args.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // Configure fern logger
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()?;

    log::info!("CRAWLING THE DHT");

    // Configuration errors are fatal before touching the network.
    let sink_config =
        SinkConfig::from_parts(args.dataset.clone(), args.table.clone(), args.create_tables)?;
    let seeds = args.seed_source().load().await?;

    let pipeline = match &sink_config {
        Some(config) => {
            let sink = NdjsonSink::new(&config.dataset, &config.table);
            sink.ensure_tables(config.create).await?;
            Some(Pipeline::start(sink))
        }
        None => None,
    };

    let book = Arc::new(AddressBook::new());
    let dial_recorder = Arc::new(DialRecorder::new(book.clone()));
    let network = TcpNetwork::new(
        LocalPeer::new(PeerId::random()),
        book.clone(),
        Some(dial_recorder.clone()),
    );
    let pinger: Arc<dyn Pinger> = Arc::new(network.clone());
    dial_recorder.attach_pinger(&pinger);

    let recorder = match &pipeline {
        Some(pipeline) => Recorder::with_pipeline(book.clone(), pipeline.node_sender()),
        None => Recorder::new(book.clone()),
    };

    let crawler = CrawlerBuilder::new()
        .with_parallelism(args.parallelism)?
        .with_query_timeout(Duration::from_secs(args.timeout))
        .with_deadline(Some(Duration::from_secs(args.deadline)))
        .with_lookups(args.lookups)?
        .build(network);

    tokio::select! {
        summary = crawler.run(seeds.into_peers(), &recorder) => log::info!("{summary}"),
        _ = tokio::signal::ctrl_c() => log::warn!("Interrupted, writing partial results"),
    }

    // Latency probes of the last peers may still be running.
    dial_recorder.settle().await;
    let nodes = recorder.nodes();
    let trials = dial_recorder.snapshot();

    let path = write_nodes(&args.output, &nodes).await?;
    log::info!("Wrote {} nodes to {}", nodes.len(), path.display());
    let path = write_trials(&args.output, &trials).await?;
    log::info!("Wrote {} trials to {}", trials.len(), path.display());
    if args.edges {
        let path = write_edges(&args.output, &nodes).await?;
        log::info!("Wrote edges to {}", path.display());
    }

    if let Some(pipeline) = pipeline {
        let stats = pipeline.finish(trials.clone()).await;
        log::info!("Sink: {stats:?}");
    }

    CrawlReport::new(&nodes, &trials).log();

    Ok(())
}
