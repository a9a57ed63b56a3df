//! Startup configuration checks.
//!
//! Everything here runs before any network activity, errors are fatal.

use crate::seed::{SeedError, SeedList};
use log::{info, warn};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Errors in the crawl configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Only one of the sink dataset and table was given.
    IncompleteSink,
    /// The seed source yielded no peers.
    NoSeeds,
    /// The seed source could not be read.
    Seed(SeedError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IncompleteSink => {
                write!(f, "Sink dataset and table must be given together")
            }
            ConfigError::NoSeeds => write!(f, "No seed peers to start from"),
            ConfigError::Seed(e) => write!(f, "Invalid seed source: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Seed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SeedError> for ConfigError {
    fn from(e: SeedError) -> Self {
        ConfigError::Seed(e)
    }
}

/// Where the seed peers come from.
#[derive(Debug, Clone)]
pub enum SeedSource {
    /// The public bootstrap peers.
    Bootstrap,
    /// `/p2p/` addresses given directly.
    Inline(Vec<String>),
    /// A file with one `/p2p/` address per line.
    File(PathBuf),
    /// Reachable peers of a prior run's trials file.
    PriorRun {
        trials: PathBuf,
        within: Option<Duration>,
    },
}

impl SeedSource {
    /// Load the seeds.
    ///
    /// Individual unparsable entries are logged and skipped. A source that is
    /// unreadable or yields no peers at all is an error.
    pub async fn load(&self) -> Result<SeedList, ConfigError> {
        let mut seeds = SeedList::new();
        match self {
            SeedSource::Bootstrap => seeds = SeedList::bootstrap(),
            SeedSource::Inline(addrs) => {
                for error in seeds.add_lines(&addrs.join("\n")) {
                    warn!("{error}");
                }
            }
            SeedSource::File(path) => {
                for error in seeds.add_file(path).await? {
                    warn!("{error}");
                }
            }
            SeedSource::PriorRun { trials, within } => {
                seeds.add_prior_run(trials, *within).await?;
            }
        }

        if seeds.is_empty() {
            return Err(ConfigError::NoSeeds);
        }
        info!("Loaded {} seed peers", seeds.len());
        Ok(seeds)
    }
}

/// Identity of the sink tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub dataset: String,
    pub table: String,
    /// Create missing tables instead of failing.
    pub create: bool,
}

impl SinkConfig {
    /// Validate optional sink settings.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(SinkConfig))` - Both dataset and table were given.
    /// * `Ok(None)` - Neither was given, records are not streamed.
    /// * `Err(ConfigError)` - Only one of them was given.
    pub fn from_parts(
        dataset: Option<String>,
        table: Option<String>,
        create: bool,
    ) -> Result<Option<Self>, ConfigError> {
        match (dataset, table) {
            (Some(dataset), Some(table)) => Ok(Some(SinkConfig {
                dataset,
                table,
                create,
            })),
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteSink),
        }
    }
}
