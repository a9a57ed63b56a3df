//! Durable destinations for crawl records.

use crate::record::{Node, Trial};
use log::info;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Errors raised by a [`Sink`].
#[derive(Debug)]
pub enum SinkError {
    Io(io::Error),
    Serialize(serde_json::Error),
    /// The table does not exist and creation was not requested.
    MissingTable(PathBuf),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Io(e) => write!(f, "Sink I/O error: {e}"),
            SinkError::Serialize(e) => write!(f, "Failed to serialize record: {e}"),
            SinkError::MissingTable(path) => {
                write!(f, "Table {} does not exist", path.display())
            }
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Io(e) => Some(e),
            SinkError::Serialize(e) => Some(e),
            SinkError::MissingTable(_) => None,
        }
    }
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        SinkError::Io(e)
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        SinkError::Serialize(e)
    }
}

/// Append-only store for node and trial records.
pub trait Sink: Send + Sync {
    /// Check the node and trial tables exist, creating them if `create` is set.
    fn ensure_tables(&self, create: bool) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn insert_node(&self, node: &Node) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn insert_trials(&self, trials: &[Trial]) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Sink writing newline-delimited JSON tables into a dataset directory.
///
/// Tables are `<dataset>/<table>_node.ndjson` and `<dataset>/<table>_trial.ndjson`.
#[derive(Debug, Clone)]
pub struct NdjsonSink {
    dataset: PathBuf,
    node_path: PathBuf,
    trial_path: PathBuf,
}

impl NdjsonSink {
    pub fn new(dataset: impl Into<PathBuf>, table: &str) -> Self {
        let dataset = dataset.into();
        NdjsonSink {
            node_path: dataset.join(format!("{table}_node.ndjson")),
            trial_path: dataset.join(format!("{table}_trial.ndjson")),
            dataset,
        }
    }

    pub fn node_path(&self) -> &Path {
        &self.node_path
    }

    pub fn trial_path(&self) -> &Path {
        &self.trial_path
    }

    async fn append(path: &Path, lines: String) -> Result<(), SinkError> {
        let mut file = OpenOptions::new().append(true).open(path).await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

impl Sink for NdjsonSink {
    async fn ensure_tables(&self, create: bool) -> Result<(), SinkError> {
        if create {
            fs::create_dir_all(&self.dataset).await?;
        }
        for path in [&self.node_path, &self.trial_path] {
            match fs::metadata(path).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound && create => {
                    OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                        .await?;
                    info!("Created table {}", path.display());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(SinkError::MissingTable(path.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn insert_node(&self, node: &Node) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(node)?;
        line.push('\n');
        Self::append(&self.node_path, line).await
    }

    async fn insert_trials(&self, trials: &[Trial]) -> Result<(), SinkError> {
        let mut lines = String::new();
        for trial in trials {
            lines.push_str(&serde_json::to_string(trial)?);
            lines.push('\n');
        }
        Self::append(&self.trial_path, lines).await
    }
}
