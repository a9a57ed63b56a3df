//! Crawl output files.
//!
//! A run with prefix `out/crawl` produces `out/crawl.nodes.json` and
//! `out/crawl.trials.json`, each one JSON record per line, and optionally
//! `out/crawl.edges` with one `<peer> <neighbor>` pair per line.

use crate::record::{Node, Trial};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Errors reading or writing output files.
#[derive(Debug)]
pub enum OutputError {
    Io(io::Error),
    /// A record failed to serialize.
    Serialize(serde_json::Error),
    /// A line could not be parsed back into a record.
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::Io(e) => write!(f, "Output I/O error: {e}"),
            OutputError::Serialize(e) => write!(f, "Failed to serialize record: {e}"),
            OutputError::Parse { line, source } => {
                write!(f, "Invalid record on line {line}: {source}")
            }
        }
    }
}

impl std::error::Error for OutputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OutputError::Io(e) => Some(e),
            OutputError::Serialize(e) => Some(e),
            OutputError::Parse { source, .. } => Some(source),
        }
    }
}

impl From<io::Error> for OutputError {
    fn from(e: io::Error) -> Self {
        OutputError::Io(e)
    }
}

/// `prefix` with `suffix` appended to its final component.
fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

pub fn nodes_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".nodes.json")
}

pub fn trials_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".trials.json")
}

pub fn edges_path(prefix: &Path) -> PathBuf {
    with_suffix(prefix, ".edges")
}

async fn write_ndjson<T: Serialize>(path: &Path, records: &[T]) -> Result<(), OutputError> {
    let mut text = String::new();
    for record in records {
        text.push_str(&serde_json::to_string(record).map_err(OutputError::Serialize)?);
        text.push('\n');
    }
    fs::write(path, text).await?;
    Ok(())
}

async fn read_ndjson<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, OutputError> {
    let text = fs::read_to_string(path).await?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|source| OutputError::Parse {
                line: i + 1,
                source,
            })
        })
        .collect()
}

/// Write `<prefix>.nodes.json`, returning its path.
pub async fn write_nodes(prefix: &Path, nodes: &[Node]) -> Result<PathBuf, OutputError> {
    let path = nodes_path(prefix);
    write_ndjson(&path, nodes).await?;
    Ok(path)
}

/// Write `<prefix>.trials.json`, returning its path.
pub async fn write_trials(prefix: &Path, trials: &[Trial]) -> Result<PathBuf, OutputError> {
    let path = trials_path(prefix);
    write_ndjson(&path, trials).await?;
    Ok(path)
}

/// Write the directed neighbor graph as `<prefix>.edges`, returning its path.
pub async fn write_edges(prefix: &Path, nodes: &[Node]) -> Result<PathBuf, OutputError> {
    let mut text = String::new();
    for node in nodes {
        for neighbor in &node.neighbors {
            // Writing to a String cannot fail.
            let _ = writeln!(text, "{} {}", node.peer_id, neighbor);
        }
    }
    let path = edges_path(prefix);
    fs::write(&path, text).await?;
    Ok(path)
}

pub async fn read_nodes(path: &Path) -> Result<Vec<Node>, OutputError> {
    read_ndjson(path).await
}

pub async fn read_trials(path: &Path) -> Result<Vec<Trial>, OutputError> {
    read_ndjson(path).await
}
