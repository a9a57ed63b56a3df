//! Streams records to a [`Sink`] without blocking the crawl.
//!
//! Nodes arrive one at a time while the crawl runs. Trials are only complete
//! once the crawl ends, so they are flushed in batches by [`Pipeline::finish`].
//! Delivery is at most once: a record whose upload fails is logged and dropped.

use crate::record::{Node, Trial};
use crate::sink::Sink;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of the node and trial queues.
pub const QUEUE_CAPACITY: usize = 5;
/// Trials per upload batch.
pub const TRIAL_BATCH_SIZE: usize = 1000;

/// Upload counters, returned once the pipeline is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub nodes_uploaded: usize,
    pub nodes_dropped: usize,
    pub trials_uploaded: usize,
    pub trials_dropped: usize,
}

/// Handle to a running upload loop.
pub struct Pipeline {
    node_tx: mpsc::Sender<Node>,
    trial_tx: mpsc::Sender<Vec<Trial>>,
    shutdown_tx: oneshot::Sender<()>,
    uploader: JoinHandle<PipelineStats>,
}

impl Pipeline {
    /// Spawn the upload loop for `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S: Sink + 'static>(sink: S) -> Self {
        let (node_tx, node_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (trial_tx, trial_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let uploader = tokio::spawn(upload(sink, node_rx, trial_rx, shutdown_rx));

        Pipeline {
            node_tx,
            trial_tx,
            shutdown_tx,
            uploader,
        }
    }

    /// Producer handle for node records.
    pub fn node_sender(&self) -> mpsc::Sender<Node> {
        self.node_tx.clone()
    }

    /// Flush the trials, close the queues and wait for the uploader to drain.
    ///
    /// Node senders handed out earlier may still exist, records they send
    /// after this call are rejected.
    pub async fn finish(self, trials: Vec<Trial>) -> PipelineStats {
        let batches = trials.len().div_ceil(TRIAL_BATCH_SIZE);
        info!("Flushing {} trials in {batches} batches", trials.len());
        for batch in trials.chunks(TRIAL_BATCH_SIZE) {
            if self.trial_tx.send(batch.to_vec()).await.is_err() {
                warn!("Uploader exited early, dropping trial batch");
            }
        }

        // Uploader gone means it already stopped.
        let _ = self.shutdown_tx.send(());
        match self.uploader.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Uploader task failed: {e}");
                PipelineStats::default()
            }
        }
    }
}

async fn upload<S: Sink>(
    sink: S,
    mut node_rx: mpsc::Receiver<Node>,
    mut trial_rx: mpsc::Receiver<Vec<Trial>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> PipelineStats {
    let mut stats = PipelineStats::default();

    loop {
        tokio::select! {
            Some(node) = node_rx.recv() => upload_node(&sink, node, &mut stats).await,
            Some(batch) = trial_rx.recv() => upload_trials(&sink, batch, &mut stats).await,
            _ = &mut shutdown_rx => break,
            else => break,
        }
    }

    // Reject new records, then drain what is already queued.
    node_rx.close();
    trial_rx.close();
    while let Some(node) = node_rx.recv().await {
        upload_node(&sink, node, &mut stats).await;
    }
    while let Some(batch) = trial_rx.recv().await {
        upload_trials(&sink, batch, &mut stats).await;
    }

    info!(
        "Pipeline closed: {} nodes and {} trials uploaded, {} nodes and {} trials dropped",
        stats.nodes_uploaded, stats.trials_uploaded, stats.nodes_dropped, stats.trials_dropped
    );
    stats
}

async fn upload_node<S: Sink>(sink: &S, node: Node, stats: &mut PipelineStats) {
    match sink.insert_node(&node).await {
        Ok(()) => {
            debug!("Uploaded node {}", node.peer_id);
            stats.nodes_uploaded += 1;
        }
        Err(e) => {
            warn!("Dropping node {}: {e}", node.peer_id);
            stats.nodes_dropped += 1;
        }
    }
}

async fn upload_trials<S: Sink>(sink: &S, batch: Vec<Trial>, stats: &mut PipelineStats) {
    match sink.insert_trials(&batch).await {
        Ok(()) => {
            debug!("Uploaded {} trials", batch.len());
            stats.trials_uploaded += batch.len();
        }
        Err(e) => {
            warn!("Dropping batch of {} trials: {e}", batch.len());
            stats.trials_dropped += batch.len();
        }
    }
}
