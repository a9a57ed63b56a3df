//! Summary statistics of a crawl's records.

use crate::record::{Node, Trial};
use log::info;
use std::collections::BTreeMap;
use std::fmt;

/// Label used for peers that never advertised an agent version.
const UNKNOWN_AGENT: &str = "unknown";

/// Aggregate view of the nodes and trials of one crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub total: usize,
    pub reachable: usize,
    pub unreachable: usize,
    pub agents: BTreeMap<String, usize>,
    /// Peers supporting each sub-protocol.
    pub protocols: BTreeMap<String, usize>,
    pub trials: usize,
    /// Trials with at least one successful attempt.
    pub trials_succeeded: usize,
}

impl CrawlReport {
    pub fn new(nodes: &[Node], trials: &[Trial]) -> Self {
        let mut report = CrawlReport {
            total: nodes.len(),
            trials: trials.len(),
            trials_succeeded: trials.iter().filter(|t| t.has_success()).count(),
            ..Default::default()
        };

        for node in nodes {
            if node.is_reachable() {
                report.reachable += 1;
            } else {
                report.unreachable += 1;
            }
            let agent = node.user_agent.as_deref().unwrap_or(UNKNOWN_AGENT);
            *report.agents.entry(agent.to_string()).or_default() += 1;
            for protocol in &node.protocols {
                *report.protocols.entry(protocol.clone()).or_default() += 1;
            }
        }
        report
    }

    /// Log the report at info level, most common agents first.
    pub fn log(&self) {
        info!("{self}");
        let mut agents: Vec<_> = self.agents.iter().collect();
        agents.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (agent, count) in agents {
            info!("  {count:>8} {agent}");
        }
    }
}

impl fmt::Display for CrawlReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} peers ({} reachable, {} unreachable), {} addresses dialed ({} connected)",
            self.total, self.reachable, self.unreachable, self.trials, self.trials_succeeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dht_peers_protocol::PeerId;
    use std::collections::BTreeSet;

    fn node(agent: Option<&str>, protocols: &[&str], error: Option<&str>) -> Node {
        Node {
            peer_id: PeerId::random(),
            observed: Utc::now(),
            addresses: Vec::new(),
            user_agent: agent.map(str::to_string),
            protocol_version: None,
            protocols: protocols.iter().map(|p| p.to_string()).collect(),
            neighbors: BTreeSet::new(),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_counts() {
        let nodes = vec![
            node(Some("kubo/0.20.0"), &["/ipfs/kad/1.0.0", "/ipfs/id/1.0.0"], None),
            node(Some("kubo/0.20.0"), &["/ipfs/kad/1.0.0"], None),
            node(None, &[], Some("Peer returned no response")),
        ];

        let report = CrawlReport::new(&nodes, &[]);

        assert_eq!(report.total, 3);
        assert_eq!(report.reachable, 2);
        assert_eq!(report.unreachable, 1);
        assert_eq!(report.agents["kubo/0.20.0"], 2);
        assert_eq!(report.agents[UNKNOWN_AGENT], 1);
        assert_eq!(report.protocols["/ipfs/kad/1.0.0"], 2);
        assert_eq!(report.protocols["/ipfs/id/1.0.0"], 1);
        assert!(report.to_string().starts_with("3 peers (2 reachable"));
    }
}
