//! Seed peers a crawl starts from.

use crate::output::{read_trials, OutputError};
use chrono::Utc;
use dht_peers_protocol::{PeerAddrError, PeerId, PeerInfo};
use log::{debug, warn};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Well known public bootstrap peers.
///
/// Plain `/ip4/.../tcp/` addresses so they can be dialed without resolving DNS.
pub const BOOTSTRAP_PEERS: &[&str] = &[
    "/ip4/139.178.89.189/tcp/4001/p2p/QmZa1sAxajnQjVM8WjWXoMbmPd7NsWhfKsPkErzpm9wGkp",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
    "/ip4/207.148.19.196/tcp/20074/p2p/12D3KooWGXBbSZ3ko3UvoekdnnSrdmuFic3XHuNKvGcZyrH1mVxr",
    "/ip4/18.185.241.99/tcp/20001/p2p/12D3KooWA4NVc1GytssyhxGqaT22kJ9XwdhCpS2VwNPPMw59Ctf4",
    "/ip4/64.225.116.25/tcp/30017/p2p/12D3KooWHHVPRYiXuWsVmATm8nduX7dXXpw3kC5Co1QSUYVLNXZN",
    "/ip4/104.236.179.241/tcp/4001/p2p/QmSoLPppuBtQSGwKDZT2M73ULpjvfd3aZ6ha4oFGL1KrGM",
    "/ip4/128.199.219.111/tcp/4001/p2p/QmSoLSafTMBsPKadTEgaXctDQVcqN88CNLHXMkTNwMKPnu",
    "/ip4/104.236.76.40/tcp/4001/p2p/QmSoLV4Bbm51jM9C4gDYZQ9Cy3U6aXMJDAbzgu2fzaDs64",
    "/ip4/178.62.158.247/tcp/4001/p2p/QmSoLer265NRgSp2LA3dPaeykiS1J6DifTC88f5uVQKNAd",
    "/ip4/104.236.151.122/tcp/4001/p2p/QmSoLju6m7xTh3DuokvT3886QRYqxAzb1kShaanJgW36yx",
    "/ip4/188.40.114.11/tcp/4001/p2p/QmZY7MtK8ZbG1suwrxc7xEYZ2hQLf1dAWPRHhjxC8rjq8E",
    "/ip4/5.9.59.34/tcp/4001/p2p/QmRv1GNseNP1krEwHDjaQMeQVJy41879QcDwpJVhY8SWve",
];

/// Errors loading seeds.
#[derive(Debug)]
pub enum SeedError {
    /// A seed line is not a `/p2p/` address.
    Parse {
        line: usize,
        input: String,
        source: PeerAddrError,
    },
    Io(io::Error),
    /// A prior run's trials could not be read.
    PriorRun(OutputError),
}

impl fmt::Display for SeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedError::Parse {
                line,
                input,
                source,
            } => write!(f, "Invalid seed on line {line} ({input}): {source}"),
            SeedError::Io(e) => write!(f, "Failed to read seeds: {e}"),
            SeedError::PriorRun(e) => write!(f, "Failed to read prior run: {e}"),
        }
    }
}

impl std::error::Error for SeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SeedError::Parse { source, .. } => Some(source),
            SeedError::Io(e) => Some(e),
            SeedError::PriorRun(e) => Some(e),
        }
    }
}

impl From<io::Error> for SeedError {
    fn from(e: io::Error) -> Self {
        SeedError::Io(e)
    }
}

impl From<OutputError> for SeedError {
    fn from(e: OutputError) -> Self {
        SeedError::PriorRun(e)
    }
}

/// Seed peers deduplicated by identifier.
///
/// Adding a known peer merges its addresses into the existing entry.
#[derive(Debug, Clone, Default)]
pub struct SeedList {
    peers: Vec<PeerInfo>,
    index: HashMap<PeerId, usize>,
}

impl SeedList {
    pub fn new() -> Self {
        Self::default()
    }

    /// The public bootstrap peers.
    pub fn bootstrap() -> Self {
        let mut seeds = Self::new();
        for addr in BOOTSTRAP_PEERS {
            if let Err(e) = seeds.add_str(addr) {
                warn!("Skipping bootstrap peer {addr}: {e}");
            }
        }
        seeds
    }

    /// Add a peer.
    ///
    /// # Returns
    ///
    /// `true` if the peer was not in the list yet.
    pub fn add(&mut self, info: PeerInfo) -> bool {
        match self.index.get(&info.id) {
            Some(&i) => {
                let existing = &mut self.peers[i];
                for addr in info.addrs {
                    if !existing.addrs.contains(&addr) {
                        existing.addrs.push(addr);
                    }
                }
                false
            }
            None => {
                self.index.insert(info.id, self.peers.len());
                self.peers.push(info);
                true
            }
        }
    }

    /// Add a peer from a `/p2p/` address such as `/ip4/1.2.3.4/tcp/4001/p2p/Qm...`.
    pub fn add_str(&mut self, addr: &str) -> Result<bool, PeerAddrError> {
        Ok(self.add(addr.parse()?))
    }

    /// Add one peer per line, skipping blank lines and `#` comments.
    ///
    /// Lines that fail to parse are skipped and returned.
    pub fn add_lines(&mut self, text: &str) -> Vec<SeedError> {
        let mut errors = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Err(source) = self.add_str(line) {
                errors.push(SeedError::Parse {
                    line: i + 1,
                    input: line.to_string(),
                    source,
                });
            }
        }
        errors
    }

    /// Add the peers listed in a file, see [`SeedList::add_lines`].
    ///
    /// # Returns
    ///
    /// * `Ok(Vec<SeedError>)` - The file was read, with the lines that failed to parse.
    /// * `Err(SeedError)` - The file could not be read.
    pub async fn add_file(&mut self, path: &Path) -> Result<Vec<SeedError>, SeedError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(self.add_lines(&text))
    }

    /// Add the peers that were reachable in a prior run.
    ///
    /// Without a window every dialed address becomes a seed. With `within`
    /// set, only addresses that had a successful attempt observed that
    /// recently are used.
    ///
    /// # Returns
    ///
    /// The number of new peers.
    pub async fn add_prior_run(
        &mut self,
        trials_path: &Path,
        within: Option<Duration>,
    ) -> Result<usize, SeedError> {
        let cutoff = within
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .map(|window| Utc::now() - window);

        let trials = read_trials(trials_path).await?;
        let mut added = 0;
        for trial in trials {
            if let Some(cutoff) = cutoff {
                if !trial.has_success() || trial.observed < cutoff {
                    continue;
                }
            }
            if self.add(PeerInfo::new(trial.peer_id, vec![trial.multiaddr])) {
                added += 1;
            }
        }
        debug!(
            "Loaded {added} peers from prior run {}",
            trials_path.display()
        );
        Ok(added)
    }

    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    pub fn into_peers(self) -> Vec<PeerInfo> {
        self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::write_trials;
    use crate::record::{DialAttempt, Trial};
    use dht_peers_protocol::{tcp_socket_addr, Multiaddr};

    const MARS: &str =
        "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ";

    #[test]
    fn test_same_seed_twice_is_one_entry() {
        let mut seeds = SeedList::new();
        assert!(seeds.add_str(MARS).unwrap());
        assert!(!seeds.add_str(MARS).unwrap());
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds.peers()[0].addrs.len(), 1);
    }

    #[test]
    fn test_addresses_merge() {
        let mut seeds = SeedList::new();
        seeds.add_str(MARS).unwrap();
        seeds
            .add_str("/ip6/::1/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ")
            .unwrap();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds.peers()[0].addrs.len(), 2);
    }

    #[test]
    fn test_bad_lines_do_not_stop_loading() {
        let mut seeds = SeedList::new();
        let text = format!("# comment\n\n/ip4/1.2.3.4/tcp/4001\nnonsense\n{MARS}\n");

        let errors = seeds.add_lines(&text);

        assert_eq!(seeds.len(), 1);
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            errors[0],
            SeedError::Parse {
                line: 3,
                source: PeerAddrError::MissingPeerId,
                ..
            }
        ));
        assert!(matches!(errors[1], SeedError::Parse { line: 4, .. }));
    }

    #[test]
    fn test_bootstrap_list_parses() {
        assert_eq!(SeedList::bootstrap().len(), BOOTSTRAP_PEERS.len());
    }

    #[test]
    fn test_bootstrap_peers_are_dialable() {
        for peer in SeedList::bootstrap().peers() {
            assert!(!peer.addrs.is_empty());
            assert!(
                peer.addrs.iter().all(|a| tcp_socket_addr(a).is_some()),
                "{} has an undialable address",
                peer.id
            );
        }
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = SeedList::new().add_file(&dir.path().join("nope")).await;
        assert!(matches!(result, Err(SeedError::Io(_))));
    }

    #[tokio::test]
    async fn test_prior_run_selects_reachable_recent_trials() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prior");
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();

        let trial = |success: bool, age: chrono::Duration| {
            let mut attempt = DialAttempt::started_now();
            attempt.success = success;
            Trial {
                observed: Utc::now() - age,
                peer_id: PeerId::random(),
                multiaddr: addr.clone(),
                address: None,
                fail_sanity: false,
                results: vec![attempt],
                rtt: None,
            }
        };
        let recent = trial(true, chrono::Duration::minutes(5));
        let old = trial(true, chrono::Duration::days(3));
        let failed = trial(false, chrono::Duration::minutes(5));
        let path = write_trials(&prefix, &[recent.clone(), old.clone(), failed])
            .await
            .unwrap();

        let mut seeds = SeedList::new();
        let added = seeds
            .add_prior_run(&path, Some(Duration::from_secs(24 * 3600)))
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(seeds.peers()[0].id, recent.peer_id);
        assert_eq!(seeds.peers()[0].addrs, vec![addr.clone()]);

        let mut all = SeedList::new();
        assert_eq!(all.add_prior_run(&path, None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_prior_run_without_window_keeps_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut attempt = DialAttempt::started_now();
        attempt.end = Some(Utc::now());
        attempt.error = Some("Connection refused".to_string());
        let failed = Trial {
            observed: Utc::now(),
            peer_id: PeerId::random(),
            multiaddr: "/ip4/10.0.0.9/tcp/4001".parse().unwrap(),
            address: None,
            fail_sanity: false,
            results: vec![attempt],
            rtt: None,
        };
        let path = write_trials(&dir.path().join("prior"), &[failed.clone()])
            .await
            .unwrap();

        let mut seeds = SeedList::new();
        assert_eq!(seeds.add_prior_run(&path, None).await.unwrap(), 1);
        assert_eq!(seeds.peers()[0].id, failed.peer_id);

        let mut recent = SeedList::new();
        let window = Some(Duration::from_secs(3600));
        assert_eq!(recent.add_prior_run(&path, window).await.unwrap(), 0);
    }
}
