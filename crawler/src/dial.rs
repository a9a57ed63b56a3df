//! Dial history recording.
//!
//! [`DialRecorder`] is installed as the network layer's [`ConnectionGate`].
//! It never denies anything, it only builds a [`Trial`] per dialed address
//! from the stream of connection events.

use crate::record::{DialAttempt, Trial};
use chrono::Utc;
use dashmap::DashMap;
use dht_peers_protocol::{
    ip_of, AddressBook, Connectedness, ConnectionGate, ConnectionInfo, Multiaddr, NetworkError,
    PeerId, Pinger,
};
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::Notify;

/// Builds the dial history of every address the network layer touches.
///
/// Hooks run inline on network tasks and only do bookkeeping. Each address
/// is one map entry, so events for the same address are serialized while
/// different addresses never contend.
pub struct DialRecorder {
    trials: Arc<DashMap<Multiaddr, Trial>>,
    book: Arc<AddressBook>,
    /// Set once the network exists, which itself holds the recorder.
    pinger: OnceLock<Weak<dyn Pinger>>,
    probes: Arc<ProbeTracker>,
}

/// Count of probes still running.
#[derive(Default)]
struct ProbeTracker {
    running: AtomicUsize,
    idle: Notify,
}

/// Marks a probe finished when dropped, including on cancellation.
struct ProbeGuard(Arc<ProbeTracker>);

impl ProbeGuard {
    fn new(tracker: Arc<ProbeTracker>) -> Self {
        tracker.running.fetch_add(1, Ordering::SeqCst);
        ProbeGuard(tracker)
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if self.0.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl DialRecorder {
    /// Create a recorder reading latency estimates from `book`.
    pub fn new(book: Arc<AddressBook>) -> Self {
        DialRecorder {
            trials: Arc::new(DashMap::new()),
            book,
            pinger: OnceLock::new(),
            probes: Arc::new(ProbeTracker::default()),
        }
    }

    /// Enable a latency probe after every successful connection.
    ///
    /// Only a weak reference is kept, probing stops once the caller drops
    /// `pinger`. Only the first pinger attached is used.
    pub fn attach_pinger(&self, pinger: &Arc<dyn Pinger>) {
        if self.pinger.set(Arc::downgrade(pinger)).is_err() {
            debug!("Pinger already attached, ignoring");
        }
    }

    /// Wait until every probe started so far has recorded its attempt.
    ///
    /// Call before taking the final [`DialRecorder::snapshot`].
    pub async fn settle(&self) {
        loop {
            let idle = self.probes.idle.notified();
            if self.probes.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Number of probes still running.
    pub fn pending_probes(&self) -> usize {
        self.probes.running.load(Ordering::SeqCst)
    }

    /// The trial of an address, if it was ever dialed.
    pub fn trial(&self, addr: &Multiaddr) -> Option<Trial> {
        self.trials.get(addr).map(|trial| trial.clone())
    }

    /// Copy of every trial recorded so far.
    pub fn snapshot(&self) -> Vec<Trial> {
        self.trials.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    /// Append a fresh attempt, creating the trial on first dial.
    fn record_attempt(&self, peer: &PeerId, addr: &Multiaddr) {
        let mut trial = self.trials.entry(addr.clone()).or_insert_with(|| {
            let address = ip_of(addr);
            Trial {
                observed: Utc::now(),
                peer_id: *peer,
                multiaddr: addr.clone(),
                address,
                fail_sanity: address.is_none(),
                results: Vec::new(),
                rtt: None,
            }
        });
        trial.results.push(DialAttempt::started_now());
    }

    /// Resolve the latest attempt on `addr` that is still open.
    ///
    /// Probe results land between dials, so the open attempt is not always
    /// the last one.
    fn resolve_open(&self, addr: &Multiaddr, success: bool, error: Option<String>) {
        if let Some(mut trial) = self.trials.get_mut(addr) {
            if let Some(attempt) = trial.results.iter_mut().rev().find(|a| a.is_open()) {
                attempt.end = Some(Utc::now());
                attempt.success = success;
                attempt.error = error;
            }
        }
    }

    /// Probe the connection in the background, appending the outcome as a new attempt.
    fn spawn_probe(&self, conn: &ConnectionInfo) {
        let Some(pinger) = self.pinger.get().and_then(Weak::upgrade) else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            debug!("No runtime to probe {} on", conn.remote_addr);
            return;
        };

        let trials = self.trials.clone();
        let conn = conn.clone();
        let guard = ProbeGuard::new(self.probes.clone());
        handle.spawn(async move {
            let _guard = guard;
            let start = Utc::now();
            let result = pinger.ping(&conn).await;
            let attempt = DialAttempt {
                start,
                end: Some(Utc::now()),
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            };
            match &result {
                Ok(rtt) => debug!("Probe to {} took {rtt:?}", conn.remote_addr),
                Err(e) => debug!("Probe to {} failed: {e}", conn.remote_addr),
            }
            if let Some(mut trial) = trials.get_mut(&conn.remote_addr) {
                trial.results.push(attempt);
            }
        });
    }
}

impl ConnectionGate for DialRecorder {
    /// Always allowed. Attempts are tracked per address.
    fn intercept_peer_dial(&self, _peer: &PeerId) -> bool {
        true
    }

    fn intercept_addr_dial(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.record_attempt(peer, addr);
        true
    }

    /// Always allowed. Nothing to record beyond the later `connected`.
    fn intercept_secured(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        true
    }

    /// Always allowed. Nothing to record beyond the later `connected`.
    fn intercept_upgraded(&self, _conn: &ConnectionInfo) -> bool {
        true
    }

    fn dial_failed(&self, _peer: &PeerId, addr: &Multiaddr, error: &NetworkError) {
        self.resolve_open(addr, false, Some(error.to_string()));
    }

    fn connected(&self, conn: &ConnectionInfo) {
        self.resolve_open(&conn.remote_addr, true, None);
        self.spawn_probe(conn);
    }

    fn disconnected(&self, conn: &ConnectionInfo) {
        let rtt = self.book.latency_ewma(&conn.peer);
        if let Some(mut trial) = self.trials.get_mut(&conn.remote_addr) {
            trial.rtt = rtt;
        }
    }

    /// Dials may race, so close whichever addresses ended up connected.
    fn connectedness_changed(
        &self,
        _peer: &PeerId,
        connectedness: Connectedness,
        conns: &[ConnectionInfo],
    ) {
        if connectedness == Connectedness::Connected {
            for conn in conns {
                self.resolve_open(&conn.remote_addr, true, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dht_peers_protocol::BoxFuture;
    use std::time::Duration;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    fn conn(peer: PeerId, remote_addr: Multiaddr) -> ConnectionInfo {
        ConnectionInfo {
            id: 1,
            peer,
            remote_addr,
        }
    }

    /// Answers every ping after `delay` with `rtt`, or times out when `rtt` is `None`.
    struct FixedPinger {
        rtt: Option<Duration>,
        delay: Duration,
    }

    impl FixedPinger {
        fn shared(rtt: Option<Duration>, delay: Duration) -> Arc<dyn Pinger> {
            Arc::new(FixedPinger { rtt, delay })
        }
    }

    impl Pinger for FixedPinger {
        fn ping(&self, _conn: &ConnectionInfo) -> BoxFuture<Result<Duration, NetworkError>> {
            let rtt = self.rtt;
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                rtt.ok_or(NetworkError::Timeout)
            })
        }
    }

    #[test]
    fn test_retries_then_success() {
        let book = Arc::new(AddressBook::new());
        let recorder = DialRecorder::new(book.clone());
        let peer = PeerId::random();
        let a2 = addr("/ip4/10.0.0.2/tcp/4001");

        for _ in 0..2 {
            assert!(recorder.intercept_peer_dial(&peer));
            assert!(recorder.intercept_addr_dial(&peer, &a2));
            recorder.dial_failed(&peer, &a2, &NetworkError::Timeout);
        }
        assert!(recorder.intercept_addr_dial(&peer, &a2));
        assert!(recorder.intercept_secured(&peer, &a2));
        let conn = conn(peer, a2.clone());
        assert!(recorder.intercept_upgraded(&conn));
        recorder.connected(&conn);

        let trial = recorder.trial(&a2).unwrap();
        assert_eq!(trial.peer_id, peer);
        assert_eq!(trial.results.len(), 3);
        assert!(trial.results[..2]
            .iter()
            .all(|r| !r.success && r.end.is_some() && r.error.is_some()));
        assert!(trial.results[2].success);
        assert!(trial.results[2].end.is_some());
        assert!(trial.rtt.is_none());

        book.record_latency(&peer, Duration::from_millis(40));
        recorder.disconnected(&conn);
        assert_eq!(
            recorder.trial(&a2).unwrap().rtt,
            Some(Duration::from_millis(40))
        );
    }

    #[test]
    fn test_end_time_set_once() {
        let recorder = DialRecorder::new(Arc::new(AddressBook::new()));
        let peer = PeerId::random();
        let a1 = addr("/ip4/10.0.0.1/tcp/4001");
        let conn = conn(peer, a1.clone());

        recorder.intercept_addr_dial(&peer, &a1);
        recorder.connected(&conn);
        let first = recorder.trial(&a1).unwrap().results[0].clone();

        // A late connectedness event or failure must not rewrite the attempt.
        recorder.connectedness_changed(&peer, Connectedness::Connected, &[conn]);
        recorder.dial_failed(&peer, &a1, &NetworkError::Timeout);

        let trial = recorder.trial(&a1).unwrap();
        assert_eq!(trial.results, vec![first]);
    }

    #[test]
    fn test_connectedness_closes_racing_dial() {
        let recorder = DialRecorder::new(Arc::new(AddressBook::new()));
        let peer = PeerId::random();
        let a1 = addr("/ip4/10.0.0.1/tcp/4001");
        let a2 = addr("/ip6/::1/tcp/4001");

        recorder.intercept_addr_dial(&peer, &a1);
        recorder.intercept_addr_dial(&peer, &a2);
        recorder.connectedness_changed(&peer, Connectedness::Connected, &[conn(peer, a2.clone())]);

        assert!(recorder.trial(&a1).unwrap().results[0].is_open());
        assert!(recorder.trial(&a2).unwrap().results[0].success);

        // Disconnection closes nothing.
        recorder.connectedness_changed(&peer, Connectedness::NotConnected, &[]);
        assert!(recorder.trial(&a1).unwrap().results[0].is_open());
    }

    #[test]
    fn test_sanity_flag() {
        let recorder = DialRecorder::new(Arc::new(AddressBook::new()));
        let peer = PeerId::random();
        let dns = addr("/dns4/example.com/tcp/4001");
        let ip = addr("/ip4/1.2.3.4/tcp/4001");

        recorder.intercept_addr_dial(&peer, &dns);
        recorder.intercept_addr_dial(&peer, &ip);

        let dns_trial = recorder.trial(&dns).unwrap();
        assert!(dns_trial.fail_sanity);
        assert!(dns_trial.address.is_none());
        let ip_trial = recorder.trial(&ip).unwrap();
        assert!(!ip_trial.fail_sanity);
        assert_eq!(ip_trial.address, Some("1.2.3.4".parse().unwrap()));
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_concurrent_dials_to_distinct_addresses() {
        let recorder = Arc::new(DialRecorder::new(Arc::new(AddressBook::new())));
        let peer = PeerId::random();

        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    let a = addr(&format!("/ip4/10.0.0.1/tcp/{}", 4000 + i));
                    for _ in 0..50 {
                        recorder.intercept_addr_dial(&peer, &a);
                        recorder.dial_failed(&peer, &a, &NetworkError::Timeout);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let trials = recorder.snapshot();
        assert_eq!(trials.len(), 8);
        assert!(trials
            .iter()
            .all(|t| t.results.len() == 50 && t.results.iter().all(|r| !r.is_open())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_waits_for_pings() {
        let recorder = DialRecorder::new(Arc::new(AddressBook::new()));
        let pinger = FixedPinger::shared(Some(Duration::from_millis(5)), Duration::from_secs(3));
        recorder.attach_pinger(&pinger);
        let peer = PeerId::random();
        let a1 = addr("/ip4/10.0.0.1/tcp/4001");

        recorder.intercept_addr_dial(&peer, &a1);
        recorder.connected(&conn(peer, a1.clone()));
        assert_eq!(recorder.pending_probes(), 1);
        assert_eq!(recorder.snapshot()[0].results.len(), 1);

        recorder.settle().await;

        assert_eq!(recorder.pending_probes(), 0);
        let trial = &recorder.snapshot()[0];
        assert_eq!(trial.results.len(), 2);
        assert!(trial.results[1].success);
        assert!(trial.results[1].end.is_some());
    }

    #[tokio::test]
    async fn test_settle_without_pings_returns() {
        let recorder = DialRecorder::new(Arc::new(AddressBook::new()));
        recorder.settle().await;
        assert_eq!(recorder.pending_probes(), 0);
    }

    #[tokio::test]
    async fn test_failed_ping_appends_error() {
        let recorder = DialRecorder::new(Arc::new(AddressBook::new()));
        let pinger = FixedPinger::shared(None, Duration::ZERO);
        recorder.attach_pinger(&pinger);
        let peer = PeerId::random();
        let a1 = addr("/ip4/10.0.0.1/tcp/4001");

        recorder.intercept_addr_dial(&peer, &a1);
        recorder.connected(&conn(peer, a1.clone()));
        recorder.settle().await;

        let trial = recorder.trial(&a1).unwrap();
        assert!(trial.results[0].success);
        assert!(!trial.results[1].success);
        assert!(trial.results[1].error.is_some());
    }

    #[tokio::test]
    async fn test_dropped_pinger_stops_pinging() {
        let recorder = DialRecorder::new(Arc::new(AddressBook::new()));
        let pinger = FixedPinger::shared(Some(Duration::from_millis(5)), Duration::ZERO);
        recorder.attach_pinger(&pinger);
        drop(pinger);
        let peer = PeerId::random();
        let a1 = addr("/ip4/10.0.0.1/tcp/4001");

        recorder.intercept_addr_dial(&peer, &a1);
        recorder.connected(&conn(peer, a1.clone()));

        assert_eq!(recorder.pending_probes(), 0);
        assert_eq!(recorder.trial(&a1).unwrap().results.len(), 1);
    }

    #[tokio::test]
    async fn test_dial_after_ping_is_resolved() {
        let recorder = DialRecorder::new(Arc::new(AddressBook::new()));
        let pinger = FixedPinger::shared(Some(Duration::from_millis(5)), Duration::ZERO);
        recorder.attach_pinger(&pinger);
        let peer = PeerId::random();
        let a1 = addr("/ip4/10.0.0.1/tcp/4001");

        // Second dial starts before the first connection's probe lands.
        recorder.intercept_addr_dial(&peer, &a1);
        recorder.connected(&conn(peer, a1.clone()));
        recorder.intercept_addr_dial(&peer, &a1);
        recorder.settle().await;
        recorder.connected(&conn(peer, a1.clone()));
        recorder.settle().await;

        let trial = recorder.trial(&a1).unwrap();
        assert_eq!(trial.results.len(), 4);
        assert!(trial.results.iter().all(|r| !r.is_open() && r.success));
    }
}
