//! Observation records produced by a crawl.
//!
//! A [`Node`] is the outcome of querying one peer. A [`Trial`] is the dial
//! history of one network address. Both serialize to flat JSON objects, one
//! per line in the output files and sink tables.

use chrono::{DateTime, Utc};
use dht_peers_protocol::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

/// The observation of one peer in a crawl run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(with = "peer_id_text")]
    pub peer_id: PeerId,
    pub observed: DateTime<Utc>,
    /// Addresses known for the peer when it completed.
    pub addresses: Vec<String>,
    pub user_agent: Option<String>,
    pub protocol_version: Option<String>,
    pub protocols: Vec<String>,
    /// Peers returned by the peer's routing table. Empty if the query failed.
    #[serde(rename = "rt", with = "peer_id_set")]
    pub neighbors: BTreeSet<PeerId>,
    pub error: Option<String>,
}

impl Node {
    /// The query against this peer succeeded.
    pub fn is_reachable(&self) -> bool {
        self.error.is_none()
    }
}

/// One physical dial attempt against an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialAttempt {
    pub start: DateTime<Utc>,
    /// Unset until the attempt resolves.
    pub end: Option<DateTime<Utc>>,
    pub success: bool,
    pub error: Option<String>,
}

impl DialAttempt {
    pub(crate) fn started_now() -> Self {
        DialAttempt {
            start: Utc::now(),
            end: None,
            success: false,
            error: None,
        }
    }

    /// The attempt has not resolved yet.
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// The dial history of one network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
    /// When the address was first dialed.
    pub observed: DateTime<Utc>,
    #[serde(with = "peer_id_text")]
    pub peer_id: PeerId,
    #[serde(with = "multiaddr_text")]
    pub multiaddr: Multiaddr,
    /// IP component of the address, if it has one.
    pub address: Option<IpAddr>,
    /// The address has no IP component to resolve.
    pub fail_sanity: bool,
    /// Attempts in the order they were made.
    pub results: Vec<DialAttempt>,
    /// Latency estimate of the peer sampled when a connection on this address closed.
    #[serde(with = "rtt_nanos")]
    pub rtt: Option<Duration>,
}

impl Trial {
    /// At least one attempt against the address succeeded.
    pub fn has_success(&self) -> bool {
        self.results.iter().any(|attempt| attempt.success)
    }
}

mod peer_id_text {
    use dht_peers_protocol::PeerId;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(id: &PeerId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_base58())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PeerId, D::Error> {
        let text = String::deserialize(deserializer)?;
        PeerId::from_str(&text).map_err(de::Error::custom)
    }
}

mod peer_id_set {
    use dht_peers_protocol::PeerId;
    use serde::ser::SerializeSeq;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::collections::BTreeSet;
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(ids: &BTreeSet<PeerId>, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(ids.len()))?;
        for id in ids {
            seq.serialize_element(&id.to_base58())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeSet<PeerId>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|text| PeerId::from_str(text).map_err(de::Error::custom))
            .collect()
    }
}

mod multiaddr_text {
    use dht_peers_protocol::Multiaddr;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &Multiaddr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(addr)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Multiaddr, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

mod rtt_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(rtt: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match rtt {
            Some(rtt) => serializer.serialize_some(&(rtt.as_nanos() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_nanos))
    }
}
