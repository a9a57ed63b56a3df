//! Plaintext TCP implementation of the network layer.
//!
//! Every request runs over its own connection.
//!
//! 1. Dial the peer's known addresses in order until one connects.
//! 2. Exchange [`Identify`] frames, checking the remote is the peer we dialed.
//! 3. Send the request frame and read one response frame.
//! 4. Close the connection.
//!
//! The [`ConnectionGate`] is consulted and notified at every step. There is no
//! encryption or stream multiplexing, so this transport only interoperates with
//! peers speaking the same framing, e.g. test networks and simulations.

use crate::codec::Framed;
use crate::directory::{AddressBook, PeerMetadata};
use crate::message::{Identify, Message, MessageType};
use crate::network::{
    BoxFuture, Connectedness, ConnectionGate, ConnectionInfo, LocalPeer, Network, NetworkError,
    Pinger,
};
use crate::peer::tcp_socket_addr;
use dashmap::DashMap;
use libp2p_identity::PeerId;
use log::debug;
use multiaddr::Multiaddr;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default time allowed for TCP connect plus identify, per address.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

type TcpFramed = Framed<BufReader<OwnedReadHalf>, OwnedWriteHalf>;

/// Plaintext TCP network layer.
///
/// Cheap to clone, clones share the connection table and the gate.
#[derive(Clone)]
pub struct TcpNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    local: LocalPeer,
    book: Arc<AddressBook>,
    gate: Option<Arc<dyn ConnectionGate>>,
    dial_timeout: Duration,
    next_connection_id: AtomicU64,
    /// Open connections per peer.
    connections: DashMap<PeerId, Vec<ConnectionInfo>>,
}

/// Closes the connection bookkeeping when dropped, including on cancellation.
struct OpenConnection<'a> {
    inner: &'a Inner,
    conn: ConnectionInfo,
}

impl Drop for OpenConnection<'_> {
    fn drop(&mut self) {
        self.inner.close(&self.conn);
    }
}

impl TcpNetwork {
    /// Create a network layer dialing from the given directory.
    ///
    /// # Arguments
    ///
    /// * `local` - Identity advertised in the identify exchange.
    /// * `book` - Shared directory used to resolve peer addresses.
    /// * `gate` - Optional hook consulted on every connection event.
    pub fn new(
        local: LocalPeer,
        book: Arc<AddressBook>,
        gate: Option<Arc<dyn ConnectionGate>>,
    ) -> Self {
        Self::with_dial_timeout(local, book, gate, DEFAULT_DIAL_TIMEOUT)
    }

    /// Like [`TcpNetwork::new`] with a custom per-address dial timeout.
    pub fn with_dial_timeout(
        local: LocalPeer,
        book: Arc<AddressBook>,
        gate: Option<Arc<dyn ConnectionGate>>,
        dial_timeout: Duration,
    ) -> Self {
        TcpNetwork {
            inner: Arc::new(Inner {
                local,
                book,
                gate,
                dial_timeout,
                next_connection_id: AtomicU64::new(1),
                connections: DashMap::new(),
            }),
        }
    }

    /// Open connections to a peer.
    pub fn connections_to(&self, peer: &PeerId) -> Vec<ConnectionInfo> {
        self.inner
            .connections
            .get(peer)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    async fn exchange(&self, peer: PeerId, request: Message) -> Result<Option<Message>, NetworkError> {
        let inner = &*self.inner;
        if let Some(gate) = &inner.gate {
            if !gate.intercept_peer_dial(&peer) {
                return Err(NetworkError::DialDenied(peer));
            }
        }

        let addrs = inner.book.addrs(&peer);
        if addrs.is_empty() {
            return Err(NetworkError::NoAddresses(peer));
        }

        let (mut framed, addr) = inner.dial_any(&peer, &addrs).await?;
        let conn = ConnectionInfo {
            id: inner.next_connection_id.fetch_add(1, Ordering::Relaxed),
            peer,
            remote_addr: addr,
        };
        if let Some(gate) = &inner.gate {
            if !gate.intercept_upgraded(&conn) {
                return Err(NetworkError::DialDenied(peer));
            }
        }
        let _open = inner.open(conn);

        let started = Instant::now();
        framed.write(&request).await?;
        let response = framed.read::<Message>().await?;
        if response.is_some() {
            inner.book.record_latency(&peer, started.elapsed());
        }
        // Best effort, the peer may already be gone.
        let _ = framed.shutdown().await;

        Ok(response)
    }

    async fn probe(&self, conn: ConnectionInfo) -> Result<Duration, NetworkError> {
        let inner = &*self.inner;
        let mut framed = timeout(
            inner.dial_timeout,
            inner.handshake(&conn.peer, &conn.remote_addr),
        )
        .await
        .map_err(|_| NetworkError::Timeout)??;

        let started = Instant::now();
        framed
            .write(&Message::request(MessageType::Ping, &[]))
            .await?;
        match framed.read::<Message>().await? {
            Some(reply) if reply.kind() == Some(MessageType::Ping) => {
                let rtt = started.elapsed();
                inner.book.record_latency(&conn.peer, rtt);
                Ok(rtt)
            }
            _ => Err(NetworkError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "peer did not answer ping",
            ))),
        }
    }
}

impl Inner {
    /// Try each address in order, returning the first that completes a handshake.
    async fn dial_any(
        &self,
        peer: &PeerId,
        addrs: &[Multiaddr],
    ) -> Result<(TcpFramed, Multiaddr), NetworkError> {
        let mut attempted = false;
        for addr in addrs {
            if let Some(gate) = &self.gate {
                if !gate.intercept_addr_dial(peer, addr) {
                    debug!("Gate denied dial to {peer} at {addr}");
                    continue;
                }
            }
            attempted = true;

            let result = match timeout(self.dial_timeout, self.handshake(peer, addr)).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout),
            };
            let result = result.and_then(|framed| match &self.gate {
                Some(gate) if !gate.intercept_secured(peer, addr) => {
                    Err(NetworkError::DialDenied(*peer))
                }
                _ => Ok(framed),
            });

            match result {
                Ok(framed) => return Ok((framed, addr.clone())),
                Err(e) => {
                    debug!("Dial to {peer} at {addr} failed: {e}");
                    if let Some(gate) = &self.gate {
                        gate.dial_failed(peer, addr, &e);
                    }
                }
            }
        }

        if attempted {
            Err(NetworkError::DialFailed(*peer))
        } else {
            Err(NetworkError::DialDenied(*peer))
        }
    }

    /// Connect and run the identify exchange.
    async fn handshake(&self, peer: &PeerId, addr: &Multiaddr) -> Result<TcpFramed, NetworkError> {
        let socket_addr =
            tcp_socket_addr(addr).ok_or_else(|| NetworkError::UnsupportedAddress(addr.clone()))?;
        let stream = TcpStream::connect(socket_addr).await?;
        // Requests are small and latency is what we measure.
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut framed = Framed::new(BufReader::new(reader), writer);

        framed.write(&self.identify_message()).await?;
        let remote = framed.read::<Identify>().await?.ok_or_else(|| {
            NetworkError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during identify",
            ))
        })?;

        let actual = PeerId::from_bytes(&remote.peer_id).map_err(|e| {
            NetworkError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        })?;
        if actual != *peer {
            return Err(NetworkError::PeerIdMismatch {
                expected: *peer,
                actual,
            });
        }

        let listen_addrs = remote
            .listen_addrs
            .iter()
            .filter_map(|raw| Multiaddr::try_from(raw.clone()).ok());
        self.book.add_addrs(peer, listen_addrs);
        self.book.set_metadata(
            peer,
            PeerMetadata {
                agent_version: non_empty(remote.agent_version),
                protocol_version: non_empty(remote.protocol_version),
                protocols: remote.protocols,
            },
        );

        Ok(framed)
    }

    fn identify_message(&self) -> Identify {
        Identify {
            peer_id: self.local.id.to_bytes(),
            listen_addrs: self.local.listen_addrs.iter().map(|a| a.to_vec()).collect(),
            protocols: self.local.protocols.clone(),
            protocol_version: self.local.protocol_version.clone(),
            agent_version: self.local.agent_version.clone(),
        }
    }

    fn open(&self, conn: ConnectionInfo) -> OpenConnection<'_> {
        let (newly_connected, conns) = {
            let mut entry = self.connections.entry(conn.peer).or_default();
            entry.push(conn.clone());
            (entry.len() == 1, entry.clone())
        };

        if let Some(gate) = &self.gate {
            gate.connected(&conn);
            if newly_connected {
                gate.connectedness_changed(&conn.peer, Connectedness::Connected, &conns);
            }
        }
        OpenConnection { inner: self, conn }
    }

    fn close(&self, conn: &ConnectionInfo) {
        let remaining = match self.connections.get_mut(&conn.peer) {
            Some(mut entry) => {
                entry.retain(|c| c.id != conn.id);
                entry.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.connections.remove_if(&conn.peer, |_, conns| conns.is_empty());
        }

        if let Some(gate) = &self.gate {
            gate.disconnected(conn);
            if remaining == 0 {
                gate.connectedness_changed(&conn.peer, Connectedness::NotConnected, &[]);
            }
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl Network for TcpNetwork {
    fn local_peer(&self) -> &LocalPeer {
        &self.inner.local
    }

    fn address_book(&self) -> &AddressBook {
        &self.inner.book
    }

    fn send_request(
        &self,
        peer: &PeerId,
        request: Message,
    ) -> impl Future<Output = Result<Option<Message>, NetworkError>> + Send {
        self.exchange(*peer, request)
    }
}

/// Probes dial the connection's address directly and are invisible to the gate.
impl Pinger for TcpNetwork {
    fn ping(&self, conn: &ConnectionInfo) -> BoxFuture<Result<Duration, NetworkError>> {
        let network = self.clone();
        let conn = conn.clone();
        Box::pin(async move { network.probe(conn).await })
    }
}
