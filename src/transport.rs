//! UDP transport: master-port election, seed bootstrap, and the peer node
//! backing [`UdpDht`].
//!
//! Every node tries to bind the one conventional master port so seed lists
//! can be written once and never touched. Losing the race is fine: the node
//! falls back to a random high port, dials the seeds, and periodically
//! probes whether the master port has freed up.
//!
//! The wire is a small bincode-encoded message set. `Store` replicates a
//! counter write to peers fire-and-forget; `Locate`/`Found` implement the
//! replica read that `get` merges by decayed maximum; `Ping`/`Pong` give the
//! bootstrap a liveness probe. Peers running the same codec interoperate;
//! nothing else is promised about the bits.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::oneshot;

use crate::clock::Clock;
use crate::counter::{CounterStore, DecayingCounter};
use crate::dht::Dht;
use crate::error::LimiterError;
use crate::{BIND_ATTEMPTS, DEFAULT_PORT};

/// The maximum length of a datagram in bytes.
const MAX_DATAGRAM: usize = 8196;

/// Ports drawn when the master port is taken.
const FALLBACK_PORTS: std::ops::Range<u16> = 1024..64023;

/// How long a replica read or liveness probe waits for an answer.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// A peer address from configuration.
///
/// Deserializes from either a bare string (`"limits.internal"` or
/// `"limits.internal:3051"`, defaulting to the master port) or a
/// `{ address, port }` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "SeedRepr")]
pub struct Seed {
    pub address: String,
    pub port: u16,
}

impl Seed {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port }
    }
}

impl From<&str> for Seed {
    fn from(raw: &str) -> Self {
        match raw.rsplit_once(':') {
            Some((address, port)) => match port.parse() {
                Ok(port) => Self::new(address, port),
                Err(_) => Self::new(raw, DEFAULT_PORT),
            },
            None => Self::new(raw, DEFAULT_PORT),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedRepr {
    Bare(String),
    Full {
        address: String,
        #[serde(default = "default_seed_port")]
        port: u16,
    },
}

fn default_seed_port() -> u16 {
    DEFAULT_PORT
}

impl From<SeedRepr> for Seed {
    fn from(repr: SeedRepr) -> Self {
        match repr {
            SeedRepr::Bare(raw) => Seed::from(raw.as_str()),
            SeedRepr::Full { address, port } => Seed::new(address, port),
        }
    }
}

/// Wire messages exchanged between peer nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Message {
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Store { key: Vec<u8>, value: f64, last_touched: u64 },
    Locate { nonce: u64, key: Vec<u8> },
    Found { nonce: u64, entry: Option<(f64, u64)> },
}

/// Outcome of the bind race for the master port.
pub(crate) struct Binding {
    pub socket: UdpSocket,
    pub addr: SocketAddr,
    pub master: bool,
}

impl Binding {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Bind the conventional master port, or fall back to a random high port.
///
/// The first node on a host wins the master port and keeps the identity the
/// seed lists advertise. Later nodes (or a restart racing its predecessor's
/// socket teardown) draw up to [`BIND_ATTEMPTS`] random ports; running out
/// fails the whole setup.
pub(crate) async fn bind_with_fallback(
    address: &str,
    master_port: u16,
) -> Result<Binding, LimiterError> {
    let mut last = match bind_one(address, master_port).await {
        Ok((socket, addr)) => {
            tracing::info!(port = master_port, "bound master port");
            return Ok(Binding { socket, addr, master: true });
        }
        Err(err) => {
            tracing::warn!(port = master_port, error = %err, "master port taken, falling back");
            err
        }
    };

    for attempt in 1..=BIND_ATTEMPTS {
        let port: u16 = rand::rng().random_range(FALLBACK_PORTS);
        match bind_one(address, port).await {
            Ok((socket, addr)) => {
                tracing::info!(port, "bound fallback port");
                return Ok(Binding { socket, addr, master: false });
            }
            Err(err) => {
                tracing::warn!(attempt, port, error = %err, "fallback bind failed");
                last = err;
            }
        }
    }
    Err(LimiterError::Bind { attempts: BIND_ATTEMPTS, source: last })
}

async fn bind_one(address: &str, port: u16) -> io::Result<(UdpSocket, SocketAddr)> {
    let socket = UdpSocket::bind((address, port)).await?;
    let addr = socket.local_addr()?;
    Ok((socket, addr))
}

/// Resolve seeds to socket addresses, skipping the node's own contact.
pub(crate) async fn resolve_peers(
    seeds: &[Seed],
    local_address: &str,
    local_port: u16,
) -> Result<Vec<SocketAddr>, LimiterError> {
    let local: Vec<SocketAddr> = match lookup_host((local_address, local_port)).await {
        Ok(addrs) => addrs.collect(),
        Err(_) => Vec::new(),
    };

    let mut peers: Vec<SocketAddr> = Vec::new();
    for seed in seeds {
        let target = format!("{}:{}", seed.address, seed.port);
        let addrs: Vec<SocketAddr> = lookup_host((seed.address.as_str(), seed.port))
            .await
            .map_err(|source| LimiterError::Resolve { seed: target.clone(), source })?
            .collect();
        if addrs.is_empty() {
            return Err(LimiterError::Resolve {
                seed: target,
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            });
        }
        if addrs.iter().any(|a| local.contains(a)) {
            // Nodes do not dial themselves.
            continue;
        }
        let addr = addrs[0];
        if !peers.contains(&addr) {
            peers.push(addr);
        }
    }
    Ok(peers)
}

/// A live peer node: local counter store plus replication to seeds.
///
/// `put` stores locally and ships the post-write pair to every peer without
/// waiting for acknowledgement; `get` asks every peer for its replica and
/// merges whatever answers within the request timeout. A background task
/// serves the same requests from peers and sweeps cold counters once per
/// half-life.
pub struct UdpDht {
    socket: Arc<UdpSocket>,
    store: Arc<CounterStore>,
    peers: Vec<SocketAddr>,
    clock: Arc<dyn Clock>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>,
    next_nonce: AtomicU64,
    local_addr: SocketAddr,
    recv_task: tokio::task::JoinHandle<()>,
}

impl UdpDht {
    /// Take ownership of a bound socket and start serving peers.
    pub fn new(
        socket: UdpSocket,
        local_addr: SocketAddr,
        peers: Vec<SocketAddr>,
        clock: Arc<dyn Clock>,
        half_life: Duration,
        min_value: f64,
    ) -> Self {
        let socket = Arc::new(socket);
        let store = Arc::new(CounterStore::new(half_life, min_value));
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let recv_task = tokio::spawn(receive_loop(
            socket.clone(),
            store.clone(),
            pending.clone(),
            clock.clone(),
            half_life,
        ));

        Self {
            socket,
            store,
            peers,
            clock,
            pending,
            next_nonce: AtomicU64::new(1),
            local_addr,
            recv_task,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    /// The node's own counter store, for inspection in tests.
    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// Probe one peer; true when it answered within the request timeout.
    pub async fn ping(&self, peer: SocketAddr) -> bool {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let rx = self.register(nonce);
        let frame = match bincode::serialize(&Message::Ping { nonce }) {
            Ok(frame) => frame,
            Err(_) => {
                self.unregister(nonce);
                return false;
            }
        };
        if self.socket.send_to(&frame, peer).await.is_err() {
            self.unregister(nonce);
            return false;
        }
        let answered = matches!(
            tokio::time::timeout(REQUEST_TIMEOUT, rx).await,
            Ok(Ok(Message::Pong { .. }))
        );
        self.unregister(nonce);
        answered
    }

    /// Ping every configured seed; silence is logged, never fatal.
    pub(crate) async fn dial_seeds(&self) {
        let probes = self.peers.iter().map(|&peer| async move {
            let answered = self.ping(peer).await;
            (peer, answered)
        });
        for (peer, answered) in futures::future::join_all(probes).await {
            if answered {
                tracing::debug!(%peer, "seed answered");
            } else {
                tracing::debug!(%peer, "seed silent");
            }
        }
    }

    fn register(&self, nonce: u64) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(nonce, tx);
        rx
    }

    fn unregister(&self, nonce: u64) {
        self.pending.lock().unwrap().remove(&nonce);
    }
}

impl Drop for UdpDht {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

#[async_trait]
impl Dht for UdpDht {
    async fn put(
        &self,
        key: &[u8],
        delta: f64,
    ) -> Result<f64, Box<dyn std::error::Error + Send + Sync>> {
        let now = self.clock.now_millis();
        let value = self.store.add(key, delta, now);

        // Replicate the post-write pair; failures are the peers' problem.
        let frame = bincode::serialize(&Message::Store {
            key: key.to_vec(),
            value,
            last_touched: now,
        })?;
        for peer in &self.peers {
            if let Err(err) = self.socket.send_to(&frame, peer).await {
                tracing::debug!(%peer, error = %err, "replication send failed");
            }
        }
        Ok(value)
    }

    async fn get(&self, key: &[u8]) -> Result<f64, Box<dyn std::error::Error + Send + Sync>> {
        let mut nonces = Vec::with_capacity(self.peers.len());
        let mut reads = Vec::with_capacity(self.peers.len());
        for &peer in &self.peers {
            let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
            let rx = self.register(nonce);
            let frame = bincode::serialize(&Message::Locate { nonce, key: key.to_vec() })?;
            if self.socket.send_to(&frame, peer).await.is_err() {
                self.unregister(nonce);
                continue;
            }
            nonces.push(nonce);
            reads.push(rx);
        }

        let replies = futures::future::join_all(reads.into_iter().map(|rx| async move {
            match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
                Ok(Ok(Message::Found { entry, .. })) => entry,
                _ => None,
            }
        }))
        .await;
        for nonce in nonces {
            self.unregister(nonce);
        }

        // Decay-then-max across the local replica and everything that answered.
        let now = self.clock.now_millis();
        let half_life = self.store.half_life();
        let mut merged = self.store.value(key, now);
        for (value, last_touched) in replies.into_iter().flatten() {
            merged = merged.max(DecayingCounter::new(value, last_touched).value_at(now, half_life));
        }
        Ok(merged)
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    store: Arc<CounterStore>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>,
    clock: Arc<dyn Clock>,
    half_life: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(half_life.max(Duration::from_millis(1)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                store.sweep(clock.now_millis());
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::debug!(error = %err, "receive failed");
                        continue;
                    }
                };
                let message = match bincode::deserialize::<Message>(&buf[..len]) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::debug!(%from, error = %err, "undecodable datagram");
                        continue;
                    }
                };
                match message {
                    Message::Ping { nonce } => {
                        reply(&socket, from, &Message::Pong { nonce }).await;
                    }
                    Message::Store { key, value, last_touched } => {
                        store.absorb(&key, value, last_touched, clock.now_millis());
                    }
                    Message::Locate { nonce, key } => {
                        let entry = store.peek(&key);
                        reply(&socket, from, &Message::Found { nonce, entry }).await;
                    }
                    Message::Pong { nonce } | Message::Found { nonce, .. } => {
                        if let Some(waiter) = pending.lock().unwrap().remove(&nonce) {
                            let _ = waiter.send(message);
                        }
                    }
                }
            }
        }
    }
}

async fn reply(socket: &UdpSocket, to: SocketAddr, message: &Message) {
    let frame = match bincode::serialize(message) {
        Ok(frame) => frame,
        Err(_) => return,
    };
    if let Err(err) = socket.send_to(&frame, to).await {
        tracing::debug!(%to, error = %err, "reply send failed");
    }
}
