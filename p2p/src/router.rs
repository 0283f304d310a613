//! The router: binds transports, connections and channels together.
//!
//! The [`Router`] owns one [`Transport`] per protocol, every open
//! [`Channel`] and the [`PeerStore`]. It accepts and dials connections,
//! authenticates them against the expected [`PeerId`], and runs for each
//! connected peer and each open channel one send task and one receive task
//! over the stream whose ID equals the channel ID.
//!
//! ```text
//!                  ┌─────────── Router ───────────┐
//!   Reactor ⇄ Channel ⇄ dispatch ⇄ per-peer queue ⇄ Stream ⇄ Connection ⇄ Transport
//!                  └──────────────────────────────┘
//! ```
//!
//! Delivery is at-most-once: outbound envelopes for a peer that is not
//! connected are dropped, and nothing is retried. Messages from one peer on
//! one channel arrive in the order they were sent. Inbound payloads that do
//! not decode, and streams for channels that are not open, count as peer
//! errors.

use {
    crate::{
        channel::{Channel, ChannelId, ChannelParts, Envelope, PeerError},
        config::P2pConfig,
        endpoint::Endpoint,
        error::{P2pError, Result},
        key::{PeerId, PublicKey},
        message::Message,
        peer_store::{Penalty, PeerEntry, PeerStatus, PeerStore},
        transport::{Connection, Stream, Transport},
    },
    async_trait::async_trait,
    dashmap::{mapref::entry::Entry, DashMap},
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fmt,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio::{
        sync::{broadcast, mpsc, Semaphore},
        task::JoinHandle,
        time::{interval, sleep, timeout, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
};

/// Buffered peer updates per subscriber before lagging subscribers miss some.
const PEER_UPDATE_CAPACITY: usize = 128;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Whether a peer came up or went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdateStatus {
    /// The peer is connected and its channels are wired.
    Up,
    /// The peer was disconnected.
    Down,
}

/// A change in the set of connected peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerUpdate {
    /// The peer concerned.
    pub peer: PeerId,
    /// What happened to it.
    pub status: PeerUpdateStatus,
}

// ── Inbound sinks ───────────────────────────────────────────────────────────

enum Delivery {
    Delivered,
    Undecodable(P2pError),
    Closed,
}

/// Type-erased inbound end of a channel: decodes raw payloads into the
/// channel's message type and queues them for the reactor.
#[async_trait]
trait InboundSink: Send + Sync {
    async fn deliver(&self, from: PeerId, payload: &[u8], cancel: &CancellationToken) -> Delivery;

    fn is_closed(&self) -> bool;
}

struct TypedSink<M: Message> {
    inbound: mpsc::Sender<Envelope<M>>,
}

#[async_trait]
impl<M: Message> InboundSink for TypedSink<M> {
    async fn deliver(&self, from: PeerId, payload: &[u8], cancel: &CancellationToken) -> Delivery {
        let message = match M::decode(payload) {
            Ok(message) => message,
            Err(e) => return Delivery::Undecodable(e),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Delivery::Closed,
            sent = self.inbound.send(Envelope::inbound(from, message)) => match sent {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Closed,
            },
        }
    }

    fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

struct ChannelEntry {
    sink: Arc<dyn InboundSink>,
    generation: u64,
}

// ── Peers ───────────────────────────────────────────────────────────────────

/// Per-peer outbound queue for one channel.
struct PeerChannel {
    queue: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

struct PeerHandle {
    id: PeerId,
    conn: Arc<dyn Connection>,
    cancel: CancellationToken,
    channels: DashMap<ChannelId, PeerChannel>,
}

// ── Router ──────────────────────────────────────────────────────────────────

struct RouterInner {
    config: P2pConfig,
    local_key: PublicKey,
    local_id: PeerId,
    transports: HashMap<String, Arc<dyn Transport>>,
    channels: DashMap<ChannelId, ChannelEntry>,
    next_generation: AtomicU64,
    peers: DashMap<PeerId, Arc<PeerHandle>>,
    store: Mutex<PeerStore>,
    updates: broadcast::Sender<PeerUpdate>,
    dial_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Routes typed channel traffic between reactors and connected peers.
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router for `local_key` serving the given transports, one
    /// per protocol.
    pub fn new(
        config: P2pConfig,
        local_key: PublicKey,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<Self> {
        let mut by_protocol = HashMap::with_capacity(transports.len());
        for transport in transports {
            let protocol = transport.protocol().to_string();
            if by_protocol.insert(protocol.clone(), transport).is_some() {
                return Err(P2pError::DuplicateTransport(protocol));
            }
        }
        let (updates, _) = broadcast::channel(PEER_UPDATE_CAPACITY);
        let store = PeerStore::new(&config);
        let dial_permits = Arc::new(Semaphore::new(config.max_concurrent_dials.max(1)));
        Ok(Self {
            inner: Arc::new(RouterInner {
                local_id: local_key.peer_id(),
                local_key,
                transports: by_protocol,
                channels: DashMap::new(),
                next_generation: AtomicU64::new(0),
                peers: DashMap::new(),
                store: Mutex::new(store),
                updates,
                dial_permits,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        })
    }

    /// Our own peer ID.
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Our own public key.
    pub fn local_public_key(&self) -> PublicKey {
        self.inner.local_key
    }

    /// Open the channel `id` carrying messages of type `M`.
    ///
    /// Fails with [`P2pError::ChannelAlreadyOpen`] while another channel
    /// with the same ID is open. Dropping or closing the returned channel
    /// frees the ID.
    pub fn open_channel<M: Message>(&self, id: ChannelId) -> Result<Channel<M>> {
        self.inner.open_channel(id)
    }

    /// Subscribe to peer up/down notifications.
    pub fn subscribe_peer_updates(&self) -> broadcast::Receiver<PeerUpdate> {
        self.inner.updates.subscribe()
    }

    /// Start accepting on every transport and dialing known peers.
    pub fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(P2pError::RouterStopped);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut tasks = self.inner.tasks.lock();
        for transport in self.inner.transports.values() {
            for endpoint in transport.endpoints() {
                info!("router {} listening on {}", self.inner.local_id, endpoint);
            }
            tasks.push(tokio::spawn(
                Arc::clone(&self.inner).accept_loop(Arc::clone(transport)),
            ));
        }
        tasks.push(tokio::spawn(Arc::clone(&self.inner).dial_loop()));
        Ok(())
    }

    /// Stop the router: cancel in-flight accepts and dials, close all
    /// connections and transports, and release all channels.
    pub async fn stop(&self) {
        info!("stopping router {}", self.inner.local_id);
        self.inner.shutdown.cancel();
        let handles: Vec<_> = self
            .inner
            .peers
            .iter()
            .map(|peer| Arc::clone(peer.value()))
            .collect();
        for handle in handles {
            self.inner.remove_peer(&handle);
        }
        for transport in self.inner.transports.values() {
            if let Err(e) = transport.close().await {
                warn!("failed to close {} transport: {}", transport.protocol(), e);
            }
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Teach the router an endpoint for `peer`. The dial loop picks it up on
    /// its next round.
    pub fn add_peer_endpoint(&self, peer: PeerId, endpoint: Endpoint) -> Result<()> {
        endpoint.validate()?;
        if peer == self.inner.local_id {
            return Err(P2pError::SelfConnection);
        }
        if !self.inner.transports.contains_key(&endpoint.protocol) {
            return Err(P2pError::UnsupportedProtocol(endpoint.protocol));
        }
        self.inner.store.lock().add_endpoint(peer, endpoint);
        Ok(())
    }

    /// Teach the router several endpoints for `peer` at once. Returns how many
    /// were new. Nothing is stored if any endpoint is rejected.
    pub fn add_peer_endpoints(&self, peer: PeerId, endpoints: Vec<Endpoint>) -> Result<usize> {
        if peer == self.inner.local_id {
            return Err(P2pError::SelfConnection);
        }
        for endpoint in &endpoints {
            endpoint.validate()?;
            if !self.inner.transports.contains_key(&endpoint.protocol) {
                return Err(P2pError::UnsupportedProtocol(endpoint.protocol.clone()));
            }
        }
        Ok(self.inner.store.lock().add_endpoints(peer, endpoints))
    }

    /// Disconnect `peer` and forget everything known about it. Returns true
    /// if the peer store had an entry. A ban is forgotten too.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        self.inner.disconnect(peer);
        self.inner.store.lock().remove(peer).is_some()
    }

    /// Ban `peer` until [`unban_peer`](Self::unban_peer), disconnecting it
    /// if connected.
    pub fn ban_peer(&self, peer: PeerId) {
        self.inner.store.lock().ban(peer, None, Instant::now());
        self.inner.disconnect(&peer);
    }

    /// Lift a ban. Returns true if the peer was banned.
    pub fn unban_peer(&self, peer: &PeerId) -> bool {
        self.inner.store.lock().unban(peer)
    }

    /// Currently connected peers, sorted.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.inner.peers.iter().map(|peer| *peer.key()).collect();
        peers.sort();
        peers
    }

    /// Lifecycle state of `peer` as recorded in the peer store.
    pub fn peer_status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.inner.store.lock().status(peer)
    }

    /// Snapshot of the peer store entry for `peer`.
    pub fn peer_entry(&self, peer: &PeerId) -> Option<PeerEntry> {
        self.inner.store.lock().get(peer).cloned()
    }

    /// Endpoints to advertise to other peers, with wildcard listen IPs
    /// resolved through `external_ip`.
    pub fn advertised_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self
            .inner
            .transports
            .values()
            .flat_map(|transport| transport.endpoints())
            .map(|endpoint| endpoint.resolve_unspecified(self.inner.config.external_ip))
            .collect();
        endpoints.sort();
        endpoints.dedup();
        endpoints
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("local_id", &self.inner.local_id)
            .field("protocols", &self.inner.transports.keys().collect::<Vec<_>>())
            .field("peers", &self.inner.peers.len())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl RouterInner {
    // ── Channels ────────────────────────────────────────────────────────

    fn open_channel<M: Message>(self: &Arc<Self>, id: ChannelId) -> Result<Channel<M>> {
        if self.shutdown.is_cancelled() {
            return Err(P2pError::RouterStopped);
        }
        let (channel, parts) = Channel::<M>::new(id, self.config.queue_capacity);
        let ChannelParts {
            inbound,
            outbound,
            errors,
        } = parts;
        let sink: Arc<dyn InboundSink> = Arc::new(TypedSink { inbound });
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = ChannelEntry {
            sink: Arc::clone(&sink),
            generation,
        };

        let replaced_stale = match self.channels.entry(id) {
            Entry::Occupied(existing) if !existing.get().sink.is_closed() => {
                return Err(P2pError::ChannelAlreadyOpen(id));
            }
            Entry::Occupied(mut existing) => {
                existing.insert(entry);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                false
            }
        };
        if replaced_stale {
            self.unwire_channel(id);
        }
        debug!("opened channel {:#04x} for {}", id, std::any::type_name::<M>());

        let task = tokio::spawn(Arc::clone(self).dispatch(id, generation, outbound, errors));
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(task);
        }

        let peers: Vec<_> = self.peers.iter().map(|peer| Arc::clone(peer.value())).collect();
        for handle in peers {
            self.wire_channel(&handle, id, Arc::clone(&sink));
        }
        Ok(channel)
    }

    /// Drain one channel's outbound and error queues until the channel is
    /// closed or the router stops.
    async fn dispatch<M: Message>(
        self: Arc<Self>,
        id: ChannelId,
        generation: u64,
        mut outbound: mpsc::Receiver<Envelope<M>>,
        mut errors: mpsc::Receiver<PeerError>,
    ) {
        let mut errors_open = true;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                report = errors.recv(), if errors_open => match report {
                    Some(report) => self.penalize(report),
                    None => errors_open = false,
                },
                envelope = outbound.recv() => match envelope {
                    Some(envelope) => self.route(id, envelope).await,
                    None => break,
                },
            }
        }
        if self
            .channels
            .remove_if(&id, |_, entry| entry.generation == generation)
            .is_some()
        {
            debug!("closed channel {:#04x}", id);
            self.unwire_channel(id);
        }
    }

    /// Send one outbound envelope to its destination peers.
    async fn route<M: Message>(&self, id: ChannelId, envelope: Envelope<M>) {
        if !envelope.is_routable() {
            debug!("dropping envelope without destination on channel {:#04x}", id);
            return;
        }
        let payload = match envelope.message.encode_bounded(self.config.max_message_size) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode message on channel {:#04x}: {}", id, e);
                return;
            }
        };

        let targets: Vec<(PeerId, mpsc::Sender<Vec<u8>>, CancellationToken)> = if envelope.broadcast {
            self.peers
                .iter()
                .filter(|peer| Some(*peer.key()) != envelope.from)
                .filter_map(|peer| peer.outbound_queue(id))
                .collect()
        } else {
            envelope
                .to
                .and_then(|to| self.peers.get(&to).and_then(|peer| peer.outbound_queue(id)))
                .into_iter()
                .collect()
        };
        if targets.is_empty() {
            trace!(
                "no connected recipient for message on channel {:#04x} (to {:?})",
                id,
                envelope.to
            );
            return;
        }

        for (peer, queue, cancel) in targets {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => trace!("peer {} went away before send", peer),
                _ = self.shutdown.cancelled() => return,
                sent = queue.send(payload.clone()) => {
                    if sent.is_err() {
                        trace!("peer {} queue for channel {:#04x} closed", peer, id);
                    }
                }
            }
        }
    }

    // ── Peer wiring ─────────────────────────────────────────────────────

    /// Start the send and receive tasks for `id` on `handle`'s connection.
    fn wire_channel(self: &Arc<Self>, handle: &Arc<PeerHandle>, id: ChannelId, sink: Arc<dyn InboundSink>) {
        let stream = match handle.conn.stream(id) {
            Ok(stream) => stream,
            Err(e) => {
                debug!("peer {}: cannot open stream {:#04x}: {}", handle.id, id, e);
                return;
            }
        };
        let (queue, queue_rx) = mpsc::channel(self.config.peer_queue_capacity.max(1));
        let cancel = handle.cancel.child_token();
        match handle.channels.entry(id) {
            Entry::Occupied(_) => return,
            Entry::Vacant(vacant) => {
                vacant.insert(PeerChannel {
                    queue,
                    cancel: cancel.clone(),
                });
            }
        }
        trace!("peer {}: wired channel {:#04x}", handle.id, id);
        tokio::spawn(send_loop(
            Arc::clone(handle),
            Arc::clone(&stream),
            queue_rx,
            cancel.clone(),
        ));
        tokio::spawn(Arc::clone(self).recv_loop(Arc::clone(handle), stream, sink, cancel));
    }

    fn unwire_channel(&self, id: ChannelId) {
        for peer in self.peers.iter() {
            if let Some((_, channel)) = peer.channels.remove(&id) {
                channel.cancel.cancel();
                peer.conn.release_stream(id);
            }
        }
    }

    /// Read messages from one peer stream and hand them to the channel.
    async fn recv_loop(
        self: Arc<Self>,
        handle: Arc<PeerHandle>,
        stream: Arc<dyn Stream>,
        sink: Arc<dyn InboundSink>,
        cancel: CancellationToken,
    ) {
        let id = stream.id();
        loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                read = stream.read() => match read {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!("peer {}: read on channel {:#04x} failed: {}", handle.id, id, e);
                        handle.cancel.cancel();
                        return;
                    }
                },
            };
            trace!("peer {}: {} bytes on channel {:#04x}", handle.id, payload.len(), id);
            match sink.deliver(handle.id, &payload, &cancel).await {
                Delivery::Delivered => {}
                Delivery::Undecodable(e) => {
                    self.penalize(PeerError::new(
                        handle.id,
                        format!("undecodable message on channel {id:#04x}: {e}"),
                    ));
                    return;
                }
                Delivery::Closed => return,
            }
        }
    }

    /// Penalize peers that open streams for channels we do not serve.
    async fn watch_streams(self: Arc<Self>, handle: Arc<PeerHandle>) {
        loop {
            let id = tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => return,
                id = handle.conn.accept_stream() => match id {
                    Ok(id) => id,
                    Err(_) => return,
                },
            };
            if !self.channels.contains_key(&id) {
                self.penalize(PeerError::new(
                    handle.id,
                    format!("message on unknown channel {id:#04x}"),
                ));
                return;
            }
        }
    }

    /// Tear the peer down once its connection ends for any reason.
    async fn supervise(self: Arc<Self>, handle: Arc<PeerHandle>) {
        tokio::select! {
            _ = handle.cancel.cancelled() => {}
            _ = handle.conn.closed() => {}
            _ = self.shutdown.cancelled() => {}
        }
        self.remove_peer(&handle);
    }

    // ── Peer lifecycle ──────────────────────────────────────────────────

    /// Authenticate and register a fresh connection.
    ///
    /// `expected` is the peer we dialed, if any. On error the connection is
    /// closed and the peer is not registered.
    fn add_peer(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        expected: Option<PeerId>,
    ) -> Result<PeerId> {
        let result = self.register(&conn, expected);
        if result.is_err() {
            conn.close();
        }
        let handle = result?;
        let peer = handle.id;
        {
            let mut store = self.store.lock();
            store.mark_connected(peer, conn.remote_endpoint(), expected.is_some());
        }
        let channels: Vec<_> = self
            .channels
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(&entry.sink)))
            .collect();
        for (id, sink) in channels {
            self.wire_channel(&handle, id, sink);
        }
        tokio::spawn(Arc::clone(self).watch_streams(Arc::clone(&handle)));
        tokio::spawn(Arc::clone(self).supervise(handle));

        info!(
            "peer {} up ({} {})",
            peer,
            if expected.is_some() { "dialed" } else { "accepted" },
            conn.remote_endpoint()
        );
        let _ = self.updates.send(PeerUpdate {
            peer,
            status: PeerUpdateStatus::Up,
        });
        Ok(peer)
    }

    fn register(&self, conn: &Arc<dyn Connection>, expected: Option<PeerId>) -> Result<Arc<PeerHandle>> {
        if self.shutdown.is_cancelled() {
            return Err(P2pError::RouterStopped);
        }
        let peer = conn.remote_public_key().peer_id();
        if peer == self.local_id {
            return Err(P2pError::SelfConnection);
        }
        if let Some(expected) = expected {
            if expected != peer {
                return Err(P2pError::AuthenticationFailed {
                    expected,
                    actual: peer,
                });
            }
        }
        if self.store.lock().is_banned(&peer, Instant::now()) {
            return Err(P2pError::PeerBanned(peer));
        }
        match self.peers.entry(peer) {
            Entry::Occupied(_) => Err(P2pError::PeerAlreadyConnected(peer)),
            // Counted under the entry's shard lock, so concurrent registrations
            // cannot both take the last slot.
            Entry::Vacant(_) if self.peers.len() >= self.config.max_connections => {
                Err(P2pError::MaxConnectionsReached(self.config.max_connections))
            }
            Entry::Vacant(vacant) => {
                let handle = Arc::new(PeerHandle {
                    id: peer,
                    conn: Arc::clone(conn),
                    cancel: self.shutdown.child_token(),
                    channels: DashMap::new(),
                });
                vacant.insert(Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    /// Deregister `handle` and close its connection. Idempotent.
    fn remove_peer(&self, handle: &Arc<PeerHandle>) {
        let removed = self
            .peers
            .remove_if(&handle.id, |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        if removed {
            self.store.lock().mark_disconnecting(&handle.id);
        }
        handle.cancel.cancel();
        handle.conn.close();
        handle.channels.clear();
        if removed {
            self.store.lock().mark_disconnected(&handle.id);
            info!("peer {} down", handle.id);
            let _ = self.updates.send(PeerUpdate {
                peer: handle.id,
                status: PeerUpdateStatus::Down,
            });
        }
    }

    /// Ask the connection to `peer`, if any, to shut down.
    fn disconnect(&self, peer: &PeerId) {
        let handle = self.peers.get(peer).map(|handle| Arc::clone(handle.value()));
        if let Some(handle) = handle {
            self.remove_peer(&handle);
        }
    }

    /// Apply the penalty policy to a peer error report.
    fn penalize(&self, report: PeerError) {
        let penalty = self
            .store
            .lock()
            .record_error(report.peer, report.severity, Instant::now());
        match penalty {
            Penalty::Disconnect => warn!("disconnecting {}", report),
            Penalty::Ban => warn!("banning {}", report),
        }
        self.disconnect(&report.peer);
    }

    // ── Accepting and dialing ───────────────────────────────────────────

    async fn accept_loop(self: Arc<Self>, transport: Arc<dyn Transport>) {
        loop {
            let conn = match transport.accept(&self.shutdown).await {
                Ok(conn) => conn,
                Err(e) if e.is_shutdown() => break,
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    warn!("{} accept failed: {}", transport.protocol(), e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(ACCEPT_RETRY_DELAY) => continue,
                    }
                }
            };
            let peer = conn.remote_public_key().peer_id();
            self.store.lock().mark_accepting(peer);
            if let Err(e) = self.add_peer(conn, None) {
                self.store.lock().abort_accepting(&peer);
                if e.is_shutdown() {
                    break;
                }
                debug!("rejected inbound connection from {}: {}", peer, e);
            }
        }
        debug!("{} accept loop stopped", transport.protocol());
    }

    async fn dial_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.dial_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let available = self.dial_permits.available_permits();
            if available == 0 {
                continue;
            }
            let candidates: Vec<_> = {
                let mut store = self.store.lock();
                let candidates: Vec<_> = store
                    .dial_candidates(Instant::now(), available)
                    .into_iter()
                    .filter(|(peer, _)| *peer != self.local_id && !self.peers.contains_key(peer))
                    .collect();
                for (peer, _) in &candidates {
                    store.mark_dialing(*peer);
                }
                candidates
            };
            for (peer, endpoints) in candidates {
                let Ok(permit) = Arc::clone(&self.dial_permits).try_acquire_owned() else {
                    self.store.lock().record_dial_failure(&peer, Instant::now());
                    continue;
                };
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    inner.dial_peer(peer, endpoints).await;
                    drop(permit);
                });
            }
        }
        debug!("dial loop stopped");
    }

    /// Try each endpoint of `peer` in turn until one connects.
    async fn dial_peer(self: &Arc<Self>, peer: PeerId, endpoints: Vec<Endpoint>) {
        for endpoint in endpoints {
            let Some(transport) = self.transports.get(&endpoint.protocol) else {
                debug!("no transport for {}, skipping", endpoint);
                continue;
            };
            debug!("dialing {} at {}", peer, endpoint);
            let dialed = timeout(
                self.config.dial_timeout,
                transport.dial(&self.shutdown, &endpoint),
            )
            .await;
            let conn = match dialed {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) if e.is_shutdown() => return,
                Ok(Err(e)) => {
                    debug!("dial {} at {} failed: {}", peer, endpoint, e);
                    continue;
                }
                Err(_) => {
                    debug!("dial {} at {} timed out", peer, endpoint);
                    continue;
                }
            };
            self.store.lock().mark_authenticating(peer);
            match self.add_peer(conn, Some(peer)) {
                Ok(_) | Err(P2pError::PeerAlreadyConnected(_)) => return,
                Err(e) if e.is_shutdown() => return,
                Err(e) => {
                    warn!("dialed {} at {} but rejected it: {}", peer, endpoint, e);
                    break;
                }
            }
        }
        self.store.lock().record_dial_failure(&peer, Instant::now());
    }
}

impl PeerHandle {
    fn outbound_queue(
        &self,
        id: ChannelId,
    ) -> Option<(PeerId, mpsc::Sender<Vec<u8>>, CancellationToken)> {
        self.channels
            .get(&id)
            .map(|channel| (self.id, channel.queue.clone(), self.cancel.clone()))
    }
}

/// Write queued payloads for one channel to the peer's stream, one write per
/// message.
async fn send_loop(
    handle: Arc<PeerHandle>,
    stream: Arc<dyn Stream>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            payload = queue.recv() => match payload {
                Some(payload) => payload,
                None => return,
            },
        };
        if let Err(e) = stream.write(&payload).await {
            debug!(
                "peer {}: write on channel {:#04x} failed: {}",
                handle.id,
                stream.id(),
                e
            );
            handle.cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::transport::{memory::MEMORY_PROTOCOL, MemoryNetwork, MuxConfig},
        assert_matches::assert_matches,
        serde::{Deserialize, Serialize},
        std::time::Duration,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Ping {
        Ping(u64),
        Pong(u64),
    }

    struct Node {
        router: Router,
        endpoint: Endpoint,
    }

    fn node(network: &MemoryNetwork, name: &str, config: P2pConfig) -> Node {
        let key = PublicKey::new_unique();
        let transport = network
            .transport(name, key, MuxConfig::from(&config))
            .unwrap();
        let endpoint = transport.endpoint().clone();
        let router = Router::new(config, key, vec![Arc::new(transport)]).unwrap();
        Node { router, endpoint }
    }

    async fn wait_for_update(
        updates: &mut broadcast::Receiver<PeerUpdate>,
        status: PeerUpdateStatus,
    ) -> PeerId {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let update = updates.recv().await.unwrap();
                if update.status == status {
                    return update.peer;
                }
            }
        })
        .await
        .expect("peer update")
    }

    #[tokio::test]
    async fn test_duplicate_channel_rejected_until_closed() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", P2pConfig::dev_default());
        let channel = a.router.open_channel::<Ping>(0x20).unwrap();
        assert_matches!(
            a.router.open_channel::<Ping>(0x20).map(|_| ()),
            Err(P2pError::ChannelAlreadyOpen(0x20))
        );
        channel.close();
        let reopened = a.router.open_channel::<u64>(0x20).unwrap();
        assert_eq!(reopened.id(), 0x20);
    }

    #[tokio::test]
    async fn test_duplicate_transport_rejected() {
        let network = MemoryNetwork::new();
        let key = PublicKey::new_unique();
        let config = P2pConfig::dev_default();
        let t1 = network.transport("x", key, MuxConfig::from(&config)).unwrap();
        let t2 = network.transport("y", key, MuxConfig::from(&config)).unwrap();
        let result = Router::new(config, key, vec![Arc::new(t1), Arc::new(t2)]);
        assert_matches!(result.map(|_| ()), Err(P2pError::DuplicateTransport(p)) if p == MEMORY_PROTOCOL);
    }

    #[tokio::test]
    async fn test_add_peer_endpoint_validation() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", P2pConfig::dev_default());
        let peer = PublicKey::new_unique().peer_id();
        assert_matches!(
            a.router.add_peer_endpoint(a.router.local_peer_id(), a.endpoint.clone()),
            Err(P2pError::SelfConnection)
        );
        let tcp = Endpoint::networked("tcp", "127.0.0.1:26656".parse().unwrap());
        assert_matches!(
            a.router.add_peer_endpoint(peer, tcp),
            Err(P2pError::UnsupportedProtocol(_))
        );
        a.router
            .add_peer_endpoint(peer, Endpoint::local(MEMORY_PROTOCOL, "b"))
            .unwrap();
        assert_eq!(a.router.peer_status(&peer), Some(PeerStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_add_peer_endpoints_and_remove_peer() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", P2pConfig::dev_default());
        let peer = PublicKey::new_unique().peer_id();
        let b = Endpoint::local(MEMORY_PROTOCOL, "b");
        let c = Endpoint::local(MEMORY_PROTOCOL, "c");
        let tcp = Endpoint::networked("tcp", "127.0.0.1:26656".parse().unwrap());

        assert_matches!(
            a.router.add_peer_endpoints(peer, vec![c.clone(), tcp]),
            Err(P2pError::UnsupportedProtocol(_))
        );
        assert_eq!(a.router.peer_entry(&peer).map(|_| ()), None);
        assert_matches!(
            a.router.add_peer_endpoints(a.router.local_peer_id(), vec![b.clone()]),
            Err(P2pError::SelfConnection)
        );

        assert_eq!(a.router.add_peer_endpoints(peer, vec![b.clone()]).unwrap(), 1);
        assert_eq!(a.router.add_peer_endpoints(peer, vec![b, c]).unwrap(), 1);
        assert_eq!(a.router.peer_entry(&peer).unwrap().endpoints.len(), 2);

        assert!(a.router.remove_peer(&peer));
        assert_eq!(a.router.peer_status(&peer), None);
        assert!(!a.router.remove_peer(&peer));
    }

    #[tokio::test]
    async fn test_remove_peer_disconnects() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", P2pConfig::dev_default());
        let b = node(&network, "b", P2pConfig::dev_default());
        let mut a_updates = a.router.subscribe_peer_updates();
        let b_id = b.router.local_peer_id();
        a.router.add_peer_endpoint(b_id, b.endpoint.clone()).unwrap();
        a.router.start().unwrap();
        b.router.start().unwrap();
        wait_for_update(&mut a_updates, PeerUpdateStatus::Up).await;

        assert!(a.router.remove_peer(&b_id));
        assert_eq!(wait_for_update(&mut a_updates, PeerUpdateStatus::Down).await, b_id);
        assert!(a.router.connected_peers().is_empty());
        assert_eq!(a.router.peer_status(&b_id), None);

        a.router.stop().await;
        b.router.stop().await;
    }

    #[tokio::test]
    async fn test_max_connections_holds_under_concurrent_inbound() {
        let network = MemoryNetwork::new();
        let hub_config = P2pConfig {
            max_connections: 1,
            ..P2pConfig::dev_default()
        };
        let hub = node(&network, "hub", hub_config);
        let mut hub_updates = hub.router.subscribe_peer_updates();
        hub.router.start().unwrap();

        let hub_id = hub.router.local_peer_id();
        let mut dialers = Vec::new();
        for i in 0..6 {
            let dialer = node(&network, &format!("d{i}"), P2pConfig::dev_default());
            dialer
                .router
                .add_peer_endpoint(hub_id, hub.endpoint.clone())
                .unwrap();
            dialers.push(dialer);
        }
        for dialer in &dialers {
            dialer.router.start().unwrap();
        }

        wait_for_update(&mut hub_updates, PeerUpdateStatus::Up).await;
        for _ in 0..20 {
            assert_eq!(hub.router.connected_peers().len(), 1);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for dialer in &dialers {
            dialer.router.stop().await;
        }
        hub.router.stop().await;
    }

    #[tokio::test]
    async fn test_dial_connects_and_routes() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", P2pConfig::dev_default());
        let b = node(&network, "b", P2pConfig::dev_default());
        let mut a_channel = a.router.open_channel::<Ping>(0x20).unwrap();
        let mut b_channel = b.router.open_channel::<Ping>(0x20).unwrap();
        let mut a_updates = a.router.subscribe_peer_updates();
        let mut b_updates = b.router.subscribe_peer_updates();

        let b_id = b.router.local_peer_id();
        a.router.add_peer_endpoint(b_id, b.endpoint.clone()).unwrap();
        a.router.start().unwrap();
        b.router.start().unwrap();
        assert_eq!(wait_for_update(&mut a_updates, PeerUpdateStatus::Up).await, b_id);
        wait_for_update(&mut b_updates, PeerUpdateStatus::Up).await;
        assert_eq!(a.router.connected_peers(), vec![b_id]);
        assert_eq!(a.router.peer_status(&b_id), Some(PeerStatus::Connected));

        a_channel.send(Envelope::to(b_id, Ping::Ping(7))).await.unwrap();
        let received = b_channel.recv().await.unwrap();
        assert_eq!(received.from, Some(a.router.local_peer_id()));
        assert_eq!(received.message, Ping::Ping(7));

        b_channel
            .send(Envelope::to(a.router.local_peer_id(), Ping::Pong(7)))
            .await
            .unwrap();
        assert_eq!(a_channel.recv().await.unwrap().message, Ping::Pong(7));

        a.router.stop().await;
        b.router.stop().await;
    }

    #[tokio::test]
    async fn test_ban_disconnects_and_blocks_redial() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", P2pConfig::dev_default());
        let b = node(&network, "b", P2pConfig::dev_default());
        let mut a_updates = a.router.subscribe_peer_updates();
        let b_id = b.router.local_peer_id();
        a.router.add_peer_endpoint(b_id, b.endpoint.clone()).unwrap();
        a.router.start().unwrap();
        b.router.start().unwrap();
        wait_for_update(&mut a_updates, PeerUpdateStatus::Up).await;

        a.router.ban_peer(b_id);
        assert_eq!(wait_for_update(&mut a_updates, PeerUpdateStatus::Down).await, b_id);
        assert_eq!(a.router.peer_status(&b_id), Some(PeerStatus::Banned));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(a.router.connected_peers().is_empty());

        assert!(a.router.unban_peer(&b_id));
        assert_eq!(wait_for_update(&mut a_updates, PeerUpdateStatus::Up).await, b_id);

        a.router.stop().await;
        b.router.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_final() {
        let network = MemoryNetwork::new();
        let a = node(&network, "a", P2pConfig::dev_default());
        a.router.start().unwrap();
        a.router.stop().await;
        assert!(a.router.is_stopped());
        assert_matches!(a.router.start(), Err(P2pError::RouterStopped));
        assert_matches!(
            a.router.open_channel::<Ping>(1).map(|_| ()),
            Err(P2pError::RouterStopped)
        );
    }

    #[tokio::test]
    async fn test_advertised_endpoints_resolve_wildcards() {
        let config = P2pConfig {
            external_ip: Some("203.0.113.7".parse().unwrap()),
            ..P2pConfig::dev_default()
        };
        let key = PublicKey::new_unique();
        let transport = crate::transport::TcpTransport::bind(
            "0.0.0.0:0".parse().unwrap(),
            key,
            MuxConfig::from(&config),
        )
        .await
        .unwrap();
        let port = transport.local_addr().port();
        let router = Router::new(config, key, vec![Arc::new(transport)]).unwrap();
        assert_eq!(
            router.advertised_endpoints(),
            vec![Endpoint::networked(
                "tcp",
                std::net::SocketAddr::new("203.0.113.7".parse().unwrap(), port)
            )]
        );
    }
}
