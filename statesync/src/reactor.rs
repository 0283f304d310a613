//! The state-sync reactor.
//!
//! Serves local snapshots to peers and collects the snapshots peers offer.
//!
//! - A `SnapshotsRequest` is answered with one `SnapshotsResponse` per
//!   local snapshot, newest first (height, then format, descending), capped
//!   at `max_advertised_snapshots`. No snapshots means no responses.
//! - A `ChunkRequest` is answered with exactly one `ChunkResponse` built by
//!   [`ChunkResponse::from_loaded`].
//! - Received `SnapshotsResponse`s are validated and pooled; invalid ones
//!   are reported as peer errors. Received `ChunkResponse`s are handed to
//!   the chunk consumer, if one is attached.
//! - A failing application query drops the request that caused it and
//!   nothing else.

use {
    crate::{
        app::{AppConnSnapshot, Snapshot},
        config::StateSyncConfig,
        error::{Result, StateSyncError},
        messages::{ChunkMessage, ChunkRequest, ChunkResponse, SnapshotMessage, SnapshotsResponse},
        snapshots::SnapshotPool,
    },
    log::{debug, info, trace, warn},
    parking_lot::RwLock,
    std::{cmp::Reverse, sync::Arc},
    tokio::sync::{broadcast, mpsc},
    tokio_util::sync::CancellationToken,
    trv1_p2p::{
        Channel, Envelope, P2pError, PeerError, PeerId, PeerUpdate, PeerUpdateStatus,
    },
};

/// Queued commands per reactor.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// A chunk received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedChunk {
    pub peer: PeerId,
    pub response: ChunkResponse,
}

enum Command {
    RequestChunk { peer: PeerId, request: ChunkRequest },
}

enum Event {
    Snapshot(Option<Envelope<SnapshotMessage>>),
    Chunk(Option<Envelope<ChunkMessage>>),
    Peer(std::result::Result<PeerUpdate, broadcast::error::RecvError>),
    Command(Option<Command>),
}

/// Cloneable access to a running [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    commands: mpsc::Sender<Command>,
    pool: Arc<RwLock<SnapshotPool>>,
}

impl ReactorHandle {
    /// Ask `peer` for one chunk. The answer goes to the chunk consumer.
    pub async fn request_chunk(&self, peer: PeerId, height: u64, format: u32, index: u32) -> Result<()> {
        let request = ChunkRequest {
            height,
            format,
            index,
        };
        self.commands
            .send(Command::RequestChunk { peer, request })
            .await
            .map_err(|_| StateSyncError::Stopped)
    }

    /// The best snapshot offered so far and the peers offering it.
    pub fn best_snapshot(&self) -> Option<(Snapshot, Vec<PeerId>)> {
        let pool = self.pool.read();
        pool.best().map(|snapshot| {
            let peers = pool.peers(&snapshot);
            (snapshot, peers)
        })
    }

    /// Number of distinct snapshots offered by connected peers.
    pub fn snapshot_count(&self) -> usize {
        self.pool.read().len()
    }
}

/// Serves and discovers snapshots over the snapshot and chunk channels.
pub struct Reactor {
    config: StateSyncConfig,
    app: Arc<dyn AppConnSnapshot>,
    snapshot_channel: Channel<SnapshotMessage>,
    chunk_channel: Channel<ChunkMessage>,
    peer_updates: Option<broadcast::Receiver<PeerUpdate>>,
    chunk_consumer: Option<mpsc::Sender<ReceivedChunk>>,
    pool: Arc<RwLock<SnapshotPool>>,
    commands: mpsc::Receiver<Command>,
    commands_tx: mpsc::Sender<Command>,
}

impl Reactor {
    pub fn new(
        config: StateSyncConfig,
        app: Arc<dyn AppConnSnapshot>,
        snapshot_channel: Channel<SnapshotMessage>,
        chunk_channel: Channel<ChunkMessage>,
        peer_updates: broadcast::Receiver<PeerUpdate>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Self {
            config,
            app,
            snapshot_channel,
            chunk_channel,
            peer_updates: Some(peer_updates),
            chunk_consumer: None,
            pool: Arc::new(RwLock::new(SnapshotPool::new())),
            commands,
            commands_tx,
        }
    }

    /// Deliver received chunks to `consumer`.
    pub fn with_chunk_consumer(mut self, consumer: mpsc::Sender<ReceivedChunk>) -> Self {
        self.chunk_consumer = Some(consumer);
        self
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            commands: self.commands_tx.clone(),
            pool: Arc::clone(&self.pool),
        }
    }

    /// Send a [`ChunkRequest`] to `peer`.
    pub async fn request_chunk(&self, peer: PeerId, request: ChunkRequest) -> Result<()> {
        debug!(
            "requesting chunk {}/{}/{} from {}",
            request.height, request.format, request.index, peer
        );
        self.chunk_channel
            .send(Envelope::to(peer, ChunkMessage::ChunkRequest(request)))
            .await?;
        Ok(())
    }

    /// Process messages until `cancel` fires or the router releases the
    /// channels.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            "state-sync reactor running on channels {:#04x}/{:#04x}",
            self.snapshot_channel.id(),
            self.chunk_channel.id()
        );
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                update = recv_update(&mut self.peer_updates) => Event::Peer(update),
                command = self.commands.recv() => Event::Command(command),
                envelope = self.snapshot_channel.recv() => Event::Snapshot(envelope),
                envelope = self.chunk_channel.recv() => Event::Chunk(envelope),
            };
            let result = match event {
                Event::Snapshot(Some(envelope)) => self.on_snapshot_message(envelope).await,
                Event::Chunk(Some(envelope)) => self.on_chunk_message(envelope).await,
                Event::Snapshot(None) | Event::Chunk(None) => break,
                Event::Peer(Ok(update)) => self.on_peer_update(update).await,
                Event::Peer(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!("missed {} peer updates", missed);
                    Ok(())
                }
                Event::Peer(Err(broadcast::error::RecvError::Closed)) => {
                    self.peer_updates = None;
                    Ok(())
                }
                Event::Command(Some(Command::RequestChunk { peer, request })) => {
                    self.request_chunk(peer, request).await
                }
                Event::Command(None) => Ok(()),
            };
            match result {
                Ok(()) => {}
                Err(StateSyncError::P2p(P2pError::ChannelClosed)) => break,
                Err(e) => warn!("state-sync: {}", e),
            }
        }
        info!("state-sync reactor stopped");
        Ok(())
    }

    async fn on_snapshot_message(&self, envelope: Envelope<SnapshotMessage>) -> Result<()> {
        let Some(from) = envelope.from else {
            return Ok(());
        };
        match envelope.message {
            SnapshotMessage::SnapshotsRequest => {
                let snapshots = match self.app.list_snapshots().await {
                    Ok(snapshots) => snapshots,
                    Err(e) => {
                        warn!("failed to list snapshots for {}: {}", from, e);
                        return Ok(());
                    }
                };
                let snapshots = newest_snapshots(snapshots, self.config.max_advertised_snapshots);
                debug!("advertising {} snapshot(s) to {}", snapshots.len(), from);
                for snapshot in snapshots {
                    let response = SnapshotMessage::SnapshotsResponse(snapshot.into());
                    self.snapshot_channel
                        .send(Envelope::to(from, response))
                        .await?;
                }
            }
            SnapshotMessage::SnapshotsResponse(response) => {
                if let Err(reason) = validate_snapshot(&response) {
                    self.snapshot_channel
                        .report(PeerError::new(from, reason))
                        .await?;
                    return Ok(());
                }
                self.pool.write().add(from, response.into());
            }
        }
        Ok(())
    }

    async fn on_chunk_message(&mut self, envelope: Envelope<ChunkMessage>) -> Result<()> {
        let Some(from) = envelope.from else {
            return Ok(());
        };
        match envelope.message {
            ChunkMessage::ChunkRequest(request) => {
                let loaded = match self
                    .app
                    .load_snapshot_chunk(request.height, request.format, request.index)
                    .await
                {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        warn!(
                            "failed to load chunk {}/{}/{} for {}: {}",
                            request.height, request.format, request.index, from, e
                        );
                        return Ok(());
                    }
                };
                let response = ChunkResponse::from_loaded(&request, loaded);
                trace!(
                    "sending chunk {}/{}/{} to {} (missing={})",
                    response.height,
                    response.format,
                    response.index,
                    from,
                    response.missing
                );
                self.chunk_channel
                    .send(Envelope::to(from, ChunkMessage::ChunkResponse(response)))
                    .await?;
            }
            ChunkMessage::ChunkResponse(response) => {
                let Some(consumer) = &self.chunk_consumer else {
                    debug!("no consumer for chunk {} from {}", response.index, from);
                    return Ok(());
                };
                let received = ReceivedChunk {
                    peer: from,
                    response,
                };
                if consumer.send(received).await.is_err() {
                    debug!("chunk consumer went away");
                    self.chunk_consumer = None;
                }
            }
        }
        Ok(())
    }

    async fn on_peer_update(&self, update: PeerUpdate) -> Result<()> {
        match update.status {
            PeerUpdateStatus::Up => {
                if self.config.request_snapshots_on_peer_up {
                    debug!("requesting snapshots from {}", update.peer);
                    self.snapshot_channel
                        .send(Envelope::to(update.peer, SnapshotMessage::SnapshotsRequest))
                        .await?;
                }
            }
            PeerUpdateStatus::Down => self.pool.write().remove_peer(&update.peer),
        }
        Ok(())
    }
}

async fn recv_update(
    updates: &mut Option<broadcast::Receiver<PeerUpdate>>,
) -> std::result::Result<PeerUpdate, broadcast::error::RecvError> {
    match updates {
        Some(updates) => updates.recv().await,
        None => std::future::pending().await,
    }
}

/// Sort newest first by (height, format) and keep at most `limit`.
fn newest_snapshots(mut snapshots: Vec<Snapshot>, limit: usize) -> Vec<Snapshot> {
    snapshots.sort_by_key(|snapshot| Reverse((snapshot.height, snapshot.format)));
    snapshots.truncate(limit);
    snapshots
}

fn validate_snapshot(response: &SnapshotsResponse) -> std::result::Result<(), String> {
    if response.chunks == 0 {
        return Err(format!(
            "snapshot {}/{} has no chunks",
            response.height, response.format
        ));
    }
    if response.hash.is_empty() {
        return Err(format!(
            "snapshot {}/{} has no hash",
            response.height, response.format
        ));
    }
    Ok(())
}
