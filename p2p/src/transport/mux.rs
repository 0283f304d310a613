//! Stream multiplexing over a single byte pipe.
//!
//! Used by every byte-oriented transport. The handshake exchanges public
//! keys and each side's stream window; after it, the pipe carries frames of
//! the form:
//!
//! ```text
//! [2 bytes: stream id (u16-le)] [4 bytes: payload length (u32-le)] [N bytes: payload]
//! ```
//!
//! A length with the top bit set marks a window update instead: no payload
//! follows, and the low 31 bits are the number of frames the receiver of
//! that stream has consumed since its last update.
//!
//! One [`Stream::write`] produces exactly one frame. Frames are written
//! whole, in queue order, by a single writer task. Each stream may have at
//! most one window of unconsumed frames in flight, so a stream whose reader
//! stops only blocks writers of that stream. A demultiplexing task reads
//! frames without ever waiting on a stream; frames for streams we have not
//! opened create the stream and announce it through
//! [`Connection::accept_stream`].

use {
    crate::{
        config::P2pConfig,
        endpoint::Endpoint,
        error::{P2pError, Result},
        key::{PublicKey, PUBLIC_KEY_LEN},
        transport::{Connection, Stream, StreamId},
    },
    async_trait::async_trait,
    dashmap::{mapref::entry::Entry, DashMap},
    log::{debug, trace, warn},
    std::{fmt, future::Future, sync::Arc, time::Duration},
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        sync::{
            mpsc::{self, error::TrySendError},
            Mutex, Semaphore,
        },
        task::JoinSet,
    },
    tokio_util::sync::CancellationToken,
};

/// Size of the frame header.
pub const FRAME_HEADER_LEN: usize = 6;

/// Largest payload a data frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = 0x7fff_ffff;

/// Marks a window update in the length field.
const WINDOW_UPDATE_FLAG: u32 = 0x8000_0000;

/// Largest stream window either side may advertise.
const MAX_WINDOW: u32 = 0x7fff_ffff;

/// How many remote-opened streams may wait for `accept_stream`.
const ACCEPT_BACKLOG: usize = 64;

/// Data frames queued for the writer task.
const WRITE_QUEUE_CAPACITY: usize = 64;

/// Limits applied to a multiplexed connection.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Largest frame payload accepted in either direction.
    pub max_message_size: usize,
    /// Capacity of each stream's inbound queue, advertised to the remote as
    /// its window for the stream.
    pub stream_capacity: usize,
    /// Bound on the key exchange.
    pub handshake_timeout: Duration,
    /// Inbound key exchanges a transport runs at once.
    pub max_pending_handshakes: usize,
}

impl From<&P2pConfig> for MuxConfig {
    fn from(config: &P2pConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            stream_capacity: config.peer_queue_capacity,
            handshake_timeout: config.handshake_timeout,
            max_pending_handshakes: config.max_concurrent_handshakes,
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from(&P2pConfig::default())
    }
}

impl MuxConfig {
    /// The window we grant the remote on each stream.
    fn window(&self) -> u32 {
        u32::try_from(self.stream_capacity)
            .unwrap_or(MAX_WINDOW)
            .clamp(1, MAX_WINDOW)
    }
}

// ── Framing ─────────────────────────────────────────────────────────────────

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// `len` payload bytes for stream `id` follow.
    Data { id: StreamId, len: usize },
    /// The remote consumed `credits` more frames of stream `id`.
    WindowUpdate { id: StreamId, credits: u32 },
}

/// Frame `payload` for stream `id`, refusing payloads over `max` bytes.
pub(crate) fn encode_frame(id: StreamId, payload: &[u8], max: usize) -> Result<Vec<u8>> {
    let max = max.min(MAX_FRAME_PAYLOAD);
    let too_large = || P2pError::MessageTooLarge {
        size: payload.len(),
        max,
    };
    if payload.len() > max {
        return Err(too_large());
    }
    let len = u32::try_from(payload.len()).map_err(|_| too_large())?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN.saturating_add(payload.len()));
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn encode_window_update(id: StreamId, credits: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(credits.min(MAX_WINDOW) | WINDOW_UPDATE_FLAG).to_le_bytes());
    buf
}

/// Parse a frame header.
pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
    let id = u16::from_le_bytes([header[0], header[1]]);
    let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    if len & WINDOW_UPDATE_FLAG != 0 {
        FrameHeader::WindowUpdate {
            id,
            credits: len & MAX_WINDOW,
        }
    } else {
        FrameHeader::Data {
            id,
            len: len as usize,
        }
    }
}

/// Exchange public keys and stream windows over a fresh pipe.
///
/// Stands in for the authenticated-encryption handshake: both sides send
/// their key and window, then read the remote's.
pub async fn handshake<IO>(
    io: &mut IO,
    local_key: &PublicKey,
    window: u32,
    timeout: Duration,
) -> Result<(PublicKey, u32)>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        io.write_all(local_key.as_bytes()).await?;
        io.write_all(&window.to_le_bytes()).await?;
        io.flush().await?;
        let mut remote = [0u8; PUBLIC_KEY_LEN];
        io.read_exact(&mut remote).await?;
        let mut remote_window = [0u8; 4];
        io.read_exact(&mut remote_window).await?;
        Ok::<_, std::io::Error>((PublicKey::new(remote), u32::from_le_bytes(remote_window)))
    };
    let (remote, remote_window) = match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(exchanged)) => exchanged,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(P2pError::ConnectionClosed)
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(P2pError::Timeout(timeout)),
    };
    if remote_window == 0 || remote_window > MAX_WINDOW {
        return Err(P2pError::ProtocolViolation(format!(
            "invalid stream window {remote_window}"
        )));
    }
    Ok((remote, remote_window))
}

// ── Inbound handshakes ──────────────────────────────────────────────────────

/// Inbound connections whose handshake is still running.
///
/// Each handshake runs as its own task, so they progress whether or not
/// anyone is waiting in `accept`. Dropping the set aborts them.
pub(crate) struct PendingHandshakes {
    tasks: JoinSet<Result<Arc<MuxConnection>>>,
    limit: usize,
}

impl PendingHandshakes {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            limit: limit.max(1),
        }
    }

    /// Whether another handshake may start.
    pub(crate) fn has_room(&self) -> bool {
        self.tasks.len() < self.limit
    }

    pub(crate) fn spawn<F>(&mut self, handshake: F)
    where
        F: Future<Output = Result<Arc<MuxConnection>>> + Send + 'static,
    {
        self.tasks.spawn(handshake);
    }

    /// The next handshake to finish. Never resolves while none are running.
    pub(crate) async fn next(&mut self) -> Result<Arc<MuxConnection>> {
        match self.tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(P2pError::Transport(std::io::Error::other(e))),
            None => std::future::pending().await,
        }
    }
}

// ── Connection internals ────────────────────────────────────────────────────

#[derive(Clone)]
struct Slot {
    stream: Arc<MuxStream>,
    tx: mpsc::Sender<Vec<u8>>,
}

/// State shared by the connection, its streams and its two tasks.
///
/// `streams` holds the streams, which point back here; the demux task clears
/// it on exit so the cycle never outlives the connection.
struct Shared {
    streams: DashMap<StreamId, Slot>,
    frames: mpsc::Sender<Vec<u8>>,
    grants: mpsc::UnboundedSender<Vec<u8>>,
    accepted_tx: mpsc::Sender<StreamId>,
    closed: CancellationToken,
    config: MuxConfig,
    local_window: u32,
    remote_window: u32,
    grant_threshold: u32,
}

impl Shared {
    /// Get or create the slot for `id`. The flag is true if it was created.
    fn slot(self: &Arc<Self>, id: StreamId) -> (Slot, bool) {
        match self.streams.entry(id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(self.local_window as usize);
                let stream = Arc::new(MuxStream {
                    id,
                    shared: Arc::clone(self),
                    inbound: Mutex::new(Inbound { rx, consumed: 0 }),
                    credits: Semaphore::new(self.remote_window as usize),
                });
                let slot = Slot { stream, tx };
                entry.insert(slot.clone());
                (slot, true)
            }
        }
    }

    /// Return `credits` consumed frames of stream `id` to the remote.
    fn grant(&self, id: StreamId, credits: u32) {
        let _ = self.grants.send(encode_window_update(id, credits));
    }
}

struct Inbound {
    rx: mpsc::Receiver<Vec<u8>>,
    /// Frames read since the last window update.
    consumed: u32,
}

/// A stream of a [`MuxConnection`].
pub struct MuxStream {
    id: StreamId,
    shared: Arc<Shared>,
    inbound: Mutex<Inbound>,
    /// Frames we may still send before the remote grants more.
    credits: Semaphore,
}

#[async_trait]
impl Stream for MuxStream {
    fn id(&self) -> StreamId {
        self.id
    }

    async fn write(&self, message: &[u8]) -> Result<()> {
        let frame = encode_frame(self.id, message, self.shared.config.max_message_size)?;
        let closed = &self.shared.closed;
        if closed.is_cancelled() {
            return Err(P2pError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(P2pError::ConnectionClosed),
            queued = async {
                let credit = self
                    .credits
                    .acquire()
                    .await
                    .map_err(|_| P2pError::ConnectionClosed)?;
                let slot = self
                    .shared
                    .frames
                    .reserve()
                    .await
                    .map_err(|_| P2pError::ConnectionClosed)?;
                credit.forget();
                slot.send(frame);
                Ok::<_, P2pError>(())
            } => queued,
        }
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        let message = tokio::select! {
            biased;
            message = inbound.rx.recv() => message.ok_or(P2pError::ConnectionClosed)?,
            _ = self.shared.closed.cancelled() => return Err(P2pError::ConnectionClosed),
        };
        inbound.consumed = inbound.consumed.saturating_add(1);
        if inbound.consumed >= self.shared.grant_threshold {
            self.shared.grant(self.id, inbound.consumed);
            inbound.consumed = 0;
        }
        Ok(message)
    }
}

/// A connection multiplexing streams over one byte pipe.
pub struct MuxConnection {
    local: Endpoint,
    remote: Endpoint,
    remote_key: PublicKey,
    shared: Arc<Shared>,
    accepted_rx: Mutex<mpsc::Receiver<StreamId>>,
}

impl MuxConnection {
    /// Run the handshake on `io`, then start multiplexing over it.
    pub async fn establish<IO>(
        mut io: IO,
        local_key: PublicKey,
        local: Endpoint,
        remote: Endpoint,
        config: MuxConfig,
    ) -> Result<Arc<Self>>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (remote_key, remote_window) =
            handshake(&mut io, &local_key, config.window(), config.handshake_timeout).await?;
        let (reader, writer) = tokio::io::split(io);
        Ok(Self::start(
            reader,
            writer,
            local,
            remote,
            remote_key,
            remote_window,
            config,
        ))
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        local: Endpoint,
        remote: Endpoint,
        remote_key: PublicKey,
        remote_window: u32,
        config: MuxConfig,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (frames, frames_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (grants, grants_rx) = mpsc::unbounded_channel();
        let local_window = config.window();
        let shared = Arc::new(Shared {
            streams: DashMap::new(),
            frames,
            grants,
            accepted_tx,
            closed: CancellationToken::new(),
            config,
            local_window,
            remote_window,
            grant_threshold: local_window.div_ceil(2),
        });
        tokio::spawn(Self::demux(reader, Arc::clone(&shared), remote.clone()));
        tokio::spawn(Self::write_frames(
            writer,
            grants_rx,
            frames_rx,
            shared.closed.clone(),
            remote.clone(),
        ));
        Arc::new(Self {
            local,
            remote,
            remote_key,
            shared,
            accepted_rx: Mutex::new(accepted_rx),
        })
    }

    async fn demux<R>(mut reader: R, shared: Arc<Shared>, remote: Endpoint)
    where
        R: AsyncRead + Send + Unpin,
    {
        let result = tokio::select! {
            _ = shared.closed.cancelled() => Ok(()),
            result = Self::read_frames(&mut reader, &shared) => result,
        };
        match result {
            Ok(()) => debug!("connection to {} closed", remote),
            Err(P2pError::ConnectionClosed) => debug!("{} hung up", remote),
            Err(e) => warn!("connection to {} failed: {}", remote, e),
        }
        shared.closed.cancel();
        shared.streams.clear();
    }

    async fn read_frames<R>(reader: &mut R, shared: &Arc<Shared>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        loop {
            if let Err(e) = reader.read_exact(&mut header).await {
                return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    P2pError::ConnectionClosed
                } else {
                    e.into()
                });
            }

            let (id, len) = match decode_frame_header(&header) {
                FrameHeader::WindowUpdate { id, credits } => {
                    Self::add_credits(shared, id, credits);
                    continue;
                }
                FrameHeader::Data { id, len } => (id, len),
            };
            if len > shared.config.max_message_size {
                return Err(P2pError::MessageTooLarge {
                    size: len,
                    max: shared.config.max_message_size,
                });
            }

            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;

            let (slot, created) = shared.slot(id);
            if created {
                trace!("remote opened stream {}", id);
                match shared.accepted_tx.try_send(id) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        return Err(P2pError::ProtocolViolation(format!(
                            "more than {ACCEPT_BACKLOG} unaccepted streams"
                        )))
                    }
                    Err(TrySendError::Closed(_)) => return Ok(()),
                }
            }
            trace!("frame of {} bytes on stream {}", len, id);
            if let Err(TrySendError::Full(_)) = slot.tx.try_send(payload) {
                return Err(P2pError::ProtocolViolation(format!(
                    "stream {id} written past its window"
                )));
            }
        }
    }

    /// Credits beyond the remote's window are dropped; they can belong to an
    /// earlier incarnation of a released stream.
    fn add_credits(shared: &Shared, id: StreamId, credits: u32) {
        let Some(slot) = shared.streams.get(&id).map(|slot| slot.clone()) else {
            return;
        };
        let available = slot.stream.credits.available_permits();
        let room = (shared.remote_window as usize).saturating_sub(available);
        let credits = (credits as usize).min(room);
        if credits > 0 {
            slot.stream.credits.add_permits(credits);
        }
    }

    /// Write queued frames to the pipe, window updates first, until the
    /// connection closes.
    async fn write_frames<W>(
        mut writer: W,
        mut grants: mpsc::UnboundedReceiver<Vec<u8>>,
        mut frames: mpsc::Receiver<Vec<u8>>,
        closed: CancellationToken,
        remote: Endpoint,
    ) where
        W: AsyncWrite + Send + Unpin,
    {
        let result = tokio::select! {
            _ = closed.cancelled() => Ok(()),
            result = Self::pump_frames(&mut writer, &mut grants, &mut frames) => result,
        };
        if let Err(e) = result {
            warn!("write to {} failed: {}", remote, e);
        }
        closed.cancel();
        let _ = writer.shutdown().await;
    }

    async fn pump_frames<W>(
        writer: &mut W,
        grants: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        frames: &mut mpsc::Receiver<Vec<u8>>,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                Some(frame) = grants.recv() => frame,
                Some(frame) = frames.recv() => frame,
                else => return Ok(()),
            };
            writer.write_all(&frame).await?;
            if grants.is_empty() && frames.is_empty() {
                writer.flush().await?;
            }
        }
    }
}

#[async_trait]
impl Connection for MuxConnection {
    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }

    fn remote_endpoint(&self) -> Endpoint {
        self.remote.clone()
    }

    fn remote_public_key(&self) -> PublicKey {
        self.remote_key
    }

    fn stream(&self, id: StreamId) -> Result<Arc<dyn Stream>> {
        if self.shared.closed.is_cancelled() {
            return Err(P2pError::ConnectionClosed);
        }
        let (slot, _) = self.shared.slot(id);
        let stream: Arc<dyn Stream> = slot.stream;
        Ok(stream)
    }

    async fn accept_stream(&self) -> Result<StreamId> {
        let mut accepted = self.accepted_rx.lock().await;
        tokio::select! {
            biased;
            id = accepted.recv() => id.ok_or(P2pError::ConnectionClosed),
            _ = self.shared.closed.cancelled() => Err(P2pError::ConnectionClosed),
        }
    }

    fn release_stream(&self, id: StreamId) {
        if self.shared.streams.remove(&id).is_some() {
            trace!("released stream {} to {}", id, self.remote);
        }
    }

    fn close(&self) {
        self.shared.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("remote_key", &self.remote_key)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        tokio::{io::duplex, time::timeout},
    };

    /// Two connected ends over an in-memory pipe.
    pub(crate) async fn connected_pair(
        config: MuxConfig,
    ) -> (Arc<MuxConnection>, Arc<MuxConnection>, PublicKey, PublicKey) {
        let (a_io, b_io) = duplex(64 * 1024);
        let a_key = PublicKey::new_unique();
        let b_key = PublicKey::new_unique();
        let (a, b) = tokio::join!(
            MuxConnection::establish(
                a_io,
                a_key,
                Endpoint::local("memory", "a"),
                Endpoint::local("memory", "b"),
                config.clone(),
            ),
            MuxConnection::establish(
                b_io,
                b_key,
                Endpoint::local("memory", "b"),
                Endpoint::local("memory", "a"),
                config,
            ),
        );
        (a.unwrap(), b.unwrap(), a_key, b_key)
    }

    fn small_window() -> MuxConfig {
        MuxConfig {
            stream_capacity: 4,
            ..MuxConfig::default()
        }
    }

    #[test]
    fn test_frame_headers() {
        let frame = encode_frame(0x61, &[1, 2, 3], 16).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 3);
        let header: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN].try_into().unwrap();
        assert_eq!(
            decode_frame_header(&header),
            FrameHeader::Data { id: 0x61, len: 3 }
        );
        assert_eq!(&frame[FRAME_HEADER_LEN..], &[1, 2, 3]);

        let update = encode_window_update(0x61, 7);
        let header: [u8; FRAME_HEADER_LEN] = update[..].try_into().unwrap();
        assert_eq!(
            decode_frame_header(&header),
            FrameHeader::WindowUpdate { id: 0x61, credits: 7 }
        );
    }

    #[test]
    fn test_encode_frame_enforces_limit() {
        assert_matches!(
            encode_frame(1, &[0u8; 9], 8),
            Err(P2pError::MessageTooLarge { size: 9, max: 8 })
        );
        assert_matches!(
            encode_frame(1, &[0u8; 9], usize::MAX),
            Ok(frame) if frame.len() == FRAME_HEADER_LEN + 9
        );
    }

    #[tokio::test]
    async fn test_handshake_exchanges_keys() {
        let (a, b, a_key, b_key) = connected_pair(MuxConfig::default()).await;
        assert_eq!(a.remote_public_key(), b_key);
        assert_eq!(b.remote_public_key(), a_key);
    }

    #[tokio::test]
    async fn test_handshake_times_out_on_silent_remote() {
        let (mut io, _silent) = duplex(1024);
        let result = handshake(&mut io, &PublicKey::new_unique(), 8, Duration::from_millis(30)).await;
        assert_matches!(result, Err(P2pError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_handshake_rejects_zero_window() {
        let (mut a_io, mut b_io) = duplex(1024);
        let (a_key, b_key) = (PublicKey::new_unique(), PublicKey::new_unique());
        let (a, b) = tokio::join!(
            handshake(&mut a_io, &a_key, 8, Duration::from_secs(1)),
            handshake(&mut b_io, &b_key, 0, Duration::from_secs(1)),
        );
        assert_matches!(a, Err(P2pError::ProtocolViolation(_)));
        assert_matches!(b, Ok((_, 8)));
    }

    #[tokio::test]
    async fn test_stream_is_idempotent() {
        let (a, _b, _, _) = connected_pair(MuxConfig::default()).await;
        let s1 = a.stream(5).unwrap();
        let s2 = a.stream(5).unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(s1.id(), 5);
    }

    #[tokio::test]
    async fn test_one_message_per_write() {
        let (a, b, _, _) = connected_pair(MuxConfig::default()).await;
        let tx = a.stream(1).unwrap();
        tx.write(b"first").await.unwrap();
        tx.write(b"").await.unwrap();
        tx.write(b"third").await.unwrap();

        let rx = b.stream(1).unwrap();
        assert_eq!(rx.read().await.unwrap(), b"first");
        assert_eq!(rx.read().await.unwrap(), b"");
        assert_eq!(rx.read().await.unwrap(), b"third");
    }

    #[tokio::test]
    async fn test_concurrent_streams_do_not_interleave() {
        let (a, b, _, _) = connected_pair(small_window()).await;
        const N: u32 = 200;
        let mut writers = Vec::new();
        for id in [1u16, 2u16] {
            let stream = a.stream(id).unwrap();
            writers.push(tokio::spawn(async move {
                for i in 0..N {
                    let msg = vec![id as u8; (i % 17) as usize + 1];
                    stream.write(&msg).await.unwrap();
                }
            }));
        }
        for id in [1u16, 2u16] {
            let stream = b.stream(id).unwrap();
            for i in 0..N {
                let msg = timeout(Duration::from_secs(5), stream.read())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(msg, vec![id as u8; (i % 17) as usize + 1]);
            }
        }
        for writer in writers {
            writer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unread_stream_does_not_stall_others() {
        let (a, b, _, _) = connected_pair(small_window()).await;
        let stalled = a.stream(1).unwrap();
        let flood = tokio::spawn(async move {
            for i in 0..100u8 {
                stalled.write(&[i]).await.unwrap();
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!flood.is_finished(), "writer must block once its window is used");

        a.stream(2).unwrap().write(b"still flowing").await.unwrap();
        let other = b.stream(2).unwrap();
        let msg = timeout(Duration::from_secs(1), other.read())
            .await
            .expect("stream 2 must not wait on stream 1")
            .unwrap();
        assert_eq!(msg, b"still flowing");

        // Draining stream 1 releases its writer.
        let reader = b.stream(1).unwrap();
        for i in 0..100u8 {
            let msg = timeout(Duration::from_secs(1), reader.read())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg, vec![i]);
        }
        timeout(Duration::from_secs(1), flood).await.unwrap().unwrap();
        assert!(!a.is_closed() && !b.is_closed());
    }

    #[tokio::test]
    async fn test_released_stream_is_announced_again() {
        let (a, b, _, _) = connected_pair(MuxConfig::default()).await;
        b.stream(3).unwrap();
        b.release_stream(3);
        a.stream(3).unwrap().write(b"late").await.unwrap();
        let id = timeout(Duration::from_secs(1), b.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, 3);
        assert_eq!(b.stream(3).unwrap().read().await.unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_remote_opened_stream_is_announced() {
        let (a, b, _, _) = connected_pair(MuxConfig::default()).await;
        a.stream(9).unwrap().write(b"hi").await.unwrap();
        let id = timeout(Duration::from_secs(1), b.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, 9);
        assert_eq!(b.stream(9).unwrap().read().await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_close_fails_blocked_read() {
        let (a, b, _, _) = connected_pair(MuxConfig::default()).await;
        let stream = a.stream(1).unwrap();
        let reader = tokio::spawn(async move { stream.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close();
        let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert_matches!(result, Err(P2pError::ConnectionClosed));
        assert!(a.is_closed());
        assert!(matches!(a.stream(2), Err(P2pError::ConnectionClosed)));

        // The remote notices the hang-up.
        timeout(Duration::from_secs(1), b.closed()).await.unwrap();
        assert!(matches!(b.stream(1), Err(P2pError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let config = MuxConfig {
            max_message_size: 4,
            ..MuxConfig::default()
        };
        let (a, _b, _, _) = connected_pair(config).await;
        let result = a.stream(1).unwrap().write(&[0u8; 5]).await;
        assert_matches!(result, Err(P2pError::MessageTooLarge { size: 5, max: 4 }));
    }

    #[tokio::test]
    async fn test_writing_past_window_is_a_protocol_violation() {
        // A raw remote that ignores the window it was given.
        let (local_io, mut raw) = duplex(64 * 1024);
        let config = MuxConfig {
            stream_capacity: 2,
            handshake_timeout: Duration::from_secs(1),
            ..MuxConfig::default()
        };
        let raw_key = PublicKey::new_unique();
        let (conn, remote) = tokio::join!(
            MuxConnection::establish(
                local_io,
                PublicKey::new_unique(),
                Endpoint::local("memory", "a"),
                Endpoint::local("memory", "raw"),
                config,
            ),
            handshake(&mut raw, &raw_key, 8, Duration::from_secs(1)),
        );
        let conn = conn.unwrap();
        assert_matches!(remote, Ok((_, 2)));
        for i in 0..3u8 {
            raw.write_all(&encode_frame(1, &[i], 16).unwrap()).await.unwrap();
        }
        timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
    }
}
