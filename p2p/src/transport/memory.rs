//! In-process transport.
//!
//! A [`MemoryNetwork`] is a hub of listeners keyed by path. Each node gets a
//! [`MemoryTransport`] registered under its own path; dialing another path
//! hands the listener one end of an in-memory pipe, and both sides then run
//! the regular handshake and multiplexer over it. Inbound handshakes run in
//! the background like on TCP. Useful for tests and for running several
//! nodes in one process.

use {
    crate::{
        endpoint::Endpoint,
        error::{P2pError, Result},
        key::PublicKey,
        transport::{
            mux::{MuxConfig, MuxConnection, PendingHandshakes},
            Connection, Transport,
        },
    },
    async_trait::async_trait,
    dashmap::{mapref::entry::Entry, DashMap},
    log::{debug, info},
    std::sync::Arc,
    tokio::{
        io::{duplex, DuplexStream},
        sync::{mpsc, Mutex},
    },
    tokio_util::sync::CancellationToken,
};

/// Protocol tag of the in-process transport.
pub const MEMORY_PROTOCOL: &str = "memory";

/// Buffer size of each in-memory pipe.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Pending inbound connections per listener.
const LISTEN_BACKLOG: usize = 16;

struct Incoming {
    io: DuplexStream,
    from: Endpoint,
}

struct Listener {
    incoming: mpsc::Receiver<Incoming>,
    pending: PendingHandshakes,
}

/// Hub connecting the memory transports of one process.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<String, mpsc::Sender<Incoming>>>,
}

impl MemoryNetwork {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport listening on `path`.
    pub fn transport(
        &self,
        path: impl Into<String>,
        local_key: PublicKey,
        config: MuxConfig,
    ) -> Result<MemoryTransport> {
        let path = path.into();
        let endpoint = Endpoint::local(MEMORY_PROTOCOL, path.clone());
        endpoint.validate()?;
        let (tx, rx) = mpsc::channel(LISTEN_BACKLOG);
        match self.listeners.entry(path.clone()) {
            Entry::Occupied(_) => {
                return Err(P2pError::InvalidEndpoint(format!("{endpoint} already in use")))
            }
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        info!("memory transport listening on {}", endpoint);
        Ok(MemoryTransport {
            network: self.clone(),
            endpoint,
            local_key,
            listener: Mutex::new(Listener {
                incoming: rx,
                pending: PendingHandshakes::new(config.max_pending_handshakes),
            }),
            config,
            closed: CancellationToken::new(),
        })
    }

    fn listener(&self, path: &str) -> Option<mpsc::Sender<Incoming>> {
        self.listeners.get(path).map(|tx| tx.clone())
    }
}

/// One node's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoint: Endpoint,
    local_key: PublicKey,
    config: MuxConfig,
    listener: Mutex<Listener>,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// The endpoint peers dial to reach this transport.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn protocol(&self) -> &str {
        MEMORY_PROTOCOL
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        vec![self.endpoint.clone()]
    }

    async fn accept(&self, cancel: &CancellationToken) -> Result<Arc<dyn Connection>> {
        let mut listener = self.listener.lock().await;
        let Listener { incoming, pending } = &mut *listener;
        loop {
            let has_room = pending.has_room();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(P2pError::Cancelled),
                _ = self.closed.cancelled() => return Err(P2pError::Cancelled),
                done = pending.next() => match done {
                    Ok(conn) => return Ok(conn),
                    Err(e) => debug!("inbound memory handshake failed: {}", e),
                },
                offer = incoming.recv(), if has_room => {
                    let offer = offer.ok_or(P2pError::Cancelled)?;
                    debug!("accepted memory connection from {}", offer.from);
                    pending.spawn(MuxConnection::establish(
                        offer.io,
                        self.local_key,
                        self.endpoint.clone(),
                        offer.from,
                        self.config.clone(),
                    ));
                }
            }
        }
    }

    async fn dial(
        &self,
        cancel: &CancellationToken,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Connection>> {
        if endpoint.protocol != MEMORY_PROTOCOL {
            return Err(P2pError::ProtocolMismatch {
                expected: MEMORY_PROTOCOL.into(),
                actual: endpoint.protocol.clone(),
            });
        }
        let path = endpoint
            .path
            .as_deref()
            .ok_or_else(|| P2pError::InvalidEndpoint(format!("{endpoint}: missing path")))?;
        let listener = self
            .network
            .listener(path)
            .ok_or_else(|| P2pError::ConnectionRefused(endpoint.clone()))?;

        let (local_io, remote_io) = duplex(PIPE_BUFFER_SIZE);
        let offer = Incoming {
            io: remote_io,
            from: self.endpoint.clone(),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(P2pError::Cancelled),
            sent = listener.send(offer) => {
                sent.map_err(|_| P2pError::ConnectionRefused(endpoint.clone()))?
            }
        }

        let establish = MuxConnection::establish(
            local_io,
            self.local_key,
            self.endpoint.clone(),
            endpoint.clone(),
            self.config.clone(),
        );
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(P2pError::Cancelled),
            conn = establish => conn?,
        };
        debug!("dialed {}", endpoint);
        Ok(conn)
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        if let Some(path) = self.endpoint.path.as_deref() {
            self.network.listeners.remove(path);
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        if let Some(path) = self.endpoint.path.as_deref() {
            self.network.listeners.remove(path);
        }
    }
}
