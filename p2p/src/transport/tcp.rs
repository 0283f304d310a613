//! TCP transport.
//!
//! One TCP connection per peer, carrying the key exchange and then the
//! stream multiplexer. Frames on the wire:
//!
//! ```text
//! [2 bytes: stream id (u16-le)] [4 bytes: payload length (u32-le)] [N bytes: payload]
//! ```
//!
//! Frame lengths are validated against `max_message_size` before the
//! payload is read; an oversized frame drops the connection. Inbound key
//! exchanges run in the background, up to `max_pending_handshakes` at once.

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
    log::{debug, info, warn},
    std::{net::SocketAddr, sync::Arc},
    tokio::{
        net::{TcpListener, TcpStream},
        sync::Mutex,
    },
    tokio_util::sync::CancellationToken,
};

/// Protocol tag of the TCP transport.
pub const TCP_PROTOCOL: &str = "tcp";

/// Listens for and dials TCP connections.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    local_key: PublicKey,
    config: MuxConfig,
    pending: Mutex<PendingHandshakes>,
    closed: CancellationToken,
}

impl TcpTransport {
    /// Bind a listener on `addr`. Port 0 picks a free port; see
    /// [`local_addr`](Self::local_addr) for the result.
    pub async fn bind(addr: SocketAddr, local_key: PublicKey, config: MuxConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("tcp transport listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            local_key,
            pending: Mutex::new(PendingHandshakes::new(config.max_pending_handshakes)),
            config,
            closed: CancellationToken::new(),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::networked(TCP_PROTOCOL, self.local_addr)
    }
}

async fn establish(
    stream: TcpStream,
    remote: SocketAddr,
    local_key: PublicKey,
    fallback: Endpoint,
    config: MuxConfig,
) -> Result<Arc<MuxConnection>> {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY for {}: {}", remote, e);
    }
    let local = stream
        .local_addr()
        .map(|addr| Endpoint::networked(TCP_PROTOCOL, addr))
        .unwrap_or(fallback);
    MuxConnection::establish(
        stream,
        local_key,
        local,
        Endpoint::networked(TCP_PROTOCOL, remote),
        config,
    )
    .await
}

#[async_trait]
impl Transport for TcpTransport {
    fn protocol(&self) -> &str {
        TCP_PROTOCOL
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        vec![self.endpoint()]
    }

    async fn accept(&self, cancel: &CancellationToken) -> Result<Arc<dyn Connection>> {
        let mut pending = self.pending.lock().await;
        loop {
            let has_room = pending.has_room();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(P2pError::Cancelled),
                _ = self.closed.cancelled() => return Err(P2pError::Cancelled),
                done = pending.next() => match done {
                    Ok(conn) => return Ok(conn),
                    Err(e) => debug!("inbound tcp handshake failed: {}", e),
                },
                accepted = self.listener.accept(), if has_room => {
                    let (stream, addr) = accepted?;
                    debug!("accepted tcp connection from {}", addr);
                    pending.spawn(establish(
                        stream,
                        addr,
                        self.local_key,
                        self.endpoint(),
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
        if endpoint.protocol != TCP_PROTOCOL {
            return Err(P2pError::ProtocolMismatch {
                expected: TCP_PROTOCOL.into(),
                actual: endpoint.protocol.clone(),
            });
        }
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| P2pError::InvalidEndpoint(format!("{endpoint}: no address")))?;
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(P2pError::Cancelled),
            connected = TcpStream::connect(addr) => match connected {
                Ok(stream) => stream,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    return Err(P2pError::ConnectionRefused(endpoint.clone()))
                }
                Err(e) => return Err(e.into()),
            },
        };
        debug!("connected to {}", addr);
        let connecting = establish(
            stream,
            addr,
            self.local_key,
            self.endpoint(),
            self.config.clone(),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(P2pError::Cancelled),
            conn = connecting => Ok(conn?),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}
