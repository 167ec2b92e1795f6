//! QUIC listener and CONNECT-IP session establishment.
//!
//! The acceptor owns the UDP socket and the QUIC endpoint. Each accepted
//! connection must present a client certificate rooted in the configured
//! CA; the subject CN becomes the peer identity. A connection becomes a
//! session after the CONNECT-IP request names the configured path, an
//! address is allocated, and the peer acknowledges the assignment.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use ipnet::IpNet;
use quinn::Endpoint;
use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use qvpn_core::buffer::{PacketPool, PooledBuf};
use qvpn_core::constants::{
    CONNECT_PATH, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT, KEEP_ALIVE_INTERVAL,
};
use qvpn_core::error::{Error, Result};
use qvpn_core::proto::{
    self, AssignedAddress, Capsule, ConnectRequest, ConnectResponse, STATUS_BAD_REQUEST,
    STATUS_OK, STATUS_UNAVAILABLE,
};
use qvpn_core::tun::TunPort;
use qvpn_core::PeerId;

use crate::config::ServerConfig;
use crate::registry::{SessionRegistry, SessionSetup};
use crate::session::Session;
use crate::tls;

/// Shared per-connection dependencies.
struct ConnContext<T: TunPort> {
    registry: Arc<SessionRegistry>,
    tun: Arc<T>,
    pool: PacketPool,
    authority: String,
}

impl<T: TunPort> Clone for ConnContext<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            tun: Arc::clone(&self.tun),
            pool: self.pool.clone(),
            authority: self.authority.clone(),
        }
    }
}

/// QUIC/CONNECT-IP listener.
pub struct Acceptor<T: TunPort> {
    endpoint: Endpoint,
    ctx: ConnContext<T>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<T: TunPort> Acceptor<T> {
    /// Bind the UDP socket and build the QUIC endpoint.
    pub fn bind(
        config: &ServerConfig,
        registry: Arc<SessionRegistry>,
        tun: Arc<T>,
        pool: PacketPool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let tls_config =
            tls::server_tls_config(&config.cert_file, &config.key_file, &config.ca_file)?;
        let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(tls_config))
            .map_err(|e| Error::transport(format!("QUIC TLS config: {e}")))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));
        let mut transport = quinn::TransportConfig::default();
        let idle = quinn::IdleTimeout::try_from(IDLE_TIMEOUT)
            .map_err(|e| Error::transport(format!("idle timeout: {e}")))?;
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
        transport.datagram_receive_buffer_size(Some(1024 * 1024));
        server_config.transport_config(Arc::new(transport));

        let endpoint = Endpoint::server(server_config, config.listen_addr)
            .map_err(|e| Error::transport(format!("UDP bind {}: {}", config.listen_addr, e)))?;

        let authority = format!("{}:{}", config.server_name, config.listen_addr.port());

        Ok(Self {
            endpoint,
            ctx: ConnContext {
                registry,
                tun,
                pool,
                authority,
            },
            cancel,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .local_addr()
            .map_err(|e| Error::transport(format!("local addr: {e}")))
    }

    /// Accept connections until cancellation, then drain all sessions.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, authority = %self.ctx.authority, "QUIC listener started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                incoming = self.endpoint.accept() => {
                    let Some(incoming) = incoming else { break };
                    let ctx = self.ctx.clone();
                    self.tracker.spawn(async move {
                        let remote = incoming.remote_address();
                        match incoming.await {
                            Ok(connection) => {
                                if let Err(e) = handle_connection(connection, ctx).await {
                                    // Peer-local failures close one connection,
                                    // never the listener
                                    warn!(remote = %remote, error = %e, "Connection ended with error");
                                }
                            }
                            Err(e) => debug!(remote = %remote, error = %e, "QUIC handshake failed"),
                        }
                    });
                }
            }
        }

        // Stop accepting, cancel sessions, wait for every finaliser
        info!("Listener draining");
        self.ctx.registry.drain_all();
        self.tracker.close();
        self.tracker.wait().await;
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
        info!("Listener stopped");
        Ok(())
    }
}

/// Drive one connection from handshake to finalisation.
async fn handle_connection<T: TunPort>(
    connection: quinn::Connection,
    ctx: ConnContext<T>,
) -> Result<()> {
    let remote = connection.remote_address();
    let peer_id = match peer_identity(&connection) {
        Ok(peer_id) => peer_id,
        Err(e) => {
            warn!(remote = %remote, error = %e, "Rejecting unidentified peer");
            connection.close(0x2u32.into(), b"client certificate required");
            return Ok(());
        }
    };
    info!(peer = %peer_id, remote = %remote, "Incoming CONNECT-IP request");

    let (send, recv) = timeout(HANDSHAKE_TIMEOUT, connection.accept_bi())
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::transport(format!("accept signalling stream: {e}")))?;
    let mut stream = SignalStream::new(send, recv);

    let request = timeout(HANDSHAKE_TIMEOUT, stream.read_request())
        .await
        .map_err(|_| Error::Timeout)??;

    if request.path != CONNECT_PATH {
        debug!(peer = %peer_id, path = %request.path, "Unknown path");
        stream.send_response(STATUS_BAD_REQUEST).await?;
        connection.close(0u32.into(), b"unknown path");
        return Ok(());
    }
    if request.authority != ctx.authority {
        // Clients may dial by IP; log and accept
        debug!(peer = %peer_id, authority = %request.authority, "Authority differs from template");
    }

    let setup = match ctx.registry.begin_session(peer_id.clone()) {
        Ok(setup) => setup,
        Err(Error::NoAddressAvailable) => {
            warn!(peer = %peer_id, "Address pool exhausted, rejecting");
            stream.send_response(STATUS_UNAVAILABLE).await?;
            connection.close(0x1u32.into(), b"no address available");
            return Ok(());
        }
        Err(e) => {
            stream.send_response(STATUS_BAD_REQUEST).await?;
            connection.close(0x1u32.into(), b"session setup failed");
            return Err(e);
        }
    };

    let session = Arc::clone(&setup.session);
    let result = drive_session(&connection, stream, setup, &ctx).await;

    session.mark_draining();
    connection.close(0u32.into(), b"session closed");
    ctx.registry.finalise(&session);
    result
}

/// Assignment, route advertisement and the packet pumps.
async fn drive_session<T: TunPort>(
    connection: &quinn::Connection,
    mut stream: SignalStream,
    setup: SessionSetup,
    ctx: &ConnContext<T>,
) -> Result<()> {
    let SessionSetup {
        session,
        uplink_tx,
        uplink_rx,
        downlink_tx,
        downlink_rx,
        advertised,
    } = setup;

    stream.send_response(STATUS_OK).await?;
    stream
        .send_capsule(&Capsule::AddressAssign(vec![AssignedAddress {
            request_id: 0,
            prefix: session.assigned(),
        }]))
        .await?;
    stream
        .send_capsule(&Capsule::RouteAdvertisement(advertised))
        .await?;

    // The peer acknowledges by echoing the assigned prefix
    timeout(HANDSHAKE_TIMEOUT, stream.wait_ack(session.assigned()))
        .await
        .map_err(|_| Error::Timeout)??;
    session.mark_active()?;
    info!(peer = %session.peer_id(), addr = %session.assigned(), "Session active");

    let mut tasks: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();

    {
        let connection = connection.clone();
        let session = Arc::clone(&session);
        let pool = ctx.pool.clone();
        tasks.spawn(async move { uplink_pump(connection, session, uplink_tx, pool).await });
    }
    {
        let connection = connection.clone();
        let session = Arc::clone(&session);
        tasks.spawn(async move { downlink_pump(connection, session, downlink_rx).await });
    }
    {
        let session = Arc::clone(&session);
        let tun = Arc::clone(&ctx.tun);
        tasks.spawn(async move { session.run_uplink(uplink_rx, downlink_tx, tun).await });
    }
    {
        let session = Arc::clone(&session);
        tasks.spawn(async move { signal_watch(stream, session).await });
    }

    // First task to exit (error, peer close or cancel) drains the rest
    let first = tasks
        .join_next()
        .await
        .unwrap_or(Ok(Ok(())))
        .unwrap_or_else(|e| Err(Error::Internal {
            message: format!("session task panicked: {e}"),
        }));
    session.mark_draining();
    while tasks.join_next().await.is_some() {}

    first
}

/// QUIC datagrams from the peer into the session's uplink queue.
async fn uplink_pump(
    connection: quinn::Connection,
    session: Arc<Session>,
    uplink_tx: mpsc::Sender<PooledBuf>,
    pool: PacketPool,
) -> Result<()> {
    loop {
        let datagram = tokio::select! {
            _ = session.cancel_token().cancelled() => return Ok(()),
            datagram = connection.read_datagram() => match datagram {
                Ok(datagram) => datagram,
                Err(quinn::ConnectionError::ApplicationClosed { .. })
                | Err(quinn::ConnectionError::ConnectionClosed { .. })
                | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
                Err(e) => return Err(Error::transport(format!("read datagram: {e}"))),
            },
        };

        let packet = match proto::decode_datagram(&datagram) {
            Ok(packet) => packet,
            Err(e) => {
                trace!(peer = %session.peer_id(), error = %e, "Dropping undecodable datagram");
                continue;
            }
        };
        if packet.is_empty() || packet.len() > pool.buf_len() {
            trace!(peer = %session.peer_id(), len = packet.len(), "Dropping out-of-bounds datagram");
            continue;
        }

        // Pool exhaustion parks the reader until a buffer returns
        let mut buf = pool.acquire().await;
        buf.as_mut_slice()[..packet.len()].copy_from_slice(packet);
        buf.set_len(packet.len());
        if uplink_tx.send(buf).await.is_err() {
            return Ok(());
        }
    }
}

/// The session's downlink queue out to the peer as QUIC datagrams.
async fn downlink_pump(
    connection: quinn::Connection,
    session: Arc<Session>,
    mut downlink_rx: mpsc::Receiver<PooledBuf>,
) -> Result<()> {
    loop {
        let buf = tokio::select! {
            _ = session.cancel_token().cancelled() => return Ok(()),
            buf = downlink_rx.recv() => match buf {
                Some(buf) => buf,
                None => return Ok(()),
            },
        };

        match connection.send_datagram(proto::encode_datagram(buf.packet())) {
            Ok(()) => session.record_downlink(),
            Err(quinn::SendDatagramError::ConnectionLost(_)) => return Ok(()),
            Err(quinn::SendDatagramError::TooLarge) => {
                debug!(peer = %session.peer_id(), len = buf.len(), "Datagram exceeds path MTU, dropped");
            }
            Err(e) => return Err(Error::transport(format!("send datagram: {e}"))),
        }
    }
}

/// Keep reading the signalling stream so a peer close ends the session.
async fn signal_watch(mut stream: SignalStream, session: Arc<Session>) -> Result<()> {
    loop {
        tokio::select! {
            _ = session.cancel_token().cancelled() => return Ok(()),
            capsule = stream.read_capsule() => match capsule {
                Ok(Some(capsule)) => {
                    trace!(peer = %session.peer_id(), ?capsule, "Ignoring late capsule");
                }
                Ok(None) => {
                    debug!(peer = %session.peer_id(), "Peer closed signalling stream");
                    return Ok(());
                }
                Err(e) => {
                    debug!(peer = %session.peer_id(), error = %e, "Signalling stream failed");
                    return Ok(());
                }
            },
        }
    }
}

/// Extract the peer identity from the validated client certificate chain.
fn peer_identity(connection: &quinn::Connection) -> Result<PeerId> {
    let identity = connection
        .peer_identity()
        .ok_or_else(|| Error::PeerRejected {
            message: "no client certificate presented".to_string(),
        })?;
    let certs = identity
        .downcast::<Vec<CertificateDer<'static>>>()
        .map_err(|_| Error::PeerRejected {
            message: "unexpected peer identity type".to_string(),
        })?;
    let cert = certs.first().ok_or_else(|| Error::PeerRejected {
        message: "empty client certificate chain".to_string(),
    })?;
    tls::peer_common_name(cert.as_ref())
}

/// The CONNECT-IP signalling stream with decode buffering.
struct SignalStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    buf: BytesMut,
}

impl SignalStream {
    fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            send,
            recv,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read more stream data into the buffer; Ok(false) on clean FIN.
    async fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 4096];
        match self.recv.read(&mut chunk).await {
            Ok(Some(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(Error::transport(format!("signalling stream read: {e}"))),
        }
    }

    async fn read_request(&mut self) -> Result<ConnectRequest> {
        loop {
            if let Some(request) = ConnectRequest::decode(&mut self.buf)? {
                return Ok(request);
            }
            if !self.fill().await? {
                return Err(Error::protocol("stream closed before request"));
            }
        }
    }

    /// Next capsule, or None on clean stream end.
    async fn read_capsule(&mut self) -> Result<Option<Capsule>> {
        loop {
            if let Some(capsule) = Capsule::decode(&mut self.buf)? {
                return Ok(Some(capsule));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Wait for the peer to echo the assigned prefix in an ADDRESS_REQUEST
    /// capsule.
    async fn wait_ack(&mut self, assigned: IpNet) -> Result<()> {
        loop {
            match self.read_capsule().await? {
                Some(Capsule::AddressRequest(requested))
                    if requested.iter().any(|r| r.prefix == assigned) =>
                {
                    return Ok(());
                }
                Some(other) => {
                    trace!(?other, "Ignoring capsule while awaiting assignment ack");
                }
                None => return Err(Error::protocol("stream closed before assignment ack")),
            }
        }
    }

    async fn send_response(&mut self, status: u16) -> Result<()> {
        let data = ConnectResponse::new(status).encode();
        self.send
            .write_all(&data)
            .await
            .map_err(|e| Error::transport(format!("send response: {e}")))
    }

    async fn send_capsule(&mut self, capsule: &Capsule) -> Result<()> {
        let data = capsule.encode();
        self.send
            .write_all(&data)
            .await
            .map_err(|e| Error::transport(format!("send capsule: {e}")))
    }
}
