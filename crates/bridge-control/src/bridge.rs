//! Agent listener and per-role connection handling

use crate::config::BridgeConfig;
use crate::dispatcher::Role;
use crate::handshake::{self, Authenticated, HandshakeContext, HandshakeError};
use crate::ip_registry::IpRegistry;
use crate::session::{ClientSession, SessionRegistry, SignalConn};
use crate::store::{Store, Task, TaskMode};
use bridge_auth::ReplayCache;
use bridge_mux::{BoxedIo, FrameMuxFactory, MuxFactory, MuxKind};
use bridge_proto::conn::len_prefixed;
use bridge_proto::flags::NEW_UDP_CONN;
use bridge_proto::{BridgeConn, ConnError, RoleTag};
use dashmap::DashSet;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SIGNAL_KEEPALIVE: Duration = Duration::from_secs(5);

/// Ids of tasks the proxy layer has started
pub type RunList = Arc<DashSet<i64>>;

/// Transport an agent connection arrives on
pub trait BridgeStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Turn on TCP keep-alive where the transport has it
    fn enable_keepalive(&self, _period: Duration) -> io::Result<()> {
        Ok(())
    }
}

impl BridgeStream for TcpStream {
    fn enable_keepalive(&self, period: Duration) -> io::Result<()> {
        let keepalive = TcpKeepalive::new().with_time(period);
        SockRef::from(self).set_tcp_keepalive(&keepalive)
    }
}

impl BridgeStream for DuplexStream {}

/// Checks whether a task's public port can be bound
pub trait PortProbe: Send + Sync {
    fn is_available(&self, port: u16, mode: TaskMode) -> bool;
}

/// Probes by binding the port on all interfaces and releasing it
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortProbe;

impl PortProbe for SystemPortProbe {
    fn is_available(&self, port: u16, mode: TaskMode) -> bool {
        if mode.is_portless() {
            return true;
        }
        match mode {
            TaskMode::Udp => std::net::UdpSocket::bind(("0.0.0.0", port)).is_ok(),
            _ => std::net::TcpListener::bind(("0.0.0.0", port)).is_ok(),
        }
    }
}

/// A `sert` connection handed to the secret-tunnel consumer
pub struct SecretRequest {
    /// The 32 hex characters the visitor sent
    pub password_hash: String,
    pub conn: BridgeConn<BoxedIo>,
    pub peer: SocketAddr,
}

/// Receiving ends of the bridge's outbound queues
pub struct BridgeChannels {
    /// Tasks created over config connections, to be started
    pub open_task: mpsc::Receiver<Task>,
    /// Ids of evicted clients
    pub close_client: mpsc::Receiver<i64>,
    pub secret: mpsc::Receiver<SecretRequest>,
}

/// The control-plane bridge.
///
/// Cheap to clone; every clone shares the same registries and queues.
#[derive(Clone)]
pub struct Bridge {
    pub(crate) config: Arc<BridgeConfig>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) ip_registry: IpRegistry,
    pub(crate) replay: Arc<ReplayCache>,
    pub(crate) run_list: RunList,
    pub(crate) mux_factory: Arc<dyn MuxFactory>,
    pub(crate) port_probe: Arc<dyn PortProbe>,
    pub(crate) open_task_tx: mpsc::Sender<Task>,
    close_client_tx: mpsc::Sender<i64>,
    secret_tx: mpsc::Sender<SecretRequest>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, store: Arc<dyn Store>) -> (Self, BridgeChannels) {
        let capacity = config.queue_capacity.max(1);
        let (open_task_tx, open_task) = mpsc::channel(capacity);
        let (close_client_tx, close_client) = mpsc::channel(capacity);
        let (secret_tx, secret) = mpsc::channel(capacity);

        let bridge = Self {
            replay: Arc::new(ReplayCache::new(config.replay_ttl)),
            config: Arc::new(config),
            store,
            sessions: SessionRegistry::new(),
            ip_registry: IpRegistry::new(),
            run_list: Arc::new(DashSet::new()),
            mux_factory: Arc::new(FrameMuxFactory),
            port_probe: Arc::new(SystemPortProbe),
            open_task_tx,
            close_client_tx,
            secret_tx,
        };

        (
            bridge,
            BridgeChannels {
                open_task,
                close_client,
                secret,
            },
        )
    }

    pub fn with_mux_factory(mut self, factory: Arc<dyn MuxFactory>) -> Self {
        self.mux_factory = factory;
        self
    }

    pub fn with_port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.port_probe = probe;
        self
    }

    pub fn with_sessions(mut self, sessions: SessionRegistry) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_ip_registry(mut self, registry: IpRegistry) -> Self {
        self.ip_registry = registry;
        self
    }

    /// Share the proxy layer's run list with the status query
    pub fn with_run_list(mut self, run_list: RunList) -> Self {
        self.run_list = run_list;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn ip_registry(&self) -> &IpRegistry {
        &self.ip_registry
    }

    pub fn run_list(&self) -> &RunList {
        &self.run_list
    }

    /// Accept agent connections until `shutdown` fires
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("Bridge listening on {}", addr),
            Err(e) => warn!("Bridge listener has no local address: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Bridge listener shutting down");
                    break;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        bridge.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Authenticate one connection and hand it to its role
    pub async fn handle_connection<S: BridgeStream>(&self, stream: S, peer: SocketAddr) {
        let mut conn = BridgeConn::new(stream);
        conn.set_read_timeout(self.config.handshake_timeout);
        let peer_str = peer.to_string();

        let ctx = HandshakeContext {
            config: &self.config,
            store: self.store.as_ref(),
            replay: &self.replay,
        };
        let auth = match handshake::authenticate(&mut conn, &peer_str, &ctx).await {
            Ok(auth) => auth,
            Err(e) => {
                match e {
                    HandshakeError::Protocol(_) | HandshakeError::BadMarker => {
                        debug!(peer = %peer, "Handshake aborted: {}", e)
                    }
                    _ => warn!(peer = %peer, "Authentication failed: {}", e),
                }
                let _ = conn.shutdown().await;
                return;
            }
        };

        let Some(tag) = RoleTag::from_flag(&auth.role) else {
            warn!(
                client_id = auth.client_id,
                peer = %peer,
                flag = %String::from_utf8_lossy(&auth.role),
                "Unknown role flag, draining connection"
            );
            conn.set_alive();
            if let Ok(n) = conn.drain().await {
                debug!(peer = %peer, "Drained {} bytes", n);
            }
            return;
        };

        let role = match Role::read(tag, &mut conn).await {
            Ok(role) => role,
            Err(e) => {
                warn!(client_id = auth.client_id, role = %tag, "Failed to read role payload: {}", e);
                return;
            }
        };

        self.dispatch(role, conn, &auth, peer).await;
    }

    async fn dispatch<S: BridgeStream>(
        &self,
        role: Role,
        mut conn: BridgeConn<S>,
        auth: &Authenticated,
        peer: SocketAddr,
    ) {
        match role {
            Role::Signal => self.attach_signal(conn, auth, peer).await,
            Role::Tunnel => self.attach_mux(conn, auth, MuxKind::Tunnel).await,
            Role::File => self.attach_mux(conn, auth, MuxKind::File).await,
            Role::Config => self.serve_config(conn, auth.client_id).await,
            Role::Register { hours } => {
                self.ip_registry.register(&peer.ip().to_string(), hours);
                conn.set_alive();
            }
            Role::Secret { password_hash } => {
                conn.set_alive();
                let io: BoxedIo = Box::new(conn.into_inner());
                let request = SecretRequest {
                    password_hash: String::from_utf8_lossy(&password_hash).into_owned(),
                    conn: BridgeConn::new(io),
                    peer,
                };
                if self.secret_tx.send(request).await.is_err() {
                    warn!(peer = %peer, "Secret queue closed, dropping connection");
                }
            }
            Role::P2p { password_hash } => self.p2p_rendezvous(conn, &password_hash).await,
        }
    }

    async fn attach_signal<S: BridgeStream>(
        &self,
        mut conn: BridgeConn<S>,
        auth: &Authenticated,
        peer: SocketAddr,
    ) {
        let id = auth.client_id;
        if self.store.is_public(id) {
            warn!(client_id = id, "Public client may not open a signal connection");
            let _ = conn.shutdown().await;
            return;
        }

        if let Err(e) = conn.get_ref().enable_keepalive(SIGNAL_KEEPALIVE) {
            debug!(client_id = id, "Failed to enable keep-alive: {}", e);
        }
        conn.set_alive();

        let (reader, writer) = conn.split();
        let signal = Arc::new(SignalConn::new(writer, peer.to_string()));
        if let Some(previous) = self
            .sessions
            .attach_signal(id, signal.clone(), &auth.client_version)
        {
            previous.send_close_notice().await;
        }

        info!(
            client_id = id,
            peer = %peer,
            version = %auth.client_version,
            "Client connected"
        );
        self.spawn_health_monitor(id, signal, reader);
    }

    async fn attach_mux<S: BridgeStream>(
        &self,
        mut conn: BridgeConn<S>,
        auth: &Authenticated,
        kind: MuxKind,
    ) {
        let id = auth.client_id;
        conn.set_alive();
        let io: BoxedIo = Box::new(conn.into_inner());
        let mux = self
            .mux_factory
            .new_mux(io, kind, self.config.mux_idle_timeout);

        let previous = match kind {
            MuxKind::Tunnel => self.sessions.attach_tunnel(id, mux, &auth.client_version),
            MuxKind::File => self.sessions.attach_file(id, mux, &auth.client_version),
        };
        if let Some(previous) = previous {
            debug!(client_id = id, kind = %kind, "Closing replaced multiplexer");
            previous.close().await;
        }
        debug!(client_id = id, kind = %kind, "Multiplexer attached");
    }

    async fn p2p_rendezvous<S: BridgeStream>(&self, mut conn: BridgeConn<S>, password_hash: &[u8; 32]) {
        let Some(task) = self.store.task_by_md5_password(password_hash) else {
            warn!("p2p: no task matches the password");
            return;
        };
        let owner = task.client_id;

        let signal = match self.sessions.signal_of(owner) {
            Some(signal) if !signal.is_closed() => signal,
            _ => {
                warn!(client_id = owner, "p2p: owning client is not connected");
                return;
            }
        };
        let Some(server_addr) = self.config.p2p_addr.as_deref() else {
            warn!("p2p: no rendezvous address configured");
            return;
        };

        let push = match udp_conn_message(server_addr, password_hash) {
            Ok(push) => push,
            Err(e) => {
                warn!("p2p: failed to encode rendezvous message: {}", e);
                return;
            }
        };
        if let Err(e) = signal.send(&push).await {
            warn!(client_id = owner, "p2p: failed to notify client: {}", e);
            return;
        }

        conn.set_alive();
        if let Err(e) = conn.write_len_content(server_addr.as_bytes()).await {
            debug!("p2p: failed to answer requester: {}", e);
        }
        debug!(client_id = owner, task_id = task.id, "p2p rendezvous relayed");
    }

    /// Evict a client, closing every connection it owns
    pub async fn del_client(&self, id: i64) {
        if let Some(session) = self.sessions.remove(id) {
            self.teardown(id, session).await;
        }
    }

    pub(crate) async fn teardown(&self, id: i64, session: ClientSession) {
        session.close().await;
        info!(client_id = id, "Client session closed");
        self.notify_closed(id);
    }

    /// Like [`teardown`](Self::teardown), but the connections are closed on a
    /// separate task so the caller never waits on the session's I/O
    pub(crate) fn teardown_detached(&self, id: i64, session: ClientSession) {
        self.notify_closed(id);
        tokio::spawn(async move {
            session.close().await;
            info!(client_id = id, "Client session closed");
        });
    }

    fn notify_closed(&self, id: i64) {
        if id <= 0 || self.store.is_public(id) || self.store.client(id).is_none() {
            return;
        }
        match self.close_client_tx.try_send(id) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id = id, "Close-client queue full, dropping notification")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client_id = id, "Close-client queue closed")
            }
        }
    }
}

/// `udpc` + len-prefixed rendezvous address + len-prefixed password hash
fn udp_conn_message(server_addr: &str, password_hash: &[u8]) -> Result<Vec<u8>, ConnError> {
    let mut push = NEW_UDP_CONN.to_vec();
    push.extend_from_slice(&len_prefixed(server_addr.as_bytes())?);
    push.extend_from_slice(&len_prefixed(password_hash)?);
    Ok(push)
}
