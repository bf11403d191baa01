//! Scripted agent that drives a bridge over in-memory pipes
#![allow(dead_code)]

use bridge_auth::{blake2b_256, compute_hmac, encrypt_bytes, md5_hex};
use bridge_control::{Bridge, BridgeChannels, BridgeConfig, Client, MemoryStore, PortProbe, TaskMode};
use bridge_mux::{FrameMux, MuxKind};
use bridge_proto::addr::encode_ip;
use bridge_proto::flags::VERIFY_SUCCESS;
use bridge_proto::{version, BridgeConn, ConnError, Flag};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;

pub const SECRET: &str = "agent-secret-one";
pub const CLIENT_ID: i64 = 1;
pub const AGENT_VERSION: &str = "0.27.0";

pub type AgentConn = BridgeConn<DuplexStream>;

static NONCE: AtomicU64 = AtomicU64::new(1);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Store holding one ordinary agent account
pub fn seeded_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.insert_client(Client::new(CLIENT_ID, SECRET));
    Arc::new(store)
}

pub fn start(config: BridgeConfig, store: Arc<MemoryStore>) -> (Bridge, BridgeChannels) {
    init_tracing();
    let (bridge, channels) = Bridge::new(config, store);
    (bridge.with_port_probe(Arc::new(AllowAll)), channels)
}

/// Never touches real sockets
pub struct AllowAll;

impl PortProbe for AllowAll {
    fn is_available(&self, _port: u16, _mode: TaskMode) -> bool {
        true
    }
}

pub struct DenyAll;

impl PortProbe for DenyAll {
    fn is_available(&self, _port: u16, _mode: TaskMode) -> bool {
        false
    }
}

pub fn peer() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000)
}

/// Open a connection the bridge serves on a background task
pub fn connect(bridge: &Bridge) -> AgentConn {
    let (agent, server) = tokio::io::duplex(256 * 1024);
    let bridge = bridge.clone();
    tokio::spawn(async move { bridge.handle_connection(server, peer()).await });
    BridgeConn::new(agent)
}

pub async fn send_preamble(conn: &mut AgentConn, min_version: &str) -> Result<(), ConnError> {
    conn.write_all(b"TST").await?;
    conn.write_len_content(min_version.as_bytes()).await?;
    conn.write_len_content(AGENT_VERSION.as_bytes()).await
}

pub fn fresh_nonce() -> Vec<u8> {
    format!("nonce-{}", NONCE.fetch_add(1, Ordering::Relaxed)).into_bytes()
}

/// v1 authentication up to the version echo, which is returned
pub async fn hello_v1(
    conn: &mut AgentConn,
    secret: &str,
    timestamp: i64,
    nonce: &[u8],
) -> Result<[u8; 32], ConnError> {
    let min_version = version::latest();
    send_preamble(conn, min_version).await?;

    let sealed = encrypt_bytes(&encode_ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))), secret)
        .expect("seal local ip");
    let mac = compute_hmac(
        secret,
        timestamp,
        &[min_version.as_bytes(), AGENT_VERSION.as_bytes(), &sealed, nonce],
    )
    .expect("hmac");

    conn.write_all(&timestamp.to_be_bytes()).await?;
    conn.write_all(&blake2b_256(secret)).await?;
    conn.write_len_content(&sealed).await?;
    conn.write_len_content(nonce).await?;
    conn.write_all(&mac).await?;

    conn.read_array::<32>().await
}

/// Authenticate with the current protocol and declare `role`
pub async fn handshake_v1(conn: &mut AgentConn, secret: &str, role: &Flag) {
    let timestamp = chrono::Utc::now().timestamp();
    let echo = hello_v1(conn, secret, timestamp, &fresh_nonce())
        .await
        .expect("version echo");
    assert_eq!(echo.as_slice(), md5_hex(version::latest()).as_bytes());
    conn.write_flag(role).await.expect("role flag");
}

/// Legacy authentication; the role is only sent when the bridge accepts
pub async fn handshake_v0(conn: &mut AgentConn, secret: &str, role: &Flag) -> Result<Flag, ConnError> {
    send_preamble(conn, version::version_at(0)).await?;
    let _echo = conn.read_array::<32>().await?;
    conn.write_all(md5_hex(secret).as_bytes()).await?;

    let verdict = conn.read_flag().await?;
    if &verdict == VERIFY_SUCCESS {
        conn.write_flag(role).await?;
    }
    Ok(verdict)
}

/// Turn an authenticated `chan`/`file` connection into the agent's multiplexer
pub fn agent_mux(conn: AgentConn, kind: MuxKind) -> FrameMux {
    FrameMux::client(conn.into_inner(), kind, Duration::from_secs(60))
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
