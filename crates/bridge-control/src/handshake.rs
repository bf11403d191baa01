//! Agent authentication
//!
//! ```text
//! agent                                bridge
//!   "TST"                       ->
//!   len + min version           ->     resolve protocol index
//!   len + client version        ->
//! v0:                           <-     md5hex(version)
//!   md5hex(secret)              ->
//!                               <-     "sucs" | "vkey"
//! v1:
//!   timestamp (8, BE)           ->
//!   blake2b(secret) (32)        ->
//!   len + sealed local IP       ->
//!   len + nonce                 ->
//!   hmac (32)                   ->
//!                               <-     md5hex(version)
//!   role flag (4)               ->
//! ```

use crate::config::BridgeConfig;
use crate::store::Store;
use bridge_auth::{decrypt_bytes, md5_hex, verify_hmac, CredentialHash, CryptError, ReplayCache};
use bridge_proto::addr::decode_ip;
use bridge_proto::flags::{CONN_TEST, VERIFY_ERR, VERIFY_SUCCESS};
use bridge_proto::{version, BridgeConn, ConnError, Flag};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Handshake failures; every variant closes the connection
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ConnError),

    #[error("Bad connection test marker")]
    BadMarker,

    #[error("Unsupported minimum version {0:?}")]
    VersionMismatch(String),

    #[error("Unknown credential")]
    UnknownCredential,

    #[error("Timestamp {0} outside the replay window")]
    TimestampOutOfWindow(i64),

    #[error("Client {0} not found")]
    ClientNotFound(i64),

    #[error("Undecodable local address blob: {0}")]
    IpBlob(#[from] CryptError),

    #[error("Local address blob has {0} bytes")]
    IpLength(usize),

    #[error("HMAC mismatch")]
    HmacMismatch,

    #[error("Replayed handshake")]
    Replay,
}

/// A connection that passed authentication and named its role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub client_id: i64,
    pub version_index: usize,
    pub client_version: String,
    pub role: Flag,
}

/// Collaborators the handshake consults
pub struct HandshakeContext<'a> {
    pub config: &'a BridgeConfig,
    pub store: &'a dyn Store,
    pub replay: &'a ReplayCache,
}

/// Run the handshake on a fresh connection.
///
/// The caller owns the deadline for the pre-credential phase; once the
/// version echo is written, reads are bounded by `auth_read_timeout`.
pub async fn authenticate<S>(
    conn: &mut BridgeConn<S>,
    peer: &str,
    ctx: &HandshakeContext<'_>,
) -> Result<Authenticated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let marker = conn.read_array::<3>().await?;
    if &marker != CONN_TEST {
        return Err(HandshakeError::BadMarker);
    }

    let min_version = String::from_utf8_lossy(&conn.read_len_content().await?).into_owned();
    let version_index = version::resolve(&min_version, ctx.config.secure_mode)
        .ok_or_else(|| HandshakeError::VersionMismatch(min_version.clone()))?;

    let client_version = String::from_utf8_lossy(&conn.read_len_content().await?).into_owned();

    let client_id = if version_index == 0 {
        authenticate_v0(conn, peer, ctx).await?
    } else {
        authenticate_v1(conn, peer, ctx, &min_version, &client_version, version_index).await?
    };

    let role = conn.read_flag().await?;

    debug!(
        client_id,
        peer = %peer,
        version_index,
        client_version = %client_version,
        "Handshake complete"
    );

    Ok(Authenticated {
        client_id,
        version_index,
        client_version,
        role,
    })
}

async fn authenticate_v0<S>(
    conn: &mut BridgeConn<S>,
    peer: &str,
    ctx: &HandshakeContext<'_>,
) -> Result<i64, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.write_all(md5_hex(version::version_at(0)).as_bytes())
        .await?;
    conn.set_read_timeout(ctx.config.auth_read_timeout);

    let key = conn.read_array::<32>().await?;
    match ctx.store.authenticate(&key, CredentialHash::Md5, peer) {
        Some(id) => {
            conn.write_flag(VERIFY_SUCCESS).await?;
            Ok(id)
        }
        None => {
            reject(conn, peer, ctx).await;
            Err(HandshakeError::UnknownCredential)
        }
    }
}

async fn authenticate_v1<S>(
    conn: &mut BridgeConn<S>,
    peer: &str,
    ctx: &HandshakeContext<'_>,
    min_version: &str,
    client_version: &str,
    version_index: usize,
) -> Result<i64, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secure = ctx.config.secure_mode;

    let timestamp = conn.read_timestamp().await?;
    if secure {
        let now = chrono::Utc::now().timestamp();
        if timestamp > now || timestamp < now - ctx.replay.ttl_secs() {
            return Err(HandshakeError::TimestampOutOfWindow(timestamp));
        }
    }

    let key = conn.read_array::<32>().await?;
    let client_id = match ctx.store.authenticate(&key, CredentialHash::Blake2b, peer) {
        Some(id) => id,
        None => {
            reject(conn, peer, ctx).await;
            return Err(HandshakeError::UnknownCredential);
        }
    };
    let client = ctx
        .store
        .client(client_id)
        .ok_or(HandshakeError::ClientNotFound(client_id))?;

    let sealed_ip = conn.read_len_content().await?;
    let raw_ip = decrypt_bytes(&sealed_ip, &client.verify_key)?;
    let local_ip = decode_ip(&raw_ip).ok_or(HandshakeError::IpLength(raw_ip.len()))?;
    ctx.store.set_local_addr(client_id, &local_ip.to_string());

    let nonce = conn.read_len_content().await?;
    let mac = conn.read_array::<32>().await?;

    if secure {
        let pieces: [&[u8]; 4] = [
            min_version.as_bytes(),
            client_version.as_bytes(),
            &sealed_ip,
            &nonce,
        ];
        if !verify_hmac(&client.verify_key, timestamp, &pieces, &mac) {
            return Err(HandshakeError::HmacMismatch);
        }
        if !ctx.replay.check(&mac) {
            return Err(HandshakeError::Replay);
        }
    }

    conn.write_all(md5_hex(version::version_at(version_index)).as_bytes())
        .await?;
    conn.set_read_timeout(ctx.config.auth_read_timeout);

    Ok(client_id)
}

/// Tell the agent its credential is wrong, unless running in strict mode
async fn reject<S>(conn: &mut BridgeConn<S>, peer: &str, ctx: &HandshakeContext<'_>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(peer = %peer, "Client credential validation failed");
    if !ctx.config.secure_mode {
        let _ = conn.write_flag(VERIFY_ERR).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Client, MemoryStore};
    use bridge_auth::{blake2b_256, compute_hmac, encrypt_bytes};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    const KEY: &str = "agent-secret";

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_client(Client::new(5, KEY));
        store
    }

    fn agent_conn() -> (BridgeConn<DuplexStream>, BridgeConn<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (BridgeConn::new(a), BridgeConn::new(b))
    }

    async fn send_preamble(agent: &mut BridgeConn<DuplexStream>, min_version: &str) {
        agent.write_all(b"TST").await.unwrap();
        agent.write_len_content(min_version.as_bytes()).await.unwrap();
        agent.write_len_content(b"0.27.0").await.unwrap();
    }

    async fn send_v1(agent: &mut BridgeConn<DuplexStream>, key: &str, timestamp: i64, nonce: &[u8]) {
        send_preamble(agent, "0.27.0").await;
        let sealed = encrypt_bytes(&[192, 168, 1, 7], key).unwrap();
        let mac = compute_hmac(key, timestamp, &[b"0.27.0", b"0.27.0", &sealed, nonce]).unwrap();

        agent.write_all(&timestamp.to_be_bytes()).await.unwrap();
        agent.write_all(&blake2b_256(key)).await.unwrap();
        agent.write_len_content(&sealed).await.unwrap();
        agent.write_len_content(nonce).await.unwrap();
        agent.write_all(&mac).await.unwrap();
        agent.write_flag(b"main").await.unwrap();
    }

    #[tokio::test]
    async fn test_v1_handshake_succeeds() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default().with_secure_mode(true);
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };

        let (mut agent, mut server) = agent_conn();
        send_v1(&mut agent, KEY, chrono::Utc::now().timestamp(), b"nonce-1").await;

        let auth = authenticate(&mut server, "203.0.113.5:4000", &ctx).await.unwrap();
        assert_eq!(auth.client_id, 5);
        assert_eq!(auth.version_index, 1);
        assert_eq!(&auth.role, b"main");

        let echo = agent.read_exact_vec(32).await.unwrap();
        assert_eq!(echo, md5_hex("0.27.0").as_bytes());

        let client = store.client(5).unwrap();
        assert_eq!(client.local_addr, "192.168.1.7");
        assert_eq!(client.addr, "203.0.113.5");
    }

    #[tokio::test]
    async fn test_v0_handshake_succeeds() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default();
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };

        let (mut agent, mut server) = agent_conn();
        send_preamble(&mut agent, "0.26.0").await;
        agent.write_all(md5_hex(KEY).as_bytes()).await.unwrap();
        agent.write_flag(b"chan").await.unwrap();

        let auth = authenticate(&mut server, "1.1.1.1:1", &ctx).await.unwrap();
        assert_eq!(auth.version_index, 0);
        assert_eq!(&auth.role, b"chan");

        assert_eq!(agent.read_exact_vec(32).await.unwrap(), md5_hex("0.26.0").as_bytes());
        assert_eq!(&agent.read_flag().await.unwrap(), b"sucs");
    }

    #[tokio::test]
    async fn test_v0_bad_credential_gets_error_flag() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default();
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };

        let (mut agent, mut server) = agent_conn();
        send_preamble(&mut agent, "0.26.0").await;
        agent.write_all(md5_hex("wrong").as_bytes()).await.unwrap();

        let err = authenticate(&mut server, "1.1.1.1:1", &ctx).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnknownCredential));

        agent.read_exact_vec(32).await.unwrap();
        assert_eq!(&agent.read_flag().await.unwrap(), b"vkey");
    }

    #[tokio::test]
    async fn test_secure_mode_rejects_old_version_before_credentials() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default().with_secure_mode(true);
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };

        let (mut agent, mut server) = agent_conn();
        send_preamble(&mut agent, "0.26.0").await;

        let err = authenticate(&mut server, "1.1.1.1:1", &ctx).await.unwrap_err();
        assert!(matches!(err, HandshakeError::VersionMismatch(v) if v == "0.26.0"));
    }

    #[tokio::test]
    async fn test_secure_mode_rejects_stale_timestamp() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default().with_secure_mode(true);
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };

        let (mut agent, mut server) = agent_conn();
        let stale = chrono::Utc::now().timestamp() - 120;
        send_v1(&mut agent, KEY, stale, b"n").await;

        let err = authenticate(&mut server, "1.1.1.1:1", &ctx).await.unwrap_err();
        assert!(matches!(err, HandshakeError::TimestampOutOfWindow(ts) if ts == stale));
    }

    #[tokio::test]
    async fn test_secure_mode_rejects_replay() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default().with_secure_mode(true);
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };
        let ts = chrono::Utc::now().timestamp();

        let (mut agent, mut server) = agent_conn();
        send_v1(&mut agent, KEY, ts, b"same-nonce").await;
        assert!(authenticate(&mut server, "1.1.1.1:1", &ctx).await.is_ok());

        // Byte-identical second attempt: AES-GCM nonce differs, so rebuild
        // the exact same transcript by hand
        let (mut agent2, mut server2) = agent_conn();
        let sealed = encrypt_bytes(&[10, 0, 0, 1], KEY).unwrap();
        let mac = compute_hmac(KEY, ts, &[b"0.27.0", b"0.27.0", &sealed, b"n2"]).unwrap();
        for _ in 0..2 {
            send_preamble(&mut agent2, "0.27.0").await;
            agent2.write_all(&ts.to_be_bytes()).await.unwrap();
            agent2.write_all(&blake2b_256(KEY)).await.unwrap();
            agent2.write_len_content(&sealed).await.unwrap();
            agent2.write_len_content(b"n2").await.unwrap();
            agent2.write_all(&mac).await.unwrap();
            agent2.write_flag(b"main").await.unwrap();
        }
        assert!(authenticate(&mut server2, "1.1.1.1:1", &ctx).await.is_ok());
        let err = authenticate(&mut server2, "1.1.1.1:1", &ctx).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Replay));
    }

    #[tokio::test]
    async fn test_secure_mode_rejects_bad_hmac_silently() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default().with_secure_mode(true);
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };
        let ts = chrono::Utc::now().timestamp();

        let (mut agent, mut server) = agent_conn();
        send_preamble(&mut agent, "0.27.0").await;
        let sealed = encrypt_bytes(&[10, 0, 0, 1], KEY).unwrap();
        agent.write_all(&ts.to_be_bytes()).await.unwrap();
        agent.write_all(&blake2b_256(KEY)).await.unwrap();
        agent.write_len_content(&sealed).await.unwrap();
        agent.write_len_content(b"nonce").await.unwrap();
        agent.write_all(&[0u8; 32]).await.unwrap();

        let err = authenticate(&mut server, "1.1.1.1:1", &ctx).await.unwrap_err();
        assert!(matches!(err, HandshakeError::HmacMismatch));
    }

    #[tokio::test]
    async fn test_secure_mode_unknown_credential_sends_nothing() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default().with_secure_mode(true);
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };

        let (mut agent, mut server) = agent_conn();
        send_preamble(&mut agent, "0.27.0").await;
        agent.write_all(&chrono::Utc::now().timestamp().to_be_bytes()).await.unwrap();
        agent.write_all(&blake2b_256("not-a-client")).await.unwrap();

        let err = authenticate(&mut server, "1.1.1.1:1", &ctx).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnknownCredential));

        drop(server);
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(agent.get_mut(), &mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_bad_marker_rejected() {
        let store = store();
        let replay = ReplayCache::new(Duration::from_secs(30));
        let config = BridgeConfig::default();
        let ctx = HandshakeContext { config: &config, store: &store, replay: &replay };

        let (mut agent, mut server) = agent_conn();
        agent.write_all(b"GET").await.unwrap();

        let err = authenticate(&mut server, "1.1.1.1:1", &ctx).await.unwrap_err();
        assert!(matches!(err, HandshakeError::BadMarker));
    }
}
