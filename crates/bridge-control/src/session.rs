//! Per-agent session registry
//!
//! Every mutation is a single atomic operation on the entry keyed by the
//! client id. Anything that must be closed is handed back to the caller and
//! closed after the entry guard is released.

use bridge_mux::Multiplexer;
use bridge_proto::conn::{write_frame, ConnError};
use bridge_proto::flags::RES_CLOSE;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static NEXT_SIGNAL_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Upper bound on one write to an agent's control connection
pub const SIGNAL_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type SignalWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn not_connected() -> ConnError {
    ConnError::Io(std::io::ErrorKind::NotConnected.into())
}

async fn shutdown_writer(writer: &mut SignalWriter) {
    let _ = tokio::time::timeout(SIGNAL_WRITE_TIMEOUT, writer.shutdown()).await;
}

/// Write side of an agent's control connection.
///
/// The read side belongs to that agent's health monitor, which stops when
/// this connection is closed.
pub struct SignalConn {
    serial: u64,
    peer: String,
    writer: Mutex<SignalWriter>,
    closed: CancellationToken,
}

impl SignalConn {
    pub fn new<W>(writer: W, peer: impl Into<String>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            serial: NEXT_SIGNAL_SERIAL.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            writer: Mutex::new(Box::new(writer)),
            closed: CancellationToken::new(),
        }
    }

    /// Unique per connection; distinguishes a replaced signal from its successor
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one message; concurrent senders never interleave.
    ///
    /// A write that cannot finish within [`SIGNAL_WRITE_TIMEOUT`] closes the
    /// connection, as does a [`close`](Self::close) issued while it is blocked.
    pub async fn send(&self, data: &[u8]) -> Result<(), ConnError> {
        let mut writer = tokio::select! {
            _ = self.closed.cancelled() => return Err(not_connected()),
            writer = self.writer.lock() => writer,
        };

        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(not_connected()),
            written = tokio::time::timeout(SIGNAL_WRITE_TIMEOUT, write_frame(&mut *writer, data)) => {
                match written {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(peer = %self.peer, "Signal write timed out");
                        self.closed.cancel();
                        Err(ConnError::Timeout)
                    }
                }
            }
        };

        // close() leaves the shutdown to whoever holds the writer
        if self.is_closed() {
            shutdown_writer(&mut writer).await;
        }
        result
    }

    /// Tell the agent it has been replaced, then close
    pub async fn send_close_notice(&self) {
        if let Err(e) = self.send(RES_CLOSE).await {
            debug!(peer = %self.peer, "Failed to send close notice: {}", e);
        }
        self.close().await;
    }

    /// Mark the connection closed and shut the writer down.
    ///
    /// Never waits on a send in flight; that send observes the close and
    /// shuts the writer down itself.
    pub async fn close(&self) {
        self.closed.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            shutdown_writer(&mut writer).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Fires once [`close`](Self::close) is called
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl fmt::Debug for SignalConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalConn")
            .field("serial", &self.serial)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Bridge-side bookkeeping for one agent
#[derive(Clone, Default)]
pub struct ClientSession {
    pub signal: Option<Arc<SignalConn>>,
    pub tunnel: Option<Arc<dyn Multiplexer>>,
    pub file: Option<Arc<dyn Multiplexer>>,
    pub version: String,
    /// Consecutive failed liveness checks
    pub retry_count: u32,
}

impl ClientSession {
    /// Liveness: signal present and tunnel present and open
    pub fn is_healthy(&self) -> bool {
        match (&self.signal, &self.tunnel) {
            (Some(_), Some(tunnel)) => !tunnel.is_closed(),
            _ => false,
        }
    }

    pub fn signal_serial(&self) -> Option<u64> {
        self.signal.as_ref().map(|s| s.serial())
    }

    /// Close every owned connection; each field is optional
    pub async fn close(&self) {
        if let Some(signal) = &self.signal {
            signal.close().await;
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
        if let Some(file) = &self.file {
            file.close().await;
        }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("signal", &self.signal)
            .field("tunnel", &self.tunnel.as_ref().map(|m| m.is_closed()))
            .field("file", &self.file.as_ref().map(|m| m.is_closed()))
            .field("version", &self.version)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// Concurrent client id → session map
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<i64, ClientSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `signal` as the agent's control connection, creating the
    /// session if needed.
    ///
    /// Returns the replaced signal, which the caller must notify and close.
    pub fn attach_signal(
        &self,
        id: i64,
        signal: Arc<SignalConn>,
        version: &str,
    ) -> Option<Arc<SignalConn>> {
        let mut session = self.sessions.entry(id).or_default();
        session.version = version.to_string();
        let previous = session.signal.replace(signal);

        if let Some(ref replaced) = previous {
            info!(
                client_id = id,
                old_peer = %replaced.peer(),
                "Replacing existing signal connection"
            );
        }
        previous
    }

    fn attach_mux(
        &self,
        id: i64,
        mux: Arc<dyn Multiplexer>,
        version: &str,
        file: bool,
    ) -> Option<Arc<dyn Multiplexer>> {
        let mut session = self.sessions.entry(id).or_insert_with(|| ClientSession {
            version: version.to_string(),
            ..Default::default()
        });
        let slot = if file {
            &mut session.file
        } else {
            &mut session.tunnel
        };
        slot.replace(mux)
    }

    /// Install the data-tunnel multiplexer; returns the replaced one
    pub fn attach_tunnel(
        &self,
        id: i64,
        mux: Arc<dyn Multiplexer>,
        version: &str,
    ) -> Option<Arc<dyn Multiplexer>> {
        self.attach_mux(id, mux, version, false)
    }

    /// Install the file-service multiplexer; returns the replaced one
    pub fn attach_file(
        &self,
        id: i64,
        mux: Arc<dyn Multiplexer>,
        version: &str,
    ) -> Option<Arc<dyn Multiplexer>> {
        self.attach_mux(id, mux, version, true)
    }

    /// Ensure an (empty) session exists for a freshly created client
    pub fn insert_placeholder(&self, id: i64) {
        self.sessions.entry(id).or_default();
    }

    pub fn get(&self, id: i64) -> Option<ClientSession> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn signal_of(&self, id: i64) -> Option<Arc<SignalConn>> {
        self.sessions.get(&id).and_then(|s| s.signal.clone())
    }

    pub fn contains(&self, id: i64) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn remove(&self, id: i64) -> Option<ClientSession> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Remove the session only while `serial` is still its signal connection
    pub fn remove_if_signal(&self, id: i64, serial: u64) -> Option<ClientSession> {
        self.sessions
            .remove_if(&id, |_, session| {
                session.signal_serial() == Some(serial)
            })
            .map(|(_, session)| session)
    }

    /// One liveness pass: bump or reset every real session's retry count and
    /// return the sessions that reached `max_retries`, each with the serial
    /// of the signal it had at that moment
    pub fn tick(&self, max_retries: u32) -> Vec<(i64, Option<u64>)> {
        let mut expired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let id = *entry.key();
            if id <= 0 {
                continue;
            }

            let session = entry.value_mut();
            if session.is_healthy() {
                session.retry_count = 0;
            } else {
                session.retry_count += 1;
                debug!(client_id = id, retry_count = session.retry_count, "Liveness check failed");
                if session.retry_count >= max_retries {
                    expired.push((id, session.signal_serial()));
                }
            }
        }
        expired
    }

    /// Remove a session found expired by [`tick`](Self::tick), unless it has
    /// since recovered or had its signal replaced
    pub fn remove_expired(
        &self,
        id: i64,
        signal_serial: Option<u64>,
        max_retries: u32,
    ) -> Option<ClientSession> {
        self.sessions
            .remove_if(&id, |_, session| {
                session.retry_count >= max_retries
                    && session.signal_serial() == signal_serial
                    && !session.is_healthy()
            })
            .map(|(_, session)| session)
    }

    pub fn retry_count(&self, id: i64) -> Option<u32> {
        self.sessions.get(&id).map(|s| s.retry_count)
    }

    pub fn ids(&self) -> Vec<i64> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_mux::{MuxError, MuxStream};
    use std::sync::atomic::AtomicBool;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct FakeMux {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Multiplexer for FakeMux {
        async fn open_stream(&self) -> Result<MuxStream, MuxError> {
            Err(MuxError::Closed)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn signal() -> (Arc<SignalConn>, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        (Arc::new(SignalConn::new(a, "127.0.0.1:1")), b)
    }

    #[tokio::test]
    async fn test_roles_merge_into_one_session() {
        let registry = SessionRegistry::new();
        let (sig, _peer) = signal();

        assert!(registry.attach_signal(5, sig, "0.27.0").is_none());
        assert!(registry
            .attach_tunnel(5, Arc::new(FakeMux::default()), "0.27.0")
            .is_none());

        assert_eq!(registry.len(), 1);
        let session = registry.get(5).unwrap();
        assert!(session.signal.is_some());
        assert!(session.tunnel.is_some());
        assert!(session.file.is_none());
    }

    #[tokio::test]
    async fn test_signal_replacement_returns_previous() {
        let registry = SessionRegistry::new();
        let (first, mut first_peer) = signal();
        let (second, _second_peer) = signal();
        let first_serial = first.serial();

        registry.attach_signal(5, first, "0.27.0");
        let replaced = registry.attach_signal(5, second.clone(), "0.27.0").unwrap();
        assert_eq!(replaced.serial(), first_serial);

        replaced.send_close_notice().await;
        let mut buf = Vec::new();
        first_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"clse");

        assert_eq!(registry.signal_of(5).unwrap().serial(), second.serial());
    }

    #[tokio::test]
    async fn test_remove_if_signal_ignores_stale_serial() {
        let registry = SessionRegistry::new();
        let (first, _p1) = signal();
        let (second, _p2) = signal();
        let stale = first.serial();

        registry.attach_signal(9, first, "v");
        registry.attach_signal(9, second.clone(), "v");

        assert!(registry.remove_if_signal(9, stale).is_none());
        assert!(registry.contains(9));
        assert!(registry.remove_if_signal(9, second.serial()).is_some());
        assert!(!registry.contains(9));
    }

    #[tokio::test]
    async fn test_tick_counts_and_resets() {
        let registry = SessionRegistry::new();
        let (sig, _peer) = signal();
        let serial = sig.serial();
        let mux = Arc::new(FakeMux::default());
        registry.attach_signal(5, sig, "v");
        registry.attach_tunnel(5, mux.clone(), "v");

        assert!(registry.tick(3).is_empty());
        assert_eq!(registry.retry_count(5), Some(0));

        mux.close().await;
        assert!(registry.tick(3).is_empty());
        assert!(registry.tick(3).is_empty());
        assert_eq!(registry.retry_count(5), Some(2));
        assert_eq!(registry.tick(3), vec![(5, Some(serial))]);
    }

    #[tokio::test]
    async fn test_signal_replacement_keeps_retry_count() {
        let registry = SessionRegistry::new();
        let (first, _p1) = signal();
        let (second, _p2) = signal();
        registry.attach_signal(5, first, "v");

        registry.tick(3);
        registry.tick(3);
        registry.attach_signal(5, second, "v");
        assert_eq!(registry.retry_count(5), Some(2));
    }

    #[tokio::test]
    async fn test_remove_expired_spares_reconnected_session() {
        let registry = SessionRegistry::new();
        let (first, _p1) = signal();
        let (second, _p2) = signal();
        registry.attach_signal(5, first, "v");

        registry.tick(3);
        registry.tick(3);
        let expired = registry.tick(3);
        let (id, serial) = expired[0];

        // the agent reconnects its signal between the tick and the eviction
        registry.attach_signal(id, second.clone(), "v");
        assert!(registry.remove_expired(id, serial, 3).is_none());
        assert_eq!(registry.signal_of(5).unwrap().serial(), second.serial());

        // a tunnel that makes the session healthy also spares it
        registry.attach_tunnel(5, Arc::new(FakeMux::default()), "v");
        assert!(registry.remove_expired(5, Some(second.serial()), 3).is_none());

        registry.get(5).unwrap().tunnel.unwrap().close().await;
        assert!(registry.remove_expired(5, Some(second.serial()), 3).is_some());
        assert!(!registry.contains(5));
    }

    #[tokio::test]
    async fn test_tick_skips_virtual_ids() {
        let registry = SessionRegistry::new();
        registry.insert_placeholder(0);
        registry.insert_placeholder(-3);
        for _ in 0..5 {
            assert!(registry.tick(3).is_empty());
        }
        assert_eq!(registry.retry_count(-3), Some(0));
    }

    #[tokio::test]
    async fn test_session_close_closes_everything() {
        let (sig, _peer) = signal();
        let tunnel = Arc::new(FakeMux::default());
        let session = ClientSession {
            signal: Some(sig.clone()),
            tunnel: Some(tunnel.clone()),
            ..Default::default()
        };

        session.close().await;
        assert!(sig.is_closed());
        assert!(tunnel.is_closed());
        assert!(sig.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_for_blocked_send() {
        // the peer never reads, so a large write stalls on the pipe
        let (a, mut stalled_peer) = tokio::io::duplex(16);
        let sig = Arc::new(SignalConn::new(a, "127.0.0.1:1"));

        let sender = {
            let sig = sig.clone();
            tokio::spawn(async move { sig.send(&[7u8; 4096]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), sig.close())
            .await
            .expect("close waited on the blocked writer");
        assert!(sig.is_closed());

        let sent = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .unwrap()
            .unwrap();
        assert!(sent.is_err());

        // the writer was shut down by the aborted send
        let mut rest = Vec::new();
        stalled_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.len() < 4096 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_times_out_and_closes() {
        let (a, _stalled_peer) = tokio::io::duplex(16);
        let sig = SignalConn::new(a, "127.0.0.1:1");

        let err = sig.send(&[7u8; 4096]).await.unwrap_err();
        assert!(matches!(err, ConnError::Timeout));
        assert!(sig.is_closed());
    }
}
