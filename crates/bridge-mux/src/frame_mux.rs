//! Frame multiplexer over any async byte stream
//!
//! One writer task owns the write half and drains an outbound frame queue;
//! one reader task routes inbound frames to per-stream channels. Each virtual
//! stream is a duplex pipe with a pump task between the pipe and the frames.
//!
//! Every queue is bounded. A stream whose reader falls behind stalls the
//! mux reader, which stops reading from the peer. Streams opened by the peer
//! are only accepted on the agent side, and only while the accept backlog
//! has room; otherwise they are closed straight away.

use crate::frame::{Frame, FrameCodec, FrameType, MuxError, StreamId};
use crate::stream::MuxStream;
use crate::{BoxedIo, Multiplexer, MuxFactory, MuxIo, MuxKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Pipe buffer between a stream handle and its pump
const STREAM_BUFFER: usize = 64 * 1024;

/// Read chunk size when turning stream bytes into data frames
const CHUNK_SIZE: usize = 16 * 1024;

/// Inbound data chunks buffered per stream
const STREAM_QUEUE: usize = 16;

/// Outbound frames waiting for the writer task
const FRAME_QUEUE: usize = 64;

/// Peer-opened streams waiting for `accept_stream`
const ACCEPT_BACKLOG: usize = 64;

struct Shared {
    kind: MuxKind,
    streams: RwLock<HashMap<StreamId, mpsc::Sender<Bytes>>>,
    frame_tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(kind = %self.kind, "Multiplexer closed");
        }
        self.shutdown.cancel();
    }

    /// Queue a frame for the writer; false once the mux is shutting down
    async fn send_frame(&self, frame: Frame) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = self.frame_tx.send(frame) => sent.is_ok(),
        }
    }

    async fn register(self: &Arc<Self>, id: StreamId) -> MuxStream {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.streams.write().await.insert(id, tx);

        let (local, remote) = tokio::io::duplex(STREAM_BUFFER);
        tokio::spawn(pump(self.clone(), id, remote, rx));

        MuxStream::new(id, local)
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame, accept_tx: Option<&mpsc::Sender<MuxStream>>) {
        trace!(
            kind = %self.kind,
            stream_id = frame.stream_id,
            frame_type = ?frame.frame_type,
            size = frame.payload.len(),
            "Processing frame"
        );

        match frame.frame_type {
            FrameType::Open => {
                let permit = accept_tx.and_then(|tx| tx.try_reserve().ok());
                let duplicate = self.streams.read().await.contains_key(&frame.stream_id);
                match permit {
                    Some(permit) if !duplicate => {
                        permit.send(self.register(frame.stream_id).await);
                    }
                    _ => {
                        debug!(
                            kind = %self.kind,
                            stream_id = frame.stream_id,
                            "Refusing inbound stream"
                        );
                        self.send_frame(Frame::close(frame.stream_id)).await;
                    }
                }
            }
            FrameType::Data => {
                let tx = self.streams.read().await.get(&frame.stream_id).cloned();
                match tx {
                    Some(tx) => {
                        // Waits while the stream's reader is behind
                        tokio::select! {
                            _ = self.shutdown.cancelled() => {}
                            _ = tx.send(frame.payload) => {}
                        }
                    }
                    None => trace!(stream_id = frame.stream_id, "Data for unknown stream"),
                }
            }
            FrameType::Close => {
                self.streams.write().await.remove(&frame.stream_id);
                debug!(stream_id = frame.stream_id, "Stream closed by remote");
            }
            FrameType::Ping => {}
        }
    }
}

/// Frame multiplexer
///
/// Must be created inside a Tokio runtime; it spawns its I/O tasks
/// immediately.
pub struct FrameMux {
    shared: Arc<Shared>,
    next_id: AtomicU32,
    accept_rx: Mutex<mpsc::Receiver<MuxStream>>,
}

impl FrameMux {
    /// Bridge side: allocates even stream ids and refuses streams opened by
    /// the agent
    pub fn server<T: MuxIo>(io: T, kind: MuxKind, idle_timeout: Duration) -> Self {
        Self::start(io, kind, idle_timeout, 2, false)
    }

    /// Agent side: allocates odd stream ids and accepts streams opened by the
    /// bridge
    pub fn client<T: MuxIo>(io: T, kind: MuxKind, idle_timeout: Duration) -> Self {
        Self::start(io, kind, idle_timeout, 1, true)
    }

    fn start<T: MuxIo>(
        io: T,
        kind: MuxKind,
        idle_timeout: Duration,
        first_id: StreamId,
        accepts_inbound: bool,
    ) -> Self {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_tx = accepts_inbound.then_some(accept_tx);

        let shared = Arc::new(Shared {
            kind,
            streams: RwLock::new(HashMap::new()),
            frame_tx,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(write_loop(
            shared.clone(),
            FramedWrite::new(writer, FrameCodec),
            frame_rx,
            idle_timeout,
        ));
        tokio::spawn(read_loop(
            shared.clone(),
            FramedRead::new(reader, FrameCodec),
            accept_tx,
            idle_timeout,
        ));

        debug!(kind = %kind, idle_timeout_secs = idle_timeout.as_secs(), "Multiplexer started");

        Self {
            shared,
            next_id: AtomicU32::new(first_id),
            accept_rx: Mutex::new(accept_rx),
        }
    }

    pub fn kind(&self) -> MuxKind {
        self.shared.kind
    }

    /// Wait for the peer to open a stream; `None` once the mux is closed.
    /// Never yields anything on a server-side mux.
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream,
            _ = self.shared.shutdown.cancelled() => None,
        }
    }

    pub async fn active_streams(&self) -> usize {
        self.shared.streams.read().await.len()
    }
}

#[async_trait]
impl Multiplexer for FrameMux {
    async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }

        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.register(id).await;
        if !self.shared.send_frame(Frame::open(id)).await {
            self.shared.streams.write().await.remove(&id);
            return Err(MuxError::Closed);
        }

        debug!(kind = %self.shared.kind, stream_id = id, "Opened stream");
        Ok(stream)
    }

    async fn close(&self) {
        self.shared.mark_closed();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for FrameMux {
    fn drop(&mut self) {
        self.shared.mark_closed();
    }
}

/// Builds [`FrameMux`] instances for the bridge
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameMuxFactory;

impl MuxFactory for FrameMuxFactory {
    fn new_mux(&self, io: BoxedIo, kind: MuxKind, idle_timeout: Duration) -> Arc<dyn Multiplexer> {
        Arc::new(FrameMux::server(io, kind, idle_timeout))
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    shared: Arc<Shared>,
    mut sink: FramedWrite<W, FrameCodec>,
    mut frame_rx: mpsc::Receiver<Frame>,
    idle_timeout: Duration,
) {
    // Keep the peer's idle timer from firing while nothing else is sent
    let ping_enabled = !idle_timeout.is_zero();
    let period = (idle_timeout / 3).max(Duration::from_millis(1));
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick(), if ping_enabled => Frame::ping(),
        };

        let written = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            written = sink.send(frame) => written,
        };
        if let Err(e) = written {
            debug!(kind = %shared.kind, "Multiplexer write failed: {}", e);
            break;
        }
    }

    shared.mark_closed();
    let _ = tokio::time::timeout(Duration::from_secs(1), sink.close()).await;
}

async fn read_frame<R: AsyncRead + Unpin>(
    source: &mut FramedRead<R, FrameCodec>,
    idle_timeout: Duration,
) -> Result<Option<Frame>, MuxError> {
    if idle_timeout.is_zero() {
        return source.next().await.transpose();
    }

    match tokio::time::timeout(idle_timeout, source.next()).await {
        Ok(next) => next.transpose(),
        Err(_) => Err(MuxError::IdleTimeout),
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    shared: Arc<Shared>,
    mut source: FramedRead<R, FrameCodec>,
    accept_tx: Option<mpsc::Sender<MuxStream>>,
    idle_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = read_frame(&mut source, idle_timeout) => next,
        };

        match next {
            Ok(Some(frame)) => shared.dispatch(frame, accept_tx.as_ref()).await,
            Ok(None) => {
                debug!(kind = %shared.kind, "Multiplexer peer closed");
                break;
            }
            Err(e) => {
                debug!(kind = %shared.kind, "Multiplexer read ended: {}", e);
                break;
            }
        }
    }

    shared.mark_closed();
    // Dropping the senders ends every inbound pump
    shared.streams.write().await.clear();
}

async fn pump(
    shared: Arc<Shared>,
    id: StreamId,
    remote: DuplexStream,
    mut inbound: mpsc::Receiver<Bytes>,
) {
    let (mut rd, mut wr) = tokio::io::split(remote);

    let incoming = async {
        while let Some(chunk) = inbound.recv().await {
            if wr.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    };

    let outgoing = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                read = rd.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };
            let frame = Frame::data(id, Bytes::copy_from_slice(&buf[..n]));
            if !shared.send_frame(frame).await {
                break;
            }
        }
        shared.send_frame(Frame::close(id)).await;
    };

    tokio::join!(incoming, outgoing);
    shared.streams.write().await.remove(&id);
    trace!(stream_id = id, "Stream pump finished");
}
