//! Stream multiplexing for agent tunnels
//!
//! The bridge only depends on the [`Multiplexer`] and [`MuxFactory`] traits;
//! [`FrameMux`] is the bundled implementation.

pub mod frame;
pub mod frame_mux;
pub mod stream;

pub use frame::{Frame, FrameCodec, FrameType, MuxError, StreamId};
pub use frame_mux::{FrameMux, FrameMuxFactory};
pub use stream::MuxStream;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream a multiplexer can run over
pub trait MuxIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> MuxIo for T {}

pub type BoxedIo = Box<dyn MuxIo>;

/// Which agent connection a multiplexer serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxKind {
    Tunnel,
    File,
}

impl fmt::Display for MuxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxKind::Tunnel => write!(f, "tunnel"),
            MuxKind::File => write!(f, "file"),
        }
    }
}

/// Many virtual streams over one physical connection
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Open a new outbound virtual stream
    async fn open_stream(&self) -> Result<MuxStream, MuxError>;

    /// Tear down the physical connection and every stream on it
    async fn close(&self);

    /// True once the physical connection is gone or idle-timed-out
    fn is_closed(&self) -> bool;
}

/// Wraps a raw connection in a multiplexer
pub trait MuxFactory: Send + Sync {
    fn new_mux(&self, io: BoxedIo, kind: MuxKind, idle_timeout: Duration) -> Arc<dyn Multiplexer>;
}
