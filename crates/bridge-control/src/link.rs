//! Opening streams toward agents for the proxy front-ends

use crate::bridge::Bridge;
use crate::ip_registry::IpRejection;
use crate::store::{Task, TaskMode};
use bridge_mux::{MuxError, MuxStream};
use bridge_proto::addr::ip_of_addr;
use bridge_proto::{BridgeConn, ConnError, Link};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Errors surfaced to the caller of [`Bridge::send_link_info`]
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("The client {0} is not connected")]
    NotConnected(i64),

    #[error(transparent)]
    IpRejected(#[from] IpRejection),

    #[error("The client {0} connection error")]
    MuxUnavailable(i64),

    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),

    #[error("The target {host} refused to connect: {source}")]
    Refused { host: String, source: ConnError },

    #[error("Local dial to {host} failed: {source}")]
    LocalDial { host: String, source: io::Error },
}

/// Byte stream returned to a proxy front-end; the caller closes it
#[derive(Debug)]
pub enum LinkStream {
    /// Dialed directly from the bridge host
    Local(TcpStream),
    /// Virtual stream through the agent's multiplexer
    Tunnel(MuxStream),
}

impl AsyncRead for LinkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LinkStream::Local(s) => Pin::new(s).poll_read(cx, buf),
            LinkStream::Tunnel(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LinkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LinkStream::Local(s) => Pin::new(s).poll_write(cx, buf),
            LinkStream::Tunnel(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LinkStream::Local(s) => Pin::new(s).poll_flush(cx),
            LinkStream::Tunnel(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LinkStream::Local(s) => Pin::new(s).poll_shutdown(cx),
            LinkStream::Tunnel(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Bridge {
    /// Open a stream toward `client_id` for `link`.
    ///
    /// File-mode tasks go over the file multiplexer and get a bare stream,
    /// with crypt and compress cleared on `link`. Everything else goes over
    /// the tunnel multiplexer, and the link descriptor is written to the new
    /// stream before it is returned.
    pub async fn send_link_info(
        &self,
        client_id: i64,
        link: &mut Link,
        task: Option<&Task>,
    ) -> Result<LinkStream, LinkError> {
        if link.local_proxy {
            let stream = TcpStream::connect(&link.host)
                .await
                .map_err(|source| LinkError::LocalDial {
                    host: link.host.clone(),
                    source,
                })?;
            debug!(host = %link.host, "Local proxy link dialed");
            return Ok(LinkStream::Local(stream));
        }

        let session = self
            .sessions
            .get(client_id)
            .ok_or(LinkError::NotConnected(client_id))?;

        if self.config.ip_verify {
            self.ip_registry.verify(ip_of_addr(&link.remote_addr))?;
        }

        let file_mode = task.map(|t| t.mode == TaskMode::File).unwrap_or(false);
        let mux = if file_mode { session.file } else { session.tunnel };
        let mux = mux.ok_or(LinkError::MuxUnavailable(client_id))?;

        let stream = mux.open_stream().await?;

        if file_mode {
            link.crypt = false;
            link.compress = false;
            return Ok(LinkStream::Tunnel(stream));
        }

        let mut conn = BridgeConn::new(stream);
        if let Err(source) = conn.send_info(None, &*link).await {
            info!(client_id, host = %link.host, "New connection error, the target refused to connect");
            return Err(LinkError::Refused {
                host: link.host.clone(),
                source,
            });
        }

        Ok(LinkStream::Tunnel(conn.into_inner()))
    }
}
