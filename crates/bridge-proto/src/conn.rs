//! Length-prefixed connection codec
//!
//! All multi-byte integers are little-endian unless noted. A "short content"
//! is an i32 length followed by that many bytes.

use crate::flags::{Flag, CONN_DATA_SEQ, RES_CLOSE};
use crate::{MAX_JSON_CONTENT, MAX_SHORT_CONTENT};
use bytes::{BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;

/// Connection codec errors
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read deadline exceeded")]
    Timeout,

    #[error("Invalid length: {0}")]
    InvalidLength(i64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed health report")]
    MalformedHealthReport,
}

/// One target-health report read from a signal connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub target: String,
    pub healthy: bool,
}

/// A bridge connection: a byte stream plus an optional read deadline.
///
/// Reads are unbuffered, so `into_inner` never loses bytes.
#[derive(Debug)]
pub struct BridgeConn<S> {
    inner: S,
    read_deadline: Option<Instant>,
}

impl<S> BridgeConn<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_deadline: None,
        }
    }

    /// Bound every subsequent read to finish within `timeout` from now
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_deadline = Some(Instant::now() + timeout);
    }

    /// Remove the read deadline once the connection has a role
    pub fn set_alive(&mut self) {
        self.read_deadline = None;
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> BridgeConn<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Split into a deadline-carrying reader and a raw writer
    pub fn split(self) -> (BridgeConn<ReadHalf<S>>, WriteHalf<S>) {
        let (reader, writer) = tokio::io::split(self.inner);
        (
            BridgeConn {
                inner: reader,
                read_deadline: self.read_deadline,
            },
            writer,
        )
    }
}

impl<S: AsyncRead + Unpin> BridgeConn<S> {
    async fn fill(&mut self, buf: &mut [u8]) -> Result<(), ConnError> {
        let deadline = self.read_deadline;
        let read = self.inner.read_exact(buf);
        match deadline {
            Some(deadline) => {
                tokio::time::timeout_at(deadline, read)
                    .await
                    .map_err(|_| ConnError::Timeout)??;
            }
            None => {
                read.await?;
            }
        }
        Ok(())
    }

    /// Read exactly `len` bytes
    pub async fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>, ConnError> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ConnError> {
        let mut buf = [0u8; N];
        self.fill(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_flag(&mut self) -> Result<Flag, ConnError> {
        self.read_array::<4>().await
    }

    pub async fn read_i32(&mut self) -> Result<i32, ConnError> {
        Ok(i32::from_le_bytes(self.read_array::<4>().await?))
    }

    /// Read an 8-byte big-endian Unix timestamp
    pub async fn read_timestamp(&mut self) -> Result<i64, ConnError> {
        Ok(i64::from_be_bytes(self.read_array::<8>().await?))
    }

    pub async fn read_bool(&mut self) -> Result<bool, ConnError> {
        Ok(self.read_array::<1>().await?[0] != 0)
    }

    async fn read_len_bounded(&mut self, max: usize) -> Result<usize, ConnError> {
        let len = self.read_i32().await?;
        if len < 0 || len as usize > max {
            return Err(ConnError::InvalidLength(len as i64));
        }
        Ok(len as usize)
    }

    /// Read an i32-length-prefixed payload of at most 32 KiB
    pub async fn read_len_content(&mut self) -> Result<Vec<u8>, ConnError> {
        let len = self.read_len_bounded(MAX_SHORT_CONTENT).await?;
        self.read_exact_vec(len).await
    }

    /// Read a length-prefixed JSON document
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, ConnError> {
        let len = self.read_len_bounded(MAX_JSON_CONTENT).await?;
        let buf = self.read_exact_vec(len).await?;
        Ok(serde_json::from_slice(&buf)?)
    }

    /// Read one `<target>*#*<status>*#*` health report
    pub async fn read_health_report(&mut self) -> Result<HealthReport, ConnError> {
        let buf = self.read_len_content().await?;
        let text = String::from_utf8_lossy(&buf);
        let mut parts = text.split(CONN_DATA_SEQ);
        match (parts.next(), parts.next()) {
            (Some(target), Some(status)) => Ok(HealthReport {
                target: target.to_string(),
                healthy: matches!(status, "1" | "true"),
            }),
            _ => Err(ConnError::MalformedHealthReport),
        }
    }

    /// Discard everything until the peer closes
    pub async fn drain(&mut self) -> Result<u64, ConnError> {
        let mut buf = [0u8; 1024];
        let mut total = 0u64;
        loop {
            let n = self.inner.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
        }
    }
}

impl<S: AsyncWrite + Unpin> BridgeConn<S> {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnError> {
        write_frame(&mut self.inner, data).await
    }

    pub async fn write_flag(&mut self, flag: &Flag) -> Result<(), ConnError> {
        self.write_all(flag).await
    }

    /// Write an i32 length followed by `data`
    pub async fn write_len_content(&mut self, data: &[u8]) -> Result<(), ConnError> {
        write_frame(&mut self.inner, &len_prefixed(data)?).await
    }

    pub async fn write_bool(&mut self, value: bool) -> Result<(), ConnError> {
        self.write_all(&[value as u8]).await
    }

    pub async fn write_add_ok(&mut self) -> Result<(), ConnError> {
        self.write_bool(true).await
    }

    /// Reply with a failure flag and close the write side
    pub async fn write_add_fail(&mut self) -> Result<(), ConnError> {
        let result = self.write_bool(false).await;
        let _ = self.inner.shutdown().await;
        result
    }

    pub async fn write_close(&mut self) -> Result<(), ConnError> {
        self.write_flag(RES_CLOSE).await
    }

    /// Write an optional flag, then `value` as length-prefixed JSON
    pub async fn send_info<T: Serialize>(
        &mut self,
        flag: Option<&Flag>,
        value: &T,
    ) -> Result<(), ConnError> {
        let json = serde_json::to_vec(value)?;
        let mut buf = BytesMut::with_capacity(4 + 4 + json.len());
        if let Some(flag) = flag {
            buf.put_slice(flag);
        }
        buf.put_slice(&len_prefixed(&json)?);
        write_frame(&mut self.inner, &buf).await
    }

    /// Write a health report in the format `read_health_report` expects
    pub async fn send_health_report(&mut self, target: &str, healthy: bool) -> Result<(), ConnError> {
        let status = if healthy { "1" } else { "0" };
        let body = format!("{target}{CONN_DATA_SEQ}{status}{CONN_DATA_SEQ}");
        self.write_len_content(body.as_bytes()).await
    }

    pub async fn shutdown(&mut self) -> Result<(), ConnError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Encode `data` with its i32 little-endian length prefix
pub fn len_prefixed(data: &[u8]) -> Result<Vec<u8>, ConnError> {
    let len = i32::try_from(data.len()).map_err(|_| ConnError::InvalidLength(data.len() as i64))?;
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

/// Write one complete frame and flush it
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ConnError> {
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn pair() -> (BridgeConn<tokio::io::DuplexStream>, BridgeConn<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (BridgeConn::new(a), BridgeConn::new(b))
    }

    #[tokio::test]
    async fn test_len_content_roundtrip() {
        let (mut a, mut b) = pair();
        a.write_len_content(b"0.27.0").await.unwrap();
        assert_eq!(b.read_len_content().await.unwrap(), b"0.27.0");
    }

    #[tokio::test]
    async fn test_negative_length_rejected() {
        let (mut a, mut b) = pair();
        a.write_all(&(-1i32).to_le_bytes()).await.unwrap();
        assert!(matches!(
            b.read_len_content().await,
            Err(ConnError::InvalidLength(-1))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = pair();
        let len = (MAX_SHORT_CONTENT as i32) + 1;
        a.write_all(&len.to_le_bytes()).await.unwrap();
        assert!(matches!(
            b.read_len_content().await,
            Err(ConnError::InvalidLength(_))
        ));
    }

    #[tokio::test]
    async fn test_premature_eof() {
        let (mut a, mut b) = pair();
        a.write_all(b"ma").await.unwrap();
        drop(a);
        assert!(matches!(b.read_flag().await, Err(ConnError::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let (_a, mut b) = pair();
        b.set_read_timeout(Duration::from_secs(5));
        assert!(matches!(b.read_flag().await, Err(ConnError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_alive_clears_deadline() {
        let (mut a, mut b) = pair();
        b.set_read_timeout(Duration::from_secs(5));
        b.set_alive();
        assert!(b.read_deadline().is_none());

        let reader = tokio::spawn(async move { b.read_flag().await });
        tokio::time::sleep(Duration::from_secs(30)).await;
        a.write_flag(b"main").await.unwrap();
        assert_eq!(&reader.await.unwrap().unwrap(), b"main");
    }

    #[tokio::test]
    async fn test_health_report() {
        let (mut a, mut b) = pair();
        a.send_health_report("10.0.0.2:80", false).await.unwrap();
        a.send_health_report("10.0.0.3:80", true).await.unwrap();

        let first = b.read_health_report().await.unwrap();
        assert_eq!(first.target, "10.0.0.2:80");
        assert!(!first.healthy);

        let second = b.read_health_report().await.unwrap();
        assert!(second.healthy);
    }

    #[tokio::test]
    async fn test_malformed_health_report() {
        let (mut a, mut b) = pair();
        a.write_len_content(b"no-separator").await.unwrap();
        assert!(matches!(
            b.read_health_report().await,
            Err(ConnError::MalformedHealthReport)
        ));
    }

    #[tokio::test]
    async fn test_send_info_with_flag() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            name: String,
        }

        let (mut a, mut b) = pair();
        let payload = Payload {
            name: "web".to_string(),
        };
        a.send_info(Some(b"task"), &payload).await.unwrap();

        assert_eq!(&b.read_flag().await.unwrap(), b"task");
        let decoded: Payload = b.read_json().await.unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_split_keeps_deadline() {
        let (a, _b) = pair();
        let mut conn = BridgeConn::new(a.into_inner());
        conn.set_read_timeout(Duration::from_secs(5));
        let (reader, _writer) = conn.split();
        assert!(reader.read_deadline().is_some());
    }
}
