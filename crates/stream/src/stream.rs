// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Capabilities shared by the TCP, TLS and QUIC transports, and the 2-octet length framing
//! they all use.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::Context;
use crate::error::NetError;
use crate::query::DnsQuery;

/// A byte-oriented duplex channel carrying exactly one exchange
#[async_trait]
pub trait DnsStream: Send {
    /// Bounds every subsequent read and write, `None` removes the bound
    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()>;

    /// Reads some bytes, returning 0 at end of stream
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the whole buffer, returning its length
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Signals that no more data will be written.
    ///
    /// For TCP and TLS the stream is the connection, so this is a no-op. For QUIC it sends the
    /// STREAM FIN which RFC 9250 requires before the server answers. Closing twice is a no-op.
    async fn close(&mut self) -> io::Result<()>;
}

/// An established connection able to open streams for one protocol
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// Opens the stream used for a single exchange
    async fn open_stream(&self) -> Result<Box<dyn DnsStream>, NetError>;

    /// Applies the protocol's requirements to a clone of the caller's query
    fn mutate_query(&self, query: &mut DnsQuery);

    /// Closes the connection, not a stream. Only the first call has an effect.
    async fn close(&self) -> Result<(), NetError>;
}

/// Dials an endpoint and produces a [`StreamOpener`]
#[async_trait]
pub trait StreamOpenerDialer: Send + Sync {
    /// Connects to `endpoint`, aborting when `ctx` is done
    async fn dial(
        &self,
        ctx: &Context,
        endpoint: SocketAddr,
    ) -> Result<Arc<dyn StreamOpener>, NetError>;
}

/// Frames a packed message with its 2-octet, big-endian length
///
/// # Panics
///
/// The message must not exceed 65535 bytes. Packed DNS messages never do, so a longer
/// message is a bug in the caller.
pub fn new_stream_msg_frame(raw_msg: &[u8]) -> BytesMut {
    assert!(
        raw_msg.len() <= usize::from(u16::MAX),
        "DNS message of {} bytes does not fit a stream frame",
        raw_msg.len()
    );

    let mut frame = BytesMut::with_capacity(2 + raw_msg.len());
    frame.put_u16(raw_msg.len() as u16);
    frame.put_slice(raw_msg);
    frame
}

/// Reads until `buf` is full, retrying short reads
///
/// End of stream before `buf` is full is an `UnexpectedEof` error.
pub(crate) async fn read_full(stream: &mut dyn DnsStream, buf: &mut [u8]) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match stream.read(&mut buf[pos..]).await? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed after {pos} of {} bytes", buf.len()),
                ))
            }
            read => pos += read,
        }
    }

    Ok(())
}

/// Bounds an I/O future by an optional deadline
pub(crate) async fn with_deadline<T>(
    deadline: Option<Instant>,
    future: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    let Some(deadline) = deadline else {
        return future.await;
    };

    match tokio::time::timeout_at(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "stream deadline exceeded",
        )),
    }
}

/// A connection shared between its opener and the stream, for TCP and TLS.
///
/// The opener owns the connection, closing it drops the socket; a stream that outlives the
/// close fails with `NotConnected`. Closing aborts reads and writes in flight.
pub(crate) struct SharedConn<S> {
    conn: Arc<Mutex<Option<S>>>,
    closed: CancellationToken,
}

impl<S> SharedConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(conn: S) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            closed: CancellationToken::new(),
        }
    }

    /// Returns a stream over the connection, every stream shares the same channel
    pub(crate) fn stream(&self) -> ConnStream<S> {
        ConnStream {
            conn: self.conn.clone(),
            closed: self.closed.clone(),
            deadline: None,
        }
    }

    pub(crate) async fn close(&self) -> Result<(), NetError> {
        // releases the lock held by pending I/O
        self.closed.cancel();

        let Some(mut conn) = self.conn.lock().await.take() else {
            return Ok(());
        };

        debug!("closing stream connection");
        conn.shutdown().await?;
        Ok(())
    }
}

/// A [`DnsStream`] which is the connection itself
pub(crate) struct ConnStream<S> {
    conn: Arc<Mutex<Option<S>>>,
    closed: CancellationToken,
    deadline: Option<Instant>,
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection already closed")
}

/// Runs `io` until it completes or the connection is closed
async fn until_closed<T>(
    closed: &CancellationToken,
    io: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(not_connected()),
        result = io => result,
    }
}

#[async_trait]
impl<S> DnsStream for ConnStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadline = deadline;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let conn = &self.conn;
        let deadline = self.deadline;
        until_closed(&self.closed, async move {
            let mut conn = conn.lock().await;
            let conn = conn.as_mut().ok_or_else(not_connected)?;
            with_deadline(deadline, conn.read(buf)).await
        })
        .await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let conn = &self.conn;
        let deadline = self.deadline;
        until_closed(&self.closed, async move {
            let mut conn = conn.lock().await;
            let conn = conn.as_mut().ok_or_else(not_connected)?;
            with_deadline(deadline, async {
                conn.write_all(buf).await?;
                conn.flush().await?;
                Ok::<_, io::Error>(buf.len())
            })
            .await
        })
        .await
    }

    async fn close(&mut self) -> io::Result<()> {
        // the stream is the connection, which stays open until the opener is closed
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_frame_length_prefix() {
        let frame = new_stream_msg_frame(b"DEADBEEF");
        let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(len, frame.len() - 2);
        assert_eq!(&frame[2..], b"DEADBEEF");
    }

    #[test]
    fn test_frame_max_length() {
        let msg = vec![0u8; usize::from(u16::MAX)];
        let frame = new_stream_msg_frame(&msg);
        assert_eq!(&frame[..2], &[0xff, 0xff]);
    }

    #[test]
    #[should_panic]
    fn test_frame_too_long() {
        new_stream_msg_frame(&vec![0u8; usize::from(u16::MAX) + 1]);
    }

    #[tokio::test]
    async fn test_conn_stream_round_trip() {
        let (client, mut server) = tokio::io::duplex(64);
        let shared = SharedConn::new(client);

        let mut stream = shared.stream();
        assert_eq!(stream.write(b"hello").await.unwrap(), 5);

        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // closing the stream leaves the connection usable
        stream.close().await.unwrap();
        server.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        read_full(&mut stream, &mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_opener_close_closes_connection() {
        let (client, mut server) = tokio::io::duplex(64);
        let shared = SharedConn::new(client);
        let mut stream = shared.stream();

        shared.close().await.unwrap();
        shared.close().await.unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);

        let err = stream.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_reads() {
        let (client, _server) = tokio::io::duplex(64);
        let shared = SharedConn::new(client);
        let mut stream = shared.stream();

        stream
            .set_deadline(Some(Instant::now() + Duration::from_millis(10)))
            .unwrap();
        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_close_aborts_pending_read() {
        let (client, _server) = tokio::io::duplex(64);
        let shared = Arc::new(SharedConn::new(client));

        let reader = tokio::spawn({
            let mut stream = shared.stream();
            async move {
                let mut buf = [0u8; 1];
                stream.read(&mut buf).await
            }
        });
        // let the read take the connection lock
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), shared.close())
            .await
            .expect("close must not wait for the pending read")
            .unwrap();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_read_full_unexpected_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let shared = SharedConn::new(client);
        let mut stream = shared.stream();

        server.write_all(&[0x00]).await.unwrap();
        drop(server);

        let mut buf = [0u8; 2];
        let err = read_full(&mut stream, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
