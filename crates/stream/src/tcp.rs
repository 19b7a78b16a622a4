// Copyright 2015-2016 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS over TCP, RFC 1035 Section 4.2.2 and RFC 7766

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

use crate::context::Context;
use crate::error::NetError;
use crate::query::{DnsQuery, Protocol};
use crate::stream::{DnsStream, SharedConn, StreamOpener, StreamOpenerDialer};

/// Establishes a byte stream to an endpoint, e.g. a TCP connection or a TLS session over one
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// The connected stream
    type Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Connects to `addr`
    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Transport>;
}

/// Plain TCP connections using tokio
#[derive(Clone, Debug, Default)]
pub struct TokioTcpConnect {
    bind_addr: Option<SocketAddr>,
}

impl TokioTcpConnect {
    /// Connects from an ephemeral address chosen by the system
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects from `bind_addr`
    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr: Some(bind_addr),
        }
    }
}

#[async_trait]
impl Connect for TokioTcpConnect {
    type Transport = TcpStream;

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match self.bind_addr {
            Some(bind_addr) => {
                let socket = match bind_addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.bind(bind_addr)?;
                socket.connect(addr).await?
            }
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;

        debug!("TCP connection established to: {addr}");
        Ok(stream)
    }
}

/// [`StreamOpener`] over a plain TCP connection.
///
/// The connection carries a single stream: every call to `open_stream` returns a stream over
/// the same channel.
pub struct TcpStreamOpener<S> {
    conn: SharedConn<S>,
}

impl<S> TcpStreamOpener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already connected socket, for use with
    /// [`Transport::exchange_with_stream_opener`](crate::Transport::exchange_with_stream_opener)
    pub fn new(conn: S) -> Self {
        Self {
            conn: SharedConn::new(conn),
        }
    }
}

#[async_trait]
impl<S> StreamOpener for TcpStreamOpener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn open_stream(&self) -> Result<Box<dyn DnsStream>, NetError> {
        Ok(Box::new(self.conn.stream()))
    }

    fn mutate_query(&self, query: &mut DnsQuery) {
        Protocol::Tcp.mutate_query(query);
    }

    async fn close(&self) -> Result<(), NetError> {
        self.conn.close().await
    }
}

/// [`StreamOpenerDialer`] for DNS over TCP
#[derive(Clone, Debug, Default)]
pub struct TcpStreamOpenerDialer<C = TokioTcpConnect> {
    connect: C,
}

impl<C: Connect> TcpStreamOpenerDialer<C> {
    /// Dials with `connect`
    pub fn new(connect: C) -> Self {
        Self { connect }
    }
}

#[async_trait]
impl<C: Connect> StreamOpenerDialer for TcpStreamOpenerDialer<C> {
    async fn dial(
        &self,
        ctx: &Context,
        endpoint: SocketAddr,
    ) -> Result<Arc<dyn StreamOpener>, NetError> {
        ctx.run(async {
            let conn = self.connect.connect(endpoint).await?;
            Ok::<_, NetError>(Arc::new(TcpStreamOpener::new(conn)) as Arc<dyn StreamOpener>)
        })
        .await
    }
}
