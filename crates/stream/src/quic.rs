// Copyright 2015-2022 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS over QUIC, RFC 9250

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{
    Connection, Endpoint, EndpointConfig, RecvStream, SendStream, TransportConfig, VarInt,
};
use rustls::version::TLS13;
use rustls::RootCertStore;
use tokio::time::Instant;
use tracing::debug;

use crate::context::Context;
use crate::error::NetError;
use crate::query::{DnsQuery, Protocol};
use crate::stream::{with_deadline, DnsStream, StreamOpener, StreamOpenerDialer};
use crate::tls::default_provider;

/// ALPN protocol identifier for DNS over QUIC, RFC 9250 Section 4.1.1
pub const DOQ_ALPN: &[u8] = b"doq";

/// DoQ error codes, RFC 9250 Section 4.3
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoqErrorCode {
    /// No error. This is used when the connection or stream needs to be closed, but there is no error to signal.
    NoError,
    /// The DoQ implementation encountered an internal error and is incapable of pursuing the transaction or the connection.
    InternalError,
    /// The DoQ implementation encountered a protocol error and is forcibly aborting the connection.
    ProtocolError,
    /// A DoQ client uses this to signal that it wants to cancel an outstanding transaction.
    RequestCancelled,
    /// A DoQ implementation uses this to signal when closing a connection due to excessive load.
    ExcessiveLoad,
    /// Alternative error code used for tests.
    ErrorReserved,
    /// Unknown Error code
    Unknown(u32),
}

// not using repr(u32) above because of the Unknown
const NO_ERROR: u32 = 0x0;
const INTERNAL_ERROR: u32 = 0x1;
const PROTOCOL_ERROR: u32 = 0x2;
const REQUEST_CANCELLED: u32 = 0x3;
const EXCESSIVE_LOAD: u32 = 0x4;
const ERROR_RESERVED: u32 = 0xd098ea5e;

impl From<DoqErrorCode> for VarInt {
    fn from(code: DoqErrorCode) -> Self {
        Self::from_u32(match code {
            DoqErrorCode::NoError => NO_ERROR,
            DoqErrorCode::InternalError => INTERNAL_ERROR,
            DoqErrorCode::ProtocolError => PROTOCOL_ERROR,
            DoqErrorCode::RequestCancelled => REQUEST_CANCELLED,
            DoqErrorCode::ExcessiveLoad => EXCESSIVE_LOAD,
            DoqErrorCode::ErrorReserved => ERROR_RESERVED,
            DoqErrorCode::Unknown(code) => code,
        })
    }
}

impl From<VarInt> for DoqErrorCode {
    fn from(code: VarInt) -> Self {
        let Ok(code) = u32::try_from(code.into_inner()) else {
            return Self::ProtocolError;
        };

        match code {
            NO_ERROR => Self::NoError,
            INTERNAL_ERROR => Self::InternalError,
            PROTOCOL_ERROR => Self::ProtocolError,
            REQUEST_CANCELLED => Self::RequestCancelled,
            EXCESSIVE_LOAD => Self::ExcessiveLoad,
            ERROR_RESERVED => Self::ErrorReserved,
            _ => Self::Unknown(code),
        }
    }
}

/// Make a new TLS 1.3 [`rustls::ClientConfig`] with the default roots and the DoQ ALPN
pub fn quic_client_config() -> Result<rustls::ClientConfig, NetError> {
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_protocol_versions(&[&TLS13])?;

    let builder = builder.with_root_certificates({
        #[cfg_attr(not(feature = "webpki-roots"), allow(unused_mut))]
        let mut root_store = RootCertStore::empty();
        #[cfg(feature = "webpki-roots")]
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        root_store
    });

    let mut config = builder.with_no_client_auth();
    config.alpn_protocols = vec![DOQ_ALPN.to_vec()];
    Ok(config)
}

fn endpoint_config() -> Result<EndpointConfig, NetError> {
    let mut endpoint_config = EndpointConfig::default();

    // all DNS messages have a maximum size of u16 due to the length prefix
    endpoint_config.max_udp_payload_size(0x45ac)?;

    Ok(endpoint_config)
}

fn transport_config() -> TransportConfig {
    let mut transport_config = TransportConfig::default();

    // the server never opens streams toward the client, and DoQ does not use datagrams
    transport_config.max_concurrent_bidi_streams(VarInt::from_u32(0));
    transport_config.max_concurrent_uni_streams(VarInt::from_u32(0));
    transport_config.datagram_receive_buffer_size(None);
    transport_config.datagram_send_buffer_size(0);

    transport_config
}

/// Establishes QUIC connections from a single local UDP socket
#[derive(Clone, Debug)]
pub struct QuicDialer {
    endpoint: Endpoint,
    server_name: String,
}

impl QuicDialer {
    /// Creates a dialer on `socket` which authenticates servers as `server_name` against the
    /// default roots.
    ///
    /// The socket must already be bound. Must be called from within a tokio runtime.
    pub fn new(socket: UdpSocket, server_name: impl Into<String>) -> Result<Self, NetError> {
        Self::with_crypto_config(socket, server_name, quic_client_config()?)
    }

    /// Creates a dialer with a custom TLS configuration, the ALPN is always set to `doq`
    pub fn with_crypto_config(
        socket: UdpSocket,
        server_name: impl Into<String>,
        mut crypto_config: rustls::ClientConfig,
    ) -> Result<Self, NetError> {
        crypto_config.alpn_protocols = vec![DOQ_ALPN.to_vec()];

        let mut client_config =
            quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(crypto_config)?));
        client_config.transport_config(Arc::new(transport_config()));

        socket.set_nonblocking(true)?;
        let mut endpoint = Endpoint::new(
            endpoint_config()?,
            None,
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            server_name: server_name.into(),
        })
    }

    /// Connects to `addr` and completes the handshake
    pub async fn dial(&self, addr: SocketAddr) -> Result<Connection, NetError> {
        let connecting = self.endpoint.connect(addr, &self.server_name)?;
        let connection = connecting.await?;

        debug!("QUIC connection established to: {addr}");
        Ok(connection)
    }

    /// The address of the local UDP socket
    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        Ok(self.endpoint.local_addr()?)
    }
}

/// [`StreamOpener`] over a QUIC connection, each exchange uses its own bidirectional stream
pub struct QuicStreamOpener {
    connection: Connection,
    closed: Once,
}

impl QuicStreamOpener {
    /// Wraps an established connection
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            closed: Once::new(),
        }
    }
}

#[async_trait]
impl StreamOpener for QuicStreamOpener {
    async fn open_stream(&self) -> Result<Box<dyn DnsStream>, NetError> {
        let (send, recv) = self.connection.open_bi().await?;
        Ok(Box::new(QuicStream::new(send, recv)))
    }

    fn mutate_query(&self, query: &mut DnsQuery) {
        Protocol::Quic.mutate_query(query);
    }

    async fn close(&self) -> Result<(), NetError> {
        self.closed.call_once(|| {
            debug!(
                "closing QUIC connection to: {}",
                self.connection.remote_address()
            );
            self.connection.close(DoqErrorCode::NoError.into(), b"");
        });

        Ok(())
    }
}

/// A single bidirectional QUIC stream
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    deadline: Option<Instant>,
    finished: bool,
}

impl QuicStream {
    /// Wraps the two halves of a bidirectional stream
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self {
            send,
            recv,
            deadline: None,
            finished: false,
        }
    }
}

#[async_trait]
impl DnsStream for QuicStream {
    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadline = deadline;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let recv = &mut self.recv;
        with_deadline(self.deadline, async move {
            let read = recv.read(buf).await.map_err(io::Error::from)?;
            Ok::<_, io::Error>(read.unwrap_or(0))
        })
        .await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let send = &mut self.send;
        with_deadline(self.deadline, async move {
            send.write_all(buf).await.map_err(io::Error::from)?;
            Ok::<_, io::Error>(buf.len())
        })
        .await
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }

        self.finished = true;
        self.send
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e))
    }
}

/// [`StreamOpenerDialer`] for DNS over QUIC
#[derive(Clone, Debug)]
pub struct QuicStreamOpenerDialer {
    dialer: QuicDialer,
}

impl QuicStreamOpenerDialer {
    /// Dials with `dialer`
    pub fn new(dialer: QuicDialer) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl StreamOpenerDialer for QuicStreamOpenerDialer {
    async fn dial(
        &self,
        ctx: &Context,
        endpoint: SocketAddr,
    ) -> Result<Arc<dyn StreamOpener>, NetError> {
        ctx.run(async {
            let connection = self.dialer.dial(endpoint).await?;
            Ok::<_, NetError>(Arc::new(QuicStreamOpener::new(connection)) as Arc<dyn StreamOpener>)
        })
        .await
    }
}
