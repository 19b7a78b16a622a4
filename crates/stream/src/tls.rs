// Copyright 2015-2021 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS over TLS, RFC 7858

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::context::Context;
use crate::error::NetError;
use crate::query::{DnsQuery, Protocol};
use crate::stream::{DnsStream, SharedConn, StreamOpener, StreamOpenerDialer};
use crate::tcp::{Connect, TokioTcpConnect};

/// ALPN protocol identifier for DNS over TLS, RFC 7858
pub const DOT_ALPN: &[u8] = b"dot";

/// Make a new [`ClientConfig`] with the default settings and the DoT ALPN
pub fn tls_client_config() -> Result<ClientConfig, NetError> {
    let builder = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?;

    let builder = builder.with_root_certificates({
        #[cfg_attr(not(feature = "webpki-roots"), allow(unused_mut))]
        let mut root_store = RootCertStore::empty();
        #[cfg(feature = "webpki-roots")]
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        root_store
    });

    let mut config = builder.with_no_client_auth();
    config.alpn_protocols = vec![DOT_ALPN.to_vec()];
    Ok(config)
}

/// Instantiate a new [`CryptoProvider`] for use with rustls
pub fn default_provider() -> CryptoProvider {
    crypto::ring::default_provider()
}

/// Parses the name the server certificate is verified against, a DNS name or an IP address
pub fn parse_server_name(server_name: &str) -> Result<ServerName<'static>, NetError> {
    ServerName::try_from(server_name.to_owned())
        .map_err(|e| NetError::Msg(format!("invalid TLS server name {server_name}: {e}")))
}

/// TCP connection followed by a rustls handshake
#[derive(Clone)]
pub struct RustlsConnect<C = TokioTcpConnect> {
    tcp: C,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl<C: Connect> RustlsConnect<C> {
    /// Connects over `tcp`, then authenticates the server as `server_name` using `config`
    pub fn new(tcp: C, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            tcp,
            connector: TlsConnector::from(config),
            server_name,
        }
    }
}

#[async_trait]
impl<C: Connect> Connect for RustlsConnect<C> {
    type Transport = tokio_rustls::client::TlsStream<C::Transport>;

    async fn connect(&self, addr: SocketAddr) -> io::Result<Self::Transport> {
        let tcp = self.tcp.connect(addr).await?;
        let tls = self.connector.connect(self.server_name.clone(), tcp).await?;

        debug!(
            "TLS handshake completed with: {addr}, alpn: {:?}",
            tls.get_ref().1.alpn_protocol().map(String::from_utf8_lossy)
        );
        Ok(tls)
    }
}

/// [`StreamOpener`] over an established TLS session.
///
/// As for TCP, the session carries a single stream and closing the opener sends close_notify
/// before shutting the connection down.
pub struct TlsStreamOpener<S> {
    conn: SharedConn<S>,
}

impl<S> TlsStreamOpener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already established TLS session
    pub fn new(conn: S) -> Self {
        Self {
            conn: SharedConn::new(conn),
        }
    }
}

#[async_trait]
impl<S> StreamOpener for TlsStreamOpener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn open_stream(&self) -> Result<Box<dyn DnsStream>, NetError> {
        Ok(Box::new(self.conn.stream()))
    }

    fn mutate_query(&self, query: &mut DnsQuery) {
        Protocol::Tls.mutate_query(query);
    }

    async fn close(&self) -> Result<(), NetError> {
        self.conn.close().await
    }
}

/// [`StreamOpenerDialer`] for DNS over TLS
#[derive(Clone)]
pub struct TlsStreamOpenerDialer<C = TokioTcpConnect> {
    connect: RustlsConnect<C>,
}

impl TlsStreamOpenerDialer {
    /// Dials plain TCP and authenticates `server_name` against the default roots
    pub fn with_server_name(server_name: &str) -> Result<Self, NetError> {
        Ok(Self::new(RustlsConnect::new(
            TokioTcpConnect::new(),
            Arc::new(tls_client_config()?),
            parse_server_name(server_name)?,
        )))
    }
}

impl<C: Connect> TlsStreamOpenerDialer<C> {
    /// Dials with `connect`
    pub fn new(connect: RustlsConnect<C>) -> Self {
        Self { connect }
    }
}

#[async_trait]
impl<C: Connect> StreamOpenerDialer for TlsStreamOpenerDialer<C> {
    async fn dial(
        &self,
        ctx: &Context,
        endpoint: SocketAddr,
    ) -> Result<Arc<dyn StreamOpener>, NetError> {
        ctx.run(async {
            let conn = self.connect.connect(endpoint).await?;
            Ok::<_, NetError>(Arc::new(TlsStreamOpener::new(conn)) as Arc<dyn StreamOpener>)
        })
        .await
    }
}
