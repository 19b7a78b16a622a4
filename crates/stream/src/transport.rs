// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single query and response over a stream transport

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::NetError;
use crate::query::DnsQuery;
use crate::quic::{QuicDialer, QuicStreamOpenerDialer};
use crate::response::DnsResponse;
use crate::stream::{
    new_stream_msg_frame, read_full, DnsStream, StreamOpener, StreamOpenerDialer,
};
use crate::tcp::{TcpStreamOpenerDialer, TokioTcpConnect};
use crate::tls::TlsStreamOpenerDialer;

/// Receives a private copy of raw DNS message bytes, without the length prefix
pub type RawMessageObserver = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Exchanges DNS messages with a single endpoint over TCP, TLS or QUIC.
///
/// Each call to [`Transport::exchange`] dials a new connection, sends one query on one stream,
/// reads one response and closes the connection. There are no retries and no fallback to
/// another protocol. A `Transport` holds no mutable state, concurrent exchanges are independent.
#[derive(Clone)]
pub struct Transport {
    dialer: Arc<dyn StreamOpenerDialer>,
    endpoint: SocketAddr,
    observe_raw_query: Option<RawMessageObserver>,
    observe_raw_response: Option<RawMessageObserver>,
}

impl Transport {
    /// Creates a transport which dials `endpoint` with `dialer`
    pub fn new(dialer: Arc<dyn StreamOpenerDialer>, endpoint: SocketAddr) -> Self {
        Self {
            dialer,
            endpoint,
            observe_raw_query: None,
            observe_raw_response: None,
        }
    }

    /// DNS over TCP to `endpoint`
    pub fn tcp(endpoint: SocketAddr) -> Self {
        Self::new(
            Arc::new(TcpStreamOpenerDialer::new(TokioTcpConnect::new())),
            endpoint,
        )
    }

    /// DNS over TLS to `endpoint`, authenticating the server as `server_name`
    pub fn tls(server_name: &str, endpoint: SocketAddr) -> Result<Self, NetError> {
        let dialer = TlsStreamOpenerDialer::with_server_name(server_name)?;
        Ok(Self::new(Arc::new(dialer), endpoint))
    }

    /// DNS over QUIC to `endpoint`, from the socket of `dialer`
    pub fn quic(dialer: QuicDialer, endpoint: SocketAddr) -> Self {
        Self::new(Arc::new(QuicStreamOpenerDialer::new(dialer)), endpoint)
    }

    /// Calls `observer` with every query, after it was written to the stream
    pub fn with_raw_query_observer(
        mut self,
        observer: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> Self {
        self.observe_raw_query = Some(Arc::new(observer));
        self
    }

    /// Calls `observer` with every response, before it is parsed
    pub fn with_raw_response_observer(
        mut self,
        observer: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> Self {
        self.observe_raw_response = Some(Arc::new(observer));
        self
    }

    /// The endpoint this transport dials
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Sends `query` over a new connection and returns the validated response.
    ///
    /// The query is cloned before the protocol's policy is applied, `query` itself is never
    /// modified. The connection is closed before this returns, whatever the outcome. When `ctx`
    /// is canceled or its deadline expires, the pending operation is aborted and the context's
    /// error is returned.
    pub async fn exchange(
        &self,
        ctx: &Context,
        query: &DnsQuery,
    ) -> Result<DnsResponse, NetError> {
        let opener = self.dialer.dial(ctx, self.endpoint).await?;

        let guard = CloseGuard::spawn(ctx, opener.clone());
        let result = guard
            .ctx
            .run(self.exchange_stream(&guard.ctx, &*opener, query))
            .await;
        guard.finish().await;

        result
    }

    /// Sends `query` on a new stream of an already established connection.
    ///
    /// The connection belongs to the caller and stays open, which allows reusing it for
    /// further exchanges. The stream is closed before this returns.
    pub async fn exchange_with_stream_opener(
        &self,
        ctx: &Context,
        opener: &dyn StreamOpener,
        query: &DnsQuery,
    ) -> Result<DnsResponse, NetError> {
        ctx.run(self.exchange_stream(ctx, opener, query)).await
    }

    async fn exchange_stream(
        &self,
        ctx: &Context,
        opener: &dyn StreamOpener,
        query: &DnsQuery,
    ) -> Result<DnsResponse, NetError> {
        let mut stream = opener.open_stream().await?;

        let deadline = ctx.deadline();
        if deadline.is_some() {
            stream.set_deadline(deadline)?;
        }

        let result = self.round_trip(opener, &mut *stream, query).await;

        if let Err(e) = stream.close().await {
            debug!("failed to close stream: {e}");
        }
        if deadline.is_some() {
            if let Err(e) = stream.set_deadline(None) {
                debug!("failed to clear stream deadline: {e}");
            }
        }

        result
    }

    async fn round_trip(
        &self,
        opener: &dyn StreamOpener,
        stream: &mut dyn DnsStream,
        query: &DnsQuery,
    ) -> Result<DnsResponse, NetError> {
        let mut query = query.clone();
        opener.mutate_query(&mut query);
        let message = query.to_message()?;
        let raw_query = message.to_vec()?;

        let frame = new_stream_msg_frame(&raw_query);
        let written = stream.write(&frame).await?;
        if written != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {written} of {} bytes", frame.len()),
            )
            .into());
        }
        debug!(
            "sent query for {} {} with id {}, {} bytes",
            query.name,
            query.record_type,
            query.id,
            raw_query.len()
        );

        if let Some(observe) = &self.observe_raw_query {
            observe(raw_query.clone());
        }

        // some QUIC servers only answer once the STREAM FIN is received, RFC 9250 Section 4.2
        if let Err(e) = stream.close().await {
            debug!("failed to half-close stream: {e}");
        }

        let mut header = [0u8; 2];
        read_full(stream, &mut header).await?;
        let length = usize::from(u16::from_be_bytes(header));

        // the size advertised by the query is not enforced
        let mut raw_response = vec![0u8; length];
        read_full(stream, &mut raw_response).await?;
        debug!("received response with {length} bytes");

        if let Some(observe) = &self.observe_raw_response {
            observe(raw_response.clone());
        }

        Ok(DnsResponse::from_vec(&message, &raw_response)?)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Closes the connection once the exchange is done, or as soon as the caller's context is.
///
/// Dropping the guard, e.g. when the exchange future is dropped, also triggers the close.
struct CloseGuard {
    ctx: Context,
    watcher: Option<JoinHandle<()>>,
}

impl CloseGuard {
    fn spawn(parent: &Context, opener: Arc<dyn StreamOpener>) -> Self {
        let ctx = parent.with_cancel();
        let done = ctx.clone();

        let watcher = tokio::spawn(async move {
            let reason = done.done().await;
            debug!("closing connection: {reason}");
            if let Err(e) = opener.close().await {
                warn!("failed to close connection: {e}");
            }
        });

        Self {
            ctx,
            watcher: Some(watcher),
        }
    }

    async fn finish(mut self) {
        self.ctx.cancel();
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                warn!("connection closer failed: {e}");
            }
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}
