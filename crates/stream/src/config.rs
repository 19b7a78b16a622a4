// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Declarative configuration for a [`Transport`]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::error::NetError;
use crate::query::Protocol;
use crate::quic::QuicDialer;
use crate::tcp::{TcpStreamOpenerDialer, TokioTcpConnect};
use crate::tls::{parse_server_name, tls_client_config, RustlsConnect, TlsStreamOpenerDialer};
use crate::transport::Transport;

/// Errors building a [`Transport`] from a [`TransportConfig`]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// TLS and QUIC need the name to verify the server certificate against
    #[error("server_name is required for {0}")]
    MissingServerName(Protocol),

    /// The transport could not be set up
    #[error("failed to build transport: {0}")]
    Net(#[from] NetError),

    /// An error occurred while binding the local QUIC socket
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred while decoding toml data
    #[cfg(feature = "toml")]
    #[error("toml decode error: {0}")]
    TomlDecode(#[from] toml::de::Error),
}

/// Configuration of a single transport, e.g.
///
/// ```toml
/// protocol = "quic"
/// endpoint = "94.140.14.140:853"
/// server_name = "dns-unfiltered.adguard.com"
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// The protocol to use
    pub protocol: Protocol,
    /// The address and port of the server
    pub endpoint: SocketAddr,
    /// Name the server certificate is verified against, required for TLS and QUIC
    #[serde(default)]
    pub server_name: Option<String>,
    /// Local address to connect from
    #[serde(default)]
    pub bind_addr: Option<SocketAddr>,
}

impl TransportConfig {
    /// Reads the configuration from a toml document
    #[cfg(feature = "toml")]
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml)?)
    }

    /// Creates the transport described by this configuration.
    ///
    /// For QUIC a UDP socket is bound on `bind_addr`, or on the unspecified address of the
    /// endpoint's family, so this must be called from within a tokio runtime.
    pub fn build(&self) -> Result<Transport, ConfigError> {
        let connect = match self.bind_addr {
            Some(bind_addr) => TokioTcpConnect::with_bind_addr(bind_addr),
            None => TokioTcpConnect::new(),
        };

        Ok(match self.protocol {
            Protocol::Tcp => Transport::new(
                Arc::new(TcpStreamOpenerDialer::new(connect)),
                self.endpoint,
            ),
            Protocol::Tls => {
                let connect = RustlsConnect::new(
                    connect,
                    Arc::new(tls_client_config()?),
                    parse_server_name(self.server_name()?)?,
                );
                Transport::new(
                    Arc::new(TlsStreamOpenerDialer::new(connect)),
                    self.endpoint,
                )
            }
            Protocol::Quic => {
                let bind_addr = self.bind_addr.unwrap_or_else(|| match self.endpoint {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                });
                let socket = UdpSocket::bind(bind_addr)?;
                Transport::quic(QuicDialer::new(socket, self.server_name()?)?, self.endpoint)
            }
        })
    }

    fn server_name(&self) -> Result<&str, ConfigError> {
        self.server_name
            .as_deref()
            .ok_or(ConfigError::MissingServerName(self.protocol))
    }
}
