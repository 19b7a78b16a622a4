// Copyright 2015-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error types for the crate

#![deny(missing_docs)]

use std::io;

use thiserror::Error;

use crate::proto::error::ProtoError;
use crate::proto::op::ResponseCode;
use crate::response::InvalidResponse;

/// The error type for a single exchange over TCP, TLS or QUIC
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NetError {
    /// The context was canceled by the caller
    #[error("operation canceled")]
    Canceled,

    /// The deadline carried by the context expired
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The response could not be parsed or does not answer the query that was sent
    #[error("invalid response: {0}")]
    InvalidResponse(#[from] InvalidResponse),

    /// An error with an arbitrary message, referenced as &'static str
    #[error("{0}")]
    Message(&'static str),

    /// An error with an arbitrary message, stored as String
    #[error("{0}")]
    Msg(String),

    /// The response does not contain any record of the requested type
    #[error("no data in response")]
    NoData,

    /// The query could not be encoded to wire format
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// Received an error response code from the server
    #[error("error response: {0}")]
    ResponseCode(ResponseCode),

    // foreign
    /// An error got returned from IO
    #[error("io error: {0}")]
    Io(#[source] io::Error),

    /// An I/O deadline on the stream expired
    #[error("request timed out")]
    Timeout,

    /// A Quinn (QUIC) connection error occurred
    #[error("error creating quic connection: {0}")]
    QuinnConnect(#[from] quinn::ConnectError),

    /// A Quinn (QUIC) connection error occurred
    #[error("error with quic connection: {0}")]
    QuinnConnection(#[from] quinn::ConnectionError),

    /// A Quinn (QUIC) configuration error occurred
    #[error("error constructing quic configuration: {0}")]
    QuinnConfigError(#[from] quinn::ConfigError),

    /// QUIC TLS config must include an AES-128-GCM cipher suite
    #[error("QUIC TLS config must include an AES-128-GCM cipher suite")]
    QuinnTlsConfigError(#[from] quinn::crypto::rustls::NoInitialCipherSuite),

    /// A Rustls error occurred
    #[error("rustls construction error: {0}")]
    RustlsError(#[from] rustls::Error),
}

impl NetError {
    /// Returns true if the exchange was aborted because the context was canceled or its
    /// deadline expired
    #[inline]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// Returns true if the server answered with something that is not a valid response
    /// to the query that was sent
    #[inline]
    pub fn is_invalid_response(&self) -> bool {
        matches!(self, Self::InvalidResponse(_))
    }

    /// Returns the underlying I/O error, if any
    pub fn as_io(&self) -> Option<&io::Error> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(e),
        }
    }
}
