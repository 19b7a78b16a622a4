//! DNS over TCP, TLS and QUIC for Hickory DNS
//!
//! A [`Transport`] exchanges a single query with a single endpoint: it dials a new connection,
//! opens one stream, writes the length-prefixed query, reads the length-prefixed response and
//! closes the connection. The three protocols only differ in how they connect and open streams,
//! see [`StreamOpenerDialer`] and [`StreamOpener`], and in how they adjust the outgoing query,
//! see [`Protocol::mutate_query`].
//!
//! ```no_run
//! use hickory_stream::proto::rr::RecordType;
//! use hickory_stream::{Context, DnsQuery, Transport};
//!
//! # async fn lookup() -> Result<(), hickory_stream::NetError> {
//! let transport = Transport::tls("dns.google", ([8, 8, 8, 8], 853).into())?;
//! let ctx = Context::new().with_timeout(std::time::Duration::from_secs(5));
//!
//! let response = transport
//!     .exchange(&ctx, &DnsQuery::new("www.example.com", RecordType::A))
//!     .await?;
//! for addr in response.records_a()? {
//!     println!("{addr}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::dbg_macro, clippy::print_stdout, missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use hickory_proto as proto;

pub mod config;
mod context;
mod error;
pub mod query;
pub mod quic;
pub mod response;
pub mod stream;
pub mod tcp;
pub mod tls;
mod transport;

pub use crate::config::{ConfigError, TransportConfig};
pub use crate::context::Context;
pub use crate::error::NetError;
pub use crate::query::{DnsQuery, Protocol, QueryFlags};
pub use crate::response::{DnsResponse, InvalidResponse};
pub use crate::stream::{new_stream_msg_frame, DnsStream, StreamOpener, StreamOpenerDialer};
pub use crate::transport::{RawMessageObserver, Transport};
