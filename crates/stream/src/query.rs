// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Outgoing queries and the per-protocol policy applied to them

use std::fmt::{self, Display};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::proto::op::{Edns, Message, MessageType, OpCode, Query};
use crate::proto::rr::rdata::opt::EdnsOption;
use crate::proto::rr::{Name, RecordType};

/// Maximum response size advertised over stream transports, bounded by the 2-octet length prefix
pub const MAX_RESPONSE_SIZE_TCP: u16 = u16::MAX;

/// Default maximum response size, as recommended by DNS flag day 2020 for UDP
pub const MAX_RESPONSE_SIZE_UDP: u16 = 1232;

/// Smallest payload size that may be advertised in EDNS(0), RFC 6891
const MIN_EDNS_PAYLOAD: u16 = 512;

/// EDNS(0) padding option code, RFC 7830
const EDNS_PADDING: u16 = 12;

/// Option code plus option length
const EDNS_OPTION_HEADER_LEN: usize = 4;

/// Block size for query padding, RFC 8467 Section 4.1
const QUERY_PADDING_BLOCK: usize = 128;

bitflags! {
    /// Optional behaviors applied when a [`DnsQuery`] is converted to a [`Message`]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QueryFlags: u16 {
        /// Pad the query to a multiple of 128 bytes (RFC 8467)
        const BLOCK_LENGTH_PADDING = 1 << 0;
        /// Set the DNSSEC OK bit in the EDNS(0) header
        const DNSSEC = 1 << 1;
    }
}

/// A DNS query owned by the caller.
///
/// Transports never modify the caller's query: they clone it and apply the policy of their
/// [`Protocol`] to the clone before packing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsQuery {
    /// The name to query, absolute or relative to the root
    pub name: String,
    /// The record type to query
    pub record_type: RecordType,
    /// Optional behaviors, see [`QueryFlags`]
    pub flags: QueryFlags,
    /// The message ID
    pub id: u16,
    /// Maximum response size advertised through EDNS(0); zero disables EDNS(0)
    pub max_size: u16,
}

impl DnsQuery {
    /// Creates a query with a random ID and the default maximum response size
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            name: name.into(),
            record_type,
            flags: QueryFlags::empty(),
            id: rand::random(),
            max_size: MAX_RESPONSE_SIZE_UDP,
        }
    }

    /// Builds the wire-level message for this query
    ///
    /// Fails if the name is not a valid domain name.
    pub fn to_message(&self) -> Result<Message, NetError> {
        let mut name = Name::from_ascii(&self.name)?;
        name.set_fqdn(true);

        let mut message = Message::new();
        message.set_id(self.id);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(name, self.record_type));

        if self.max_size > 0 || !self.flags.is_empty() {
            let mut edns = Edns::new();
            edns.set_version(0);
            edns.set_max_payload(self.max_size.max(MIN_EDNS_PAYLOAD));
            edns.set_dnssec_ok(self.flags.contains(QueryFlags::DNSSEC));
            *message.extensions_mut() = Some(edns);
        }

        if self.flags.contains(QueryFlags::BLOCK_LENGTH_PADDING) {
            pad_to_block(&mut message)?;
        }

        Ok(message)
    }
}

/// Appends an EDNS(0) padding option so the packed message is a multiple of the padding block
fn pad_to_block(message: &mut Message) -> Result<(), NetError> {
    let unpadded = message.to_vec()?.len() + EDNS_OPTION_HEADER_LEN;
    let padding = (QUERY_PADDING_BLOCK - unpadded % QUERY_PADDING_BLOCK) % QUERY_PADDING_BLOCK;

    if let Some(edns) = message.extensions_mut() {
        edns.options_mut()
            .insert(EdnsOption::Unknown(EDNS_PADDING, vec![0; padding]));
    }

    Ok(())
}

/// The stream transports supported by this crate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// DNS over TCP, RFC 1035 and RFC 7766
    Tcp,
    /// DNS over TLS, RFC 7858
    Tls,
    /// DNS over QUIC, RFC 9250
    Quic,
}

impl Protocol {
    /// Applies the query settings this protocol requires
    ///
    /// | Protocol | Max response size | Padding | DNSSEC | Query ID  |
    /// |----------|-------------------|---------|--------|-----------|
    /// | TCP      | TCP max           | unset   | unset  | unchanged |
    /// | TLS      | TCP max           | set     | set    | unchanged |
    /// | QUIC     | TCP max           | set     | set    | 0         |
    pub fn mutate_query(self, query: &mut DnsQuery) {
        query.max_size = MAX_RESPONSE_SIZE_TCP;
        match self {
            Self::Tcp => {}
            Self::Tls => {
                query.flags |= QueryFlags::BLOCK_LENGTH_PADDING | QueryFlags::DNSSEC;
            }
            Self::Quic => {
                query.flags |= QueryFlags::BLOCK_LENGTH_PADDING | QueryFlags::DNSSEC;
                // RFC 9250 Section 4.2.1, the stream correlates query and response
                query.id = 0;
            }
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Quic => "quic",
        };

        f.write_str(protocol)
    }
}
