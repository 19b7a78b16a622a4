// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Responses received over a stream and their validation against the query

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::error::NetError;
use crate::proto::error::ProtoError;
use crate::proto::op::{Message, MessageType, ResponseCode};
use crate::proto::rr::RData;

/// Reasons a message received from the server is not a valid response
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InvalidResponse {
    /// The response bytes could not be parsed
    #[error("malformed message: {0}")]
    Malformed(#[source] ProtoError),

    /// The message does not have the response bit set
    #[error("message is not a response")]
    NotAResponse,

    /// The response ID does not match the query ID
    #[error("id mismatch, expected: {expected} got: {actual}")]
    IdMismatch {
        /// ID of the query that was sent
        expected: u16,
        /// ID found in the response
        actual: u16,
    },

    /// The response op code does not match the query op code
    #[error("op code mismatch")]
    OpCodeMismatch,

    /// The question section does not echo the query
    #[error("question section does not match the query")]
    QuestionMismatch,
}

/// A response that was validated against the query sent on the wire
#[derive(Clone, Debug)]
pub struct DnsResponse {
    message: Message,
}

impl DnsResponse {
    /// Validates that `response` answers `query`
    ///
    /// `query` is the message as it was sent, after the protocol policy was applied.
    pub fn from_message(query: &Message, response: Message) -> Result<Self, InvalidResponse> {
        if response.message_type() != MessageType::Response {
            return Err(InvalidResponse::NotAResponse);
        }

        if response.id() != query.id() {
            return Err(InvalidResponse::IdMismatch {
                expected: query.id(),
                actual: response.id(),
            });
        }

        if response.op_code() != query.op_code() {
            return Err(InvalidResponse::OpCodeMismatch);
        }

        if response.queries() != query.queries() {
            return Err(InvalidResponse::QuestionMismatch);
        }

        Ok(Self { message: response })
    }

    /// Parses raw response bytes and validates them against `query`
    pub fn from_vec(query: &Message, raw: &[u8]) -> Result<Self, InvalidResponse> {
        let response = Message::from_vec(raw).map_err(InvalidResponse::Malformed)?;
        Self::from_message(query, response)
    }

    /// The response code
    pub fn response_code(&self) -> ResponseCode {
        self.message.response_code()
    }

    /// The underlying message
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Consumes the response, returning the underlying message
    pub fn into_message(self) -> Message {
        self.message
    }

    /// IPv4 addresses in the answer section
    pub fn records_a(&self) -> Result<Vec<Ipv4Addr>, NetError> {
        self.collect(|rdata| match rdata {
            RData::A(a) => Some(a.0),
            _ => None,
        })
    }

    /// IPv6 addresses in the answer section
    pub fn records_aaaa(&self) -> Result<Vec<Ipv6Addr>, NetError> {
        self.collect(|rdata| match rdata {
            RData::AAAA(aaaa) => Some(aaaa.0),
            _ => None,
        })
    }

    fn collect<T>(&self, f: impl Fn(&RData) -> Option<T>) -> Result<Vec<T>, NetError> {
        let code = self.response_code();
        if code != ResponseCode::NoError {
            return Err(NetError::ResponseCode(code));
        }

        let found = self
            .message
            .answers()
            .iter()
            .filter_map(|record| record.data().and_then(&f))
            .collect::<Vec<_>>();

        if found.is_empty() {
            return Err(NetError::NoData);
        }

        Ok(found)
    }
}
