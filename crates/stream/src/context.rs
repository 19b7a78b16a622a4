// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancellation and deadline propagation for exchanges

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;

/// Carries cancellation and an optional deadline across an exchange.
///
/// Every blocking step of an exchange (dial, stream open, write, read) is bounded by the
/// context rather than by internal timeouts. Canceling a context also cancels every context
/// derived from it, never the other way around.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context that is never canceled and has no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a child context that can be canceled independently of this one
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child context which expires at `deadline`, or earlier if this context does
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derives a child context which expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Cancels this context and all contexts derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason this context is done, or `None` while it is still live
    pub fn err(&self) -> Option<NetError> {
        if self.token.is_cancelled() {
            return Some(NetError::Canceled);
        }

        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(NetError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is canceled or its deadline expires
    pub async fn done(&self) -> NetError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => NetError::Canceled,
                _ = tokio::time::sleep_until(deadline) => NetError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                NetError::Canceled
            }
        }
    }

    /// Runs `future` until it completes or the context is done, whichever happens first.
    ///
    /// When the future fails after the context is done, the context's error is returned
    /// instead, so callers observe the cancellation rather than the I/O failure it caused.
    pub async fn run<T, F>(&self, future: F) -> Result<T, NetError>
    where
        F: Future<Output = Result<T, NetError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = future => result.map_err(|e| self.err().unwrap_or(e)),
        }
    }
}
