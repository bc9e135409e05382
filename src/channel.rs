//! Byte channel abstraction shared by every layer of the stack
//!
//! The transport layer, a session's protection layer and its security layer
//! all expose the same surface: send bytes to a connection, receive the bytes
//! that are ready for it, and give back bytes that a reader pulled out but did
//! not consume. Package handlers and upper layers only ever see this trait,
//! which is what lets a negotiation handler ride on whichever layer sits below
//! the one being negotiated.

use crate::transport::ConnectionId;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Connection-addressed byte channel
#[async_trait]
pub trait Channel: Send + Sync {
    /// Write `data` to `connection`
    async fn send(&self, connection: ConnectionId, data: &[u8]) -> Result<()>;

    /// Take up to `limit` ready bytes from `connection`.
    ///
    /// With `timeout = None` this never waits; otherwise it waits up to
    /// `timeout` for data. An empty result means nothing was available.
    async fn receive(
        &self,
        connection: ConnectionId,
        limit: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<Bytes>;

    /// Return unconsumed bytes to the front of `connection`'s ready data
    async fn restore(&self, connection: ConnectionId, data: Bytes) -> Result<()>;
}
