//! Framing protocol ("datapackages")
//!
//! Turns any [`Channel`] into a FIFO of structured JSON messages. The
//! underlying read may return one byte at a time or large bursts; a
//! background reader accumulates whatever arrives and splits packages out at
//! the delimiter.
//!
//! A handler can be stopped at any point without losing bytes: [`Datapackage::stop`]
//! returns every byte it pulled from the channel but did not deliver, so the
//! caller can [`restore`](Channel::restore) them to the layer below. This is
//! what makes the transient negotiation handlers safe to tear down while the
//! peer is already talking on the next layer.

mod frame;

pub use frame::{
    decode_package, encode_package, extract_frames, next_frame, to_package, PACKAGE_DELIMITER,
};

use crate::channel::Channel;
use crate::pipeline::{Running, Worker, IDLE_BACKOFF, POLL_INTERVAL, STOP_GRACE};
use crate::transport::ConnectionId;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// A structured message: one JSON object
pub type Package = serde_json::Map<String, Value>;

/// Framing errors
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Invalid JSON: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("Write failed: {0}")]
    Write(String),
}

/// Arguments handed to the channel's receive call on every reader iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceptionParameters {
    /// Connection the reader pulls from (and writes go to)
    pub connection: ConnectionId,
    /// Maximum bytes taken per read
    pub limit: Option<usize>,
    /// How long each read may wait for data
    pub timeout: Duration,
}

impl ReceptionParameters {
    /// Unlimited reads on `connection`, waiting one poll interval each
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            limit: None,
            timeout: POLL_INTERVAL,
        }
    }

    /// Cap the bytes taken per read
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Package handler bound to a channel
pub struct Datapackage {
    channel: Arc<dyn Channel>,
    parameters: Arc<Mutex<ReceptionParameters>>,
    packages: Mutex<mpsc::UnboundedReceiver<Package>>,
    reader: Mutex<Option<Worker<BytesMut>>>,
}

impl Datapackage {
    /// Create a handler and start its background reader
    pub fn new(channel: Arc<dyn Channel>, parameters: ReceptionParameters) -> Self {
        let (package_tx, package_rx) = mpsc::unbounded_channel();
        let parameters = Arc::new(Mutex::new(parameters));

        let reader = Worker::spawn("datapackage-reader", {
            let channel = channel.clone();
            let parameters = parameters.clone();
            move |running| reader_routine(channel, parameters, package_tx, running)
        });

        Self {
            channel,
            parameters,
            packages: Mutex::new(package_rx),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Serialize and write one package
    pub async fn send(&self, package: &Package) -> Result<(), FramingError> {
        let frame = encode_package(package)?;
        let connection = self.parameters.lock().await.connection;

        self.channel
            .send(connection, &frame)
            .await
            .map_err(|e| FramingError::Write(e.to_string()))
    }

    /// Send any value that serializes to a JSON object
    pub async fn send_message<T: Serialize>(&self, message: &T) -> Result<(), FramingError> {
        self.send(&to_package(message)?).await
    }

    /// Take the next package, waiting up to `timeout` (`None` waits until one
    /// arrives or the handler stops)
    pub async fn receive(&self, timeout: Option<Duration>) -> Option<Package> {
        let mut packages = self.packages.lock().await;
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, packages.recv())
                .await
                .ok()
                .flatten(),
            None => packages.recv().await,
        }
    }

    /// Take the next package and decode it as `T`.
    ///
    /// `Ok(None)` means nothing arrived in time.
    pub async fn receive_message<T: DeserializeOwned>(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, FramingError> {
        match self.receive(timeout).await {
            Some(package) => serde_json::from_value(Value::Object(package))
                .map(Some)
                .map_err(FramingError::Deserialization),
            None => Ok(None),
        }
    }

    /// Swap the arguments used by the reader from its next iteration on
    pub async fn update_reception_parameters(&self, parameters: ReceptionParameters) {
        *self.parameters.lock().await = parameters;
    }

    /// Current reception parameters
    pub async fn reception_parameters(&self) -> ReceptionParameters {
        *self.parameters.lock().await
    }

    /// Whether the background reader is still running
    pub async fn is_running(&self) -> bool {
        self.reader
            .lock()
            .await
            .as_ref()
            .is_some_and(|reader| reader.is_running())
    }

    /// Stop the reader and return every byte it took from the channel but
    /// never delivered: undelivered packages re-encoded in arrival order,
    /// followed by any partial frame. Calling it again returns nothing.
    pub async fn stop(&self) -> Bytes {
        let Some(mut reader) = self.reader.lock().await.take() else {
            return Bytes::new();
        };
        let partial = reader.stop(STOP_GRACE).await.unwrap_or_default();

        let mut residual = BytesMut::new();
        let mut packages = self.packages.lock().await;
        while let Ok(package) = packages.try_recv() {
            match encode_package(&package) {
                Ok(frame) => residual.extend_from_slice(&frame),
                Err(e) => debug!("Dropping undeliverable package: {}", e),
            }
        }
        residual.extend_from_slice(&partial);

        if !residual.is_empty() {
            debug!("Package handler stopped with {} residual bytes", residual.len());
        }
        residual.freeze()
    }
}

async fn reader_routine(
    channel: Arc<dyn Channel>,
    parameters: Arc<Mutex<ReceptionParameters>>,
    packages: mpsc::UnboundedSender<Package>,
    running: Running,
) -> BytesMut {
    let mut buffer = BytesMut::new();

    while running.get() {
        let ReceptionParameters {
            connection,
            limit,
            timeout,
        } = *parameters.lock().await;

        let chunk = match channel.receive(connection, limit, Some(timeout)).await {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!("Package reader: receive on {} failed: {}", connection, e);
                tokio::time::sleep(IDLE_BACKOFF).await;
                continue;
            }
        };

        if chunk.is_empty() {
            tokio::time::sleep(IDLE_BACKOFF).await;
            continue;
        }
        buffer.extend_from_slice(&chunk);

        for frame in extract_frames(&mut buffer) {
            match decode_package(&frame) {
                Ok(package) => {
                    trace!("Package received ({} bytes)", frame.len());
                    // Receiver only disappears with the handler itself
                    let _ = packages.send(package);
                }
                Err(e) => debug!("Discarding malformed package: {}", e),
            }
        }
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MemoryChannel;
    use crate::pipeline::ByteBuffer;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn package(value: Value) -> Package {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test packages are objects"),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_between_handlers() {
        let (a, b) = MemoryChannel::pair();
        let sender = Datapackage::new(a, ReceptionParameters::new(1));
        let receiver = Datapackage::new(b, ReceptionParameters::new(1));

        let message = package(json!({"cmd": "ping", "args": [1, 2, {"nested": null}]}));
        sender.send(&message).await.unwrap();

        let received = receiver.receive(Some(Duration::from_secs(5))).await;
        assert_eq!(received, Some(message));

        sender.stop().await;
        receiver.stop().await;
    }

    #[tokio::test]
    async fn test_byte_by_byte_delivery() {
        for chunk in [1, 3, 7] {
            let channel = MemoryChannel::trickle(chunk);
            let first = package(json!({"text": "fragmented ünïcode", "n": 42}));
            let second = package(json!({"second": true}));

            let mut wire = encode_package(&first).unwrap();
            wire.extend_from_slice(&encode_package(&second).unwrap());
            channel.incoming.extend(&wire).await;

            let handler = Datapackage::new(channel.clone(), ReceptionParameters::new(1));
            assert_eq!(handler.receive(Some(Duration::from_secs(5))).await, Some(first));
            assert_eq!(handler.receive(Some(Duration::from_secs(5))).await, Some(second));
            handler.stop().await;
        }
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let channel = MemoryChannel::trickle(4096);
        channel.incoming.extend(b"not json").await;
        channel.incoming.extend(&PACKAGE_DELIMITER).await;
        channel.incoming.extend(&[0xff, 0xfe, 0xfd]).await;
        channel.incoming.extend(&PACKAGE_DELIMITER).await;
        channel
            .incoming
            .extend(&encode_package(&package(json!({"ok": 1}))).unwrap())
            .await;

        let handler = Datapackage::new(channel.clone(), ReceptionParameters::new(1));
        let received = handler.receive(Some(Duration::from_secs(5))).await;
        assert_eq!(received, Some(package(json!({"ok": 1}))));
        handler.stop().await;
    }

    #[tokio::test]
    async fn test_read_failures_do_not_stop_reader() {
        let channel = MemoryChannel::trickle(4096);
        channel.fail_reads.store(true, Ordering::SeqCst);

        let handler = Datapackage::new(channel.clone(), ReceptionParameters::new(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handler.is_running().await);

        channel.fail_reads.store(false, Ordering::SeqCst);
        channel
            .incoming
            .extend(&encode_package(&package(json!({"after": "fault"}))).unwrap())
            .await;

        let received = handler.receive(Some(Duration::from_secs(5))).await;
        assert_eq!(received, Some(package(json!({"after": "fault"}))));
        handler.stop().await;
    }

    #[tokio::test]
    async fn test_receive_timeout_boundary() {
        let channel = MemoryChannel::trickle(4096);
        let handler = Datapackage::new(channel, ReceptionParameters::new(1));

        let start = std::time::Instant::now();
        let received = handler.receive(Some(Duration::from_millis(100))).await;
        let elapsed = start.elapsed();

        assert!(received.is_none());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(500));
        handler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let channel = MemoryChannel::trickle(4096);
        let handler = Datapackage::new(channel, ReceptionParameters::new(1));

        handler.stop().await;
        assert!(handler.stop().await.is_empty());
        assert!(!handler.is_running().await);
        assert!(handler.receive(Some(Duration::from_millis(10))).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_returns_undelivered_bytes() {
        let channel = MemoryChannel::trickle(4096);
        let queued = encode_package(&package(json!({"queued": 1}))).unwrap();
        let partial = br#"{"partial":"#;

        channel.incoming.extend(&queued).await;
        channel.incoming.extend(partial).await;

        let handler = Datapackage::new(channel.clone(), ReceptionParameters::new(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(channel.incoming.is_empty().await);

        let residual = handler.stop().await;
        let mut expected = queued.to_vec();
        expected.extend_from_slice(partial);
        assert_eq!(&residual[..], &expected[..]);
    }

    /// Channel with one independent buffer per connection
    struct MultiChannel {
        connections: HashMap<ConnectionId, ByteBuffer>,
    }

    #[async_trait]
    impl Channel for MultiChannel {
        async fn send(&self, _connection: ConnectionId, _data: &[u8]) -> crate::Result<()> {
            Ok(())
        }

        async fn receive(
            &self,
            connection: ConnectionId,
            limit: Option<usize>,
            timeout: Option<Duration>,
        ) -> crate::Result<Bytes> {
            match self.connections.get(&connection) {
                Some(buffer) => Ok(buffer.read(limit, timeout).await),
                None => Err(crate::transport::TransportError::UnknownConnection(connection).into()),
            }
        }

        async fn restore(&self, _connection: ConnectionId, _data: Bytes) -> crate::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_update_reception_parameters_redirects_reader() {
        let mut connections = HashMap::new();
        connections.insert(1, ByteBuffer::new());
        connections.insert(2, ByteBuffer::new());
        let channel = Arc::new(MultiChannel { connections });

        let handler = Datapackage::new(channel.clone(), ReceptionParameters::new(1));

        let on_two = encode_package(&package(json!({"from": 2}))).unwrap();
        channel.connections[&2].extend(&on_two).await;
        assert!(handler.receive(Some(Duration::from_millis(200))).await.is_none());

        handler
            .update_reception_parameters(ReceptionParameters::new(2).with_limit(1))
            .await;
        assert_eq!(handler.reception_parameters().await.connection, 2);

        let received = handler.receive(Some(Duration::from_secs(5))).await;
        assert_eq!(received, Some(package(json!({"from": 2}))));
        handler.stop().await;
    }
}
