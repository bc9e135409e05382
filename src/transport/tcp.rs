//! TCP/IP transport
//!
//! One transport instance carries at most one peer. A background receiver
//! task moves socket bytes into the reception buffer; listening instances
//! also run an acceptor task that attaches the first peer and turns away
//! every later one, even after the first peer has left.

use super::{ConnectionState, Endpoint, StateCell, Transport, TransportConfig, TransportError};
use crate::pipeline::{ByteBuffer, Running, Worker, IDLE_BACKOFF, POLL_INTERVAL, STOP_GRACE};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// TCP transport
pub struct TcpTransport {
    shared: Arc<Shared>,
    acceptor: Mutex<Option<Worker<()>>>,
}

/// State reachable from the acceptor task
struct Shared {
    config: TransportConfig,
    state: Arc<StateCell>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reception: Arc<ByteBuffer>,
    receiver: Mutex<Option<Worker<()>>>,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Arc::new(StateCell::new()),
                writer: Mutex::new(None),
                reception: Arc::new(ByteBuffer::new()),
                receiver: Mutex::new(None),
            }),
            acceptor: Mutex::new(None),
        }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Shared {
    /// Take over a freshly connected socket
    async fn attach(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(self.config.nodelay) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();

        if let Some(mut previous) = self.receiver.lock().await.take() {
            previous.stop(STOP_GRACE).await;
        }
        self.reception.clear().await;
        self.reception.reopen();
        *self.writer.lock().await = Some(write_half);

        let receiver = Worker::spawn("tcp-receiver", {
            let reception = self.reception.clone();
            let state = self.state.clone();
            let chunk_size = self.config.receive_chunk.max(1);
            move |running| receive_routine(read_half, reception, state, chunk_size, running)
        });
        *self.receiver.lock().await = Some(receiver);

        self.state.set(ConnectionState::Established);
    }
}

async fn receive_routine(
    mut reader: OwnedReadHalf,
    reception: Arc<ByteBuffer>,
    state: Arc<StateCell>,
    chunk_size: usize,
    running: Running,
) {
    let mut buf = vec![0u8; chunk_size];

    while running.get() {
        match tokio::time::timeout(POLL_INTERVAL, reader.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                info!("Peer closed the connection");
                state.transition(ConnectionState::Established, ConnectionState::Closed);
                break;
            }
            Ok(Ok(n)) => {
                trace!("Received {} bytes", n);
                reception.extend(&buf[..n]).await;
            }
            Ok(Err(e)) => {
                warn!("Connection lost: {}", e);
                state.transition(ConnectionState::Established, ConnectionState::Lost);
                break;
            }
        }
    }

    reception.close();
}

async fn accept_routine(listener: TcpListener, shared: Arc<Shared>, poll: Duration, running: Running) {
    let mut attached = false;

    while running.get() {
        match tokio::time::timeout(poll, listener.accept()).await {
            Err(_) => continue,
            Ok(Ok((stream, peer))) => {
                // A connection id names one peer for its whole life
                if attached {
                    warn!("Rejecting {}: this connection already served a peer", peer);
                    drop(stream);
                    continue;
                }
                info!("Accepted connection from {}", peer);
                shared.attach(stream).await;
                attached = true;
            }
            Ok(Err(e)) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(IDLE_BACKOFF).await;
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        if self.shared.state.get() == ConnectionState::Established {
            return Err(TransportError::AlreadyConnected);
        }
        let addr = endpoint.resolve().await?;
        let timeout = Duration::from_secs(self.shared.config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        info!("Connected to {}", addr);
        self.shared.attach(stream).await;
        Ok(())
    }

    async fn listen(&self, endpoint: &Endpoint) -> Result<Endpoint, TransportError> {
        let mut acceptor = self.acceptor.lock().await;
        if acceptor.as_ref().is_some_and(Worker::is_running) {
            return Err(TransportError::AlreadyListening);
        }

        let addr = endpoint.resolve().await?;
        let listener = TcpListener::bind(addr).await?;
        let bound = Endpoint::from(listener.local_addr()?);
        info!("Listening on {}", bound);

        self.shared.state.set(ConnectionState::Listening);
        *acceptor = Some(Worker::spawn("tcp-acceptor", {
            let shared = self.shared.clone();
            let poll = Duration::from_millis(self.shared.config.accept_poll.max(1));
            move |running| accept_routine(listener, shared, poll, running)
        }));

        Ok(bound)
    }

    async fn wait_established(&self, timeout: Duration) -> bool {
        self.shared
            .state
            .wait_for(ConnectionState::Established, timeout)
            .await
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.shared.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::NotConnected)?;
        let timeout = Duration::from_secs(self.shared.config.write_timeout);

        match tokio::time::timeout(timeout, stream.write_all(data)).await {
            Ok(Ok(())) => {
                trace!("Sent {} bytes", data.len());
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Send failed: {}", e);
                self.shared
                    .state
                    .transition(ConnectionState::Established, ConnectionState::Lost);
                Err(TransportError::Io(e))
            }
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn read(&self, limit: Option<usize>, timeout: Option<Duration>) -> Bytes {
        self.shared.reception.read(limit, timeout).await
    }

    async fn unread(&self, data: &[u8]) {
        self.shared.reception.unread(data).await;
    }

    async fn disconnect(&self) {
        if let Some(mut acceptor) = self.acceptor.lock().await.take() {
            acceptor.stop(STOP_GRACE).await;
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown failed: {}", e);
            }
        }
        if let Some(mut receiver) = self.shared.receiver.lock().await.take() {
            receiver.stop(STOP_GRACE).await;
        }
        self.shared.reception.close();

        if self.shared.state.get() != ConnectionState::Closed {
            debug!("Transport disconnected");
        }
        self.shared.state.set(ConnectionState::Closed);
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }
}
