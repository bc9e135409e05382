//! Pipeline stage primitives
//!
//! Every buffering stage of the stack (transport receiver, protection
//! reassembler, security decryptor, package reader) is built from the same
//! two pieces:
//!
//! - [`ByteBuffer`]: one lock-guarded byte buffer with a readiness
//!   notification, written by exactly one background task and drained by the
//!   consuming API call.
//! - [`Worker`]: a background task with a cooperative stop flag that is
//!   joined with a bounded grace period. Its output is whatever the task
//!   could not hand upward (its residual bytes).

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Interval a background loop waits on the stage below before re-checking
/// its stop flag
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Back-off applied when the stage below returns nothing immediately
pub const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Default bound on joining a stopped worker
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// Lock-guarded byte buffer with wake-on-data reads
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: Mutex<BytesMut>,
    readable: Notify,
    closed: AtomicBool,
}

impl ByteBuffer {
    /// Create an empty, open buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and wake any waiting reader
    pub async fn extend(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.data.lock().await.extend_from_slice(chunk);
        self.readable.notify_waiters();
    }

    /// Put bytes back at the front of the buffer.
    ///
    /// Used when a reader higher up stops and returns bytes it pulled out but
    /// never consumed.
    pub async fn unread(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut data = self.data.lock().await;
            let mut joined = BytesMut::with_capacity(chunk.len() + data.len());
            joined.extend_from_slice(chunk);
            joined.extend_from_slice(&data);
            *data = joined;
        }
        self.readable.notify_waiters();
    }

    /// Remove and return up to `limit` buffered bytes without waiting
    pub async fn drain(&self, limit: Option<usize>) -> Bytes {
        let mut data = self.data.lock().await;
        let len = limit.map_or(data.len(), |limit| limit.min(data.len()));
        data.split_to(len).freeze()
    }

    /// Remove and return up to `limit` bytes, waiting up to `timeout` for
    /// data to arrive.
    ///
    /// `None` means do not wait. Returns an empty buffer on timeout or when
    /// the buffer is closed and empty.
    pub async fn read(&self, limit: Option<usize>, timeout: Option<Duration>) -> Bytes {
        let Some(timeout) = timeout else {
            return self.drain(limit).await;
        };
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let chunk = self.drain(limit).await;
            if !chunk.is_empty() || self.is_closed() {
                return chunk;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Bytes::new();
            }
        }
    }

    /// Number of buffered bytes
    pub async fn len(&self) -> usize {
        self.data.lock().await.len()
    }

    /// Whether no bytes are buffered
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every buffered byte
    pub async fn clear(&self) {
        self.data.lock().await.clear();
    }

    /// Mark the buffer closed: readers stop waiting once it is drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.readable.notify_waiters();
    }

    /// Re-open a closed buffer
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Cooperative stop flag handed to a worker's loop
#[derive(Debug, Clone)]
pub struct Running(Arc<AtomicBool>);

impl Running {
    /// Whether the loop should keep iterating
    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stoppable background task producing `T` when it exits
pub struct Worker<T> {
    name: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn `routine` on the runtime; it receives the stop flag
    pub fn spawn<F, Fut>(name: &'static str, routine: F) -> Self
    where
        F: FnOnce(Running) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(routine(Running(running.clone())));
        debug!("Worker {} started", name);

        Self {
            name,
            running,
            handle: Some(handle),
        }
    }

    /// Whether the worker has not been stopped and its task is still alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Clear the stop flag and join the task for at most `grace`.
    ///
    /// Returns the task output, or `None` if the worker was already stopped,
    /// panicked, or had to be aborted after the grace period.
    pub async fn stop(&mut self, grace: Duration) -> Option<T> {
        self.running.store(false, Ordering::SeqCst);
        let mut handle = self.handle.take()?;

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(output)) => {
                debug!("Worker {} stopped", self.name);
                Some(output)
            }
            Ok(Err(e)) => {
                warn!("Worker {} ended abnormally: {}", self.name, e);
                None
            }
            Err(_) => {
                warn!("Worker {} did not stop within {:?}, aborting", self.name, grace);
                handle.abort();
                None
            }
        }
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_respects_limit() {
        let buffer = ByteBuffer::new();
        buffer.extend(b"hello world").await;

        assert_eq!(&buffer.drain(Some(5)).await[..], b"hello");
        assert_eq!(&buffer.drain(None).await[..], b" world");
        assert!(buffer.drain(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_unread_prepends() {
        let buffer = ByteBuffer::new();
        buffer.extend(b"world").await;
        buffer.unread(b"hello ").await;

        assert_eq!(&buffer.drain(None).await[..], b"hello world");
    }

    #[tokio::test]
    async fn test_read_wakes_on_data() {
        let buffer = Arc::new(ByteBuffer::new());
        let writer = buffer.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.extend(b"late").await;
        });

        let start = std::time::Instant::now();
        let chunk = buffer.read(None, Some(Duration::from_secs(5))).await;
        assert_eq!(&chunk[..], b"late");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_read_times_out_empty() {
        let buffer = ByteBuffer::new();
        let start = std::time::Instant::now();
        let chunk = buffer.read(None, Some(Duration::from_millis(100))).await;

        assert!(chunk.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_closed_buffer_does_not_wait() {
        let buffer = ByteBuffer::new();
        buffer.close();

        let start = std::time::Instant::now();
        let chunk = buffer.read(None, Some(Duration::from_secs(5))).await;
        assert!(chunk.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_worker_stop_returns_output_and_is_idempotent() {
        let mut worker = Worker::spawn("counter", |running| async move {
            let mut ticks = 0u32;
            while running.get() {
                ticks += 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            ticks
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(worker.is_running());

        let ticks = worker.stop(STOP_GRACE).await;
        assert!(ticks.is_some_and(|ticks| ticks > 0));
        assert!(worker.stop(STOP_GRACE).await.is_none());
        assert!(!worker.is_running());
    }
}
