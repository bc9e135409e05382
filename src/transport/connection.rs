//! Connection state tracking

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No peer, not listening
    Closed,
    /// Waiting for a peer to connect
    Listening,
    /// Connected and ready
    Established,
    /// The link failed underneath us
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Listening => "LISTENING",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Lost => "LOST",
        };
        f.write_str(name)
    }
}

/// Connection state shared between a transport and its background tasks
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Closed);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Move to `to` only if the current state is `from`
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Wait up to `timeout` for the state to become `target`
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let reached = async move {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, reached).await.unwrap_or(false)
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
