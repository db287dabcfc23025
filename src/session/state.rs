//! Observable session status
//!
//! A [`StatusCell`] is the only thing a front-end needs to poll: the current
//! state, the last human-readable message, and when it changed.

use parking_lot::RwLock;
use std::fmt;
use std::time::Instant;

/// Receiver connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Sender streaming state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for StreamingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamingState::Stopped => "stopped",
            StreamingState::Starting => "starting",
            StreamingState::Started => "started",
            StreamingState::Stopping => "stopping",
        })
    }
}

/// Point-in-time copy of a [`StatusCell`]
#[derive(Debug, Clone)]
pub struct Status<S> {
    pub state: S,
    pub message: String,
    pub changed_at: Instant,
    /// Bumped on every update, so pollers can spot changes cheaply
    pub revision: u64,
}

#[derive(Debug)]
pub struct StatusCell<S> {
    inner: RwLock<Status<S>>,
}

impl<S: Copy + PartialEq + fmt::Display> StatusCell<S> {
    pub fn new(state: S, message: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Status {
                state,
                message: message.into(),
                changed_at: Instant::now(),
                revision: 0,
            }),
        }
    }

    pub fn state(&self) -> S {
        self.inner.read().state
    }

    pub fn message(&self) -> String {
        self.inner.read().message.clone()
    }

    pub fn snapshot(&self) -> Status<S> {
        self.inner.read().clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    /// Replace state and message
    pub fn set(&self, state: S, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.inner.write();
        if inner.state != state {
            tracing::info!("{} -> {}: {}", inner.state, state, message);
        } else {
            tracing::debug!("{}: {}", state, message);
        }
        inner.state = state;
        inner.message = message;
        inner.changed_at = Instant::now();
        inner.revision += 1;
    }

    /// Update the message, keeping the state
    pub fn note(&self, message: impl Into<String>) {
        let state = self.state();
        self.set(state, message);
    }

    /// Move to `to` only if currently in `from`. Returns whether it moved.
    pub fn transition(&self, from: S, to: S, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut inner = self.inner.write();
        if inner.state != from {
            return false;
        }
        tracing::info!("{} -> {}: {}", from, to, message);
        inner.state = to;
        inner.message = message;
        inner.changed_at = Instant::now();
        inner.revision += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_snapshot() {
        let cell = StatusCell::new(ConnectionState::Disconnected, "idle");
        assert_eq!(cell.state(), ConnectionState::Disconnected);
        assert_eq!(cell.revision(), 0);

        cell.set(ConnectionState::Connecting, "Connecting...");
        let snap = cell.snapshot();
        assert_eq!(snap.state, ConnectionState::Connecting);
        assert_eq!(snap.message, "Connecting...");
        assert_eq!(snap.revision, 1);

        cell.note("still trying");
        assert_eq!(cell.state(), ConnectionState::Connecting);
        assert_eq!(cell.message(), "still trying");
    }

    #[test]
    fn test_guarded_transition() {
        let cell = StatusCell::new(StreamingState::Stopped, "");
        assert!(cell.transition(StreamingState::Stopped, StreamingState::Starting, "go"));
        // a second start loses the race
        assert!(!cell.transition(StreamingState::Stopped, StreamingState::Starting, "go"));
        assert_eq!(cell.state(), StreamingState::Starting);
        assert_eq!(cell.revision(), 1);
    }
}
