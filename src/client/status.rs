use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::event::FemtoEvent;

/// Connection state of a relay client.
///
/// Buffering is not a state of its own: events submitted while not
/// `Streaming` wait in the backoff controller's pending queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
    /// Automatic retries stopped at the backoff ceiling.
    Exhausted = 3,
    Closed = 4,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Streaming,
            3 => LinkState::Exhausted,
            4 => LinkState::Closed,
            _ => LinkState::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Streaming => "streaming",
            LinkState::Exhausted => "exhausted",
            LinkState::Closed => "closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters shared between a client handle and its worker.
#[derive(Debug, Default)]
pub(crate) struct LinkStatus {
    state: AtomicU8,
    delivered: AtomicU64,
    rejected: AtomicU64,
}

impl LinkStatus {
    pub(crate) fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Outcome of closing a relay client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShutdownReport {
    /// Events still pending when the client stopped, oldest first.
    pub undelivered: Vec<FemtoEvent>,
}

impl ShutdownReport {
    /// Whether every submitted event was delivered or explicitly rejected.
    pub fn is_clean(&self) -> bool {
        self.undelivered.is_empty()
    }
}
