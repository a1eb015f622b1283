use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::builder::BuildError;
use crate::event::EventError;
use crate::supervisor::Severity;
use crate::wire::{CodecError, FrameError};

/// Errors raised while relaying events to a collector.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("relay transport failed: {0}")]
    Transport(#[from] io::Error),
    #[error("relay protocol violation: {0}")]
    Protocol(String),
    #[error("no acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("no live connection")]
    NotConnected,
    #[error("event could not be encoded: {0}")]
    Encode(#[from] CodecError),
    #[error("event of {size} bytes exceeds the {max} byte frame limit")]
    Oversized { size: usize, max: usize },
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] EventError),
    #[error("collector rejected event {id}: {reason}")]
    Rejected { id: String, reason: String },
    /// The collector stored the event but changed it, e.g. an unknown level.
    #[error("collector accepted event {id} with note: {note}")]
    AcceptedWithNote { id: String, note: String },
    #[error("giving up after {attempts} attempts: next wait {wait:?} exceeds the {ceiling:?} ceiling")]
    RetryExhausted {
        attempts: u32,
        wait: Duration,
        ceiling: Duration,
    },
    #[error("relay client queue is full")]
    QueueFull,
    #[error("relay client is closed")]
    Closed,
    #[error("unknown relay address {0}")]
    UnknownAddress(String),
    #[error(transparent)]
    Build(#[from] BuildError),
}

impl RelayError {
    /// Whether the failure is transient and the event should be re-sent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::Connect { .. }
                | RelayError::Transport(_)
                | RelayError::Protocol(_)
                | RelayError::AckTimeout(_)
                | RelayError::NotConnected
        )
    }
}

impl Severity for RelayError {
    fn severity(&self) -> log::Level {
        match self {
            RelayError::RetryExhausted { .. }
            | RelayError::Build(_)
            | RelayError::UnknownAddress(_) => log::Level::Error,
            _ => log::Level::Warn,
        }
    }
}

/// Failures while reading a reply frame leave the stream unusable.
impl From<FrameError> for RelayError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => RelayError::Transport(err),
            other => RelayError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RelayError::Transport(io::ErrorKind::BrokenPipe.into()), true)]
    #[case(RelayError::AckTimeout(Duration::from_secs(1)), true)]
    #[case(RelayError::Protocol("ack id mismatch".into()), true)]
    #[case(RelayError::Rejected { id: "1".into(), reason: "no".into() }, false)]
    #[case(RelayError::Oversized { size: 10, max: 5 }, false)]
    #[case(RelayError::AcceptedWithNote { id: "1".into(), note: "level 7".into() }, false)]
    #[case(RelayError::Closed, false)]
    fn classifies_retryable_errors(#[case] err: RelayError, #[case] retryable: bool) {
        assert_eq!(err.is_retryable(), retryable, "{err}");
    }

    #[rstest]
    fn frame_io_errors_become_transport_errors() {
        let err = RelayError::from(FrameError::Io(io::ErrorKind::UnexpectedEof.into()));
        assert!(matches!(err, RelayError::Transport(_)));
        let err = RelayError::from(FrameError::Truncated);
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
