use std::io;

use log::Level;
use thiserror::Error;

use crate::builder::BuildError;
use crate::sink::SinkError;
use crate::supervisor::Severity;
use crate::wire::DecodeError;

/// Errors raised by a relay server.
///
/// Start-up failures are returned to the caller. Everything after start-up
/// goes to the server's error channel and never ends a stream.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] BuildError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to load TLS identity: {0}")]
    Tls(#[source] io::Error),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("malformed message from {peer}: {source}")]
    Decode {
        peer: String,
        #[source]
        source: DecodeError,
    },
    #[error("invalid event {id} from {peer}: {reason}")]
    InvalidEvent {
        peer: String,
        id: String,
        reason: String,
    },
    #[error("sink failed to write event {id} from {peer}: {source}")]
    Sink {
        peer: String,
        id: String,
        #[source]
        source: SinkError,
    },
}

impl Severity for ServerError {
    fn severity(&self) -> Level {
        match self {
            ServerError::Accept(_) | ServerError::Sink { .. } => Level::Error,
            _ => Level::Warn,
        }
    }
}
