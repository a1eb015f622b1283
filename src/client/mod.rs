//! Reconnecting relay client.
//!
//! [`FemtoRelayClient`] hands events to a worker thread which owns the
//! connection to one relay server. While the server is unreachable events
//! accumulate in the [`BackoffController`](crate::backoff::BackoffController)
//! pending queue and are replayed in submission order once a retry action
//! re-establishes the stream. Each event is written and then acknowledged
//! before the next one goes out, so an event is only dropped from the queue
//! once the server has confirmed or explicitly rejected it.

mod config;
mod error;
mod handle;
mod status;
mod worker;


pub use config::{
    BackoffOverrides, DEFAULT_ACK_TIMEOUT, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_WRITE_TIMEOUT, RelayClientBuilder, RelayClientConfig,
};
pub use error::RelayError;
pub use handle::FemtoRelayClient;
pub(crate) use handle::Flusher;
pub use status::{LinkState, ShutdownReport};
