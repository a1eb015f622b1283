//! Relay server accepting event streams.
//!
//! Each accepted connection runs on its own thread. Handlers share only the
//! sink and the error channel, so a failing message or connection never
//! affects the others.

mod config;
mod connection;
mod error;
mod handle;

#[cfg(test)]
mod tests;

pub use config::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_SERVER_WRITE_TIMEOUT,
    RelayServerBuilder, RelayServerConfig,
};
pub use error::ServerError;
pub use handle::{FemtoRelayServer, ServerHandle};
