//! Structured log events relayed to remote collectors.
//!
//! Applications build [`FemtoEvent`]s and submit them to a
//! [`FemtoRelayClient`], which streams them to a [`FemtoRelayServer`] over
//! TCP or TLS. While the server is unreachable the client buffers events and
//! retries with jittered exponential backoff, replaying the buffer in order
//! once the stream is back. The server acknowledges every event after writing
//! it to its local [`EventSink`].
//!
//! Several collectors can be fed at once through a [`ConnectionRegistry`] and
//! the [`EventWriter`] implementations built on it. [`RelayLogAdapter`]
//! connects the `log` facade to any writer.

pub mod backoff;
pub mod builder;
pub mod cancel;
pub mod client;
pub mod config;
pub mod event;
pub mod formatter;
pub mod level;
pub mod log_compat;
pub mod rate_limited_warner;
pub mod registry;
pub mod server;
pub mod sink;
pub mod supervisor;
pub mod transport;
pub mod wire;
pub mod writer;

pub use backoff::{BackoffController, BackoffError, BackoffPolicy, RetryAction, RetryKind};
pub use builder::BuildError;
pub use cancel::CancellationToken;
pub use client::{
    BackoffOverrides, FemtoRelayClient, LinkState, RelayClientBuilder, RelayClientConfig,
    RelayError, ShutdownReport,
};
pub use config::{ConfigError, RelayConfig};
pub use event::{EventBuilder, EventError, FemtoEvent, Field};
pub use formatter::{EventFormatter, JsonFormatter, SharedFormatter, TextFormatter};
pub use level::{FemtoLevel, LevelError};
pub use log_compat::RelayLogAdapter;
pub use registry::{ConnectionRegistry, HandleStatus, RouteReport};
pub use server::{
    FemtoRelayServer, RelayServerBuilder, RelayServerConfig, ServerError, ServerHandle,
};
pub use sink::{EventSink, MemorySink, MultiSink, NullSink, SinkError, WriterSink};
pub use transport::{TlsIdentity, TlsOptions};
pub use wire::{CodecKind, Mode};
pub use writer::{AddressedWriter, DirectWriter, EventWriter, LocalWriter, MultiWriter, WriteError};
