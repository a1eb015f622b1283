//! Destinations an application writes events to.
//!
//! [`EventWriter`] is the capability the log adapter and applications hold.
//! Implementations forward to a single relay client, to a set of addresses in
//! a [`ConnectionRegistry`], to a local sink, or to several writers at once.

use std::sync::Arc;

use thiserror::Error;

use crate::client::{FemtoRelayClient, RelayError};
use crate::event::FemtoEvent;
use crate::registry::ConnectionRegistry;
use crate::sink::{EventSink, SinkError};

/// Errors raised by an [`EventWriter`].
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("no destination accepted the event ({} failed)", .0.len())]
    AllFailed(Vec<(String, RelayError)>),
}

/// Accepts events on behalf of one or more destinations.
pub trait EventWriter: Send + Sync {
    fn write(&self, event: &FemtoEvent) -> Result<(), WriteError>;

    /// Push out anything buffered. Returns `true` when nothing is left.
    fn flush(&self) -> bool {
        true
    }
}

impl<W: EventWriter + ?Sized> EventWriter for Arc<W> {
    fn write(&self, event: &FemtoEvent) -> Result<(), WriteError> {
        (**self).write(event)
    }

    fn flush(&self) -> bool {
        (**self).flush()
    }
}

/// Writes to exactly one relay client.
#[derive(Debug, Clone)]
pub struct DirectWriter {
    client: Arc<FemtoRelayClient>,
}

impl DirectWriter {
    pub fn new(client: Arc<FemtoRelayClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &FemtoRelayClient {
        &self.client
    }
}

impl EventWriter for DirectWriter {
    fn write(&self, event: &FemtoEvent) -> Result<(), WriteError> {
        self.client.submit(event.clone())?;
        Ok(())
    }

    fn flush(&self) -> bool {
        self.client.flush()
    }
}

/// Routes every event to a fixed list of registry addresses.
///
/// Succeeds when at least one address accepted the event.
#[derive(Debug, Clone)]
pub struct AddressedWriter {
    registry: Arc<ConnectionRegistry>,
    addresses: Vec<String>,
}

impl AddressedWriter {
    /// Register each address and route to all of them.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        addresses: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, RelayError> {
        let addresses: Vec<String> = addresses.into_iter().map(Into::into).collect();
        for address in &addresses {
            registry.register(address)?;
        }
        Ok(Self {
            registry,
            addresses,
        })
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}

impl EventWriter for AddressedWriter {
    fn write(&self, event: &FemtoEvent) -> Result<(), WriteError> {
        let report = self.registry.route(event, &self.addresses);
        if report.all_failed() {
            return Err(WriteError::AllFailed(report.into_failures()));
        }
        for (address, err) in report.failures() {
            log::warn!("relay to {address} refused event: {err}");
        }
        Ok(())
    }

    fn flush(&self) -> bool {
        self.registry.flush_all()
    }
}

/// Writes straight to a local sink.
#[derive(Clone)]
pub struct LocalWriter {
    sink: Arc<dyn EventSink>,
}

impl LocalWriter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

impl EventWriter for LocalWriter {
    fn write(&self, event: &FemtoEvent) -> Result<(), WriteError> {
        self.sink.write_event(event)?;
        Ok(())
    }

    fn flush(&self) -> bool {
        self.sink.flush().is_ok()
    }
}

impl std::fmt::Debug for LocalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalWriter(<dyn EventSink>)")
    }
}

/// Writes to every child writer.
///
/// Every child is attempted; the first error is returned afterwards.
#[derive(Clone, Default)]
pub struct MultiWriter {
    writers: Vec<Arc<dyn EventWriter>>,
}

impl MultiWriter {
    pub fn new(writers: Vec<Arc<dyn EventWriter>>) -> Self {
        Self { writers }
    }

    pub fn push(&mut self, writer: Arc<dyn EventWriter>) {
        self.writers.push(writer);
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

impl EventWriter for MultiWriter {
    fn write(&self, event: &FemtoEvent) -> Result<(), WriteError> {
        let mut first_err = None;
        for writer in &self.writers {
            if let Err(err) = writer.write(event) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn flush(&self) -> bool {
        self.writers
            .iter()
            .fold(true, |all, writer| writer.flush() && all)
    }
}
