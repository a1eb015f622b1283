//! Public relay client handle.

use std::{sync::Arc, thread, time::Duration};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    backoff::{BackoffController, RetryKind},
    builder::BuildError,
    cancel::CancellationToken,
    event::FemtoEvent,
    rate_limited_warner::RateLimitedWarner,
    supervisor::spawn_supervisor,
    wire::Mode,
};

use super::{
    LinkState, RelayClientBuilder, RelayClientConfig, RelayError, ShutdownReport,
    status::LinkStatus,
    worker::{RelayCommand, request, spawn_worker, wake},
};

/// Client streaming events to one relay server.
///
/// Submission never blocks on the network. Events join the backoff
/// controller's pending queue and a worker thread that owns the connection
/// delivers them in order, replaying the queue once an outage ends.
pub struct FemtoRelayClient {
    address: String,
    tx: Option<Sender<RelayCommand>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    supervisor: Mutex<Option<thread::JoinHandle<()>>>,
    controller: BackoffController,
    status: Arc<LinkStatus>,
    token: CancellationToken,
    warner: RateLimitedWarner,
    buffering: RateLimitedWarner,
    capacity: usize,
    flush_timeout: Duration,
}

impl FemtoRelayClient {
    pub fn builder() -> RelayClientBuilder {
        RelayClientBuilder::new()
    }

    /// Start a client for `address` with default configuration.
    pub fn connect(address: impl Into<String>) -> Result<Self, BuildError> {
        RelayClientBuilder::new().with_address(address).build()
    }

    /// Start the client from a configuration object.
    pub fn with_config(config: RelayClientConfig) -> Self {
        let address = config.address.clone();
        let controller = match config.rng_seed {
            Some(seed) => BackoffController::with_rng(
                config.backoff.clone(),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => BackoffController::new(config.backoff.clone()),
        };
        let (errors, supervisor) = match config.error_sink.clone() {
            Some(errors) => (errors, None),
            None => {
                let (tx, rx) = unbounded();
                let handle = spawn_supervisor(format!("relay client for {address}"), rx);
                (tx, Some(handle))
            }
        };
        let kind = match config.mode {
            Mode::Stream => RetryKind::Reconnect,
            Mode::Unary => RetryKind::Flush,
        };
        controller.register(kind, errors);

        let status = Arc::new(LinkStatus::default());
        let token = CancellationToken::new();
        let warner = RateLimitedWarner::new(config.warn_interval);
        let buffering = RateLimitedWarner::new(config.warn_interval);
        let capacity = config.capacity;
        let flush_timeout = config
            .connect_timeout
            .saturating_add(config.ack_timeout)
            .saturating_add(config.write_timeout);
        let (tx, worker) = spawn_worker(config, controller.clone(), status.clone(), token.clone());
        Self {
            address,
            tx: Some(tx),
            worker: Mutex::new(Some(worker)),
            supervisor: Mutex::new(supervisor),
            controller,
            status,
            token,
            warner,
            buffering,
            capacity,
            flush_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queue an event for delivery.
    ///
    /// Unset timestamps are stamped now, so replays keep the original time.
    /// While streaming, at most `capacity` events may wait and further
    /// submissions fail with [`RelayError::QueueFull`]. Otherwise events are
    /// buffered without limit until the link returns or the client closes.
    pub fn submit(&self, mut event: FemtoEvent) -> Result<(), RelayError> {
        event.validate()?;
        event.stamp();
        let Some(tx) = self.tx.as_ref() else {
            self.warner.record_drop();
            self.warner.warn_if_due(|count| {
                log::warn!(
                    "relay client for {} dropped {count} events after shutdown",
                    self.address
                );
            });
            return Err(RelayError::Closed);
        };
        let streaming = self.state() == LinkState::Streaming;
        if streaming && self.controller.pending_len() >= self.capacity {
            self.warner.record_drop();
            self.warner.warn_if_due(|count| {
                log::warn!(
                    "relay client for {} queue full; dropped {count} events",
                    self.address
                );
            });
            return Err(RelayError::QueueFull);
        }
        self.controller.add_message(event);
        if !streaming {
            self.warn_buffering();
        }
        wake(tx)
    }

    fn warn_buffering(&self) {
        self.buffering.record_drop();
        self.buffering.warn_if_due(|count| {
            log::warn!(
                "relay client for {} is not streaming; buffered {count} events, {} pending",
                self.address,
                self.controller.pending_len()
            );
        });
    }

    /// Deliver queued events now if the link allows it.
    ///
    /// Returns `true` when nothing remains pending afterwards.
    pub fn flush(&self) -> bool {
        let Some(flusher) = self.flusher() else {
            return false;
        };
        self.warner.flush(|count| {
            log::warn!(
                "relay client for {} dropped {count} events in the last interval",
                self.address
            );
        });
        flusher.flush()
    }

    /// Flush request that does not borrow the client.
    pub(crate) fn flusher(&self) -> Option<Flusher> {
        self.tx.as_ref().map(|tx| Flusher {
            tx: tx.clone(),
            timeout: self.flush_timeout,
        })
    }

    /// Reset backoff and resume automatic retries, e.g. after exhaustion.
    pub fn retry(&self) -> Result<(), RelayError> {
        let tx = self.tx.as_ref().ok_or(RelayError::Closed)?;
        tx.send_timeout(RelayCommand::Retry, self.flush_timeout)
            .map_err(|_| RelayError::Closed)
    }

    pub fn state(&self) -> LinkState {
        self.status.state()
    }

    /// Events acknowledged by the server.
    pub fn delivered(&self) -> u64 {
        self.status.delivered()
    }

    /// Events the server refused.
    pub fn rejected(&self) -> u64 {
        self.status.rejected()
    }

    /// Events waiting for delivery or acknowledgement.
    pub fn pending(&self) -> usize {
        self.controller.pending_len()
    }

    pub fn backoff(&self) -> &BackoffController {
        &self.controller
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Stop the worker after a final delivery attempt.
    ///
    /// Events that could not be delivered are returned rather than dropped.
    /// Closing twice returns an empty report.
    pub fn close(&mut self) -> ShutdownReport {
        let Some(tx) = self.tx.take() else {
            return ShutdownReport::default();
        };
        self.token.cancel();
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let report = if tx.send(RelayCommand::Shutdown(reply_tx)).is_ok() {
            reply_rx.recv().ok()
        } else {
            None
        };
        self.join_worker();
        let report = report.unwrap_or_else(|| ShutdownReport {
            undelivered: self.controller.take_pending(),
        });
        self.controller.unregister();
        self.join_supervisor();
        report
    }

    fn join_worker(&mut self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.join().is_err() {
            log::warn!("relay client for {}: worker thread panicked", self.address);
        }
    }

    fn join_supervisor(&mut self) {
        let Some(handle) = self.supervisor.lock().take() else {
            return;
        };
        if handle.join().is_err() {
            log::warn!("relay client for {}: supervisor thread panicked", self.address);
        }
    }
}

/// Detached flush request for a client, bounded by its flush timeout.
pub(crate) struct Flusher {
    tx: Sender<RelayCommand>,
    timeout: Duration,
}

impl Flusher {
    pub(crate) fn flush(&self) -> bool {
        request(&self.tx, RelayCommand::Flush, self.timeout)
    }
}

impl Drop for FemtoRelayClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FemtoRelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FemtoRelayClient")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
