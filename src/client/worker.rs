//! Worker thread driving relay I/O.

use std::{
    io::{self, Write},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    backoff::{BackoffController, BackoffError, RetryTarget},
    cancel::CancellationToken,
    event::FemtoEvent,
    transport::{RelayStream, connect},
    wire::{
        Acknowledgement, FrameError, FramePoll, FrameReader, Mode, Preamble, Request, done_frame,
        encode_frame, new_request_id,
    },
};

use super::{LinkState, RelayClientConfig, RelayError, ShutdownReport, status::LinkStatus};

/// Pause before polling again when another caller holds the retry lock.
const LOCKED_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Commands processed by the worker thread.
#[derive(Debug)]
pub(crate) enum RelayCommand {
    /// New events are pending in the backoff controller.
    Wake,
    /// Deliver what can be delivered now; replies whether nothing is pending.
    Flush(Sender<bool>),
    /// Restart automatic retries after exhaustion.
    Retry,
    Shutdown(Sender<ShutdownReport>),
}

pub(crate) fn spawn_worker(
    config: RelayClientConfig,
    controller: BackoffController,
    status: Arc<LinkStatus>,
    token: CancellationToken,
) -> (Sender<RelayCommand>, thread::JoinHandle<()>) {
    let (tx, rx) = bounded(config.capacity);
    let worker = Worker::new(rx, config, controller, status, token);
    let handle = thread::spawn(move || worker.run());
    (tx, handle)
}

/// Connection to one collector, driven by retry actions.
struct Link {
    config: RelayClientConfig,
    connection: Option<RelayStream>,
    reader: FrameReader,
    rng: StdRng,
    status: Arc<LinkStatus>,
    /// Receives notes attached to accepted events.
    notes: BackoffController,
}

impl Link {
    fn is_ready(&self) -> bool {
        match self.config.mode {
            Mode::Stream => self.connection.is_some(),
            Mode::Unary => true,
        }
    }

    fn open(&self, mode: Mode) -> Result<RelayStream, RelayError> {
        let address = &self.config.address;
        let mut stream = connect(address, self.config.tls.as_ref(), self.config.connect_timeout)
            .map_err(|source| RelayError::Connect {
                address: address.clone(),
                source,
            })?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        stream.write_all(&Preamble::new(mode).encode())?;
        stream.flush()?;
        Ok(stream)
    }

    /// Drop the connection, telling the server we are done when `graceful`.
    fn disconnect(&mut self, graceful: bool) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };
        if graceful {
            let sent = conn.write_all(&done_frame()).and_then(|()| conn.flush());
            if let Err(err) = sent {
                debug!("relay client could not send done frame: {err}");
            }
        }
        if let Err(err) = conn.shutdown() {
            debug!("relay client socket shutdown failed: {err}");
        }
    }

    fn request_frame(&mut self, event: &FemtoEvent) -> Result<(String, Vec<u8>), RelayError> {
        let id = new_request_id(&mut self.rng);
        let payload = self.config.codec.encode(&Request::new(id.clone(), event))?;
        let frame = encode_frame(&payload, self.config.max_frame_size).map_err(|err| match err {
            FrameError::TooLarge { size, max } => RelayError::Oversized { size, max },
            other => RelayError::Protocol(other.to_string()),
        })?;
        Ok((id, frame))
    }

    /// Write one request frame and wait for its acknowledgement.
    fn exchange(
        config: &RelayClientConfig,
        stream: &mut RelayStream,
        reader: &mut FrameReader,
        frame: &[u8],
        id: &str,
    ) -> Result<Acknowledgement, RelayError> {
        stream.write_all(frame)?;
        stream.flush()?;
        stream.set_read_timeout(Some(config.ack_timeout))?;
        let deadline = Instant::now() + config.ack_timeout;
        let payload = loop {
            match reader.poll(stream)? {
                FramePoll::Frame(payload) => break payload,
                FramePoll::Pending if Instant::now() < deadline => {}
                FramePoll::Pending => return Err(RelayError::AckTimeout(config.ack_timeout)),
                FramePoll::Done | FramePoll::Eof => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the stream before acknowledging",
                    )
                    .into());
                }
            }
        };
        let ack: Acknowledgement = config
            .codec
            .decode(&payload)
            .map_err(|err| RelayError::Protocol(err.to_string()))?;
        if !ack.ok {
            return Err(RelayError::Rejected {
                id: id.to_owned(),
                reason: ack.error.unwrap_or_default(),
            });
        }
        if ack.id != id {
            return Err(RelayError::Protocol(format!(
                "acknowledgement for {} while waiting for {id}",
                ack.id
            )));
        }
        Ok(ack)
    }
}

impl RetryTarget for Link {
    fn reconnect(&mut self) -> Result<(), RelayError> {
        self.disconnect(false);
        if self.config.mode == Mode::Unary {
            return Ok(());
        }
        self.status.set_state(LinkState::Connecting);
        let stream = self.open(Mode::Stream)?;
        self.reader = FrameReader::new(self.config.max_frame_size);
        self.connection = Some(stream);
        self.status.set_state(LinkState::Streaming);
        info!("relay client connected to {}", self.config.address);
        Ok(())
    }

    fn deliver(&mut self, event: &FemtoEvent) -> Result<(), RelayError> {
        let (id, frame) = self.request_frame(event)?;
        let result = match self.config.mode {
            Mode::Stream => {
                let stream = self.connection.as_mut().ok_or(RelayError::NotConnected)?;
                Self::exchange(&self.config, stream, &mut self.reader, &frame, &id)
            }
            Mode::Unary => {
                let mut stream = self.open(Mode::Unary)?;
                let mut reader = FrameReader::new(self.config.max_frame_size);
                let result = Self::exchange(&self.config, &mut stream, &mut reader, &frame, &id);
                if let Err(err) = stream.shutdown() {
                    debug!("relay client socket shutdown failed: {err}");
                }
                result
            }
        };
        match result {
            Ok(ack) => {
                if let Some(note) = ack.error {
                    self.notes.report(RelayError::AcceptedWithNote { id, note });
                }
                self.status.record_delivered();
                self.status.set_state(LinkState::Streaming);
                Ok(())
            }
            Err(err) => {
                if matches!(err, RelayError::Rejected { .. }) {
                    self.status.record_rejected();
                }
                Err(err)
            }
        }
    }
}

struct Worker {
    rx: Receiver<RelayCommand>,
    controller: BackoffController,
    token: CancellationToken,
    link: Link,
    /// Delivery waits for the next backoff-driven retry action.
    needs_retry: bool,
    exhausted: bool,
}

impl Worker {
    fn new(
        rx: Receiver<RelayCommand>,
        config: RelayClientConfig,
        controller: BackoffController,
        status: Arc<LinkStatus>,
        token: CancellationToken,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let needs_retry = config.mode == Mode::Stream;
        Self {
            rx,
            link: Link {
                reader: FrameReader::new(config.max_frame_size),
                config,
                connection: None,
                rng,
                status,
                notes: controller.clone(),
            },
            controller,
            token,
            needs_retry,
            exhausted: false,
        }
    }

    fn address(&self) -> &str {
        &self.link.config.address
    }

    fn retry_due(&self) -> bool {
        self.needs_retry && !self.exhausted && !self.token.is_cancelled()
    }

    fn run(mut self) {
        loop {
            let cmd = if self.retry_due() {
                match self.rx.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match self.rx.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                }
            };
            match cmd {
                Some(RelayCommand::Wake) => self.pump(),
                Some(RelayCommand::Flush(ack)) => {
                    self.pump();
                    let drained = self.controller.pending_len() == 0;
                    let flushed = self.link.connection.as_mut().is_none_or(|c| c.flush().is_ok());
                    let _ = ack.send(drained && flushed);
                }
                Some(RelayCommand::Retry) => {
                    self.controller.reset();
                    self.exhausted = false;
                    self.needs_retry = !self.link.is_ready();
                    if self.needs_retry {
                        self.link.status.set_state(LinkState::Disconnected);
                    }
                    self.pump();
                }
                Some(RelayCommand::Shutdown(reply)) => {
                    let report = self.shutdown();
                    let _ = reply.send(report);
                    return;
                }
                None => self.retry(),
            }
        }
        self.shutdown();
    }

    /// Deliver pending events directly while the link is healthy.
    fn pump(&mut self) {
        if self.needs_retry || self.exhausted {
            return;
        }
        if let Err(err) = self.controller.replay_pending(&mut self.link) {
            self.on_failure(err);
        }
    }

    /// Transition to `Disconnected` after a retryable failure.
    fn on_failure(&mut self, err: RelayError) {
        warn!("relay client for {} disconnected: {err}", self.address());
        self.link.disconnect(false);
        self.link.status.set_state(LinkState::Disconnected);
        self.controller.increment();
        self.needs_retry = true;
    }

    fn retry(&mut self) {
        match self.controller.wait_and_get_retry_action(&self.token) {
            Ok(action) => match action.invoke(&mut self.link) {
                Ok(delivered) => {
                    self.needs_retry = false;
                    if delivered > 0 {
                        info!(
                            "relay client for {} flushed {delivered} buffered events",
                            self.address()
                        );
                    }
                }
                Err(err) => self.on_failure(err),
            },
            Err(BackoffError::RetryExhausted {
                attempts,
                wait,
                ceiling,
            }) => {
                self.exhausted = true;
                self.link.status.set_state(LinkState::Exhausted);
                warn!(
                    "relay client for {} stopped retrying with {} events pending",
                    self.address(),
                    self.controller.pending_len()
                );
                self.controller.report(RelayError::RetryExhausted {
                    attempts,
                    wait,
                    ceiling,
                });
            }
            Err(BackoffError::Cancelled(action)) => {
                debug!("relay client retry wait cancelled before {:?}", action.kind());
            }
            Err(BackoffError::Locked) => {
                self.token.wait_timeout(LOCKED_RETRY_PAUSE);
            }
            Err(err @ BackoffError::UnsupportedOperation) => {
                log::error!("relay client for {} cannot retry: {err}", self.address());
                self.exhausted = true;
                self.link.status.set_state(LinkState::Exhausted);
            }
        }
    }

    /// Final delivery attempt, then hand back whatever is left.
    fn shutdown(&mut self) -> ShutdownReport {
        self.token.cancel();
        if !self.exhausted && self.controller.pending_len() > 0 {
            if self.needs_retry {
                // The wait returns at once; run the action anyway as a last attempt.
                match self.controller.wait_and_get_retry_action(&self.token) {
                    Ok(action) | Err(BackoffError::Cancelled(action)) => {
                        if let Err(err) = action.invoke(&mut self.link) {
                            debug!("relay client final delivery attempt failed: {err}");
                        }
                    }
                    Err(err) => debug!("relay client skipped final delivery attempt: {err}"),
                }
            } else {
                self.pump();
            }
        }
        self.link.disconnect(true);
        self.link.status.set_state(LinkState::Closed);
        let undelivered = self.controller.take_pending();
        if !undelivered.is_empty() {
            warn!(
                "relay client for {} closed with {} undelivered events",
                self.address(),
                undelivered.len()
            );
        }
        ShutdownReport { undelivered }
    }
}

/// Tell the worker that events are pending without blocking.
///
/// A full channel already holds commands that make the worker deliver.
pub(crate) fn wake(tx: &Sender<RelayCommand>) -> Result<(), RelayError> {
    match tx.try_send(RelayCommand::Wake) {
        Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
        Err(TrySendError::Disconnected(_)) => Err(RelayError::Closed),
    }
}

pub(crate) fn request(
    tx: &Sender<RelayCommand>,
    make: impl FnOnce(Sender<bool>) -> RelayCommand,
    timeout: Duration,
) -> bool {
    let (ack_tx, ack_rx) = bounded(1);
    if tx.send_timeout(make(ack_tx), timeout).is_err() {
        return false;
    }
    ack_rx.recv_timeout(timeout).unwrap_or(false)
}
