//! Exponential backoff controller shared by a relay client and its worker.
//!
//! The controller owns the retry bookkeeping for one destination: how many
//! consecutive failures have occurred, how long to wait before the next
//! attempt, which retry action to run, and the events still awaiting
//! delivery. All state sits behind a single mutex that is never held while
//! sleeping or performing I/O.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::client::RelayError;
use crate::event::FemtoEvent;

/// Default maximum wait before retries are abandoned.
pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(30);
/// Default upper bound (exclusive) of the random jitter added to each wait.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);

/// Backoff tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Waits longer than this exhaust the retry cycle.
    pub ceiling: Duration,
    /// Jitter is drawn uniformly from `[0, max_jitter)`; zero disables it.
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_BACKOFF_CEILING,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

/// Which retry behaviour a controller runs once its wait elapses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryKind {
    /// Re-establish the stream, then replay pending events.
    Reconnect,
    /// Replay pending events without a persistent stream.
    Flush,
}

/// Errors returned by [`BackoffController::wait_and_get_retry_action`].
#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("a retry is already in progress")]
    Locked,
    #[error("retry wait of {wait:?} after {attempts} attempts exceeds the {ceiling:?} ceiling")]
    RetryExhausted {
        attempts: u32,
        wait: Duration,
        ceiling: Duration,
    },
    #[error("no retry action has been registered")]
    UnsupportedOperation,
    /// The wait was cut short. The computed action is handed back so the
    /// caller can still decide to run it.
    #[error("retry wait was cancelled")]
    Cancelled(RetryAction),
}

/// Destination that retry actions drive.
pub trait RetryTarget {
    /// Tear down any existing connection and establish a new one.
    fn reconnect(&mut self) -> Result<(), RelayError>;

    /// Deliver one event and wait for it to be confirmed.
    fn deliver(&mut self, event: &FemtoEvent) -> Result<(), RelayError>;
}

struct BackoffState {
    policy: BackoffPolicy,
    attempt_count: u32,
    current_wait: Duration,
    locked: bool,
    registration: Option<(RetryKind, Sender<RelayError>)>,
    pending: VecDeque<FemtoEvent>,
    rng: StdRng,
}

impl BackoffState {
    fn recompute_wait(&mut self) {
        let base_ms = 1u64.checked_shl(self.attempt_count).unwrap_or(u64::MAX);
        let jitter = if self.policy.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            self.rng.gen_range(Duration::ZERO..self.policy.max_jitter)
        };
        self.current_wait = Duration::from_millis(base_ms).saturating_add(jitter);
    }
}

/// Cloneable handle to one destination's backoff state.
#[derive(Clone)]
pub struct BackoffController {
    inner: Arc<Mutex<BackoffState>>,
}

impl BackoffController {
    /// Create a controller whose jitter is seeded from the OS.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// Create a controller drawing jitter from `rng`, for reproducible waits.
    pub fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BackoffState {
                policy,
                attempt_count: 0,
                current_wait: Duration::ZERO,
                locked: false,
                registration: None,
                pending: VecDeque::new(),
                rng,
            })),
        }
    }

    /// Record a failure and grow the wait. Ignored while a retry is in flight.
    pub fn increment(&self) {
        let mut state = self.inner.lock();
        if state.locked {
            return;
        }
        state.attempt_count = state.attempt_count.saturating_add(1);
        state.recompute_wait();
    }

    /// Forget past failures after a confirmed healthy connection.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        state.attempt_count = 0;
        state.current_wait = Duration::ZERO;
    }

    /// Bind the retry behaviour and the channel receiving terminal errors.
    pub fn register(&self, kind: RetryKind, errors: Sender<RelayError>) {
        self.inner.lock().registration = Some((kind, errors));
    }

    /// Drop the registered action and error channel.
    pub fn unregister(&self) {
        self.inner.lock().registration = None;
    }

    /// Wait out the current backoff and hand back the registered action.
    ///
    /// Fails immediately with [`BackoffError::Locked`] when another caller is
    /// already waiting, and with [`BackoffError::RetryExhausted`] without
    /// sleeping when the wait exceeds the ceiling. The lock is released on
    /// every return path.
    pub fn wait_and_get_retry_action(
        &self,
        token: &CancellationToken,
    ) -> Result<RetryAction, BackoffError> {
        let (wait, kind) = {
            let mut state = self.inner.lock();
            if state.locked {
                return Err(BackoffError::Locked);
            }
            let Some((kind, _)) = state.registration.as_ref() else {
                return Err(BackoffError::UnsupportedOperation);
            };
            let kind = *kind;
            if state.current_wait > state.policy.ceiling {
                return Err(BackoffError::RetryExhausted {
                    attempts: state.attempt_count,
                    wait: state.current_wait,
                    ceiling: state.policy.ceiling,
                });
            }
            state.locked = true;
            (state.current_wait, kind)
        };
        let _guard = RetryLock(self);
        let action = RetryAction::new(kind, self.clone());
        debug!("waiting {wait:?} before {kind:?} retry");
        if token.wait_timeout(wait) {
            return Err(BackoffError::Cancelled(action));
        }
        Ok(action)
    }

    /// Queue an event for delivery behind any already pending.
    pub fn add_message(&self, event: FemtoEvent) {
        self.inner.lock().pending.push_back(event);
    }

    /// Remove and return every pending event, oldest first.
    pub fn take_pending(&self) -> Vec<FemtoEvent> {
        self.inner.lock().pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Deliver pending events in order until the queue is empty.
    ///
    /// An event leaves the queue only once `target` confirms it or fails it
    /// with a non-retryable error; the latter is reported to the registered
    /// error channel. The first retryable failure stops the replay and is
    /// returned, leaving that event at the front.
    pub fn replay_pending(&self, target: &mut impl RetryTarget) -> Result<usize, RelayError> {
        let mut delivered = 0;
        while let Some(event) = self.front() {
            match target.deliver(&event) {
                Ok(()) => {
                    self.pop_front();
                    delivered += 1;
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    self.pop_front();
                    self.report(err);
                }
            }
        }
        Ok(delivered)
    }

    /// Send `err` to the registered error channel, or log it.
    pub fn report(&self, err: RelayError) {
        let sink = self
            .inner
            .lock()
            .registration
            .as_ref()
            .map(|(_, tx)| tx.clone());
        match sink {
            Some(tx) => {
                if let Err(unsent) = tx.send(err) {
                    error!("relay error with no listener: {}", unsent.into_inner());
                }
            }
            None => error!("relay error: {err}"),
        }
    }

    fn front(&self) -> Option<FemtoEvent> {
        self.inner.lock().pending.front().cloned()
    }

    fn pop_front(&self) {
        self.inner.lock().pending.pop_front();
    }

    pub fn attempt_count(&self) -> u32 {
        self.inner.lock().attempt_count
    }

    pub fn ceiling(&self) -> Duration {
        self.inner.lock().policy.ceiling
    }

    pub fn current_wait(&self) -> Duration {
        self.inner.lock().current_wait
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }
}

impl fmt::Debug for BackoffController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("BackoffController")
            .field("attempt_count", &state.attempt_count)
            .field("current_wait", &state.current_wait)
            .field("locked", &state.locked)
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Clears the `locked` flag when dropped.
struct RetryLock<'a>(&'a BackoffController);

impl Drop for RetryLock<'_> {
    fn drop(&mut self) {
        self.0.inner.lock().locked = false;
    }
}

/// Re-establish the stream, then replay.
#[derive(Debug)]
pub struct ReconnectAction {
    controller: BackoffController,
}

/// Replay pending events over whatever transport the target provides.
#[derive(Debug)]
pub struct FlushAction {
    controller: BackoffController,
}

/// Retry produced by a completed backoff wait.
#[derive(Debug)]
pub enum RetryAction {
    Reconnect(ReconnectAction),
    Flush(FlushAction),
}

impl RetryAction {
    fn new(kind: RetryKind, controller: BackoffController) -> Self {
        match kind {
            RetryKind::Reconnect => RetryAction::Reconnect(ReconnectAction { controller }),
            RetryKind::Flush => RetryAction::Flush(FlushAction { controller }),
        }
    }

    pub fn kind(&self) -> RetryKind {
        match self {
            RetryAction::Reconnect(_) => RetryKind::Reconnect,
            RetryAction::Flush(_) => RetryKind::Flush,
        }
    }

    /// Run the retry against `target`, returning how many events were
    /// delivered. Backoff is reset once every pending event went out.
    pub fn invoke(self, target: &mut impl RetryTarget) -> Result<usize, RelayError> {
        let (controller, delivered) = match self {
            RetryAction::Reconnect(ReconnectAction { controller }) => {
                target.reconnect()?;
                let delivered = controller.replay_pending(target)?;
                (controller, delivered)
            }
            RetryAction::Flush(FlushAction { controller }) => {
                let delivered = controller.replay_pending(target)?;
                (controller, delivered)
            }
        };
        controller.reset();
        Ok(delivered)
    }
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
