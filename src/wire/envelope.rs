//! Request and acknowledgement envelopes.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::event::{DEFAULT_PREFIX, EventError, FemtoEvent, Field};
use crate::level::{FemtoLevel, LevelError};

/// Event as it travels on the wire.
///
/// The level is kept as a raw integer so unknown values reach the decoder and
/// can be reported instead of failing the whole message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(default)]
    pub time_ns: Option<i64>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub level: Option<i32>,
    pub msg: String,
    #[serde(default)]
    pub meta: Option<Field>,
}

/// Result of turning a [`WireEvent`] back into a [`FemtoEvent`].
#[derive(Clone, Debug, PartialEq)]
pub struct Converted {
    pub event: FemtoEvent,
    /// Set when the level was unknown and the event was recorded as `info`.
    pub level_error: Option<LevelError>,
}

impl From<&FemtoEvent> for WireEvent {
    fn from(event: &FemtoEvent) -> Self {
        Self {
            time_ns: event.timestamp_or_now().timestamp_nanos_opt(),
            prefix: Some(event.prefix.clone()),
            sub: event.sub.clone(),
            level: Some(event.level.as_i32()),
            msg: event.message.clone(),
            meta: (!event.metadata.is_empty()).then(|| event.metadata.clone()),
        }
    }
}

fn datetime_from_nanos(ns: i64) -> Option<DateTime<Utc>> {
    const NANOS_PER_SEC: i64 = 1_000_000_000;
    let secs = ns.div_euclid(NANOS_PER_SEC);
    let nanos = u32::try_from(ns.rem_euclid(NANOS_PER_SEC)).ok()?;
    DateTime::from_timestamp(secs, nanos)
}

impl WireEvent {
    /// Rebuild the event, applying field defaults.
    ///
    /// An empty message is an error. An unknown level is not: the event is
    /// recorded as `info` and the problem is returned alongside it.
    pub fn into_event(self) -> Result<Converted, EventError> {
        if self.msg.is_empty() {
            return Err(EventError::MissingMessage);
        }
        let (level, level_error) = match self.level.map(FemtoLevel::try_from) {
            None => (FemtoLevel::Info, None),
            Some(Ok(level)) => (level, None),
            Some(Err(err)) => (FemtoLevel::Info, Some(err)),
        };
        let event = FemtoEvent {
            timestamp: Some(
                self.time_ns
                    .and_then(datetime_from_nanos)
                    .unwrap_or_else(Utc::now),
            ),
            prefix: self
                .prefix
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_PREFIX.to_owned()),
            sub: self.sub.filter(|s| !s.is_empty()),
            level,
            message: self.msg,
            metadata: self.meta.unwrap_or_default(),
        };
        Ok(Converted { event, level_error })
    }
}

/// One client-to-server message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id echoed back in the acknowledgement.
    pub id: String,
    pub event: WireEvent,
}

impl Request {
    pub fn new(id: impl Into<String>, event: &FemtoEvent) -> Self {
        Self {
            id: id.into(),
            event: WireEvent::from(event),
        }
    }
}

/// Server response to a single request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Correlation id of the request; empty when the request was unreadable.
    pub id: String,
    pub ok: bool,
    /// Bytes written by the server's sink.
    pub bytes: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl Acknowledgement {
    pub fn accepted(id: impl Into<String>, bytes: usize) -> Self {
        Self {
            id: id.into(),
            ok: true,
            bytes: u64::try_from(bytes).unwrap_or(u64::MAX),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            bytes: 0,
            error: Some(error.into()),
        }
    }

    /// Attach a non-fatal note to an accepted acknowledgement.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.error = Some(note.into());
        self
    }
}

/// Generate a random 128-bit correlation id rendered as hex.
pub fn new_request_id(rng: &mut impl Rng) -> String {
    format!("{:032x}", rng.r#gen::<u128>())
}
