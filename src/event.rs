//! Event representation for the relay.
//!
//! [`FemtoEvent`] is the structured record that applications hand to a relay
//! client and that relay servers reconstruct before writing to their local
//! sink. Events are built with [`EventBuilder`], which enforces the one hard
//! requirement: a non-empty message.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::level::FemtoLevel;

/// Prefix applied when none is supplied.
pub const DEFAULT_PREFIX: &str = "log";

/// Structured metadata attached to an event.
pub type Field = BTreeMap<String, Value>;

/// Errors raised while constructing or validating an event.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event message must not be empty")]
    MissingMessage,
}

/// A single structured log record.
#[derive(Clone, Debug, PartialEq)]
pub struct FemtoEvent {
    /// Creation time. `None` means "stamp at send time".
    pub timestamp: Option<DateTime<Utc>>,
    pub prefix: String,
    pub sub: Option<String>,
    pub level: FemtoLevel,
    pub message: String,
    pub metadata: Field,
}

impl FemtoEvent {
    /// Construct an event with default prefix and no metadata.
    pub fn new(level: FemtoLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            prefix: DEFAULT_PREFIX.to_owned(),
            sub: None,
            level,
            message: message.into(),
            metadata: Field::new(),
        }
    }

    pub fn builder() -> EventBuilder {
        EventBuilder::new()
    }

    /// Check the invariants that must hold before transmission.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.message.is_empty() {
            return Err(EventError::MissingMessage);
        }
        Ok(())
    }

    /// Timestamp of the event, or the current time when it was never set.
    pub fn timestamp_or_now(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or_else(Utc::now)
    }

    /// Fill in the timestamp if the caller left it unset.
    pub fn stamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }
}

impl fmt::Display for FemtoEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] [{}]",
            self.timestamp_or_now()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level,
            self.prefix
        )?;
        if let Some(sub) = self.sub.as_deref().filter(|s| !s.is_empty()) {
            write!(f, " [{sub}]")?;
        }
        write!(f, " {}", self.message)?;
        if !self.metadata.is_empty() {
            let meta = serde_json::to_string(&self.metadata).map_err(|_| fmt::Error)?;
            write!(f, " {meta}")?;
        }
        Ok(())
    }
}

/// Fluent builder for [`FemtoEvent`].
#[derive(Clone, Debug, Default)]
pub struct EventBuilder {
    timestamp: Option<DateTime<Utc>>,
    prefix: Option<String>,
    sub: Option<String>,
    level: FemtoLevel,
    message: String,
    metadata: Field,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the prefix. An empty string restores the default.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.prefix = (!prefix.is_empty()).then_some(prefix);
        self
    }

    pub fn sub(mut self, sub: impl Into<String>) -> Self {
        let sub = sub.into();
        self.sub = (!sub.is_empty()).then_some(sub);
        self
    }

    pub fn level(mut self, level: FemtoLevel) -> Self {
        self.level = level;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Replace all metadata.
    pub fn metadata(mut self, metadata: Field) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a single metadata entry, replacing any previous value for `key`.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<FemtoEvent, EventError> {
        let event = FemtoEvent {
            timestamp: self.timestamp,
            prefix: self.prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_owned()),
            sub: self.sub,
            level: self.level,
            message: self.message,
            metadata: self.metadata,
        };
        event.validate()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    fn builder_applies_defaults() {
        let event = FemtoEvent::builder()
            .message("hello")
            .build()
            .expect("message is set");
        assert_eq!(event.prefix, DEFAULT_PREFIX);
        assert_eq!(event.level, FemtoLevel::Info);
        assert!(event.sub.is_none());
        assert!(event.timestamp.is_none());
    }

    #[rstest]
    fn builder_rejects_missing_message() {
        let err = FemtoEvent::builder()
            .level(FemtoLevel::Error)
            .build()
            .expect_err("message is required");
        assert_eq!(err, EventError::MissingMessage);
    }

    #[rstest]
    fn empty_prefix_restores_default() {
        let event = FemtoEvent::builder()
            .prefix("")
            .message("m")
            .build()
            .expect("valid event");
        assert_eq!(event.prefix, "log");
    }

    #[rstest]
    fn display_includes_scope_and_metadata() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let event = FemtoEvent::builder()
            .timestamp(ts)
            .prefix("svc")
            .sub("db")
            .level(FemtoLevel::Warn)
            .message("slow query")
            .field("ms", json!(1200))
            .build()
            .expect("valid event");
        assert_eq!(
            event.to_string(),
            r#"[2024-05-01T12:00:00.000Z] [warn] [svc] [db] slow query {"ms":1200}"#
        );
    }

    #[rstest]
    fn stamp_only_fills_missing_timestamp() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut event = FemtoEvent::new(FemtoLevel::Info, "x");
        event.timestamp = Some(ts);
        event.stamp();
        assert_eq!(event.timestamp, Some(ts));

        let mut unset = FemtoEvent::new(FemtoLevel::Info, "y");
        unset.stamp();
        assert!(unset.timestamp.is_some());
    }
}
