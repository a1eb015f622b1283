//! Formatters turning events into bytes at the sink boundary.

use std::{fmt, sync::Arc};

use chrono::SecondsFormat;
use serde::Serialize;

use crate::event::{FemtoEvent, Field};

/// Trait for formatting events into strings.
///
/// Implementors must be thread-safe (`Send + Sync`) so formatters can be
/// shared across server connection threads.
pub trait EventFormatter: Send + Sync {
    /// Format an event into a single line (without the trailing newline).
    fn format(&self, event: &FemtoEvent) -> String;
}

/// Shared formatter trait object used across sinks.
#[derive(Clone)]
pub struct SharedFormatter {
    inner: Arc<dyn EventFormatter>,
}

impl SharedFormatter {
    pub fn new<F>(formatter: F) -> Self
    where
        F: EventFormatter + 'static,
    {
        Self {
            inner: Arc::new(formatter),
        }
    }

    pub fn format(&self, event: &FemtoEvent) -> String {
        self.inner.format(event)
    }
}

impl Default for SharedFormatter {
    fn default() -> Self {
        Self::new(TextFormatter)
    }
}

impl fmt::Debug for SharedFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedFormatter(<dyn EventFormatter>)")
    }
}

/// Human readable single-line text, matching the event's `Display` impl.
#[derive(Copy, Clone, Debug, Default)]
pub struct TextFormatter;

impl EventFormatter for TextFormatter {
    fn format(&self, event: &FemtoEvent) -> String {
        event.to_string()
    }
}

/// One JSON object per event.
#[derive(Copy, Clone, Debug, Default)]
pub struct JsonFormatter;

#[derive(Serialize)]
struct JsonEvent<'a> {
    timestamp: String,
    level: &'a str,
    prefix: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
    message: &'a str,
    #[serde(skip_serializing_if = "no_metadata")]
    metadata: &'a Field,
}

fn no_metadata(metadata: &&Field) -> bool {
    metadata.is_empty()
}

impl EventFormatter for JsonFormatter {
    fn format(&self, event: &FemtoEvent) -> String {
        let view = JsonEvent {
            timestamp: event
                .timestamp_or_now()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            level: event.level.as_str(),
            prefix: &event.prefix,
            sub: event.sub.as_deref(),
            message: &event.message,
            metadata: &event.metadata,
        };
        // Serialising string keys and JSON values cannot fail; fall back to
        // the text form rather than dropping the event if it ever does.
        serde_json::to_string(&view).unwrap_or_else(|_| event.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::FemtoLevel;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use serde_json::{Value, json};

    fn sample() -> FemtoEvent {
        FemtoEvent::builder()
            .timestamp(Utc.with_ymd_and_hms(2023, 3, 4, 5, 6, 7).unwrap())
            .prefix("api")
            .level(FemtoLevel::Error)
            .message("boom")
            .field("code", json!(500))
            .build()
            .expect("valid event")
    }

    #[rstest]
    fn json_formatter_emits_object() {
        let line = JsonFormatter.format(&sample());
        let value: Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(value["level"], "error");
        assert_eq!(value["prefix"], "api");
        assert_eq!(value["message"], "boom");
        assert_eq!(value["metadata"]["code"], 500);
        assert_eq!(value["timestamp"], "2023-03-04T05:06:07.000Z");
        assert!(value.get("sub").is_none());
    }

    #[rstest]
    fn shared_formatter_delegates() {
        let shared = SharedFormatter::new(TextFormatter);
        assert_eq!(shared.format(&sample()), sample().to_string());
    }
}
