//! Bridge from the `log` facade to relay writers.
//!
//! [`RelayLogAdapter`] implements `log::Log`, turning each record into a
//! [`FemtoEvent`] and handing it to an [`EventWriter`]. Records emitted by
//! this crate are skipped so relay diagnostics never feed back into the relay.

use std::sync::Arc;

use log::{LevelFilter, Metadata, Record, SetLoggerError};
use serde_json::Value;

use crate::event::{DEFAULT_PREFIX, FemtoEvent};
use crate::level::FemtoLevel;
use crate::rate_limited_warner::RateLimitedWarner;
use crate::writer::EventWriter;

const OWN_TARGET: &str = "femtorelay";

/// `log::Log` implementation forwarding records to an [`EventWriter`].
pub struct RelayLogAdapter {
    writer: Arc<dyn EventWriter>,
    prefix: String,
    max_level: LevelFilter,
    failures: RateLimitedWarner,
}

impl RelayLogAdapter {
    pub fn new(writer: Arc<dyn EventWriter>) -> Self {
        Self {
            writer,
            prefix: DEFAULT_PREFIX.to_owned(),
            max_level: LevelFilter::Trace,
            failures: RateLimitedWarner::default(),
        }
    }

    /// Prefix stamped on every forwarded event.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_level(mut self, level: LevelFilter) -> Self {
        self.max_level = level;
        self
    }

    /// Install as the process-wide logger.
    ///
    /// Fails when another logger is already installed.
    pub fn install(self) -> Result<(), SetLoggerError> {
        let max_level = self.max_level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Convert a record, using its target as the event's sub-system.
    pub fn to_event(&self, record: &Record<'_>) -> FemtoEvent {
        let mut event = FemtoEvent::new(FemtoLevel::from(record.level()), record.args().to_string());
        event.prefix.clone_from(&self.prefix);
        event.sub = Some(record.target().replace("::", "."));
        if let Some(module) = record.module_path() {
            event.metadata.insert("module".into(), Value::from(module));
        }
        if let Some(file) = record.file() {
            event.metadata.insert("file".into(), Value::from(file));
        }
        if let Some(line) = record.line() {
            event.metadata.insert("line".into(), Value::from(line));
        }
        event.stamp();
        event
    }
}

fn is_own_target(target: &str) -> bool {
    target == OWN_TARGET
        || target
            .strip_prefix(OWN_TARGET)
            .is_some_and(|rest| rest.starts_with("::"))
}

impl log::Log for RelayLogAdapter {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level && !is_own_target(metadata.target())
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let event = self.to_event(record);
        if event.message.is_empty() {
            return;
        }
        if self.writer.write(&event).is_err() {
            self.failures.record_drop();
            self.failures.warn_if_due(|count| {
                eprintln!("femtorelay: log adapter failed to forward {count} records");
            });
        }
    }

    fn flush(&self) {
        self.writer.flush();
    }
}

impl std::fmt::Debug for RelayLogAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLogAdapter")
            .field("prefix", &self.prefix)
            .field("max_level", &self.max_level)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::writer::LocalWriter;
    use log::Log;
    use rstest::rstest;
    use serial_test::serial;

    fn adapter(memory: &MemorySink) -> RelayLogAdapter {
        RelayLogAdapter::new(Arc::new(LocalWriter::new(Arc::new(memory.clone()))))
            .with_prefix("app")
            .with_max_level(LevelFilter::Info)
    }

    #[rstest]
    fn converts_records_with_location() {
        let memory = MemorySink::new();
        let adapter = adapter(&memory);
        adapter.log(
            &Record::builder()
                .args(format_args!("disk at {}%", 91))
                .level(log::Level::Warn)
                .target("app::storage")
                .module_path_static(Some("app::storage"))
                .file_static(Some("src/storage.rs"))
                .line(Some(42))
                .build(),
        );
        let events = memory.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.message, "disk at 91%");
        assert_eq!(event.level, FemtoLevel::Warn);
        assert_eq!(event.prefix, "app");
        assert_eq!(event.sub.as_deref(), Some("app.storage"));
        assert_eq!(event.metadata["line"], Value::from(42));
        assert!(event.timestamp.is_some());
    }

    #[rstest]
    #[case("femtorelay", false)]
    #[case("femtorelay::client", false)]
    #[case("femtorelay_app", true)]
    #[case("app", true)]
    fn skips_own_records(#[case] target: &str, #[case] forwarded: bool) {
        let memory = MemorySink::new();
        let adapter = adapter(&memory);
        adapter.log(
            &Record::builder()
                .args(format_args!("hello"))
                .level(log::Level::Error)
                .target(target)
                .build(),
        );
        assert_eq!(memory.len() == 1, forwarded);
    }

    #[rstest]
    fn respects_max_level() {
        let memory = MemorySink::new();
        let adapter = adapter(&memory);
        adapter.log(
            &Record::builder()
                .args(format_args!("noise"))
                .level(log::Level::Debug)
                .target("app")
                .build(),
        );
        assert!(memory.is_empty());
    }

    #[rstest]
    #[serial]
    fn install_routes_the_log_facade() {
        let memory = MemorySink::new();
        if adapter(&memory).install().is_err() {
            // Another test binary already owns the global logger.
            return;
        }
        log::info!(target: "app", "through the facade");
        log::info!("from inside the crate");
        assert_eq!(memory.messages(), vec!["through the facade"]);
    }
}
