//! Local sinks that durably write events.
//!
//! A relay server forwards every decoded event to an [`EventSink`]. Sinks are
//! shared between connection threads, so implementations serialise their own
//! writes.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::event::FemtoEvent;
use crate::formatter::SharedFormatter;

/// Errors raised while writing an event to a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink write failed: {0}")]
    Io(#[from] io::Error),
    #[error("sink rejected event: {0}")]
    Rejected(String),
}

/// Capability accepting fully built events.
pub trait EventSink: Send + Sync {
    /// Write one event, returning the number of bytes produced.
    fn write_event(&self, event: &FemtoEvent) -> Result<usize, SinkError>;

    /// Flush any buffered output.
    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn write_event(&self, event: &FemtoEvent) -> Result<usize, SinkError> {
        (**self).write_event(event)
    }

    fn flush(&self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Formats events and writes them, one per line, to an `io::Write`.
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<W>,
    formatter: SharedFormatter,
}

impl WriterSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout(), SharedFormatter::default())
    }
}

impl WriterSink<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr(), SharedFormatter::default())
    }
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W, formatter: SharedFormatter) -> Self {
        Self {
            writer: Mutex::new(writer),
            formatter,
        }
    }

    /// Consume the sink and return the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> EventSink for WriterSink<W> {
    fn write_event(&self, event: &FemtoEvent) -> Result<usize, SinkError> {
        let mut line = self.formatter.format(event);
        line.push('\n');
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(line.len())
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

/// Fans an event out to several sinks.
///
/// Every child is attempted even when an earlier one fails; the first error
/// is returned afterwards.
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for MultiSink {
    fn write_event(&self, event: &FemtoEvent) -> Result<usize, SinkError> {
        let mut written = 0;
        let mut first_err = None;
        for sink in &self.sinks {
            match sink.write_event(event) {
                Ok(n) => written = written.max(n),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    fn flush(&self) -> Result<(), SinkError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.flush() {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Sink that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn write_event(&self, _event: &FemtoEvent) -> Result<usize, SinkError> {
        Ok(0)
    }
}

/// In-memory sink retaining every event it receives, in arrival order.
///
/// Handy for embedding a relay server in tests or for short-lived
/// collectors that inspect events programmatically.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<FemtoEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the collected events.
    pub fn events(&self) -> Vec<FemtoEvent> {
        self.events.lock().clone()
    }

    /// Messages of the collected events, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| event.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn write_event(&self, event: &FemtoEvent) -> Result<usize, SinkError> {
        self.events.lock().push(event.clone());
        Ok(event.message.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::TextFormatter;
    use crate::level::FemtoLevel;
    use rstest::rstest;

    struct FailingSink;

    impl EventSink for FailingSink {
        fn write_event(&self, _event: &FemtoEvent) -> Result<usize, SinkError> {
            Err(SinkError::Rejected("always fails".into()))
        }
    }

    #[rstest]
    fn writer_sink_appends_newline() {
        let sink = WriterSink::new(Vec::new(), SharedFormatter::new(TextFormatter));
        let event = FemtoEvent::new(FemtoLevel::Info, "hello");
        let written = sink.write_event(&event).expect("write succeeds");
        let output = String::from_utf8(sink.into_inner()).expect("utf8 output");
        assert_eq!(written, output.len());
        assert!(output.ends_with("hello\n"));
    }

    #[rstest]
    fn multi_sink_attempts_every_child() {
        let memory = MemorySink::new();
        let children: Vec<Arc<dyn EventSink>> =
            vec![Arc::new(FailingSink), Arc::new(memory.clone())];
        let sink = MultiSink::new(children);
        let err = sink
            .write_event(&FemtoEvent::new(FemtoLevel::Warn, "fan out"))
            .expect_err("first child fails");
        assert!(matches!(err, SinkError::Rejected(_)));
        assert_eq!(memory.messages(), vec!["fan out".to_string()]);
    }

    #[rstest]
    fn null_sink_reports_zero_bytes() {
        let written = NullSink
            .write_event(&FemtoEvent::new(FemtoLevel::Info, "gone"))
            .expect("never fails");
        assert_eq!(written, 0);
    }
}
