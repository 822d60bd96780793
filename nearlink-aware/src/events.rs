//! Human-readable status reporting.
//!
//! Every lifecycle milestone and failure is handed to an [`EventSink`] as a
//! single line of text. Sinks are called synchronously from the coordinator
//! loop and must not block.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

/// Receiver of status messages.
pub trait EventSink: Send + Sync {
    /// Record one message. No acknowledgement, no back-pressure.
    fn on_event(&self, message: &str);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn on_event(&self, message: &str) {
        (**self).on_event(message)
    }
}

/// Forwards messages to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, message: &str) {
        tracing::info!(target: "nearlink::events", "{}", message);
    }
}

/// One entry of a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms_of_day = self.timestamp_ms % 86_400_000;
        let (hours, rest) = (ms_of_day / 3_600_000, ms_of_day % 3_600_000);
        let (minutes, rest) = (rest / 60_000, rest % 60_000);
        write!(
            f,
            "[{:02}:{:02}:{:02}.{:03}] {}",
            hours,
            minutes,
            rest / 1000,
            rest % 1000,
            self.message
        )
    }
}

/// Ordered in-memory log, the backing store of a log view.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in arrival order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Messages without timestamps, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Check if any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.message.contains(needle))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn on_event(&self, message: &str) {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry {
                timestamp_ms,
                message: message.to_string(),
            });
    }
}

/// Hands messages to another task over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, message: &str) {
        // A closed receiver means nobody is watching anymore.
        let _ = self.tx.send(message.to_string());
    }
}

/// Fan-out to several sinks, in insertion order.
#[derive(Default, Clone)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for SinkSet {
    fn on_event(&self, message: &str) {
        for sink in &self.sinks {
            sink.on_event(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.on_event("first");
        sink.on_event("second");
        assert_eq!(sink.messages(), vec!["first", "second"]);
        assert!(sink.contains("sec"));
        assert!(!sink.contains("third"));
    }

    #[test]
    fn test_log_entry_display() {
        let entry = LogEntry {
            timestamp_ms: 3_600_000 + 2 * 60_000 + 3_004,
            message: "Attached".to_string(),
        };
        assert_eq!(entry.to_string(), "[01:02:03.004] Attached");
    }

    #[test]
    fn test_sink_set_fan_out() {
        let memory = Arc::new(MemorySink::new());
        let (channel, mut rx) = ChannelSink::new();
        let set = SinkSet::new()
            .with(memory.clone())
            .with(Arc::new(channel))
            .with(Arc::new(TracingSink));

        set.on_event("hello");
        assert_eq!(memory.messages(), vec!["hello"]);
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }
}
