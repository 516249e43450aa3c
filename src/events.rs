//! Diagnostic event sinks.
//!
//! Components never reach for a global logger. Each one holds an
//! `Arc<dyn EventSink>` handed to it at construction; the default forwards to
//! `tracing`, and tests swap in a [`MemorySink`].

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;

/// Port for leveled diagnostic events.
///
/// Emitting is advisory only. Implementations must not panic and their
/// outcome never affects an admission decision.
pub trait EventSink: Send + Sync {
    /// Record a single event.
    fn emit(&self, level: Level, message: &str, context: &[(&str, String)]);
}

/// Sink that forwards events to the `tracing` macros.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, level: Level, message: &str, context: &[(&str, String)]) {
        let context = render_context(context);
        match level {
            Level::ERROR => tracing::error!(context = %context, "{}", message),
            Level::WARN => tracing::warn!(context = %context, "{}", message),
            Level::INFO => tracing::info!(context = %context, "{}", message),
            Level::DEBUG => tracing::debug!(context = %context, "{}", message),
            Level::TRACE => tracing::trace!(context = %context, "{}", message),
        }
    }
}

fn render_context(context: &[(&str, String)]) -> String {
    let mut out = String::new();
    for (i, (key, value)) in context.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}={}", key, value);
    }
    out
}

/// A recorded event, as captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub level: Level,
    pub message: String,
    pub context: Vec<(String, String)>,
}

impl RecordedEvent {
    /// Look up a context value by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Recorded events at the given level.
    pub fn at_level(&self, level: Level) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, level: Level, message: &str, context: &[(&str, String)]) {
        self.events.lock().push(RecordedEvent {
            level,
            message: message.to_string(),
            context: context
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });
    }
}

/// The sink used when a component is built without one.
pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(Level::INFO, "first", &[]);
        sink.emit(Level::WARN, "second", &[("identifier", "client-a".to_string())]);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].field("identifier"), Some("client-a"));
        assert_eq!(sink.at_level(Level::WARN).len(), 1);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_render_context() {
        let rendered = render_context(&[("a", "1".to_string()), ("b", "two".to_string())]);
        assert_eq!(rendered, "a=1 b=two");
        assert_eq!(render_context(&[]), "");
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.emit(Level::DEBUG, "no subscriber installed", &[("k", "v".to_string())]);
    }
}
