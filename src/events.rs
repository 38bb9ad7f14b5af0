//! Structured event sink. Every component is constructed with an
//! `Arc<dyn EventSink>` and emits [`Event`] records into it instead of
//! calling a logging macro directly, so tests can swap in a sink that
//! captures events for assertions.

use std::sync::Arc;
use std::time::Duration;

/// Severity of a structured event, mirrored from `tracing`'s levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured record describing a completed (or failed) operation.
#[derive(Debug, Clone)]
pub struct Event {
    pub level: Level,
    pub component: &'static str,
    pub operation: &'static str,
    pub duration_ms: u64,
    pub success: bool,
    pub attributes: Vec<(&'static str, String)>,
}

impl Event {
    pub fn new(level: Level, component: &'static str, operation: &'static str) -> Self {
        Self {
            level,
            component,
            operation,
            duration_ms: 0,
            success: true,
            attributes: Vec::new(),
        }
    }

    pub fn with_duration(mut self, d: Duration) -> Self {
        self.duration_ms = d.as_millis() as u64;
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn attr(mut self, key: &'static str, value: impl ToString) -> Self {
        self.attributes.push((key, value.to_string()));
        self
    }
}

/// Sink that structured events are emitted into.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink: forwards every event to the `tracing` crate, preserving
/// the structured fields as tracing key-value pairs.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        let attrs: Vec<String> = event
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let attrs = attrs.join(" ");
        match event.level {
            Level::Trace => tracing::trace!(
                component = event.component,
                operation = event.operation,
                duration_ms = event.duration_ms,
                success = event.success,
                "{attrs}"
            ),
            Level::Debug => tracing::debug!(
                component = event.component,
                operation = event.operation,
                duration_ms = event.duration_ms,
                success = event.success,
                "{attrs}"
            ),
            Level::Info => tracing::info!(
                component = event.component,
                operation = event.operation,
                duration_ms = event.duration_ms,
                success = event.success,
                "{attrs}"
            ),
            Level::Warn => tracing::warn!(
                component = event.component,
                operation = event.operation,
                duration_ms = event.duration_ms,
                success = event.success,
                "{attrs}"
            ),
            Level::Error => tracing::error!(
                component = event.component,
                operation = event.operation,
                duration_ms = event.duration_ms,
                success = event.success,
                "{attrs}"
            ),
        }
    }
}

/// Sink that discards every event; useful for benches and tests that
/// don't want tracing overhead or output.
#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: Event) {}
}

pub fn default_sink() -> Arc<dyn EventSink> {
    Arc::new(TracingEventSink)
}

#[cfg(test)]
pub(crate) struct CollectingEventSink {
    pub events: parking_lot::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl CollectingEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
impl EventSink for CollectingEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}
