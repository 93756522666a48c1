//! Event sink trait and implementations.

use super::PipelineEvent;
use tracing::{debug, info, Level};

/// Receives pipeline events.
///
/// Sinks are called from pipeline teardown paths and watcher tasks, so
/// implementations must not block for long and must not panic.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: PipelineEvent);
}

/// Discards all events. The default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Forwards events through the `tracing` framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// A debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// An info-level sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event: PipelineEvent) {
        match self.level {
            Level::DEBUG => {
                debug!(
                    command = %event.command,
                    error = ?event.error,
                    context = ?event.context,
                    "{}", event.msg
                );
            }
            _ => {
                info!(
                    command = %event.command,
                    error = ?event.error,
                    context = ?event.context,
                    "{}", event.msg
                );
            }
        }
    }
}

/// Collects events in memory, for tests and assertions.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True if nothing has been emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Drops all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Collected events whose message equals `msg`.
    #[must_use]
    pub fn with_msg(&self, msg: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.msg == msg)
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: PipelineEvent) {
        self.events.write().push(event);
    }
}
