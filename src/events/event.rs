//! The event type emitted by pipelines and watch adapters.

use crate::errors::Error;
use serde::Serialize;
use std::collections::HashMap;

/// A notable occurrence during a pipeline run.
///
/// Events carry the name of the stage they concern, a fixed message, an
/// optional stringified error, and free-form key/value context. They are
/// observability output; nothing in the pipeline's control flow depends
/// on them.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    /// Name of the stage the event concerns.
    pub command: String,
    /// Fixed human-readable message identifying the event.
    pub msg: String,
    /// Stringified error, when one is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form key/value context.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl PipelineEvent {
    /// Creates an event with no error and no context.
    #[must_use]
    pub fn new(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            msg: msg.into(),
            error: None,
            context: HashMap::new(),
        }
    }

    /// Attaches an error.
    #[must_use]
    pub fn with_error(mut self, err: &Error) -> Self {
        self.error = Some(err.to_string());
        self
    }

    /// Adds one context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// A stage could not be started.
    #[must_use]
    pub fn start_failed(command: &str, err: &Error) -> Self {
        Self::new(command, "failed to start pipeline stage").with_error(err)
    }

    /// The canonical pipeline error, named after its stage.
    #[must_use]
    pub fn command_failed(command: &str, err: &Error) -> Self {
        Self::new(command, "command failed").with_error(err)
    }

    /// A memory watcher observed usage at or above its ceiling.
    #[must_use]
    pub fn memory_exceeded(command: &str, limit: u64, used: u64) -> Self {
        Self::new(command, "stage exceeded allowed memory use")
            .with_context("limit", serde_json::json!(limit))
            .with_context("used", serde_json::json!(used))
    }

    /// A memory observer's end-of-run summary.
    #[must_use]
    pub fn peak_memory(command: &str, peak: u64, samples: u64, errors: u64) -> Self {
        Self::new(command, "peak memory usage")
            .with_context("max_rss_bytes", serde_json::json!(peak))
            .with_context("samples", serde_json::json!(samples))
            .with_context("errors", serde_json::json!(errors))
    }

    /// Sampling memory usage failed twice in a row.
    #[must_use]
    pub fn rss_read_error(command: &str, err: &Error) -> Self {
        Self::new(command, "error reading memory usage").with_error(err)
    }

    /// A memory watcher was applied to a stage that cannot be watched.
    #[must_use]
    pub fn watch_misuse(command: &str) -> Self {
        Self::new(command, "invalid memory watch usage")
    }
}
