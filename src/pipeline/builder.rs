//! Builder assembling pipelines from options.

use super::env::{Env, EnvVar};
use super::Pipeline;
use crate::context::Context;
use crate::events::EventSink;
use crate::io::{StageInput, StageOutput};
use crate::stage::StagePanicHandler;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// Builds a [`Pipeline`].
///
/// Options may be given in any order, except that later environment
/// producers observe (and can override) the keys of earlier ones.
#[derive(Default)]
pub struct PipelineBuilder {
    pub(super) env: Env,
    pub(super) stdin: Option<StageInput>,
    pub(super) stdout: Option<StageOutput>,
    pub(super) sink: Option<Arc<dyn EventSink>>,
    pub(super) panic_handler: Option<StagePanicHandler>,
}

impl PipelineBuilder {
    /// Creates a builder with no options set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default working directory for command stages.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.env.set_dir(dir.into());
        self
    }

    /// Feeds `reader` to the first stage. The pipeline never shuts the
    /// reader down; the caller keeps responsibility for the underlying
    /// handle.
    #[must_use]
    pub fn stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(StageInput::NopReader(Box::new(reader)));
        self
    }

    /// Feeds a caller-owned file to the first stage. The descriptor may
    /// be duplicated for a child process; the caller's handle stays
    /// open.
    #[must_use]
    pub fn stdin_file(mut self, file: Arc<File>) -> Self {
        self.stdin = Some(StageInput::SharedFile(file));
        self
    }

    /// Sends the last stage's output to `writer`. The writer is flushed
    /// but never shut down.
    #[must_use]
    pub fn stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(StageOutput::NopWriter(Box::new(writer)));
        self
    }

    /// Sends the last stage's output to `writer` and shuts the writer
    /// down once the stage is done.
    #[must_use]
    pub fn stdout_closer(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(StageOutput::Writer(Box::new(writer)));
        self
    }

    /// Sends the last stage's output to a caller-owned file. The
    /// descriptor may be duplicated for a child process; the caller's
    /// handle stays open.
    #[must_use]
    pub fn stdout_file(mut self, file: Arc<File>) -> Self {
        self.stdout = Some(StageOutput::SharedFile(file));
        self
    }

    /// Adds one environment variable override.
    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let var = EnvVar::new(key, value);
        self.env
            .push_producer(Arc::new(move |_ctx, vars| vars.push(var.clone())));
        self
    }

    /// Adds several environment variable overrides at once.
    #[must_use]
    pub fn env_vars(mut self, new_vars: Vec<EnvVar>) -> Self {
        self.env.push_producer(Arc::new(move |_ctx, vars| {
            vars.extend(new_vars.iter().cloned());
        }));
        self
    }

    /// Adds an override whose value is computed from the context when
    /// the pipeline starts. Producers returning `None` add nothing.
    #[must_use]
    pub fn env_var_with(
        mut self,
        key: impl Into<String>,
        value_fn: impl Fn(&Context) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        let key = key.into();
        self.env.push_producer(Arc::new(move |ctx, vars| {
            if let Some(value) = value_fn(ctx) {
                vars.push(EnvVar::new(key.clone(), value));
            }
        }));
        self
    }

    /// Adds a producer appending arbitrary variables computed from the
    /// context when the pipeline starts.
    #[must_use]
    pub fn env_vars_with(
        mut self,
        values_fn: impl Fn(&Context) -> Vec<EnvVar> + Send + Sync + 'static,
    ) -> Self {
        self.env.push_producer(Arc::new(move |ctx, vars| {
            vars.extend(values_fn(ctx));
        }));
        self
    }

    /// Sets the sink receiving pipeline events.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the handler converting stage panics into errors. The handler
    /// is passed to every stage that accepts one.
    #[must_use]
    pub fn panic_handler(mut self, handler: StagePanicHandler) -> Self {
        self.panic_handler = Some(handler);
        self
    }

    /// Finishes the builder.
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline::from_builder(self)
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("env", &self.env)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .finish()
    }
}
