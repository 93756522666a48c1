//! Pipelines: ordered stages connected stdout-to-stdin.
//!
//! A pipeline owns its stages and the outer endpoints. `start` launches
//! the stages in order, building the pipe between each adjacent pair
//! from the pair's IO preferences: a kernel pipe when either side wants
//! a real descriptor, an in-process pipe otherwise. `wait` collects the
//! stages' results in reverse order and reduces them to one canonical
//! error.
//!
//! The reverse traversal is what makes error reduction work: a stage
//! that finished early is seen before the upstream stage whose write
//! into it failed, so the resulting broken-pipe error can be recognized
//! as harmless and suppressed.

mod builder;
mod env;

pub use builder::PipelineBuilder;
pub use env::{Env, EnvVar, EnvVarProducer};

use crate::context::Context;
use crate::errors::{Error, ErrorMatcher, Result};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::io::{in_process_pipe, os_pipe, SharedBuffer, StageInput, StageOutput};
use crate::stage::{IgnoreError, IoPreference, Stage, StagePanicHandler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A Unix-style pipeline of commands and in-process functions.
///
/// Stages are added while the pipeline is configured; once `start` has
/// been called the stage list is frozen and `wait` must follow, so that
/// every stage and helper task is reaped.
pub struct Pipeline {
    env: Env,
    stdin: Option<StageInput>,
    stdout: Option<StageOutput>,
    stages: Vec<Box<dyn Stage>>,
    started: AtomicBool,
    cancel: Option<Context>,
    sink: Arc<dyn EventSink>,
    panic_handler: Option<StagePanicHandler>,
}

/// True when the pipe between two adjacent stages must be a kernel
/// pipe: either the producing side or the consuming side wants a real
/// descriptor.
fn use_os_pipe(upstream_stdout: IoPreference, downstream_stdin: IoPreference) -> bool {
    upstream_stdout == IoPreference::File || downstream_stdin == IoPreference::File
}

impl Pipeline {
    /// Starts building a pipeline.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub(crate) fn from_builder(builder: PipelineBuilder) -> Self {
        Self {
            env: builder.env,
            stdin: builder.stdin,
            stdout: builder.stdout,
            stages: Vec::new(),
            started: AtomicBool::new(false),
            cancel: None,
            sink: builder
                .sink
                .unwrap_or_else(|| Arc::new(NoOpEventSink)),
            panic_handler: builder.panic_handler,
        }
    }

    fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Appends a stage.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline has already started.
    pub fn add(&mut self, stage: impl Stage + 'static) {
        self.add_boxed(Box::new(stage));
    }

    /// Appends an already boxed stage, e.g. one wrapped by a memory
    /// watcher.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline has already started.
    pub fn add_boxed(&mut self, mut stage: Box<dyn Stage>) {
        assert!(
            !self.has_started(),
            "attempt to modify a pipeline that has already started"
        );
        if let Some(handler) = &self.panic_handler {
            stage.set_panic_handler(Arc::clone(handler));
        }
        self.stages.push(stage);
    }

    /// Appends a stage whose `wait` errors matching `matcher` are
    /// ignored.
    ///
    /// # Panics
    ///
    /// Panics if the pipeline has already started.
    pub fn add_with_ignored_error(&mut self, matcher: ErrorMatcher, stage: impl Stage + 'static) {
        self.add_boxed(Box::new(IgnoreError::new(Box::new(stage), matcher)));
    }

    /// Starts every stage in order. If this returns successfully,
    /// [`wait`](Pipeline::wait) must also be called so all resources are
    /// released.
    ///
    /// # Errors
    ///
    /// Fails when a pipe cannot be built or a stage does not start; in
    /// that case every stage started so far has been cancelled and
    /// waited for, and no pipe is leaked.
    ///
    /// # Panics
    ///
    /// Panics when called twice, or on an empty pipeline.
    pub async fn start(&mut self, ctx: &Context) -> Result<()> {
        assert!(
            !self.started.swap(true, Ordering::SeqCst),
            "attempt to start a pipeline that has already started"
        );
        assert!(
            !self.stages.is_empty(),
            "attempt to start a pipeline with no stages"
        );

        let ctx = ctx.child();
        self.cancel = Some(ctx.clone());

        let prefs: Vec<_> = self.stages.iter().map(|s| s.preferences()).collect();
        let count = self.stages.len();
        let mut next_stdin = self.stdin.take();

        for index in 0..count {
            let stdin = next_stdin.take().unwrap_or(StageInput::Null);

            // The last stage's output is the pipeline's; every other
            // stage gets the write end of a fresh pipe whose read end is
            // remembered for its successor.
            let stdout = if index + 1 == count {
                self.stdout.take().unwrap_or(StageOutput::Null)
            } else if use_os_pipe(prefs[index].stdout, prefs[index + 1].stdin) {
                match os_pipe() {
                    Ok((read, write)) => {
                        next_stdin = Some(StageInput::File(read));
                        StageOutput::File(write)
                    }
                    Err(err) => {
                        drop(stdin);
                        return self.abort(index, Error::from(err)).await;
                    }
                }
            } else {
                let (read, write) = in_process_pipe();
                next_stdin = Some(StageInput::Reader(read));
                StageOutput::Writer(write)
            };

            if let Err(err) = self.stages[index]
                .start(ctx.clone(), self.env.clone(), stdin, stdout)
                .await
            {
                // The read end destined for the next stage dies here,
                // which is also what collapses the pipe if anything was
                // already connected to it.
                drop(next_stdin.take());
                return self.abort(index, err).await;
            }
        }

        Ok(())
    }

    /// Tears down stages `0..index` after a start failure at `index`.
    async fn abort(&mut self, index: usize, err: Error) -> Result<()> {
        if let Some(cancel) = &self.cancel {
            cancel.cancel("pipeline stage failed to start");
        }
        for stage in &mut self.stages[..index] {
            let _ = stage.wait().await;
        }

        let name = self.stages[index].name().to_string();
        self.sink.emit(PipelineEvent::start_failed(&name, &err));
        Err(Error::StartStage {
            stage: name,
            source: Box::new(err),
        })
    }

    /// Waits for every stage and reduces their results to one canonical
    /// error.
    ///
    /// Traversal is last to first. A stage that finished early is
    /// success and additionally suppresses its predecessor's pipe
    /// error; pipe errors are also dropped once a later stage already
    /// holds the canonical error; any other error wins over errors from
    /// later stages, so the earliest genuine failure is reported.
    ///
    /// # Errors
    ///
    /// Returns at most one error, wrapped with the failing stage's
    /// name.
    ///
    /// # Panics
    ///
    /// Panics when called before `start`.
    pub async fn wait(&mut self) -> Result<()> {
        assert!(
            self.has_started(),
            "unable to wait on a pipeline that has not started"
        );

        let mut canonical: Option<(String, Error)> = None;
        let mut finished_early = false;

        for stage in self.stages.iter_mut().rev() {
            let name = stage.name().to_string();
            match stage.wait().await {
                Ok(()) => {
                    // Earlier stages are unaffected by a later stage
                    // that finished early.
                    finished_early = false;
                }
                Err(Error::FinishEarly) => {
                    finished_early = true;
                }
                Err(err) if err.is_pipe() => {
                    // Keep `finished_early` set: the stage before this
                    // one may have failed the same way for the same
                    // reason.
                    if !finished_early && canonical.is_none() {
                        canonical = Some((name, err));
                    }
                }
                Err(err) => {
                    canonical = Some((name, err));
                    finished_early = false;
                }
            }
        }

        if let Some(cancel) = &self.cancel {
            cancel.cancel("pipeline finished");
        }

        match canonical {
            Some((stage, err)) => {
                self.sink.emit(PipelineEvent::command_failed(&stage, &err));
                Err(Error::Stage {
                    stage,
                    source: Box::new(err),
                })
            }
            None => Ok(()),
        }
    }

    /// Starts the pipeline and waits for it.
    ///
    /// # Errors
    ///
    /// Returns the start failure or the canonical wait error.
    pub async fn run(&mut self, ctx: &Context) -> Result<()> {
        self.start(ctx).await?;
        self.wait().await
    }

    /// Runs the pipeline with an in-memory stdout and returns the
    /// collected bytes.
    ///
    /// # Errors
    ///
    /// Returns the run error; collected output is discarded on failure.
    pub async fn output(&mut self, ctx: &Context) -> Result<Vec<u8>> {
        let buffer = SharedBuffer::new();
        self.stdout = Some(StageOutput::NopWriter(Box::new(buffer.clone())));
        self.run(ctx).await?;
        Ok(buffer.take())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .field("started", &self.has_started())
            .finish()
    }
}
