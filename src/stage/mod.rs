//! The stage contract and shared stage capabilities.
//!
//! A [`Stage`] is one node of a pipeline: either an external command
//! ([`command::CommandStage`]) or an in-process function
//! ([`function::FunctionStage`]). The pipeline talks to stages only
//! through this trait: it asks for IO preferences, starts each stage
//! with the endpoints it selected, and later waits for termination.
//!
//! Two optional capabilities ride along: a panic handler for stages that
//! run user code on their own task, and an upgrade to
//! [`LimitableStage`] for stages whose running process can be sampled
//! and killed by memory watchers.

pub mod command;
pub mod function;

use crate::context::Context;
use crate::errors::{Error, ErrorMatcher, Result};
use crate::io::{StageInput, StageOutput};
use crate::pipeline::Env;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// How a stage wants one side of its standard IO to be provided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IoPreference {
    /// Any reader or writer is acceptable.
    #[default]
    Any,
    /// A kernel file endpoint avoids a userspace copy. Command stages
    /// prefer this so the descriptor can go straight to the child.
    File,
    /// The channel is unused. Only sensible for the first stage's stdin
    /// or the last stage's stdout.
    Null,
}

/// A stage's preferences for both sides of its standard IO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagePreferences {
    /// Preference for the stdin side.
    pub stdin: IoPreference,
    /// Preference for the stdout side.
    pub stdout: IoPreference,
}

/// Converts a captured panic payload into a stage error.
pub type StagePanicHandler = Arc<dyn Fn(Box<dyn Any + Send>) -> Error + Send + Sync>;

/// One node of a pipeline.
///
/// `start` launches the stage in the background with the endpoints it
/// was given; `wait` blocks until the stage has fully terminated and all
/// of its helper tasks have joined. A stage that returned successfully
/// from `start` must be waited on, or resources are held until drop.
#[async_trait]
pub trait Stage: Send {
    /// The stage's name, used in errors and events.
    fn name(&self) -> &str;

    /// The stage's IO preferences, consulted before pipes are built.
    fn preferences(&self) -> StagePreferences;

    /// Starts the stage in the background.
    ///
    /// # Errors
    ///
    /// Fails when the stage cannot be launched; the endpoints passed in
    /// are released either way.
    async fn start(
        &mut self,
        ctx: Context,
        env: Env,
        stdin: StageInput,
        stdout: StageOutput,
    ) -> Result<()>;

    /// Waits for the stage to terminate, either normally or because the
    /// context passed to `start` was cancelled.
    ///
    /// # Errors
    ///
    /// Returns the stage's own failure, before any pipeline-level
    /// classification.
    async fn wait(&mut self) -> Result<()>;

    /// Installs a handler for panics in stage-owned tasks. Stages that
    /// run no user code ignore it.
    fn set_panic_handler(&mut self, _handler: StagePanicHandler) {}

    /// Upgrades the stage to the limitable capability, or hands it back
    /// unchanged when it has none.
    fn into_limitable(
        self: Box<Self>,
    ) -> std::result::Result<Box<dyn LimitableStage>, Box<dyn Stage>>;
}

/// A stage whose running process can be sampled and killed.
///
/// The capability is exposed as a detached [`StageMonitor`] handle so
/// watcher tasks can keep sampling while the pipeline holds the stage
/// itself exclusively for `wait`.
pub trait LimitableStage: Stage {
    /// A handle for sampling and killing the running stage.
    fn monitor(&self) -> Arc<dyn StageMonitor>;
}

/// Shared view of a running stage used by memory watchers.
pub trait StageMonitor: Send + Sync {
    /// Anonymous resident-set size of the stage's process tree, in
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProcessInfoMissing`] before a child exists, and
    /// I/O errors from the underlying probe.
    fn memory_usage(&self, ctx: &Context) -> Result<u64>;

    /// Terminates the stage, recording `cause` as the error its `wait`
    /// should surface instead of the raw signal exit.
    fn kill(&self, cause: Error);
}

/// Wraps a stage so that `wait` errors matching a predicate are
/// swallowed.
pub struct IgnoreError {
    inner: Box<dyn Stage>,
    matcher: ErrorMatcher,
}

impl IgnoreError {
    /// Wraps `inner`, suppressing errors for which `matcher` is true.
    #[must_use]
    pub fn new(inner: Box<dyn Stage>, matcher: ErrorMatcher) -> Self {
        Self { inner, matcher }
    }
}

#[async_trait]
impl Stage for IgnoreError {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn preferences(&self) -> StagePreferences {
        self.inner.preferences()
    }

    async fn start(
        &mut self,
        ctx: Context,
        env: Env,
        stdin: StageInput,
        stdout: StageOutput,
    ) -> Result<()> {
        self.inner.start(ctx, env, stdin, stdout).await
    }

    async fn wait(&mut self) -> Result<()> {
        match self.inner.wait().await {
            Err(err) if (self.matcher)(&err) => Ok(()),
            other => other,
        }
    }

    fn set_panic_handler(&mut self, handler: StagePanicHandler) {
        self.inner.set_panic_handler(handler);
    }

    fn into_limitable(
        self: Box<Self>,
    ) -> std::result::Result<Box<dyn LimitableStage>, Box<dyn Stage>> {
        Err(self)
    }
}
