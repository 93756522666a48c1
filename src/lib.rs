//! # Pipework
//!
//! Unix-style staged pipelines, in-process.
//!
//! A pipeline is an ordered sequence of stages where each stage's stdout
//! feeds the next stage's stdin. Stages are either external commands or
//! in-process async functions, freely mixed:
//!
//! - **Pipe selection**: kernel pipes next to command stages so child
//!   processes get real descriptors; in-process pipes everywhere else
//! - **Cancellation**: a cancellable [`context::Context`] propagates to
//!   every stage; killed children report the cancellation cause, not the
//!   raw signal exit
//! - **Error reduction**: one canonical error per run, with broken-pipe
//!   noise from early-finishing downstream stages suppressed
//! - **Memory watching**: optional per-stage RSS ceilings and peak
//!   observation, plus cgroup-backed isolation on Linux
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pipework::prelude::*;
//!
//! let ctx = Context::new();
//! let mut pipeline = Pipeline::builder()
//!     .stdin(&b"some input\n"[..])
//!     .build();
//! pipeline.add(CommandStage::new("grep", ["input"]));
//! pipeline.add(CommandStage::new("tr", ["a-z", "A-Z"]));
//! let out = pipeline.output(&ctx).await?;
//! assert_eq!(out, b"SOME INPUT\n");
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod context;
pub mod errors;
pub mod events;
pub mod io;
pub mod isolation;
pub mod pipeline;
#[cfg(target_os = "linux")]
pub mod ptree;
pub mod stage;
pub mod watch;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::errors::{Error, ErrorMatcher, Result};
    pub use crate::events::{
        CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent,
    };
    pub use crate::io::{SharedBuffer, StageInput, StageOutput};
    pub use crate::isolation::IsolationPolicy;
    pub use crate::pipeline::{Env, EnvVar, Pipeline, PipelineBuilder};
    pub use crate::stage::command::CommandStage;
    pub use crate::stage::function::{FunctionStage, StageFuture, StageIo};
    pub use crate::stage::{
        IoPreference, LimitableStage, Stage, StageMonitor, StagePanicHandler, StagePreferences,
    };
    pub use crate::watch::{memory_limit, memory_observer, MEMORY_POLL_INTERVAL};
}
