//! Function stages: pipeline stages backed by in-process async code.
//!
//! A function stage runs a user future on its own task and hands it a
//! [`StageIo`] with the stage's endpoints. When the future returns, the
//! stage closes the writer first, so downstream sees end-of-file, and
//! then releases the reader. Panics in the future are captured from the
//! task join and routed through the pipeline's panic handler when one is
//! installed.
//!
//! ```rust,ignore
//! use pipework::prelude::*;
//!
//! let stage = FunctionStage::new("upper", |_ctx, _env, io| {
//!     Box::pin(async move {
//!         let mut data = Vec::new();
//!         if let Some(reader) = io.reader() {
//!             reader.read_to_end(&mut data).await?;
//!         }
//!         data.make_ascii_uppercase();
//!         if let Some(writer) = io.writer() {
//!             writer.write_all(&data).await?;
//!         }
//!         Ok(())
//!     })
//! });
//! ```

use crate::context::Context;
use crate::errors::{Error, Result};
use crate::io::{DynRead, DynWrite, StageInput, StageOutput};
use crate::pipeline::Env;
use crate::stage::{LimitableStage, Stage, StagePanicHandler, StagePreferences};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

/// Future type returned by function-stage bodies.
pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

type StageFn = Box<dyn for<'a> FnOnce(Context, Env, &'a mut StageIo) -> StageFuture<'a> + Send>;

/// The reader/writer pair handed to a function-stage body.
///
/// Either end may be absent: the first stage of a pipeline has no input
/// and the last stage may have no output. The stage itself takes care of
/// closing both ends after the body returns; the body just reads and
/// writes.
pub struct StageIo {
    reader: Option<DynRead>,
    writer: Option<DynWrite>,
    shutdown_writer: bool,
}

impl StageIo {
    /// The stage's input, if connected.
    pub fn reader(&mut self) -> Option<&mut DynRead> {
        self.reader.as_mut()
    }

    /// The stage's output, if connected.
    pub fn writer(&mut self) -> Option<&mut DynWrite> {
        self.writer.as_mut()
    }

    /// Both ends at once, for `tokio::io::copy` style plumbing.
    pub fn split(&mut self) -> (Option<&mut DynRead>, Option<&mut DynWrite>) {
        (self.reader.as_mut(), self.writer.as_mut())
    }

    /// Closes the writer (shutting it down only when the stage owns it),
    /// then releases the reader so upstream sees the pipe collapse.
    async fn finish(&mut self) -> Result<()> {
        let mut close_err = None;
        if let Some(mut writer) = self.writer.take() {
            let closed = if self.shutdown_writer {
                writer.shutdown().await
            } else {
                writer.flush().await
            };
            if let Err(err) = closed {
                close_err = Some(Error::from(err));
            }
        }
        self.reader = None;
        match close_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StageIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageIo")
            .field("reader", &self.reader.is_some())
            .field("writer", &self.writer.is_some())
            .finish()
    }
}

/// A pipeline stage that runs an async function on its own task.
///
/// Function stages accept any reader/writer, so they declare no IO
/// preference and get in-process pipes unless a neighboring command
/// stage asks for kernel pipes.
pub struct FunctionStage {
    name: String,
    func: Option<StageFn>,
    task: Option<JoinHandle<Result<()>>>,
    panic_handler: Option<StagePanicHandler>,
}

impl FunctionStage {
    /// Creates a stage running `func` on its own task.
    ///
    /// The body receives the stage io and should return once its output
    /// is fully written; the stage closes both ends afterwards. The
    /// body may return [`Error::FinishEarly`] to stop reading input
    /// without failing the pipeline.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: for<'a> FnOnce(Context, Env, &'a mut StageIo) -> StageFuture<'a> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Some(Box::new(func)),
            task: None,
            panic_handler: None,
        }
    }
}

#[async_trait]
impl Stage for FunctionStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn preferences(&self) -> StagePreferences {
        StagePreferences::default()
    }

    async fn start(
        &mut self,
        ctx: Context,
        env: Env,
        stdin: StageInput,
        stdout: StageOutput,
    ) -> Result<()> {
        let func = self.func.take().expect("function stage started twice");

        let reader = stdin.into_reader()?;
        let (writer, shutdown_writer) = match stdout.into_writer()? {
            Some((writer, shutdown)) => (Some(writer), shutdown),
            None => (None, false),
        };
        let mut io = StageIo {
            reader,
            writer,
            shutdown_writer,
        };

        self.task = Some(tokio::spawn(async move {
            let result = func(ctx, env, &mut io).await;
            let closed = io.finish().await;
            result.and(closed)
        }));
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        let task = self.task.take().expect("wait called before start");
        match task.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                match &self.panic_handler {
                    Some(handler) => Err(handler(payload)),
                    None => std::panic::resume_unwind(payload),
                }
            }
            Err(_) => Err(Error::other("stage task was aborted")),
        }
    }

    fn set_panic_handler(&mut self, handler: StagePanicHandler) {
        self.panic_handler = Some(handler);
    }

    fn into_limitable(
        self: Box<Self>,
    ) -> std::result::Result<Box<dyn LimitableStage>, Box<dyn Stage>> {
        Err(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{in_process_pipe, SharedBuffer};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_identity_function_stage_copies_bytes() {
        let buffer = SharedBuffer::new();
        let (read, mut write) = in_process_pipe();

        let mut stage = FunctionStage::new("identity", |_ctx, _env, io| {
            Box::pin(async move {
                if let (Some(reader), Some(writer)) = io.split() {
                    tokio::io::copy(reader, writer).await?;
                }
                Ok(())
            })
        });

        stage
            .start(
                Context::new(),
                Env::default(),
                StageInput::Reader(read),
                StageOutput::Writer(Box::new(buffer.clone())),
            )
            .await
            .expect("stage should start");

        write.write_all(b"same bytes").await.expect("write");
        write.shutdown().await.expect("shutdown");
        drop(write);

        stage.wait().await.expect("stage should succeed");
        assert_eq!(buffer.contents(), b"same bytes");
    }

    #[tokio::test]
    async fn test_writer_close_signals_downstream_eof() {
        let (mut read, write) = in_process_pipe();

        let mut stage = FunctionStage::new("producer", |_ctx, _env, io| {
            Box::pin(async move {
                if let Some(writer) = io.writer() {
                    writer.write_all(b"done").await?;
                }
                Ok(())
            })
        });

        stage
            .start(
                Context::new(),
                Env::default(),
                StageInput::Null,
                StageOutput::Writer(write),
            )
            .await
            .expect("stage should start");

        let mut collected = Vec::new();
        read.read_to_end(&mut collected)
            .await
            .expect("reader should reach eof once the stage closes its writer");
        assert_eq!(collected, b"done");

        stage.wait().await.expect("stage should succeed");
    }

    #[tokio::test]
    async fn test_user_error_is_returned_from_wait() {
        let mut stage = FunctionStage::new("broken", |_ctx, _env, _io| {
            Box::pin(async move { Err(Error::other("user failure")) })
        });

        stage
            .start(
                Context::new(),
                Env::default(),
                StageInput::Null,
                StageOutput::Null,
            )
            .await
            .expect("stage should start");

        let err = stage.wait().await.expect_err("stage should fail");
        assert!(matches!(err, Error::Other(msg) if msg == "user failure"));
    }

    #[tokio::test]
    async fn test_panic_is_routed_through_handler() {
        let mut stage = FunctionStage::new("explosive", |_ctx, _env, _io| {
            Box::pin(async move {
                panic!("kaboom");
            })
        });
        stage.set_panic_handler(Arc::new(|payload| {
            let text = payload
                .downcast_ref::<&str>()
                .map_or_else(|| "opaque panic".to_string(), ToString::to_string);
            Error::Panic(text)
        }));

        stage
            .start(
                Context::new(),
                Env::default(),
                StageInput::Null,
                StageOutput::Null,
            )
            .await
            .expect("stage should start");

        let err = stage.wait().await.expect_err("stage should fail");
        assert!(matches!(err, Error::Panic(msg) if msg == "kaboom"));
    }

    #[tokio::test]
    async fn test_finish_early_is_passed_through_verbatim() {
        let mut stage = FunctionStage::new("head", |_ctx, _env, _io| {
            Box::pin(async move { Err(Error::FinishEarly) })
        });

        stage
            .start(
                Context::new(),
                Env::default(),
                StageInput::Null,
                StageOutput::Null,
            )
            .await
            .expect("stage should start");

        let err = stage.wait().await.expect_err("sentinel should surface");
        assert!(err.is_finish_early());
    }
}
